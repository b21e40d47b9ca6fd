//! Collection materializer: instantiates a [`ProgramSpec`] as live kernel
//! objects and resolves the program and table the control plane needs.

use aya::{
    Ebpf, EbpfLoader,
    maps::{Array, MapData},
    programs::Xdp,
};
use portdrop_common::{PORT_MAP_KEY, PORT_MAP_MAX_ENTRIES, PortValue};
use tracing::{debug, info, warn};

use crate::{
    ebpf::artifact::ProgramSpec,
    error::{PortDropError, Result},
};

/// Program and table names looked up right after materialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionNames {
    pub program: String,
    pub table: String,
}

/// Live kernel objects created from a [`ProgramSpec`].
///
/// Owns the loaded [`Ebpf`]; maps and the program are closed when it is
/// released. Holds exclusive ownership, it is never shared across threads.
pub struct FilterCollection {
    ebpf: Ebpf,
    names: CollectionNames,
}

impl FilterCollection {
    /// Creates the maps, verifies the names and loads the XDP program.
    pub fn materialize(spec: &ProgramSpec, names: &CollectionNames) -> Result<Self> {
        verify_names(spec, names)?;

        let ebpf = EbpfLoader::new()
            .load(spec.bytes())
            .map_err(|e| PortDropError::MaterializationFailed(e.to_string()))?;

        let mut collection = Self {
            ebpf,
            names: names.clone(),
        };

        if collection.ebpf.map(&names.table).is_none() {
            return Err(PortDropError::TableNotFound(names.table.clone()));
        }

        let program = collection.xdp_mut()?;
        program.load().map_err(|e| {
            PortDropError::MaterializationFailed(format!(
                "kernel rejected program '{}': {e}",
                names.program
            ))
        })?;

        info!(
            event.name = "ebpf.collection_materialized",
            ebpf.artifact.origin = %spec.origin(),
            ebpf.program.name = %names.program,
            ebpf.table.name = %names.table,
            "materialized filter collection"
        );
        Ok(collection)
    }

    pub fn names(&self) -> &CollectionNames {
        &self.names
    }

    /// The XDP program this collection was materialized for.
    pub fn xdp_mut(&mut self) -> Result<&mut Xdp> {
        let name = &self.names.program;
        self.ebpf
            .program_mut(name)
            .ok_or_else(|| PortDropError::ProgramNotFound(name.clone()))?
            .try_into()
            .map_err(|e| {
                PortDropError::MaterializationFailed(format!(
                    "program '{name}' is not an XDP program: {e}"
                ))
            })
    }

    /// Typed view of the port table. Fails if the declared key or value
    /// width does not match `u32 -> u16`, or the table has no slot 0.
    pub fn port_table(&mut self) -> Result<Array<&mut MapData, PortValue>> {
        let name = &self.names.table;
        let map = self
            .ebpf
            .map_mut(name)
            .ok_or_else(|| PortDropError::TableNotFound(name.clone()))?;
        let array: Array<&mut MapData, PortValue> =
            Array::try_from(map).map_err(|e| PortDropError::table_write_failed(name.clone(), e))?;
        if array.len() < PORT_MAP_MAX_ENTRIES {
            return Err(PortDropError::table_write_failed(
                name.clone(),
                format!(
                    "table holds {} entries, key {PORT_MAP_KEY} needs at least {PORT_MAP_MAX_ENTRIES}",
                    array.len()
                ),
            ));
        }
        Ok(array)
    }

    /// Closes every program and map held by the collection.
    pub fn release(self) {
        let Self { ebpf, names } = self;
        drop(ebpf);
        debug!(
            event.name = "ebpf.collection_released",
            ebpf.program.name = %names.program,
            ebpf.table.name = %names.table,
            "released filter collection"
        );
    }
}

/// Checks the object declares the configured table and program before any
/// kernel object is created.
pub fn verify_names(spec: &ProgramSpec, names: &CollectionNames) -> Result<()> {
    let missing = if !spec.has_table(&names.table) {
        PortDropError::TableNotFound(names.table.clone())
    } else if !spec.has_program(&names.program) {
        PortDropError::ProgramNotFound(names.program.clone())
    } else {
        return Ok(());
    };

    warn!(
        event.name = "ebpf.collection_name_missing",
        ebpf.artifact.origin = %spec.origin(),
        ebpf.programs = ?spec.programs().collect::<Vec<_>>(),
        ebpf.tables = ?spec.tables().collect::<Vec<_>>(),
        "{missing}"
    );
    Err(missing)
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::*;

    fn spec(programs: &[&str], tables: &[&str]) -> ProgramSpec {
        ProgramSpec::from_parts(
            "test.o",
            Cow::Borrowed(&[]),
            programs.iter().map(|p| p.to_string()),
            tables.iter().map(|t| t.to_string()),
        )
    }

    fn names() -> CollectionNames {
        CollectionNames {
            program: "drop_tcp_port".to_string(),
            table: "port_map".to_string(),
        }
    }

    #[test]
    fn names_present_in_object_pass() {
        let spec = spec(&["drop_tcp_port", "other"], &["port_map"]);
        assert!(verify_names(&spec, &names()).is_ok());
    }

    #[test]
    fn missing_program_fails_before_loading() {
        let spec = spec(&["xdp_pass"], &["port_map"]);
        let err = FilterCollection::materialize(&spec, &names())
            .err()
            .expect("program is missing");
        assert!(
            matches!(&err, PortDropError::ProgramNotFound(name) if name == "drop_tcp_port"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn missing_table_is_reported_first() {
        let spec = spec(&[], &["ports"]);
        let err = FilterCollection::materialize(&spec, &names())
            .err()
            .expect("table is missing");
        assert!(
            matches!(&err, PortDropError::TableNotFound(name) if name == "port_map"),
            "unexpected error: {err}"
        );
    }
}
