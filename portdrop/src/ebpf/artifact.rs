//! Artifact loader: turns the prebuilt filter object into a [`ProgramSpec`].
//!
//! The object is never inspected beyond what the ELF parser needs to list its
//! program and map names. Whether the kernel accepts it is decided later when
//! the collection is materialized.

use std::{
    borrow::Cow,
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
};

use portdrop_common::DEFAULT_OBJECT_FILE;
use tracing::{debug, info};

use crate::error::{PortDropError, Result};

/// Where the filter object comes from.
#[derive(Debug, Clone)]
pub enum ArtifactSource {
    /// Object bundled into the binary at build time.
    Embedded(&'static [u8]),
    /// Object read from disk at startup.
    File(PathBuf),
}

impl ArtifactSource {
    /// Picks the configured path, then the embedded object, then the default file name.
    pub fn resolve(configured: Option<&Path>) -> Self {
        match (configured, embedded_object()) {
            (Some(path), _) => ArtifactSource::File(path.to_path_buf()),
            (None, Some(bytes)) => ArtifactSource::Embedded(bytes),
            (None, None) => ArtifactSource::File(PathBuf::from(DEFAULT_OBJECT_FILE)),
        }
    }
}

impl fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactSource::Embedded(_) => write!(f, "<embedded>"),
            ArtifactSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Object bundled by `build.rs` when `PORTDROP_EBPF_OBJECT` was set.
#[cfg(embedded_object)]
pub fn embedded_object() -> Option<&'static [u8]> {
    Some(aya::include_bytes_aligned!(env!("PORTDROP_EMBEDDED_OBJECT")))
}

#[cfg(not(embedded_object))]
pub fn embedded_object() -> Option<&'static [u8]> {
    None
}

/// Parsed, read-only view of a filter object: its raw bytes plus the names of
/// the programs and tables it declares.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    origin: String,
    bytes: Cow<'static, [u8]>,
    programs: BTreeSet<String>,
    tables: BTreeSet<String>,
}

impl ProgramSpec {
    /// Reads and parses the object from `source`.
    pub fn load(source: &ArtifactSource) -> Result<Self> {
        let origin = source.to_string();
        let bytes: Cow<'static, [u8]> = match source {
            ArtifactSource::Embedded(bytes) => Cow::Borrowed(*bytes),
            ArtifactSource::File(path) => Cow::Owned(
                std::fs::read(path)
                    .map_err(|e| PortDropError::artifact_unreadable(origin.clone(), e))?,
            ),
        };

        let spec = Self::parse(origin, bytes)?;
        info!(
            event.name = "ebpf.artifact_loaded",
            ebpf.artifact.origin = %spec.origin,
            ebpf.artifact.size = spec.bytes.len(),
            ebpf.programs = ?spec.programs,
            ebpf.tables = ?spec.tables,
            "loaded filter artifact"
        );
        Ok(spec)
    }

    /// Parses already-read bytes.
    pub fn parse(origin: impl Into<String>, bytes: Cow<'static, [u8]>) -> Result<Self> {
        let origin = origin.into();
        if bytes.is_empty() {
            return Err(PortDropError::artifact_malformed(origin, "object is empty"));
        }

        let object = aya_obj::Object::parse(&bytes)
            .map_err(|e| PortDropError::artifact_malformed(origin.clone(), e))?;

        let programs: BTreeSet<String> = object.programs.keys().cloned().collect();
        let tables: BTreeSet<String> = object.maps.keys().cloned().collect();
        debug!(
            event.name = "ebpf.artifact_parsed",
            ebpf.artifact.origin = %origin,
            program_count = programs.len(),
            table_count = tables.len(),
            "parsed filter artifact"
        );

        Ok(Self::from_parts(origin, bytes, programs, tables))
    }

    /// Builds a spec from its parts without parsing. Backends that do not
    /// talk to a kernel use this to describe the objects they pretend to hold.
    pub fn from_parts(
        origin: impl Into<String>,
        bytes: Cow<'static, [u8]>,
        programs: impl IntoIterator<Item = String>,
        tables: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            origin: origin.into(),
            bytes,
            programs: programs.into_iter().collect(),
            tables: tables.into_iter().collect(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn has_program(&self, name: &str) -> bool {
        self.programs.contains(name)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains(name)
    }

    pub fn programs(&self) -> impl Iterator<Item = &str> {
        self.programs.iter().map(String::as_str)
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use std::{borrow::Cow, path::PathBuf};

    use figment::Jail;

    use super::*;

    #[test]
    fn missing_file_is_unreadable() {
        Jail::expect_with(|_| {
            let source = ArtifactSource::File(PathBuf::from("does_not_exist.o"));
            let err = ProgramSpec::load(&source).expect_err("missing file must fail");
            assert!(
                matches!(err, PortDropError::ArtifactUnreadable { .. }),
                "unexpected error: {err}"
            );
            assert!(err.to_string().contains("does_not_exist.o"));

            Ok(())
        });
    }

    #[test]
    fn garbage_file_is_malformed() {
        Jail::expect_with(|jail| {
            jail.create_file("garbage.o", "this is not an ELF object")?;

            let source = ArtifactSource::File(PathBuf::from("garbage.o"));
            let err = ProgramSpec::load(&source).expect_err("garbage must fail");
            assert!(
                matches!(err, PortDropError::ArtifactMalformed { .. }),
                "unexpected error: {err}"
            );

            Ok(())
        });
    }

    #[test]
    fn empty_object_is_malformed() {
        let err = ProgramSpec::parse("empty", Cow::Borrowed(&[])).expect_err("empty must fail");
        assert!(matches!(err, PortDropError::ArtifactMalformed { .. }));
    }

    #[test]
    fn from_parts_indexes_names() {
        let spec = ProgramSpec::from_parts(
            "fake",
            Cow::Borrowed(&[]),
            ["drop_tcp_port".to_string()],
            ["port_map".to_string()],
        );
        assert!(spec.has_program("drop_tcp_port"));
        assert!(!spec.has_program("port_map"));
        assert!(spec.has_table("port_map"));
        assert_eq!(spec.origin(), "fake");
        assert_eq!(spec.programs().collect::<Vec<_>>(), vec!["drop_tcp_port"]);
    }

    #[test]
    fn configured_path_wins_over_default() {
        let source = ArtifactSource::resolve(Some(Path::new("/opt/filter.o")));
        assert_eq!(source.to_string(), "/opt/filter.o");
    }

    #[cfg(not(embedded_object))]
    #[test]
    fn falls_back_to_default_object_file() {
        let source = ArtifactSource::resolve(None);
        assert_eq!(source.to_string(), DEFAULT_OBJECT_FILE);
    }
}
