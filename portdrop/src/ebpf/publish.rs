//! Writes the blocked port into the single-slot table the filter reads on
//! every packet.

use portdrop_common::{PORT_MAP_KEY, PortValue};
use tracing::info;

use crate::{
    ebpf::collection::FilterCollection,
    error::{PortDropError, Result},
};

/// Stores `port` at the fixed key. The filter picks it up on the next packet;
/// no reload or reattach is involved.
pub fn write_port(collection: &mut FilterCollection, port: PortValue) -> Result<()> {
    let table = collection.names().table.clone();
    let mut array = collection.port_table()?;
    array
        .set(PORT_MAP_KEY, port, 0)
        .map_err(|e| PortDropError::table_write_failed(&table, e))?;

    info!(
        event.name = "ebpf.port_published",
        ebpf.table.name = %table,
        network.port = port,
        "published blocked port"
    );
    Ok(())
}

/// Reads back the value at the fixed key.
pub fn read_port(collection: &mut FilterCollection) -> Result<PortValue> {
    let table = collection.names().table.clone();
    let array = collection.port_table()?;
    array
        .get(&PORT_MAP_KEY, 0)
        .map_err(|e| PortDropError::table_write_failed(&table, e))
}
