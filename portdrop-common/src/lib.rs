#![no_std]

//! Names and layouts agreed between the user-space control plane and the
//! prebuilt XDP object it loads.
//!
//! The kernel program reads a single `BPF_MAP_TYPE_ARRAY` entry on every
//! packet. Both sides must agree on the map name, the key and the byte width
//! of the value, otherwise the lookup silently misses.

/// Name of the XDP entry point inside the compiled object.
pub const PROGRAM_NAME: &str = "drop_tcp_port";

/// Name of the array map holding the port to drop.
pub const PORT_MAP_NAME: &str = "port_map";

/// The only index of the port map. The kernel program always looks up key 0.
pub const PORT_MAP_KEY: u32 = 0;

/// Number of entries declared for the port map.
pub const PORT_MAP_MAX_ENTRIES: u32 = 1;

/// Port dropped when the operator does not choose one.
pub const DEFAULT_PORT: u16 = 4040;

/// Object file looked up in the working directory when no path is configured.
pub const DEFAULT_OBJECT_FILE: &str = "drop_tcp_port.o";

/// Map value type. The kernel compares it against `tcphdr.dest` after
/// converting to network byte order, so user space stores host order.
pub type PortValue = u16;

const _: () = assert!(core::mem::size_of::<PortValue>() == 2);
