//! Control plane for an XDP filter that drops inbound TCP traffic to one
//! destination port.
//!
//! Startup loads the filter object, materializes it, attaches it to an
//! interface and writes the port into the shared table. The
//! [`lifecycle::Lifecycle`] then waits for a shutdown and undoes all of it in
//! reverse order.

pub mod ebpf;
pub mod error;
pub mod lifecycle;
pub mod runtime;
