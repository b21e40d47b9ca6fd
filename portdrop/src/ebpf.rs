pub mod artifact;
pub mod attach;
pub mod backend;
pub mod collection;
pub mod marker;
pub mod memlock;
pub mod netlink;
pub mod publish;

pub use backend::{AyaBackend, Backend};
