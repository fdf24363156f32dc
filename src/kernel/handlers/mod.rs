pub mod mount_handlers;
pub mod nfs;
pub mod portmap_handlers;

pub use mount_handlers::{handle_mount, MountRequest, MountResponse};
pub use nfs::{handle_nfs, NfsRequest, NfsResponse};
pub use portmap_handlers::{handle_portmap, PortmapRequest, PortmapResponse, PortmapService};

#[cfg(test)]
mod nfs_handlers_test;
