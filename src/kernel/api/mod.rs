pub mod mount;
pub mod nfs;
pub mod portmap;
