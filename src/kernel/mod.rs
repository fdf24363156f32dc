pub mod access;
pub mod api;
pub mod fd_cache;
pub mod handlers;
pub mod protocol;
pub mod vfs;

#[cfg(feature = "metrics")]
pub mod metrics;
