#![cfg_attr(feature = "strict", deny(warnings))]

//! Core of an NFSv3 server that exports the host filesystem through opaque,
//! persistent file handles.
//!
//! Callers decode RPC calls into [`kernel::handlers::nfs::NfsRequest`] (or the
//! mount and port-mapper equivalents) and hand them to the matching
//! `handle_*` function together with an [`kernel::protocol::context::RPCContext`].

pub mod backingstore;
pub mod fhdb;
pub mod kernel;
pub mod logging;
pub mod settings;
