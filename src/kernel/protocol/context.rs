use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashSet;

use crate::fhdb::HandleStore;
use crate::kernel::access::{Exports, HostAccess};
use crate::kernel::api::mount::mountbody;
use crate::kernel::api::nfs::writeverf3;
use crate::kernel::fd_cache::FdCache;
use crate::kernel::protocol::rpc::auth_unix;
use crate::settings::{AccessMode, Settings, SymlinkSupport};

/// Server-wide knobs derived from [`Settings`] once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub exports: Exports,
    pub hosts: HostAccess,
    pub anon_uid: u32,
    pub anon_gid: u32,
    pub symlinks: SymlinkSupport,
    pub access: AccessMode,
    /// Changes on every start so clients notice lost unstable writes.
    pub write_verifier: writeverf3,
}

impl ServerConfig {
    pub fn from_settings(settings: &Settings) -> ServerConfig {
        ServerConfig {
            exports: Exports::new(settings.mount.exports.iter().cloned()),
            hosts: HostAccess::new(
                settings.mount.hosts_allow.clone(),
                settings.mount.hosts_deny.clone(),
            ),
            anon_uid: settings.nfs.uid,
            anon_gid: settings.nfs.gid,
            symlinks: settings.nfs.symlinks,
            access: settings.nfs.access,
            write_verifier: rand::random(),
        }
    }

    pub fn with_exports(mut self, roots: impl IntoIterator<Item = PathBuf>) -> ServerConfig {
        self.exports = Exports::new(roots);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::from_settings(&Settings::default())
    }
}

/// Everything a procedure needs: the shared services plus who is calling.
#[derive(Clone)]
pub struct RPCContext {
    pub local_port: u16,
    pub client_addr: SocketAddr,
    /// `None` for AUTH_NULL callers, who act as the anonymous user.
    pub auth: Option<auth_unix>,
    pub fhdb: Arc<HandleStore>,
    pub fd_cache: Arc<FdCache>,
    pub config: Arc<ServerConfig>,
    pub mounts: Arc<DashSet<mountbody>>,
}

impl fmt::Debug for RPCContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RPCContext")
            .field("local_port", &self.local_port)
            .field("client_addr", &self.client_addr)
            .field("auth", &self.auth)
            .finish()
    }
}

impl RPCContext {
    pub fn new(fhdb: Arc<HandleStore>, fd_cache: Arc<FdCache>, config: ServerConfig) -> RPCContext {
        RPCContext {
            local_port: 0,
            client_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            auth: None,
            fhdb,
            fd_cache,
            config: Arc::new(config),
            mounts: Arc::new(DashSet::new()),
        }
    }

    /// Per-connection copy sharing every service with `self`.
    pub fn for_client(&self, local_port: u16, client_addr: SocketAddr, auth: Option<auth_unix>) -> RPCContext {
        RPCContext {
            local_port,
            client_addr,
            auth,
            ..self.clone()
        }
    }

    /// Caller uid and gid, falling back to the anonymous identity.
    pub fn credentials(&self) -> (u32, u32) {
        match &self.auth {
            Some(auth) => (auth.uid, auth.gid),
            None => (self.config.anon_uid, self.config.anon_gid),
        }
    }

    pub fn client_allowed(&self) -> bool {
        self.config.hosts.is_allowed(self.client_addr.ip())
    }
}
