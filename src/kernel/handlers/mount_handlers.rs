use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use futures::future::BoxFuture;
use num_derive::{FromPrimitive, ToPrimitive};
use once_cell::sync::Lazy;
use tracing::{debug, error, info, warn};

use crate::kernel::access::normalize;
use crate::kernel::api::mount::*;
use crate::kernel::protocol::context::RPCContext;
use crate::kernel::protocol::pipeline::{Call, Flow, Pipeline, Reply, StageResult};
use crate::kernel::vfs;

/*
From RFC 1813 Appendix I
program MOUNT_PROGRAM {
 version MOUNT_V3 {
    void      MOUNTPROC3_NULL(void)    = 0;
    mountres3 MOUNTPROC3_MNT(dirpath)  = 1;
    mountlist MOUNTPROC3_DUMP(void)    = 2;
    void      MOUNTPROC3_UMNT(dirpath) = 3;
    void      MOUNTPROC3_UMNTALL(void) = 4;
    exports   MOUNTPROC3_EXPORT(void)  = 5;
 } = 3;
} = 100005;
*/

#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum MountProgram {
    MOUNTPROC3_NULL = 0,
    MOUNTPROC3_MNT = 1,
    MOUNTPROC3_DUMP = 2,
    MOUNTPROC3_UMNT = 3,
    MOUNTPROC3_UMNTALL = 4,
    MOUNTPROC3_EXPORT = 5,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MountRequest {
    Null,
    Mnt(dirpath),
    Dump,
    Umnt(dirpath),
    Umntall,
    Export,
}

impl MountRequest {
    pub fn procedure(&self) -> MountProgram {
        match self {
            MountRequest::Null => MountProgram::MOUNTPROC3_NULL,
            MountRequest::Mnt(_) => MountProgram::MOUNTPROC3_MNT,
            MountRequest::Dump => MountProgram::MOUNTPROC3_DUMP,
            MountRequest::Umnt(_) => MountProgram::MOUNTPROC3_UMNT,
            MountRequest::Umntall => MountProgram::MOUNTPROC3_UMNTALL,
            MountRequest::Export => MountProgram::MOUNTPROC3_EXPORT,
        }
    }
}

#[derive(Clone, Debug)]
pub enum MountResponse {
    Null,
    Mnt(Reply<mountres3_ok, mountstat3>),
    Dump(Vec<mountbody>),
    Umnt(Reply<(), mountstat3>),
    Umntall,
    Export(Vec<exportnode>),
}

fn hostname(context: &RPCContext) -> name {
    context.client_addr.ip().to_string().into_bytes()
}

fn ensure_allowed<'a, R: Send>(call: &'a mut Call<dirpath>, _reply: &'a mut R) -> BoxFuture<'a, StageResult<mountstat3>> {
    Box::pin(async move {
        if call.context.client_allowed() {
            Ok(Flow::Next)
        } else {
            warn!("refusing mount request from {}", call.context.client_addr);
            Err(mountstat3::MNT3ERR_ACCES)
        }
    })
}

/// Normalizes the requested directory and checks it against the exports.
fn ensure_exports<'a, R: Send>(call: &'a mut Call<dirpath>, _reply: &'a mut R) -> BoxFuture<'a, StageResult<mountstat3>> {
    Box::pin(async move {
        if call.args.len() > MNTPATHLEN {
            return Err(mountstat3::MNT3ERR_NAMETOOLONG);
        }
        let path = normalize(Path::new(OsStr::from_bytes(&call.args)));
        if !call.context.config.exports.permits(&path) {
            warn!("{} is outside the exports", path.display());
            return Err(mountstat3::MNT3ERR_ACCES);
        }
        call.path = Some(path);
        Ok(Flow::Next)
    })
}

fn mount<'a>(call: &'a mut Call<dirpath>, reply: &'a mut mountres3_ok) -> BoxFuture<'a, StageResult<mountstat3>> {
    Box::pin(async move {
        let path = call.path.as_deref().ok_or(mountstat3::MNT3ERR_SERVERFAULT)?;
        if let Err(e) = vfs::stat(path).await {
            warn!("cannot mount {}: {}", path.display(), e);
            return Err(mountstat3::MNT3ERR_SERVERFAULT);
        }
        let handle = match call.context.fhdb.lookup_or_create(path).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("no handle for export {}: {}", path.display(), e);
                return Err(mountstat3::MNT3ERR_SERVERFAULT);
            }
        };
        reply.fhandle = handle.as_bytes().to_vec();
        reply.auth_flavors = vec![AUTH_NULL, AUTH_UNIX];
        call.context.mounts.insert(mountbody {
            ml_hostname: hostname(&call.context),
            ml_directory: path.as_os_str().as_bytes().to_vec(),
        });
        info!("{} mounted {}", call.context.client_addr, path.display());
        Ok(Flow::Reply)
    })
}

fn unmount<'a>(call: &'a mut Call<dirpath>, _reply: &'a mut ()) -> BoxFuture<'a, StageResult<mountstat3>> {
    Box::pin(async move {
        let path = call.path.as_deref().ok_or(mountstat3::MNT3ERR_SERVERFAULT)?;
        call.context.mounts.remove(&mountbody {
            ml_hostname: hostname(&call.context),
            ml_directory: path.as_os_str().as_bytes().to_vec(),
        });
        Ok(Flow::Reply)
    })
}

static MNT: Lazy<Pipeline<dirpath, mountres3_ok, mountstat3>> = Lazy::new(|| {
    Pipeline::new("mnt")
        .then(ensure_allowed)
        .then(ensure_exports)
        .then(mount)
});

static UMNT: Lazy<Pipeline<dirpath, (), mountstat3>> = Lazy::new(|| {
    Pipeline::new("umnt")
        .then(ensure_allowed)
        .then(ensure_exports)
        .then(unmount)
});

pub async fn mountproc3_mnt(path: dirpath, context: &RPCContext) -> Reply<mountres3_ok, mountstat3> {
    debug!("mountproc3_mnt({:?})", String::from_utf8_lossy(&path));
    MNT.run(&mut Call::new(path, context)).await
}

pub async fn mountproc3_umnt(path: dirpath, context: &RPCContext) -> Reply<(), mountstat3> {
    debug!("mountproc3_umnt({:?})", String::from_utf8_lossy(&path));
    UMNT.run(&mut Call::new(path, context)).await
}

pub fn mountproc3_umnt_all(context: &RPCContext) {
    let host = hostname(context);
    context.mounts.retain(|entry| entry.ml_hostname != host);
}

pub fn mountproc3_dump(context: &RPCContext) -> Vec<mountbody> {
    let mut entries: Vec<mountbody> = context.mounts.iter().map(|entry| entry.key().clone()).collect();
    entries.sort();
    entries
}

/// Configured export roots; an unrestricted server exports `/`.
pub fn mountproc3_export(context: &RPCContext) -> Vec<exportnode> {
    let exports = &context.config.exports;
    if exports.is_empty() {
        return vec![exportnode {
            ex_dir: b"/".to_vec(),
            ex_groups: Vec::new(),
        }];
    }
    exports
        .roots()
        .iter()
        .map(|root| exportnode {
            ex_dir: root.as_os_str().as_bytes().to_vec(),
            ex_groups: Vec::new(),
        })
        .collect()
}

pub async fn handle_mount(request: MountRequest, context: &RPCContext) -> MountResponse {
    debug!("mount {:?} from {}", request.procedure(), context.client_addr);
    match request {
        MountRequest::Null => MountResponse::Null,
        MountRequest::Mnt(path) => MountResponse::Mnt(mountproc3_mnt(path, context).await),
        MountRequest::Dump => MountResponse::Dump(mountproc3_dump(context)),
        MountRequest::Umnt(path) => MountResponse::Umnt(mountproc3_umnt(path, context).await),
        MountRequest::Umntall => {
            mountproc3_umnt_all(context);
            MountResponse::Umntall
        }
        MountRequest::Export => MountResponse::Export(mountproc3_export(context)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backingstore::memory_data_store::MemoryDataStore;
    use crate::fhdb::{FileHandle, HandleStore};
    use crate::kernel::access::HostAccess;
    use crate::kernel::fd_cache::FdCache;
    use crate::kernel::protocol::context::ServerConfig;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn context(export: &Path, hosts: HostAccess) -> RPCContext {
        let mut config = ServerConfig::default().with_exports(vec![export.to_path_buf()]);
        config.hosts = hosts;
        RPCContext::new(
            Arc::new(HandleStore::with_store(Arc::new(MemoryDataStore::new()))),
            Arc::new(FdCache::new(8, Duration::from_secs(60))),
            config,
        )
    }

    fn dirpath_of(path: &Path) -> dirpath {
        path.as_os_str().as_bytes().to_vec()
    }

    #[tokio::test]
    async fn mnt_returns_the_export_handle_and_records_the_client() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = context(dir.path(), HostAccess::default());

        let reply = mountproc3_mnt(dirpath_of(dir.path()), &ctx).await;
        assert_eq!(reply.status, mountstat3::MNT3_OK);
        let handle = FileHandle::from_bytes(&reply.body.fhandle).expect("handle");
        assert_eq!(ctx.fhdb.resolve(&handle).await.expect("resolve"), dir.path());
        assert_eq!(reply.body.auth_flavors, vec![AUTH_NULL, AUTH_UNIX]);

        let listed = mountproc3_dump(&ctx);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].ml_directory, dirpath_of(dir.path()));

        let reply = mountproc3_umnt(dirpath_of(dir.path()), &ctx).await;
        assert!(reply.is_ok());
        assert!(mountproc3_dump(&ctx).is_empty());
    }

    #[tokio::test]
    async fn paths_outside_the_exports_are_refused() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = context(&dir.path().join("share"), HostAccess::default());
        let reply = mountproc3_mnt(dirpath_of(dir.path()), &ctx).await;
        assert_eq!(reply.status, mountstat3::MNT3ERR_ACCES);

        // lexical escapes are normalized before the check
        let sneaky = dir.path().join("share/../other");
        let reply = mountproc3_mnt(dirpath_of(&sneaky), &ctx).await;
        assert_eq!(reply.status, mountstat3::MNT3ERR_ACCES);
    }

    #[tokio::test]
    async fn missing_export_directory_is_a_server_fault() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = context(dir.path(), HostAccess::default());
        let reply = mountproc3_mnt(dirpath_of(&dir.path().join("absent")), &ctx).await;
        assert_eq!(reply.status, mountstat3::MNT3ERR_SERVERFAULT);
    }

    #[tokio::test]
    async fn overlong_paths_are_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = context(dir.path(), HostAccess::default());
        let reply = mountproc3_mnt(vec![b'a'; MNTPATHLEN + 1], &ctx).await;
        assert_eq!(reply.status, mountstat3::MNT3ERR_NAMETOOLONG);
    }

    #[tokio::test]
    async fn denied_hosts_cannot_mount() {
        let dir = TempDir::new().expect("tempdir");
        let client: SocketAddr = "10.1.1.1:700".parse().expect("addr");
        let ctx = context(dir.path(), HostAccess::new(None, vec![client.ip()]));
        let ctx = ctx.for_client(1892, client, None);
        let reply = mountproc3_mnt(dirpath_of(dir.path()), &ctx).await;
        assert_eq!(reply.status, mountstat3::MNT3ERR_ACCES);
    }

    #[tokio::test]
    async fn umntall_drops_only_the_callers_records() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = context(dir.path(), HostAccess::default());
        let other = ctx.for_client(1892, "10.0.0.7:800".parse().expect("addr"), None);
        assert!(mountproc3_mnt(dirpath_of(dir.path()), &ctx).await.is_ok());
        assert!(mountproc3_mnt(dirpath_of(dir.path()), &other).await.is_ok());

        match handle_mount(MountRequest::Umntall, &other).await {
            MountResponse::Umntall => {}
            other => panic!("unexpected {:?}", other),
        }
        let left = mountproc3_dump(&ctx);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].ml_hostname, b"127.0.0.1".to_vec());
    }

    #[tokio::test]
    async fn export_lists_the_roots() {
        let ctx = context(Path::new("/srv/share"), HostAccess::default());
        match handle_mount(MountRequest::Export, &ctx).await {
            MountResponse::Export(nodes) => {
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].ex_dir, PathBuf::from("/srv/share").as_os_str().as_bytes());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
