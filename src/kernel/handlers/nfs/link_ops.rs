//! LINK, SYMLINK and READLINK.

use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tracing::debug;

use super::common::{dir_pre_op, ensure_allowed, register_created, resolve_child, resolve_dirop, resolve_object};
use crate::kernel::api::nfs::*;
use crate::kernel::protocol::context::RPCContext;
use crate::kernel::protocol::pipeline::{Call, Flow, Pipeline, Reply, StageResult};
use crate::kernel::vfs::{self, nfs_error};
use crate::settings::SymlinkSupport;

fn link_target_dir<'a>(call: &'a mut Call<LINK3args>, reply: &'a mut LINK3res) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let (dir, path) = resolve_child(&call.context, &call.args.link).await?;
        let attr = vfs::lstat_attrs(&dir)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        if attr.ftype != ftype3::NF3DIR {
            return Err(nfsstat3::NFS3ERR_NOTDIR);
        }
        reply.linkdir_wcc.before = vfs::pre_op(Some(&attr));
        call.to_dir_path = Some(dir);
        call.to_path = Some(path);
        Ok(Flow::Next)
    })
}

fn link_create<'a>(call: &'a mut Call<LINK3args>, reply: &'a mut LINK3res) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let source = call.path()?;
        let meta = vfs::lstat(source)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        if meta.is_dir() {
            return Err(nfsstat3::NFS3ERR_NOTSUPP);
        }
        tokio::fs::hard_link(source, call.to_path()?)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        reply.file_attributes = vfs::post_op(vfs::try_attrs(source).await);
        reply.linkdir_wcc.after = vfs::post_op(vfs::try_attrs(call.to_dir_path()?).await);
        Ok(Flow::Reply)
    })
}

static LINK: Lazy<Pipeline<LINK3args, LINK3res>> = Lazy::new(|| {
    Pipeline::new("link")
        .then(ensure_allowed)
        .then(resolve_object)
        .then(link_target_dir)
        .then(link_create)
});

pub async fn nfsproc3_link(args: LINK3args, context: &RPCContext) -> Reply<LINK3res> {
    debug!("nfsproc3_link({:?})", args);
    LINK.run(&mut Call::new(args, context)).await
}

fn symlinks_enabled<'a>(call: &'a mut Call<SYMLINK3args>, _reply: &'a mut CREATE3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        match call.context.config.symlinks {
            SymlinkSupport::Supported => Ok(Flow::Next),
            SymlinkSupport::Unsupported => Err(nfsstat3::NFS3ERR_NOTSUPP),
        }
    })
}

fn symlink_create<'a>(call: &'a mut Call<SYMLINK3args>, _reply: &'a mut CREATE3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let data = &call.args.symlink.symlink_data;
        if data.is_empty() || data.contains(&0) {
            return Err(nfsstat3::NFS3ERR_INVAL);
        }
        let target = PathBuf::from(OsString::from_vec(data.clone()));
        let path = call.path()?;
        let (uid, gid) = call.context.credentials();
        let ownership = vfs::make_symlink(target, path, uid, gid)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        ownership.log_failures(path);
        Ok(Flow::Next)
    })
}

static SYMLINK: Lazy<Pipeline<SYMLINK3args, CREATE3resok>> = Lazy::new(|| {
    Pipeline::new("symlink")
        .then(ensure_allowed)
        .then(symlinks_enabled)
        .then(resolve_dirop)
        .then(dir_pre_op)
        .then(symlink_create)
        .then(register_created)
});

pub async fn nfsproc3_symlink(args: SYMLINK3args, context: &RPCContext) -> Reply<CREATE3resok> {
    debug!("nfsproc3_symlink({:?})", args);
    SYMLINK.run(&mut Call::new(args, context)).await
}

fn readlink_target<'a>(call: &'a mut Call<READLINK3args>, reply: &'a mut READLINK3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let path = call.path()?;
        let meta = vfs::lstat(path)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        reply.symlink_attributes = post_op_attr::attributes(vfs::fattr_from_metadata(&meta));
        if !meta.file_type().is_symlink() {
            return Err(nfsstat3::NFS3ERR_INVAL);
        }
        let target = tokio::fs::read_link(path)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        reply.data = target.as_os_str().as_bytes().to_vec();
        Ok(Flow::Reply)
    })
}

static READLINK: Lazy<Pipeline<READLINK3args, READLINK3resok>> = Lazy::new(|| {
    Pipeline::new("readlink")
        .then(ensure_allowed)
        .then(resolve_object)
        .then(readlink_target)
});

pub async fn nfsproc3_readlink(args: READLINK3args, context: &RPCContext) -> Reply<READLINK3resok> {
    debug!("nfsproc3_readlink({:?})", args);
    READLINK.run(&mut Call::new(args, context)).await
}
