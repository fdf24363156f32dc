//! NULL, GETATTR, SETATTR and ACCESS.

use filetime::FileTime;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tracing::debug;

use super::common::{ensure_allowed, object_pre_op, resolve_object};
use crate::kernel::api::nfs::*;
use crate::kernel::protocol::context::RPCContext;
use crate::kernel::protocol::pipeline::{Call, Flow, Pipeline, Reply, StageResult};
use crate::kernel::vfs::{self, attrs::to_filetime, nfs_error};
use crate::settings::AccessMode;

fn done<'a, A: Send>(_call: &'a mut Call<A>, _reply: &'a mut ()) -> BoxFuture<'a, StageResult> {
    Box::pin(async move { Ok(Flow::Reply) })
}

static NULL: Lazy<Pipeline<(), ()>> = Lazy::new(|| Pipeline::new("null").then(ensure_allowed).then(done));

pub async fn nfsproc3_null(context: &RPCContext) -> Reply<()> {
    NULL.run(&mut Call::new((), context)).await
}

fn getattr_stat<'a>(call: &'a mut Call<GETATTR3args>, reply: &'a mut GETATTR3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        reply.obj_attributes = vfs::lstat_attrs(call.path()?)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        Ok(Flow::Reply)
    })
}

static GETATTR: Lazy<Pipeline<GETATTR3args, GETATTR3resok>> = Lazy::new(|| {
    Pipeline::new("getattr")
        .then(ensure_allowed)
        .then(resolve_object)
        .then(getattr_stat)
});

pub async fn nfsproc3_getattr(args: GETATTR3args, context: &RPCContext) -> Reply<GETATTR3resok> {
    debug!("nfsproc3_getattr({:?})", args);
    GETATTR.run(&mut Call::new(args, context)).await
}

fn setattr_guard<'a>(call: &'a mut Call<SETATTR3args>, reply: &'a mut SETATTR3res) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        match (call.args.guard, reply.obj_wcc.before) {
            (sattrguard3::obj_ctime(expected), pre_op_attr::attributes(current)) if expected != current.ctime => {
                Err(nfsstat3::NFS3ERR_NOT_SYNC)
            }
            _ => Ok(Flow::Next),
        }
    })
}

fn atime_of(time: &set_atime) -> Option<FileTime> {
    match time {
        set_atime::DONT_CHANGE => None,
        set_atime::SET_TO_SERVER_TIME => Some(FileTime::now()),
        set_atime::SET_TO_CLIENT_TIME(t) => Some(to_filetime(t)),
    }
}

fn mtime_of(time: &set_mtime) -> Option<FileTime> {
    match time {
        set_mtime::DONT_CHANGE => None,
        set_mtime::SET_TO_SERVER_TIME => Some(FileTime::now()),
        set_mtime::SET_TO_CLIENT_TIME(t) => Some(to_filetime(t)),
    }
}

fn setattr_apply<'a>(call: &'a mut Call<SETATTR3args>, _reply: &'a mut SETATTR3res) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let attrs = call.args.new_attributes;
        let path = call.path()?;
        let io = |e: std::io::Error| nfs_error(&e, nfsstat3::NFS3ERR_IO);

        if let set_size3::size(size) = attrs.size {
            vfs::truncate(path, size).await.map_err(io)?;
            if let Some(handle) = &call.handle {
                call.context.fd_cache.delete(handle);
            }
        }
        if let set_mode3::mode(mode) = attrs.mode {
            vfs::chmod(path, mode & 0o7777).await.map_err(io)?;
        }
        let uid = match attrs.uid {
            set_uid3::uid(uid) => Some(uid),
            set_uid3::Void => None,
        };
        let gid = match attrs.gid {
            set_gid3::gid(gid) => Some(gid),
            set_gid3::Void => None,
        };
        if uid.is_some() || gid.is_some() {
            vfs::lchown(path, uid, gid).await.map_err(io)?;
        }
        let atime = atime_of(&attrs.atime);
        let mtime = mtime_of(&attrs.mtime);
        if atime.is_some() || mtime.is_some() {
            vfs::set_times(path, atime, mtime).await.map_err(io)?;
        }
        Ok(Flow::Next)
    })
}

fn setattr_post_op<'a>(call: &'a mut Call<SETATTR3args>, reply: &'a mut SETATTR3res) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        reply.obj_wcc.after = vfs::post_op(vfs::try_attrs(call.path()?).await);
        Ok(Flow::Reply)
    })
}

static SETATTR: Lazy<Pipeline<SETATTR3args, SETATTR3res>> = Lazy::new(|| {
    Pipeline::new("setattr")
        .then(ensure_allowed)
        .then(resolve_object)
        .then(object_pre_op)
        .then(setattr_guard)
        .then(setattr_apply)
        .then(setattr_post_op)
});

pub async fn nfsproc3_setattr(args: SETATTR3args, context: &RPCContext) -> Reply<SETATTR3res> {
    debug!("nfsproc3_setattr({:?})", args);
    SETATTR.run(&mut Call::new(args, context)).await
}

/// Access bits the mode of `attr` grants to `uid`, limited to `requested`.
pub fn granted_by_mode(attr: &fattr3, uid: u32, requested: u32) -> u32 {
    if uid == 0 {
        return requested;
    }
    let bits = if attr.uid == uid {
        (attr.mode >> 6) & 0o7
    } else {
        attr.mode & 0o7
    };
    let is_dir = attr.ftype == ftype3::NF3DIR;
    let mut granted = 0;
    if bits & 0o4 != 0 {
        granted |= ACCESS3_READ;
    }
    if bits & 0o2 != 0 {
        granted |= ACCESS3_MODIFY | ACCESS3_EXTEND;
        if is_dir {
            granted |= ACCESS3_DELETE;
        }
    }
    if bits & 0o1 != 0 {
        granted |= if is_dir { ACCESS3_LOOKUP } else { ACCESS3_EXECUTE };
    }
    granted & requested
}

fn access_check<'a>(call: &'a mut Call<ACCESS3args>, reply: &'a mut ACCESS3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let attr = vfs::lstat_attrs(call.path()?)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        reply.obj_attributes = post_op_attr::attributes(attr);

        let requested = call.args.access;
        reply.access = match call.context.config.access {
            AccessMode::Permissive => requested,
            AccessMode::ModeBits => {
                let (uid, _) = call.context.credentials();
                granted_by_mode(&attr, uid, requested)
            }
        };
        if requested != 0 && reply.access == 0 {
            return Err(nfsstat3::NFS3ERR_ACCES);
        }
        Ok(Flow::Reply)
    })
}

static ACCESS: Lazy<Pipeline<ACCESS3args, ACCESS3resok>> = Lazy::new(|| {
    Pipeline::new("access")
        .then(ensure_allowed)
        .then(resolve_object)
        .then(access_check)
});

pub async fn nfsproc3_access(args: ACCESS3args, context: &RPCContext) -> Reply<ACCESS3resok> {
    debug!("nfsproc3_access({:?})", args);
    ACCESS.run(&mut Call::new(args, context)).await
}
