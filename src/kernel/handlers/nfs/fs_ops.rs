//! FSSTAT, FSINFO, PATHCONF and MKNOD.

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tracing::debug;

use super::common::{dir_pre_op, ensure_allowed, resolve_dirop, resolve_object, MAX_NAME_LEN};
use crate::kernel::api::nfs::*;
use crate::kernel::protocol::context::RPCContext;
use crate::kernel::protocol::pipeline::{Call, Flow, Pipeline, Reply, StageResult};
use crate::kernel::vfs::{self, nfs_error};

const MAX_TRANSFER: u32 = 65536;
const PREF_TRANSFER: u32 = 32768;
const TRANSFER_MULTIPLE: u32 = 4096;
const PREF_READDIR: u32 = 8192;
const MAX_FILE_SIZE: u64 = 1 << 40;

fn fsstat_usage<'a>(call: &'a mut Call<FSSTAT3args>, reply: &'a mut FSSTAT3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let path = call.path()?;
        reply.obj_attributes = vfs::post_op(vfs::try_attrs(path).await);
        let usage = vfs::statvfs(path)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        reply.tbytes = usage.total_bytes;
        reply.fbytes = usage.free_bytes;
        reply.abytes = usage.avail_bytes;
        reply.tfiles = usage.total_files;
        reply.ffiles = usage.free_files;
        reply.afiles = usage.avail_files;
        reply.invarsec = 0;
        Ok(Flow::Reply)
    })
}

static FSSTAT: Lazy<Pipeline<FSSTAT3args, FSSTAT3resok>> = Lazy::new(|| {
    Pipeline::new("fsstat")
        .then(ensure_allowed)
        .then(resolve_object)
        .then(fsstat_usage)
});

pub async fn nfsproc3_fsstat(args: FSSTAT3args, context: &RPCContext) -> Reply<FSSTAT3resok> {
    debug!("nfsproc3_fsstat({:?})", args);
    FSSTAT.run(&mut Call::new(args, context)).await
}

fn fsinfo_limits<'a>(call: &'a mut Call<FSINFO3args>, reply: &'a mut FSINFO3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        *reply = FSINFO3resok {
            obj_attributes: vfs::post_op(vfs::try_attrs(call.path()?).await),
            rtmax: MAX_TRANSFER,
            rtpref: PREF_TRANSFER,
            rtmult: TRANSFER_MULTIPLE,
            wtmax: MAX_TRANSFER,
            wtpref: PREF_TRANSFER,
            wtmult: TRANSFER_MULTIPLE,
            dtpref: PREF_READDIR,
            maxfilesize: MAX_FILE_SIZE,
            time_delta: nfstime3 {
                seconds: 0,
                nseconds: 1_000_000,
            },
            properties: FSF_LINK | FSF_SYMLINK | FSF_HOMOGENEOUS | FSF_CANSETTIME,
        };
        Ok(Flow::Reply)
    })
}

static FSINFO: Lazy<Pipeline<FSINFO3args, FSINFO3resok>> = Lazy::new(|| {
    Pipeline::new("fsinfo")
        .then(ensure_allowed)
        .then(resolve_object)
        .then(fsinfo_limits)
});

pub async fn nfsproc3_fsinfo(args: FSINFO3args, context: &RPCContext) -> Reply<FSINFO3resok> {
    debug!("nfsproc3_fsinfo({:?})", args);
    FSINFO.run(&mut Call::new(args, context)).await
}

fn pathconf_limits<'a>(call: &'a mut Call<PATHCONF3args>, reply: &'a mut PATHCONF3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        *reply = PATHCONF3resok {
            obj_attributes: vfs::post_op(vfs::try_attrs(call.path()?).await),
            linkmax: 0,
            name_max: MAX_NAME_LEN as u32,
            no_trunc: true,
            chown_restricted: true,
            case_insensitive: false,
            case_preserving: true,
        };
        Ok(Flow::Reply)
    })
}

static PATHCONF: Lazy<Pipeline<PATHCONF3args, PATHCONF3resok>> = Lazy::new(|| {
    Pipeline::new("pathconf")
        .then(ensure_allowed)
        .then(resolve_object)
        .then(pathconf_limits)
});

pub async fn nfsproc3_pathconf(args: PATHCONF3args, context: &RPCContext) -> Reply<PATHCONF3resok> {
    debug!("nfsproc3_pathconf({:?})", args);
    PATHCONF.run(&mut Call::new(args, context)).await
}

fn mknod_unsupported<'a>(call: &'a mut Call<MKNOD3args>, reply: &'a mut CREATE3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        reply.dir_wcc.after = vfs::post_op(vfs::try_attrs(call.dir_path()?).await);
        Err(nfsstat3::NFS3ERR_NOTSUPP)
    })
}

static MKNOD: Lazy<Pipeline<MKNOD3args, CREATE3resok>> = Lazy::new(|| {
    Pipeline::new("mknod")
        .then(ensure_allowed)
        .then(resolve_dirop)
        .then(dir_pre_op)
        .then(mknod_unsupported)
});

pub async fn nfsproc3_mknod(args: MKNOD3args, context: &RPCContext) -> Reply<CREATE3resok> {
    debug!("nfsproc3_mknod({:?})", args);
    MKNOD.run(&mut Call::new(args, context)).await
}
