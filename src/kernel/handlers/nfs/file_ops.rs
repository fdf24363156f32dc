//! READ, WRITE, CREATE, COMMIT, REMOVE and RENAME.

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tracing::{debug, error};

use super::common::{
    dir_pre_op, ensure_allowed, forget_removed, object_pre_op, open_file, register_created, requested_mode,
    resolve_child, resolve_dirop, resolve_object,
};
use crate::kernel::api::nfs::*;
use crate::kernel::protocol::context::RPCContext;
use crate::kernel::protocol::pipeline::{Call, Flow, Pipeline, Reply, StageResult};
use crate::kernel::vfs::{self, fattr_from_metadata, nfs_error, CreateKind};

fn read_data<'a>(call: &'a mut Call<READ3args>, reply: &'a mut READ3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let open = call.open_file()?;
        let offset = call.args.offset;
        let data = vfs::read_at(open.clone(), offset, call.args.count as usize)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;

        let end = offset + data.len() as u64;
        reply.eof = open.size() <= end;
        if reply.eof {
            if let Some(handle) = &call.handle {
                call.context.fd_cache.delete(handle);
            }
        }
        reply.count = data.len() as count3;
        reply.data = data;
        reply.file_attributes = match vfs::fstat(open).await {
            Ok(meta) => post_op_attr::attributes(fattr_from_metadata(&meta)),
            Err(_) => post_op_attr::Void,
        };
        Ok(Flow::Reply)
    })
}

static READ: Lazy<Pipeline<READ3args, READ3resok>> = Lazy::new(|| {
    Pipeline::new("read")
        .then(ensure_allowed)
        .then(resolve_object)
        .then(open_file)
        .then(read_data)
});

pub async fn nfsproc3_read(args: READ3args, context: &RPCContext) -> Reply<READ3resok> {
    debug!("nfsproc3_read({:?},{},{})", args.file, args.offset, args.count);
    READ.run(&mut Call::new(args, context)).await
}

fn write_data<'a>(call: &'a mut Call<WRITE3args>, reply: &'a mut WRITE3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let open = call.open_file()?;
        let offset = call.args.offset;
        let count = (call.args.count as usize).min(call.args.data.len());
        let data = call.args.data[..count].to_vec();
        let io = |e: std::io::Error| nfs_error(&e, nfsstat3::NFS3ERR_IO);

        vfs::write_at(open.clone(), offset, data).await.map_err(io)?;
        open.extend_to(offset + count as u64);
        match call.args.stable {
            stable_how::UNSTABLE => {}
            stable_how::DATA_SYNC => vfs::sync(open.clone(), true).await.map_err(io)?,
            stable_how::FILE_SYNC => vfs::sync(open.clone(), false).await.map_err(io)?,
        }

        reply.count = count as count3;
        reply.committed = call.args.stable;
        reply.verf = call.context.config.write_verifier;
        reply.file_wcc.after = match vfs::fstat(open).await {
            Ok(meta) => post_op_attr::attributes(fattr_from_metadata(&meta)),
            Err(_) => post_op_attr::Void,
        };
        Ok(Flow::Reply)
    })
}

static WRITE: Lazy<Pipeline<WRITE3args, WRITE3resok>> = Lazy::new(|| {
    Pipeline::new("write")
        .then(ensure_allowed)
        .then(resolve_object)
        .then(object_pre_op)
        .then(open_file)
        .then(write_data)
});

pub async fn nfsproc3_write(args: WRITE3args, context: &RPCContext) -> Reply<WRITE3resok> {
    debug!(
        "nfsproc3_write({:?},{},{},{:?})",
        args.file, args.offset, args.count, args.stable
    );
    WRITE.run(&mut Call::new(args, context)).await
}

fn create_file<'a>(call: &'a mut Call<CREATE3args>, _reply: &'a mut CREATE3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let (kind, mode) = match &call.args.how {
            createhow3::UNCHECKED(attrs) => (CreateKind::Truncate, requested_mode(attrs, 0o644)),
            createhow3::GUARDED(attrs) => (CreateKind::Exclusive, requested_mode(attrs, 0o644)),
            createhow3::EXCLUSIVE(_) => (CreateKind::Exclusive, 0o644),
        };
        let path = call.path()?;
        let (uid, gid) = call.context.credentials();
        let ownership = vfs::create_file(path, kind, mode, uid, gid)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        ownership.log_failures(path);

        if kind == CreateKind::Truncate {
            // a cached descriptor still carries the pre-truncation size
            if let Ok(handle) = call.context.fhdb.lookup_or_create(path).await {
                call.context.fd_cache.delete(&handle);
            }
        }
        Ok(Flow::Next)
    })
}

static CREATE: Lazy<Pipeline<CREATE3args, CREATE3resok>> = Lazy::new(|| {
    Pipeline::new("create")
        .then(ensure_allowed)
        .then(resolve_dirop)
        .then(dir_pre_op)
        .then(create_file)
        .then(register_created)
});

pub async fn nfsproc3_create(args: CREATE3args, context: &RPCContext) -> Reply<CREATE3resok> {
    debug!("nfsproc3_create({:?})", args);
    CREATE.run(&mut Call::new(args, context)).await
}

fn commit_sync<'a>(call: &'a mut Call<COMMIT3args>, reply: &'a mut COMMIT3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let open = call.open_file()?;
        vfs::sync(open.clone(), false)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        reply.verf = call.context.config.write_verifier;
        reply.file_wcc.after = match vfs::fstat(open).await {
            Ok(meta) => post_op_attr::attributes(fattr_from_metadata(&meta)),
            Err(_) => post_op_attr::Void,
        };
        Ok(Flow::Reply)
    })
}

static COMMIT: Lazy<Pipeline<COMMIT3args, COMMIT3resok>> = Lazy::new(|| {
    Pipeline::new("commit")
        .then(ensure_allowed)
        .then(resolve_object)
        .then(object_pre_op)
        .then(open_file)
        .then(commit_sync)
});

pub async fn nfsproc3_commit(args: COMMIT3args, context: &RPCContext) -> Reply<COMMIT3resok> {
    debug!("nfsproc3_commit({:?})", args);
    COMMIT.run(&mut Call::new(args, context)).await
}

fn remove_file<'a>(call: &'a mut Call<REMOVE3args>, _reply: &'a mut REMOVE3res) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let path = call.path()?;
        let meta = vfs::lstat(path)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        if meta.is_dir() {
            return Err(nfsstat3::NFS3ERR_ISDIR);
        }
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        Ok(Flow::Next)
    })
}

static REMOVE: Lazy<Pipeline<REMOVE3args, REMOVE3res>> = Lazy::new(|| {
    Pipeline::new("remove")
        .then(ensure_allowed)
        .then(resolve_dirop)
        .then(dir_pre_op)
        .then(remove_file)
        .then(forget_removed)
});

pub async fn nfsproc3_remove(args: REMOVE3args, context: &RPCContext) -> Reply<REMOVE3res> {
    debug!("nfsproc3_remove({:?})", args);
    REMOVE.run(&mut Call::new(args, context)).await
}

/// Resolves the destination and records both directories' pre-op attributes.
fn rename_prepare<'a>(call: &'a mut Call<RENAME3args>, reply: &'a mut RENAME3res) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let (to_dir, to_path) = resolve_child(&call.context, &call.args.to).await?;
        let io = |e: std::io::Error| nfs_error(&e, nfsstat3::NFS3ERR_IO);

        let from_attr = vfs::lstat_attrs(call.dir_path()?).await.map_err(io)?;
        let to_attr = vfs::lstat_attrs(&to_dir).await.map_err(io)?;
        if from_attr.ftype != ftype3::NF3DIR || to_attr.ftype != ftype3::NF3DIR {
            return Err(nfsstat3::NFS3ERR_NOTDIR);
        }
        reply.fromdir_wcc.before = vfs::pre_op(Some(&from_attr));
        reply.todir_wcc.before = vfs::pre_op(Some(&to_attr));

        let source = vfs::lstat(call.path()?).await.map_err(io)?;
        if source.is_dir() {
            return Err(nfsstat3::NFS3ERR_ISDIR);
        }
        call.to_dir_path = Some(to_dir);
        call.to_path = Some(to_path);
        Ok(Flow::Next)
    })
}

fn rename_move<'a>(call: &'a mut Call<RENAME3args>, reply: &'a mut RENAME3res) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let from = call.path()?;
        let to = call.to_path()?;
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;

        match call.context.fhdb.move_path(from, to).await {
            Ok(outcome) => {
                if let Some(displaced) = outcome.displaced {
                    call.context.fd_cache.delete(&displaced);
                }
                debug!("{} keeps {} at {}", from.display(), outcome.handle, to.display());
            }
            Err(e) => {
                error!(
                    "{} renamed to {} but the handle store was not updated: {}",
                    from.display(),
                    to.display(),
                    e
                );
                return Err(nfsstat3::NFS3ERR_SERVERFAULT);
            }
        }

        reply.fromdir_wcc.after = vfs::post_op(vfs::try_attrs(call.dir_path()?).await);
        reply.todir_wcc.after = vfs::post_op(vfs::try_attrs(call.to_dir_path()?).await);
        Ok(Flow::Reply)
    })
}

static RENAME: Lazy<Pipeline<RENAME3args, RENAME3res>> = Lazy::new(|| {
    Pipeline::new("rename")
        .then(ensure_allowed)
        .then(resolve_dirop)
        .then(rename_prepare)
        .then(rename_move)
});

pub async fn nfsproc3_rename(args: RENAME3args, context: &RPCContext) -> Reply<RENAME3res> {
    debug!("nfsproc3_rename({:?})", args);
    RENAME.run(&mut Call::new(args, context)).await
}
