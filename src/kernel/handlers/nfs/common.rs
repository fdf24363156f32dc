//! Stages shared by several procedures.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::fhdb::{FhdbError, FileHandle};
use crate::kernel::access::Exports;
use crate::kernel::api::nfs::*;
use crate::kernel::fd_cache::OpenFile;
use crate::kernel::protocol::context::RPCContext;
use crate::kernel::protocol::pipeline::{Call, Flow, StageResult};
use crate::kernel::vfs::{self, nfs_error};

pub const MAX_NAME_LEN: usize = 1024;

/// Arguments naming one existing object by handle.
pub trait HasObject {
    fn object(&self) -> &nfs_fh3;
}

/// Arguments naming a child of a directory handle.
pub trait HasDirOp {
    fn dirop(&self) -> &diropargs3;
}

/// Reply bodies carrying the weak cache consistency data of the object or
/// directory a procedure changed.
pub trait WccBody {
    fn wcc(&mut self) -> &mut wcc_data;
}

macro_rules! has_object {
    ($($args:ty => $field:ident),* $(,)?) => {
        $(impl HasObject for $args {
            fn object(&self) -> &nfs_fh3 {
                &self.$field
            }
        })*
    };
}

macro_rules! has_dirop {
    ($($args:ty => $field:ident),* $(,)?) => {
        $(impl HasDirOp for $args {
            fn dirop(&self) -> &diropargs3 {
                &self.$field
            }
        })*
    };
}

macro_rules! wcc_body {
    ($($body:ty => $field:ident),* $(,)?) => {
        $(impl WccBody for $body {
            fn wcc(&mut self) -> &mut wcc_data {
                &mut self.$field
            }
        })*
    };
}

has_object!(
    GETATTR3args => object,
    SETATTR3args => object,
    ACCESS3args => object,
    READLINK3args => symlink,
    READ3args => file,
    WRITE3args => file,
    LINK3args => file,
    READDIR3args => dir,
    READDIRPLUS3args => dir,
    FSSTAT3args => fsroot,
    FSINFO3args => fsroot,
    PATHCONF3args => object,
    COMMIT3args => file,
);

has_dirop!(
    CREATE3args => dirops,
    MKDIR3args => dirops,
    SYMLINK3args => dirops,
    MKNOD3args => dirops,
    REMOVE3args => object,
    RENAME3args => from,
);

wcc_body!(
    SETATTR3res => obj_wcc,
    WRITE3resok => file_wcc,
    COMMIT3resok => file_wcc,
    CREATE3resok => dir_wcc,
    REMOVE3res => dir_wcc,
);

/// Maps a handle store failure during resolution onto a status.
pub fn resolve_error(err: FhdbError) -> nfsstat3 {
    match err {
        FhdbError::NotFound(_) => nfsstat3::NFS3ERR_STALE,
        FhdbError::BadHandle(_) => nfsstat3::NFS3ERR_BADHANDLE,
        other => {
            error!("handle store failure: {}", other);
            nfsstat3::NFS3ERR_SERVERFAULT
        }
    }
}

pub async fn resolve_handle(context: &RPCContext, fh: &nfs_fh3) -> Result<(FileHandle, PathBuf), nfsstat3> {
    let handle = FileHandle::try_from(fh).map_err(resolve_error)?;
    let path = context.fhdb.resolve(&handle).await.map_err(resolve_error)?;
    Ok((handle, path))
}

fn check_name(name: &[u8]) -> Result<(), nfsstat3> {
    if name.is_empty() || name.contains(&b'/') || name.contains(&0) {
        return Err(nfsstat3::NFS3ERR_INVAL);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(nfsstat3::NFS3ERR_NAMETOOLONG);
    }
    Ok(())
}

/// Composes the path LOOKUP reaches through `name` inside `dir`. An export
/// root is its own parent.
pub fn child_path(dir: &Path, name: &[u8], exports: &Exports) -> Result<PathBuf, nfsstat3> {
    check_name(name)?;
    match name {
        b"." => Ok(dir.to_path_buf()),
        b".." if exports.is_root(dir) => Ok(dir.to_path_buf()),
        b".." => Ok(dir.parent().unwrap_or(dir).to_path_buf()),
        _ => Ok(dir.join(OsStr::from_bytes(name))),
    }
}

/// Composes the path of a directory entry a procedure creates, removes or
/// renames. The dot names never denote such an entry.
pub fn entry_path(dir: &Path, name: &[u8]) -> Result<PathBuf, nfsstat3> {
    check_name(name)?;
    match name {
        b"." => Err(nfsstat3::NFS3ERR_INVAL),
        b".." => Err(nfsstat3::NFS3ERR_EXIST),
        _ => Ok(dir.join(OsStr::from_bytes(name))),
    }
}

/// Resolves the directory handle of `dirop` and the entry path it names.
pub async fn resolve_child(context: &RPCContext, dirop: &diropargs3) -> Result<(PathBuf, PathBuf), nfsstat3> {
    let (_, dir) = resolve_handle(context, &dirop.dir).await?;
    let child = entry_path(&dir, &dirop.name)?;
    Ok((dir, child))
}

/// Fails with access-denied for clients the host lists exclude.
pub fn ensure_allowed<'a, A, R>(call: &'a mut Call<A>, _reply: &'a mut R) -> BoxFuture<'a, StageResult>
where
    A: Send,
    R: Send,
{
    Box::pin(async move {
        if call.context.client_allowed() {
            Ok(Flow::Next)
        } else {
            warn!("refusing call from {}", call.context.client_addr);
            Err(nfsstat3::NFS3ERR_ACCES)
        }
    })
}

pub fn resolve_object<'a, A, R>(call: &'a mut Call<A>, _reply: &'a mut R) -> BoxFuture<'a, StageResult>
where
    A: HasObject + Send,
    R: Send,
{
    Box::pin(async move {
        let (handle, path) = resolve_handle(&call.context, call.args.object()).await?;
        debug!("{} -> {}", handle, path.display());
        call.handle = Some(handle);
        call.path = Some(path);
        Ok(Flow::Next)
    })
}

/// Resolves the entry a mutating procedure acts on.
pub fn resolve_dirop<'a, A, R>(call: &'a mut Call<A>, _reply: &'a mut R) -> BoxFuture<'a, StageResult>
where
    A: HasDirOp + Send,
    R: Send,
{
    Box::pin(async move {
        let (dir, child) = resolve_child(&call.context, call.args.dirop()).await?;
        debug!("{} in {}", child.display(), dir.display());
        call.dir_path = Some(dir);
        call.path = Some(child);
        Ok(Flow::Next)
    })
}

/// Resolves a LOOKUP name, following `.` and `..`.
pub fn resolve_lookup<'a, R>(call: &'a mut Call<LOOKUP3args>, _reply: &'a mut R) -> BoxFuture<'a, StageResult>
where
    R: Send,
{
    Box::pin(async move {
        let what = &call.args.what;
        let (_, dir) = resolve_handle(&call.context, &what.dir).await?;
        let child = child_path(&dir, &what.name, &call.context.config.exports)?;
        debug!("{} in {}", child.display(), dir.display());
        call.dir_path = Some(dir);
        call.path = Some(child);
        Ok(Flow::Next)
    })
}

/// Fetches the cached descriptor of the resolved object, opening and
/// caching one on a miss.
pub fn open_file<'a, A, R>(call: &'a mut Call<A>, _reply: &'a mut R) -> BoxFuture<'a, StageResult>
where
    A: Send,
    R: Send,
{
    Box::pin(async move {
        let handle = call.handle.ok_or(nfsstat3::NFS3ERR_SERVERFAULT)?;
        if let Some(open) = call.context.fd_cache.get(&handle) {
            call.open = Some(open);
            return Ok(Flow::Next);
        }
        let path = call.path()?;
        let meta = vfs::stat(path).await.map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        let file = vfs::open_for_io(path)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_SERVERFAULT))?;
        let open = Arc::new(OpenFile::new(file, meta.len()));
        call.context.fd_cache.set(handle, Arc::clone(&open));
        call.open = Some(open);
        Ok(Flow::Next)
    })
}

/// Records the pre-operation attributes of the resolved object.
pub fn object_pre_op<'a, A, R>(call: &'a mut Call<A>, reply: &'a mut R) -> BoxFuture<'a, StageResult>
where
    A: Send,
    R: WccBody + Send,
{
    Box::pin(async move {
        let attr = vfs::lstat_attrs(call.path()?)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        reply.wcc().before = vfs::pre_op(Some(&attr));
        Ok(Flow::Next)
    })
}

/// Records the pre-operation attributes of the parent directory, which
/// must be a directory.
pub fn dir_pre_op<'a, A, R>(call: &'a mut Call<A>, reply: &'a mut R) -> BoxFuture<'a, StageResult>
where
    A: Send,
    R: WccBody + Send,
{
    Box::pin(async move {
        let attr = vfs::lstat_attrs(call.dir_path()?)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        if attr.ftype != ftype3::NF3DIR {
            return Err(nfsstat3::NFS3ERR_NOTDIR);
        }
        reply.wcc().before = vfs::pre_op(Some(&attr));
        Ok(Flow::Next)
    })
}

/// Maps the created path to a handle and fills in the shared create reply.
pub fn register_created<'a, A>(call: &'a mut Call<A>, reply: &'a mut CREATE3resok) -> BoxFuture<'a, StageResult>
where
    A: Send,
{
    Box::pin(async move {
        let path = call.path()?;
        let handle = match call.context.fhdb.lookup_or_create(path).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("no handle for created {}: {}", path.display(), e);
                return Err(nfsstat3::NFS3ERR_SERVERFAULT);
            }
        };
        reply.obj = post_op_fh3::handle(handle.to_fh3());
        reply.obj_attributes = vfs::post_op(vfs::try_attrs(path).await);
        reply.dir_wcc.after = vfs::post_op(vfs::try_attrs(call.dir_path()?).await);
        call.handle = Some(handle);
        Ok(Flow::Reply)
    })
}

/// Drops the mapping of a path that no longer exists on disk.
pub fn forget_removed<'a, A, R>(call: &'a mut Call<A>, reply: &'a mut R) -> BoxFuture<'a, StageResult>
where
    A: Send,
    R: WccBody + Send,
{
    Box::pin(async move {
        let path = call.path()?;
        match call.context.fhdb.remove(path).await {
            Ok(Some(handle)) => {
                call.context.fd_cache.delete(&handle);
            }
            Ok(None) => {}
            Err(e) => {
                error!("{} was deleted but its mapping is stale: {}", path.display(), e);
                return Err(nfsstat3::NFS3ERR_SERVERFAULT);
            }
        }
        reply.wcc().after = vfs::post_op(vfs::try_attrs(call.dir_path()?).await);
        Ok(Flow::Reply)
    })
}

/// Mode requested through a settable attribute, or `default`.
pub fn requested_mode(attrs: &sattr3, default: u32) -> u32 {
    match attrs.mode {
        set_mode3::mode(mode) => mode & 0o7777,
        set_mode3::Void => default,
    }
}
