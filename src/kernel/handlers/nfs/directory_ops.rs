//! LOOKUP, MKDIR, RMDIR, READDIR and READDIRPLUS.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tracing::{debug, error, warn};

use super::common::{
    dir_pre_op, ensure_allowed, forget_removed, register_created, requested_mode, resolve_dirop, resolve_lookup,
    resolve_object,
};
use crate::fhdb::FhdbError;
use crate::kernel::api::nfs::*;
use crate::kernel::protocol::context::RPCContext;
use crate::kernel::protocol::pipeline::{Call, Flow, Pipeline, Reply, StageResult};
use crate::kernel::vfs::{self, nfs_error, DirListing};

/// Fixed part of a READDIR or READDIRPLUS reply.
const REPLY_OVERHEAD: usize = 116;
const ENTRY_OVERHEAD: usize = 20;
const PLUS_ENTRY_OVERHEAD: usize = 28;
const ATTRIBUTES_SIZE: usize = 84;
const HANDLE_SIZE: usize = 64;

/// Cookie verifier of a directory: a 31-multiplier string hash of its path,
/// made non-negative, little-endian in the first four bytes.
pub fn cookie_verifier(dir: &Path) -> cookieverf3 {
    let hash = dir
        .as_os_str()
        .as_bytes()
        .iter()
        .fold(0i32, |h, &b| h.wrapping_mul(31).wrapping_add(b as i32));
    let mut verf = cookieverf3::default();
    LittleEndian::write_u32(&mut verf[..4], hash.unsigned_abs());
    verf
}

/// Zero means the caller has no verifier yet.
pub fn check_verifier(offered: &cookieverf3, current: &cookieverf3) -> Result<(), nfsstat3> {
    if *offered == cookieverf3::default() || offered == current {
        Ok(())
    } else {
        Err(nfsstat3::NFS3ERR_BAD_COOKIE)
    }
}

/// Encoded size of a filename: length word plus padded bytes.
pub fn xdr_len(name: &[u8]) -> usize {
    4 + ((name.len() + 3) & !3)
}

/// Entries after `cookie`, each paired with its own 1-based cookie.
fn after_cookie(listing: &[DirListing], cookie: cookie3) -> impl Iterator<Item = (cookie3, &DirListing)> {
    listing
        .iter()
        .enumerate()
        .map(|(i, entry)| (i as cookie3 + 1, entry))
        .filter(move |(ordinal, _)| *ordinal > cookie)
}

fn lookup_child<'a>(call: &'a mut Call<LOOKUP3args>, reply: &'a mut LOOKUP3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let dir_attr = vfs::lstat_attrs(call.dir_path()?)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        reply.dir_attributes = post_op_attr::attributes(dir_attr);
        if dir_attr.ftype != ftype3::NF3DIR {
            return Err(nfsstat3::NFS3ERR_NOTDIR);
        }

        let path = call.path()?;
        let attr = vfs::lstat_attrs(path)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_NOENT))?;
        let handle = call.context.fhdb.lookup_or_create(path).await.map_err(|e| match e {
            FhdbError::NotFound(_) => nfsstat3::NFS3ERR_NOENT,
            other => {
                error!("lookup of {} failed: {}", path.display(), other);
                nfsstat3::NFS3ERR_SERVERFAULT
            }
        })?;
        reply.object = handle.to_fh3();
        reply.obj_attributes = post_op_attr::attributes(attr);
        call.handle = Some(handle);
        Ok(Flow::Reply)
    })
}

static LOOKUP: Lazy<Pipeline<LOOKUP3args, LOOKUP3resok>> = Lazy::new(|| {
    Pipeline::new("lookup")
        .then(ensure_allowed)
        .then(resolve_lookup)
        .then(lookup_child)
});

pub async fn nfsproc3_lookup(args: LOOKUP3args, context: &RPCContext) -> Reply<LOOKUP3resok> {
    debug!("nfsproc3_lookup({:?})", args);
    LOOKUP.run(&mut Call::new(args, context)).await
}

fn mkdir_create<'a>(call: &'a mut Call<MKDIR3args>, _reply: &'a mut CREATE3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let path = call.path()?;
        let mode = requested_mode(&call.args.attributes, 0o755);
        let (uid, gid) = call.context.credentials();
        let ownership = vfs::make_dir(path, mode, uid, gid)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        ownership.log_failures(path);
        Ok(Flow::Next)
    })
}

static MKDIR: Lazy<Pipeline<MKDIR3args, CREATE3resok>> = Lazy::new(|| {
    Pipeline::new("mkdir")
        .then(ensure_allowed)
        .then(resolve_dirop)
        .then(dir_pre_op)
        .then(mkdir_create)
        .then(register_created)
});

pub async fn nfsproc3_mkdir(args: MKDIR3args, context: &RPCContext) -> Reply<CREATE3resok> {
    debug!("nfsproc3_mkdir({:?})", args);
    MKDIR.run(&mut Call::new(args, context)).await
}

fn rmdir_remove<'a>(call: &'a mut Call<RMDIR3args>, _reply: &'a mut RMDIR3res) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let path = call.path()?;
        match tokio::fs::remove_dir(path).await {
            Ok(()) => Ok(Flow::Next),
            Err(e) => match e.raw_os_error() {
                Some(libc::ENOENT) => {
                    debug!("{} already gone", path.display());
                    Ok(Flow::Next)
                }
                Some(libc::ENOTEMPTY) | Some(libc::EEXIST) => Err(nfsstat3::NFS3ERR_NOTEMPTY),
                _ => Err(nfs_error(&e, nfsstat3::NFS3ERR_IO)),
            },
        }
    })
}

static RMDIR: Lazy<Pipeline<RMDIR3args, RMDIR3res>> = Lazy::new(|| {
    Pipeline::new("rmdir")
        .then(ensure_allowed)
        .then(resolve_dirop)
        .then(dir_pre_op)
        .then(rmdir_remove)
        .then(forget_removed)
});

pub async fn nfsproc3_rmdir(args: RMDIR3args, context: &RPCContext) -> Reply<RMDIR3res> {
    debug!("nfsproc3_rmdir({:?})", args);
    RMDIR.run(&mut Call::new(args, context)).await
}

/// Stats the listed directory and checks the caller's verifier. Returns the
/// directory's attributes and current verifier.
async fn open_listing(dir: &Path, offered: &cookieverf3) -> Result<(fattr3, cookieverf3), nfsstat3> {
    let attr = vfs::lstat_attrs(dir)
        .await
        .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
    if attr.ftype != ftype3::NF3DIR {
        return Err(nfsstat3::NFS3ERR_NOTDIR);
    }
    let verifier = cookie_verifier(dir);
    check_verifier(offered, &verifier)?;
    Ok((attr, verifier))
}

fn readdir_list<'a>(call: &'a mut Call<READDIR3args>, reply: &'a mut READDIR3resok) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let dir = call.path()?;
        let (attr, verifier) = open_listing(dir, &call.args.cookieverf).await?;
        reply.dir_attributes = post_op_attr::attributes(attr);
        reply.cookieverf = verifier;

        let listing = vfs::list_dir(dir)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        let budget = call.args.count as usize;
        let mut used = REPLY_OVERHEAD;
        let mut eof = true;
        for (cookie, entry) in after_cookie(&listing, call.args.cookie) {
            let name = entry.name.as_bytes();
            let cost = ENTRY_OVERHEAD + xdr_len(name);
            if used + cost > budget {
                eof = false;
                break;
            }
            used += cost;
            reply.reply.entries.push(entry3 {
                fileid: entry.fileid,
                name: name.to_vec(),
                cookie,
            });
        }
        if !eof && reply.reply.entries.is_empty() {
            return Err(nfsstat3::NFS3ERR_TOOSMALL);
        }
        reply.reply.eof = eof;
        debug!("readdir {}: {} entries, eof {}", dir.display(), reply.reply.entries.len(), eof);
        Ok(Flow::Reply)
    })
}

static READDIR: Lazy<Pipeline<READDIR3args, READDIR3resok>> = Lazy::new(|| {
    Pipeline::new("readdir")
        .then(ensure_allowed)
        .then(resolve_object)
        .then(readdir_list)
});

pub async fn nfsproc3_readdir(args: READDIR3args, context: &RPCContext) -> Reply<READDIR3resok> {
    debug!("nfsproc3_readdir({:?})", args);
    READDIR.run(&mut Call::new(args, context)).await
}

fn readdirplus_list<'a>(
    call: &'a mut Call<READDIRPLUS3args>,
    reply: &'a mut READDIRPLUS3resok,
) -> BoxFuture<'a, StageResult> {
    Box::pin(async move {
        let dir = call.path()?;
        let (attr, verifier) = open_listing(dir, &call.args.cookieverf).await?;
        reply.dir_attributes = post_op_attr::attributes(attr);
        reply.cookieverf = verifier;

        let listing = vfs::list_dir(dir)
            .await
            .map_err(|e| nfs_error(&e, nfsstat3::NFS3ERR_IO))?;
        let dircount = call.args.dircount as usize;
        let maxcount = call.args.maxcount as usize;
        let mut dir_used = 0;
        let mut total_used = REPLY_OVERHEAD;
        let mut eof = true;
        let mut failure = None;

        for (cookie, entry) in after_cookie(&listing, call.args.cookie) {
            let name = entry.name.as_bytes();
            let dir_cost = ENTRY_OVERHEAD + xdr_len(name);
            let total_cost = PLUS_ENTRY_OVERHEAD + xdr_len(name) + ATTRIBUTES_SIZE + HANDLE_SIZE;
            if dir_used + dir_cost > dircount || total_used + total_cost > maxcount {
                eof = false;
                break;
            }

            let path = dir.join(&entry.name);
            let attr = match vfs::lstat_attrs(&path).await {
                Ok(attr) => attr,
                Err(e) => {
                    warn!("readdirplus: stat of {} failed: {}", path.display(), e);
                    failure = Some(nfsstat3::NFS3ERR_IO);
                    break;
                }
            };
            let handle = match call.context.fhdb.lookup_or_create(&path).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("readdirplus: no handle for {}: {}", path.display(), e);
                    failure = Some(nfsstat3::NFS3ERR_IO);
                    break;
                }
            };
            dir_used += dir_cost;
            total_used += total_cost;
            reply.reply.entries.push(entryplus3 {
                fileid: entry.fileid,
                name: name.to_vec(),
                cookie,
                name_attributes: post_op_attr::attributes(attr),
                name_handle: post_op_fh3::handle(handle.to_fh3()),
            });
        }

        if let Some(status) = failure {
            return Err(status);
        }
        if !eof && reply.reply.entries.is_empty() {
            return Err(nfsstat3::NFS3ERR_TOOSMALL);
        }
        reply.reply.eof = eof;
        reply.dir_attributes = vfs::post_op(vfs::try_attrs(dir).await);
        debug!(
            "readdirplus {}: {} entries, eof {}",
            dir.display(),
            reply.reply.entries.len(),
            eof
        );
        Ok(Flow::Reply)
    })
}

static READDIRPLUS: Lazy<Pipeline<READDIRPLUS3args, READDIRPLUS3resok>> = Lazy::new(|| {
    Pipeline::new("readdirplus")
        .then(ensure_allowed)
        .then(resolve_object)
        .then(readdirplus_list)
});

pub async fn nfsproc3_readdirplus(args: READDIRPLUS3args, context: &RPCContext) -> Reply<READDIRPLUS3resok> {
    debug!("nfsproc3_readdirplus({:?})", args);
    READDIRPLUS.run(&mut Call::new(args, context)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_pad_to_four_bytes() {
        assert_eq!(xdr_len(b""), 4);
        assert_eq!(xdr_len(b"a"), 8);
        assert_eq!(xdr_len(b"abcd"), 8);
        assert_eq!(xdr_len(b"abcde"), 12);
    }

    #[test]
    fn verifier_depends_only_on_the_path() {
        let a = cookie_verifier(Path::new("/srv/a"));
        assert_eq!(a, cookie_verifier(Path::new("/srv/a")));
        assert_ne!(a, cookie_verifier(Path::new("/srv/b")));
        assert_eq!(&a[4..], &[0u8; 4]);
    }

    #[test]
    fn verifier_matches_the_string_hash() {
        // "ab".hashCode() == 97 * 31 + 98
        assert_eq!(cookie_verifier(Path::new("ab"))[..4], 3105u32.to_le_bytes());
    }

    #[test]
    fn zero_verifier_is_always_accepted() {
        let current = cookie_verifier(Path::new("/srv"));
        assert!(check_verifier(&cookieverf3::default(), &current).is_ok());
        assert!(check_verifier(&current, &current).is_ok());
        assert_eq!(check_verifier(&[1; 8], &current), Err(nfsstat3::NFS3ERR_BAD_COOKIE));
    }
}
