use std::io;

use crate::kernel::api::nfs::nfsstat3;

/// Maps a host filesystem error onto an NFS status. Codes with no NFS
/// counterpart become `fallback`, which each call site picks.
pub fn nfs_error(err: &io::Error, fallback: nfsstat3) -> nfsstat3 {
    match err.raw_os_error() {
        Some(libc::EPERM) => nfsstat3::NFS3ERR_PERM,
        Some(libc::ENOENT) => nfsstat3::NFS3ERR_NOENT,
        Some(libc::EIO) => nfsstat3::NFS3ERR_IO,
        Some(libc::ENXIO) => nfsstat3::NFS3ERR_NXIO,
        Some(libc::EACCES) => nfsstat3::NFS3ERR_ACCES,
        Some(libc::EEXIST) => nfsstat3::NFS3ERR_EXIST,
        Some(libc::EXDEV) => nfsstat3::NFS3ERR_XDEV,
        Some(libc::ENODEV) => nfsstat3::NFS3ERR_NODEV,
        Some(libc::ENOTDIR) => nfsstat3::NFS3ERR_NOTDIR,
        Some(libc::EISDIR) => nfsstat3::NFS3ERR_ISDIR,
        Some(libc::EINVAL) => nfsstat3::NFS3ERR_INVAL,
        Some(libc::EFBIG) => nfsstat3::NFS3ERR_FBIG,
        Some(libc::ENOSPC) => nfsstat3::NFS3ERR_NOSPC,
        Some(libc::EROFS) => nfsstat3::NFS3ERR_ROFS,
        Some(libc::EMLINK) => nfsstat3::NFS3ERR_MLINK,
        Some(libc::ENAMETOOLONG) => nfsstat3::NFS3ERR_NAMETOOLONG,
        Some(libc::ENOTEMPTY) => nfsstat3::NFS3ERR_NOTEMPTY,
        Some(libc::EDQUOT) => nfsstat3::NFS3ERR_DQUOT,
        Some(libc::ESTALE) => nfsstat3::NFS3ERR_STALE,
        Some(libc::EOPNOTSUPP) => nfsstat3::NFS3ERR_NOTSUPP,
        Some(_) => fallback,
        None => match err.kind() {
            io::ErrorKind::NotFound => nfsstat3::NFS3ERR_NOENT,
            io::ErrorKind::PermissionDenied => nfsstat3::NFS3ERR_ACCES,
            io::ErrorKind::AlreadyExists => nfsstat3::NFS3ERR_EXIST,
            _ => fallback,
        },
    }
}
