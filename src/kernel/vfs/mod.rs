//! Host filesystem operations used by the procedures.
//!
//! Path-based calls go through `tokio::fs`; descriptor-based calls and the
//! few syscalls tokio does not wrap run on the blocking pool.

pub mod attrs;
pub mod errors;

use std::ffi::OsString;
use std::fs::{File, Metadata, OpenOptions, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;
use tracing::warn;

use crate::kernel::api::nfs::fattr3;
use crate::kernel::fd_cache::OpenFile;

pub use attrs::{fattr_from_metadata, post_op, pre_op, wcc_from};
pub use errors::nfs_error;

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

pub async fn lstat(path: &Path) -> io::Result<Metadata> {
    tokio::fs::symlink_metadata(path).await
}

pub async fn stat(path: &Path) -> io::Result<Metadata> {
    tokio::fs::metadata(path).await
}

pub async fn lstat_attrs(path: &Path) -> io::Result<fattr3> {
    lstat(path).await.map(|meta| fattr_from_metadata(&meta))
}

/// Attributes of `path` if it can be stat'ed right now.
pub async fn try_attrs(path: &Path) -> Option<fattr3> {
    lstat_attrs(path).await.ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListing {
    pub name: OsString,
    pub fileid: u64,
}

/// Lists a directory without `.` and `..`, sorted bytewise by name so the
/// order is stable between calls while the directory is unchanged.
pub async fn list_dir(path: &Path) -> io::Result<Vec<DirListing>> {
    let mut reader = tokio::fs::read_dir(path).await?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        entries.push(DirListing {
            name: entry.file_name(),
            fileid: entry.ino(),
        });
    }
    entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    Ok(entries)
}

/// Opens for read and write, falling back to read-only when the file or
/// filesystem refuses writes.
pub async fn open_for_io(path: &Path) -> io::Result<File> {
    let path = path.to_path_buf();
    blocking(move || match OpenOptions::new().read(true).write(true).open(&path) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied || e.raw_os_error() == Some(libc::EROFS) => {
            OpenOptions::new().read(true).open(&path)
        }
        Err(e) => Err(e),
    })
    .await
}

pub async fn read_at(open: Arc<OpenFile>, offset: u64, count: usize) -> io::Result<Vec<u8>> {
    blocking(move || {
        let mut buf = vec![0u8; count];
        let mut filled = 0;
        while filled < count {
            match open.file().read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    })
    .await
}

pub async fn write_at(open: Arc<OpenFile>, offset: u64, data: Vec<u8>) -> io::Result<()> {
    blocking(move || open.file().write_all_at(&data, offset)).await
}

pub async fn sync(open: Arc<OpenFile>, data_only: bool) -> io::Result<()> {
    blocking(move || {
        if data_only {
            open.file().sync_data()
        } else {
            open.file().sync_all()
        }
    })
    .await
}

pub async fn fstat(open: Arc<OpenFile>) -> io::Result<Metadata> {
    blocking(move || open.file().metadata()).await
}

/// Outcome of the ownership fix-ups after creating an object. Failures
/// here are reported, never fatal.
#[derive(Debug)]
pub struct Ownership {
    pub chmod: io::Result<()>,
    pub chown: io::Result<()>,
}

impl Ownership {
    pub fn log_failures(&self, path: &Path) {
        if let Err(e) = &self.chmod {
            warn!("chmod of {} failed: {}", path.display(), e);
        }
        if let Err(e) = &self.chown {
            warn!("chown of {} failed: {}", path.display(), e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateKind {
    /// Fails with EEXIST if the name is taken.
    Exclusive,
    /// Creates or truncates.
    Truncate,
}

/// Creates a regular file, then sets `mode` (undoing the umask) and hands
/// it to `uid`/`gid`.
pub async fn create_file(path: &Path, kind: CreateKind, mode: u32, uid: u32, gid: u32) -> io::Result<Ownership> {
    let path = path.to_path_buf();
    blocking(move || {
        let mut opts = OpenOptions::new();
        opts.write(true).mode(mode);
        match kind {
            CreateKind::Exclusive => opts.create_new(true),
            CreateKind::Truncate => opts.create(true).truncate(true),
        };
        let file = opts.open(&path)?;
        Ok(Ownership {
            chmod: file.set_permissions(Permissions::from_mode(mode)),
            chown: std::os::unix::fs::fchown(&file, Some(uid), Some(gid)),
        })
    })
    .await
}

pub async fn make_dir(path: &Path, mode: u32, uid: u32, gid: u32) -> io::Result<Ownership> {
    let path = path.to_path_buf();
    blocking(move || {
        std::fs::DirBuilder::new().mode(mode).create(&path)?;
        Ok(Ownership {
            chmod: std::fs::set_permissions(&path, Permissions::from_mode(mode)),
            chown: std::os::unix::fs::chown(&path, Some(uid), Some(gid)),
        })
    })
    .await
}

pub async fn make_symlink(target: PathBuf, path: &Path, uid: u32, gid: u32) -> io::Result<Ownership> {
    let path = path.to_path_buf();
    blocking(move || {
        std::os::unix::fs::symlink(&target, &path)?;
        Ok(Ownership {
            chmod: Ok(()),
            chown: std::os::unix::fs::lchown(&path, Some(uid), Some(gid)),
        })
    })
    .await
}

pub async fn truncate(path: &Path, size: u64) -> io::Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(size).await
}

pub async fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    tokio::fs::set_permissions(path, Permissions::from_mode(mode)).await
}

pub async fn lchown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    let path = path.to_path_buf();
    blocking(move || std::os::unix::fs::lchown(&path, uid, gid)).await
}

pub async fn set_times(path: &Path, atime: Option<FileTime>, mtime: Option<FileTime>) -> io::Result<()> {
    let path = path.to_path_buf();
    blocking(move || match (atime, mtime) {
        (Some(atime), Some(mtime)) => filetime::set_file_times(&path, atime, mtime),
        (Some(atime), None) => filetime::set_file_atime(&path, atime),
        (None, Some(mtime)) => filetime::set_file_mtime(&path, mtime),
        (None, None) => Ok(()),
    })
    .await
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub avail_bytes: u64,
    pub total_files: u64,
    pub free_files: u64,
    pub avail_files: u64,
}

pub async fn statvfs(path: &Path) -> io::Result<FsUsage> {
    let path = path.to_path_buf();
    blocking(move || {
        let st = rustix::fs::statvfs(&path)?;
        Ok(FsUsage {
            total_bytes: st.f_blocks * st.f_frsize,
            free_bytes: st.f_bfree * st.f_frsize,
            avail_bytes: st.f_bavail * st.f_frsize,
            total_files: st.f_files,
            free_files: st.f_ffree,
            avail_files: st.f_favail,
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::tempdir;

    #[tokio::test]
    async fn listing_is_sorted_and_skips_dot_entries() {
        let dir = tempdir().expect("tempdir");
        for name in ["b", "a", "c"] {
            std::fs::write(dir.path().join(name), b"").expect("write");
        }
        let names: Vec<OsString> = list_dir(dir.path())
            .await
            .expect("list")
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![OsString::from("a"), OsString::from("b"), OsString::from("c")]);
    }

    #[tokio::test]
    async fn exclusive_create_refuses_existing_names() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("x");
        let uid = std::fs::metadata(dir.path()).expect("stat").uid();
        let gid = std::fs::metadata(dir.path()).expect("stat").gid();
        create_file(&path, CreateKind::Exclusive, 0o640, uid, gid).await.expect("first create");
        let err = create_file(&path, CreateKind::Exclusive, 0o640, uid, gid).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        let mode = std::fs::metadata(&path).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[tokio::test]
    async fn positional_io_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data");
        std::fs::write(&path, b"").expect("write");
        let open = Arc::new(OpenFile::new(open_for_io(&path).await.expect("open"), 0));
        write_at(Arc::clone(&open), 4, b"tail".to_vec()).await.expect("write");
        let data = read_at(Arc::clone(&open), 0, 64).await.expect("read");
        assert_eq!(data, b"\0\0\0\0tail");
        sync(open, true).await.expect("sync");
    }

    #[tokio::test]
    async fn statvfs_reports_space() {
        let dir = tempdir().expect("tempdir");
        let usage = statvfs(dir.path()).await.expect("statvfs");
        assert!(usage.total_bytes >= usage.free_bytes);
        assert!(usage.free_bytes >= usage.avail_bytes);
        assert!(usage.total_files >= usage.free_files);

        let missing = statvfs(&dir.path().join("gone")).await.expect_err("missing path");
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);
    }
}
