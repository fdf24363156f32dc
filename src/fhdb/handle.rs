use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::fhdb::FhdbError;
use crate::kernel::api::nfs::nfs_fh3;

/// Opaque 128-bit handle naming "the object that was at this path".
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(Uuid);

impl FileHandle {
    pub fn generate() -> FileHandle {
        FileHandle(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<FileHandle, FhdbError> {
        Uuid::from_slice(bytes)
            .map(FileHandle)
            .map_err(|_| FhdbError::BadHandle(bytes.len()))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn to_fh3(&self) -> nfs_fh3 {
        nfs_fh3 {
            data: self.as_bytes().to_vec(),
        }
    }
}

impl TryFrom<&nfs_fh3> for FileHandle {
    type Error = FhdbError;

    fn try_from(fh: &nfs_fh3) -> Result<Self, Self::Error> {
        FileHandle::from_bytes(&fh.data)
    }
}

impl From<FileHandle> for nfs_fh3 {
    fn from(handle: FileHandle) -> Self {
        handle.to_fh3()
    }
}

impl FromStr for FileHandle {
    type Err = FhdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(FileHandle)
            .map_err(|_| FhdbError::Corrupt(format!("'{}' is not a handle", s)))
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHandle({})", self.0.hyphenated())
    }
}
