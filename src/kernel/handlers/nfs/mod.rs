pub mod basic_ops; // NULL, GETATTR, SETATTR, ACCESS
pub mod common; // stages shared across procedures
pub mod directory_ops; // LOOKUP, MKDIR, RMDIR, READDIR, READDIRPLUS
pub mod file_ops; // READ, WRITE, CREATE, COMMIT, REMOVE, RENAME
pub mod fs_ops; // FSSTAT, FSINFO, PATHCONF, MKNOD
pub mod link_ops; // LINK, SYMLINK, READLINK
pub mod router;

pub use router::{handle_nfs, NFSProgram, NfsRequest, NfsResponse};
