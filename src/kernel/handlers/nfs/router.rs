#![allow(clippy::upper_case_acronyms)]
use num_derive::{FromPrimitive, ToPrimitive};
use tracing::debug;

use crate::kernel::api::nfs::*;
use crate::kernel::handlers::nfs::basic_ops::*;
use crate::kernel::handlers::nfs::directory_ops::*;
use crate::kernel::handlers::nfs::file_ops::*;
use crate::kernel::handlers::nfs::fs_ops::*;
use crate::kernel::handlers::nfs::link_ops::*;
use crate::kernel::protocol::context::RPCContext;
use crate::kernel::protocol::pipeline::Reply;

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum NFSProgram {
    NFSPROC3_NULL = 0,
    NFSPROC3_GETATTR = 1,
    NFSPROC3_SETATTR = 2,
    NFSPROC3_LOOKUP = 3,
    NFSPROC3_ACCESS = 4,
    NFSPROC3_READLINK = 5,
    NFSPROC3_READ = 6,
    NFSPROC3_WRITE = 7,
    NFSPROC3_CREATE = 8,
    NFSPROC3_MKDIR = 9,
    NFSPROC3_SYMLINK = 10,
    NFSPROC3_MKNOD = 11,
    NFSPROC3_REMOVE = 12,
    NFSPROC3_RMDIR = 13,
    NFSPROC3_RENAME = 14,
    NFSPROC3_LINK = 15,
    NFSPROC3_READDIR = 16,
    NFSPROC3_READDIRPLUS = 17,
    NFSPROC3_FSSTAT = 18,
    NFSPROC3_FSINFO = 19,
    NFSPROC3_PATHCONF = 20,
    NFSPROC3_COMMIT = 21,
}

/// A decoded NFSv3 call, one variant per procedure.
#[derive(Clone, Debug)]
pub enum NfsRequest {
    Null,
    Getattr(GETATTR3args),
    Setattr(SETATTR3args),
    Lookup(LOOKUP3args),
    Access(ACCESS3args),
    Readlink(READLINK3args),
    Read(READ3args),
    Write(WRITE3args),
    Create(CREATE3args),
    Mkdir(MKDIR3args),
    Symlink(SYMLINK3args),
    Mknod(MKNOD3args),
    Remove(REMOVE3args),
    Rmdir(RMDIR3args),
    Rename(RENAME3args),
    Link(LINK3args),
    Readdir(READDIR3args),
    Readdirplus(READDIRPLUS3args),
    Fsstat(FSSTAT3args),
    Fsinfo(FSINFO3args),
    Pathconf(PATHCONF3args),
    Commit(COMMIT3args),
}

/// The reply to an [`NfsRequest`], ready for the encoder.
#[derive(Clone, Debug)]
pub enum NfsResponse {
    Null(Reply<()>),
    Getattr(Reply<GETATTR3resok>),
    Setattr(Reply<SETATTR3res>),
    Lookup(Reply<LOOKUP3resok>),
    Access(Reply<ACCESS3resok>),
    Readlink(Reply<READLINK3resok>),
    Read(Reply<READ3resok>),
    Write(Reply<WRITE3resok>),
    Create(Reply<CREATE3resok>),
    Mkdir(Reply<CREATE3resok>),
    Symlink(Reply<CREATE3resok>),
    Mknod(Reply<CREATE3resok>),
    Remove(Reply<REMOVE3res>),
    Rmdir(Reply<RMDIR3res>),
    Rename(Reply<RENAME3res>),
    Link(Reply<LINK3res>),
    Readdir(Reply<READDIR3resok>),
    Readdirplus(Reply<READDIRPLUS3resok>),
    Fsstat(Reply<FSSTAT3resok>),
    Fsinfo(Reply<FSINFO3resok>),
    Pathconf(Reply<PATHCONF3resok>),
    Commit(Reply<COMMIT3resok>),
}

impl NfsRequest {
    pub fn procedure(&self) -> NFSProgram {
        match self {
            NfsRequest::Null => NFSProgram::NFSPROC3_NULL,
            NfsRequest::Getattr(_) => NFSProgram::NFSPROC3_GETATTR,
            NfsRequest::Setattr(_) => NFSProgram::NFSPROC3_SETATTR,
            NfsRequest::Lookup(_) => NFSProgram::NFSPROC3_LOOKUP,
            NfsRequest::Access(_) => NFSProgram::NFSPROC3_ACCESS,
            NfsRequest::Readlink(_) => NFSProgram::NFSPROC3_READLINK,
            NfsRequest::Read(_) => NFSProgram::NFSPROC3_READ,
            NfsRequest::Write(_) => NFSProgram::NFSPROC3_WRITE,
            NfsRequest::Create(_) => NFSProgram::NFSPROC3_CREATE,
            NfsRequest::Mkdir(_) => NFSProgram::NFSPROC3_MKDIR,
            NfsRequest::Symlink(_) => NFSProgram::NFSPROC3_SYMLINK,
            NfsRequest::Mknod(_) => NFSProgram::NFSPROC3_MKNOD,
            NfsRequest::Remove(_) => NFSProgram::NFSPROC3_REMOVE,
            NfsRequest::Rmdir(_) => NFSProgram::NFSPROC3_RMDIR,
            NfsRequest::Rename(_) => NFSProgram::NFSPROC3_RENAME,
            NfsRequest::Link(_) => NFSProgram::NFSPROC3_LINK,
            NfsRequest::Readdir(_) => NFSProgram::NFSPROC3_READDIR,
            NfsRequest::Readdirplus(_) => NFSProgram::NFSPROC3_READDIRPLUS,
            NfsRequest::Fsstat(_) => NFSProgram::NFSPROC3_FSSTAT,
            NfsRequest::Fsinfo(_) => NFSProgram::NFSPROC3_FSINFO,
            NfsRequest::Pathconf(_) => NFSProgram::NFSPROC3_PATHCONF,
            NfsRequest::Commit(_) => NFSProgram::NFSPROC3_COMMIT,
        }
    }
}

impl NfsResponse {
    pub fn status(&self) -> nfsstat3 {
        match self {
            NfsResponse::Null(r) => r.status,
            NfsResponse::Getattr(r) => r.status,
            NfsResponse::Setattr(r) => r.status,
            NfsResponse::Lookup(r) => r.status,
            NfsResponse::Access(r) => r.status,
            NfsResponse::Readlink(r) => r.status,
            NfsResponse::Read(r) => r.status,
            NfsResponse::Write(r) => r.status,
            NfsResponse::Create(r) | NfsResponse::Mkdir(r) | NfsResponse::Symlink(r) | NfsResponse::Mknod(r) => {
                r.status
            }
            NfsResponse::Remove(r) | NfsResponse::Rmdir(r) => r.status,
            NfsResponse::Rename(r) => r.status,
            NfsResponse::Link(r) => r.status,
            NfsResponse::Readdir(r) => r.status,
            NfsResponse::Readdirplus(r) => r.status,
            NfsResponse::Fsstat(r) => r.status,
            NfsResponse::Fsinfo(r) => r.status,
            NfsResponse::Pathconf(r) => r.status,
            NfsResponse::Commit(r) => r.status,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status() == nfsstat3::NFS3_OK
    }
}

pub async fn handle_nfs(request: NfsRequest, context: &RPCContext) -> NfsResponse {
    let procedure = request.procedure();
    debug!("{:?} from {}", procedure, context.client_addr);
    #[cfg(feature = "metrics")]
    crate::kernel::metrics::RPC_REQUESTS_TOTAL.inc();

    let response = match request {
        NfsRequest::Null => NfsResponse::Null(nfsproc3_null(context).await),
        NfsRequest::Getattr(args) => NfsResponse::Getattr(nfsproc3_getattr(args, context).await),
        NfsRequest::Setattr(args) => NfsResponse::Setattr(nfsproc3_setattr(args, context).await),
        NfsRequest::Lookup(args) => NfsResponse::Lookup(nfsproc3_lookup(args, context).await),
        NfsRequest::Access(args) => NfsResponse::Access(nfsproc3_access(args, context).await),
        NfsRequest::Readlink(args) => NfsResponse::Readlink(nfsproc3_readlink(args, context).await),
        NfsRequest::Read(args) => NfsResponse::Read(nfsproc3_read(args, context).await),
        NfsRequest::Write(args) => NfsResponse::Write(nfsproc3_write(args, context).await),
        NfsRequest::Create(args) => NfsResponse::Create(nfsproc3_create(args, context).await),
        NfsRequest::Mkdir(args) => NfsResponse::Mkdir(nfsproc3_mkdir(args, context).await),
        NfsRequest::Symlink(args) => NfsResponse::Symlink(nfsproc3_symlink(args, context).await),
        NfsRequest::Mknod(args) => NfsResponse::Mknod(nfsproc3_mknod(args, context).await),
        NfsRequest::Remove(args) => NfsResponse::Remove(nfsproc3_remove(args, context).await),
        NfsRequest::Rmdir(args) => NfsResponse::Rmdir(nfsproc3_rmdir(args, context).await),
        NfsRequest::Rename(args) => NfsResponse::Rename(nfsproc3_rename(args, context).await),
        NfsRequest::Link(args) => NfsResponse::Link(nfsproc3_link(args, context).await),
        NfsRequest::Readdir(args) => NfsResponse::Readdir(nfsproc3_readdir(args, context).await),
        NfsRequest::Readdirplus(args) => NfsResponse::Readdirplus(nfsproc3_readdirplus(args, context).await),
        NfsRequest::Fsstat(args) => NfsResponse::Fsstat(nfsproc3_fsstat(args, context).await),
        NfsRequest::Fsinfo(args) => NfsResponse::Fsinfo(nfsproc3_fsinfo(args, context).await),
        NfsRequest::Pathconf(args) => NfsResponse::Pathconf(nfsproc3_pathconf(args, context).await),
        NfsRequest::Commit(args) => NfsResponse::Commit(nfsproc3_commit(args, context).await),
    };

    if !response.is_ok() {
        debug!("{:?} -> {:?}", procedure, response.status());
        #[cfg(feature = "metrics")]
        crate::kernel::metrics::RPC_ERRORS_TOTAL.inc();
    }
    response
}
