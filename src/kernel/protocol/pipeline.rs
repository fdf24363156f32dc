//! Procedure pipelines.
//!
//! A procedure is an ordered list of stages run against one [`Call`]. Each
//! stage either lets the next one run, finishes the call successfully, or
//! aborts it with a protocol status. [`Pipeline::run`] is the only place a
//! [`Reply`] is produced, so a call is answered exactly once.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error};

use crate::fhdb::FileHandle;
use crate::kernel::api::mount::mountstat3;
use crate::kernel::api::nfs::nfsstat3;
use crate::kernel::fd_cache::OpenFile;
use crate::kernel::protocol::context::RPCContext;

/// Status codes a pipeline can end with.
pub trait ReplyStatus: Copy + Debug + PartialEq + Send + 'static {
    const OK: Self;
    const SERVER_FAULT: Self;
}

impl ReplyStatus for nfsstat3 {
    const OK: Self = nfsstat3::NFS3_OK;
    const SERVER_FAULT: Self = nfsstat3::NFS3ERR_SERVERFAULT;
}

impl ReplyStatus for mountstat3 {
    const OK: Self = mountstat3::MNT3_OK;
    const SERVER_FAULT: Self = mountstat3::MNT3ERR_SERVERFAULT;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run the next stage.
    Next,
    /// The reply body is complete; stop and answer success.
    Reply,
}

pub type StageResult<S = nfsstat3> = Result<Flow, S>;

pub type Stage<A, R, S = nfsstat3> = for<'a> fn(&'a mut Call<A>, &'a mut R) -> BoxFuture<'a, StageResult<S>>;

/// Final answer to a call. On failure `body` still carries whatever the
/// stages filled in (e.g. wcc data) for the encoder to use.
#[derive(Debug, Clone)]
pub struct Reply<R, S = nfsstat3> {
    pub status: S,
    pub body: R,
}

impl<R, S: ReplyStatus> Reply<R, S> {
    pub fn ok(body: R) -> Self {
        Reply { status: S::OK, body }
    }

    pub fn error(status: S, body: R) -> Self {
        Reply { status, body }
    }

    pub fn is_ok(&self) -> bool {
        self.status == S::OK
    }

    pub fn into_result(self) -> Result<R, S> {
        if self.is_ok() {
            Ok(self.body)
        } else {
            Err(self.status)
        }
    }
}

/// Per-call state: the decoded arguments, the injected services and the
/// fields stages derive along the way.
#[derive(Debug)]
pub struct Call<A> {
    pub args: A,
    pub context: RPCContext,
    /// Handle of the object the call acts on, once decoded.
    pub handle: Option<FileHandle>,
    pub path: Option<PathBuf>,
    pub dir_path: Option<PathBuf>,
    /// Second target of RENAME (destination) and LINK (new name).
    pub to_path: Option<PathBuf>,
    pub to_dir_path: Option<PathBuf>,
    pub open: Option<Arc<OpenFile>>,
}

fn derived<'a>(field: &'a Option<PathBuf>, name: &str) -> Result<&'a Path, nfsstat3> {
    field.as_deref().ok_or_else(|| {
        error!("stage ordering bug: {} read before it was resolved", name);
        nfsstat3::NFS3ERR_SERVERFAULT
    })
}

impl<A> Call<A> {
    pub fn new(args: A, context: &RPCContext) -> Call<A> {
        Call {
            args,
            context: context.clone(),
            handle: None,
            path: None,
            dir_path: None,
            to_path: None,
            to_dir_path: None,
            open: None,
        }
    }

    pub fn path(&self) -> Result<&Path, nfsstat3> {
        derived(&self.path, "path")
    }

    pub fn dir_path(&self) -> Result<&Path, nfsstat3> {
        derived(&self.dir_path, "dir_path")
    }

    pub fn to_path(&self) -> Result<&Path, nfsstat3> {
        derived(&self.to_path, "to_path")
    }

    pub fn to_dir_path(&self) -> Result<&Path, nfsstat3> {
        derived(&self.to_dir_path, "to_dir_path")
    }

    pub fn open_file(&self) -> Result<Arc<OpenFile>, nfsstat3> {
        self.open.clone().ok_or_else(|| {
            error!("stage ordering bug: descriptor used before it was opened");
            nfsstat3::NFS3ERR_SERVERFAULT
        })
    }
}

pub struct Pipeline<A, R, S = nfsstat3> {
    name: &'static str,
    stages: Vec<Stage<A, R, S>>,
}

impl<A, R, S> Pipeline<A, R, S>
where
    A: Send,
    R: Default + Send,
    S: ReplyStatus,
{
    pub fn new(name: &'static str) -> Self {
        Pipeline {
            name,
            stages: Vec::new(),
        }
    }

    pub fn then(mut self, stage: Stage<A, R, S>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn run(&self, call: &mut Call<A>) -> Reply<R, S> {
        let mut body = R::default();
        for (index, stage) in self.stages.iter().enumerate() {
            match stage(call, &mut body).await {
                Ok(Flow::Next) => continue,
                Ok(Flow::Reply) => {
                    debug!("{}: replied at stage {}", self.name, index);
                    return Reply::ok(body);
                }
                Err(status) => {
                    debug!("{}: stage {} failed with {:?}", self.name, index, status);
                    return Reply::error(status, body);
                }
            }
        }
        error!("{}: ran out of stages without replying", self.name);
        Reply::error(S::SERVER_FAULT, body)
    }
}
