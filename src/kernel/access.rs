//! Client address gating and export containment.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

/// Allow and deny lists of client addresses. A deny entry always wins;
/// an allow list, when configured, admits only its members.
#[derive(Debug, Clone, Default)]
pub struct HostAccess {
    allow: Option<HashSet<IpAddr>>,
    deny: HashSet<IpAddr>,
}

fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    }
}

impl HostAccess {
    pub fn new(allow: Option<Vec<IpAddr>>, deny: Vec<IpAddr>) -> HostAccess {
        HostAccess {
            allow: allow.map(|hosts| hosts.into_iter().map(canonical).collect()),
            deny: deny.into_iter().map(canonical).collect(),
        }
    }

    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        let addr = canonical(addr);
        if self.deny.contains(&addr) {
            return false;
        }
        match &self.allow {
            Some(allow) => allow.contains(&addr),
            None => true,
        }
    }
}

/// Lexically normalizes an absolute path: `.` is dropped, `..` pops one
/// component (never above the root) and repeated separators collapse.
pub fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(name) => normalized.push(name),
        }
    }
    normalized
}

/// The directory trees clients may mount. No exports means everything.
#[derive(Debug, Clone, Default)]
pub struct Exports {
    roots: Vec<PathBuf>,
}

impl Exports {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Exports {
        Exports {
            roots: roots.into_iter().map(|root| normalize(&root)).collect(),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// True when `path` is an export root or lies beneath one.
    pub fn permits(&self, path: &Path) -> bool {
        self.roots.is_empty() || self.roots.iter().any(|root| path.starts_with(root))
    }

    pub fn is_root(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| root == path)
    }
}
