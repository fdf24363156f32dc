//! Server settings, loaded from `config/settings.toml` and the environment.
//!
//! Every key has a default so an empty or missing file still yields a usable
//! configuration. Environment overrides use the `NFSGATE_` prefix with `__`
//! between path segments, e.g. `NFSGATE_NFS__FD_CACHE__TTL_SECS=30`.

use std::convert::TryFrom;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File as ConfigFile, FileFormat};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_SETTINGS_PATH: &str = "config/settings.toml";

// uid/gid of 'nobody' on most unix systems
const NOBODY: u32 = 65534;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub mount: MountSettings,
    pub nfs: NfsSettings,
    pub portmap: PortmapSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub module_filter: Vec<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: "info".to_string(),
            module_filter: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub location: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            location: PathBuf::from("/var/tmp/nfsgate"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MountSettings {
    pub address: String,
    pub port: u16,
    pub exports: Vec<PathBuf>,
    /// When present, only these addresses may mount or issue NFS calls.
    pub hosts_allow: Option<Vec<IpAddr>>,
    pub hosts_deny: Vec<IpAddr>,
}

impl Default for MountSettings {
    fn default() -> Self {
        MountSettings {
            address: "127.0.0.1".to_string(),
            port: 1892,
            exports: Vec::new(),
            hosts_allow: None,
            hosts_deny: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NfsSettings {
    pub port: u16,
    pub uid: u32,
    pub gid: u32,
    pub fd_cache: FdCacheSettings,
    pub symlinks: SymlinkSupport,
    pub access: AccessMode,
}

impl Default for NfsSettings {
    fn default() -> Self {
        NfsSettings {
            port: 2049,
            uid: NOBODY,
            gid: NOBODY,
            fd_cache: FdCacheSettings::default(),
            symlinks: SymlinkSupport::Supported,
            access: AccessMode::Permissive,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FdCacheSettings {
    pub max: usize,
    pub ttl_secs: u64,
}

impl FdCacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for FdCacheSettings {
    fn default() -> Self {
        FdCacheSettings {
            max: 10000,
            ttl_secs: 60,
        }
    }
}

/// Which SYMLINK procedure the server answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum SymlinkSupport {
    Supported,
    Unsupported,
}

impl TryFrom<String> for SymlinkSupport {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_ascii_lowercase().as_str() {
            "supported" | "true" => Ok(SymlinkSupport::Supported),
            "unsupported" | "false" => Ok(SymlinkSupport::Unsupported),
            other => Err(format!("unknown symlink mode '{}'", other)),
        }
    }
}

/// How ACCESS computes the granted bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum AccessMode {
    /// Grant everything asked for and let the filesystem refuse later.
    Permissive,
    /// Evaluate owner/other mode bits against the caller's uid.
    ModeBits,
}

impl TryFrom<String> for AccessMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_ascii_lowercase().as_str() {
            "permissive" => Ok(AccessMode::Permissive),
            "mode_bits" | "modebits" => Ok(AccessMode::ModeBits),
            other => Err(format!("unknown access mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortmapSettings {
    pub address: String,
    pub port: u16,
    pub mappings: Vec<MappingSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MappingSettings {
    pub name: String,
    pub prog: u32,
    pub vers: u32,
    pub prot: u32,
    pub port: u32,
}

impl Default for PortmapSettings {
    fn default() -> Self {
        let mapping = |name: &str, prog, vers, port| MappingSettings {
            name: name.to_string(),
            prog,
            vers,
            prot: 6,
            port,
        };
        PortmapSettings {
            address: "127.0.0.1".to_string(),
            port: 111,
            mappings: vec![
                mapping("mountd", 100005, 3, 1892),
                mapping("mountd", 100005, 1, 1892),
                mapping("nfsd", 100003, 3, 2049),
                mapping("portmapd", 100000, 2, 111),
            ],
        }
    }
}

impl Settings {
    /// Loads the settings file (missing is fine) and applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Settings, SettingsError> {
        let path = path.as_ref();
        let name = path.to_str().ok_or(SettingsError::Invalid {
            key: "path",
            reason: format!("{} is not valid unicode", path.display()),
        })?;

        let mut settings = Config::default();
        settings.merge(ConfigFile::with_name(name).required(false))?;
        settings.merge(Environment::with_prefix("NFSGATE").separator("__"))?;
        let settings: Settings = settings.try_into()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(contents: &str) -> Result<Settings, SettingsError> {
        let mut settings = Config::default();
        settings.merge(ConfigFile::from_str(contents, FileFormat::Toml))?;
        let settings: Settings = settings.try_into()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.nfs.fd_cache.max == 0 {
            return Err(SettingsError::Invalid {
                key: "nfs.fd_cache.max",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(export) = self.mount.exports.iter().find(|e| !e.is_absolute()) {
            return Err(SettingsError::Invalid {
                key: "mount.exports",
                reason: format!("{} is not an absolute path", export.display()),
            });
        }
        Ok(())
    }
}
