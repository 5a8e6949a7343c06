use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::auth::SameDatabaseLogin;
use crate::replication::WriteConcern;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Member name used in logs and status replies
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Lines kept by the in-memory log served to `getLog`
    pub ram_log_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "warden".to_string(),
            host: "127.0.0.1".to_string(),
            port: 27017,
            ram_log_capacity: 1024,
        }
    }
}

/// Authentication and authorization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enforce authentication and authorization (default: true)
    pub enabled: bool,
    /// Allow local connections to create the first user (default: true)
    pub localhost_exception: bool,
    /// What happens when a second principal logs in on the same database
    pub same_database_login: SameDatabaseLogin,
    /// Certificate subject of this member; names sharing its O/OU/DC are
    /// cluster members and cannot be used as client identities.
    pub cluster_subject: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            localhost_exception: true,
            same_database_login: SameDatabaseLogin::Reject,
            cluster_subject: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Replica set name; `None` runs a standalone node
    pub set_name: Option<String>,
    /// Write concern for user and role management commands
    pub default_write_concern: WriteConcern,
    /// How long a write waits for acknowledgment (default: 5s)
    pub write_concern_timeout_ms: u64,
}

impl ReplicationConfig {
    pub fn write_concern_timeout(&self) -> Duration {
        Duration::from_millis(self.write_concern_timeout_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            set_name: None,
            default_write_concern: WriteConcern::Majority,
            write_concern_timeout_ms: 5_000,
        }
    }
}

/// Storage engine configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the WAL. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Whether to fsync after every write
    pub sync_on_write: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub auth: AuthConfig,
    pub replication: ReplicationConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load config from TOML file, with environment variable overrides.
    /// Falls back to defaults if file is not found. WARDEN_CONFIG env var overrides the path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        ConfigLoader::new().load(path)
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

/// Resolves configuration from file, CLI args, and environment variables.
struct ConfigLoader {
    args: Vec<String>,
}

impl ConfigLoader {
    fn new() -> Self {
        Self {
            args: env::args().collect(),
        }
    }

    fn load<P: AsRef<Path>>(&self, default_path: P) -> anyhow::Result<Config> {
        let mut cfg_path = self.resolve_config_path(default_path);

        // Allow WARDEN_CONFIG to fully override any arg/default
        if let Ok(env_path) = env::var("WARDEN_CONFIG") {
            cfg_path = PathBuf::from(env_path);
        }

        let mut cfg = match fs::read_to_string(&cfg_path) {
            Ok(s) => Config::from_toml_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e.into()),
        };
        Self::apply_overrides(&mut cfg, |key| env::var(key).ok());
        Ok(cfg)
    }

    /// Resolve config path from CLI args or default.
    fn resolve_config_path<P: AsRef<Path>>(&self, default_path: P) -> PathBuf {
        if let Some(p) = Self::find_config_arg(&self.args) {
            p
        } else {
            default_path.as_ref().to_path_buf()
        }
    }

    /// Find --config or -c flag in arguments.
    fn find_config_arg(args: &[String]) -> Option<PathBuf> {
        let mut iter = args.iter().peekable();
        while let Some(a) = iter.next() {
            if a.starts_with("--config=") || a.starts_with("-c=") {
                if let Some((_, val)) = a.split_once('=') {
                    return Some(PathBuf::from(val));
                }
            } else if (a == "--config" || a == "-c")
                && let Some(next) = iter.peek()
            {
                return Some(PathBuf::from((*next).clone()));
            }
        }
        None
    }

    /// Apply WARDEN_* overrides.
    fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("WARDEN_HOST") {
            cfg.node.host = v;
        }

        if let Some(v) = var("WARDEN_PORT")
            && let Ok(p) = v.parse::<u16>()
        {
            cfg.node.port = p;
        }

        if let Some(v) = var("WARDEN_DATA_DIR") {
            cfg.storage.data_dir = Some(PathBuf::from(v));
        }

        if let Some(v) = var("WARDEN_AUTH")
            && let Ok(enabled) = v.parse::<bool>()
        {
            cfg.auth.enabled = enabled;
        }

        if let Some(v) = var("WARDEN_WTIMEOUT_MS")
            && let Ok(ms) = v.parse::<u64>()
        {
            cfg.replication.write_concern_timeout_ms = ms;
        }
    }
}
