use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::RegistryLimits;

/// Address value marking a server as this host.
pub const LOCAL_ADDRESS: &str = "local";

/// Top-level config, loaded from TOML.
///
/// Besides server settings it carries the users allowed to log in and the
/// inventory of servers, stacks and deployments that targets resolve
/// against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub stacks: Vec<StackEntry>,
    #[serde(default)]
    pub deployments: Vec<DeploymentEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// How long an upgraded socket may wait before sending its login.
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
    /// Command for terminals created without an explicit one.
    #[serde(default = "default_shell")]
    pub default_shell: String,
    /// Requests per second per peer IP on authenticated routes.
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub disable_terminals: bool,
    #[serde(default)]
    pub disable_container_terminals: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            login_timeout_secs: default_login_timeout_secs(),
            default_shell: default_shell(),
            rate_limit: None,
            disable_terminals: false,
            disable_container_terminals: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: Option<usize>,
    pub max_sessions_per_target: Option<usize>,
    /// Output history kept per terminal, in KiB.
    #[serde(default = "default_history_kb")]
    pub history_kb: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_sessions_per_target: None,
            history_kb: default_history_kb(),
        }
    }
}

/// A principal allowed to log in, by JWT or by API key pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub jwt: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// May open terminals and run commands.
    #[serde(default = "default_true")]
    pub terminal: bool,
    /// May bulk-delete terminals across servers.
    #[serde(default)]
    pub admin: bool,
}

/// A host terminals can run on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    /// `"local"` for this host, otherwise the base URL of a remote agent.
    #[serde(default = "default_address")]
    pub address: String,
    /// API key pair used to log in to a remote agent.
    pub key: Option<String>,
    pub secret: Option<String>,
}

impl ServerEntry {
    pub fn is_local(&self) -> bool {
        self.address == LOCAL_ADDRESS
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackEntry {
    pub id: String,
    pub server: String,
    /// Service name to container name.
    #[serde(default)]
    pub services: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEntry {
    pub id: String,
    pub server: String,
    /// Container name. Defaults to the deployment id.
    pub container: Option<String>,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8120))
}

fn default_login_timeout_secs() -> u64 {
    10
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_max_sessions() -> Option<usize> {
    Some(crate::session::SessionRegistry::DEFAULT_MAX_SESSIONS)
}

fn default_history_kb() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_address() -> String {
    LOCAL_ADDRESS.to_string()
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // Warn if the config file is world-readable (holds credentials).
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// `$XDG_CONFIG_HOME/termgate/config.toml` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("termgate").join("config.toml"))
    }

    /// Check cross references in the inventory and that every user can
    /// actually log in.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for server in &self.servers {
            if !ids.insert(server.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate server id '{}'", server.id)));
            }
            if !server.is_local() && (server.key.is_none() || server.secret.is_none()) {
                return Err(ConfigError::Invalid(format!(
                    "remote server '{}' needs both key and secret",
                    server.id
                )));
            }
        }
        for stack in &self.stacks {
            if !ids.contains(stack.server.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "stack '{}' references unknown server '{}'",
                    stack.id, stack.server
                )));
            }
        }
        for deployment in &self.deployments {
            if !ids.contains(deployment.server.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "deployment '{}' references unknown server '{}'",
                    deployment.id, deployment.server
                )));
            }
        }
        for user in &self.users {
            let has_keys = user.api_key.is_some() && user.api_secret.is_some();
            if user.jwt.is_none() && !has_keys {
                return Err(ConfigError::Invalid(format!(
                    "user '{}' has neither a jwt nor an api key pair",
                    user.name
                )));
            }
        }
        Ok(())
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.server.login_timeout_secs)
    }

    pub fn registry_limits(&self) -> RegistryLimits {
        RegistryLimits {
            max_sessions: self.registry.max_sessions,
            max_sessions_per_target: self.registry.max_sessions_per_target,
            history_capacity: self.registry.history_kb * 1024,
        }
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(detail) => write!(f, "Invalid config: {}", detail),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Check file permissions on a config file and warn if world-readable.
///
/// On Unix, checks `st_mode & 0o004` (world-readable bit). If set, logs a
/// warning because the config file holds credentials.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It contains credentials -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
