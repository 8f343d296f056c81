//! Bridge configuration.
//!
//! Read from a JSON file (by default `~/.tweety/config.json`). Every field is
//! optional; absent fields take the defaults below. An explicit `null` for
//! `call_timeout_ms` disables the relay deadline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Defaults
// ============================================================================

/// Native messaging host registered by the terminal host installer.
pub const DEFAULT_NATIVE_HOST_NAME: &str = "com.github.pomdtr.tweety";

pub const DEFAULT_EXTENSION_ID: &str = "tweety";

/// How long a freshly opened port must survive before it counts as live.
pub const DEFAULT_CONNECT_GRACE_MS: u64 = 100;

/// Upper bound on the `initialize` round trip.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Deadline for a relayed UI call.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 60_000;

/// Deadline for `commands.run` triggered from a menu or shortcut.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

pub const DEFAULT_TERMINAL_PAGE: &str = "/term.html";

const CONFIG_DIR: &str = ".tweety";
const CONFIG_FILE: &str = "config.json";
const STORAGE_FILE: &str = "storage.json";

// ============================================================================
// BridgeConfig
// ============================================================================

/// Program (plus leading arguments) launched for the native host. The
/// caller origin is appended as the final argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Native messaging host name; lowercase alphanumerics, `_` and `.`.
    pub native_host_name: String,

    /// Process to launch when connecting through the process connector.
    pub host_command: Option<HostCommand>,

    pub extension_id: String,

    /// Sent as `version` in the `initialize` handshake.
    pub extension_version: String,

    pub connect_grace_ms: u64,
    pub handshake_timeout_ms: u64,
    pub call_timeout_ms: Option<u64>,
    pub command_timeout_ms: u64,

    /// Extension-local storage file. Defaults to `~/.tweety/storage.json`.
    pub storage_path: Option<PathBuf>,

    /// Extension page opened by `openInNewTab` / `openInNewWindow`.
    pub terminal_page: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            native_host_name: DEFAULT_NATIVE_HOST_NAME.to_string(),
            host_command: None,
            extension_id: DEFAULT_EXTENSION_ID.to_string(),
            extension_version: env!("CARGO_PKG_VERSION").to_string(),
            connect_grace_ms: DEFAULT_CONNECT_GRACE_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            call_timeout_ms: Some(DEFAULT_CALL_TIMEOUT_MS),
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            storage_path: None,
            terminal_page: DEFAULT_TERMINAL_PAGE.to_string(),
        }
    }
}

impl BridgeConfig {
    /// `~/.tweety/config.json`, when a home directory exists.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` (or the default path). A missing file yields defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file absent, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_host_name(&self.native_host_name) {
            return Err(ConfigError::InvalidValue {
                field: "native_host_name",
                reason: "must be lowercase alphanumerics, '_' or '.', without leading, trailing or doubled dots",
            });
        }
        if self.extension_id.is_empty()
            || !self.extension_id.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ConfigError::InvalidValue {
                field: "extension_id",
                reason: "must be non-empty ASCII alphanumerics",
            });
        }
        if self.connect_grace_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connect_grace_ms",
                reason: "must be > 0",
            });
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "handshake_timeout_ms",
                reason: "must be > 0",
            });
        }
        if self.call_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "call_timeout_ms",
                reason: "must be > 0 or null",
            });
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "command_timeout_ms",
                reason: "must be > 0",
            });
        }
        if !self.terminal_page.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "terminal_page",
                reason: "must be an absolute extension path",
            });
        }
        Ok(())
    }

    /// Origin passed to the native host on launch.
    #[must_use]
    pub fn origin(&self) -> String {
        format!("chrome-extension://{}/", self.extension_id)
    }

    #[must_use]
    pub fn storage_path(&self) -> Option<PathBuf> {
        self.storage_path.clone().or_else(|| {
            dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(STORAGE_FILE))
        })
    }

    #[must_use]
    pub const fn connect_grace(&self) -> Duration {
        Duration::from_millis(self.connect_grace_ms)
    }

    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn is_valid_host_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.')
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    /// A configuration field has an invalid value.
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { field, reason } => {
                write!(f, "bridge config: {field} {reason}")
            }
            Self::Read { path, source } => {
                write!(f, "bridge config: cannot read {}: {source}", path.display())
            }
            Self::Parse { path, source } => {
                write!(f, "bridge config: invalid JSON in {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidValue { .. } => None,
            Self::Read { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
        }
    }
}
