//! Configuration types and loading.
//!
//! Config is loaded once from a JSON file (e.g. `~/.devproxy/config.json`) and environment,
//! then shared read-only for the lifetime of the gateway. The same file is edited by the
//! desktop panel and read by the relay client, so keys stay snake_case.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level gateway config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shared admin token, presented by callers in the `X-Admin-Token` header. Overridden by DEVPROXY_TOKEN env.
    #[serde(default)]
    pub api_token: String,

    /// Command base names that may be run (case-insensitive, executable suffix ignored).
    #[serde(default)]
    pub allowed_commands: Vec<String>,

    /// Working-directory patterns: literal absolute prefixes or patterns with a `*` segment.
    #[serde(default)]
    pub allowed_paths: Vec<String>,

    /// Substrings that reject a request when found anywhere in the joined command line.
    #[serde(default = "default_banned_keywords")]
    pub banned_keywords: Vec<String>,

    /// Optional per-command argument shape (allowed subcommands, argument count).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub command_rules: BTreeMap<String, CommandRule>,

    /// Audit log path. Relative paths are resolved against the config file's parent.
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Port for the HTTP endpoint (default 2223).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Kill commands still running after this many seconds. Absent = no deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_timeout_secs: Option<u64>,
}

/// Allow-only argument shape for one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRule {
    /// When set, the first argument must be one of these (e.g. "go" -> ["build", "test", "version"]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcommands: Option<Vec<String>>,

    /// When set, at most this many arguments are accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_args: Option<usize>,
}

fn default_banned_keywords() -> Vec<String> {
    [
        "shutdown",
        "reboot",
        "format",
        "mkfs",
        "diskpart",
        "bcdedit",
        "schtasks",
        "reg delete",
        "reg add",
        "sc delete",
        "sc stop",
        "net user",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("logs").join("audit.log")
}

fn default_port() -> u16 {
    2223
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            allowed_commands: Vec::new(),
            allowed_paths: Vec::new(),
            banned_keywords: default_banned_keywords(),
            command_rules: BTreeMap::new(),
            log_file: default_log_file(),
            port: default_port(),
            bind: default_bind(),
            exec_timeout_secs: None,
        }
    }
}

impl Config {
    /// Execution deadline, if configured. Zero is treated as no deadline.
    pub fn exec_timeout(&self) -> Option<Duration> {
        self.exec_timeout_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    /// Reject configs the gateway cannot safely serve with.
    pub fn validate(&self) -> Result<()> {
        if resolve_api_token(self).is_none() {
            anyhow::bail!("api_token is empty; run `devproxy init` or set DEVPROXY_TOKEN");
        }
        if self.port == 0 {
            anyhow::bail!("port must be non-zero");
        }
        Ok(())
    }
}

/// Resolve the admin token: env DEVPROXY_TOKEN overrides config. Empty values count as unset.
pub fn resolve_api_token(config: &Config) -> Option<String> {
    std::env::var("DEVPROXY_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            let t = config.api_token.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("DEVPROXY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".devproxy").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Directory holding the config file; relative paths in the config are resolved against it.
pub fn config_dir(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Resolve the audit log path: absolute `log_file` as is, otherwise under the config directory.
pub fn resolve_log_path(config: &Config, config_path: &Path) -> PathBuf {
    if config.log_file.is_absolute() {
        config.log_file.clone()
    } else {
        config_dir(config_path).join(&config.log_file)
    }
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Write config as pretty JSON, creating the parent directory. The file holds the
/// admin token, so on Unix it is restricted to the owner.
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    std::fs::create_dir_all(config_dir(path))
        .with_context(|| format!("creating config directory {}", config_dir(path).display()))?;
    let json = serde_json::to_string_pretty(config).context("serializing config")?;
    std::fs::write(path, json)
        .with_context(|| format!("writing config to {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting permissions on {}", path.display()))?;
    }
    Ok(())
}
