//! Bootstrap the configuration: fresh admin token, default allowlists, log directory.
//!
//! The gateway itself never writes the config; `devproxy init`, `devproxy serve` (first run)
//! and the desktop panel go through these helpers.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;

use crate::config::{self, Config};

/// Result of [`init_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Created,
    AlreadyExists,
}

const DEFAULT_COMMANDS: &[&str] = &[
    "go", "msbuild", "signtool", "powershell", "dotnet", "gcc", "g++", "make", "cmake", "npm",
    "node", "python", "pip", "cargo",
];

#[cfg(windows)]
const DEFAULT_PATHS: &[&str] = &[
    "C:\\Dev",
    "C:\\Users\\*\\Projects",
    "C:\\Users\\*\\source\\repos",
];

#[cfg(not(windows))]
const DEFAULT_PATHS: &[&str] = &["/home/*/projects", "/home/*/src", "/Users/*/Projects"];

/// 32 random bytes, hex-encoded (64 chars).
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes).map_err(|e| anyhow::anyhow!("getrandom: {}", e))?;
    let mut token = String::with_capacity(64);
    for b in bytes {
        let _ = write!(token, "{:02x}", b);
    }
    Ok(token)
}

/// Default config with a freshly generated token.
pub fn default_config() -> Result<Config> {
    Ok(Config {
        api_token: generate_token()?,
        allowed_commands: DEFAULT_COMMANDS.iter().map(|s| s.to_string()).collect(),
        allowed_paths: DEFAULT_PATHS.iter().map(|s| s.to_string()).collect(),
        ..Config::default()
    })
}

/// Write a default config at `config_path` unless one exists (or `force` is set),
/// and create the audit log directory.
pub fn init_config(config_path: &Path, force: bool) -> Result<InitOutcome> {
    if config_path.exists() && !force {
        log::debug!("config already exists at {}, skipping", config_path.display());
        return Ok(InitOutcome::AlreadyExists);
    }
    let config = default_config()?;
    config::save_config(&config, config_path)?;
    log::info!("created default config at {}", config_path.display());

    let log_path = config::resolve_log_path(&config, config_path);
    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
    }
    Ok(InitOutcome::Created)
}

/// Load the config, creating the default one first when the file is missing.
/// Returns the config and whether it was just created.
pub fn load_or_init(config_path: &Path) -> Result<(Config, bool)> {
    let outcome = init_config(config_path, false)?;
    let (config, _) = config::load_config(Some(config_path.to_path_buf()))?;
    Ok((config, outcome == InitOutcome::Created))
}

/// Replace the admin token in the config file and return the new token.
pub fn rotate_token(config_path: &Path) -> Result<String> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `devproxy init` first (config file not found: {})",
            config_path.display()
        );
    }
    let (mut config, _) = config::load_config(Some(config_path.to_path_buf()))?;
    config.api_token = generate_token()?;
    config::save_config(&config, config_path)?;
    log::info!("rotated admin token in {}", config_path.display());
    Ok(config.api_token)
}
