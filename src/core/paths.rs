use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;

/// Base sitewright config directory (~/.config/sitewright/)
pub fn sitewright() -> Result<PathBuf> {
    let home = env::var("HOME").map_err(|_| {
        Error::internal_unexpected("HOME environment variable not set".to_string())
    })?;
    Ok(PathBuf::from(home).join(".config").join("sitewright"))
}

/// Global sitewright.toml config file path
pub fn config_file() -> Result<PathBuf> {
    Ok(sitewright()?.join("sitewright.toml"))
}

/// Site registry database
pub fn database() -> Result<PathBuf> {
    Ok(sitewright()?.join("sitewright.db"))
}

/// age identity used to encrypt secrets at rest
pub fn identity() -> Result<PathBuf> {
    Ok(sitewright()?.join("identity.txt"))
}

/// Directory holding per-site SSH private keys while a session is open
pub fn keys() -> Result<PathBuf> {
    Ok(sitewright()?.join("keys"))
}

/// Expand `~` in a configured path.
pub fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}
