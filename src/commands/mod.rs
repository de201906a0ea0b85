use std::path::PathBuf;
use std::sync::Arc;

use sitewright::crypto::AgeCipher;
use sitewright::store::SqliteStore;
use sitewright::{paths, Mode, Provisioner, SitewrightConfig};

pub type CmdResult<T> = sitewright::Result<(T, i32)>;

pub mod config;
pub mod site;

/// Flags shared by every subcommand.
pub(crate) struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub db: Option<PathBuf>,
    pub mode: Option<Mode>,
}

impl GlobalArgs {
    pub fn config_path(&self) -> sitewright::Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => paths::config_file(),
        }
    }

    /// Config file plus the `--mode` override.
    pub fn load_config(&self) -> sitewright::Result<SitewrightConfig> {
        let mut config = SitewrightConfig::load(&self.config_path()?)?;
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        Ok(config)
    }

    pub fn provisioner(&self) -> sitewright::Result<Provisioner> {
        let config = self.load_config()?;
        let cipher = Arc::new(AgeCipher::open_default()?);
        let store = match &self.db {
            Some(path) => SqliteStore::open(path, cipher)?,
            None => SqliteStore::open_default(cipher)?,
        };
        Ok(Provisioner::with_store(config, Arc::new(store)))
    }
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (sitewright::Result<serde_json::Value>, i32) {
    match command {
        crate::Commands::Site(args) => crate::output::map_cmd_result_to_json(site::run(args, global)),
        crate::Commands::Config(args) => {
            crate::output::map_cmd_result_to_json(config::run(args, global))
        }
    }
}
