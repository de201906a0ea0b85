use clap::{Args, Subcommand};
use serde::Serialize;

use sitewright::SitewrightConfig;

use super::CmdResult;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Display the effective configuration (defaults + file + overrides)
    Show,
    /// Show the path to sitewright.toml
    Path,
}

#[derive(Debug, Serialize)]
pub struct ConfigOutput {
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<SitewrightConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns_enabled: Option<bool>,
    path: String,
    exists: bool,
}

pub fn run(args: ConfigArgs, global: &crate::commands::GlobalArgs) -> CmdResult<ConfigOutput> {
    let path = global.config_path()?;
    let exists = path.exists();
    let path = path.display().to_string();

    match args.command {
        ConfigCommand::Show => {
            let config = global.load_config()?;
            Ok((
                ConfigOutput {
                    command: "config.show".to_string(),
                    dns_enabled: Some(config.dns_enabled()),
                    config: Some(config.redacted()),
                    path,
                    exists,
                },
                0,
            ))
        }
        ConfigCommand::Path => Ok((
            ConfigOutput {
                command: "config.path".to_string(),
                config: None,
                dns_enabled: None,
                path,
                exists,
            },
            0,
        )),
    }
}
