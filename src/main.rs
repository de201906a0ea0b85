use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::GlobalArgs;
use sitewright::Mode;

mod commands;
mod output;

use commands::{config, site};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "sitewright")]
#[command(version = VERSION)]
#[command(about = "Provision and destroy WordPress sites, locally or on EC2")]
struct Cli {
    /// Config file (default ~/.config/sitewright/sitewright.toml)
    #[arg(long, global = true, env = "SITEWRIGHT_CONFIG")]
    config: Option<PathBuf>,

    /// Site database (default ~/.config/sitewright/sitewright.db)
    #[arg(long, global = true, env = "SITEWRIGHT_DB")]
    db: Option<PathBuf>,

    /// Override the configured mode
    #[arg(long, global = true, env = "SITEWRIGHT_MODE", value_enum)]
    mode: Option<Mode>,

    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Create, provision, destroy and inspect sites
    #[command(visible_alias = "sites")]
    Site(site::SiteArgs),
    /// Inspect sitewright configuration
    Config(config::ConfigArgs),
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sitewright={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let global = GlobalArgs {
        config: cli.config,
        db: cli.db,
        mode: cli.mode,
    };

    let (json_result, exit_code) = commands::run_json(cli.command, &global);
    if let Err(err) = output::print_json_result(json_result) {
        eprintln!("{}", err.message);
        return std::process::ExitCode::from(1);
    }

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
