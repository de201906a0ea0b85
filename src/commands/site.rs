use clap::{Args, Subcommand};
use secrecy::SecretString;
use serde::Serialize;
use std::sync::Arc;

use sitewright::site::{SiteFilter, SiteView};
use sitewright::step_log::SiteLogsView;
use sitewright::{Dispatcher, NewSite, Provisioner, SiteId, SiteStatus};

use super::CmdResult;

#[derive(Args)]
pub struct SiteArgs {
    #[command(subcommand)]
    command: SiteCommand,
}

#[derive(Subcommand)]
enum SiteCommand {
    /// Register a new site (pending until provisioned)
    Create {
        /// Domain; local mode appends the development suffix when missing
        domain: String,
        #[arg(long, default_value = "admin")]
        admin_user: String,
        /// WordPress admin password (at least 12 characters)
        #[arg(long, env = "SITEWRIGHT_ADMIN_PASSWORD", hide_env_values = true)]
        admin_password: String,
        #[arg(long)]
        admin_email: String,
        /// Provision right away
        #[arg(long)]
        provision: bool,
    },
    /// List sites
    List {
        /// Only sites in this status
        #[arg(long)]
        status: Option<String>,
        /// Include destroyed sites
        #[arg(long)]
        all: bool,
    },
    /// Show one site
    Show { id: String },
    /// Show the step log of a site
    Logs { id: String },
    /// Run the provisioning pipeline
    Provision {
        #[arg(required_unless_present = "all_pending", conflicts_with = "all_pending")]
        id: Option<String>,
        /// Provision every pending site concurrently
        #[arg(long)]
        all_pending: bool,
    },
    /// Tear down everything a site allocated
    Destroy { id: String },
    /// Permanently delete a destroyed site and its logs
    Delete { id: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    id: SiteId,
    domain: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<SiteStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteOutput {
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    site: Option<SiteView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sites: Option<Vec<SiteView>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logs: Option<SiteLogsView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    runs: Option<Vec<RunSummary>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted: Option<bool>,
}

impl SiteOutput {
    fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            site: None,
            sites: None,
            logs: None,
            runs: None,
            warnings: Vec::new(),
            deleted: None,
        }
    }

    fn with_site(command: &str, site: &sitewright::Site) -> Self {
        let mut output = Self::new(command);
        output.site = Some(SiteView::from(site));
        output
    }
}

pub fn run(args: SiteArgs, global: &crate::commands::GlobalArgs) -> CmdResult<SiteOutput> {
    let provisioner = global.provisioner()?;

    match args.command {
        SiteCommand::Create {
            domain,
            admin_user,
            admin_password,
            admin_email,
            provision,
        } => create(
            &provisioner,
            NewSite {
                domain,
                admin_username: admin_user,
                admin_password: SecretString::from(admin_password),
                admin_email,
            },
            provision,
        ),
        SiteCommand::List { status, all } => list(&provisioner, status.as_deref(), all),
        SiteCommand::Show { id } => {
            let site = provisioner.get(id.parse()?)?;
            Ok((SiteOutput::with_site("site.show", &site), 0))
        }
        SiteCommand::Logs { id } => {
            let mut output = SiteOutput::new("site.logs");
            output.logs = Some(provisioner.logs(id.parse()?)?);
            Ok((output, 0))
        }
        SiteCommand::Provision { id, all_pending } => match id {
            Some(id) if !all_pending => {
                let site = provisioner.provision(id.parse()?)?;
                Ok((SiteOutput::with_site("site.provision", &site), 0))
            }
            _ => provision_all_pending(provisioner),
        },
        SiteCommand::Destroy { id } => {
            let outcome = provisioner.destroy(id.parse()?)?;
            let mut output = SiteOutput::with_site("site.destroy", &outcome.site);
            output.warnings = outcome.warnings;
            Ok((output, 0))
        }
        SiteCommand::Delete { id } => {
            provisioner.force_delete(id.parse()?)?;
            let mut output = SiteOutput::new("site.delete");
            output.deleted = Some(true);
            Ok((output, 0))
        }
    }
}

fn create(provisioner: &Provisioner, request: NewSite, provision: bool) -> CmdResult<SiteOutput> {
    let site = provisioner.create_site(request)?;
    if !provision {
        return Ok((SiteOutput::with_site("site.create", &site), 0));
    }
    let site = provisioner.provision(site.id)?;
    Ok((SiteOutput::with_site("site.create", &site), 0))
}

fn list(provisioner: &Provisioner, status: Option<&str>, all: bool) -> CmdResult<SiteOutput> {
    let filter = SiteFilter {
        status: status.map(str::parse).transpose()?,
        include_destroyed: all,
    };
    let sites = provisioner.list(&filter)?;
    let mut output = SiteOutput::new("site.list");
    output.sites = Some(sites.iter().map(SiteView::from).collect());
    Ok((output, 0))
}

fn provision_all_pending(provisioner: Provisioner) -> CmdResult<SiteOutput> {
    let pending = provisioner.list(&SiteFilter {
        status: Some(SiteStatus::Pending),
        include_destroyed: false,
    })?;
    let dispatcher = Dispatcher::new(Arc::new(provisioner));

    let mut handles = Vec::with_capacity(pending.len());
    for site in &pending {
        handles.push((site, dispatcher.spawn_provision(site.id)?));
    }

    let runs: Vec<RunSummary> = handles
        .into_iter()
        .map(|(site, handle)| match Dispatcher::join(handle) {
            Ok(done) => RunSummary {
                id: done.id,
                domain: done.domain,
                success: true,
                status: Some(done.status),
                error: None,
            },
            Err(err) => RunSummary {
                id: site.id,
                domain: site.domain.clone(),
                success: false,
                status: None,
                error: Some(err.message),
            },
        })
        .collect();

    let exit_code = if runs.iter().all(|r| r.success) { 0 } else { 20 };
    let mut output = SiteOutput::new("site.provision");
    output.runs = Some(runs);
    Ok((output, exit_code))
}
