//! Entry points that drive sites through their lifecycle.
//!
//! [`Provisioner`] owns the configuration, the stores and the
//! [`Infrastructure`] picked for the configured mode, and runs one chain per
//! call. [`Dispatcher`] runs those calls on background threads.

use chrono::Utc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{Mode, SitewrightConfig};
use crate::error::{Error, Result};
use crate::executor::{ExecutionBackend, LocalBackend, RemoteBackend};
use crate::pipeline::{self, StageContext};
use crate::probe::{HttpProbe, SiteProbe};
use crate::provider::{DnsProvider, Ec2Provider, InstanceProvider, Route53Dns};
use crate::site::{NewSite, Site, SiteFilter, SiteId, SiteStatus, SiteUpdate};
use crate::step_log::SiteLogsView;
use crate::store::{SiteRegistry, SqliteStore, StepLogStore};

/// Machines, cloud APIs and HTTP access a chain runs against.
pub trait Infrastructure: Send + Sync {
    /// Backend for commands on the machine serving `site`.
    fn open_backend(&self, site: &Site) -> Result<Arc<dyn ExecutionBackend>>;

    /// `None` in local mode.
    fn instances(&self) -> Option<&dyn InstanceProvider>;

    /// `None` unless DNS management is enabled.
    fn dns(&self) -> Option<&dyn DnsProvider>;

    fn probe(&self) -> &dyn SiteProbe;
}

/// Real infrastructure: local shell or EC2 over SSH, Route 53, reqwest.
pub struct LiveInfrastructure {
    config: SitewrightConfig,
    instances: Option<Ec2Provider>,
    dns: Option<Route53Dns>,
    probe: HttpProbe,
}

impl LiveInfrastructure {
    pub fn from_config(config: &SitewrightConfig) -> Self {
        let instances = (config.mode == Mode::Remote).then(|| Ec2Provider::new(config));
        let dns = config
            .dns_enabled()
            .then(|| Route53Dns::new(&config.aws.region, &config.dns.hosted_zone_id));
        Self {
            config: config.clone(),
            instances,
            dns,
            probe: HttpProbe::new(Duration::from_secs(config.timeouts.http_timeout_secs)),
        }
    }
}

impl Infrastructure for LiveInfrastructure {
    fn open_backend(&self, site: &Site) -> Result<Arc<dyn ExecutionBackend>> {
        match self.config.mode {
            Mode::Local => Ok(Arc::new(LocalBackend::new(self.config.database.clone()))),
            Mode::Remote => Ok(Arc::new(RemoteBackend::connect(site, &self.config)?)),
        }
    }

    fn instances(&self) -> Option<&dyn InstanceProvider> {
        self.instances.as_ref().map(|p| p as &dyn InstanceProvider)
    }

    fn dns(&self) -> Option<&dyn DnsProvider> {
        self.dns.as_ref().map(|d| d as &dyn DnsProvider)
    }

    fn probe(&self) -> &dyn SiteProbe {
        &self.probe
    }
}

/// Result of a destruction run. Warnings are the non-critical failures
/// also recorded in the step log.
#[derive(Debug, Clone)]
pub struct DestroyOutcome {
    pub site: Site,
    pub warnings: Vec<String>,
}

pub struct Provisioner {
    config: SitewrightConfig,
    sites: Arc<dyn SiteRegistry>,
    logs: Arc<dyn StepLogStore>,
    infra: Arc<dyn Infrastructure>,
}

impl Provisioner {
    pub fn new(
        config: SitewrightConfig,
        sites: Arc<dyn SiteRegistry>,
        logs: Arc<dyn StepLogStore>,
        infra: Arc<dyn Infrastructure>,
    ) -> Self {
        Self {
            config,
            sites,
            logs,
            infra,
        }
    }

    /// Provisioner over one SQLite store and the real infrastructure.
    pub fn with_store(config: SitewrightConfig, store: Arc<SqliteStore>) -> Self {
        let infra = Arc::new(LiveInfrastructure::from_config(&config));
        Self::new(config, store.clone(), store, infra)
    }

    pub fn config(&self) -> &SitewrightConfig {
        &self.config
    }

    /// Validate a request and register the site as `pending`.
    ///
    /// Rejects domains already held by a non-destroyed site. Requests that
    /// race past this check are settled by the claim in `ValidateDomain`.
    pub fn create_site(&self, request: NewSite) -> Result<Site> {
        let request = request.validated(&self.config)?;
        if self.sites.domain_in_use(&request.domain)? {
            return Err(Error::domain_taken(&request.domain));
        }
        let site = self.sites.create(request)?;
        log_status!("site", "Registered {} ({})", site.domain, site.id);
        Ok(site)
    }

    pub fn get(&self, id: SiteId) -> Result<Site> {
        self.sites.get(id)
    }

    pub fn list(&self, filter: &SiteFilter) -> Result<Vec<Site>> {
        self.sites.list(filter)
    }

    pub fn logs(&self, id: SiteId) -> Result<SiteLogsView> {
        let site = self.sites.get(id)?;
        let logs = self.logs.list_for_site(id)?;
        Ok(SiteLogsView::new(site.status, &logs))
    }

    /// Run the provisioning chain for a pending site.
    ///
    /// Ends `live` with `provisioned_at` set, or `failed` with the error of
    /// the stage that stopped the chain.
    pub fn provision(&self, id: SiteId) -> Result<Site> {
        let site = self.sites.get(id)?;
        if site.status != SiteStatus::Pending {
            return Err(Error::site_invalid_state(
                id.to_string(),
                site.status.as_str(),
                "provision",
            ));
        }

        let site = self.sites.update(id, SiteUpdate::status(SiteStatus::Provisioning))?;
        tracing::info!(site_id = %id, domain = %site.domain, mode = self.config.mode.as_str(), "Provisioning started");

        let outcome = {
            let mut ctx = StageContext::new(&self.config, self.sites.as_ref(), self.infra.as_ref(), site);
            pipeline::run_strict(&mut ctx, self.logs.as_ref(), &pipeline::provision::stages(&self.config))
        };

        let finished = outcome.and_then(|()| {
            self.sites.update(
                id,
                SiteUpdate {
                    status: Some(SiteStatus::Live),
                    provisioned_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
        });

        match finished {
            Ok(site) => {
                log_status!("provision", "{} is live at {}", site.domain, site.url());
                Ok(site)
            }
            Err(err) => {
                self.mark_failed(id);
                Err(err)
            }
        }
    }

    fn mark_failed(&self, id: SiteId) {
        if let Err(err) = self.sites.update(id, SiteUpdate::status(SiteStatus::Failed)) {
            tracing::error!(site_id = %id, error = %err, "Failed to mark site as failed");
        }
    }

    /// Run the destruction chain. Always ends `destroyed` once started.
    pub fn destroy(&self, id: SiteId) -> Result<DestroyOutcome> {
        let site = self.sites.get(id)?;
        if !site.status.can_destroy() {
            return Err(Error::site_invalid_state(
                id.to_string(),
                site.status.as_str(),
                "destroy",
            ));
        }
        tracing::info!(site_id = %id, domain = %site.domain, "Destruction started");

        let warnings = {
            let mut ctx = StageContext::new(&self.config, self.sites.as_ref(), self.infra.as_ref(), site);
            pipeline::run_best_effort(&mut ctx, self.logs.as_ref(), &pipeline::destroy::stages(&self.config))
        };

        let site = self.sites.update(
            id,
            SiteUpdate {
                status: Some(SiteStatus::Destroyed),
                destroyed_at: Some(Utc::now()),
                ..Default::default()
            },
        )?;
        log_status!(
            "destroy",
            "{} destroyed ({} warning(s))",
            site.domain,
            warnings.len()
        );

        Ok(DestroyOutcome { site, warnings })
    }

    /// Remove a destroyed site and its step logs permanently.
    pub fn force_delete(&self, id: SiteId) -> Result<()> {
        let site = self.sites.get(id)?;
        if site.status != SiteStatus::Destroyed {
            return Err(Error::site_invalid_state(
                id.to_string(),
                site.status.as_str(),
                "permanently delete",
            )
            .with_hint("Destroy the site first"));
        }
        self.sites.delete(id)?;
        log_status!("site", "Deleted {} ({})", site.domain, id);
        Ok(())
    }
}

/// Runs provisioner calls on their own threads, one thread per site run.
#[derive(Clone)]
pub struct Dispatcher {
    provisioner: Arc<Provisioner>,
}

impl Dispatcher {
    pub fn new(provisioner: Arc<Provisioner>) -> Self {
        Self { provisioner }
    }

    pub fn spawn_provision(&self, id: SiteId) -> Result<JoinHandle<Result<Site>>> {
        let provisioner = Arc::clone(&self.provisioner);
        spawn(format!("provision-{}", id), move || provisioner.provision(id))
    }

    pub fn spawn_destroy(&self, id: SiteId) -> Result<JoinHandle<Result<DestroyOutcome>>> {
        let provisioner = Arc::clone(&self.provisioner);
        spawn(format!("destroy-{}", id), move || provisioner.destroy(id))
    }

    /// Wait for a run. A panicked thread becomes an internal error.
    pub fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
        handle
            .join()
            .map_err(|_| Error::internal_unexpected("Site run thread panicked"))?
    }
}

fn spawn<T, F>(name: String, run: F) -> Result<JoinHandle<Result<T>>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(run)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("spawn {}", name))))
}
