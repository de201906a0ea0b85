//! Linear step chains for provisioning and destruction.
//!
//! A chain is an ordered list of [`Stage`]s. Each stage gets one step log
//! row, created `running` right before it executes and finished with its
//! summary or error. [`run_strict`] stops at the first failure;
//! [`run_best_effort`] records failures as warnings and keeps going.

pub mod destroy;
pub mod provision;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SitewrightConfig;
use crate::engine::Infrastructure;
use crate::error::{Error, Result};
use crate::executor::ExecutionBackend;
use crate::provider::{DnsProvider, InstanceProvider, Poll};
use crate::site::{Site, SiteUpdate};
use crate::step_log::Step;
use crate::store::{LogHandle, SiteRegistry, StepLogStore};

/// Time budget of one running step.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    step: Step,
    budget: Duration,
    started: Instant,
}

impl Deadline {
    pub fn start(step: Step, budget: Duration) -> Self {
        Self {
            step,
            budget,
            started: Instant::now(),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    pub fn check(&self) -> Result<()> {
        if self.started.elapsed() >= self.budget {
            return Err(self.expired());
        }
        Ok(())
    }

    /// Sleep, unless the sleep would run past the budget.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        if duration >= self.remaining() {
            return Err(self.expired());
        }
        std::thread::sleep(duration);
        Ok(())
    }

    fn expired(&self) -> Error {
        Error::step_timeout(self.step.as_str(), self.budget.as_secs())
    }
}

/// What a running stage can see: configuration, the registry, the
/// infrastructure and the latest snapshot of its site.
pub struct StageContext<'a> {
    pub config: &'a SitewrightConfig,
    pub sites: &'a dyn SiteRegistry,
    pub infra: &'a dyn Infrastructure,
    pub site: Site,
    backend: Option<Arc<dyn ExecutionBackend>>,
}

impl<'a> StageContext<'a> {
    pub fn new(
        config: &'a SitewrightConfig,
        sites: &'a dyn SiteRegistry,
        infra: &'a dyn Infrastructure,
        site: Site,
    ) -> Self {
        Self {
            config,
            sites,
            infra,
            site,
            backend: None,
        }
    }

    /// Backend for the site, opened on first use and reused afterwards.
    /// Remote backends need the instance address, so the launch stage must
    /// have run before anything asks for one.
    pub fn backend(&mut self) -> Result<Arc<dyn ExecutionBackend>> {
        if let Some(backend) = &self.backend {
            return Ok(Arc::clone(backend));
        }
        let backend = self.infra.open_backend(&self.site)?;
        tracing::debug!(site_id = %self.site.id, backend = %backend.describe(), "Backend opened");
        self.backend = Some(Arc::clone(&backend));
        Ok(backend)
    }

    pub fn instances(&self) -> Result<&'a dyn InstanceProvider> {
        let infra: &'a dyn Infrastructure = self.infra;
        infra.instances().ok_or_else(|| {
            Error::config_invalid_value(
                "mode",
                Some(self.config.mode.as_str().to_string()),
                "instance management requires remote mode",
            )
        })
    }

    pub fn dns(&self) -> Result<&'a dyn DnsProvider> {
        let infra: &'a dyn Infrastructure = self.infra;
        infra.dns().ok_or_else(|| {
            Error::config_missing_key("dns.hosted_zone_id", None)
                .with_hint("Set dns.hosted_zone_id to manage DNS records")
        })
    }

    /// Persist fields and refresh the snapshot.
    pub fn update(&mut self, update: SiteUpdate) -> Result<()> {
        self.site = self.sites.update(self.site.id, update)?;
        Ok(())
    }

    pub fn require_root_path(&self) -> Result<String> {
        self.site.root_path.clone().ok_or_else(|| {
            Error::internal_unexpected(format!(
                "Site {} has no root path; the filesystem was never prepared",
                self.site.domain
            ))
        })
    }

    pub fn require_public_ip(&self) -> Result<String> {
        self.site.public_ip.clone().ok_or_else(|| {
            Error::internal_unexpected(format!("Site {} has no public address", self.site.domain))
        })
    }
}

/// Progress reporting and timing for the step being executed.
pub struct StepScope<'a> {
    logs: &'a dyn StepLogStore,
    log_id: i64,
    pub deadline: Deadline,
}

impl StepScope<'_> {
    /// Append a progress line to the running log row.
    pub fn note(&self, line: &str) {
        if let Err(err) = self.logs.append_output(self.log_id, line) {
            tracing::warn!(log_id = self.log_id, error = %err, "Failed to record progress");
        }
    }

    pub fn poll(&self, attempts: u32, delay: Duration) -> Poll {
        Poll::new(attempts, delay).within(self.deadline)
    }

    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.deadline.sleep(duration)
    }

    pub fn check(&self) -> Result<()> {
        self.deadline.check()
    }
}

/// One step of a chain.
pub trait Stage: Send + Sync {
    fn step(&self) -> Step;

    fn budget(&self, config: &SitewrightConfig) -> Duration {
        config.step_budget()
    }

    /// Do the work and return the summary stored on the log row.
    fn run(&self, ctx: &mut StageContext<'_>, scope: &StepScope<'_>) -> Result<String>;
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn execute_stage(
    stage: &dyn Stage,
    ctx: &mut StageContext<'_>,
    logs: &dyn StepLogStore,
    log_id: i64,
) -> Result<String> {
    let step = stage.step();
    let deadline = Deadline::start(step, stage.budget(ctx.config));
    let scope = StepScope {
        logs,
        log_id,
        deadline,
    };

    let summary = panic::catch_unwind(AssertUnwindSafe(|| stage.run(ctx, &scope)))
        .unwrap_or_else(|payload| {
            Err(Error::internal_unexpected(format!(
                "Step {} panicked: {}",
                step,
                panic_message(payload.as_ref())
            )))
        })?;

    deadline.check()?;
    Ok(summary)
}

/// Run stages in order, stopping at the first failure.
///
/// The failing stage's row is marked failed with the error message and the
/// error is returned; later stages get no row at all.
pub fn run_strict(
    ctx: &mut StageContext<'_>,
    logs: &dyn StepLogStore,
    stages: &[Box<dyn Stage>],
) -> Result<()> {
    for stage in stages {
        let step = stage.step();
        let log = LogHandle::start(logs, ctx.site.id, step)?;
        log_status!("provision", "{}: {}", ctx.site.domain, step.display_name());

        match execute_stage(stage.as_ref(), ctx, logs, log.id()) {
            Ok(summary) => log.mark_completed(&summary)?,
            Err(err) => {
                tracing::error!(
                    site_id = %ctx.site.id,
                    step = %step,
                    code = err.code.as_str(),
                    "{}",
                    err.message
                );
                if let Err(log_err) = log.mark_failed(&err.message) {
                    tracing::warn!(step = %step, error = %log_err, "Failed to record step failure");
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Run every stage regardless of failures.
///
/// Failures are recorded as completed rows carrying a non-critical warning.
/// Returns the warnings in stage order.
pub fn run_best_effort(
    ctx: &mut StageContext<'_>,
    logs: &dyn StepLogStore,
    stages: &[Box<dyn Stage>],
) -> Vec<String> {
    let mut warnings = Vec::new();

    for stage in stages {
        let step = stage.step();
        let log = match LogHandle::start(logs, ctx.site.id, step) {
            Ok(log) => log,
            Err(err) => {
                tracing::warn!(step = %step, error = %err, "Failed to record step start");
                warnings.push(format!("{} (non-critical): {}", step.display_name(), err.message));
                continue;
            }
        };
        log_status!("destroy", "{}: {}", ctx.site.domain, step.display_name());

        let text = match execute_stage(stage.as_ref(), ctx, logs, log.id()) {
            Ok(summary) => summary,
            Err(err) => {
                let warning = format!("{} (non-critical): {}", step.display_name(), err.message);
                tracing::warn!(site_id = %ctx.site.id, step = %step, "{}", warning);
                warnings.push(warning.clone());
                warning
            }
        };

        if let Err(err) = log.mark_completed(&text) {
            tracing::warn!(step = %step, error = %err, "Failed to record step completion");
        }
    }

    warnings
}
