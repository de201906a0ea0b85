use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::site::{SiteId, SiteStatus};

/// Every stage either pipeline can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    ValidateDomain,
    LaunchInstance,
    PrepareFilesystem,
    CreateDatabase,
    InstallWordpress,
    ConfigureNginx,
    ReloadNginx,
    UpdateDns,
    VerifySite,
    RemoveNginx,
    DeleteFiles,
    DropDatabase,
    TerminateInstance,
    DeleteDns,
}

impl Step {
    pub const ALL: [Step; 14] = [
        Step::ValidateDomain,
        Step::LaunchInstance,
        Step::PrepareFilesystem,
        Step::CreateDatabase,
        Step::InstallWordpress,
        Step::ConfigureNginx,
        Step::ReloadNginx,
        Step::UpdateDns,
        Step::VerifySite,
        Step::RemoveNginx,
        Step::DeleteFiles,
        Step::DropDatabase,
        Step::TerminateInstance,
        Step::DeleteDns,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::ValidateDomain => "validate_domain",
            Step::LaunchInstance => "launch_instance",
            Step::PrepareFilesystem => "prepare_filesystem",
            Step::CreateDatabase => "create_database",
            Step::InstallWordpress => "install_wordpress",
            Step::ConfigureNginx => "configure_nginx",
            Step::ReloadNginx => "reload_nginx",
            Step::UpdateDns => "update_dns",
            Step::VerifySite => "verify_site",
            Step::RemoveNginx => "remove_nginx",
            Step::DeleteFiles => "delete_files",
            Step::DropDatabase => "drop_database",
            Step::TerminateInstance => "terminate_instance",
            Step::DeleteDns => "delete_dns",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Step::ValidateDomain => "Validate Domain",
            Step::LaunchInstance => "Launch Instance",
            Step::PrepareFilesystem => "Prepare Filesystem",
            Step::CreateDatabase => "Create Database",
            Step::InstallWordpress => "Install WordPress",
            Step::ConfigureNginx => "Configure Nginx",
            Step::ReloadNginx => "Reload Nginx",
            Step::UpdateDns => "Update DNS",
            Step::VerifySite => "Verify Site",
            Step::RemoveNginx => "Remove Nginx Config",
            Step::DeleteFiles => "Delete Files",
            Step::DropDatabase => "Drop Database",
            Step::TerminateInstance => "Terminate Instance",
            Step::DeleteDns => "Delete DNS Record",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Step::ALL
            .iter()
            .copied()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| {
                Error::storage(format!("unknown step '{}'", s), Some("step_logs".to_string()))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Pending => "pending",
            LogStatus::Running => "running",
            LogStatus::Completed => "completed",
            LogStatus::Failed => "failed",
        }
    }

    /// Rows only move forward: pending -> running -> completed | failed.
    pub fn can_transition_to(&self, next: LogStatus) -> bool {
        matches!(
            (self, next),
            (LogStatus::Pending, LogStatus::Running)
                | (LogStatus::Pending, LogStatus::Completed)
                | (LogStatus::Pending, LogStatus::Failed)
                | (LogStatus::Running, LogStatus::Completed)
                | (LogStatus::Running, LogStatus::Failed)
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, LogStatus::Completed | LogStatus::Failed)
    }
}

impl FromStr for LogStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(LogStatus::Pending),
            "running" => Ok(LogStatus::Running),
            "completed" => Ok(LogStatus::Completed),
            "failed" => Ok(LogStatus::Failed),
            other => Err(Error::storage(
                format!("unknown log status '{}'", other),
                Some("step_logs".to_string()),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepLog {
    pub id: i64,
    pub site_id: SiteId,
    pub step: Step,
    pub status: LogStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepLogView {
    pub id: i64,
    pub step: Step,
    pub step_display_name: &'static str,
    pub status: LogStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&StepLog> for StepLogView {
    fn from(log: &StepLog) -> Self {
        Self {
            id: log.id,
            step: log.step,
            step_display_name: log.step.display_name(),
            status: log.status,
            output: log.output.clone(),
            error: log.error.clone(),
            created_at: log.created_at,
        }
    }
}

/// Polling payload: current site status plus its logs in pipeline order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteLogsView {
    pub site_status: SiteStatus,
    pub logs: Vec<StepLogView>,
}

impl SiteLogsView {
    pub fn new(site_status: SiteStatus, logs: &[StepLog]) -> Self {
        Self {
            site_status,
            logs: logs.iter().map(StepLogView::from).collect(),
        }
    }
}
