use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigMissingKey,
    ConfigInvalidToml,
    ConfigInvalidValue,

    ValidationInvalidArgument,
    ValidationInvalidDomain,

    SiteNotFound,
    SiteInvalidState,
    DomainTaken,
    DnsRecordExists,

    SshIdentityInvalid,
    SshConnectFailed,

    RemoteCommandFailed,
    StepTimeout,

    ProviderRequestFailed,
    InstanceNotReady,

    SiteVerificationFailed,

    StorageError,
    CryptoError,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingKey => "config.missing_key",
            ErrorCode::ConfigInvalidToml => "config.invalid_toml",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",

            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",
            ErrorCode::ValidationInvalidDomain => "validation.invalid_domain",

            ErrorCode::SiteNotFound => "site.not_found",
            ErrorCode::SiteInvalidState => "site.invalid_state",
            ErrorCode::DomainTaken => "domain.taken",
            ErrorCode::DnsRecordExists => "domain.dns_record_exists",

            ErrorCode::SshIdentityInvalid => "ssh.identity_invalid",
            ErrorCode::SshConnectFailed => "ssh.connect_failed",

            ErrorCode::RemoteCommandFailed => "remote.command_failed",
            ErrorCode::StepTimeout => "remote.step_timeout",

            ErrorCode::ProviderRequestFailed => "provider.request_failed",
            ErrorCode::InstanceNotReady => "provider.instance_not_ready",

            ErrorCode::SiteVerificationFailed => "site.verification_failed",

            ErrorCode::StorageError => "internal.storage_error",
            ErrorCode::CryptoError => "internal.crypto_error",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }

    /// Validation-class errors are raised before any side effect.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ErrorCode::ValidationInvalidArgument
                | ErrorCode::ValidationInvalidDomain
                | ErrorCode::DomainTaken
                | ErrorCode::DnsRecordExists
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidStateDetails {
    pub site_id: String,
    pub status: String,
    pub action: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandFailedDetails {
    pub context: String,
    pub exit_code: i32,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextualErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.clone(),
            id,
            tried,
        });

        Self::new(ErrorCode::ValidationInvalidArgument, problem, details)
    }

    pub fn invalid_domain(domain: impl Into<String>, problem: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ValidationInvalidDomain,
            problem,
            serde_json::json!({ "domain": domain.into() }),
        )
    }

    pub fn domain_taken(domain: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::DomainTaken,
            "Domain already exists in the system",
            serde_json::json!({ "domain": domain.into() }),
        )
        .with_hint("Destroy the existing site first, or choose another domain")
    }

    pub fn dns_record_exists(domain: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::DnsRecordExists,
            "DNS record already exists for this domain",
            serde_json::json!({ "domain": domain.into() }),
        )
    }

    pub fn site_not_found(id: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::SiteNotFound,
            "Site not found",
            serde_json::json!({ "id": id.into() }),
        )
        .with_hint("Run 'sitewright site list' to see known sites")
    }

    pub fn site_invalid_state(
        site_id: impl Into<String>,
        status: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        let action = action.into();
        let status = status.into();
        let message = format!("Cannot {} a site in '{}' status", action, status);
        let details = to_details(InvalidStateDetails {
            site_id: site_id.into(),
            status,
            action,
        });
        Self::new(ErrorCode::SiteInvalidState, message, details)
    }

    pub fn ssh_identity_invalid(problem: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::SshIdentityInvalid,
            problem,
            Value::Object(serde_json::Map::new()),
        )
    }

    pub fn ssh_connect_failed(host: impl Into<String>, output: impl Into<String>) -> Self {
        let host = host.into();
        Self::new(
            ErrorCode::SshConnectFailed,
            format!("Could not open SSH session to {}", host),
            serde_json::json!({ "host": host, "output": output.into() }),
        )
        .retryable(true)
    }

    /// A backend command exited non-zero. The message carries the captured
    /// output so it lands verbatim in the step log.
    pub fn remote_command_failed(details: RemoteCommandFailedDetails) -> Self {
        let message = if details.output.trim().is_empty() {
            format!("{} (exit code {})", details.context, details.exit_code)
        } else {
            format!("{}: {}", details.context, details.output.trim())
        };
        Self::new(ErrorCode::RemoteCommandFailed, message, to_details(details))
    }

    pub fn step_timeout(step: impl Into<String>, budget_secs: u64) -> Self {
        let step = step.into();
        Self::new(
            ErrorCode::StepTimeout,
            format!("Step '{}' exceeded its {}s time budget", step, budget_secs),
            serde_json::json!({ "step": step, "budgetSecs": budget_secs }),
        )
    }

    pub fn provider_request_failed(operation: impl Into<String>, error: impl Into<String>) -> Self {
        let operation = operation.into();
        let error = error.into();
        Self::new(
            ErrorCode::ProviderRequestFailed,
            format!("{}: {}", operation, error.trim()),
            serde_json::json!({ "operation": operation, "error": error }),
        )
    }

    pub fn instance_not_ready(instance_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let instance_id = instance_id.into();
        let reason = reason.into();
        Self::new(
            ErrorCode::InstanceNotReady,
            format!("{}: {}", reason, instance_id),
            serde_json::json!({ "instanceId": instance_id, "reason": reason }),
        )
    }

    pub fn site_verification_failed(
        url: impl Into<String>,
        problem: impl Into<String>,
        status: Option<u16>,
    ) -> Self {
        Self::new(
            ErrorCode::SiteVerificationFailed,
            problem,
            serde_json::json!({ "url": url.into(), "status": status }),
        )
    }

    pub fn storage(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(ContextualErrorDetails {
            error: error.into(),
            context,
        });
        Self::new(ErrorCode::StorageError, "Storage error", details)
    }

    pub fn crypto(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(ContextualErrorDetails {
            error: error.into(),
            context,
        });
        Self::new(ErrorCode::CryptoError, "Secret encryption error", details)
    }

    pub fn config_missing_key(key: impl Into<String>, path: Option<String>) -> Self {
        Self::new(
            ErrorCode::ConfigMissingKey,
            "Missing required configuration key",
            serde_json::json!({ "key": key.into(), "path": path }),
        )
    }

    pub fn config_invalid_toml(path: impl Into<String>, err: toml::de::Error) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidToml,
            "Invalid TOML in configuration",
            serde_json::json!({ "path": path.into(), "error": err.to_string() }),
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidValue,
            "Invalid configuration value",
            serde_json::json!({ "key": key.into(), "value": value, "problem": problem.into() }),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(ContextualErrorDetails {
            error: error.into(),
            context,
        });
        Self::new(ErrorCode::InternalIoError, "IO error", details)
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(ContextualErrorDetails {
            error: error.into(),
            context,
        });
        Self::new(ErrorCode::InternalJsonError, "JSON error", details)
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::InternalUnexpected,
            format!("Unexpected error: {}", error),
            serde_json::json!({ "error": error }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }
}
