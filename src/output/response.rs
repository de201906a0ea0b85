use serde::Serialize;
use std::io::{self, Write};

use sitewright::error::Hint;
use sitewright::{Error, ErrorCode, Result};

/// `{success, data}` on success, `{success, error}` on failure.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody<'a>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'static str,
    message: &'a str,
    details: &'a serde_json::Value,
    #[serde(skip_serializing_if = "no_hints")]
    hints: &'a [Hint],
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
}

fn no_hints(hints: &&[Hint]) -> bool {
    hints.is_empty()
}

impl<'a> Envelope<'a> {
    fn from_result(result: &'a Result<serde_json::Value>) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(err) => Self {
                success: false,
                data: None,
                error: Some(ErrorBody {
                    code: err.code.as_str(),
                    message: &err.message,
                    details: &err.details,
                    hints: &err.hints,
                    retryable: err.retryable,
                }),
            },
        }
    }
}

/// Serialize command output, keeping the exit code a failed command chose.
pub fn map_cmd_result_to_json<T: Serialize>(
    result: Result<(T, i32)>,
) -> (Result<serde_json::Value>, i32) {
    match result {
        Ok((data, exit_code)) => match serde_json::to_value(data) {
            Ok(value) => (Ok(value), exit_code),
            Err(err) => (
                Err(Error::internal_json(
                    err.to_string(),
                    Some("serialize command output".to_string()),
                )),
                1,
            ),
        },
        Err(err) => {
            let exit_code = exit_code_for_error(err.code);
            (Err(err), exit_code)
        }
    }
}

fn exit_code_for_error(code: ErrorCode) -> i32 {
    match code {
        ErrorCode::ConfigMissingKey
        | ErrorCode::ConfigInvalidToml
        | ErrorCode::ConfigInvalidValue
        | ErrorCode::ValidationInvalidArgument
        | ErrorCode::ValidationInvalidDomain
        | ErrorCode::DomainTaken
        | ErrorCode::DnsRecordExists => 2,

        ErrorCode::SiteNotFound => 4,

        ErrorCode::SiteInvalidState => 5,

        ErrorCode::SshIdentityInvalid | ErrorCode::SshConnectFailed => 10,

        ErrorCode::RemoteCommandFailed
        | ErrorCode::StepTimeout
        | ErrorCode::ProviderRequestFailed
        | ErrorCode::InstanceNotReady
        | ErrorCode::SiteVerificationFailed => 20,

        ErrorCode::StorageError
        | ErrorCode::CryptoError
        | ErrorCode::InternalIoError
        | ErrorCode::InternalJsonError
        | ErrorCode::InternalUnexpected => 1,
    }
}

pub fn print_json_result(result: Result<serde_json::Value>) -> Result<()> {
    let payload = serde_json::to_string_pretty(&Envelope::from_result(&result))
        .map_err(|e| Error::internal_json(e.to_string(), Some("serialize envelope".to_string())))?;

    let mut stdout = io::stdout().lock();
    match writeln!(stdout, "{}", payload) {
        Ok(()) => Ok(()),
        // Reader went away (`| head`).
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(Error::internal_io(e.to_string(), Some("write stdout".to_string()))),
    }
}
