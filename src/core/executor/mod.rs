//! Command execution against the machine that hosts a site.
//!
//! [`ExecutionBackend`] is the one seam the pipelines talk to. [`LocalBackend`]
//! runs shell commands on this machine; [`RemoteBackend`] runs them over a
//! lazily opened SSH session to the site's instance.

mod local;
mod remote;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

use serde::Serialize;

use crate::error::{Error, RemoteCommandFailedDetails, Result};
use crate::ssh::CommandOutput;
use crate::utils::shell;

/// Outcome of one executed command. A non-zero exit is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub output: String,
    pub exit_code: i32,
    pub success: bool,
}

impl CommandResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: 0,
            success: true,
        }
    }

    pub fn failed(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code,
            success: false,
        }
    }

    /// Turn a failed result into `remote.command_failed` with `context` as prefix.
    pub fn check(self, context: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::remote_command_failed(RemoteCommandFailedDetails {
                context: context.to_string(),
                exit_code: self.exit_code,
                output: self.output,
                host: None,
            }))
        }
    }
}

impl From<CommandOutput> for CommandResult {
    fn from(output: CommandOutput) -> Self {
        Self {
            output: output.combined(),
            exit_code: output.exit_code,
            success: output.success,
        }
    }
}

/// Run commands and move files on the machine serving a site.
///
/// Only `execute`, `run_database_statement` and `upload_content` differ
/// between machines; everything else is built on `execute`.
pub trait ExecutionBackend: Send + Sync {
    /// Short label for logs (`local`, `ec2-user@203.0.113.7`).
    fn describe(&self) -> String;

    fn execute(&self, command: &str) -> Result<CommandResult>;

    /// Run one SQL statement with database superuser rights.
    fn run_database_statement(&self, sql: &str) -> Result<CommandResult>;

    /// Write `content` to `path`. Returns false when the write did not land.
    fn upload_content(&self, content: &[u8], path: &str) -> Result<bool>;

    fn execute_elevated(&self, command: &str) -> Result<CommandResult> {
        self.execute(&format!("sudo {}", command))
    }

    /// Run commands in order; stops after the first failure.
    fn execute_sequence(&self, commands: &[String]) -> Result<Vec<CommandResult>> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            let result = self.execute(command)?;
            let failed = !result.success;
            results.push(result);
            if failed {
                break;
            }
        }
        Ok(results)
    }

    /// mkdir, chown, chmod; stops after the first failure.
    fn create_directory(&self, path: &str, owner: &str, mode: &str) -> Result<Vec<CommandResult>> {
        let path = shell::quote_path(path);
        self.execute_sequence(&[
            format!("sudo mkdir -p {}", path),
            format!("sudo chown {} {}", shell::quote_arg(owner), path),
            format!("sudo chmod {} {}", shell::quote_arg(mode), path),
        ])
    }

    fn delete_directory(&self, path: &str) -> Result<CommandResult> {
        ensure_deletable(path)?;
        self.execute_elevated(&format!("rm -rf {}", shell::quote_path(path)))
    }

    fn delete_file(&self, path: &str) -> Result<CommandResult> {
        ensure_deletable(path)?;
        self.execute_elevated(&format!("rm -f {}", shell::quote_path(path)))
    }

    fn test_webserver_config(&self) -> Result<CommandResult> {
        self.execute_elevated("nginx -t")
    }

    fn reload_webserver(&self) -> Result<CommandResult> {
        self.execute_elevated("systemctl reload nginx")
    }

    fn webserver_status(&self) -> Result<CommandResult> {
        self.execute_elevated("systemctl is-active nginx")
    }
}

/// Refuse recursive deletes of `/` or top-level directories.
fn ensure_deletable(path: &str) -> Result<()> {
    let depth = path.split('/').filter(|part| !part.is_empty()).count();
    if !path.starts_with('/') || depth < 2 || path.split('/').any(|part| part == "..") {
        return Err(Error::validation_invalid_argument(
            "path",
            format!("Refusing to delete '{}'", path),
            None,
            None,
        ));
    }
    Ok(())
}

/// First failed result of a sequence, or `None` when every command succeeded.
pub fn first_failure(results: &[CommandResult]) -> Option<&CommandResult> {
    results.iter().find(|r| !r.success)
}
