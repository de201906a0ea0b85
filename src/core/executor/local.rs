use std::io::Write;

use super::{CommandResult, ExecutionBackend};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::ssh::execute_local_command;
use crate::utils::shell;

/// Runs everything on this machine through `sh -c`.
pub struct LocalBackend {
    database: DatabaseConfig,
}

impl LocalBackend {
    pub fn new(database: DatabaseConfig) -> Self {
        Self { database }
    }

    fn password_auth_command(&self, sql: &str) -> String {
        // A bare `-p` would prompt on the terminal.
        let password = if self.database.root_password.is_empty() {
            String::new()
        } else {
            format!(" -p{}", shell::quote_path(&self.database.root_password))
        };
        format!(
            "mysql -h {} -u {}{} -e {}",
            shell::quote_path(&self.database.host),
            shell::quote_path(&self.database.root_user),
            password,
            shell::quote_path(sql)
        )
    }
}

/// Password auth failed in a way socket auth may fix.
fn wants_socket_fallback(result: &CommandResult) -> bool {
    !result.success
        && (result.output.contains("Access denied") || result.output.contains("Can't connect"))
}

impl ExecutionBackend for LocalBackend {
    fn describe(&self) -> String {
        "local".to_string()
    }

    fn execute(&self, command: &str) -> Result<CommandResult> {
        tracing::debug!(command, "local exec");
        Ok(execute_local_command(command).into())
    }

    fn run_database_statement(&self, sql: &str) -> Result<CommandResult> {
        let result = self.execute(&self.password_auth_command(sql))?;
        if !wants_socket_fallback(&result) {
            return Ok(result);
        }

        log_status!("mysql", "Password login refused, retrying with socket auth");
        self.execute(&format!("sudo mysql -e {}", shell::quote_path(sql)))
    }

    /// Write to a private temp file, then move it into place as root.
    fn upload_content(&self, content: &[u8], path: &str) -> Result<bool> {
        let mut staged = tempfile::Builder::new()
            .prefix("sitewright-")
            .tempfile()
            .map_err(|e| Error::internal_io(e.to_string(), Some("create temp file".to_string())))?;
        staged
            .write_all(content)
            .and_then(|_| staged.flush())
            .map_err(|e| Error::internal_io(e.to_string(), Some("write temp file".to_string())))?;

        let staged = staged
            .into_temp_path()
            .keep()
            .map_err(|e| Error::internal_io(e.to_string(), Some("keep temp file".to_string())))?;
        let staged_path = staged.display().to_string();

        let results = self.execute_sequence(&[
            format!("sudo chown root:root {}", shell::quote_path(&staged_path)),
            format!("sudo chmod 644 {}", shell::quote_path(&staged_path)),
            format!(
                "sudo mv {} {}",
                shell::quote_path(&staged_path),
                shell::quote_path(path)
            ),
        ])?;

        let landed = results.len() == 3 && results.iter().all(|r| r.success);
        if !landed {
            let _ = self.execute(&format!("sudo rm -f {}", shell::quote_path(&staged_path)));
            if let Some(failed) = super::first_failure(&results) {
                tracing::warn!(path, output = %failed.output, "Failed to install file");
            }
        }
        Ok(landed)
    }
}
