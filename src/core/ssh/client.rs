use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::utils::shell;

pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
}

impl CommandOutput {
    pub(crate) fn spawn_failure(context: &str, err: impl std::fmt::Display) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("{}: {}", context, err),
            success: false,
            exit_code: -1,
        }
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim_end();
        let stderr = self.stderr.trim_end();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_string(),
            (false, true) => stdout.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }
}

impl From<std::io::Result<std::process::Output>> for CommandOutput {
    fn from(output: std::io::Result<std::process::Output>) -> Self {
        match output {
            Ok(out) => CommandOutput {
                stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
                success: out.status.success(),
                exit_code: out.status.code().unwrap_or(-1),
            },
            Err(e) => CommandOutput::spawn_failure("Command error", e),
        }
    }
}

/// Connection parameters for one instance.
#[derive(Debug, Clone)]
pub struct SshClient {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: PathBuf,
    pub connect_timeout: Duration,
    control_path: PathBuf,
}

impl SshClient {
    pub fn new(host: &str, user: &str, port: u16, identity_file: &Path) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            port,
            identity_file: identity_file.to_path_buf(),
            connect_timeout: Duration::from_secs(10),
            control_path: control_path_for(host, user, port, identity_file),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.identity_file.display().to_string(),
        ];

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        // Fresh instances have unknown host keys; never prompt.
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
        ]);

        args
    }

    /// Start the multiplexing master in the background.
    fn open_master(&self) -> CommandOutput {
        let mut args = self.base_args();
        args.extend([
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-N".to_string(),
            "-f".to_string(),
            self.target(),
        ]);
        Command::new("ssh").args(&args).output().into()
    }

    fn close_master(&self) -> CommandOutput {
        let mut args = self.base_args();
        args.extend(["-O".to_string(), "exit".to_string(), self.target()]);
        Command::new("ssh").args(&args).output().into()
    }

    fn execute_with_retry(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        max_attempts: u32,
    ) -> CommandOutput {
        let backoff_secs = [0, 2, 5];

        let mut attempt = 0;
        loop {
            let result = self.execute_once(command, stdin);
            attempt += 1;

            // Only retry on transient connection errors, not command failures
            if result.success || attempt >= max_attempts || !is_transient_ssh_error(&result) {
                return result;
            }

            let delay = backoff_secs.get(attempt as usize).copied().unwrap_or(5);
            log_status!(
                "ssh",
                "Connection to {} failed (attempt {}/{}), retrying in {}s...",
                self.host,
                attempt,
                max_attempts,
                delay
            );
            std::thread::sleep(Duration::from_secs(delay));
        }
    }

    fn execute_once(&self, command: &str, stdin: Option<&[u8]>) -> CommandOutput {
        let mut args = self.base_args();
        args.extend([
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            self.target(),
            command.to_string(),
        ]);

        let mut cmd = Command::new("ssh");
        cmd.args(&args);

        let Some(bytes) = stdin else {
            return cmd.stdin(Stdio::null()).output().into();
        };

        let mut child = match cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return CommandOutput::spawn_failure("SSH error", e),
        };

        if let Some(mut pipe) = child.stdin.take() {
            if let Err(e) = pipe.write_all(bytes) {
                abort_child(&mut child);
                return CommandOutput::spawn_failure("Failed to stream upload", e);
            }
        }

        child.wait_with_output().into()
    }
}

/// A lazily opened, serialised SSH session.
///
/// The first command opens an OpenSSH control master; later commands reuse
/// it one at a time. Dropping the session closes the master.
pub struct SshSession {
    client: SshClient,
    open: Mutex<bool>,
}

impl SshSession {
    pub fn new(client: SshClient) -> Self {
        Self {
            client,
            open: Mutex::new(false),
        }
    }

    pub fn client(&self) -> &SshClient {
        &self.client
    }

    pub fn execute(&self, command: &str) -> Result<CommandOutput> {
        self.run(command, None)
    }

    /// Stream `content` into `remote_path` over the session.
    pub fn upload(&self, content: &[u8], remote_path: &str) -> Result<CommandOutput> {
        let command = format!("cat > {}", shell::quote_path(remote_path));
        self.run(&command, Some(content))
    }

    fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let mut open = self
            .open
            .lock()
            .map_err(|_| Error::internal_unexpected("SSH session lock poisoned"))?;

        if !*open {
            let result = self.client.open_master();
            if !result.success {
                return Err(Error::ssh_connect_failed(
                    self.client.target(),
                    result.combined(),
                ));
            }
            tracing::debug!(host = %self.client.host, "SSH session opened");
            *open = true;
        }

        tracing::debug!(host = %self.client.host, command, "ssh exec");
        Ok(self.client.execute_with_retry(command, stdin, 3))
    }

    pub fn close(&self) {
        let Ok(mut open) = self.open.lock() else {
            return;
        };
        if *open {
            let result = self.client.close_master();
            if !result.success {
                tracing::warn!(
                    host = %self.client.host,
                    output = %result.combined(),
                    "Failed to close SSH session"
                );
            }
            *open = false;
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Kill a child and reap it so it does not linger as a zombie.
fn abort_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::debug!(error = %e, "ssh child already exited");
    }
    if let Err(e) = child.wait() {
        tracing::warn!(error = %e, "Failed to reap ssh child");
    }
}

pub fn execute_local_command(command: &str) -> CommandOutput {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", command]);
    cmd.stdin(Stdio::null());
    cmd.output().into()
}

/// Short socket path: unix socket paths are limited to ~104 bytes.
fn control_path_for(host: &str, user: &str, port: u16, identity: &Path) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}@{}:{}:{}", user, host, port, identity.display()));
    let digest = hasher.finalize();
    let short: String = digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect();
    std::env::temp_dir().join(format!("sw-{}.sock", short))
}

/// Check if an SSH failure is a transient connection error worth retrying.
fn is_transient_ssh_error(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    // SSH exit code 255 = connection error (not a remote command failure)
    let is_connection_exit = output.exit_code == 255;

    let transient_patterns = [
        "connection refused",
        "connection reset",
        "connection timed out",
        "no route to host",
        "network is unreachable",
        "broken pipe",
        "connection closed by remote host",
        "control socket connect",
    ];

    is_connection_exit || transient_patterns.iter().any(|p| stderr.contains(p))
}
