use secrecy::{ExposeSecret, SecretString};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::TempPath;

use super::{CommandResult, ExecutionBackend};
use crate::config::SitewrightConfig;
use crate::error::{Error, Result};
use crate::site::Site;
use crate::ssh::{SshClient, SshSession};
use crate::utils::shell;

/// Runs commands on a site's instance over one reused SSH session.
///
/// The private key is materialised in a 0600 temp file for the lifetime of
/// the backend; the session closes before the key file is removed.
pub struct RemoteBackend {
    session: SshSession,
    db_root_password: SecretString,
    _key_file: TempPath,
}

impl RemoteBackend {
    pub fn connect(site: &Site, config: &SitewrightConfig) -> Result<Self> {
        Self::connect_in(site, config, &crate::paths::keys()?)
    }

    pub fn connect_in(site: &Site, config: &SitewrightConfig, key_dir: &Path) -> Result<Self> {
        let host = site.public_ip.as_deref().ok_or_else(|| {
            Error::ssh_identity_invalid(format!("Site {} has no public address yet", site.domain))
        })?;
        let private_key = site.private_key.as_ref().ok_or_else(|| {
            Error::ssh_identity_invalid(format!("Site {} has no SSH key on record", site.domain))
        })?;
        let db_root_password = site.db_root_password.clone().ok_or_else(|| {
            Error::ssh_identity_invalid(format!(
                "Site {} has no database root secret on record",
                site.domain
            ))
        })?;

        let key_file = write_key_file(key_dir, private_key)?;
        let client = SshClient::new(host, &config.aws.ssh_user, config.aws.ssh_port, &key_file)
            .with_connect_timeout(Duration::from_secs(config.timeouts.ssh_connect_timeout_secs));

        Ok(Self {
            session: SshSession::new(client),
            db_root_password,
            _key_file: key_file,
        })
    }

    fn mysql_command(&self, sql: &str) -> String {
        format!(
            "mysql -u root -p{} -e {}",
            shell::quote_path(self.db_root_password.expose_secret()),
            shell::quote_path(sql)
        )
    }
}

fn write_key_file(dir: &Path, private_key: &SecretString) -> Result<TempPath> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("create {}", dir.display()))))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
    }

    // NamedTempFile is created 0600 on unix.
    let mut file = tempfile::Builder::new()
        .prefix("site-")
        .suffix(".pem")
        .tempfile_in(dir)
        .map_err(|e| Error::internal_io(e.to_string(), Some("create key file".to_string())))?;

    let mut key = private_key.expose_secret().trim_end().to_string();
    key.push('\n');
    file.write_all(key.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| Error::internal_io(e.to_string(), Some("write key file".to_string())))?;

    Ok(file.into_temp_path())
}

impl ExecutionBackend for RemoteBackend {
    fn describe(&self) -> String {
        self.session.client().target()
    }

    fn execute(&self, command: &str) -> Result<CommandResult> {
        Ok(self.session.execute(command)?.into())
    }

    fn run_database_statement(&self, sql: &str) -> Result<CommandResult> {
        self.execute(&self.mysql_command(sql))
    }

    fn upload_content(&self, content: &[u8], path: &str) -> Result<bool> {
        let result = self.session.upload(content, path)?;
        if !result.success {
            tracing::warn!(
                host = %self.session.client().host,
                path,
                output = %result.combined(),
                "Upload failed"
            );
        }
        Ok(result.success)
    }
}
