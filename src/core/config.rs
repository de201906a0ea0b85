use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Which infrastructure runs the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Provision on this machine with local shell commands.
    Local,
    /// Launch one cloud instance per site and provision it over SSH.
    Remote,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Local => "local",
            Mode::Remote => "remote",
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Mode::Local),
            "remote" | "aws" => Ok(Mode::Remote),
            other => Err(Error::config_invalid_value(
                "mode",
                Some(other.to_string()),
                "expected 'local' or 'remote'",
            )),
        }
    }
}

/// Root configuration structure for sitewright.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitewrightConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub wordpress: WordPressConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub aws: AwsConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub local: LocalConfig,
}

impl Default for SitewrightConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            paths: PathsConfig::default(),
            database: DatabaseConfig::default(),
            wordpress: WordPressConfig::default(),
            security: SecurityConfig::default(),
            aws: AwsConfig::default(),
            dns: DnsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            local: LocalConfig::default(),
        }
    }
}

/// Server-side filesystem locations (same layout locally and on instances)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_web_root")]
    pub web_root: String,
    #[serde(default = "default_nginx_available")]
    pub nginx_available: String,
    #[serde(default = "default_nginx_enabled")]
    pub nginx_enabled: String,
    #[serde(default = "default_php_fpm_socket")]
    pub php_fpm_socket: String,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    #[serde(default = "default_hosts_file")]
    pub hosts_file: String,
}

/// Superuser access for the local database server.
///
/// Remote instances get a per-instance root secret generated at launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_root_user")]
    pub root_user: String,
    #[serde(default = "default_db_root_password")]
    pub root_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordPressConfig {
    #[serde(default = "default_wp_version")]
    pub version: String,
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default = "default_plugins_to_remove")]
    pub plugins_to_remove: Vec<String>,
    #[serde(default = "default_web_user")]
    pub cli_user: String,
    #[serde(default = "default_web_owner")]
    pub owner: String,
    #[serde(default = "default_dir_mode")]
    pub dir_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub disable_xmlrpc: bool,
    #[serde(default = "default_true")]
    pub disable_file_edit: bool,
    #[serde(default = "default_db_password_length")]
    pub db_password_length: usize,
    #[serde(default = "default_root_password_length")]
    pub root_password_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_ami_id")]
    pub ami_id: String,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    #[serde(default = "default_key_name_prefix")]
    pub key_name_prefix: String,
    #[serde(default = "default_security_group_name")]
    pub security_group_name: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Empty disables DNS record management (address-only mode).
    #[serde(default)]
    pub hosted_zone_id: String,
    #[serde(default)]
    pub skip: bool,
    #[serde(default = "default_dns_ttl")]
    pub ttl: u32,
    #[serde(default = "default_propagation_attempts")]
    pub propagation_attempts: u32,
    #[serde(default = "default_propagation_interval_secs")]
    pub propagation_interval_secs: u64,
    #[serde(default = "default_true")]
    pub wait_for_propagation: bool,
}

/// Retry counts and time budgets, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_step_budget_secs")]
    pub step_budget_secs: u64,
    #[serde(default = "default_launch_budget_secs")]
    pub launch_budget_secs: u64,
    #[serde(default = "default_instance_attempts")]
    pub instance_attempts: u32,
    #[serde(default = "default_instance_delay_secs")]
    pub instance_delay_secs: u64,
    #[serde(default = "default_instance_attempts")]
    pub ssh_attempts: u32,
    #[serde(default = "default_instance_delay_secs")]
    pub ssh_delay_secs: u64,
    #[serde(default = "default_ssh_connect_timeout_secs")]
    pub ssh_connect_timeout_secs: u64,
    #[serde(default = "default_setup_grace_secs")]
    pub setup_grace_secs: u64,
    #[serde(default = "default_verify_settle_secs")]
    pub verify_settle_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_domain_suffix")]
    pub domain_suffix: String,
}

// =============================================================================
// Default value functions
// =============================================================================

fn default_mode() -> Mode {
    Mode::Local
}

fn default_true() -> bool {
    true
}

fn default_web_root() -> String {
    "/var/www".to_string()
}

fn default_nginx_available() -> String {
    "/etc/nginx/sites-available".to_string()
}

fn default_nginx_enabled() -> String {
    "/etc/nginx/sites-enabled".to_string()
}

fn default_php_fpm_socket() -> String {
    "/var/run/php/php-fpm.sock".to_string()
}

fn default_staging_dir() -> String {
    "/tmp".to_string()
}

fn default_hosts_file() -> String {
    "/etc/hosts".to_string()
}

fn default_db_host() -> String {
    "127.0.0.1".to_string()
}

fn default_db_root_user() -> String {
    "root".to_string()
}

fn default_db_root_password() -> String {
    "root".to_string()
}

fn default_wp_version() -> String {
    "latest".to_string()
}

fn default_theme() -> String {
    "twentytwentyfour".to_string()
}

fn default_plugins_to_remove() -> Vec<String> {
    vec!["akismet".to_string(), "hello".to_string()]
}

fn default_web_user() -> String {
    "www-data".to_string()
}

fn default_web_owner() -> String {
    "www-data:www-data".to_string()
}

fn default_dir_mode() -> String {
    "755".to_string()
}

fn default_db_password_length() -> usize {
    32
}

fn default_root_password_length() -> usize {
    24
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_ami_id() -> String {
    "ami-0c02fb55956c7d316".to_string()
}

fn default_instance_type() -> String {
    "t3.micro".to_string()
}

fn default_key_name_prefix() -> String {
    "sitewright-".to_string()
}

fn default_security_group_name() -> String {
    "sitewright-wordpress".to_string()
}

fn default_ssh_user() -> String {
    "ec2-user".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_dns_ttl() -> u32 {
    300
}

fn default_propagation_attempts() -> u32 {
    30
}

fn default_propagation_interval_secs() -> u64 {
    10
}

fn default_step_budget_secs() -> u64 {
    300
}

fn default_launch_budget_secs() -> u64 {
    600
}

fn default_instance_attempts() -> u32 {
    10
}

fn default_instance_delay_secs() -> u64 {
    30
}

fn default_ssh_connect_timeout_secs() -> u64 {
    30
}

fn default_setup_grace_secs() -> u64 {
    60
}

fn default_verify_settle_secs() -> u64 {
    10
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_domain_suffix() -> String {
    ".test".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            web_root: default_web_root(),
            nginx_available: default_nginx_available(),
            nginx_enabled: default_nginx_enabled(),
            php_fpm_socket: default_php_fpm_socket(),
            staging_dir: default_staging_dir(),
            hosts_file: default_hosts_file(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            root_user: default_db_root_user(),
            root_password: default_db_root_password(),
        }
    }
}

impl Default for WordPressConfig {
    fn default() -> Self {
        Self {
            version: default_wp_version(),
            theme: default_theme(),
            plugins_to_remove: default_plugins_to_remove(),
            cli_user: default_web_user(),
            owner: default_web_owner(),
            dir_mode: default_dir_mode(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            disable_xmlrpc: true,
            disable_file_edit: true,
            db_password_length: default_db_password_length(),
            root_password_length: default_root_password_length(),
        }
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            ami_id: default_ami_id(),
            instance_type: default_instance_type(),
            key_name_prefix: default_key_name_prefix(),
            security_group_name: default_security_group_name(),
            ssh_user: default_ssh_user(),
            ssh_port: default_ssh_port(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            hosted_zone_id: String::new(),
            skip: false,
            ttl: default_dns_ttl(),
            propagation_attempts: default_propagation_attempts(),
            propagation_interval_secs: default_propagation_interval_secs(),
            wait_for_propagation: true,
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            step_budget_secs: default_step_budget_secs(),
            launch_budget_secs: default_launch_budget_secs(),
            instance_attempts: default_instance_attempts(),
            instance_delay_secs: default_instance_delay_secs(),
            ssh_attempts: default_instance_attempts(),
            ssh_delay_secs: default_instance_delay_secs(),
            ssh_connect_timeout_secs: default_ssh_connect_timeout_secs(),
            setup_grace_secs: default_setup_grace_secs(),
            verify_settle_secs: default_verify_settle_secs(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            domain_suffix: default_domain_suffix(),
        }
    }
}

// =============================================================================
// Loading
// =============================================================================

impl SitewrightConfig {
    /// Load config from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("read {}", path.display())))
        })?;

        Self::from_toml(&content, &path.display().to_string())
    }

    /// Load from the default location (~/.config/sitewright/sitewright.toml).
    pub fn load_default() -> Result<Self> {
        Self::load(&crate::paths::config_file()?)
    }

    pub fn from_toml(content: &str, origin: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config_invalid_toml(origin, e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mode == Mode::Remote && self.aws.ami_id.trim().is_empty() {
            return Err(Error::config_missing_key("aws.ami_id", None));
        }
        if self.security.db_password_length < 16 {
            return Err(Error::config_invalid_value(
                "security.db_password_length",
                Some(self.security.db_password_length.to_string()),
                "must be at least 16",
            ));
        }
        if self.wordpress.dir_mode.is_empty()
            || !self.wordpress.dir_mode.chars().all(|c| ('0'..='7').contains(&c))
        {
            return Err(Error::config_invalid_value(
                "wordpress.dir_mode",
                Some(self.wordpress.dir_mode.clone()),
                "must be an octal permission string such as 755",
            ));
        }
        Ok(())
    }

    /// DNS record management runs only for remote sites with a hosted zone.
    pub fn dns_enabled(&self) -> bool {
        self.mode == Mode::Remote && !self.dns.skip && !self.dns.hosted_zone_id.trim().is_empty()
    }

    pub fn step_budget(&self) -> Duration {
        Duration::from_secs(self.timeouts.step_budget_secs)
    }

    pub fn launch_budget(&self) -> Duration {
        Duration::from_secs(self.timeouts.launch_budget_secs)
    }

    /// Copy safe to print: secrets replaced by a marker.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.database.root_password.is_empty() {
            copy.database.root_password = "********".to_string();
        }
        copy
    }
}
