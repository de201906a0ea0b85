use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::config::{Mode, SitewrightConfig};
use crate::error::{Error, Result};
use crate::utils::validation;

/// MySQL identifier length limit.
pub const DB_NAME_MAX_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(Uuid);

impl SiteId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SiteId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SiteId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| Error::site_not_found(s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Pending,
    Provisioning,
    Live,
    Failed,
    Destroyed,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatus::Pending => "pending",
            SiteStatus::Provisioning => "provisioning",
            SiteStatus::Live => "live",
            SiteStatus::Failed => "failed",
            SiteStatus::Destroyed => "destroyed",
        }
    }

    pub fn badge_color(&self) -> &'static str {
        match self {
            SiteStatus::Pending => "gray",
            SiteStatus::Provisioning => "blue",
            SiteStatus::Live => "green",
            SiteStatus::Failed => "red",
            SiteStatus::Destroyed => "yellow",
        }
    }

    /// Lifecycle edges. Staying in the same state is always allowed.
    pub fn can_transition_to(&self, next: SiteStatus) -> bool {
        use SiteStatus::*;
        *self == next
            || matches!(
                (self, next),
                (Pending, Provisioning)
                    | (Provisioning, Live)
                    | (Provisioning, Failed)
                    | (Live, Destroyed)
                    | (Failed, Destroyed)
            )
    }

    pub fn can_destroy(&self) -> bool {
        matches!(self, SiteStatus::Live | SiteStatus::Failed)
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SiteStatus::Pending),
            "provisioning" => Ok(SiteStatus::Provisioning),
            "live" => Ok(SiteStatus::Live),
            "failed" => Ok(SiteStatus::Failed),
            "destroyed" => Ok(SiteStatus::Destroyed),
            other => Err(Error::validation_invalid_argument(
                "status",
                format!("Unknown site status '{}'", other),
                None,
                Some(
                    ["pending", "provisioning", "live", "failed", "destroyed"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                ),
            )),
        }
    }
}

/// One managed WordPress installation. Secret fields hold plaintext in
/// memory only; the store encrypts them on write.
#[derive(Debug, Clone)]
pub struct Site {
    pub id: SiteId,
    pub domain: String,
    pub status: SiteStatus,

    pub admin_username: String,
    pub admin_password: SecretString,
    pub admin_email: String,

    pub db_name: Option<String>,
    pub db_username: Option<String>,
    pub db_password: Option<SecretString>,

    pub root_path: Option<String>,
    pub public_ip: Option<String>,

    pub instance_id: Option<String>,
    pub key_pair_name: Option<String>,
    pub private_key: Option<SecretString>,
    pub security_group_id: Option<String>,
    pub db_root_password: Option<SecretString>,

    pub dns_record_id: Option<String>,

    pub domain_claimed: bool,
    pub created_at: DateTime<Utc>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub destroyed_at: Option<DateTime<Utc>>,
}

impl Site {
    /// A freshly registered site: pending, nothing allocated yet.
    pub fn pending(new: NewSite) -> Self {
        Self {
            id: SiteId::new(),
            domain: new.domain,
            status: SiteStatus::Pending,
            admin_username: new.admin_username,
            admin_password: new.admin_password,
            admin_email: new.admin_email,
            db_name: None,
            db_username: None,
            db_password: None,
            root_path: None,
            public_ip: None,
            instance_id: None,
            key_pair_name: None,
            private_key: None,
            security_group_id: None,
            db_root_password: None,
            dns_record_id: None,
            domain_claimed: false,
            created_at: Utc::now(),
            provisioned_at: None,
            destroyed_at: None,
        }
    }

    pub fn public_path(&self) -> Option<String> {
        self.root_path.as_ref().map(|root| format!("{}/public", root))
    }

    pub fn logs_path(&self) -> Option<String> {
        self.root_path.as_ref().map(|root| format!("{}/logs", root))
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.domain)
    }
}

/// Fields accepted when registering a new site.
#[derive(Debug, Clone)]
pub struct NewSite {
    pub domain: String,
    pub admin_username: String,
    pub admin_password: SecretString,
    pub admin_email: String,
}

impl NewSite {
    /// Validate request fields and normalise the domain for the configured mode.
    ///
    /// Local mode appends the development suffix (`.test`) when missing.
    pub fn validated(mut self, config: &SitewrightConfig) -> Result<Self> {
        use secrecy::ExposeSecret;

        let domain = validation::require_non_empty(&self.domain, "domain", "Domain is required")?
            .to_ascii_lowercase();
        validation::max_length(&domain, "domain", 255)?;
        if !validation::is_loose_domain(&domain)? {
            return Err(Error::invalid_domain(
                &domain,
                "Domain may only contain letters, numbers, dots and dashes",
            ));
        }

        self.domain = match config.mode {
            Mode::Local if !domain.ends_with(&config.local.domain_suffix) => {
                format!("{}{}", domain, config.local.domain_suffix)
            }
            _ => domain,
        };

        validation::alpha_dash(&self.admin_username, "admin_username", 3, 60)?;
        validation::min_length(self.admin_password.expose_secret(), "admin_password", 12)?;
        validation::email(&self.admin_email, "admin_email", 100)?;

        Ok(self)
    }
}

/// Partial update: `Some` fields overwrite, `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SiteUpdate {
    pub status: Option<SiteStatus>,
    pub db_name: Option<String>,
    pub db_username: Option<String>,
    pub db_password: Option<SecretString>,
    pub root_path: Option<String>,
    pub public_ip: Option<String>,
    pub instance_id: Option<String>,
    pub key_pair_name: Option<String>,
    pub private_key: Option<SecretString>,
    pub security_group_id: Option<String>,
    pub db_root_password: Option<SecretString>,
    pub dns_record_id: Option<String>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub destroyed_at: Option<DateTime<Utc>>,
}

impl SiteUpdate {
    pub fn status(status: SiteStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SiteFilter {
    pub status: Option<SiteStatus>,
    pub include_destroyed: bool,
}

impl SiteFilter {
    pub fn matches(&self, site: &Site) -> bool {
        if let Some(status) = self.status {
            return site.status == status;
        }
        self.include_destroyed || site.status != SiteStatus::Destroyed
    }
}

/// Deterministic database name for a domain: `wp_` prefix, separators
/// replaced by `_`, truncated to the MySQL identifier limit.
pub fn database_name(domain: &str) -> String {
    let sanitized: String = domain
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let mut name = format!("wp_{}", sanitized);
    name.truncate(DB_NAME_MAX_LEN);
    name
}

/// Site as shown to users: no secrets.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteView {
    pub id: SiteId,
    pub domain: String,
    pub status: SiteStatus,
    pub status_color: &'static str,
    pub url: String,
    pub admin_username: String,
    pub admin_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_record_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destroyed_at: Option<DateTime<Utc>>,
}

impl From<&Site> for SiteView {
    fn from(site: &Site) -> Self {
        Self {
            id: site.id,
            domain: site.domain.clone(),
            status: site.status,
            status_color: site.status.badge_color(),
            url: site.url(),
            admin_username: site.admin_username.clone(),
            admin_email: site.admin_email.clone(),
            db_name: site.db_name.clone(),
            db_username: site.db_username.clone(),
            root_path: site.root_path.clone(),
            public_ip: site.public_ip.clone(),
            instance_id: site.instance_id.clone(),
            dns_record_id: site.dns_record_id.clone(),
            created_at: site.created_at,
            provisioned_at: site.provisioned_at,
            destroyed_at: site.destroyed_at,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn request(domain: &str) -> NewSite {
        NewSite {
            domain: domain.to_string(),
            admin_username: "admin".to_string(),
            admin_password: SecretString::from("correct-horse-battery".to_string()),
            admin_email: "a@b.com".to_string(),
        }
    }

    #[test]
    fn database_name_is_deterministic_and_bounded() {
        assert_eq!(database_name("demo.test"), "wp_demo_test");
        assert_eq!(database_name("my-site.example.com"), "wp_my_site_example_com");
        assert_eq!(database_name("demo.test"), database_name("demo.test"));

        let long = format!("{}.com", "a".repeat(120));
        let name = database_name(&long);
        assert_eq!(name.len(), DB_NAME_MAX_LEN);
        assert!(name.starts_with("wp_aaa"));
    }

    #[test]
    fn lifecycle_edges() {
        use SiteStatus::*;
        assert!(Pending.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Live));
        assert!(Provisioning.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Destroyed));
        assert!(Live.can_transition_to(Destroyed));
        assert!(Failed.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Live));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Provisioning));
        assert!(!Destroyed.can_transition_to(Live));
        assert!(!Provisioning.can_transition_to(Destroyed));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SiteStatus::Pending,
            SiteStatus::Provisioning,
            SiteStatus::Live,
            SiteStatus::Failed,
            SiteStatus::Destroyed,
        ] {
            assert_eq!(status.as_str().parse::<SiteStatus>().unwrap(), status);
        }
        assert!("archived".parse::<SiteStatus>().is_err());
    }

    #[test]
    fn local_mode_appends_test_suffix() {
        let config = SitewrightConfig::default();
        let site = request("Demo").validated(&config).unwrap();
        assert_eq!(site.domain, "demo.test");

        let site = request("demo.test").validated(&config).unwrap();
        assert_eq!(site.domain, "demo.test");
    }

    #[test]
    fn remote_mode_keeps_domain() {
        let mut config = SitewrightConfig::default();
        config.mode = Mode::Remote;
        let site = request("example.com").validated(&config).unwrap();
        assert_eq!(site.domain, "example.com");
    }

    #[test]
    fn rejects_bad_request_fields() {
        let config = SitewrightConfig::default();

        let err = request("bad domain").validated(&config).unwrap_err();
        assert_eq!(err.code.as_str(), "validation.invalid_domain");

        let mut short = request("demo");
        short.admin_password = SecretString::from("short".to_string());
        assert!(short.validated(&config).is_err());

        let mut user = request("demo");
        user.admin_username = "a b".to_string();
        assert!(user.validated(&config).is_err());
    }

    #[test]
    fn filter_hides_destroyed_by_default() {
        let mut site = Site::pending(request("demo.test"));
        site.status = SiteStatus::Destroyed;

        assert!(!SiteFilter::default().matches(&site));
        assert!(SiteFilter {
            include_destroyed: true,
            ..Default::default()
        }
        .matches(&site));
        assert!(SiteFilter {
            status: Some(SiteStatus::Destroyed),
            ..Default::default()
        }
        .matches(&site));
    }
}
