//! HTTP verification of a freshly installed site.

use std::time::Duration;

use crate::config::{Mode, SitewrightConfig};
use crate::error::{Error, Result};
use crate::site::Site;

const USER_AGENT: &str = concat!("sitewright/", env!("CARGO_PKG_VERSION"));

/// Body fragments that identify a WordPress response.
pub const MARKERS: &[&str] = &["wp-content", "wp-includes", "wordpress", "WordPress"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub url: String,
    /// Sent as `Host` when the URL addresses the server by IP.
    pub host_header: Option<String>,
}

impl ProbeTarget {
    /// Local sites resolve through the hosts file. Remote sites are reached
    /// by address so verification does not wait on public DNS.
    pub fn for_site(config: &SitewrightConfig, site: &Site) -> Self {
        match (config.mode, site.public_ip.as_deref()) {
            (Mode::Remote, Some(ip)) => Self {
                url: format!("http://{}/", ip),
                host_header: config.dns_enabled().then(|| site.domain.clone()),
            },
            _ => Self {
                url: format!("{}/", site.url()),
                host_header: None,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: String,
}

impl ProbeResponse {
    /// 2xx with a WordPress marker in the body.
    pub fn check(&self, url: &str) -> Result<()> {
        if !(200..300).contains(&self.status) {
            return Err(Error::site_verification_failed(
                url,
                format!("HTTP status {}", self.status),
                Some(self.status),
            ));
        }
        if !MARKERS.iter().any(|marker| self.body.contains(marker)) {
            return Err(Error::site_verification_failed(
                url,
                "Response does not look like a WordPress site",
                Some(self.status),
            ));
        }
        Ok(())
    }
}

pub trait SiteProbe: Send + Sync {
    fn fetch(&self, target: &ProbeTarget) -> Result<ProbeResponse>;
}

/// Blocking reqwest client.
pub struct HttpProbe {
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl SiteProbe for HttpProbe {
    fn fetch(&self, target: &ProbeTarget) -> Result<ProbeResponse> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::internal_io(e.to_string(), Some("create HTTP client".to_string())))?;

        let mut request = client.get(&target.url);
        if let Some(host) = &target.host_header {
            request = request.header(reqwest::header::HOST, host);
        }

        let response = request
            .send()
            .map_err(|e| Error::site_verification_failed(&target.url, e.to_string(), None))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| Error::site_verification_failed(&target.url, e.to_string(), Some(status)))?;

        Ok(ProbeResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::tests_support;

    #[test]
    fn accepts_wordpress_page() {
        let response = ProbeResponse {
            status: 200,
            body: "<link href='/wp-content/themes/x.css'>".to_string(),
        };
        assert!(response.check("http://demo.test/").is_ok());
    }

    #[test]
    fn rejects_non_2xx_and_foreign_pages() {
        let err = ProbeResponse {
            status: 502,
            body: "wp-content".to_string(),
        }
        .check("http://demo.test/")
        .unwrap_err();
        assert_eq!(err.code.as_str(), "site.verification_failed");

        let err = ProbeResponse {
            status: 200,
            body: "Welcome to nginx!".to_string(),
        }
        .check("http://demo.test/")
        .unwrap_err();
        assert!(err.message.contains("WordPress"));
    }

    #[test]
    fn local_target_uses_domain() {
        let config = SitewrightConfig::default();
        let mut site = tests_support::site("demo.test");
        site.public_ip = Some("127.0.0.1".to_string());
        let target = ProbeTarget::for_site(&config, &site);
        assert_eq!(target.url, "http://demo.test/");
        assert_eq!(target.host_header, None);
    }

    #[test]
    fn remote_target_uses_address() {
        let mut config = SitewrightConfig::default();
        config.mode = Mode::Remote;
        let mut site = tests_support::site("example.com");
        site.public_ip = Some("203.0.113.7".to_string());

        let target = ProbeTarget::for_site(&config, &site);
        assert_eq!(target.url, "http://203.0.113.7/");
        assert_eq!(target.host_header, None);

        config.dns.hosted_zone_id = "Z1".to_string();
        let target = ProbeTarget::for_site(&config, &site);
        assert_eq!(target.host_header.as_deref(), Some("example.com"));
    }
}
