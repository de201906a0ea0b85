//! Nginx virtual host rendering and placement.

use crate::config::{Mode, SitewrightConfig};
use crate::site::Site;
use crate::utils::template::{self, TemplateVars};

const VHOST_TEMPLATE: &str = include_str!("../../templates/nginx-vhost.conf");

/// Where a site's vhost lives during and after installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhostPaths {
    pub staging: String,
    pub available: String,
    pub enabled: String,
}

impl VhostPaths {
    pub fn for_domain(config: &SitewrightConfig, domain: &str) -> Self {
        let file = format!("{}.conf", domain);
        Self {
            staging: format!("{}/{}", config.paths.staging_dir.trim_end_matches('/'), file),
            available: format!("{}/{}", config.paths.nginx_available.trim_end_matches('/'), file),
            enabled: format!("{}/{}", config.paths.nginx_enabled.trim_end_matches('/'), file),
        }
    }
}

/// `server_name` directive value.
///
/// Local sites answer on the domain. Remote sites also answer on their
/// public address, and only on it when DNS is not managed.
pub fn server_name(config: &SitewrightConfig, site: &Site) -> String {
    match (config.mode, site.public_ip.as_deref()) {
        (Mode::Local, _) | (Mode::Remote, None) => site.domain.clone(),
        (Mode::Remote, Some(ip)) if config.dns_enabled() => format!("{} {}", site.domain, ip),
        (Mode::Remote, Some(ip)) => ip.to_string(),
    }
}

/// Render the vhost for a site whose root path is known.
pub fn render_vhost(
    config: &SitewrightConfig,
    domain: &str,
    server_name: &str,
    document_root: &str,
    logs_path: &str,
) -> String {
    template::render(
        VHOST_TEMPLATE,
        &[
            (TemplateVars::DOMAIN, domain),
            (TemplateVars::SERVER_NAME, server_name),
            (TemplateVars::DOCUMENT_ROOT, document_root),
            (TemplateVars::LOGS_PATH, logs_path),
            (TemplateVars::PHP_FPM_SOCKET, &config.paths.php_fpm_socket),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::tests_support;

    #[test]
    fn vhost_has_no_leftover_placeholders() {
        let config = SitewrightConfig::default();
        let out = render_vhost(
            &config,
            "demo.test",
            "demo.test",
            "/var/www/demo.test/public",
            "/var/www/demo.test/logs",
        );
        assert!(!out.contains("{{"));
        assert!(out.contains("server_name demo.test;"));
        assert!(out.contains("root /var/www/demo.test/public;"));
        assert!(out.contains("access_log /var/www/demo.test/logs/access.log;"));
        assert!(out.contains("fastcgi_pass unix:/var/run/php/php-fpm.sock;"));
        assert!(out.contains("client_max_body_size 64M;"));
    }

    #[test]
    fn server_name_by_mode() {
        let mut config = SitewrightConfig::default();
        let mut site = tests_support::site("example.com");
        site.public_ip = Some("203.0.113.7".to_string());
        assert_eq!(server_name(&config, &site), "example.com");

        config.mode = Mode::Remote;
        assert_eq!(server_name(&config, &site), "203.0.113.7");

        config.dns.hosted_zone_id = "Z123".to_string();
        assert_eq!(server_name(&config, &site), "example.com 203.0.113.7");
    }

    #[test]
    fn paths_use_domain_file_name() {
        let mut config = SitewrightConfig::default();
        config.paths.staging_dir = "/tmp/".to_string();
        let paths = VhostPaths::for_domain(&config, "demo.test");
        assert_eq!(paths.staging, "/tmp/demo.test.conf");
        assert_eq!(paths.available, "/etc/nginx/sites-available/demo.test.conf");
        assert_eq!(paths.enabled, "/etc/nginx/sites-enabled/demo.test.conf");
    }
}
