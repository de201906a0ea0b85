//! Provisioning stages, in chain order.

use secrecy::ExposeSecret;
use std::time::Duration;

use super::{Stage, StageContext, StepScope};
use crate::config::{Mode, SitewrightConfig};
use crate::error::{Error, RemoteCommandFailedDetails, Result};
use crate::executor::{first_failure, ExecutionBackend};
use crate::hosts;
use crate::nginx::{self, VhostPaths};
use crate::probe::ProbeTarget;
use crate::random;
use crate::site::{database_name, SiteUpdate};
use crate::step_log::Step;
use crate::utils::{shell, validation};

/// The provisioning chain for the configured mode.
pub fn stages(config: &SitewrightConfig) -> Vec<Box<dyn Stage>> {
    let mut stages: Vec<Box<dyn Stage>> = vec![Box::new(ValidateDomain)];
    if config.mode == Mode::Remote {
        stages.push(Box::new(LaunchInstance));
    }
    stages.push(Box::new(PrepareFilesystem));
    stages.push(Box::new(CreateDatabase));
    stages.push(Box::new(InstallWordpress));
    stages.push(Box::new(ConfigureNginx));
    stages.push(Box::new(ReloadNginx));
    stages.push(Box::new(UpdateDns));
    stages.push(Box::new(VerifySite));
    stages
}

fn command_failed(context: &str, output: &str) -> Error {
    Error::remote_command_failed(RemoteCommandFailedDetails {
        context: context.to_string(),
        exit_code: 1,
        output: output.to_string(),
        host: None,
    })
}

pub struct ValidateDomain;

impl Stage for ValidateDomain {
    fn step(&self) -> Step {
        Step::ValidateDomain
    }

    fn run(&self, ctx: &mut StageContext<'_>, _scope: &StepScope<'_>) -> Result<String> {
        let domain = ctx.site.domain.clone();

        if !validation::is_hostname(&domain)? {
            return Err(Error::invalid_domain(&domain, "Not a valid hostname"));
        }
        if ctx.config.mode == Mode::Local && !domain.ends_with(&ctx.config.local.domain_suffix) {
            return Err(Error::invalid_domain(
                &domain,
                format!("Local sites must use the {} suffix", ctx.config.local.domain_suffix),
            ));
        }
        if ctx.config.dns_enabled() && ctx.dns()?.record_exists(&domain)? {
            return Err(Error::dns_record_exists(&domain));
        }

        ctx.sites.claim_domain(ctx.site.id)?;
        ctx.site.domain_claimed = true;

        Ok(format!("Domain {} is valid and available", domain))
    }
}

pub struct LaunchInstance;

impl Stage for LaunchInstance {
    fn step(&self) -> Step {
        Step::LaunchInstance
    }

    fn budget(&self, config: &SitewrightConfig) -> Duration {
        config.launch_budget()
    }

    fn run(&self, ctx: &mut StageContext<'_>, scope: &StepScope<'_>) -> Result<String> {
        let provider = ctx.instances()?;
        let timeouts = ctx.config.timeouts.clone();

        scope.note("Launching instance...");
        let launched = provider.launch_instance(&ctx.site)?;
        ctx.update(SiteUpdate {
            instance_id: Some(launched.instance_id.clone()),
            key_pair_name: Some(launched.key_pair_name.clone()),
            private_key: Some(launched.private_key.clone()),
            security_group_id: Some(launched.security_group_id.clone()),
            db_root_password: Some(launched.db_root_password.clone()),
            ..Default::default()
        })?;
        scope.note(&format!(
            "Instance {} requested, waiting for it to run",
            launched.instance_id
        ));

        let poll = scope.poll(
            timeouts.instance_attempts,
            Duration::from_secs(timeouts.instance_delay_secs),
        );
        let status = provider.wait_for_instance_ready(&launched.instance_id, &poll)?;
        ctx.update(SiteUpdate {
            public_ip: Some(status.public_ip.clone()),
            ..Default::default()
        })?;
        scope.note(&format!("Instance running at {}, waiting for SSH", status.public_ip));

        let poll = scope.poll(timeouts.ssh_attempts, Duration::from_secs(timeouts.ssh_delay_secs));
        if !provider.wait_for_session_ready(&status.public_ip, &poll)? {
            return Err(Error::instance_not_ready(
                &launched.instance_id,
                "SSH did not become available within timeout",
            ));
        }

        scope.note("SSH available, waiting for instance setup to finish");
        scope.sleep(Duration::from_secs(timeouts.setup_grace_secs))?;

        Ok(format!(
            "EC2 instance launched successfully.\nInstance ID: {}\nPublic IP: {}",
            launched.instance_id, status.public_ip
        ))
    }
}

pub struct PrepareFilesystem;

impl Stage for PrepareFilesystem {
    fn step(&self) -> Step {
        Step::PrepareFilesystem
    }

    fn run(&self, ctx: &mut StageContext<'_>, scope: &StepScope<'_>) -> Result<String> {
        let root = format!(
            "{}/{}",
            ctx.config.paths.web_root.trim_end_matches('/'),
            ctx.site.domain
        );
        let owner = ctx.config.wordpress.owner.clone();
        let mode = ctx.config.wordpress.dir_mode.clone();
        let backend = ctx.backend()?;

        for dir in [root.clone(), format!("{}/public", root), format!("{}/logs", root)] {
            scope.check()?;
            let results = backend.create_directory(&dir, &owner, &mode)?;
            if let Some(failed) = first_failure(&results) {
                failed
                    .clone()
                    .check(&format!("Failed to create directory {}", dir))?;
            }
        }

        ctx.update(SiteUpdate {
            root_path: Some(root.clone()),
            ..Default::default()
        })?;

        Ok(format!("Created {} with public/ and logs/", root))
    }
}

pub struct CreateDatabase;

impl Stage for CreateDatabase {
    fn step(&self) -> Step {
        Step::CreateDatabase
    }

    fn run(&self, ctx: &mut StageContext<'_>, scope: &StepScope<'_>) -> Result<String> {
        let name = database_name(&ctx.site.domain);
        let user = format!("wp_{}", random::lowercase_alphanumeric(8));
        let password = random::secret(ctx.config.security.db_password_length);
        let account = format!("{}@'localhost'", shell::sql_literal(&user));
        let backend = ctx.backend()?;

        let statements = [
            (
                format!(
                    "CREATE DATABASE IF NOT EXISTS {} CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci",
                    shell::sql_identifier(&name)
                ),
                "Failed to create database",
            ),
            (
                format!(
                    "CREATE USER {} IDENTIFIED BY {}",
                    account,
                    shell::sql_literal(password.expose_secret())
                ),
                "Failed to create database user",
            ),
            (
                format!(
                    "GRANT ALL PRIVILEGES ON {}.* TO {}",
                    shell::sql_identifier(&name),
                    account
                ),
                "Failed to grant privileges",
            ),
            ("FLUSH PRIVILEGES".to_string(), "Failed to flush privileges"),
        ];

        for (sql, context) in &statements {
            scope.check()?;
            backend.run_database_statement(sql)?.check(context)?;
        }

        ctx.update(SiteUpdate {
            db_name: Some(name.clone()),
            db_username: Some(user.clone()),
            db_password: Some(password),
            ..Default::default()
        })?;

        Ok(format!("Database {} created with user {}", name, user))
    }
}

/// `cd <public> && sudo -u <user> wp <args>`
fn wp(public: &str, user: &str, args: &[String]) -> String {
    format!(
        "cd {} && sudo -u {} wp {}",
        shell::quote_path(public),
        shell::quote_arg(user),
        shell::quote_args(args)
    )
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub struct InstallWordpress;

impl Stage for InstallWordpress {
    fn step(&self) -> Step {
        Step::InstallWordpress
    }

    fn run(&self, ctx: &mut StageContext<'_>, scope: &StepScope<'_>) -> Result<String> {
        let site = ctx.site.clone();
        let config = ctx.config;
        let public = format!("{}/public", ctx.require_root_path()?);
        let user = &config.wordpress.cli_user;
        let db_name = site.db_name.clone().unwrap_or_default();
        let db_user = site.db_username.clone().unwrap_or_default();
        let db_password = site
            .db_password
            .as_ref()
            .map(|p| p.expose_secret().to_string())
            .unwrap_or_default();
        let db_host = match config.mode {
            Mode::Local => config.database.host.clone(),
            Mode::Remote => "localhost".to_string(),
        };
        let backend = ctx.backend()?;

        let required = [
            (
                wp(
                    &public,
                    user,
                    &[
                        "core".to_string(),
                        "download".to_string(),
                        format!("--version={}", config.wordpress.version),
                    ],
                ),
                "Failed to download WordPress",
            ),
            (
                wp(
                    &public,
                    user,
                    &[
                        "config".to_string(),
                        "create".to_string(),
                        format!("--dbname={}", db_name),
                        format!("--dbuser={}", db_user),
                        format!("--dbpass={}", db_password),
                        format!("--dbhost={}", db_host),
                    ],
                ),
                "Failed to create wp-config.php",
            ),
            (
                wp(
                    &public,
                    user,
                    &[
                        "core".to_string(),
                        "install".to_string(),
                        format!("--url={}", site.url()),
                        format!("--title={}", site.domain),
                        format!("--admin_user={}", site.admin_username),
                        format!("--admin_password={}", site.admin_password.expose_secret()),
                        format!("--admin_email={}", site.admin_email),
                        "--skip-email".to_string(),
                    ],
                ),
                "Failed to install WordPress",
            ),
        ];

        for (command, context) in &required {
            scope.check()?;
            backend.execute(command)?.check(context)?;
        }
        scope.note("WordPress core installed");

        run_optional(backend.as_ref(), &optional_commands(config, &public));

        Ok(format!("WordPress installed at {}", site.url()))
    }
}

/// Cleanup and hardening commands whose failure does not fail the install.
fn optional_commands(config: &SitewrightConfig, public: &str) -> Vec<String> {
    let user = &config.wordpress.cli_user;
    let mut commands: Vec<String> = config
        .wordpress
        .plugins_to_remove
        .iter()
        .map(|plugin| {
            wp(
                public,
                user,
                &["plugin".to_string(), "delete".to_string(), plugin.clone(), "--quiet".to_string()],
            )
        })
        .collect();

    commands.push(wp(
        public,
        user,
        &["theme".to_string(), "activate".to_string(), config.wordpress.theme.clone()],
    ));
    commands.push(wp(public, user, &args(&["option", "update", "default_ping_status", "0"])));
    commands.push(wp(public, user, &args(&["option", "update", "default_pingback_flag", "0"])));

    if config.security.disable_xmlrpc {
        commands.push(wp(
            public,
            user,
            &args(&["config", "set", "XMLRPC_ENABLED", "false", "--raw"]),
        ));
    }
    if config.security.disable_file_edit {
        commands.push(wp(
            public,
            user,
            &args(&["config", "set", "DISALLOW_FILE_EDIT", "true", "--raw"]),
        ));
    }
    commands
}

fn run_optional(backend: &dyn ExecutionBackend, commands: &[String]) {
    for command in commands {
        match backend.execute(command) {
            Ok(result) if !result.success => {
                tracing::debug!(command = %command, output = %result.output, "Optional command failed");
            }
            Err(err) => {
                tracing::debug!(command = %command, error = %err, "Optional command failed");
            }
            Ok(_) => {}
        }
    }
}

pub struct ConfigureNginx;

impl Stage for ConfigureNginx {
    fn step(&self) -> Step {
        Step::ConfigureNginx
    }

    fn run(&self, ctx: &mut StageContext<'_>, scope: &StepScope<'_>) -> Result<String> {
        let config = ctx.config;
        let root = ctx.require_root_path()?;
        let domain = ctx.site.domain.clone();
        let server_name = nginx::server_name(config, &ctx.site);
        let content = nginx::render_vhost(
            config,
            &domain,
            &server_name,
            &format!("{}/public", root),
            &format!("{}/logs", root),
        );
        let paths = VhostPaths::for_domain(config, &domain);
        let backend = ctx.backend()?;

        if !backend.upload_content(content.as_bytes(), &paths.staging)? {
            return Err(command_failed("Failed to upload nginx config", &paths.staging));
        }
        scope.check()?;
        backend
            .execute_elevated(&format!(
                "mv {} {}",
                shell::quote_path(&paths.staging),
                shell::quote_path(&paths.available)
            ))?
            .check("Failed to install nginx config")?;
        backend
            .execute_elevated(&format!(
                "ln -sf {} {}",
                shell::quote_path(&paths.available),
                shell::quote_path(&paths.enabled)
            ))?
            .check("Failed to enable nginx config")?;
        scope.check()?;
        backend
            .test_webserver_config()?
            .check("Nginx configuration test failed")?;

        Ok(format!(
            "Nginx configured for {} ({})",
            server_name, paths.available
        ))
    }
}

pub struct ReloadNginx;

impl Stage for ReloadNginx {
    fn step(&self) -> Step {
        Step::ReloadNginx
    }

    fn run(&self, ctx: &mut StageContext<'_>, _scope: &StepScope<'_>) -> Result<String> {
        let backend = ctx.backend()?;
        backend.reload_webserver()?.check("Failed to reload nginx")?;

        let status = backend.webserver_status()?;
        if !status.output.lines().any(|line| line.trim() == "active") {
            return Err(command_failed("Nginx is not active after reload", &status.output));
        }
        Ok("Nginx reloaded and active".to_string())
    }
}

pub struct UpdateDns;

impl Stage for UpdateDns {
    fn step(&self) -> Step {
        Step::UpdateDns
    }

    /// Propagation polling gets its own window on top of the step budget.
    fn budget(&self, config: &SitewrightConfig) -> Duration {
        let propagation = if config.dns_enabled() && config.dns.wait_for_propagation {
            Duration::from_secs(
                u64::from(config.dns.propagation_attempts) * config.dns.propagation_interval_secs,
            )
        } else {
            Duration::ZERO
        };
        config.step_budget() + propagation
    }

    fn run(&self, ctx: &mut StageContext<'_>, scope: &StepScope<'_>) -> Result<String> {
        match ctx.config.mode {
            Mode::Local => register_hosts_entry(ctx),
            Mode::Remote => create_dns_record(ctx, scope),
        }
    }
}

fn register_hosts_entry(ctx: &mut StageContext<'_>) -> Result<String> {
    let hosts_file = ctx.config.paths.hosts_file.clone();
    let domain = ctx.site.domain.clone();
    let backend = ctx.backend()?;

    let current = backend
        .execute(&format!("cat {}", shell::quote_path(&hosts_file)))?
        .check("Failed to read hosts file")?;

    let summary = match hosts::with_entry(&current.output, hosts::LOOPBACK, &domain) {
        Some(updated) => {
            if !backend.upload_content(updated.as_bytes(), &hosts_file)? {
                return Err(command_failed("Failed to update hosts file", &hosts_file));
            }
            format!("Added {} {} to {}", hosts::LOOPBACK, domain, hosts_file)
        }
        None => format!("{} already present in {}", domain, hosts_file),
    };

    ctx.update(SiteUpdate {
        public_ip: Some(hosts::LOOPBACK.to_string()),
        ..Default::default()
    })?;
    Ok(summary)
}

fn create_dns_record(ctx: &mut StageContext<'_>, scope: &StepScope<'_>) -> Result<String> {
    let ip = ctx.require_public_ip()?;
    let domain = ctx.site.domain.clone();

    if !ctx.config.dns_enabled() {
        return Ok(format!(
            "DNS not managed; site reachable at http://{}",
            ip
        ));
    }

    let dns = ctx.dns()?;
    let dns_config = ctx.config.dns.clone();
    let change = dns.create_record(&domain, &ip, dns_config.ttl)?;
    ctx.update(SiteUpdate {
        dns_record_id: Some(change.clone()),
        ..Default::default()
    })?;
    scope.note(&format!("A record {} -> {} submitted ({})", domain, ip, change));

    if !dns_config.wait_for_propagation {
        return Ok(format!("DNS record created: {} -> {}", domain, ip));
    }

    let poll = scope.poll(
        dns_config.propagation_attempts,
        Duration::from_secs(dns_config.propagation_interval_secs),
    );
    if dns.wait_for_propagation(&change, &poll)? {
        Ok(format!("DNS record created and propagated: {} -> {}", domain, ip))
    } else {
        tracing::warn!(domain = %domain, change = %change, "DNS propagation still pending");
        Ok(format!(
            "DNS record created: {} -> {} (propagation pending)",
            domain, ip
        ))
    }
}

pub struct VerifySite;

impl Stage for VerifySite {
    fn step(&self) -> Step {
        Step::VerifySite
    }

    fn run(&self, ctx: &mut StageContext<'_>, scope: &StepScope<'_>) -> Result<String> {
        scope.sleep(Duration::from_secs(ctx.config.timeouts.verify_settle_secs))?;

        let target = ProbeTarget::for_site(ctx.config, &ctx.site);
        let response = ctx.infra.probe().fetch(&target)?;
        response.check(&target.url)?;

        Ok(format!("Site verified and accessible at {}", ctx.site.url()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_chain_skips_instance_launch() {
        let config = SitewrightConfig::default();
        let steps: Vec<Step> = stages(&config).iter().map(|s| s.step()).collect();
        assert_eq!(
            steps,
            vec![
                Step::ValidateDomain,
                Step::PrepareFilesystem,
                Step::CreateDatabase,
                Step::InstallWordpress,
                Step::ConfigureNginx,
                Step::ReloadNginx,
                Step::UpdateDns,
                Step::VerifySite,
            ]
        );
    }

    #[test]
    fn remote_chain_launches_after_validation() {
        let mut config = SitewrightConfig::default();
        config.mode = Mode::Remote;
        let steps: Vec<Step> = stages(&config).iter().map(|s| s.step()).collect();
        assert_eq!(steps.len(), 9);
        assert_eq!(steps[1], Step::LaunchInstance);
    }

    #[test]
    fn wp_commands_run_as_cli_user_in_public_dir() {
        let command = wp(
            "/var/www/demo.test/public",
            "www-data",
            &args(&["core", "install", "--title=My Site"]),
        );
        assert_eq!(
            command,
            "cd '/var/www/demo.test/public' && sudo -u www-data wp core install '--title=My Site'"
        );
    }

    #[test]
    fn hardening_follows_security_toggles() {
        let mut config = SitewrightConfig::default();
        let commands = optional_commands(&config, "/p");
        assert_eq!(commands.len(), 7);
        assert!(commands.iter().any(|c| c.contains("XMLRPC_ENABLED false --raw")));

        config.security.disable_xmlrpc = false;
        config.security.disable_file_edit = false;
        let commands = optional_commands(&config, "/p");
        assert_eq!(commands.len(), 5);
        assert!(commands[0].ends_with("plugin delete akismet --quiet"));
    }

    #[test]
    fn dns_budget_covers_propagation_window() {
        let mut config = SitewrightConfig::default();
        assert_eq!(UpdateDns.budget(&config), config.step_budget());

        config.mode = Mode::Remote;
        config.dns.hosted_zone_id = "Z1".to_string();
        assert_eq!(
            UpdateDns.budget(&config),
            config.step_budget() + Duration::from_secs(300)
        );
    }
}
