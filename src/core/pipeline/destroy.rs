//! Destruction stages. Every stage is best-effort; see [`super::run_best_effort`].
//!
//! A site whose domain claim never succeeded shares its domain with another
//! site's resources, so domain-keyed cleanup (vhost, hosts entry, DNS
//! record) is skipped for it.

use super::{Stage, StageContext, StepScope};
use crate::config::{Mode, SitewrightConfig};
use crate::error::{Error, RemoteCommandFailedDetails, Result};
use crate::hosts;
use crate::nginx::VhostPaths;
use crate::step_log::Step;
use crate::utils::shell;

const UNCLAIMED: &str = "Skipped: domain was never claimed by this site";

pub fn stages(config: &SitewrightConfig) -> Vec<Box<dyn Stage>> {
    let mut stages: Vec<Box<dyn Stage>> = vec![
        Box::new(RemoveNginx),
        Box::new(ReloadNginx),
        Box::new(DeleteFiles),
        Box::new(DropDatabase),
    ];
    if config.mode == Mode::Remote {
        stages.push(Box::new(TerminateInstance));
    }
    stages.push(Box::new(DeleteDns));
    stages
}

pub struct RemoveNginx;

impl Stage for RemoveNginx {
    fn step(&self) -> Step {
        Step::RemoveNginx
    }

    fn run(&self, ctx: &mut StageContext<'_>, _scope: &StepScope<'_>) -> Result<String> {
        if !ctx.site.domain_claimed {
            return Ok(UNCLAIMED.to_string());
        }
        let paths = VhostPaths::for_domain(ctx.config, &ctx.site.domain);
        let backend = ctx.backend()?;

        backend
            .delete_file(&paths.enabled)?
            .check("Failed to remove enabled nginx config")?;
        backend
            .delete_file(&paths.available)?
            .check("Failed to remove nginx config")?;

        Ok(format!("Removed {} and {}", paths.enabled, paths.available))
    }
}

pub struct ReloadNginx;

impl Stage for ReloadNginx {
    fn step(&self) -> Step {
        Step::ReloadNginx
    }

    fn run(&self, ctx: &mut StageContext<'_>, _scope: &StepScope<'_>) -> Result<String> {
        ctx.backend()?
            .reload_webserver()?
            .check("Failed to reload nginx")?;
        Ok("Nginx reloaded".to_string())
    }
}

pub struct DeleteFiles;

impl Stage for DeleteFiles {
    fn step(&self) -> Step {
        Step::DeleteFiles
    }

    fn run(&self, ctx: &mut StageContext<'_>, _scope: &StepScope<'_>) -> Result<String> {
        let Some(root) = ctx.site.root_path.clone() else {
            return Ok("No site directory on record".to_string());
        };
        ctx.backend()?
            .delete_directory(&root)?
            .check(&format!("Failed to delete {}", root))?;
        Ok(format!("Deleted {}", root))
    }
}

pub struct DropDatabase;

impl Stage for DropDatabase {
    fn step(&self) -> Step {
        Step::DropDatabase
    }

    fn run(&self, ctx: &mut StageContext<'_>, scope: &StepScope<'_>) -> Result<String> {
        let Some(name) = ctx.site.db_name.clone() else {
            return Ok("No database on record".to_string());
        };
        let user = ctx.site.db_username.clone();
        let backend = ctx.backend()?;

        let mut statements = vec![(
            format!("DROP DATABASE IF EXISTS {}", shell::sql_identifier(&name)),
            "Failed to drop database",
        )];
        if let Some(user) = &user {
            statements.push((
                format!("DROP USER IF EXISTS {}@'localhost'", shell::sql_literal(user)),
                "Failed to drop database user",
            ));
        }
        statements.push(("FLUSH PRIVILEGES".to_string(), "Failed to flush privileges"));

        for (sql, context) in &statements {
            scope.check()?;
            backend.run_database_statement(sql)?.check(context)?;
        }

        Ok(match user {
            Some(user) => format!("Dropped database {} and user {}", name, user),
            None => format!("Dropped database {}", name),
        })
    }
}

pub struct TerminateInstance;

impl Stage for TerminateInstance {
    fn step(&self) -> Step {
        Step::TerminateInstance
    }

    fn run(&self, ctx: &mut StageContext<'_>, scope: &StepScope<'_>) -> Result<String> {
        let provider = ctx.instances()?;
        let mut summary = Vec::new();

        // The key pair is deleted even when termination fails.
        let terminated = match ctx.site.instance_id.as_deref() {
            Some(instance_id) => provider.terminate_instance(instance_id).map(|()| {
                summary.push(format!("Instance {} terminated", instance_id));
            }),
            None => {
                summary.push("No instance on record".to_string());
                Ok(())
            }
        };

        if let Some(key_pair) = ctx.site.key_pair_name.as_deref() {
            match provider.delete_credential(key_pair) {
                Ok(()) => summary.push(format!("Key pair {} deleted", key_pair)),
                Err(err) => {
                    tracing::warn!(key_pair, error = %err, "Key pair not deleted");
                    scope.note(&format!("Key pair {} not deleted: {}", key_pair, err.message));
                    summary.push(format!(
                        "Key pair {} (non-critical): {}",
                        key_pair, err.message
                    ));
                }
            }
        }

        match terminated {
            Ok(()) => Ok(summary.join("\n")),
            Err(mut err) => {
                if !summary.is_empty() {
                    err.message = format!("{}\n{}", err.message, summary.join("\n"));
                }
                Err(err)
            }
        }
    }
}

pub struct DeleteDns;

impl Stage for DeleteDns {
    fn step(&self) -> Step {
        Step::DeleteDns
    }

    fn run(&self, ctx: &mut StageContext<'_>, _scope: &StepScope<'_>) -> Result<String> {
        if !ctx.site.domain_claimed {
            return Ok(UNCLAIMED.to_string());
        }
        match ctx.config.mode {
            Mode::Local => remove_hosts_entry(ctx),
            Mode::Remote => delete_dns_record(ctx),
        }
    }
}

fn remove_hosts_entry(ctx: &mut StageContext<'_>) -> Result<String> {
    let hosts_file = ctx.config.paths.hosts_file.clone();
    let domain = ctx.site.domain.clone();
    let backend = ctx.backend()?;

    let current = backend
        .execute(&format!("cat {}", shell::quote_path(&hosts_file)))?
        .check("Failed to read hosts file")?;

    match hosts::without_entry(&current.output, &domain) {
        Some(updated) => {
            if !backend.upload_content(updated.as_bytes(), &hosts_file)? {
                return Err(Error::remote_command_failed(RemoteCommandFailedDetails {
                    context: "Failed to update hosts file".to_string(),
                    exit_code: 1,
                    output: hosts_file,
                    host: None,
                }));
            }
            Ok(format!("Removed {} from {}", domain, hosts_file))
        }
        None => Ok(format!("No entry for {} in {}", domain, hosts_file)),
    }
}

fn delete_dns_record(ctx: &mut StageContext<'_>) -> Result<String> {
    if !ctx.config.dns_enabled() {
        return Ok("DNS not managed; nothing to delete".to_string());
    }
    if ctx.site.dns_record_id.is_none() {
        return Ok("No DNS record on record".to_string());
    }
    let Some(ip) = ctx.site.public_ip.clone() else {
        return Ok("No address on record; DNS record left in place".to_string());
    };

    let domain = ctx.site.domain.clone();
    ctx.dns()?.delete_record(&domain, &ip, ctx.config.dns.ttl)?;
    Ok(format!("DNS record for {} deleted", domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_chain_ends_with_hosts_cleanup() {
        let config = SitewrightConfig::default();
        let steps: Vec<Step> = stages(&config).iter().map(|s| s.step()).collect();
        assert_eq!(
            steps,
            vec![
                Step::RemoveNginx,
                Step::ReloadNginx,
                Step::DeleteFiles,
                Step::DropDatabase,
                Step::DeleteDns,
            ]
        );
    }

    #[test]
    fn remote_chain_terminates_before_dns() {
        let mut config = SitewrightConfig::default();
        config.mode = Mode::Remote;
        let steps: Vec<Step> = stages(&config).iter().map(|s| s.step()).collect();
        assert_eq!(steps[4], Step::TerminateInstance);
        assert_eq!(steps[5], Step::DeleteDns);
    }
}
