use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::process::Command;
use std::time::Duration;

use super::{port_open, InstanceProvider, InstanceStatus, LaunchedInstance, Poll};
use crate::config::SitewrightConfig;
use crate::error::{Error, Result};
use crate::random;
use crate::site::Site;
use crate::utils::template::{self, TemplateVars};

const BOOTSTRAP_TEMPLATE: &str = include_str!("../../../templates/instance-bootstrap.sh");

const MANAGED_BY: &str = "sitewright";

/// Pause after the SSH port opens so sshd finishes starting.
const SSH_SETTLE: Duration = Duration::from_secs(10);

/// Thin wrapper over the `aws` command line tool with JSON output.
#[derive(Debug, Clone)]
pub struct AwsCli {
    region: String,
}

impl AwsCli {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
        }
    }

    /// Run `aws <service> <operation> ...` and parse its JSON output.
    /// Operations with no output yield `Value::Null`.
    pub fn call(&self, service: &str, operation: &str, args: &[String]) -> Result<Value> {
        let label = format!("{} {}", service, operation);
        tracing::debug!(operation = %label, region = %self.region, "aws call");

        let output = Command::new("aws")
            .arg(service)
            .arg(operation)
            .args(args)
            .args(["--region", &self.region, "--output", "json"])
            .output()
            .map_err(|e| Error::provider_request_failed(&label, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(Error::provider_request_failed(&label, stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout)
            .map_err(|e| Error::internal_json(e.to_string(), Some(label)))
    }
}

/// `ProviderRequestFailed` whose provider message says the resource is gone.
pub(crate) fn is_not_found(err: &Error) -> bool {
    let text = err.message.to_ascii_lowercase();
    text.contains("not found") || text.contains("notfound") || text.contains("does not exist")
}

fn str_field<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn required<'a>(value: &'a Value, pointer: &str, operation: &str) -> Result<&'a str> {
    str_field(value, pointer).ok_or_else(|| {
        Error::provider_request_failed(operation, format!("response has no {}", pointer))
    })
}

/// EC2 instances launched through the AWS CLI.
pub struct Ec2Provider {
    cli: AwsCli,
    config: SitewrightConfig,
}

impl Ec2Provider {
    pub fn new(config: &SitewrightConfig) -> Self {
        Self {
            cli: AwsCli::new(&config.aws.region),
            config: config.clone(),
        }
    }

    fn key_pair_name(&self, site: &Site) -> String {
        format!(
            "{}{}-{}",
            self.config.aws.key_name_prefix,
            site.id,
            random::lowercase_alphanumeric(8)
        )
    }

    fn create_key_pair(&self, site: &Site) -> Result<(String, SecretString)> {
        let name = self.key_pair_name(site);
        let tags = json!([{
            "ResourceType": "key-pair",
            "Tags": [
                { "Key": "ManagedBy", "Value": MANAGED_BY },
                { "Key": "SiteId", "Value": site.id.to_string() },
            ],
        }]);

        let response = self.cli.call(
            "ec2",
            "create-key-pair",
            &[
                "--key-name".to_string(),
                name.clone(),
                "--tag-specifications".to_string(),
                tags.to_string(),
            ],
        )?;
        let material = required(&response, "/KeyMaterial", "ec2 create-key-pair")?;
        Ok((name, SecretString::from(material.to_string())))
    }

    fn resolve_security_group(&self) -> Result<String> {
        let name = &self.config.aws.security_group_name;
        let existing = self.cli.call(
            "ec2",
            "describe-security-groups",
            &["--group-names".to_string(), name.clone()],
        );
        if let Ok(response) = existing {
            if let Some(id) = str_field(&response, "/SecurityGroups/0/GroupId") {
                return Ok(id.to_string());
            }
        }

        log_status!("aws", "Creating security group '{}'", name);
        let tags = json!([{
            "ResourceType": "security-group",
            "Tags": [{ "Key": "ManagedBy", "Value": MANAGED_BY }],
        }]);
        let created = self.cli.call(
            "ec2",
            "create-security-group",
            &[
                "--group-name".to_string(),
                name.clone(),
                "--description".to_string(),
                "WordPress sites managed by sitewright".to_string(),
                "--tag-specifications".to_string(),
                tags.to_string(),
            ],
        )?;
        let group_id = required(&created, "/GroupId", "ec2 create-security-group")?.to_string();

        self.cli.call(
            "ec2",
            "authorize-security-group-ingress",
            &[
                "--group-id".to_string(),
                group_id.clone(),
                "--ip-permissions".to_string(),
                ingress_rules(self.config.aws.ssh_port).to_string(),
            ],
        )?;

        Ok(group_id)
    }

    fn bootstrap_script(&self, db_root_password: &SecretString) -> String {
        template::render(
            BOOTSTRAP_TEMPLATE,
            &[
                (TemplateVars::DB_ROOT_PASSWORD, db_root_password.expose_secret()),
                (TemplateVars::WEB_ROOT, &self.config.paths.web_root),
                (TemplateVars::WEB_USER, &self.config.wordpress.cli_user),
                (TemplateVars::PHP_FPM_SOCKET, &self.config.paths.php_fpm_socket),
                (TemplateVars::NGINX_AVAILABLE, &self.config.paths.nginx_available),
                (TemplateVars::NGINX_ENABLED, &self.config.paths.nginx_enabled),
            ],
        )
    }

    fn run_instance(
        &self,
        site: &Site,
        key_pair_name: &str,
        security_group_id: &str,
        user_data: &str,
    ) -> Result<String> {
        let tags = json!([{
            "ResourceType": "instance",
            "Tags": [
                { "Key": "Name", "Value": format!("WordPress-{}", site.domain) },
                { "Key": "ManagedBy", "Value": MANAGED_BY },
                { "Key": "SiteId", "Value": site.id.to_string() },
                { "Key": "Domain", "Value": site.domain },
            ],
        }]);

        let response = self.cli.call(
            "ec2",
            "run-instances",
            &[
                "--image-id".to_string(),
                self.config.aws.ami_id.clone(),
                "--instance-type".to_string(),
                self.config.aws.instance_type.clone(),
                "--count".to_string(),
                "1".to_string(),
                "--key-name".to_string(),
                key_pair_name.to_string(),
                "--security-group-ids".to_string(),
                security_group_id.to_string(),
                "--user-data".to_string(),
                user_data.to_string(),
                "--tag-specifications".to_string(),
                tags.to_string(),
            ],
        )?;
        Ok(required(&response, "/Instances/0/InstanceId", "ec2 run-instances")?.to_string())
    }
}

fn ingress_rules(ssh_port: u16) -> Value {
    let rule = |port: u16, description: &str| {
        json!({
            "IpProtocol": "tcp",
            "FromPort": port,
            "ToPort": port,
            "IpRanges": [{ "CidrIp": "0.0.0.0/0", "Description": description }],
        })
    };
    json!([
        rule(ssh_port, "SSH access"),
        rule(80, "HTTP access"),
        rule(443, "HTTPS access"),
    ])
}

/// Instance state out of a describe-instances response.
enum Observed {
    Ready(InstanceStatus),
    Terminal(String),
    Waiting(String),
}

fn observe_instance(instance_id: &str, response: &Value) -> Result<Observed> {
    let instance = response
        .pointer("/Reservations/0/Instances/0")
        .ok_or_else(|| Error::instance_not_ready(instance_id, "Instance not found"))?;

    let state = str_field(instance, "/State/Name").unwrap_or("unknown").to_string();
    let public_ip = str_field(instance, "/PublicIpAddress").filter(|ip| !ip.is_empty());

    Ok(match (state.as_str(), public_ip) {
        ("running", Some(ip)) => Observed::Ready(InstanceStatus {
            instance_id: instance_id.to_string(),
            public_ip: ip.to_string(),
            public_dns: str_field(instance, "/PublicDnsName")
                .filter(|dns| !dns.is_empty())
                .map(str::to_string),
            state,
        }),
        ("terminated" | "shutting-down", _) => Observed::Terminal(state),
        _ => Observed::Waiting(state),
    })
}

impl InstanceProvider for Ec2Provider {
    fn launch_instance(&self, site: &Site) -> Result<LaunchedInstance> {
        let db_root_password = random::secret(self.config.security.root_password_length);
        let (key_pair_name, private_key) = self.create_key_pair(site)?;

        let launched = self.resolve_security_group().and_then(|security_group_id| {
            let user_data = self.bootstrap_script(&db_root_password);
            let instance_id =
                self.run_instance(site, &key_pair_name, &security_group_id, &user_data)?;
            Ok((instance_id, security_group_id))
        });

        match launched {
            Ok((instance_id, security_group_id)) => {
                tracing::info!(site_id = %site.id, instance_id = %instance_id, "Instance launched");
                Ok(LaunchedInstance {
                    instance_id,
                    key_pair_name,
                    private_key,
                    security_group_id,
                    db_root_password,
                })
            }
            Err(err) => {
                if let Err(cleanup) = self.delete_credential(&key_pair_name) {
                    tracing::warn!(
                        key_pair = %key_pair_name,
                        error = %cleanup,
                        "Failed to delete key pair after launch failure"
                    );
                }
                Err(err)
            }
        }
    }

    fn wait_for_instance_ready(&self, instance_id: &str, poll: &Poll) -> Result<InstanceStatus> {
        for attempt in 1..=poll.attempts {
            let response = self.cli.call(
                "ec2",
                "describe-instances",
                &["--instance-ids".to_string(), instance_id.to_string()],
            );

            match response {
                Ok(response) => match observe_instance(instance_id, &response)? {
                    Observed::Ready(status) => return Ok(status),
                    Observed::Terminal(state) => {
                        return Err(Error::instance_not_ready(
                            instance_id,
                            format!("Instance is {}", state),
                        ));
                    }
                    Observed::Waiting(state) => {
                        tracing::debug!(instance_id, state = %state, attempt, "Instance not ready");
                    }
                },
                Err(err) if attempt == poll.attempts => return Err(err),
                Err(err) => {
                    tracing::warn!(instance_id, error = %err, attempt, "Instance status check failed");
                }
            }

            if attempt < poll.attempts {
                poll.pause()?;
            }
        }

        Err(Error::instance_not_ready(
            instance_id,
            "Instance did not become ready within timeout",
        ))
    }

    fn wait_for_session_ready(&self, address: &str, poll: &Poll) -> Result<bool> {
        let timeout = Duration::from_secs(self.config.timeouts.ssh_connect_timeout_secs.max(1));
        for attempt in 1..=poll.attempts {
            if port_open(address, self.config.aws.ssh_port, timeout) {
                poll.sleep(SSH_SETTLE)?;
                return Ok(true);
            }
            tracing::debug!(address, attempt, "SSH port not open yet");
            if attempt < poll.attempts {
                poll.pause()?;
            }
        }
        Ok(false)
    }

    fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.cli.call(
            "ec2",
            "terminate-instances",
            &["--instance-ids".to_string(), instance_id.to_string()],
        )?;
        Ok(())
    }

    fn delete_credential(&self, key_pair_name: &str) -> Result<()> {
        match self.cli.call(
            "ec2",
            "delete-key-pair",
            &["--key-name".to_string(), key_pair_name.to_string()],
        ) {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_instance_with_address_is_ready() {
        let response = json!({
            "Reservations": [{ "Instances": [{
                "State": { "Name": "running" },
                "PublicIpAddress": "203.0.113.7",
                "PublicDnsName": "ec2-203-0-113-7.compute-1.amazonaws.com"
            }]}]
        });
        match observe_instance("i-1", &response).unwrap() {
            Observed::Ready(status) => {
                assert_eq!(status.public_ip, "203.0.113.7");
                assert_eq!(status.state, "running");
                assert!(status.public_dns.is_some());
            }
            _ => panic!("expected ready"),
        }
    }

    #[test]
    fn running_without_address_keeps_waiting() {
        let response = json!({
            "Reservations": [{ "Instances": [{ "State": { "Name": "running" } }]}]
        });
        assert!(matches!(
            observe_instance("i-1", &response).unwrap(),
            Observed::Waiting(_)
        ));
    }

    #[test]
    fn terminal_states_are_reported() {
        for state in ["terminated", "shutting-down"] {
            let response = json!({
                "Reservations": [{ "Instances": [{ "State": { "Name": state } }]}]
            });
            assert!(matches!(
                observe_instance("i-1", &response).unwrap(),
                Observed::Terminal(s) if s == state
            ));
        }
    }

    #[test]
    fn missing_instance_is_an_error() {
        let err = observe_instance("i-404", &json!({ "Reservations": [] }))
            .err()
            .unwrap();
        assert_eq!(err.message, "Instance not found: i-404");
    }

    #[test]
    fn ingress_opens_ssh_and_web_ports() {
        let rules = ingress_rules(22);
        let ports: Vec<u64> = rules
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["FromPort"].as_u64().unwrap())
            .collect();
        assert_eq!(ports, vec![22, 80, 443]);
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found(&Error::provider_request_failed(
            "ec2 delete-key-pair",
            "An error occurred (InvalidKeyPair.NotFound)"
        )));
        assert!(!is_not_found(&Error::provider_request_failed(
            "ec2 delete-key-pair",
            "UnauthorizedOperation"
        )));
    }

    #[test]
    fn bootstrap_script_carries_root_secret_and_paths() {
        let provider = Ec2Provider::new(&SitewrightConfig::default());
        let script = provider.bootstrap_script(&SecretString::from("S3cret".to_string()));
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("IDENTIFIED BY 'S3cret'"));
        assert!(script.contains("mkdir -p /var/www /etc/nginx/sites-available"));
        assert!(!template::is_present(&script, TemplateVars::WEB_USER));
    }

    #[test]
    fn key_pair_names_are_prefixed_and_unique() {
        let provider = Ec2Provider::new(&SitewrightConfig::default());
        let site = crate::site::tests_support::site("example.com");
        let a = provider.key_pair_name(&site);
        let b = provider.key_pair_name(&site);
        assert!(a.starts_with(&format!("sitewright-{}-", site.id)));
        assert_ne!(a, b);
    }
}
