use serde_json::{json, Value};

use super::aws::is_not_found;
use super::{AwsCli, DnsProvider, Poll};
use crate::error::{Error, Result};

/// A records in one Route 53 hosted zone.
pub struct Route53Dns {
    cli: AwsCli,
    hosted_zone_id: String,
}

impl Route53Dns {
    pub fn new(region: &str, hosted_zone_id: &str) -> Self {
        Self {
            cli: AwsCli::new(region),
            hosted_zone_id: hosted_zone_id.to_string(),
        }
    }

    fn change(&self, action: &str, domain: &str, address: &str, ttl: u32) -> Result<Value> {
        self.cli.call(
            "route53",
            "change-resource-record-sets",
            &[
                "--hosted-zone-id".to_string(),
                self.hosted_zone_id.clone(),
                "--change-batch".to_string(),
                change_batch(action, domain, address, ttl).to_string(),
            ],
        )
    }
}

fn change_batch(action: &str, domain: &str, address: &str, ttl: u32) -> Value {
    json!({
        "Comment": format!("sitewright {} {}", action.to_ascii_lowercase(), domain),
        "Changes": [{
            "Action": action,
            "ResourceRecordSet": {
                "Name": domain,
                "Type": "A",
                "TTL": ttl,
                "ResourceRecords": [{ "Value": address }],
            },
        }],
    })
}

fn fqdn(domain: &str) -> String {
    format!("{}.", domain.trim_end_matches('.'))
}

fn has_a_record(response: &Value, domain: &str) -> bool {
    let wanted = fqdn(domain);
    response
        .get("ResourceRecordSets")
        .and_then(Value::as_array)
        .map(|sets| {
            sets.iter().any(|set| {
                set.get("Name").and_then(Value::as_str) == Some(wanted.as_str())
                    && set.get("Type").and_then(Value::as_str) == Some("A")
            })
        })
        .unwrap_or(false)
}

impl DnsProvider for Route53Dns {
    fn create_record(&self, domain: &str, address: &str, ttl: u32) -> Result<String> {
        let response = self.change("CREATE", domain, address, ttl)?;
        response
            .pointer("/ChangeInfo/Id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::provider_request_failed(
                    "route53 change-resource-record-sets",
                    "response has no change id",
                )
            })
    }

    fn wait_for_propagation(&self, change_token: &str, poll: &Poll) -> Result<bool> {
        for attempt in 1..=poll.attempts {
            match self.cli.call(
                "route53",
                "get-change",
                &["--id".to_string(), change_token.to_string()],
            ) {
                Ok(response) => {
                    if response.pointer("/ChangeInfo/Status").and_then(Value::as_str)
                        == Some("INSYNC")
                    {
                        return Ok(true);
                    }
                }
                Err(err) => {
                    tracing::warn!(change = change_token, error = %err, attempt, "DNS change lookup failed");
                }
            }
            if attempt < poll.attempts {
                poll.pause()?;
            }
        }
        Ok(false)
    }

    fn delete_record(&self, domain: &str, address: &str, ttl: u32) -> Result<bool> {
        match self.change("DELETE", domain, address, ttl) {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => {
                tracing::info!(domain, "DNS record already absent");
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    fn record_exists(&self, domain: &str) -> Result<bool> {
        let response = self.cli.call(
            "route53",
            "list-resource-record-sets",
            &[
                "--hosted-zone-id".to_string(),
                self.hosted_zone_id.clone(),
                "--start-record-name".to_string(),
                domain.to_string(),
                "--start-record-type".to_string(),
                "A".to_string(),
                "--max-items".to_string(),
                "1".to_string(),
            ],
        );
        match response {
            Ok(response) => Ok(has_a_record(&response, domain)),
            Err(err) => {
                tracing::warn!(domain, error = %err, "DNS lookup failed, treating record as absent");
                Ok(false)
            }
        }
    }
}
