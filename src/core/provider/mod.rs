//! Cloud resources for remote-mode sites: instances and DNS records.

mod aws;
mod route53;

pub use aws::{AwsCli, Ec2Provider};
pub use route53::Route53Dns;

use secrecy::SecretString;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::Result;
use crate::pipeline::Deadline;
use crate::site::Site;

/// Everything allocated for one site by [`InstanceProvider::launch_instance`].
#[derive(Debug, Clone)]
pub struct LaunchedInstance {
    pub instance_id: String,
    pub key_pair_name: String,
    pub private_key: SecretString,
    pub security_group_id: String,
    pub db_root_password: SecretString,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub public_ip: String,
    pub public_dns: Option<String>,
    pub state: String,
}

/// Bounded polling: fixed attempts with a fixed delay, cut short by the
/// step deadline when there is one.
#[derive(Debug, Clone, Copy)]
pub struct Poll {
    pub attempts: u32,
    pub delay: Duration,
    pub deadline: Option<Deadline>,
}

impl Poll {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            deadline: None,
        }
    }

    pub fn within(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sleep between attempts. Fails with a timeout once the deadline passes.
    pub fn pause(&self) -> Result<()> {
        self.sleep(self.delay)
    }

    pub fn sleep(&self, duration: Duration) -> Result<()> {
        match &self.deadline {
            Some(deadline) => deadline.sleep(duration),
            None => {
                std::thread::sleep(duration);
                Ok(())
            }
        }
    }
}

/// Allocates and tears down one compute instance per site.
pub trait InstanceProvider: Send + Sync {
    /// Create a key pair, resolve the shared security group and start an
    /// instance. The key pair is deleted again if the instance cannot start.
    fn launch_instance(&self, site: &Site) -> Result<LaunchedInstance>;

    /// Poll until the instance runs with a public address. Terminal states
    /// fail immediately; running out of attempts fails too.
    fn wait_for_instance_ready(&self, instance_id: &str, poll: &Poll) -> Result<InstanceStatus>;

    /// Poll the SSH port. `Ok(false)` when attempts run out.
    fn wait_for_session_ready(&self, address: &str, poll: &Poll) -> Result<bool>;

    fn terminate_instance(&self, instance_id: &str) -> Result<()>;

    /// Delete a key pair. A key pair that no longer exists counts as deleted.
    fn delete_credential(&self, key_pair_name: &str) -> Result<()>;
}

/// A-record lifecycle in the hosted zone.
pub trait DnsProvider: Send + Sync {
    /// Create the record and return the provider's change token.
    fn create_record(&self, domain: &str, address: &str, ttl: u32) -> Result<String>;

    /// `Ok(false)` when the change is still pending after all attempts.
    fn wait_for_propagation(&self, change_token: &str, poll: &Poll) -> Result<bool>;

    /// `Ok(true)` also when the record was already gone.
    fn delete_record(&self, domain: &str, address: &str, ttl: u32) -> Result<bool>;

    fn record_exists(&self, domain: &str) -> Result<bool>;
}

/// One TCP connect attempt.
pub fn port_open(address: &str, port: u16, timeout: Duration) -> bool {
    let Ok(mut addrs) = (address, port).to_socket_addrs() else {
        return false;
    };
    addrs.any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}
