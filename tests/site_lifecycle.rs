use secrecy::{ExposeSecret, SecretString};
use std::sync::{Arc, Mutex};

use sitewright::crypto::{AgeCipher, SecretCipher};
use sitewright::engine::Infrastructure;
use sitewright::executor::{CommandResult, ExecutionBackend};
use sitewright::site::SiteFilter;
use sitewright::probe::{ProbeResponse, ProbeTarget, SiteProbe};
use sitewright::provider::{DnsProvider, InstanceProvider, InstanceStatus, LaunchedInstance, Poll};
use sitewright::store::{SiteRegistry, SqliteStore, StepLogStore};
use sitewright::{
    Dispatcher, Error, LogStatus, Mode, NewSite, Provisioner, Result, Site, SiteStatus,
    SitewrightConfig, Step,
};

const HOSTS: &str = "127.0.0.1\tlocalhost\n";
const REMOTE_IP: &str = "203.0.113.10";

#[derive(Default)]
struct FakeBackend {
    commands: Mutex<Vec<String>>,
    fail_on: Mutex<Vec<String>>,
    hosts: Mutex<String>,
}

impl FakeBackend {
    fn new() -> Self {
        let backend = Self::default();
        *backend.hosts.lock().unwrap() = HOSTS.to_string();
        backend
    }

    fn fail_on(&self, needle: &str) {
        self.fail_on.lock().unwrap().push(needle.to_string());
    }

    fn hosts(&self) -> String {
        self.hosts.lock().unwrap().clone()
    }

    fn ran(&self, needle: &str) -> bool {
        self.commands.lock().unwrap().iter().any(|c| c.contains(needle))
    }

    fn respond(&self, command: &str) -> CommandResult {
        self.commands.lock().unwrap().push(command.to_string());
        if self.fail_on.lock().unwrap().iter().any(|n| command.contains(n.as_str())) {
            return CommandResult::failed(1, format!("refused: {}", command));
        }
        if command.starts_with("cat ") {
            return CommandResult::ok(self.hosts());
        }
        if command.contains("is-active") {
            return CommandResult::ok("active\n");
        }
        CommandResult::ok("")
    }
}

impl ExecutionBackend for FakeBackend {
    fn describe(&self) -> String {
        "fake".to_string()
    }

    fn execute(&self, command: &str) -> Result<CommandResult> {
        Ok(self.respond(command))
    }

    fn run_database_statement(&self, sql: &str) -> Result<CommandResult> {
        Ok(self.respond(&format!("mysql: {}", sql)))
    }

    fn upload_content(&self, content: &[u8], path: &str) -> Result<bool> {
        self.commands.lock().unwrap().push(format!("upload {}", path));
        if path == "/etc/hosts" {
            *self.hosts.lock().unwrap() = String::from_utf8_lossy(content).to_string();
        }
        Ok(true)
    }
}

#[derive(Default)]
struct FakeInstances {
    ssh_ready: bool,
    fail_terminate: bool,
    terminated: Mutex<Vec<String>>,
    deleted_keys: Mutex<Vec<String>>,
}

impl InstanceProvider for FakeInstances {
    fn launch_instance(&self, site: &Site) -> Result<LaunchedInstance> {
        Ok(LaunchedInstance {
            instance_id: "i-0abc".to_string(),
            key_pair_name: format!("wordpress-{}-k", site.id),
            private_key: SecretString::from("-----BEGIN KEY-----".to_string()),
            security_group_id: "sg-1".to_string(),
            db_root_password: SecretString::from("root-secret-value".to_string()),
        })
    }

    fn wait_for_instance_ready(&self, instance_id: &str, _poll: &Poll) -> Result<InstanceStatus> {
        Ok(InstanceStatus {
            instance_id: instance_id.to_string(),
            public_ip: REMOTE_IP.to_string(),
            public_dns: None,
            state: "running".to_string(),
        })
    }

    fn wait_for_session_ready(&self, _address: &str, _poll: &Poll) -> Result<bool> {
        Ok(self.ssh_ready)
    }

    fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        if self.fail_terminate {
            return Err(Error::provider_request_failed(
                "ec2 terminate-instances",
                "UnauthorizedOperation",
            ));
        }
        self.terminated.lock().unwrap().push(instance_id.to_string());
        Ok(())
    }

    fn delete_credential(&self, key_pair_name: &str) -> Result<()> {
        self.deleted_keys.lock().unwrap().push(key_pair_name.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeDns {
    existing: bool,
    created: Mutex<Vec<(String, String)>>,
    deleted: Mutex<Vec<(String, String)>>,
}

impl DnsProvider for FakeDns {
    fn create_record(&self, domain: &str, address: &str, _ttl: u32) -> Result<String> {
        self.created
            .lock()
            .unwrap()
            .push((domain.to_string(), address.to_string()));
        Ok("/change/C123".to_string())
    }

    fn wait_for_propagation(&self, _change_token: &str, _poll: &Poll) -> Result<bool> {
        Ok(true)
    }

    fn delete_record(&self, domain: &str, address: &str, _ttl: u32) -> Result<bool> {
        self.deleted
            .lock()
            .unwrap()
            .push((domain.to_string(), address.to_string()));
        Ok(true)
    }

    fn record_exists(&self, _domain: &str) -> Result<bool> {
        Ok(self.existing)
    }
}

struct FakeProbe {
    status: u16,
    targets: Mutex<Vec<ProbeTarget>>,
}

impl SiteProbe for FakeProbe {
    fn fetch(&self, target: &ProbeTarget) -> Result<ProbeResponse> {
        self.targets.lock().unwrap().push(target.clone());
        Ok(ProbeResponse {
            status: self.status,
            body: "<link href=\"/wp-content/themes/x.css\">".to_string(),
        })
    }
}

struct FakeInfra {
    backend: Arc<FakeBackend>,
    instances: Option<FakeInstances>,
    dns: Option<FakeDns>,
    probe: FakeProbe,
}

impl FakeInfra {
    fn local() -> Self {
        Self {
            backend: Arc::new(FakeBackend::new()),
            instances: None,
            dns: None,
            probe: FakeProbe {
                status: 200,
                targets: Mutex::new(Vec::new()),
            },
        }
    }

    fn remote(ssh_ready: bool) -> Self {
        Self {
            instances: Some(FakeInstances {
                ssh_ready,
                ..Default::default()
            }),
            dns: Some(FakeDns::default()),
            ..Self::local()
        }
    }
}

impl Infrastructure for FakeInfra {
    fn open_backend(&self, _site: &Site) -> Result<Arc<dyn ExecutionBackend>> {
        Ok(self.backend.clone())
    }

    fn instances(&self) -> Option<&dyn InstanceProvider> {
        self.instances.as_ref().map(|p| p as &dyn InstanceProvider)
    }

    fn dns(&self) -> Option<&dyn DnsProvider> {
        self.dns.as_ref().map(|d| d as &dyn DnsProvider)
    }

    fn probe(&self) -> &dyn SiteProbe {
        &self.probe
    }
}

fn fast_config(mode: Mode) -> SitewrightConfig {
    let mut config = SitewrightConfig::default();
    config.mode = mode;
    config.timeouts.setup_grace_secs = 0;
    config.timeouts.verify_settle_secs = 0;
    config.timeouts.instance_delay_secs = 0;
    config.timeouts.ssh_delay_secs = 0;
    config.dns.propagation_interval_secs = 0;
    if mode == Mode::Remote {
        config.dns.hosted_zone_id = "Z1".to_string();
    }
    config
}

struct Harness {
    provisioner: Arc<Provisioner>,
    store: Arc<SqliteStore>,
    infra: Arc<FakeInfra>,
}

fn harness(config: SitewrightConfig, infra: FakeInfra) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory(Arc::new(AgeCipher::generate())).unwrap());
    let infra = Arc::new(infra);
    let provisioner = Provisioner::new(config, store.clone(), store.clone(), infra.clone());
    Harness {
        provisioner: Arc::new(provisioner),
        store,
        infra,
    }
}

fn request(domain: &str) -> NewSite {
    NewSite {
        domain: domain.to_string(),
        admin_username: "admin".to_string(),
        admin_password: SecretString::from("correct-horse-battery".to_string()),
        admin_email: "admin@example.com".to_string(),
    }
}

/// Register straight through the registry, as a request that raced past the
/// create-time domain check would.
fn register_directly(h: &Harness, domain: &str) -> Site {
    let new = request(domain).validated(h.provisioner.config()).unwrap();
    h.store.create(new).unwrap()
}

fn steps_and_statuses(h: &Harness, site: &Site) -> Vec<(Step, LogStatus)> {
    h.store
        .list_for_site(site.id)
        .unwrap()
        .into_iter()
        .map(|log| (log.step, log.status))
        .collect()
}

#[test]
fn local_site_goes_live() {
    let h = harness(fast_config(Mode::Local), FakeInfra::local());
    let site = h.provisioner.create_site(request("Blog")).unwrap();
    assert_eq!(site.domain, "blog.test");
    assert_eq!(site.status, SiteStatus::Pending);

    let site = h.provisioner.provision(site.id).unwrap();

    assert_eq!(site.status, SiteStatus::Live);
    assert!(site.provisioned_at.is_some());
    assert!(site.domain_claimed);
    assert_eq!(site.root_path.as_deref(), Some("/var/www/blog.test"));
    assert_eq!(site.public_ip.as_deref(), Some("127.0.0.1"));
    assert_eq!(site.db_name.as_deref(), Some("wp_blog_test"));
    assert!(site.db_username.as_deref().unwrap().starts_with("wp_"));
    assert_eq!(site.db_password.as_ref().unwrap().expose_secret().len(), 32);

    let logs = steps_and_statuses(&h, &site);
    assert_eq!(logs.len(), 8);
    assert!(logs.iter().all(|(_, status)| *status == LogStatus::Completed));
    assert_eq!(logs[0].0, Step::ValidateDomain);
    assert_eq!(logs[7].0, Step::VerifySite);

    assert!(h.infra.backend.hosts().contains("127.0.0.1\tblog.test"));
    assert!(h.infra.backend.ran("nginx -t"));
    let targets = h.infra.probe.targets.lock().unwrap();
    assert_eq!(targets[0].url, "http://blog.test/");
}

#[test]
fn failure_at_each_stage_leaves_one_failed_row_last() {
    let cases = [
        ("mkdir", Step::PrepareFilesystem, 2),
        ("CREATE DATABASE", Step::CreateDatabase, 3),
        ("core download", Step::InstallWordpress, 4),
        ("nginx -t", Step::ConfigureNginx, 5),
        ("systemctl reload", Step::ReloadNginx, 6),
        ("cat ", Step::UpdateDns, 7),
    ];

    for (needle, failed_step, rows) in cases {
        let h = harness(fast_config(Mode::Local), FakeInfra::local());
        h.infra.backend.fail_on(needle);
        let site = h.provisioner.create_site(request("shop")).unwrap();

        let err = h.provisioner.provision(site.id).unwrap_err();
        assert_eq!(err.code.as_str(), "remote.command_failed", "{}", needle);

        let logs = steps_and_statuses(&h, &site);
        assert_eq!(logs.len(), rows, "{}", needle);
        assert_eq!(logs[rows - 1], (failed_step, LogStatus::Failed));
        assert!(logs[..rows - 1]
            .iter()
            .all(|(_, status)| *status == LogStatus::Completed));

        let site = h.provisioner.get(site.id).unwrap();
        assert_eq!(site.status, SiteStatus::Failed);
        assert!(site.provisioned_at.is_none());
    }
}

#[test]
fn failed_verification_fails_the_site() {
    let mut infra = FakeInfra::local();
    infra.probe.status = 502;
    let h = harness(fast_config(Mode::Local), infra);
    let site = h.provisioner.create_site(request("news")).unwrap();

    let err = h.provisioner.provision(site.id).unwrap_err();
    assert_eq!(err.code.as_str(), "site.verification_failed");

    let logs = h.provisioner.logs(site.id).unwrap();
    assert_eq!(logs.site_status, SiteStatus::Failed);
    assert_eq!(logs.logs.len(), 8);
    assert_eq!(logs.logs[7].status, LogStatus::Failed);
    assert!(logs.logs[7].error.as_deref().unwrap().contains("502"));
}

#[test]
fn only_pending_sites_can_be_provisioned() {
    let h = harness(fast_config(Mode::Local), FakeInfra::local());
    let site = h.provisioner.create_site(request("twice")).unwrap();
    h.provisioner.provision(site.id).unwrap();

    let err = h.provisioner.provision(site.id).unwrap_err();
    assert_eq!(err.code.as_str(), "site.invalid_state");
    assert_eq!(steps_and_statuses(&h, &site).len(), 8);
}

#[test]
fn duplicate_domain_fails_validation_without_side_effects() {
    let h = harness(fast_config(Mode::Local), FakeInfra::local());
    let first = h.provisioner.create_site(request("dupe")).unwrap();
    h.provisioner.provision(first.id).unwrap();
    let commands_before = h.infra.backend.commands.lock().unwrap().len();

    let second = register_directly(&h, "dupe.test");
    let err = h.provisioner.provision(second.id).unwrap_err();

    assert_eq!(err.code.as_str(), "domain.taken");
    assert_eq!(
        steps_and_statuses(&h, &second),
        vec![(Step::ValidateDomain, LogStatus::Failed)]
    );
    assert_eq!(h.infra.backend.commands.lock().unwrap().len(), commands_before);
    assert!(!h.provisioner.get(second.id).unwrap().domain_claimed);
}

#[test]
fn create_rejects_domain_of_non_destroyed_site() {
    let h = harness(fast_config(Mode::Local), FakeInfra::local());
    let first = h.provisioner.create_site(request("twin")).unwrap();

    let err = h.provisioner.create_site(request("twin.test")).unwrap_err();
    assert_eq!(err.code.as_str(), "domain.taken");

    h.provisioner.provision(first.id).unwrap();
    let err = h.provisioner.create_site(request("TWIN")).unwrap_err();
    assert_eq!(err.code.as_str(), "domain.taken");
    assert_eq!(h.provisioner.list(&SiteFilter::default()).unwrap().len(), 1);

    h.provisioner.destroy(first.id).unwrap();
    let again = h.provisioner.create_site(request("twin")).unwrap();
    assert_eq!(again.status, SiteStatus::Pending);
}

#[test]
fn concurrent_claims_let_exactly_one_site_win() {
    let h = harness(fast_config(Mode::Local), FakeInfra::local());
    let a = h.provisioner.create_site(request("race")).unwrap();
    let b = register_directly(&h, "race");

    let dispatcher = Dispatcher::new(h.provisioner.clone());
    let ha = dispatcher.spawn_provision(a.id).unwrap();
    let hb = dispatcher.spawn_provision(b.id).unwrap();
    let results = [Dispatcher::join(ha), Dispatcher::join(hb)];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(loser.code.as_str(), "domain.taken");

    let statuses: Vec<SiteStatus> = [a.id, b.id]
        .iter()
        .map(|id| h.provisioner.get(*id).unwrap().status)
        .collect();
    assert!(statuses.contains(&SiteStatus::Live));
    assert!(statuses.contains(&SiteStatus::Failed));
}

#[test]
fn destroy_reaches_destroyed_even_when_every_step_fails() {
    let h = harness(fast_config(Mode::Local), FakeInfra::local());
    let site = h.provisioner.create_site(request("doomed")).unwrap();
    h.provisioner.provision(site.id).unwrap();

    for needle in ["rm ", "systemctl reload", "mysql:", "cat "] {
        h.infra.backend.fail_on(needle);
    }
    let outcome = h.provisioner.destroy(site.id).unwrap();

    assert_eq!(outcome.site.status, SiteStatus::Destroyed);
    assert!(outcome.site.destroyed_at.is_some());
    assert_eq!(outcome.warnings.len(), 5);
    assert!(outcome.warnings[0].starts_with("Remove Nginx Config (non-critical): "));

    let logs = steps_and_statuses(&h, &site);
    assert_eq!(logs.len(), 8 + 5);
    assert!(logs[8..]
        .iter()
        .all(|(_, status)| *status == LogStatus::Completed));
}

#[test]
fn destroy_cleans_up_local_site() {
    let h = harness(fast_config(Mode::Local), FakeInfra::local());
    let site = h.provisioner.create_site(request("tidy")).unwrap();
    h.provisioner.provision(site.id).unwrap();

    let outcome = h.provisioner.destroy(site.id).unwrap();

    assert!(outcome.warnings.is_empty());
    assert_eq!(h.infra.backend.hosts(), HOSTS);
    assert!(h.infra.backend.ran("rm -rf '/var/www/tidy.test'"));
    assert!(h.infra.backend.ran("DROP DATABASE IF EXISTS `wp_tidy_test`"));

    let err = h.provisioner.destroy(site.id).unwrap_err();
    assert_eq!(err.code.as_str(), "site.invalid_state");
}

#[test]
fn destroying_unclaimed_site_leaves_domain_resources_alone() {
    let h = harness(fast_config(Mode::Local), FakeInfra::local());
    let owner = h.provisioner.create_site(request("shared")).unwrap();
    h.provisioner.provision(owner.id).unwrap();
    let loser = register_directly(&h, "shared");
    h.provisioner.provision(loser.id).unwrap_err();

    h.provisioner.destroy(loser.id).unwrap();

    assert!(h.infra.backend.hosts().contains("shared.test"));
    assert!(!h.infra.backend.ran("rm -f"));
    assert_eq!(h.provisioner.get(owner.id).unwrap().status, SiteStatus::Live);
}

#[test]
fn force_delete_requires_destroyed_site() {
    let h = harness(fast_config(Mode::Local), FakeInfra::local());
    let site = h.provisioner.create_site(request("gone")).unwrap();
    h.provisioner.provision(site.id).unwrap();

    let err = h.provisioner.force_delete(site.id).unwrap_err();
    assert_eq!(err.code.as_str(), "site.invalid_state");

    h.provisioner.destroy(site.id).unwrap();
    h.provisioner.force_delete(site.id).unwrap();

    let err = h.provisioner.get(site.id).unwrap_err();
    assert_eq!(err.code.as_str(), "site.not_found");
    assert!(h.store.list_for_site(site.id).unwrap().is_empty());
}

#[test]
fn secrets_are_encrypted_at_rest() {
    let cipher = Arc::new(AgeCipher::generate());
    let store = SqliteStore::open_in_memory(cipher.clone()).unwrap();
    let site = store
        .create(request("vault").validated(&fast_config(Mode::Local)).unwrap())
        .unwrap();

    let read = store.get(site.id).unwrap();
    assert_eq!(read.admin_password.expose_secret(), "correct-horse-battery");

    let sealed = cipher
        .encrypt(&SecretString::from("correct-horse-battery".to_string()))
        .unwrap();
    assert!(!sealed.contains("correct-horse-battery"));
    assert_eq!(
        cipher.decrypt(&sealed).unwrap().expose_secret(),
        "correct-horse-battery"
    );
}

#[test]
fn remote_site_goes_live_and_is_torn_down() {
    let h = harness(fast_config(Mode::Remote), FakeInfra::remote(true));
    let site = h.provisioner.create_site(request("cloud.example.com")).unwrap();
    assert_eq!(site.domain, "cloud.example.com");

    let site = h.provisioner.provision(site.id).unwrap();

    assert_eq!(site.status, SiteStatus::Live);
    assert_eq!(site.instance_id.as_deref(), Some("i-0abc"));
    assert_eq!(site.public_ip.as_deref(), Some(REMOTE_IP));
    assert_eq!(site.dns_record_id.as_deref(), Some("/change/C123"));
    assert!(site.private_key.is_some());
    assert_eq!(steps_and_statuses(&h, &site).len(), 9);

    let dns = h.infra.dns.as_ref().unwrap();
    assert_eq!(
        dns.created.lock().unwrap()[0],
        ("cloud.example.com".to_string(), REMOTE_IP.to_string())
    );
    let target = h.infra.probe.targets.lock().unwrap()[0].clone();
    assert_eq!(target.url, format!("http://{}/", REMOTE_IP));
    assert_eq!(target.host_header.as_deref(), Some("cloud.example.com"));

    let outcome = h.provisioner.destroy(site.id).unwrap();
    assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);

    let instances = h.infra.instances.as_ref().unwrap();
    assert_eq!(*instances.terminated.lock().unwrap(), vec!["i-0abc".to_string()]);
    assert_eq!(instances.deleted_keys.lock().unwrap().len(), 1);
    assert_eq!(dns.deleted.lock().unwrap().len(), 1);
}

#[test]
fn key_pair_is_deleted_when_termination_fails() {
    let mut infra = FakeInfra::remote(true);
    infra.instances = Some(FakeInstances {
        ssh_ready: true,
        fail_terminate: true,
        ..Default::default()
    });
    let h = harness(fast_config(Mode::Remote), infra);
    let site = h.provisioner.create_site(request("orphan.example.com")).unwrap();
    let site = h.provisioner.provision(site.id).unwrap();

    let outcome = h.provisioner.destroy(site.id).unwrap();
    assert_eq!(outcome.site.status, SiteStatus::Destroyed);
    assert_eq!(outcome.warnings.len(), 1, "{:?}", outcome.warnings);
    assert!(outcome.warnings[0].starts_with(
        "Terminate Instance (non-critical): ec2 terminate-instances: UnauthorizedOperation"
    ));
    assert!(outcome.warnings[0].contains("Key pair wordpress-"));

    let instances = h.infra.instances.as_ref().unwrap();
    assert!(instances.terminated.lock().unwrap().is_empty());
    assert_eq!(
        *instances.deleted_keys.lock().unwrap(),
        vec![format!("wordpress-{}-k", site.id)]
    );
    assert_eq!(h.infra.dns.as_ref().unwrap().deleted.lock().unwrap().len(), 1);
}

#[test]
fn remote_launch_without_ssh_fails_but_keeps_instance_for_cleanup() {
    let h = harness(fast_config(Mode::Remote), FakeInfra::remote(false));
    let site = h.provisioner.create_site(request("slow.example.com")).unwrap();

    let err = h.provisioner.provision(site.id).unwrap_err();
    assert_eq!(err.code.as_str(), "provider.instance_not_ready");
    assert_eq!(
        steps_and_statuses(&h, &site),
        vec![
            (Step::ValidateDomain, LogStatus::Completed),
            (Step::LaunchInstance, LogStatus::Failed),
        ]
    );

    let failed = h.provisioner.get(site.id).unwrap();
    assert_eq!(failed.status, SiteStatus::Failed);
    assert_eq!(failed.instance_id.as_deref(), Some("i-0abc"));

    h.provisioner.destroy(site.id).unwrap();
    let instances = h.infra.instances.as_ref().unwrap();
    assert_eq!(*instances.terminated.lock().unwrap(), vec!["i-0abc".to_string()]);
    assert!(h.infra.dns.as_ref().unwrap().deleted.lock().unwrap().is_empty());
}

#[test]
fn existing_dns_record_blocks_remote_site() {
    let mut infra = FakeInfra::remote(true);
    infra.dns = Some(FakeDns {
        existing: true,
        ..Default::default()
    });
    let h = harness(fast_config(Mode::Remote), infra);
    let site = h.provisioner.create_site(request("taken.example.com")).unwrap();

    let err = h.provisioner.provision(site.id).unwrap_err();
    assert_eq!(err.code.as_str(), "domain.dns_record_exists");
    assert!(h.infra.instances.as_ref().unwrap().terminated.lock().unwrap().is_empty());
    assert_eq!(steps_and_statuses(&h, &site).len(), 1);
}
