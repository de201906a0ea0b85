//! Site registry and step log persistence.
//!
//! Both live in one SQLite database. Secret columns are encrypted through the
//! injected [`SecretCipher`] before write and decrypted after read, so callers
//! only ever handle plaintext `SecretString`s.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use secrecy::SecretString;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::crypto::SecretCipher;
use crate::error::{Error, Result};
use crate::site::{NewSite, Site, SiteFilter, SiteId, SiteStatus, SiteUpdate};
use crate::step_log::{LogStatus, Step, StepLog};

/// Persistent record of every site.
pub trait SiteRegistry: Send + Sync {
    fn create(&self, new: NewSite) -> Result<Site>;
    fn find(&self, id: SiteId) -> Result<Option<Site>>;
    /// Apply a partial update. Status changes must follow the lifecycle.
    fn update(&self, id: SiteId, update: SiteUpdate) -> Result<Site>;
    fn list(&self, filter: &SiteFilter) -> Result<Vec<Site>>;
    fn delete(&self, id: SiteId) -> Result<()>;
    /// Atomically mark `id` as the owner of its domain. Fails with
    /// `domain.taken` when another non-destroyed site already holds it.
    fn claim_domain(&self, id: SiteId) -> Result<()>;

    fn get(&self, id: SiteId) -> Result<Site> {
        self.find(id)?
            .ok_or_else(|| Error::site_not_found(id.to_string()))
    }

    /// Whether a non-destroyed site already uses `domain`.
    fn domain_in_use(&self, domain: &str) -> Result<bool> {
        let sites = self.list(&SiteFilter {
            status: None,
            include_destroyed: false,
        })?;
        Ok(sites.iter().any(|site| site.domain == domain))
    }
}

/// Append-only per-site step records.
pub trait StepLogStore: Send + Sync {
    /// Insert a row in `running` state for a step about to execute.
    fn start(&self, site_id: SiteId, step: Step) -> Result<StepLog>;
    fn complete(&self, log_id: i64, summary: &str) -> Result<()>;
    fn fail(&self, log_id: i64, message: &str) -> Result<()>;
    /// Append a progress line to a running row.
    fn append_output(&self, log_id: i64, line: &str) -> Result<()>;
    /// All rows for a site in creation order.
    fn list_for_site(&self, site_id: SiteId) -> Result<Vec<StepLog>>;
}

/// Handle over one running step log row.
pub struct LogHandle<'a> {
    store: &'a dyn StepLogStore,
    log: StepLog,
}

impl<'a> LogHandle<'a> {
    pub fn start(store: &'a dyn StepLogStore, site_id: SiteId, step: Step) -> Result<Self> {
        let log = store.start(site_id, step)?;
        Ok(Self { store, log })
    }

    pub fn id(&self) -> i64 {
        self.log.id
    }

    pub fn step(&self) -> Step {
        self.log.step
    }

    pub fn note(&self, line: &str) -> Result<()> {
        self.store.append_output(self.log.id, line)
    }

    pub fn mark_completed(self, summary: &str) -> Result<()> {
        self.store.complete(self.log.id, summary)
    }

    pub fn mark_failed(self, message: &str) -> Result<()> {
        self.store.fail(self.log.id, message)
    }
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS sites (
    id TEXT PRIMARY KEY,
    domain TEXT NOT NULL,
    status TEXT NOT NULL,
    admin_username TEXT NOT NULL,
    admin_password TEXT NOT NULL,
    admin_email TEXT NOT NULL,
    db_name TEXT,
    db_username TEXT,
    db_password TEXT,
    root_path TEXT,
    public_ip TEXT,
    instance_id TEXT,
    key_pair_name TEXT,
    private_key TEXT,
    security_group_id TEXT,
    db_root_password TEXT,
    dns_record_id TEXT,
    domain_claimed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    provisioned_at TEXT,
    destroyed_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sites_claimed_domain
    ON sites(domain) WHERE domain_claimed = 1 AND status != 'destroyed';

CREATE INDEX IF NOT EXISTS idx_sites_status ON sites(status);

CREATE TABLE IF NOT EXISTS step_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
    step TEXT NOT NULL,
    status TEXT NOT NULL,
    output TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_step_logs_site ON step_logs(site_id, id);
";

const SITE_COLUMNS: &str = "id, domain, status, admin_username, admin_password, admin_email, \
     db_name, db_username, db_password, root_path, public_ip, instance_id, key_pair_name, \
     private_key, security_group_id, db_root_password, dns_record_id, domain_claimed, \
     created_at, provisioned_at, destroyed_at";

const LOG_COLUMNS: &str = "id, site_id, step, status, output, error, created_at, updated_at";

/// SQLite-backed [`SiteRegistry`] and [`StepLogStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
    cipher: Arc<dyn SecretCipher>,
}

impl SqliteStore {
    pub fn open(path: &Path, cipher: Arc<dyn SecretCipher>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("create {}", parent.display())))
            })?;
        }

        #[cfg(unix)]
        if !path.exists() {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
                .map_err(|e| {
                    Error::internal_io(e.to_string(), Some("create database file".to_string()))
                })?;
        }

        let conn = Connection::open(path).map_err(|e| storage_err(e, "open database"))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| storage_err(e, "busy timeout"))?;
        Self::init(conn, cipher)
    }

    /// Open the database at the default location (~/.config/sitewright/sitewright.db).
    pub fn open_default(cipher: Arc<dyn SecretCipher>) -> Result<Self> {
        Self::open(&crate::paths::database()?, cipher)
    }

    pub fn open_in_memory(cipher: Arc<dyn SecretCipher>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| storage_err(e, "open in-memory"))?;
        Self::init(conn, cipher)
    }

    fn init(conn: Connection, cipher: Arc<dyn SecretCipher>) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| storage_err(e, "enable foreign keys"))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| storage_err(e, "create schema"))?;
        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::storage("connection lock poisoned", None))
    }

    fn seal(&self, secret: &SecretString) -> Result<String> {
        self.cipher.encrypt(secret)
    }

    fn seal_opt(&self, secret: Option<&SecretString>) -> Result<Option<String>> {
        secret.map(|s| self.seal(s)).transpose()
    }

    fn open_opt(&self, ciphertext: Option<String>) -> Result<Option<SecretString>> {
        ciphertext
            .map(|c| self.cipher.decrypt(&c))
            .transpose()
    }

    fn hydrate(&self, row: SiteRow) -> Result<Site> {
        Ok(Site {
            id: row.id.parse()?,
            domain: row.domain,
            status: row.status.parse()?,
            admin_username: row.admin_username,
            admin_password: self.cipher.decrypt(&row.admin_password)?,
            admin_email: row.admin_email,
            db_name: row.db_name,
            db_username: row.db_username,
            db_password: self.open_opt(row.db_password)?,
            root_path: row.root_path,
            public_ip: row.public_ip,
            instance_id: row.instance_id,
            key_pair_name: row.key_pair_name,
            private_key: self.open_opt(row.private_key)?,
            security_group_id: row.security_group_id,
            db_root_password: self.open_opt(row.db_root_password)?,
            dns_record_id: row.dns_record_id,
            domain_claimed: row.domain_claimed,
            created_at: parse_time(&row.created_at)?,
            provisioned_at: row.provisioned_at.as_deref().map(parse_time).transpose()?,
            destroyed_at: row.destroyed_at.as_deref().map(parse_time).transpose()?,
        })
    }

    fn find_locked(&self, conn: &Connection, id: SiteId) -> Result<Option<Site>> {
        let sql = format!("SELECT {} FROM sites WHERE id = ?1", SITE_COLUMNS);
        let row = conn
            .query_row(&sql, params![id.to_string()], SiteRow::from_row)
            .optional()
            .map_err(|e| storage_err(e, "find site"))?;
        row.map(|r| self.hydrate(r)).transpose()
    }

    fn write_locked(&self, conn: &Connection, site: &Site) -> Result<()> {
        conn.execute(
            "UPDATE sites SET status = ?2, db_name = ?3, db_username = ?4, db_password = ?5,
                root_path = ?6, public_ip = ?7, instance_id = ?8, key_pair_name = ?9,
                private_key = ?10, security_group_id = ?11, db_root_password = ?12,
                dns_record_id = ?13, provisioned_at = ?14, destroyed_at = ?15, updated_at = ?16
             WHERE id = ?1",
            params![
                site.id.to_string(),
                site.status.as_str(),
                site.db_name,
                site.db_username,
                self.seal_opt(site.db_password.as_ref())?,
                site.root_path,
                site.public_ip,
                site.instance_id,
                site.key_pair_name,
                self.seal_opt(site.private_key.as_ref())?,
                site.security_group_id,
                self.seal_opt(site.db_root_password.as_ref())?,
                site.dns_record_id,
                site.provisioned_at.map(|t| t.to_rfc3339()),
                site.destroyed_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| storage_err(e, "update site"))?;
        Ok(())
    }

    fn finish_log(&self, log_id: i64, status: LogStatus, text: &str) -> Result<()> {
        let conn = self.lock()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM step_logs WHERE id = ?1",
                params![log_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_err(e, "read step log"))?;

        let current: LogStatus = current
            .ok_or_else(|| Error::storage(format!("step log {} not found", log_id), None))?
            .parse()?;
        if !current.can_transition_to(status) {
            return Err(Error::storage(
                format!(
                    "step log {} is already {}",
                    log_id,
                    current.as_str()
                ),
                None,
            ));
        }

        // Completed rows keep earlier progress lines above the summary.
        let sql = match status {
            LogStatus::Failed => {
                "UPDATE step_logs SET status = ?2, error = ?3, updated_at = ?4 WHERE id = ?1"
            }
            _ => {
                "UPDATE step_logs SET status = ?2,
                    output = CASE WHEN output IS NULL OR output = '' THEN ?3
                                  ELSE output || char(10) || ?3 END,
                    updated_at = ?4
                 WHERE id = ?1"
            }
        };
        conn.execute(
            sql,
            params![log_id, status.as_str(), text, Utc::now().to_rfc3339()],
        )
        .map_err(|e| storage_err(e, "finish step log"))?;
        Ok(())
    }
}

impl SiteRegistry for SqliteStore {
    fn create(&self, new: NewSite) -> Result<Site> {
        let site = Site::pending(new);

        let admin_password = self.seal(&site.admin_password)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sites (id, domain, status, admin_username, admin_password, admin_email,
                domain_claimed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
            params![
                site.id.to_string(),
                site.domain,
                site.status.as_str(),
                site.admin_username,
                admin_password,
                site.admin_email,
                site.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| storage_err(e, "insert site"))?;

        tracing::debug!(site_id = %site.id, domain = %site.domain, "Registered site");
        Ok(site)
    }

    fn find(&self, id: SiteId) -> Result<Option<Site>> {
        let conn = self.lock()?;
        self.find_locked(&conn, id)
    }

    fn update(&self, id: SiteId, update: SiteUpdate) -> Result<Site> {
        let conn = self.lock()?;
        let mut site = self
            .find_locked(&conn, id)?
            .ok_or_else(|| Error::site_not_found(id.to_string()))?;

        if let Some(next) = update.status {
            if !site.status.can_transition_to(next) {
                return Err(Error::site_invalid_state(
                    id.to_string(),
                    site.status.as_str(),
                    format!("mark as {}", next.as_str()),
                ));
            }
            site.status = next;
        }

        macro_rules! apply {
            ($($field:ident),*) => {
                $(if let Some(value) = update.$field {
                    site.$field = Some(value);
                })*
            };
        }
        apply!(
            db_name,
            db_username,
            db_password,
            root_path,
            public_ip,
            instance_id,
            key_pair_name,
            private_key,
            security_group_id,
            db_root_password,
            dns_record_id,
            provisioned_at,
            destroyed_at
        );

        self.write_locked(&conn, &site)?;
        Ok(site)
    }

    fn list(&self, filter: &SiteFilter) -> Result<Vec<Site>> {
        let rows = {
            let conn = self.lock()?;
            let sql = format!(
                "SELECT {} FROM sites ORDER BY created_at DESC, rowid DESC",
                SITE_COLUMNS
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| storage_err(e, "list sites"))?;
            let rows = stmt
                .query_map([], SiteRow::from_row)
                .map_err(|e| storage_err(e, "list sites"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| storage_err(e, "list sites"))?;
            rows
        };

        let mut sites = Vec::with_capacity(rows.len());
        for row in rows {
            let site = self.hydrate(row)?;
            if filter.matches(&site) {
                sites.push(site);
            }
        }
        Ok(sites)
    }

    fn delete(&self, id: SiteId) -> Result<()> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM sites WHERE id = ?1", params![id.to_string()])
            .map_err(|e| storage_err(e, "delete site"))?;
        if removed == 0 {
            return Err(Error::site_not_found(id.to_string()));
        }
        Ok(())
    }

    fn claim_domain(&self, id: SiteId) -> Result<()> {
        let conn = self.lock()?;
        let site = self
            .find_locked(&conn, id)?
            .ok_or_else(|| Error::site_not_found(id.to_string()))?;

        let holder: Option<String> = conn
            .query_row(
                "SELECT id FROM sites
                 WHERE domain = ?1 AND id != ?2 AND domain_claimed = 1 AND status != 'destroyed'
                 LIMIT 1",
                params![site.domain, id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_err(e, "check domain"))?;
        if holder.is_some() {
            return Err(Error::domain_taken(&site.domain));
        }

        conn.execute(
            "UPDATE sites SET domain_claimed = 1, updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), Utc::now().to_rfc3339()],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::domain_taken(&site.domain)
            }
            other => storage_err(other, "claim domain"),
        })?;
        Ok(())
    }
}

impl StepLogStore for SqliteStore {
    fn start(&self, site_id: SiteId, step: Step) -> Result<StepLog> {
        let now = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO step_logs (site_id, step, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![
                site_id.to_string(),
                step.as_str(),
                LogStatus::Running.as_str(),
                now.to_rfc3339()
            ],
        )
        .map_err(|e| storage_err(e, "insert step log"))?;

        Ok(StepLog {
            id: conn.last_insert_rowid(),
            site_id,
            step,
            status: LogStatus::Running,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn complete(&self, log_id: i64, summary: &str) -> Result<()> {
        self.finish_log(log_id, LogStatus::Completed, summary)
    }

    fn fail(&self, log_id: i64, message: &str) -> Result<()> {
        self.finish_log(log_id, LogStatus::Failed, message)
    }

    fn append_output(&self, log_id: i64, line: &str) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE step_logs SET
                    output = CASE WHEN output IS NULL OR output = '' THEN ?2
                                  ELSE output || char(10) || ?2 END,
                    updated_at = ?3
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![log_id, line, Utc::now().to_rfc3339()],
            )
            .map_err(|e| storage_err(e, "append step output"))?;
        if changed == 0 {
            return Err(Error::storage(
                format!("step log {} is not running", log_id),
                None,
            ));
        }
        Ok(())
    }

    fn list_for_site(&self, site_id: SiteId) -> Result<Vec<StepLog>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM step_logs WHERE site_id = ?1 ORDER BY id ASC",
            LOG_COLUMNS
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| storage_err(e, "list step logs"))?;
        let rows = stmt
            .query_map(params![site_id.to_string()], LogRow::from_row)
            .map_err(|e| storage_err(e, "list step logs"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| storage_err(e, "list step logs"))?;

        rows.into_iter().map(LogRow::into_log).collect()
    }
}

struct SiteRow {
    id: String,
    domain: String,
    status: String,
    admin_username: String,
    admin_password: String,
    admin_email: String,
    db_name: Option<String>,
    db_username: Option<String>,
    db_password: Option<String>,
    root_path: Option<String>,
    public_ip: Option<String>,
    instance_id: Option<String>,
    key_pair_name: Option<String>,
    private_key: Option<String>,
    security_group_id: Option<String>,
    db_root_password: Option<String>,
    dns_record_id: Option<String>,
    domain_claimed: bool,
    created_at: String,
    provisioned_at: Option<String>,
    destroyed_at: Option<String>,
}

impl SiteRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            domain: row.get("domain")?,
            status: row.get("status")?,
            admin_username: row.get("admin_username")?,
            admin_password: row.get("admin_password")?,
            admin_email: row.get("admin_email")?,
            db_name: row.get("db_name")?,
            db_username: row.get("db_username")?,
            db_password: row.get("db_password")?,
            root_path: row.get("root_path")?,
            public_ip: row.get("public_ip")?,
            instance_id: row.get("instance_id")?,
            key_pair_name: row.get("key_pair_name")?,
            private_key: row.get("private_key")?,
            security_group_id: row.get("security_group_id")?,
            db_root_password: row.get("db_root_password")?,
            dns_record_id: row.get("dns_record_id")?,
            domain_claimed: row.get("domain_claimed")?,
            created_at: row.get("created_at")?,
            provisioned_at: row.get("provisioned_at")?,
            destroyed_at: row.get("destroyed_at")?,
        })
    }
}

struct LogRow {
    id: i64,
    site_id: String,
    step: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl LogRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            site_id: row.get("site_id")?,
            step: row.get("step")?,
            status: row.get("status")?,
            output: row.get("output")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_log(self) -> Result<StepLog> {
        Ok(StepLog {
            id: self.id,
            site_id: self.site_id.parse()?,
            step: self.step.parse()?,
            status: self.status.parse()?,
            output: self.output,
            error: self.error,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::storage(e.to_string(), Some(format!("timestamp '{}'", value))))
}

fn storage_err(err: rusqlite::Error, context: &str) -> Error {
    Error::storage(err.to_string(), Some(context.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AgeCipher;
    use secrecy::ExposeSecret;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(Arc::new(AgeCipher::generate())).unwrap()
    }

    fn new_site(domain: &str) -> NewSite {
        NewSite {
            domain: domain.to_string(),
            admin_username: "admin".to_string(),
            admin_password: SecretString::from("correct-horse-battery".to_string()),
            admin_email: "a@b.com".to_string(),
        }
    }

    #[test]
    fn create_starts_pending_and_reads_back() {
        let store = store();
        let site = store.create(new_site("demo.test")).unwrap();
        assert_eq!(site.status, SiteStatus::Pending);

        let loaded = store.get(site.id).unwrap();
        assert_eq!(loaded.domain, "demo.test");
        assert_eq!(loaded.admin_password.expose_secret(), "correct-horse-battery");
        assert!(!loaded.domain_claimed);
    }

    #[test]
    fn secrets_are_not_stored_in_plaintext() {
        let store = store();
        let site = store.create(new_site("demo.test")).unwrap();
        store
            .update(
                site.id,
                SiteUpdate {
                    db_password: Some(SecretString::from("db-secret-value".to_string())),
                    ..Default::default()
                },
            )
            .unwrap();

        let conn = store.lock().unwrap();
        let (admin, db): (String, String) = conn
            .query_row(
                "SELECT admin_password, db_password FROM sites WHERE id = ?1",
                params![site.id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(!admin.contains("correct-horse"));
        assert!(!db.contains("db-secret"));
    }

    #[test]
    fn update_rejects_lifecycle_violations() {
        let store = store();
        let site = store.create(new_site("demo.test")).unwrap();

        let err = store
            .update(site.id, SiteUpdate::status(SiteStatus::Live))
            .unwrap_err();
        assert_eq!(err.code.as_str(), "site.invalid_state");

        store
            .update(site.id, SiteUpdate::status(SiteStatus::Provisioning))
            .unwrap();
        let err = store
            .update(site.id, SiteUpdate::status(SiteStatus::Pending))
            .unwrap_err();
        assert_eq!(err.code.as_str(), "site.invalid_state");
    }

    #[test]
    fn update_leaves_unset_fields_alone() {
        let store = store();
        let site = store.create(new_site("demo.test")).unwrap();
        store
            .update(
                site.id,
                SiteUpdate {
                    root_path: Some("/var/www/demo.test".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let site = store
            .update(
                site.id,
                SiteUpdate {
                    public_ip: Some("127.0.0.1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(site.root_path.as_deref(), Some("/var/www/demo.test"));
        assert_eq!(site.public_ip.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn claim_is_exclusive_until_destroyed() {
        let store = store();
        let first = store.create(new_site("demo.test")).unwrap();
        let second = store.create(new_site("demo.test")).unwrap();

        store.claim_domain(first.id).unwrap();
        let err = store.claim_domain(second.id).unwrap_err();
        assert_eq!(err.code.as_str(), "domain.taken");

        store
            .update(first.id, SiteUpdate::status(SiteStatus::Provisioning))
            .unwrap();
        store
            .update(first.id, SiteUpdate::status(SiteStatus::Failed))
            .unwrap();
        assert!(store.claim_domain(second.id).is_err());

        store
            .update(first.id, SiteUpdate::status(SiteStatus::Destroyed))
            .unwrap();
        store.claim_domain(second.id).unwrap();
    }

    #[test]
    fn logs_are_ordered_and_never_reopened() {
        let store = store();
        let site = store.create(new_site("demo.test")).unwrap();

        let first = store.start(site.id, Step::ValidateDomain).unwrap();
        store.complete(first.id, "ok").unwrap();
        let second = store.start(site.id, Step::PrepareFilesystem).unwrap();
        store.append_output(second.id, "Creating directories").unwrap();
        store.fail(second.id, "mkdir failed").unwrap();

        assert!(store.complete(first.id, "again").is_err());
        assert!(store.append_output(second.id, "late").is_err());

        let logs = store.list_for_site(site.id).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].step, Step::ValidateDomain);
        assert_eq!(logs[0].status, LogStatus::Completed);
        assert_eq!(logs[0].output.as_deref(), Some("ok"));
        assert_eq!(logs[1].status, LogStatus::Failed);
        assert_eq!(logs[1].output.as_deref(), Some("Creating directories"));
        assert_eq!(logs[1].error.as_deref(), Some("mkdir failed"));
    }

    #[test]
    fn completed_summary_follows_progress_lines() {
        let store = store();
        let site = store.create(new_site("demo.test")).unwrap();
        let log = store.start(site.id, Step::LaunchInstance).unwrap();
        store.append_output(log.id, "Instance launched").unwrap();
        store.complete(log.id, "Instance ready at 1.2.3.4").unwrap();

        let logs = store.list_for_site(site.id).unwrap();
        assert_eq!(
            logs[0].output.as_deref(),
            Some("Instance launched\nInstance ready at 1.2.3.4")
        );
    }

    #[test]
    fn delete_cascades_to_logs() {
        let store = store();
        let site = store.create(new_site("demo.test")).unwrap();
        let log = store.start(site.id, Step::ValidateDomain).unwrap();
        store.complete(log.id, "ok").unwrap();

        store.delete(site.id).unwrap();
        assert!(store.find(site.id).unwrap().is_none());
        assert!(store.list_for_site(site.id).unwrap().is_empty());
        assert_eq!(
            store.delete(site.id).unwrap_err().code.as_str(),
            "site.not_found"
        );
    }

    #[test]
    fn list_applies_filter() {
        let store = store();
        let a = store.create(new_site("a.test")).unwrap();
        store.create(new_site("b.test")).unwrap();
        store
            .update(a.id, SiteUpdate::status(SiteStatus::Provisioning))
            .unwrap();

        let pending = store
            .list(&SiteFilter {
                status: Some(SiteStatus::Pending),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].domain, "b.test");
        assert_eq!(store.list(&SiteFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn file_database_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("sites.db");
        let cipher: Arc<dyn SecretCipher> =
            Arc::new(AgeCipher::open_or_create(&dir.path().join("identity.txt")).unwrap());

        let id = {
            let store = SqliteStore::open(&db, cipher.clone()).unwrap();
            store.create(new_site("demo.test")).unwrap().id
        };

        let store = SqliteStore::open(&db, cipher).unwrap();
        let site = store.get(id).unwrap();
        assert_eq!(site.admin_password.expose_secret(), "correct-horse-battery");
    }
}
