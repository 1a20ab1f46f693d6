//! SQLite-backed actor placement store.
//!
//! Tracks which host process owns which actor and persists reminder
//! schedules, delegating all mutual exclusion to the database: WAL mode,
//! foreign keys with cascading deletes, and single-statement
//! `UPDATE … RETURNING` claims. The store holds no in-process locks and
//! every operation opens its own connection.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use placement::{
    ActorRef, AddActorHostRequest, HostActorType, HostId, LookupActorResponse, Metadata, Store,
    StoreError, StoreResult, UpdateActorHostRequest,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, error, info};
use uuid::Uuid;

mod config;
mod migrations;
mod reminders;

pub use config::StoreConfig;
use config::Table;

const MIGRATIONS_KEY: &str = "migrations-actorstore";

const STATE_UNINIT: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_CLOSED: u8 = 2;

const LOOKUP_MAX_ATTEMPTS: usize = 3;
const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Actor placement store backed by a SQLite database file.
///
/// Cheap to clone; clones share the same lifecycle state.
#[derive(Clone, Default)]
pub struct SqliteStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: AtomicU8,
    config: OnceLock<StoreConfig>,
    /// Identifies this store instance as the owner of reminder leases.
    instance_id: OnceLock<Uuid>,
}

/// Outcome of one placement attempt. A conflict means another caller
/// created the assignment between our read and insert.
enum LookupAttempt {
    Found(LookupActorResponse),
    Conflict,
}

impl SqliteStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Inner) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        let timeout = inner.config()?.timeout;
        let task = tokio::task::spawn_blocking(move || f(&inner));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => Err(StoreError::Internal(anyhow!("join error: {e}"))),
            Err(_) => Err(StoreError::Internal(anyhow!("operation timed out"))),
        }
    }
}

impl Inner {
    fn config(&self) -> StoreResult<&StoreConfig> {
        self.config
            .get()
            .ok_or_else(|| StoreError::Internal(anyhow!("store is not running")))
    }

    fn ensure_running(&self) -> StoreResult<()> {
        if self.state.load(Ordering::SeqCst) != STATE_RUNNING {
            return Err(StoreError::Internal(anyhow!("store is not running")));
        }
        Ok(())
    }

    pub(crate) fn conn(&self) -> StoreResult<Connection> {
        let cfg = self.config()?;
        let conn = Connection::open(&cfg.connection_string)
            .context("failed to open database connection")?;
        // Pragmas tuned for concurrent callers. foreign_keys is off by
        // default in SQLite and cascade deletes depend on it, so it must
        // be set on every connection.
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to set journal mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set synchronous mode")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys")?;
        conn.busy_timeout(cfg.busy_timeout)
            .context("failed to set busy timeout")?;
        Ok(conn)
    }

    /// Begin → body → commit, rolling back on any body error. Rollback
    /// failures are logged, not propagated: the transaction is already
    /// abandoned.
    pub(crate) fn with_transaction<T>(
        &self,
        conn: &mut Connection,
        f: impl FnOnce(&Transaction) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin transaction")?;
        match f(&tx) {
            Ok(res) => {
                tx.commit().context("failed to commit transaction")?;
                Ok(res)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    error!("error while attempting to roll back transaction: {rollback_err}");
                }
                Err(err)
            }
        }
    }

    fn open_and_migrate(&self, config: StoreConfig) -> StoreResult<()> {
        let hosts = config.table(Table::Hosts);
        let hosts_actor_types = config.table(Table::HostsActorTypes);
        let actors = config.table(Table::Actors);
        let reminders = config.table(Table::Reminders);
        let metadata_table = config.metadata_table.clone();
        // Prefix-scoped namespace: stores sharing one database file track
        // their schema levels independently.
        let metadata_key = format!("{}{}", config.table_prefix, MIGRATIONS_KEY);

        self.config
            .set(config)
            .map_err(|_| StoreError::Internal(anyhow!("store configuration is already set")))?;
        let _ = self.instance_id.set(Uuid::new_v4());

        let mut conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .context("failed to ping the database")?;

        let migration1 = |tx: &Transaction| -> StoreResult<()> {
            info!(
                "creating actor state tables: hosts='{hosts}' hosts_actor_types='{hosts_actor_types}' actors='{actors}'"
            );
            tx.execute_batch(&format!(
                r#"
                CREATE TABLE {hosts} (
                  host_id TEXT PRIMARY KEY,
                  host_address TEXT NOT NULL,
                  host_app_id TEXT NOT NULL,
                  host_actors_api_level INTEGER NOT NULL,
                  host_last_healthcheck TEXT NOT NULL,
                  UNIQUE (host_address, host_app_id)
                );
                CREATE TABLE {hosts_actor_types} (
                  host_id TEXT NOT NULL REFERENCES {hosts} (host_id) ON DELETE CASCADE,
                  actor_type TEXT NOT NULL,
                  actor_idle_timeout INTEGER NOT NULL,
                  actor_concurrent_reminders INTEGER NOT NULL DEFAULT 0,
                  PRIMARY KEY (host_id, actor_type)
                );
                CREATE INDEX idx_{hosts_actor_types}_type ON {hosts_actor_types} (actor_type);
                CREATE TABLE {actors} (
                  actor_type TEXT NOT NULL,
                  actor_id TEXT NOT NULL,
                  host_id TEXT NOT NULL REFERENCES {hosts} (host_id) ON DELETE CASCADE,
                  actor_idle_timeout INTEGER NOT NULL,
                  PRIMARY KEY (actor_type, actor_id)
                );
                "#
            ))
            .context("failed to create actor state tables")?;
            Ok(())
        };

        let migration2 = |tx: &Transaction| -> StoreResult<()> {
            info!("creating reminders table: '{reminders}'");
            tx.execute_batch(&format!(
                r#"
                CREATE TABLE {reminders} (
                  reminder_id TEXT PRIMARY KEY,
                  actor_type TEXT NOT NULL,
                  actor_id TEXT NOT NULL,
                  reminder_name TEXT NOT NULL,
                  reminder_execution_time TEXT NOT NULL,
                  reminder_period INTEGER,
                  reminder_ttl TEXT,
                  reminder_data BLOB,
                  reminder_lease_id TEXT,
                  reminder_lease_time TEXT,
                  reminder_lease_pid TEXT,
                  UNIQUE (actor_type, actor_id, reminder_name)
                );
                CREATE INDEX idx_{reminders}_due ON {reminders} (reminder_execution_time);
                "#
            ))
            .context("failed to create reminders table")?;
            Ok(())
        };

        migrations::perform(
            &mut conn,
            &metadata_table,
            &metadata_key,
            &[&migration1, &migration2],
        )
    }

    pub(crate) fn instance_id(&self) -> StoreResult<&Uuid> {
        self.instance_id
            .get()
            .ok_or_else(|| StoreError::Internal(anyhow!("store is not running")))
    }

    fn ping(&self) -> StoreResult<()> {
        self.ensure_running()?;
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .context("failed to ping the database")?;
        Ok(())
    }

    fn add_actor_host(&self, req: &AddActorHostRequest) -> StoreResult<HostId> {
        self.ensure_running()?;
        if req.app_id.is_empty() || req.address.is_empty() || req.api_level == 0 {
            return Err(StoreError::InvalidRequest(
                "address, app ID and a positive actors API level are required",
            ));
        }

        let cfg = self.config()?;
        let hosts = cfg.table(Table::Hosts);
        let hosts_actor_types = cfg.table(Table::HostsActorTypes);
        let host_id = Uuid::new_v4().to_string();
        let now = now_rfc3339();

        // Two tables are touched, so this needs a transaction.
        let mut conn = self.conn()?;
        self.with_transaction(&mut conn, |tx| {
            let res = tx.execute(
                &format!(
                    "INSERT INTO {hosts} \
                     (host_id, host_address, host_app_id, host_actors_api_level, host_last_healthcheck) \
                     VALUES (?, ?, ?, ?, ?)"
                ),
                params![host_id, req.address, req.app_id, req.api_level, now],
            );
            match res {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => return Err(StoreError::HostConflict),
                Err(e) => {
                    return Err(StoreError::Internal(
                        anyhow::Error::new(e).context("failed to insert actor host in hosts table"),
                    ))
                }
            }

            insert_host_actor_types(tx, &hosts_actor_types, &host_id, &req.actor_types)?;
            Ok(host_id.clone())
        })
    }

    fn update_actor_host(&self, host_id: &str, req: &UpdateActorHostRequest) -> StoreResult<()> {
        self.ensure_running()?;
        if host_id.is_empty() || req.is_empty() {
            return Err(StoreError::InvalidRequest(
                "host ID and at least one property to update are required",
            ));
        }

        let cfg = self.config()?;
        let hosts = cfg.table(Table::Hosts);
        let hosts_actor_types = cfg.table(Table::HostsActorTypes);
        let healthcheck = req.last_healthcheck.map(fmt_rfc3339);
        let mut conn = self.conn()?;

        let update_host = |db: &Connection| -> StoreResult<()> {
            let affected = db
                .execute(
                    &format!(
                        "UPDATE {hosts} \
                         SET host_last_healthcheck = COALESCE(?, host_last_healthcheck) \
                         WHERE host_id = ?"
                    ),
                    params![healthcheck, host_id],
                )
                .map_err(|e| {
                    StoreError::Internal(anyhow::Error::new(e).context("failed to update actor host"))
                })?;
            if affected == 0 {
                return Err(StoreError::HostNotFound);
            }
            Ok(())
        };

        let Some(actor_types) = &req.actor_types else {
            // Health check only: a single statement, no transaction. Saves
            // two round-trips and keeps lock duration short.
            return update_host(&conn);
        };

        self.with_transaction(&mut conn, |tx| {
            update_host(tx)?;

            // Declared types are replaced wholesale, not diffed. Zero rows
            // affected here is fine.
            tx.execute(
                &format!("DELETE FROM {hosts_actor_types} WHERE host_id = ?"),
                params![host_id],
            )
            .context("failed to delete old host actor types")?;

            insert_host_actor_types(tx, &hosts_actor_types, host_id, actor_types)?;
            Ok(())
        })
    }

    fn remove_actor_host(&self, host_id: &str) -> StoreResult<()> {
        self.ensure_running()?;
        if host_id.is_empty() {
            return Err(StoreError::InvalidRequest("host ID is required"));
        }

        // Deleting from the hosts table is enough: actor type declarations
        // and actor assignments reference it with ON DELETE CASCADE.
        let cfg = self.config()?;
        let conn = self.conn()?;
        let affected = conn
            .execute(
                &format!("DELETE FROM {} WHERE host_id = ?", cfg.table(Table::Hosts)),
                params![host_id],
            )
            .context("failed to remove actor host")?;
        if affected == 0 {
            return Err(StoreError::HostNotFound);
        }
        Ok(())
    }

    fn lookup_actor_attempt(&self, reference: &ActorRef) -> StoreResult<LookupAttempt> {
        self.ensure_running()?;
        let cfg = self.config()?;
        let hosts = cfg.table(Table::Hosts);
        let hosts_actor_types = cfg.table(Table::HostsActorTypes);
        let actors = cfg.table(Table::Actors);
        let mut conn = self.conn()?;

        let existing_query = format!(
            "SELECT h.host_app_id, h.host_address, a.actor_idle_timeout \
             FROM {actors} AS a JOIN {hosts} AS h ON h.host_id = a.host_id \
             WHERE a.actor_type = ? AND a.actor_id = ?"
        );

        // Fast path, no transaction: the assignment usually exists already.
        let existing = conn
            .query_row(
                &existing_query,
                params![reference.actor_type, reference.actor_id],
                row_to_lookup_response,
            )
            .optional()
            .context("database error")?;
        if let Some(res) = existing {
            return Ok(LookupAttempt::Found(res));
        }

        self.with_transaction(&mut conn, |tx| {
            // Re-check under the write lock; a concurrent caller may have
            // created the assignment since the fast-path read.
            let existing = tx
                .query_row(
                    &existing_query,
                    params![reference.actor_type, reference.actor_id],
                    row_to_lookup_response,
                )
                .optional()
                .context("database error")?;
            if let Some(res) = existing {
                return Ok(LookupAttempt::Found(res));
            }

            // Assign-on-first-use: pick a random host that declared support
            // for this actor type.
            let candidate = tx
                .query_row(
                    &format!(
                        "SELECT h.host_id, h.host_app_id, h.host_address, t.actor_idle_timeout \
                         FROM {hosts_actor_types} AS t JOIN {hosts} AS h ON h.host_id = t.host_id \
                         WHERE t.actor_type = ? ORDER BY RANDOM() LIMIT 1"
                    ),
                    params![reference.actor_type],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()
                .context("database error")?;
            let Some((host_id, app_id, address, idle_timeout)) = candidate else {
                return Err(StoreError::NoActorHost);
            };

            let res = tx.execute(
                &format!(
                    "INSERT INTO {actors} (actor_type, actor_id, host_id, actor_idle_timeout) \
                     VALUES (?, ?, ?, ?)"
                ),
                params![reference.actor_type, reference.actor_id, host_id, idle_timeout],
            );
            match res {
                Ok(_) => Ok(LookupAttempt::Found(LookupActorResponse {
                    app_id,
                    address,
                    idle_timeout: Duration::from_secs(idle_timeout.max(0) as u64),
                })),
                // Another caller inserted the assignment first.
                Err(e) if is_unique_violation(&e) => Ok(LookupAttempt::Conflict),
                Err(e) => Err(StoreError::Internal(
                    anyhow::Error::new(e).context("failed to insert actor assignment"),
                )),
            }
        })
    }

    fn remove_actor(&self, reference: &ActorRef) -> StoreResult<()> {
        self.ensure_running()?;
        if reference.actor_type.is_empty() || reference.actor_id.is_empty() {
            return Err(StoreError::InvalidRequest("actor type and ID are required"));
        }

        let cfg = self.config()?;
        let conn = self.conn()?;
        let affected = conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE actor_type = ? AND actor_id = ?",
                    cfg.table(Table::Actors)
                ),
                params![reference.actor_type, reference.actor_id],
            )
            .context("failed to remove actor")?;
        if affected == 0 {
            return Err(StoreError::ActorNotFound);
        }
        Ok(())
    }
}

fn row_to_lookup_response(row: &rusqlite::Row<'_>) -> rusqlite::Result<LookupActorResponse> {
    let idle_timeout: i64 = row.get(2)?;
    Ok(LookupActorResponse {
        app_id: row.get(0)?,
        address: row.get(1)?,
        idle_timeout: Duration::from_secs(idle_timeout.max(0) as u64),
    })
}

// One prepared statement reused per row.
fn insert_host_actor_types(
    tx: &Transaction,
    table: &str,
    host_id: &str,
    actor_types: &[HostActorType],
) -> StoreResult<()> {
    if actor_types.is_empty() {
        return Ok(());
    }
    let mut stmt = tx
        .prepare(&format!(
            "INSERT INTO {table} (host_id, actor_type, actor_idle_timeout, actor_concurrent_reminders) \
             VALUES (?, ?, ?, ?)"
        ))
        .context("failed to prepare actor types insert")?;
    for t in actor_types {
        stmt.execute(params![
            host_id,
            t.actor_type,
            t.idle_timeout.as_secs() as i64,
            t.concurrent_reminders_limit,
        ])
        .context("failed to insert supported actor types")?;
    }
    Ok(())
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

pub(crate) fn now_rfc3339() -> String {
    fmt_rfc3339(Utc::now())
}

// Fixed-width UTC timestamps: lexicographic order is chronological order,
// which the due-reminder comparisons rely on.
pub(crate) fn fmt_rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_rfc3339(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Internal(anyhow!("invalid timestamp in database: {s}: {e}")))
}

#[async_trait]
impl Store for SqliteStore {
    async fn init(&self, metadata: Metadata) -> StoreResult<()> {
        if self
            .inner
            .state
            .compare_exchange(STATE_UNINIT, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StoreError::Internal(anyhow!("store is already running")));
        }

        let config = match StoreConfig::from_properties(&metadata.properties) {
            Ok(c) => c,
            Err(e) => {
                error!("failed to parse store metadata: {e}");
                self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
                return Err(e);
            }
        };

        let timeout = config.timeout;
        let inner = self.inner.clone();
        let task = tokio::task::spawn_blocking(move || inner.open_and_migrate(config));
        let res = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => Err(StoreError::Internal(anyhow!("join error: {e}"))),
            Err(_) => Err(StoreError::Internal(anyhow!("initialization timed out"))),
        };
        if let Err(e) = res {
            error!("failed to initialize store: {e}");
            self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.run(|inner| inner.ping()).await
    }

    async fn close(&self) -> StoreResult<()> {
        // Connections are per-operation, so flipping the state is the whole
        // teardown: no new work is accepted afterwards.
        let _ = self.inner.state.compare_exchange(
            STATE_RUNNING,
            STATE_CLOSED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        Ok(())
    }

    async fn add_actor_host(&self, request: AddActorHostRequest) -> StoreResult<HostId> {
        self.run(move |inner| inner.add_actor_host(&request)).await
    }

    async fn update_actor_host(
        &self,
        host_id: &str,
        request: UpdateActorHostRequest,
    ) -> StoreResult<()> {
        let host_id = host_id.to_string();
        self.run(move |inner| inner.update_actor_host(&host_id, &request))
            .await
    }

    async fn remove_actor_host(&self, host_id: &str) -> StoreResult<()> {
        let host_id = host_id.to_string();
        self.run(move |inner| inner.remove_actor_host(&host_id)).await
    }

    async fn lookup_actor(&self, reference: ActorRef) -> StoreResult<LookupActorResponse> {
        if reference.actor_type.is_empty() || reference.actor_id.is_empty() {
            return Err(StoreError::InvalidRequest("actor type and ID are required"));
        }

        // Concurrent first lookups for the same actor can both try to
        // insert the assignment; the loser retries and finds the winner's
        // row. Bounded attempts, short backoff, cancellable at the await.
        for _ in 0..LOOKUP_MAX_ATTEMPTS {
            let r = reference.clone();
            match self.run(move |inner| inner.lookup_actor_attempt(&r)).await? {
                LookupAttempt::Found(res) => return Ok(res),
                LookupAttempt::Conflict => {
                    debug!(
                        actor_type = %reference.actor_type,
                        actor_id = %reference.actor_id,
                        "actor assignment conflict, retrying"
                    );
                    tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
                }
            }
        }
        Err(StoreError::Internal(anyhow!(
            "failed to assign actor after {LOOKUP_MAX_ATTEMPTS} attempts"
        )))
    }

    async fn remove_actor(&self, reference: ActorRef) -> StoreResult<()> {
        self.run(move |inner| inner.remove_actor(&reference)).await
    }
}


#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use placement::{
        ActorRef, Metadata, Store as _, StoreError, UpdateActorHostRequest,
    };

    use super::test_support::{host_request, open_store, open_store_with};
    use super::SqliteStore;

    #[tokio::test]
    async fn register_lookup_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let h1 = store
            .add_actor_host(host_request("a1", "addr1", &["cat"]))
            .await
            .unwrap();

        let res = store
            .lookup_actor(ActorRef::new("cat", "id1"))
            .await
            .unwrap();
        assert_eq!(res.app_id, "a1");
        assert_eq!(res.address, "addr1");
        assert_eq!(res.idle_timeout, Duration::from_secs(30));

        store.remove_actor_host(&h1).await.unwrap();

        let err = store
            .lookup_actor(ActorRef::new("cat", "id1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoActorHost));
    }

    #[tokio::test]
    async fn duplicate_host_registration_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store
            .add_actor_host(host_request("a1", "addr1", &["cat"]))
            .await
            .unwrap();
        let err = store
            .add_actor_host(host_request("a1", "addr1", &["dog"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::HostConflict));

        // Same app on a different address is a separate host.
        store
            .add_actor_host(host_request("a1", "addr2", &["cat"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_registrations_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let mut req = host_request("a1", "addr1", &["cat"]);
        req.api_level = 0;
        assert!(matches!(
            store.add_actor_host(req).await.unwrap_err(),
            StoreError::InvalidRequest(_)
        ));

        let mut req = host_request("", "addr1", &["cat"]);
        req.app_id = String::new();
        assert!(matches!(
            store.add_actor_host(req).await.unwrap_err(),
            StoreError::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn update_with_empty_types_removes_them_absent_leaves_them() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let host_id = store
            .add_actor_host(host_request("a1", "addr1", &["cat"]))
            .await
            .unwrap();

        // Absent: declarations untouched, new actors still placeable.
        store
            .update_actor_host(
                &host_id,
                UpdateActorHostRequest {
                    last_healthcheck: Some(chrono::Utc::now()),
                    actor_types: None,
                },
            )
            .await
            .unwrap();
        store
            .lookup_actor(ActorRef::new("cat", "id-a"))
            .await
            .unwrap();

        // Present but empty: all declarations removed.
        store
            .update_actor_host(
                &host_id,
                UpdateActorHostRequest {
                    last_healthcheck: None,
                    actor_types: Some(Vec::new()),
                },
            )
            .await
            .unwrap();
        let err = store
            .lookup_actor(ActorRef::new("cat", "id-b"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoActorHost));
    }

    #[tokio::test]
    async fn update_requires_something_to_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let host_id = store
            .add_actor_host(host_request("a1", "addr1", &["cat"]))
            .await
            .unwrap();

        let err = store
            .update_actor_host(&host_id, UpdateActorHostRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn update_unknown_host_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let err = store
            .update_actor_host(
                "00000000-0000-0000-0000-000000000000",
                UpdateActorHostRequest {
                    last_healthcheck: Some(chrono::Utc::now()),
                    actor_types: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::HostNotFound));
    }

    #[tokio::test]
    async fn remove_host_cascades_to_types_and_assignments() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let h1 = store
            .add_actor_host(host_request("a1", "addr1", &["cat"]))
            .await
            .unwrap();
        store
            .lookup_actor(ActorRef::new("cat", "id1"))
            .await
            .unwrap();

        store.remove_actor_host(&h1).await.unwrap();

        // The assignment went away with the host, so removing the actor
        // reports it as gone rather than succeeding silently.
        let err = store
            .remove_actor(ActorRef::new("cat", "id1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ActorNotFound));

        let err = store
            .lookup_actor(ActorRef::new("cat", "id1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoActorHost));

        let err = store.remove_actor_host(&h1).await.unwrap_err();
        assert!(matches!(err, StoreError::HostNotFound));
    }

    #[tokio::test]
    async fn reassignment_after_host_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let h1 = store
            .add_actor_host(host_request("a1", "addr1", &["cat"]))
            .await
            .unwrap();
        store
            .add_actor_host(host_request("a2", "addr2", &["cat"]))
            .await
            .unwrap();

        store
            .lookup_actor(ActorRef::new("cat", "id1"))
            .await
            .unwrap();
        store.remove_actor_host(&h1).await.unwrap();

        // Whatever host owned it before, the only one left now is a2.
        let res = store
            .lookup_actor(ActorRef::new("cat", "id1"))
            .await
            .unwrap();
        assert_eq!(res.app_id, "a2");
    }

    #[tokio::test]
    async fn repeated_lookups_are_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        for i in 0..4 {
            store
                .add_actor_host(host_request(&format!("a{i}"), &format!("addr{i}"), &["cat"]))
                .await
                .unwrap();
        }

        let first = store
            .lookup_actor(ActorRef::new("cat", "id1"))
            .await
            .unwrap();
        for _ in 0..10 {
            let res = store
                .lookup_actor(ActorRef::new("cat", "id1"))
                .await
                .unwrap();
            assert_eq!(res, first);
        }

        // Until the assignment is removed; then any host may win again.
        store.remove_actor(ActorRef::new("cat", "id1")).await.unwrap();
        store
            .lookup_actor(ActorRef::new("cat", "id1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_first_lookups_converge() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        for i in 0..3 {
            store
                .add_actor_host(host_request(&format!("a{i}"), &format!("addr{i}"), &["cat"]))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store: SqliteStore = store.clone();
            handles.push(tokio::spawn(async move {
                store.lookup_actor(ActorRef::new("cat", "id1")).await
            }));
        }

        let mut owners = Vec::new();
        for handle in handles {
            let res = handle.await.unwrap().expect("every lookup must succeed");
            owners.push(res.app_id);
        }
        owners.sort();
        owners.dedup();
        assert_eq!(owners.len(), 1, "all lookups must agree on one host");
    }

    #[tokio::test]
    async fn lookup_without_eligible_host() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store
            .add_actor_host(host_request("a1", "addr1", &["cat"]))
            .await
            .unwrap();
        let err = store
            .lookup_actor(ActorRef::new("dog", "id1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoActorHost));
    }

    #[tokio::test]
    async fn lifecycle_guards() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.ping().await.unwrap();

        // Double init is rejected.
        let db = dir.path().join("actors.db");
        let err = store
            .init(Metadata::new(HashMap::from([(
                "connectionString".to_string(),
                db.to_string_lossy().into_owned(),
            )])))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Internal(_)));

        store.close().await.unwrap();
        assert!(store.ping().await.is_err());
        assert!(store
            .add_actor_host(host_request("a1", "addr1", &["cat"]))
            .await
            .is_err());
        // Close is idempotent.
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn init_with_bad_metadata_fails() {
        let store = SqliteStore::new();
        let err = store.init(Metadata::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn reinit_over_existing_database_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store
            .add_actor_host(host_request("a1", "addr1", &["cat"]))
            .await
            .unwrap();
        store.close().await.unwrap();

        // A second store over the same file skips the applied migrations
        // and sees the existing data.
        let store = open_store(dir.path()).await;
        let res = store
            .lookup_actor(ActorRef::new("cat", "id1"))
            .await
            .unwrap();
        assert_eq!(res.app_id, "a1");
    }

    #[tokio::test]
    async fn prefixed_stores_share_one_database() {
        let dir = tempfile::tempdir().unwrap();
        let store_a = open_store_with(dir.path(), &[("tablePrefix", "a_")]).await;
        let store_b = open_store_with(dir.path(), &[("tablePrefix", "b_")]).await;

        store_a
            .add_actor_host(host_request("a1", "addr1", &["cat"]))
            .await
            .unwrap();

        // Same logical keys, disjoint physical tables.
        store_b
            .add_actor_host(host_request("a1", "addr1", &["cat"]))
            .await
            .unwrap();
        let err = store_b
            .lookup_actor(ActorRef::new("dog", "id1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoActorHost));
    }
}
