//! Ordered, idempotent schema migrations tracked in the metadata table.

use anyhow::Context as _;
use placement::{StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::info;

pub(crate) type MigrationFn<'a> = &'a dyn Fn(&Transaction) -> StoreResult<()>;

/// Applies every migration past the recorded level, in order, inside a
/// single exclusive transaction. The level is stored in the metadata table
/// under `metadata_key` so separate stores sharing one database (distinct
/// prefixes) track their own schema independently.
pub(crate) fn perform(
    conn: &mut Connection,
    metadata_table: &str,
    metadata_key: &str,
    migrations: &[MigrationFn<'_>],
) -> StoreResult<()> {
    conn.execute(
        &format!("CREATE TABLE IF NOT EXISTS {metadata_table} (key TEXT PRIMARY KEY, value TEXT NOT NULL)"),
        [],
    )
    .context("failed to create metadata table")?;

    // Exclusive keeps concurrent processes from applying the same
    // migration twice.
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Exclusive)
        .context("failed to begin migrations transaction")?;

    let level: usize = tx
        .query_row(
            &format!("SELECT value FROM {metadata_table} WHERE key = ?"),
            [metadata_key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("failed to read migration level")?
        .map(|v| {
            v.parse().map_err(|_| {
                StoreError::Internal(anyhow::anyhow!(
                    "invalid migration level in metadata table: {v}"
                ))
            })
        })
        .transpose()?
        .unwrap_or(0);

    if level > migrations.len() {
        return Err(StoreError::Internal(anyhow::anyhow!(
            "metadata table reports migration level {level}, but only {} migrations are known",
            migrations.len()
        )));
    }

    for (i, migration) in migrations.iter().enumerate().skip(level) {
        info!("performing migration {}", i + 1);
        migration(&tx)?;
    }

    tx.execute(
        &format!("INSERT OR REPLACE INTO {metadata_table} (key, value) VALUES (?, ?)"),
        params![metadata_key, migrations.len().to_string()],
    )
    .context("failed to record migration level")?;

    tx.commit().context("failed to commit migrations")?;
    Ok(())
}
