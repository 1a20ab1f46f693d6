//! Reminder persistence: CRUD plus the fetch-and-lease claim path.
//!
//! Claiming is a single `UPDATE … RETURNING` statement, so two concurrent
//! fetchers can never receive the same reminder: there is no window
//! between reading a due reminder and marking it leased.

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use placement::{
    CreateReminderRequest, FetchRemindersRequest, FetchedReminder, ReminderLease, ReminderOptions,
    ReminderRef, ReminderStore, StoreError, StoreResult,
};
use rusqlite::{params, types::ToSql, OptionalExtension};
use uuid::Uuid;

use crate::config::Table;
use crate::{fmt_rfc3339, is_unique_violation, now_rfc3339, parse_rfc3339, Inner, SqliteStore};

impl Inner {
    fn get_reminder(&self, r: &ReminderRef) -> StoreResult<ReminderOptions> {
        self.ensure_running()?;
        validate_reminder_ref(r)?;

        let cfg = self.config()?;
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT reminder_execution_time, reminder_period, reminder_ttl, reminder_data \
                     FROM {} WHERE actor_type = ? AND actor_id = ? AND reminder_name = ?",
                    cfg.table(Table::Reminders)
                ),
                params![r.actor_type, r.actor_id, r.name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<Vec<u8>>>(3)?,
                    ))
                },
            )
            .optional()
            .context("failed to read reminder")?;

        let Some((execution_time, period, ttl, data)) = row else {
            return Err(StoreError::ReminderNotFound);
        };
        Ok(ReminderOptions {
            execution_time: parse_rfc3339(&execution_time)?,
            period: period.map(|secs| Duration::from_secs(secs.max(0) as u64)),
            ttl: ttl.as_deref().map(parse_rfc3339).transpose()?,
            data,
        })
    }

    fn create_reminder(&self, req: &CreateReminderRequest) -> StoreResult<()> {
        self.ensure_running()?;
        validate_reminder_ref(&req.reference)?;

        let cfg = self.config()?;
        let conn = self.conn()?;
        let reminder_id = Uuid::new_v4().to_string();
        let res = conn.execute(
            &format!(
                "INSERT INTO {} \
                 (reminder_id, actor_type, actor_id, reminder_name, reminder_execution_time, \
                  reminder_period, reminder_ttl, reminder_data) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                cfg.table(Table::Reminders)
            ),
            params![
                reminder_id,
                req.reference.actor_type,
                req.reference.actor_id,
                req.reference.name,
                fmt_rfc3339(req.options.execution_time),
                req.options.period.map(|p| p.as_secs() as i64),
                req.options.ttl.map(fmt_rfc3339),
                req.options.data,
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::ReminderConflict),
            Err(e) => Err(StoreError::Internal(
                anyhow::Error::new(e).context("failed to insert reminder"),
            )),
        }
    }

    fn delete_reminder(&self, r: &ReminderRef) -> StoreResult<()> {
        self.ensure_running()?;
        validate_reminder_ref(r)?;

        let cfg = self.config()?;
        let conn = self.conn()?;
        let affected = conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE actor_type = ? AND actor_id = ? AND reminder_name = ?",
                    cfg.table(Table::Reminders)
                ),
                params![r.actor_type, r.actor_id, r.name],
            )
            .context("failed to delete reminder")?;
        if affected == 0 {
            return Err(StoreError::ReminderNotFound);
        }
        Ok(())
    }

    fn fetch_reminders(&self, req: &FetchRemindersRequest) -> StoreResult<Vec<FetchedReminder>> {
        self.ensure_running()?;
        if req.limit == 0 {
            return Err(StoreError::InvalidRequest("fetch limit must be positive"));
        }

        let cfg = self.config()?;
        let table = cfg.table(Table::Reminders);
        let now = now_rfc3339();
        let stale_before = fmt_rfc3339(
            Utc::now()
                - chrono::Duration::milliseconds(cfg.reminders_lease_duration.as_millis() as i64),
        );
        let pid = self.instance_id()?.to_string();
        let limit = req.limit as i64;

        // Eligible: due, and either unleased or holding a lease old enough
        // to belong to a crashed fetcher. Each claimed row gets its own
        // fresh lease ID.
        let mut sql = format!(
            "UPDATE {table} SET \
               reminder_lease_id = lower(hex(randomblob(16))), \
               reminder_lease_time = ?1, \
               reminder_lease_pid = ?2 \
             WHERE reminder_id IN ( \
               SELECT reminder_id FROM {table} \
               WHERE reminder_execution_time <= ?1 \
                 AND (reminder_lease_id IS NULL OR reminder_lease_time <= ?3)"
        );
        let mut sql_params: Vec<&dyn ToSql> = vec![&now, &pid, &stale_before];
        if !req.actor_types.is_empty() {
            sql.push_str(" AND actor_type IN (");
            for (i, actor_type) in req.actor_types.iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                sql.push('?');
                sql_params.push(actor_type);
            }
            sql.push(')');
        }
        sql.push_str(" ORDER BY reminder_execution_time LIMIT ?");
        sql_params.push(&limit);
        sql.push_str(
            ") RETURNING reminder_id, actor_type, actor_id, reminder_name, \
             reminder_execution_time, reminder_lease_id",
        );

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&sql)
            .context("failed to prepare reminders fetch")?;
        let claimed = stmt
            .query_map(sql_params.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("failed to claim reminders")?;

        let mut out = Vec::new();
        for item in claimed {
            let (reminder_id, actor_type, actor_id, name, execution_time, lease_id) =
                item.context("failed to read claimed reminder")?;
            out.push(FetchedReminder {
                reference: ReminderRef {
                    actor_type,
                    actor_id,
                    name,
                },
                execution_time: parse_rfc3339(&execution_time)?,
                lease: ReminderLease {
                    reminder_id,
                    lease_id,
                },
            });
        }
        Ok(out)
    }

    fn relinquish_reminder_lease(&self, lease: &ReminderLease) -> StoreResult<()> {
        self.ensure_running()?;
        if lease.reminder_id.is_empty() || lease.lease_id.is_empty() {
            return Err(StoreError::InvalidRequest(
                "reminder ID and lease ID are required",
            ));
        }

        let cfg = self.config()?;
        let conn = self.conn()?;
        // Conditional on the lease ID: a stale lease that was re-claimed by
        // another fetcher stays untouched.
        let affected = conn
            .execute(
                &format!(
                    "UPDATE {} SET reminder_lease_id = NULL, reminder_lease_time = NULL, \
                     reminder_lease_pid = NULL \
                     WHERE reminder_id = ? AND reminder_lease_id = ?",
                    cfg.table(Table::Reminders)
                ),
                params![lease.reminder_id, lease.lease_id],
            )
            .context("failed to relinquish reminder lease")?;
        if affected == 0 {
            return Err(StoreError::ReminderNotFound);
        }
        Ok(())
    }
}

fn validate_reminder_ref(r: &ReminderRef) -> StoreResult<()> {
    if r.actor_type.is_empty() || r.actor_id.is_empty() || r.name.is_empty() {
        return Err(StoreError::InvalidRequest(
            "actor type, actor ID and reminder name are required",
        ));
    }
    Ok(())
}

#[async_trait]
impl ReminderStore for SqliteStore {
    async fn get_reminder(&self, reference: ReminderRef) -> StoreResult<ReminderOptions> {
        self.run(move |inner| inner.get_reminder(&reference)).await
    }

    async fn create_reminder(&self, request: CreateReminderRequest) -> StoreResult<()> {
        self.run(move |inner| inner.create_reminder(&request)).await
    }

    async fn delete_reminder(&self, reference: ReminderRef) -> StoreResult<()> {
        self.run(move |inner| inner.delete_reminder(&reference)).await
    }

    async fn fetch_reminders(
        &self,
        request: FetchRemindersRequest,
    ) -> StoreResult<Vec<FetchedReminder>> {
        self.run(move |inner| inner.fetch_reminders(&request)).await
    }

    async fn relinquish_reminder_lease(&self, lease: ReminderLease) -> StoreResult<()> {
        self.run(move |inner| inner.relinquish_reminder_lease(&lease))
            .await
    }
}
