//! Durable staging store for tenant events.
//!
//! A single SQLite connection behind a mutex. Writes run in IMMEDIATE
//! transactions, so a batch is either fully visible or not at all and
//! concurrent writers are serialized.

mod offsets;
mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use time::OffsetDateTime;

use crate::core::clock::{from_micros, to_micros};
use crate::core::{validate_tenant_id, Error, EventRecord, Result};

pub use offsets::OffsetTracker;

const EVENT_COLUMNS: &str = "tenant_id, event_id, ts, event_type, properties";

pub struct StagingStore {
    conn: Mutex<Connection>,
}

/// Row count for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TenantCount {
    pub tenant_id: String,
    pub count: u64,
}

impl StagingStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn)?;
        log::info!("staging: opened {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        schema::configure(&conn)?;
        schema::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::Poisoned)
    }

    pub fn offsets(&self) -> OffsetTracker<'_> {
        OffsetTracker::new(self)
    }

    /// Durably stores `events` for `tenant`, replacing any row with the same
    /// event id. All-or-nothing: on error nothing from the batch is visible.
    pub fn append(&self, tenant: &str, events: &[EventRecord]) -> Result<usize> {
        validate_tenant_id(tenant)?;
        for event in events {
            event.validate()?;
            if event.tenant_id != tenant {
                return Err(Error::InvalidEvent(format!(
                    "event {} belongs to tenant {}, not {tenant}",
                    event.event_id, event.tenant_id
                )));
            }
        }
        if events.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut delete = tx.prepare_cached(
                "DELETE FROM events_staging WHERE tenant_id = ?1 AND event_id = ?2",
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO events_staging (tenant_id, event_id, ts, event_type, properties)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for event in events {
                delete.execute(params![tenant, event.event_id])?;
                insert.execute(params![
                    tenant,
                    event.event_id,
                    to_micros(event.ts),
                    event.event_type,
                    event.properties,
                ])?;
            }
        }
        tx.commit()?;
        Ok(events.len())
    }

    /// Events with `ts > since`, ascending by timestamp (event id breaks ties).
    pub fn scan_since(&self, tenant: &str, since: OffsetDateTime) -> Result<Vec<EventRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS} FROM events_staging
             WHERE tenant_id = ?1 AND ts > ?2
             ORDER BY ts ASC, event_id ASC"
        ))?;
        let rows = stmt.query_map(params![tenant, to_micros(since)], read_event_row)?;
        collect_events(rows)
    }

    /// Newest timestamp strictly after `since`, if any.
    pub fn max_timestamp_since(
        &self,
        tenant: &str,
        since: OffsetDateTime,
    ) -> Result<Option<OffsetDateTime>> {
        let conn = self.conn()?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(ts) FROM events_staging WHERE tenant_id = ?1 AND ts > ?2",
            params![tenant, to_micros(since)],
            |row| row.get(0),
        )?;
        max.map(from_micros).transpose()
    }

    pub fn count_since(&self, tenant: &str, since: OffsetDateTime) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events_staging WHERE tenant_id = ?1 AND ts > ?2",
            params![tenant, to_micros(since)],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Every tenant with at least one staged row, sorted.
    pub fn distinct_tenants(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT DISTINCT tenant_id FROM events_staging ORDER BY tenant_id")?;
        let tenants = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tenants)
    }

    pub fn count_by_tenant(&self) -> Result<Vec<TenantCount>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT tenant_id, COUNT(*) FROM events_staging GROUP BY tenant_id ORDER BY tenant_id",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok(TenantCount {
                    tenant_id: row.get(0)?,
                    count: row.get::<_, i64>(1)?.max(0) as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    /// Newest events first.
    pub fn recent_sample(&self, tenant: &str, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS} FROM events_staging
             WHERE tenant_id = ?1
             ORDER BY ts DESC, event_id DESC
             LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![tenant, limit], read_event_row)?;
        collect_events(rows)
    }

    pub fn get_event(&self, tenant: &str, event_id: &str) -> Result<Option<EventRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS} FROM events_staging WHERE tenant_id = ?1 AND event_id = ?2"
        ))?;
        let row = stmt
            .query_row(params![tenant, event_id], read_event_row)
            .optional()?;
        row.map(StagedRow::into_event).transpose()
    }

    /// Deletes rows already covered by the tenant's watermark. Watermark read
    /// and delete share one transaction.
    pub fn purge_exported(&self, tenant: &str) -> Result<u64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let watermark: Option<i64> = tx
            .query_row(
                "SELECT last_event_ts FROM export_offsets WHERE tenant_id = ?1",
                params![tenant],
                |row| row.get(0),
            )
            .optional()?;
        let Some(watermark) = watermark else {
            return Ok(0);
        };
        let deleted = tx.execute(
            "DELETE FROM events_staging WHERE tenant_id = ?1 AND ts <= ?2",
            params![tenant, watermark],
        )?;
        tx.commit()?;
        log::info!("staging: purged tenant={tenant} rows={deleted}");
        Ok(deleted as u64)
    }

    pub fn schema_versions(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        schema::applied_versions(&conn)
    }

    /// Readiness probe.
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

/// Raw column values; timestamp conversion happens outside the rusqlite
/// closure so range errors surface as `Error::Timestamp`.
struct StagedRow {
    tenant_id: String,
    event_id: String,
    ts_micros: i64,
    event_type: Option<String>,
    properties: Option<String>,
}

impl StagedRow {
    fn into_event(self) -> Result<EventRecord> {
        Ok(EventRecord {
            tenant_id: self.tenant_id,
            event_id: self.event_id,
            ts: from_micros(self.ts_micros)?,
            event_type: self.event_type,
            properties: self.properties,
        })
    }
}

fn read_event_row(row: &Row<'_>) -> rusqlite::Result<StagedRow> {
    Ok(StagedRow {
        tenant_id: row.get(0)?,
        event_id: row.get(1)?,
        ts_micros: row.get(2)?,
        event_type: row.get(3)?,
        properties: row.get(4)?,
    })
}

fn collect_events(
    rows: impl Iterator<Item = rusqlite::Result<StagedRow>>,
) -> Result<Vec<EventRecord>> {
    let mut events = Vec::new();
    for row in rows {
        events.push(row?.into_event()?);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    fn event(tenant: &str, id: &str, ts: OffsetDateTime) -> EventRecord {
        EventRecord::new(tenant, id, ts)
    }

    #[test]
    fn append_replaces_same_event_id() {
        let store = StagingStore::open_in_memory().unwrap();
        let ts = datetime!(2024-01-01 09:00 UTC);
        store
            .append("t1", &[event("t1", "e1", ts).with_properties(r#"{"v":1}"#)])
            .unwrap();
        store
            .append("t1", &[event("t1", "e1", ts).with_properties(r#"{"v":2}"#)])
            .unwrap();

        let rows = store.scan_since("t1", crate::core::EPOCH).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].properties.as_deref(), Some(r#"{"v":2}"#));
    }

    #[test]
    fn failed_batch_leaves_store_unchanged() {
        let store = StagingStore::open_in_memory().unwrap();
        let ts = datetime!(2024-01-01 09:00 UTC);
        store.append("t1", &[event("t1", "e1", ts)]).unwrap();

        let batch = vec![event("t1", "e2", ts), event("t1", "", ts)];
        assert!(store.append("t1", &batch).is_err());
        assert_eq!(store.count_since("t1", crate::core::EPOCH).unwrap(), 1);
    }

    #[test]
    fn statement_failure_rolls_back_whole_batch() {
        let store = StagingStore::open_in_memory().unwrap();
        let ts = datetime!(2024-01-01 09:00 UTC);
        store.append("t1", &[event("t1", "e1", ts)]).unwrap();
        store
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON events_staging
                 WHEN NEW.event_id = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'poisoned event'); END;",
            )
            .unwrap();

        let batch = vec![
            event("t1", "e2", ts),
            event("t1", "e1", ts).with_type("replaced"),
            event("t1", "poison", ts),
        ];
        let err = store.append("t1", &batch).unwrap_err();
        assert!(matches!(err, Error::Sqlite(_)));

        assert_eq!(store.count_since("t1", crate::core::EPOCH).unwrap(), 1);
        assert!(store.get_event("t1", "e2").unwrap().is_none());
        let kept = store.get_event("t1", "e1").unwrap().unwrap();
        assert!(kept.event_type.is_none());
    }

    #[test]
    fn foreign_tenant_in_batch_is_rejected() {
        let store = StagingStore::open_in_memory().unwrap();
        let ts = datetime!(2024-01-01 09:00 UTC);
        let err = store.append("t1", &[event("t2", "e1", ts)]).unwrap_err();
        assert!(matches!(err, Error::InvalidEvent(_)));
        assert!(store.distinct_tenants().unwrap().is_empty());
    }

    #[test]
    fn scan_is_strictly_after_and_ascending() {
        let store = StagingStore::open_in_memory().unwrap();
        let base = datetime!(2024-01-01 09:00 UTC);
        let events = vec![
            event("t1", "c", base + Duration::minutes(2)),
            event("t1", "a", base),
            event("t1", "b", base + Duration::minutes(1)),
        ];
        store.append("t1", &events).unwrap();

        let rows = store.scan_since("t1", base).unwrap();
        let ids: Vec<_> = rows.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let max = store.max_timestamp_since("t1", base).unwrap();
        assert_eq!(max, Some(base + Duration::minutes(2)));
        assert_eq!(
            store
                .max_timestamp_since("t1", base + Duration::minutes(2))
                .unwrap(),
            None
        );
    }

    #[test]
    fn tenants_and_counts() {
        let store = StagingStore::open_in_memory().unwrap();
        let ts = datetime!(2024-01-01 09:00 UTC);
        store
            .append("b", &[event("b", "1", ts), event("b", "2", ts)])
            .unwrap();
        store.append("a", &[event("a", "1", ts)]).unwrap();

        assert_eq!(store.distinct_tenants().unwrap(), vec!["a", "b"]);
        let counts = store.count_by_tenant().unwrap();
        assert_eq!(counts[1].tenant_id, "b");
        assert_eq!(counts[1].count, 2);
    }

    #[test]
    fn recent_sample_is_newest_first() {
        let store = StagingStore::open_in_memory().unwrap();
        let base = datetime!(2024-01-01 09:00 UTC);
        let events: Vec<_> = (0..5)
            .map(|i| event("t1", &format!("e{i}"), base + Duration::seconds(i)))
            .collect();
        store.append("t1", &events).unwrap();

        let sample = store.recent_sample("t1", 2).unwrap();
        assert_eq!(sample.len(), 2);
        assert_eq!(sample[0].event_id, "e4");
        assert_eq!(sample[1].event_id, "e3");
    }

    #[test]
    fn purge_removes_only_exported_rows() {
        let store = StagingStore::open_in_memory().unwrap();
        let base = datetime!(2024-01-01 09:00 UTC);
        store
            .append(
                "t1",
                &[
                    event("t1", "old", base),
                    event("t1", "new", base + Duration::hours(1)),
                ],
            )
            .unwrap();
        assert_eq!(store.purge_exported("t1").unwrap(), 0);

        store.offsets().set("t1", base).unwrap();
        assert_eq!(store.purge_exported("t1").unwrap(), 1);
        assert!(store.get_event("t1", "old").unwrap().is_none());
        assert!(store.get_event("t1", "new").unwrap().is_some());
    }

    #[test]
    fn reopen_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("staging.sqlite3");
        let ts = datetime!(2024-01-01 09:00 UTC);
        {
            let store = StagingStore::open(&path).unwrap();
            store.append("t1", &[event("t1", "e1", ts)]).unwrap();
        }
        let store = StagingStore::open(&path).unwrap();
        assert_eq!(store.get_event("t1", "e1").unwrap().unwrap().ts, ts);
        assert_eq!(store.schema_versions().unwrap().len(), 2);
        store.ping().unwrap();
    }
}
