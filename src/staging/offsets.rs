//! Per-tenant export watermarks.

use rusqlite::{params, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;

use crate::core::clock::{from_micros, to_micros};
use crate::core::{Result, EPOCH};
use crate::staging::StagingStore;

/// Reads and moves the last exported event timestamp of a tenant.
///
/// `advance` must only be called with the maximum timestamp of a batch that is
/// already durable in the bucket; advancing first would lose rows on a failed
/// upload.
pub struct OffsetTracker<'a> {
    store: &'a StagingStore,
}

impl<'a> OffsetTracker<'a> {
    pub(crate) fn new(store: &'a StagingStore) -> Self {
        Self { store }
    }

    /// The tenant's watermark, or the epoch when it has never been exported.
    pub fn get(&self, tenant: &str) -> Result<OffsetDateTime> {
        let conn = self.store.conn()?;
        let micros: Option<i64> = conn
            .query_row(
                "SELECT last_event_ts FROM export_offsets WHERE tenant_id = ?1",
                params![tenant],
                |row| row.get(0),
            )
            .optional()?;
        match micros {
            Some(micros) => from_micros(micros),
            None => Ok(EPOCH),
        }
    }

    /// Replaces the watermark.
    ///
    /// Emulates an upsert with delete + insert. The IMMEDIATE transaction takes
    /// the database write lock up front, so two concurrent `set` calls are
    /// serialized and neither update is lost.
    pub fn set(&self, tenant: &str, ts: OffsetDateTime) -> Result<()> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM export_offsets WHERE tenant_id = ?1",
            params![tenant],
        )?;
        tx.execute(
            "INSERT INTO export_offsets (tenant_id, last_event_ts) VALUES (?1, ?2)",
            params![tenant, to_micros(ts)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Moves the watermark forward to `ts`, never backwards. Returns the stored
    /// watermark afterwards.
    ///
    /// The comparison and the write share one IMMEDIATE transaction, so an
    /// exporter that scanned under an older watermark cannot overwrite a newer
    /// value committed meanwhile by another exporter on the same database.
    pub fn advance(&self, tenant: &str, ts: OffsetDateTime) -> Result<OffsetDateTime> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<i64> = tx
            .query_row(
                "SELECT last_event_ts FROM export_offsets WHERE tenant_id = ?1",
                params![tenant],
                |row| row.get(0),
            )
            .optional()?;
        let next = to_micros(ts);
        if let Some(current) = current {
            if next <= current {
                log::debug!("offsets: tenant={tenant} kept newer watermark over {ts}");
                return from_micros(current);
            }
        }
        tx.execute(
            "DELETE FROM export_offsets WHERE tenant_id = ?1",
            params![tenant],
        )?;
        tx.execute(
            "INSERT INTO export_offsets (tenant_id, last_event_ts) VALUES (?1, ?2)",
            params![tenant, next],
        )?;
        tx.commit()?;
        from_micros(next)
    }

    /// Every tenant with a stored watermark.
    pub fn all(&self) -> Result<Vec<(String, OffsetDateTime)>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT tenant_id, last_event_ts FROM export_offsets ORDER BY tenant_id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(tenant, micros)| Ok((tenant, from_micros(micros)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn unset_watermark_is_epoch() {
        let store = StagingStore::open_in_memory().unwrap();
        assert_eq!(store.offsets().get("t1").unwrap(), EPOCH);
    }

    #[test]
    fn set_replaces_previous_value() {
        let store = StagingStore::open_in_memory().unwrap();
        let offsets = store.offsets();
        offsets.set("t1", datetime!(2024-01-01 09:00 UTC)).unwrap();
        offsets.set("t1", datetime!(2024-01-01 10:00 UTC)).unwrap();
        offsets.set("t2", datetime!(2024-01-02 00:00 UTC)).unwrap();

        assert_eq!(offsets.get("t1").unwrap(), datetime!(2024-01-01 10:00 UTC));
        let all = offsets.all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "t1");
    }

    #[test]
    fn advance_never_moves_backwards() {
        let store = StagingStore::open_in_memory().unwrap();
        let offsets = store.offsets();

        let first = offsets.advance("t1", datetime!(2024-01-01 10:00 UTC)).unwrap();
        assert_eq!(first, datetime!(2024-01-01 10:00 UTC));

        let stale = offsets.advance("t1", datetime!(2024-01-01 09:00 UTC)).unwrap();
        assert_eq!(stale, datetime!(2024-01-01 10:00 UTC));
        assert_eq!(offsets.get("t1").unwrap(), datetime!(2024-01-01 10:00 UTC));

        offsets.advance("t1", datetime!(2024-01-01 11:00 UTC)).unwrap();
        assert_eq!(offsets.get("t1").unwrap(), datetime!(2024-01-01 11:00 UTC));
    }
}
