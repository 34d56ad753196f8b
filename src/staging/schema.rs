//! Staging schema and migrations.
//!
//! ```text
//! events_staging                     export_offsets
//! ┌───────────────────────┐          ┌───────────────────────┐
//! │ tenant_id   TEXT      │          │ tenant_id     TEXT PK │
//! │ event_id    TEXT      │          │ last_event_ts INTEGER │
//! │ ts          INTEGER   │          └───────────────────────┘
//! │ event_type  TEXT?     │
//! │ properties  TEXT?     │          schema_migrations
//! └───────────────────────┘          ┌───────────────────────┐
//!   UNIQUE (tenant_id, event_id)     │ version    TEXT PK    │
//!   INDEX  (tenant_id, ts)           │ applied_at INTEGER    │
//!                                    └───────────────────────┘
//! ```
//!
//! Timestamps are microseconds since the Unix epoch, UTC.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::core::Result;

const CREATE_MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
)
"#;

/// Ordered migrations. Versions are applied once, in order, each in its own
/// transaction together with its `schema_migrations` row.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_events_staging",
        r#"
        CREATE TABLE events_staging (
            tenant_id  TEXT NOT NULL,
            event_id   TEXT NOT NULL,
            ts         INTEGER NOT NULL,
            event_type TEXT,
            properties TEXT
        );
        CREATE UNIQUE INDEX idx_events_staging_tenant_event
            ON events_staging(tenant_id, event_id);
        CREATE INDEX idx_events_staging_tenant_ts
            ON events_staging(tenant_id, ts);
        "#,
    ),
    (
        "0002_export_offsets",
        r#"
        CREATE TABLE export_offsets (
            tenant_id     TEXT PRIMARY KEY,
            last_event_ts INTEGER NOT NULL
        );
        "#,
    ),
];

const BUSY_TIMEOUT_MS: u64 = 5_000;

/// WAL keeps readers off the writer's lock; `synchronous = NORMAL` is durable
/// across process crashes in WAL mode. `journal_mode` reports the resulting
/// mode as a row, so it is read rather than executed.
pub(crate) fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Applies pending migrations and returns the versions applied by this call.
pub(crate) fn migrate(conn: &mut Connection) -> Result<Vec<&'static str>> {
    conn.execute_batch(CREATE_MIGRATIONS)?;

    let mut applied = Vec::new();
    for (version, sql) in MIGRATIONS {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = tx
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1",
                params![version],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            continue;
        }
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, now_micros()],
        )?;
        tx.commit()?;
        log::info!("staging: applied migration {version}");
        applied.push(*version);
    }
    Ok(applied)
}

pub(crate) fn applied_versions(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(versions)
}

fn now_micros() -> i64 {
    crate::core::clock::to_micros(time::OffsetDateTime::now_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        configure(&conn).unwrap();

        let first = migrate(&mut conn).unwrap();
        assert_eq!(first, vec!["0001_events_staging", "0002_export_offsets"]);

        let second = migrate(&mut conn).unwrap();
        assert!(second.is_empty());

        let versions = applied_versions(&conn).unwrap();
        assert_eq!(versions.len(), MIGRATIONS.len());
    }
}
