use time::OffsetDateTime;

use crate::core::{Error, Result};

/// A source of wall-clock time.
///
/// Signed URL expiry is checked against this clock, which lets tests move time
/// forward without sleeping.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> OffsetDateTime;
}

/// A clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock pinned to a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub OffsetDateTime);

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}

/// Watermark reported for a tenant that has never been exported.
pub const EPOCH: OffsetDateTime = OffsetDateTime::UNIX_EPOCH;

/// Microseconds since the Unix epoch. Sub-microsecond precision is truncated.
pub fn to_micros(ts: OffsetDateTime) -> i64 {
    let nanos = ts.unix_timestamp_nanos();
    let micros = nanos.div_euclid(1_000);
    micros.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

pub fn from_micros(micros: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(micros as i128 * 1_000).map_err(Error::from)
}
