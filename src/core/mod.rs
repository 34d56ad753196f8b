//! Shared types: errors, event records and time helpers.

pub mod clock;
pub mod error;
pub mod event;

pub use clock::{Clock, FixedClock, SystemClock, EPOCH};
pub use error::{Error, Result};
pub use event::{validate_tenant_id, EventRecord};
