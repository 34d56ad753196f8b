//! Event records staged per tenant.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::core::{Error, Result, EPOCH};

const MAX_TENANT_LEN: usize = 128;

/// A single event owned by a tenant.
///
/// `(tenant_id, event_id)` identifies the record; appending the same pair again
/// replaces the stored row. `properties` is opaque JSON text and is never
/// interpreted by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub tenant_id: String,
    pub event_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<String>,
}

impl EventRecord {
    pub fn new(
        tenant_id: impl Into<String>,
        event_id: impl Into<String>,
        ts: OffsetDateTime,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            event_id: event_id.into(),
            ts,
            event_type: None,
            properties: None,
        }
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_properties(mut self, properties: impl Into<String>) -> Self {
        self.properties = Some(properties.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_tenant_id(&self.tenant_id)?;
        if self.event_id.is_empty() {
            return Err(Error::InvalidEvent(format!(
                "empty event id for tenant {}",
                self.tenant_id
            )));
        }
        // Unexported tenants scan `ts > EPOCH`; earlier rows could never be exported.
        if self.ts <= EPOCH {
            return Err(Error::InvalidEvent(format!(
                "event {} has timestamp {} at or before the unix epoch",
                self.event_id, self.ts
            )));
        }
        Ok(())
    }
}

/// Tenant ids become object key segments (`tenant_id=<t>/...`), so they are
/// restricted to a path-safe alphabet.
pub fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    if tenant_id.is_empty() || tenant_id.len() > MAX_TENANT_LEN {
        return Err(Error::InvalidEvent(format!(
            "tenant id must be 1..={MAX_TENANT_LEN} characters"
        )));
    }
    if tenant_id == "." || tenant_id == ".." {
        return Err(Error::InvalidEvent(format!("invalid tenant id: {tenant_id}")));
    }
    let valid = tenant_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(Error::InvalidEvent(format!("invalid tenant id: {tenant_id}")));
    }
    Ok(())
}
