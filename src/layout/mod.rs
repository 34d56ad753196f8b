//! Object key layout for exported files.
//!
//! Keys follow `tenant_id=<tenant>/dt=<YYYY-MM-DD>/hr=<HH>/<filename>`. The
//! bucket listing is the only manifest, so everything the compactor knows about
//! a file's partition comes from parsing its key.

use std::collections::BTreeMap;
use std::fmt;

use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

pub const TENANT_FIELD: &str = "tenant_id";
pub const DATE_FIELD: &str = "dt";
pub const HOUR_FIELD: &str = "hr";
pub const PARQUET_EXTENSION: &str = "parquet";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    EmptyComponent { field: &'static str },
    InvalidComponent { field: &'static str, value: String },
    InvalidDate { value: String },
    InvalidHour { value: String },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::EmptyComponent { field } => {
                write!(f, "empty key component: {field}")
            }
            LayoutError::InvalidComponent { field, value } => {
                write!(f, "invalid key component for {field}: {value}")
            }
            LayoutError::InvalidDate { value } => {
                write!(f, "invalid date format (expected YYYY-MM-DD): {value}")
            }
            LayoutError::InvalidHour { value } => {
                write!(f, "invalid hour (expected 00-23): {value}")
            }
        }
    }
}

impl std::error::Error for LayoutError {}

type Result<T> = std::result::Result<T, LayoutError>;

/// The (date, hour) partition of an exported file, always in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    pub date: Date,
    pub hour: u8,
}

impl PartitionKey {
    pub fn from_timestamp(ts: OffsetDateTime) -> Self {
        let utc = ts.to_offset(UtcOffset::UTC);
        Self {
            date: utc.date(),
            hour: utc.hour(),
        }
    }

    pub fn parse(date: &str, hour: &str) -> Result<Self> {
        let date = parse_date(date)?;
        let hour = parse_hour(hour)?;
        Ok(Self { date, hour })
    }

    /// Parses the partition out of a full object key. `None` when either the
    /// `dt` or `hr` segment is missing or malformed.
    pub fn from_object_key(key: &str) -> Option<Self> {
        let fields = parse_partition_fields(key);
        let date = fields.get(DATE_FIELD)?;
        let hour = fields.get(HOUR_FIELD)?;
        Self::parse(date, hour).ok()
    }

    pub fn date_string(&self) -> String {
        format!(
            "{:04}-{:02}-{:02}",
            self.date.year(),
            self.date.month() as u8,
            self.date.day()
        )
    }

    pub fn hour_string(&self) -> String {
        format!("{:02}", self.hour)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{DATE_FIELD}={}/{HOUR_FIELD}={}",
            self.date_string(),
            self.hour_string()
        )
    }
}

/// `tenant_id=<tenant>/`, the listing prefix for one tenant.
pub fn tenant_prefix(tenant: &str) -> Result<String> {
    validate_component(TENANT_FIELD, tenant)?;
    Ok(format!("{TENANT_FIELD}={tenant}/"))
}

pub fn object_key(tenant: &str, partition: &PartitionKey, filename: &str) -> Result<String> {
    validate_component("filename", filename)?;
    Ok(format!("{}{partition}/{filename}", tenant_prefix(tenant)?))
}

/// `part-<uuid>.parquet`, unique per export.
pub fn export_file_name() -> String {
    format!("part-{}.{PARQUET_EXTENSION}", uuid::Uuid::new_v4())
}

/// `part-compact-<uuid>.parquet`, unique per merge.
pub fn compacted_file_name() -> String {
    format!("part-compact-{}.{PARQUET_EXTENSION}", uuid::Uuid::new_v4())
}

/// Splits a key on `/`, then each segment on its first `=`. Segments without
/// `=` or with an empty value are ignored.
pub fn parse_partition_fields(key: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    for segment in key.split('/') {
        let Some((name, value)) = segment.split_once('=') else {
            continue;
        };
        if name.is_empty() || value.is_empty() {
            continue;
        }
        fields.insert(name.to_string(), value.to_string());
    }
    fields
}

fn validate_component(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(LayoutError::EmptyComponent { field });
    }
    if value == "." || value == ".." || value.contains(['/', '\\', '=', '\0']) {
        return Err(LayoutError::InvalidComponent {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn parse_date(value: &str) -> Result<Date> {
    let invalid = || LayoutError::InvalidDate {
        value: value.to_string(),
    };
    let bytes = value.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return Err(invalid());
    }
    Date::parse(value, format_description!("[year]-[month]-[day]")).map_err(|_| invalid())
}

fn parse_hour(value: &str) -> Result<u8> {
    let invalid = || LayoutError::InvalidHour {
        value: value.to_string(),
    };
    if value.len() != 2 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    match value.parse::<u8>() {
        Ok(hour) if hour < 24 => Ok(hour),
        _ => Err(invalid()),
    }
}
