use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};

pub const UTC: &str = "UTC";

pub const COL_TENANT_ID: &str = "tenant_id";
pub const COL_EVENT_ID: &str = "event_id";
pub const COL_TS: &str = "ts";
pub const COL_TYPE: &str = "type";
pub const COL_PROPERTIES: &str = "properties";

/// Column layout shared by exported and compacted files.
pub fn event_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(COL_TENANT_ID, DataType::Utf8, false),
        Field::new(COL_EVENT_ID, DataType::Utf8, false),
        Field::new(
            COL_TS,
            DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into())),
            false,
        ),
        Field::new(COL_TYPE, DataType::Utf8, true),
        Field::new(COL_PROPERTIES, DataType::Utf8, true),
    ]))
}
