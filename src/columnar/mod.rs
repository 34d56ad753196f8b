//! Parquet encoding and decoding of staged events.

mod reader;
mod schema;
mod sink;

pub use reader::{read_events, UrlReader};
pub use schema::event_schema;
pub use sink::{write_events_file, FileSummary, ParquetSink, DEFAULT_ZSTD_LEVEL};
