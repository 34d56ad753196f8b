use std::fs::File;
use std::io::{Seek, Write};
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use time::OffsetDateTime;

use crate::columnar::schema::{event_schema, UTC};
use crate::core::clock::to_micros;
use crate::core::{Error, EventRecord, Result};

pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Rows per record batch handed to the Parquet writer.
const BATCH_ROWS: usize = 8192;

/// What was written to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub rows: usize,
    pub bytes: u64,
    pub max_ts: Option<OffsetDateTime>,
}

pub struct ParquetSink<W: Write + Seek + Send> {
    writer: Option<ArrowWriter<W>>,
    schema: SchemaRef,
    rows: usize,
    max_ts: Option<OffsetDateTime>,
}

impl ParquetSink<File> {
    pub fn try_new(path: impl AsRef<Path>, zstd_level: i32) -> Result<Self> {
        let file = File::create(path)?;
        Self::from_writer(file, zstd_level)
    }
}

impl<W: Write + Seek + Send> ParquetSink<W> {
    pub fn from_writer(writer: W, zstd_level: i32) -> Result<Self> {
        let schema = event_schema();
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::try_new(zstd_level)?))
            .build();
        let writer = ArrowWriter::try_new(writer, Arc::clone(&schema), Some(props))?;
        Ok(Self {
            writer: Some(writer),
            schema,
            rows: 0,
            max_ts: None,
        })
    }

    pub fn write_events(&mut self, events: &[EventRecord]) -> Result<()> {
        for chunk in events.chunks(BATCH_ROWS) {
            let batch = self.to_batch(chunk)?;
            let Some(writer) = self.writer.as_mut() else {
                return Err(Error::Corrupt("parquet sink is closed".to_string()));
            };
            writer.write(&batch)?;
            self.rows += chunk.len();
            for event in chunk {
                self.max_ts = Some(self.max_ts.map_or(event.ts, |cur| cur.max(event.ts)));
            }
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Result<(usize, Option<OffsetDateTime>)> {
        if let Some(writer) = self.writer.take() {
            writer.close()?;
        }
        Ok((self.rows, self.max_ts))
    }

    fn to_batch(&self, events: &[EventRecord]) -> Result<RecordBatch> {
        let tenant_ids = StringArray::from_iter_values(events.iter().map(|e| e.tenant_id.as_str()));
        let event_ids = StringArray::from_iter_values(events.iter().map(|e| e.event_id.as_str()));
        let ts = TimestampMicrosecondArray::from_iter_values(events.iter().map(|e| to_micros(e.ts)))
            .with_timezone(UTC);
        let types: StringArray = events.iter().map(|e| e.event_type.as_deref()).collect();
        let properties: StringArray = events.iter().map(|e| e.properties.as_deref()).collect();

        let columns: Vec<ArrayRef> = vec![
            Arc::new(tenant_ids),
            Arc::new(event_ids),
            Arc::new(ts),
            Arc::new(types),
            Arc::new(properties),
        ];
        Ok(RecordBatch::try_new(Arc::clone(&self.schema), columns)?)
    }
}

/// Writes `events` in the given order to a new ZSTD-compressed Parquet file at
/// `path`.
pub fn write_events_file(
    path: impl AsRef<Path>,
    events: &[EventRecord],
    zstd_level: i32,
) -> Result<FileSummary> {
    let path = path.as_ref();
    let mut sink = ParquetSink::try_new(path, zstd_level)?;
    sink.write_events(events)?;
    let (rows, max_ts) = sink.finish()?;
    let bytes = std::fs::metadata(path)?.len();
    Ok(FileSummary {
        rows,
        bytes,
        max_ts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn summary_tracks_rows_and_max_ts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.parquet");
        let events = vec![
            EventRecord::new("t1", "a", datetime!(2024-01-01 09:00 UTC)),
            EventRecord::new("t1", "b", datetime!(2024-01-01 09:45 UTC)).with_type("click"),
            EventRecord::new("t1", "c", datetime!(2024-01-01 09:10 UTC)),
        ];
        let summary = write_events_file(&path, &events, DEFAULT_ZSTD_LEVEL).unwrap();
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.max_ts, Some(datetime!(2024-01-01 09:45 UTC)));
        assert!(summary.bytes > 0);
    }

    #[test]
    fn invalid_zstd_level_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.parquet");
        assert!(matches!(
            ParquetSink::try_new(&path, 99),
            Err(Error::Parquet(_))
        ));
    }

    #[test]
    fn closed_sink_rejects_writes() {
        let mut sink = ParquetSink::from_writer(std::io::Cursor::new(Vec::new()), 1).unwrap();
        sink.finish().unwrap();
        let event = EventRecord::new("t1", "a", datetime!(2024-01-01 09:00 UTC));
        assert!(sink.write_events(&[event]).is_err());
    }
}
