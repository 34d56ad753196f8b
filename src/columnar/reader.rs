use std::sync::Arc;

use arrow::array::{Array, StringArray, TimestampMicrosecondArray};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::columnar::schema::{COL_EVENT_ID, COL_PROPERTIES, COL_TENANT_ID, COL_TS, COL_TYPE};
use crate::core::clock::from_micros;
use crate::core::{Clock, Error, EventRecord, Result, SystemClock};
use crate::storage::SignedUrl;

const READ_BATCH_ROWS: usize = 2048;

/// Decodes every row of an in-memory Parquet file.
pub fn read_events(data: Bytes) -> Result<Vec<EventRecord>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(data)?
        .with_batch_size(READ_BATCH_ROWS)
        .build()?;

    let mut events = Vec::new();
    for batch in reader {
        let batch = batch?;
        decode_batch(&batch, &mut events)?;
    }
    Ok(events)
}

fn decode_batch(batch: &RecordBatch, out: &mut Vec<EventRecord>) -> Result<()> {
    let tenant_ids = get_array::<StringArray>(batch, COL_TENANT_ID)?;
    let event_ids = get_array::<StringArray>(batch, COL_EVENT_ID)?;
    let ts = get_array::<TimestampMicrosecondArray>(batch, COL_TS)?;
    let types = get_array::<StringArray>(batch, COL_TYPE)?;
    let properties = get_array::<StringArray>(batch, COL_PROPERTIES)?;

    out.reserve(batch.num_rows());
    for row in 0..batch.num_rows() {
        if tenant_ids.is_null(row) || event_ids.is_null(row) || ts.is_null(row) {
            return Err(Error::Corrupt(format!("null key column at row {row}")));
        }
        out.push(EventRecord {
            tenant_id: tenant_ids.value(row).to_string(),
            event_id: event_ids.value(row).to_string(),
            ts: from_micros(ts.value(row))?,
            event_type: optional_str(types, row),
            properties: optional_str(properties, row),
        });
    }
    Ok(())
}

fn optional_str(array: &StringArray, row: usize) -> Option<String> {
    (!array.is_null(row)).then(|| array.value(row).to_string())
}

fn get_array<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    let column = batch
        .schema()
        .column_with_name(name)
        .ok_or_else(|| Error::Corrupt(format!("missing column {name}")))?
        .0;
    batch
        .column(column)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::Corrupt(format!("column {name} has unexpected type")))
}

/// Reads Parquet rows through signed URLs.
///
/// `file://` URLs are read from disk; `http(s)` URLs are fetched with a plain
/// GET. A URL past its expiry is refused before any byte is read.
pub struct UrlReader {
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl UrlReader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The union of rows behind `urls`, in URL order.
    pub async fn read_rows_from_urls(&self, urls: &[SignedUrl]) -> Result<Vec<EventRecord>> {
        let mut rows = Vec::new();
        for signed in urls {
            let data = self.fetch(signed).await?;
            let mut decoded = tokio::task::spawn_blocking(move || read_events(data))
                .await
                .map_err(|err| Error::Io(std::io::Error::other(err)))??;
            log::debug!("columnar: read key={} rows={}", signed.key, decoded.len());
            rows.append(&mut decoded);
        }
        Ok(rows)
    }

    async fn fetch(&self, signed: &SignedUrl) -> Result<Bytes> {
        if signed.is_expired(self.clock.now()) {
            return Err(Error::UrlExpired {
                key: signed.key.clone(),
            });
        }
        match signed.url.scheme() {
            "file" => {
                let path = signed
                    .url
                    .to_file_path()
                    .map_err(|_| Error::UnsupportedUrl(signed.url.to_string()))?;
                Ok(Bytes::from(tokio::fs::read(path).await?))
            }
            "http" | "https" => {
                let response = self
                    .client
                    .get(signed.url.clone())
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(response.bytes().await?)
            }
            other => Err(Error::UnsupportedUrl(format!("scheme {other}"))),
        }
    }
}

impl Default for UrlReader {
    fn default() -> Self {
        Self::new()
    }
}
