use crate::layout::LayoutError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("staging store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("timestamp out of range: {0}")]
    Timestamp(#[from] time::error::ComponentRange),
    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("signed url for {key} expired")]
    UrlExpired { key: String },
    #[error("unsupported url: {0}")]
    UnsupportedUrl(String),
    #[error("corrupt data: {0}")]
    Corrupt(String),
    #[error("staging store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, Error>;
