//! Error types for KASA

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for process-level KASA operations
pub type Result<T> = std::result::Result<T, KasaError>;

/// Process-level error type
#[derive(Error, Debug)]
pub enum KasaError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Sink error outside of a flush (construction, shutdown)
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),
}

/// Error type for buffer store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store would exceed its configured capacity
    #[error("buffer store full: {stored} values stored, capacity {capacity}")]
    Full { stored: usize, capacity: usize },
}

/// Error type for sink operations
#[derive(Error, Debug)]
pub enum SinkError {
    /// Initialization failed
    #[error("initialization failed: {0}")]
    Init(String),

    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Datastore answered but refused the write
    #[error("insert rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Rows that could not be turned into a bulk-insert body
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("row {row} has {got} values, expected {expected}")]
    RowWidth {
        row: usize,
        expected: usize,
        got: usize,
    },

    #[error("row {row} could not be serialized: {reason}")]
    Serialize { row: usize, reason: String },
}

/// Rejections raised while decoding an inbound record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(String),

    #[error("record must be a JSON object")]
    NotAnObject,

    #[error("record is empty, expected a table identifier as first key")]
    MissingTable,

    #[error("table identifier under key '{key}' must be a non-empty string")]
    InvalidTable { key: String },

    #[error("record for table '{table}' has no fields")]
    NoFields { table: String },

    #[error("field name must not be empty")]
    EmptyFieldName,

    #[error("field '{field}' must be a scalar (string, number, boolean or null)")]
    NonScalar { field: String },
}

/// Failure to admit a record into its table buffer
#[derive(Error, Debug)]
pub enum IngestError {
    /// Buffer append was not acknowledged; the record is not durable
    #[error("ingest failed for table '{table}': {source}")]
    IngestFailed {
        table: String,
        #[source]
        source: StoreError,
    },

    /// Record's field list differs from the schema already buffered for its table
    #[error("schema mismatch for table '{table}': buffered {expected:?}, got {got:?}")]
    SchemaMismatch {
        table: String,
        expected: Vec<String>,
        got: Vec<String>,
    },
}

/// Failure to flush a table buffer; the buffer is left untouched
#[derive(Error, Debug)]
pub enum FlushError {
    /// Buffer could not be read or trimmed
    #[error("buffer store error for table '{table}': {source}")]
    Store {
        table: String,
        #[source]
        source: StoreError,
    },

    /// Buffered value count is not a multiple of the field count
    #[error("schema mismatch for table '{table}': {buffered} values do not split into rows of {width}")]
    SchemaMismatch {
        table: String,
        buffered: usize,
        width: usize,
    },

    /// Values are buffered but no field list is registered for them
    #[error("no fields known for the values buffered in table '{table}'")]
    NoFields { table: String },

    /// Snapshot could not be encoded
    #[error("encoding batch for table '{table}' failed: {source}")]
    Encode {
        table: String,
        #[source]
        source: EncodeError,
    },

    /// Datastore rejected or could not accept the bulk write
    #[error("bulk insert into '{table}' failed: {source}")]
    Sink {
        table: String,
        #[source]
        source: SinkError,
    },
}

impl IngestError {
    /// HTTP status reported to the ingesting client
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::IngestFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            IngestError::SchemaMismatch { .. } => StatusCode::CONFLICT,
        }
    }
}

impl FlushError {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            FlushError::Store { .. } => "store",
            FlushError::SchemaMismatch { .. } => "schema_mismatch",
            FlushError::NoFields { .. } => "no_fields",
            FlushError::Encode { .. } => "encode",
            FlushError::Sink { .. } => "sink",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            FlushError::Store { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FlushError::SchemaMismatch { .. } => StatusCode::CONFLICT,
            FlushError::NoFields { .. } => StatusCode::CONFLICT,
            FlushError::Encode { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            FlushError::Sink { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}
