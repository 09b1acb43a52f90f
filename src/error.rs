use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    System(#[from] SystemError),
}

impl EngineError {
    /// Setup errors halt the whole run; everything else is recovered at an
    /// entity, window or date boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Setup(_))
    }
}

/// Unrecoverable problems detected before any computation starts.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Source store unreachable at '{path}': {msg}")]
    SourceUnreachable { path: String, msg: String },

    #[error("Destination store unreachable at '{path}': {msg}")]
    DestinationUnreachable { path: String, msg: String },

    #[error("Mandatory benchmark series '{0}' is missing or empty")]
    MissingBenchmark(String),

    #[error("No usable observations for mode '{0}'")]
    NoObservations(String),

    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),
}

/// Errors related to observation parsing, panel construction and metric computation.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Malformed date '{value}' for entity '{entity}'")]
    MalformedDate { entity: String, value: String },

    #[error("Duplicate observation for entity '{entity}' at {date}; input must be de-duplicated")]
    DuplicateObservation { entity: String, date: String },

    #[error("Unknown reference date {0} (not on the panel grid)")]
    UnknownReferenceDate(String),

    #[error("Empty window slice for window '{window}' ending {date}")]
    EmptySlice { window: String, date: String },

    #[error("Invalid window specification: {0}")]
    InvalidWindow(String),

    #[error("Invalid entity key: '{0}'")]
    InvalidEntityKey(String),

    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    #[error("Data frame error: {0}")]
    DataFrame(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Failed to parse enum: {0}")]
    ParseEnum(#[from] strum::ParseError),
}

/// Errors raised by the relational store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Append rejected for {date}: {msg}")]
    AppendRejected { date: String, msg: String },
}

/// Errors related to file I/O, serialization and cache persistence.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("IO operation failed")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed")]
    Json(#[from] serde_json::Error),

    #[error("Failed to encode or decode cache payload")]
    Encoding(#[from] postcard::Error),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Failed to write data: {0}")]
    WriteFailed(String),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),
}

/// Errors related to internal invariants.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Index out of bounds: {0}")]
    IndexOutOfBounds(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}
