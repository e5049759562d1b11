use segment_helper::HelperError;

#[derive(thiserror::Error, Debug)]
pub enum CoordinatorError {
    #[error("{0}")]
    ScopeFilter(String),

    #[error("{0}")]
    InvalidFlags(String),

    #[error("Corrupt table of contents: {0}")]
    CorruptToc(String),

    #[error("Cannot restore a backup taken on a cluster with {backup} segments to a cluster with {current} segments unless the --resize-cluster flag is used.")]
    SegmentCountMismatch { backup: usize, current: usize },

    #[error("Segment count for backup with timestamp {0} is unknown, cannot restore using --resize-cluster flag")]
    SegmentCountUnknown(String),

    #[error("Error loading data into table {table}: {cause}")]
    DataLoad { table: String, cause: String },

    #[error("Error applying metadata for {object}: {cause}")]
    MetadataApply { object: String, cause: String },

    #[error("Helper for segment {content} sent nothing for {secs}s and was terminated")]
    HelperTimeout { content: i32, secs: u64 },

    #[error("{0}")]
    Helper(String),

    #[error("Encountered {count} errors during restore. Table names are listed in {path}")]
    PartialRestore { count: usize, path: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Backup history error: {0}")]
    History(String),

    #[error("Storage plugin error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    InvalidTimestamp(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoordinatorError {
    /// Per-table failures that `--on-error-continue` records and moves past.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::DataLoad { .. } | CoordinatorError::MetadataApply { .. }
        )
    }
}

impl From<HelperError> for CoordinatorError {
    fn from(e: HelperError) -> Self {
        match e {
            HelperError::CorruptToc(m) => CoordinatorError::CorruptToc(m),
            HelperError::InvalidTimestamp(_) => CoordinatorError::InvalidTimestamp(e.to_string()),
            HelperError::Io(io) => CoordinatorError::Io(io),
            HelperError::Cancelled => CoordinatorError::Cancelled,
            other => CoordinatorError::Helper(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for CoordinatorError {
    fn from(e: sqlx::Error) -> Self {
        CoordinatorError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for CoordinatorError {
    fn from(e: rusqlite::Error) -> Self {
        CoordinatorError::History(e.to_string())
    }
}

impl From<r2d2::Error> for CoordinatorError {
    fn from(e: r2d2::Error) -> Self {
        CoordinatorError::History(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
