#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for vroom_core::LookupError {
    fn from(e: StoreError) -> Self {
        vroom_core::LookupError::Backend(e.to_string())
    }
}

impl From<StoreError> for vroom_core::ProviderError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Serialization(msg) => vroom_core::ProviderError::Serialization(msg),
            other => vroom_core::ProviderError::Unavailable(other.to_string()),
        }
    }
}
