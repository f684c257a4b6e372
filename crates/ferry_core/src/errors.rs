use std::sync::Arc;

use crate::schema::Schema;

#[derive(Debug, thiserror::Error)]
pub enum FerryError {
    #[error("schema error: declared {declared}, found {actual}")]
    SchemaError { declared: Schema, actual: Schema },

    #[error("schema mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: Schema, got: Schema },

    #[error("cache entry not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("missing table '{0}'")]
    MissingTable(String),

    #[error("unsupported read method '{0}'")]
    UnsupportedReadMethod(String),

    #[error("cannot determine backend: {0}")]
    AmbiguousBackend(String),

    #[error("plan error: {0}")]
    Plan(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Shared(Arc<FerryError>),

    #[error(transparent)]
    DataFusion(#[from] datafusion::common::DataFusionError),

    #[error(transparent)]
    Arrow(#[from] datafusion::arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] datafusion::parquet::errors::ParquetError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FerryError {
    /// Wrap an error so it can be handed to more than one consumer.
    pub fn into_shared(self) -> Arc<FerryError> {
        match self {
            FerryError::Shared(inner) => inner,
            other => Arc::new(other),
        }
    }

    /// Returns the innermost error, looking through shared wrappers.
    pub fn root(&self) -> &FerryError {
        match self {
            FerryError::Shared(inner) => inner.root(),
            other => other,
        }
    }
}

pub type Result<T, E = FerryError> = std::result::Result<T, E>;

#[allow(unused_macros)]
macro_rules! internal {
    ($($arg:tt)*) => {
        crate::errors::FerryError::Internal(std::format!($($arg)*))
    };
}
pub(crate) use internal;
