//! Operator graphs spanning multiple execution contexts.
//!
//! Graphs may mark subexpressions for caching (`Plan::cache`) or for
//! evaluation in a different context (`Plan::into_backend`). Executing a graph
//! resolves caches, materializes remote references into the contexts that
//! consume them, and runs what is left in a single context.

pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod errors;
pub mod exchange;
pub mod execution;
pub mod expr;
pub mod logical;
pub mod materialize;
pub mod schema;
pub mod stream;
pub mod wire;

pub use backend::DataFusionBackend;
pub use cache::{CacheBacking, CacheKey, CacheStorage, KeyStrategy};
pub use config::{BackendConfig, CacheConfig, ExecutionConfig};
pub use context::{
    ContextId,
    ContextRef,
    ExecutionBackend,
    Exchanger,
    ExchangerRef,
    ReadArgs,
    SendableBatchStream,
};
pub use errors::{FerryError, Result};
pub use execution::{compile, execute, execute_stream};
pub use logical::{LogicalOperator, Plan};
pub use schema::{Field, Schema};
