use std::sync::Arc;

use crate::context::ContextRef;
use crate::materialize::remote::PulledRemotes;

pub const DEFAULT_KEY_PREFIX: &str = "ferry_cache";
pub const DEFAULT_BATCH_SIZE: usize = 8192;

/// Configuration shared by cache storages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Prefix of every cache key. Keys render as `<prefix>-<digest>`.
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

/// Options for a single execution of a graph.
#[derive(Debug, Clone, Default)]
pub struct ExecutionConfig {
    /// Context used when the graph itself isn't bound to any.
    pub fallback: Option<ContextRef>,
    /// Remote pulls of the run in progress. Set by the outermost execution
    /// and shared with the executions it starts.
    pub(crate) pulls: Option<Arc<PulledRemotes>>,
}

impl ExecutionConfig {
    pub fn with_fallback(context: ContextRef) -> Self {
        ExecutionConfig {
            fallback: Some(context),
            pulls: None,
        }
    }

    /// This config with run state attached, keeping any already present.
    pub(crate) fn for_run(mut self) -> Self {
        if self.pulls.is_none() {
            self.pulls = Some(Arc::default());
        }
        self
    }
}

/// Settings for the DataFusion backed context.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub batch_size: usize,
    /// Merge small batches up to `batch_size` after filters and joins. A
    /// context serving exchanges should turn this off, otherwise filtered
    /// output is held back until enough rows arrive or the input ends.
    pub coalesce_batches: bool,
    /// Token identifying the data this context sees. Defaults to the context
    /// name.
    pub profile: Option<String>,
}

impl BackendConfig {
    /// Settings for a context running exchanges: output batches are emitted
    /// as soon as they are produced.
    pub fn streaming() -> Self {
        BackendConfig {
            coalesce_batches: false,
            ..BackendConfig::default()
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            coalesce_batches: true,
            profile: None,
        }
    }
}
