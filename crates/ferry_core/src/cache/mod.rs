//! Cache storage.
//!
//! A storage persists the result of an uncached subexpression under a key
//! derived from that subexpression, and hands back a relation reading the
//! persisted artifact.

pub mod backing;
pub mod key;
pub mod resolve;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

pub use backing::{MemoryBacking, ParquetBacking, SourceBacking};
pub use key::{CacheKey, KeyStrategy};
pub use resolve::{resolve_caches, unwrap_caches};

use crate::config::{CacheConfig, ExecutionConfig};
use crate::context::{ContextRef, SendableBatchStream};
use crate::errors::{FerryError, Result};
use crate::execution::execute_stream;
use crate::logical::Plan;
use crate::schema::Schema;

/// Where cache artifacts physically live.
#[async_trait]
pub trait CacheBacking: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    async fn exists(&self, context: &ContextRef, key: &CacheKey) -> Result<bool>;

    /// Relation reading a persisted artifact.
    async fn load(&self, context: &ContextRef, key: &CacheKey) -> Result<Plan>;

    async fn persist(
        &self,
        context: &ContextRef,
        key: &CacheKey,
        schema: &Schema,
        stream: SendableBatchStream,
    ) -> Result<()>;

    /// Remove an artifact. Returns false if there was nothing to remove.
    async fn remove(&self, context: &ContextRef, key: &CacheKey) -> Result<bool>;
}

struct StorageInner {
    id: Uuid,
    strategy: KeyStrategy,
    backing: Arc<dyn CacheBacking>,
    context: ContextRef,
    config: CacheConfig,
    /// Held while checking for and computing an entry, so concurrent callers
    /// for the same key compute it once.
    locks: DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
}

/// Cache storage bound to the context its artifacts are read from.
#[derive(Clone)]
pub struct CacheStorage {
    inner: Arc<StorageInner>,
}

impl CacheStorage {
    pub fn new(context: ContextRef, backing: Arc<dyn CacheBacking>, strategy: KeyStrategy) -> Self {
        Self::with_config(context, backing, strategy, CacheConfig::default())
    }

    pub fn with_config(
        context: ContextRef,
        backing: Arc<dyn CacheBacking>,
        strategy: KeyStrategy,
        config: CacheConfig,
    ) -> Self {
        CacheStorage {
            inner: Arc::new(StorageInner {
                id: Uuid::new_v4(),
                strategy,
                backing,
                context,
                config,
                locks: DashMap::new(),
            }),
        }
    }

    /// Tables in the storage context, invalidated when sources change.
    pub fn source(context: &ContextRef) -> Self {
        Self::new(context.clone(), Arc::new(SourceBacking), KeyStrategy::Modification)
    }

    /// Tables in the storage context, never invalidated.
    pub fn snapshot(context: &ContextRef) -> Self {
        Self::new(context.clone(), Arc::new(SourceBacking), KeyStrategy::Snapshot)
    }

    /// Parquet files in `dir`, invalidated when sources change.
    pub fn parquet(context: &ContextRef, dir: impl Into<PathBuf>) -> Self {
        Self::new(
            context.clone(),
            Arc::new(ParquetBacking::new(dir)),
            KeyStrategy::Modification,
        )
    }

    pub fn context(&self) -> &ContextRef {
        &self.inner.context
    }

    pub fn strategy(&self) -> KeyStrategy {
        self.inner.strategy
    }

    pub fn key_of(&self, uncached: &Plan) -> Result<CacheKey> {
        let unwrapped = unwrap_caches(uncached)?;
        key::cache_key(&unwrapped, self.inner.strategy, &self.inner.config.key_prefix)
    }

    pub async fn exists(&self, uncached: &Plan) -> Result<bool> {
        let key = self.key_of(uncached)?;
        self.inner.backing.exists(&self.inner.context, &key).await
    }

    pub async fn get(&self, uncached: &Plan) -> Result<Plan> {
        let key = self.key_of(uncached)?;
        if !self.inner.backing.exists(&self.inner.context, &key).await? {
            return Err(FerryError::NotFound(key.to_string()));
        }
        self.load(&key, uncached.schema()).await
    }

    /// Compute `uncached` now and persist it, replacing any existing entry.
    pub async fn set(&self, uncached: &Plan, config: &ExecutionConfig) -> Result<Plan> {
        let key = self.key_of(uncached)?;
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;
        self.compute(&key, uncached, config).await
    }

    /// Return the stored entry for `uncached`, computing it if missing.
    pub async fn set_default(&self, uncached: &Plan, config: &ExecutionConfig) -> Result<Plan> {
        self.set_default_with(uncached, uncached, config).await
    }

    /// Like `set_default`, keyed by `original` but computing `rebuilt`.
    ///
    /// `rebuilt` must be `original` with some of its subexpressions replaced
    /// by equivalent relations (resolved inner caches).
    pub(crate) async fn set_default_with(
        &self,
        original: &Plan,
        rebuilt: &Plan,
        config: &ExecutionConfig,
    ) -> Result<Plan> {
        let key = self.key_of(original)?;
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        if self.inner.backing.exists(&self.inner.context, &key).await? {
            debug!(%key, backing = self.inner.backing.name(), "cache hit");
            return self.load(&key, original.schema()).await;
        }

        debug!(%key, backing = self.inner.backing.name(), "cache miss");
        self.compute(&key, rebuilt, config).await
    }

    /// Drop the entry for `uncached`, if any.
    pub async fn remove(&self, uncached: &Plan) -> Result<bool> {
        let key = self.key_of(uncached)?;
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;
        self.inner.backing.remove(&self.inner.context, &key).await
    }

    fn lock_for(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn compute(&self, key: &CacheKey, value: &Plan, config: &ExecutionConfig) -> Result<Plan> {
        let stream = execute_stream(value.clone(), config.clone()).await?;
        self.inner
            .backing
            .persist(&self.inner.context, key, value.schema(), stream)
            .await?;
        info!(%key, backing = self.inner.backing.name(), "persisted cache entry");
        self.load(key, value.schema()).await
    }

    async fn load(&self, key: &CacheKey, declared: &Schema) -> Result<Plan> {
        let loaded = self.inner.backing.load(&self.inner.context, key).await?;
        declared.check_declared(loaded.schema())?;
        Ok(loaded)
    }
}

impl PartialEq for CacheStorage {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for CacheStorage {}

impl Hash for CacheStorage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state)
    }
}

impl fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStorage")
            .field("id", &self.inner.id)
            .field("strategy", &self.inner.strategy)
            .field("backing", &self.inner.backing)
            .field("context", &self.inner.context)
            .finish()
    }
}

impl fmt::Display for CacheStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.inner.backing.name(), self.inner.strategy)
    }
}
