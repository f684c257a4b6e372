use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::parquet::arrow::ArrowWriter;
use futures::{StreamExt, TryStreamExt};
use tracing::debug;

use super::{CacheBacking, CacheKey};
use crate::context::{ContextRef, ReadArgs, SendableBatchStream};
use crate::errors::{FerryError, Result};
use crate::expr::ScalarValue;
use crate::logical::Plan;
use crate::schema::Schema;

/// Stores entries as tables in the storage context, named by key.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceBacking;

#[async_trait]
impl CacheBacking for SourceBacking {
    fn name(&self) -> &'static str {
        "source"
    }

    async fn exists(&self, context: &ContextRef, key: &CacheKey) -> Result<bool> {
        Ok(context.list_tables().iter().any(|t| t == key.as_str()))
    }

    async fn load(&self, context: &ContextRef, key: &CacheKey) -> Result<Plan> {
        context.table(key.as_str())
    }

    async fn persist(
        &self,
        context: &ContextRef,
        key: &CacheKey,
        schema: &Schema,
        stream: SendableBatchStream,
    ) -> Result<()> {
        context.register_batches(key.as_str(), schema, stream).await?;
        Ok(())
    }

    async fn remove(&self, context: &ContextRef, key: &CacheKey) -> Result<bool> {
        if !self.exists(context, key).await? {
            return Ok(false);
        }
        context.drop_table(key.as_str())?;
        Ok(true)
    }
}

/// Stores each entry as `<key>.parquet` in a directory, read back through the
/// storage context's parquet reader.
#[derive(Debug, Clone)]
pub struct ParquetBacking {
    dir: PathBuf,
}

impl ParquetBacking {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ParquetBacking { dir: dir.into() }
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.parquet"))
    }
}

fn storage_err(e: impl std::fmt::Display) -> FerryError {
    FerryError::StorageError(e.to_string())
}

fn write_parquet(path: &Path, schema: &Schema, batches: Vec<RecordBatch>) -> Result<()> {
    let arrow_schema = match batches.first() {
        Some(batch) => batch.schema(),
        None => schema.to_arrow(),
    };

    // Write next to the destination and rename so readers never observe a
    // partial file.
    let tmp = path.with_extension("parquet.tmp");
    let file = File::create(&tmp).map_err(storage_err)?;
    let mut writer = ArrowWriter::try_new(file, arrow_schema, None).map_err(storage_err)?;
    for batch in &batches {
        writer.write(batch).map_err(storage_err)?;
    }
    writer.close().map_err(storage_err)?;
    std::fs::rename(&tmp, path).map_err(storage_err)?;
    Ok(())
}

#[async_trait]
impl CacheBacking for ParquetBacking {
    fn name(&self) -> &'static str {
        "parquet"
    }

    async fn exists(&self, _context: &ContextRef, key: &CacheKey) -> Result<bool> {
        tokio::fs::try_exists(self.path_for(key))
            .await
            .map_err(storage_err)
    }

    async fn load(&self, context: &ContextRef, key: &CacheKey) -> Result<Plan> {
        let path = self.path_for(key);
        let mut args = ReadArgs::new();
        args.insert(
            "path".to_string(),
            ScalarValue::Utf8(path.to_string_lossy().into_owned()),
        );
        context.read("read_parquet", key.as_str(), &args).await
    }

    async fn persist(
        &self,
        _context: &ContextRef,
        key: &CacheKey,
        schema: &Schema,
        stream: SendableBatchStream,
    ) -> Result<()> {
        let batches: Vec<RecordBatch> = stream.try_collect().await?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(storage_err)?;

        let path = self.path_for(key);
        let schema = schema.clone();
        debug!(path = %path.display(), batches = batches.len(), "writing parquet cache entry");
        tokio::task::spawn_blocking(move || write_parquet(&path, &schema, batches))
            .await
            .map_err(storage_err)?
    }

    async fn remove(&self, context: &ContextRef, key: &CacheKey) -> Result<bool> {
        if context.list_tables().iter().any(|t| t == key.as_str()) {
            context.drop_table(key.as_str())?;
        }
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_err(e)),
        }
    }
}

/// Process local key/value store holding entries as batches.
#[derive(Debug, Default)]
pub struct MemoryBacking {
    entries: DashMap<CacheKey, (Schema, Vec<RecordBatch>)>,
}

impl MemoryBacking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBacking for MemoryBacking {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn exists(&self, _context: &ContextRef, key: &CacheKey) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    async fn load(&self, context: &ContextRef, key: &CacheKey) -> Result<Plan> {
        let (schema, batches) = match self.entries.get(key) {
            Some(entry) => entry.value().clone(),
            None => return Err(FerryError::NotFound(key.to_string())),
        };
        let stream = futures::stream::iter(batches.into_iter().map(Ok)).boxed();
        context.register_batches(key.as_str(), &schema, stream).await
    }

    async fn persist(
        &self,
        _context: &ContextRef,
        key: &CacheKey,
        schema: &Schema,
        stream: SendableBatchStream,
    ) -> Result<()> {
        let batches: Vec<RecordBatch> = stream.try_collect().await?;
        let schema = match batches.first() {
            Some(batch) => Schema::from_arrow(&batch.schema()),
            None => schema.clone(),
        };
        self.entries.insert(key.clone(), (schema, batches));
        Ok(())
    }

    async fn remove(&self, context: &ContextRef, key: &CacheKey) -> Result<bool> {
        if context.list_tables().iter().any(|t| t == key.as_str()) {
            context.drop_table(key.as_str())?;
        }
        Ok(self.entries.remove(key).is_some())
    }
}
