//! Execution context backed by an in-process DataFusion session.

mod compile;
mod stream_table;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use dashmap::DashMap;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::datasource::{MemTable, TableProvider};
use datafusion::logical_expr::ScalarUDF;
use datafusion::prelude::{CsvReadOptions, DataFrame, ParquetReadOptions, SessionConfig, SessionContext};
use futures::{StreamExt, TryStreamExt};
use tracing::debug;

pub(crate) use compile::CompileMode;
pub use stream_table::OneShotPartition;

use crate::config::BackendConfig;
use crate::context::{ContextId, ContextRef, ExecutionBackend, ReadArgs, SendableBatchStream};
use crate::errors::{internal, FerryError, Result};
use crate::logical::{LogicalOperator, Plan};
use crate::schema::Schema;

#[derive(Debug, Clone)]
enum TableOrigin {
    Batches,
    Stream,
    File(PathBuf),
}

struct RegisteredTable {
    provider: Arc<dyn TableProvider>,
    schema: Schema,
    version: u64,
    origin: TableOrigin,
}

/// A DataFusion session plus a registry of named tables.
///
/// Tables are held by this backend rather than the session catalog, so
/// registering a name again replaces the table.
pub struct DataFusionBackend {
    id: ContextId,
    name: String,
    profile: String,
    session: SessionContext,
    tables: DashMap<String, RegisteredTable>,
    /// Number of times each table has been planned for execution.
    scans: DashMap<String, usize>,
    next_version: AtomicU64,
    this: Weak<DataFusionBackend>,
}

impl DataFusionBackend {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_config(name, BackendConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: BackendConfig) -> Arc<Self> {
        let name = name.into();
        let profile = config.profile.unwrap_or_else(|| name.clone());
        let session = SessionContext::new_with_config(
            SessionConfig::new()
                .with_batch_size(config.batch_size)
                .with_coalesce_batches(config.coalesce_batches),
        );

        Arc::new_cyclic(|this| DataFusionBackend {
            id: ContextId::new(),
            name,
            profile,
            session,
            tables: DashMap::new(),
            scans: DashMap::new(),
            next_version: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn context(self: &Arc<Self>) -> ContextRef {
        ContextRef::from(self.clone())
    }

    fn context_ref(&self) -> Result<ContextRef> {
        self.this
            .upgrade()
            .map(ContextRef::from)
            .ok_or_else(|| internal!("backend '{}' dropped", self.name))
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Make a scalar function callable by name from plans run here.
    pub fn register_udf(&self, udf: ScalarUDF) {
        self.session.register_udf(udf);
    }

    /// Register in-memory batches as a table.
    pub fn create_table(&self, name: &str, batches: Vec<RecordBatch>) -> Result<Plan> {
        let schema = batches
            .first()
            .map(|b| b.schema())
            .ok_or_else(|| FerryError::Plan(format!("no batches provided for table '{name}'")))?;
        let provider = Arc::new(MemTable::try_new(schema.clone(), vec![batches])?);
        self.insert(name, provider, Schema::from_arrow(&schema), TableOrigin::Batches)
    }

    /// Append batches to an existing table, bumping its version.
    pub async fn append_batches(&self, name: &str, batches: Vec<RecordBatch>) -> Result<()> {
        let (provider, schema) = {
            let table = self
                .tables
                .get(name)
                .ok_or_else(|| FerryError::MissingTable(name.to_string()))?;
            (table.provider.clone(), table.provider.schema())
        };

        let mut existing = self.session.read_table(provider)?.collect().await?;
        existing.extend(batches);
        let provider = Arc::new(MemTable::try_new(schema.clone(), vec![existing])?);
        self.insert(name, provider, Schema::from_arrow(&schema), TableOrigin::Batches)?;
        debug!(table = %name, "appended batches");
        Ok(())
    }

    /// Number of times `name` was scanned by an executed plan.
    pub fn scan_count(&self, name: &str) -> usize {
        self.scans.get(name).map(|c| *c).unwrap_or(0)
    }

    fn insert(
        &self,
        name: &str,
        provider: Arc<dyn TableProvider>,
        schema: Schema,
        origin: TableOrigin,
    ) -> Result<Plan> {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        self.tables.insert(
            name.to_string(),
            RegisteredTable {
                provider,
                schema: schema.clone(),
                version,
                origin,
            },
        );
        Ok(Plan::table(name, schema, self.context_ref()?))
    }

    fn provider(&self, name: &str) -> Result<Arc<dyn TableProvider>> {
        self.tables
            .get(name)
            .map(|t| t.provider.clone())
            .ok_or_else(|| FerryError::MissingTable(name.to_string()))
    }

    async fn read_frame(&self, method: &str, args: &ReadArgs) -> Result<(DataFrame, PathBuf)> {
        let path = read_path(args)?;
        let location = path.to_string_lossy().into_owned();
        let frame = match method {
            "read_parquet" => {
                self.session
                    .read_parquet(location, ParquetReadOptions::default())
                    .await?
            }
            "read_csv" => self.session.read_csv(location, CsvReadOptions::new()).await?,
            other => return Err(FerryError::UnsupportedReadMethod(other.to_string())),
        };
        Ok((frame, path))
    }
}

fn read_path(args: &ReadArgs) -> Result<PathBuf> {
    args.get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .ok_or_else(|| FerryError::Plan("read requires a 'path' argument".to_string()))
}

/// Length and modification time of a file or directory.
fn file_stamp(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path)?;
    let modified = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok(format!("{}:{}", meta.len(), modified))
}

#[async_trait]
impl ExecutionBackend for DataFusionBackend {
    fn id(&self) -> ContextId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn profile_token(&self) -> String {
        format!("datafusion:{}", self.profile)
    }

    fn compile(&self, plan: &Plan) -> Result<String> {
        let plan = self.logical_plan(plan, CompileMode::Display)?;
        let text = plan.display_indent().to_string();
        Ok(text)
    }

    async fn execute(&self, plan: &Plan) -> Result<SendableBatchStream> {
        let plan = self.logical_plan(plan, CompileMode::Execute)?;
        let frame = DataFrame::new(self.session.state(), plan);
        let stream = frame.execute_stream().await?;
        Ok(stream.map_err(FerryError::from).boxed())
    }

    async fn register_batches(
        &self,
        name: &str,
        schema: &Schema,
        stream: SendableBatchStream,
    ) -> Result<Plan> {
        let batches: Vec<RecordBatch> = stream.try_collect().await?;
        let arrow_schema = match batches.first() {
            Some(batch) => batch.schema(),
            None => schema.to_arrow(),
        };
        let provider = Arc::new(MemTable::try_new(arrow_schema.clone(), vec![batches])?);
        debug!(table = %name, context = %self.name, "registered batches");
        self.insert(name, provider, Schema::from_arrow(&arrow_schema), TableOrigin::Batches)
    }

    fn register_stream(
        &self,
        name: &str,
        schema: &Schema,
        stream: SendableBatchStream,
    ) -> Result<Plan> {
        let provider = stream_table::one_shot_table(schema.to_arrow(), stream)?;
        self.insert(name, provider, schema.clone(), TableOrigin::Stream)
    }

    fn table(&self, name: &str) -> Result<Plan> {
        let schema = self
            .tables
            .get(name)
            .map(|t| t.schema.clone())
            .ok_or_else(|| FerryError::MissingTable(name.to_string()))?;
        Ok(Plan::table(name, schema, self.context_ref()?))
    }

    fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        self.tables
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| FerryError::MissingTable(name.to_string()))
    }

    async fn read_schema(&self, method: &str, args: &ReadArgs) -> Result<Schema> {
        let (frame, _) = self.read_frame(method, args).await?;
        Ok(Schema::from_arrow(frame.schema().as_arrow()))
    }

    async fn read(&self, method: &str, name: &str, args: &ReadArgs) -> Result<Plan> {
        let (frame, path) = self.read_frame(method, args).await?;
        let schema = Schema::from_arrow(frame.schema().as_arrow());
        let provider = frame.into_view();
        debug!(table = %name, path = %path.display(), "registered read");
        self.insert(name, provider, schema, TableOrigin::File(path))
    }

    fn freshness(&self, leaf: &Plan) -> Result<Option<String>> {
        match leaf.op() {
            LogicalOperator::Table(n) => {
                let Some(table) = self.tables.get(&n.name) else {
                    return Ok(None);
                };
                match &table.origin {
                    TableOrigin::File(path) => Ok(Some(file_stamp(path)?)),
                    TableOrigin::Batches | TableOrigin::Stream => {
                        Ok(Some(format!("v{}", table.version)))
                    }
                }
            }
            LogicalOperator::Read(n) => Ok(Some(file_stamp(&read_path(&n.args)?)?)),
            _ => Ok(None),
        }
    }
}

impl std::fmt::Debug for DataFusionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFusionBackend")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("tables", &self.list_tables())
            .finish()
    }
}
