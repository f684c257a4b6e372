//! Execution contexts and the capabilities the rewrite passes need from them.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::record_batch::RecordBatch;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::errors::Result;
use crate::expr::ScalarValue;
use crate::logical::Plan;
use crate::schema::Schema;

/// Stream of record batches that can be moved across tasks.
pub type SendableBatchStream = BoxStream<'static, Result<RecordBatch>>;

/// Arguments passed to a source read, ordered by key.
pub type ReadArgs = BTreeMap<String, ScalarValue>;

/// Identifier of a single execution context instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn new() -> Self {
        ContextId(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A backend able to run operator graphs.
///
/// Plans handed to `compile` and `execute` contain no Cache, Remote, Read or
/// Exchange nodes, and every table leaf belongs to this backend.
#[async_trait]
pub trait ExecutionBackend: Send + Sync + fmt::Debug {
    fn id(&self) -> ContextId;

    fn name(&self) -> &str;

    /// Token identifying the backend's data, stable across restarts. Feeds
    /// cache fingerprints.
    fn profile_token(&self) -> String;

    /// Render the backend-native query for a plan. Unbound placeholders are
    /// allowed.
    fn compile(&self, plan: &Plan) -> Result<String>;

    async fn execute(&self, plan: &Plan) -> Result<SendableBatchStream>;

    /// Consume the stream now and register the batches under `name`.
    async fn register_batches(
        &self,
        name: &str,
        schema: &Schema,
        stream: SendableBatchStream,
    ) -> Result<Plan>;

    /// Register a table that pulls from `stream` when first scanned. The
    /// table can only be scanned once.
    fn register_stream(&self, name: &str, schema: &Schema, stream: SendableBatchStream)
        -> Result<Plan>;

    fn table(&self, name: &str) -> Result<Plan>;

    fn list_tables(&self) -> Vec<String>;

    fn drop_table(&self, name: &str) -> Result<()>;

    /// Schema of the relation `read` would produce, without registering it.
    async fn read_schema(&self, method: &str, args: &ReadArgs) -> Result<Schema>;

    /// Register the relation produced by a source read under `name`.
    async fn read(&self, method: &str, name: &str, args: &ReadArgs) -> Result<Plan>;

    /// Token describing the current state of a source leaf (a table or a
    /// read). Changes whenever the underlying data does. `None` if the
    /// backend cannot tell.
    fn freshness(&self, leaf: &Plan) -> Result<Option<String>>;
}

/// Shared handle to an execution backend.
///
/// Equality and hashing go through the backend's instance id.
#[derive(Clone)]
pub struct ContextRef(Arc<dyn ExecutionBackend>);

impl ContextRef {
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        ContextRef(backend)
    }
}

impl<T: ExecutionBackend + 'static> From<Arc<T>> for ContextRef {
    fn from(value: Arc<T>) -> Self {
        ContextRef(value)
    }
}

impl Deref for ContextRef {
    type Target = dyn ExecutionBackend;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for ContextRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.id() == other.0.id()
    }
}

impl Eq for ContextRef {}

impl Hash for ContextRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id().hash(state)
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.0.name(), self.0.id())
    }
}

/// Something able to run an unbound computation over an input stream in
/// another process.
#[async_trait]
pub trait Exchanger: Send + Sync + fmt::Debug {
    /// Stable token identifying where exchanges are run.
    fn token(&self) -> String;

    /// Run `unbound` with its single placeholder bound to `input`.
    ///
    /// `input_schema` must equal the schema of the placeholder.
    async fn exchange(
        &self,
        unbound: &Plan,
        input_schema: &Schema,
        input: SendableBatchStream,
    ) -> Result<SendableBatchStream>;
}

/// Shared handle to an exchanger, compared by token.
#[derive(Clone)]
pub struct ExchangerRef(Arc<dyn Exchanger>);

impl ExchangerRef {
    pub fn new(exchanger: Arc<dyn Exchanger>) -> Self {
        ExchangerRef(exchanger)
    }
}

impl<T: Exchanger + 'static> From<Arc<T>> for ExchangerRef {
    fn from(value: Arc<T>) -> Self {
        ExchangerRef(value)
    }
}

impl Deref for ExchangerRef {
    type Target = dyn Exchanger;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for ExchangerRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.token() == other.0.token()
    }
}

impl Eq for ExchangerRef {}

impl Hash for ExchangerRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.token().hash(state)
    }
}

impl fmt::Debug for ExchangerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exchanger({})", self.0.token())
    }
}
