//! Running graphs.
//!
//! Execution proceeds in passes: resolve cache nodes, materialize remote
//! references, bind deferred leaves (reads and exchanges), then hand the
//! resulting single-context graph to its context.

use std::sync::Arc;

use datafusion::arrow::record_batch::RecordBatch;
use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{resolve_caches, unwrap_caches};
use crate::config::ExecutionConfig;
use crate::context::{ContextRef, SendableBatchStream};
use crate::errors::{FerryError, Result};
use crate::logical::{LogicalOperator, Plan};
use crate::materialize::materialize_remotes;

/// Pick the context a graph runs in.
///
/// A graph bound to exactly one context runs there. An unbound graph runs in
/// the fallback, if one is configured. Anything else is an error.
pub fn choose_context(plan: &Plan, config: &ExecutionConfig) -> Result<ContextRef> {
    let contexts = plan.contexts();
    match contexts.as_slice() {
        [one] => Ok(one.clone()),
        [] => config.fallback.clone().ok_or_else(|| {
            FerryError::AmbiguousBackend("plan is not bound to any context".to_string())
        }),
        many => Err(FerryError::AmbiguousBackend(format!(
            "plan spans multiple contexts: {}",
            many.iter()
                .map(|c| c.name().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Render the backend query for a plan without running anything.
///
/// Caches and remotes are unwrapped, reads and exchanges become placeholders.
pub fn compile(plan: &Plan, config: &ExecutionConfig) -> Result<String> {
    let unwrapped = unwrap_caches(plan)?;
    let context = match unwrapped.contexts().as_slice() {
        [one] => one.clone(),
        other => config.fallback.clone().ok_or_else(|| {
            FerryError::AmbiguousBackend(format!(
                "unwrapped plan spans {} contexts and no fallback is set",
                other.len()
            ))
        })?,
    };

    let placeholders = unwrapped.replace(|_, rebuilt| match rebuilt.op() {
        LogicalOperator::Read(n) => Ok(n.make_unbound()),
        LogicalOperator::Exchange(n) => Ok(Plan::unbound(n.name.clone(), n.schema.clone())),
        _ => Ok(rebuilt),
    })?;

    context.compile(&placeholders)
}

/// Execute a plan, returning its output as a stream.
pub fn execute_stream(
    plan: Plan,
    config: ExecutionConfig,
) -> BoxFuture<'static, Result<SendableBatchStream>> {
    let config = config.for_run();
    async move {
        let resolved = resolve_caches(&plan, &config).await?;
        let materialized = materialize_remotes(&resolved, &config).await?;

        let mut temps = materialized.tables;
        let result = run_bound(&materialized.plan, &config, &mut temps).await;

        // Physical plans keep their own handles to the tables they scan.
        drop_tables(&temps);
        result
    }
    .boxed()
}

/// Execute a plan and collect its output.
pub async fn execute(plan: &Plan, config: &ExecutionConfig) -> Result<Vec<RecordBatch>> {
    execute_stream(plan.clone(), config.clone())
        .await?
        .try_collect()
        .await
}

async fn run_bound(
    plan: &Plan,
    config: &ExecutionConfig,
    temps: &mut Vec<(String, ContextRef)>,
) -> Result<SendableBatchStream> {
    let registered = Arc::new(Mutex::new(Vec::new()));
    let bound = bind_leaves(plan, config, registered.clone()).await;
    temps.extend(registered.lock().drain(..));
    let bound = bound?;

    let context = choose_context(&bound, config)?;
    debug!(context = context.name(), "executing plan");
    context.execute(&bound).await
}

/// Replace reads and exchanges with tables registered in their contexts.
async fn bind_leaves(
    plan: &Plan,
    config: &ExecutionConfig,
    registered: Arc<Mutex<Vec<(String, ContextRef)>>>,
) -> Result<Plan> {
    plan.replace_async(|_, rebuilt| {
        let registered = registered.clone();
        let config = config.clone();
        async move {
            match rebuilt.op() {
                LogicalOperator::Read(n) => {
                    let name = format!("{}_{}", n.placeholder_name(), short_id());
                    let table = n.context.read(&n.method, &name, &n.args).await?;
                    registered.lock().push((name, n.context.clone()));
                    Ok(table)
                }
                LogicalOperator::Exchange(n) => {
                    let input = execute_stream(n.input.clone(), config).await?;
                    let output = n
                        .exchanger
                        .exchange(&n.unbound, n.input.schema(), input)
                        .await?;
                    let name = format!("{}_{}", n.name, short_id());
                    let table = n.context.register_stream(&name, &n.schema, output)?;
                    registered.lock().push((name, n.context.clone()));
                    Ok(table)
                }
                _ => Ok(rebuilt),
            }
        }
    })
    .await
}

fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Drop temporary tables, logging failures.
pub(crate) fn drop_tables(tables: &[(String, ContextRef)]) {
    for (name, context) in tables {
        if let Err(e) = context.drop_table(name) {
            warn!(%e, table = %name, context = context.name(), "failed to drop temporary table");
        }
    }
}

impl Plan {
    /// Execute with default configuration and collect the output.
    pub async fn execute(&self) -> Result<Vec<RecordBatch>> {
        execute(self, &ExecutionConfig::default()).await
    }

    pub async fn to_stream(&self) -> Result<SendableBatchStream> {
        execute_stream(self.clone(), ExecutionConfig::default()).await
    }

    pub fn compile(&self) -> Result<String> {
        compile(self, &ExecutionConfig::default())
    }
}
