//! Replacing remote references with tables registered in their destination
//! contexts.

use std::collections::HashMap;

use datafusion::arrow::record_batch::RecordBatch;
use futures::{stream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::tee::tee_batches;
use crate::config::ExecutionConfig;
use crate::context::{ContextRef, SendableBatchStream};
use crate::errors::{internal, Result};
use crate::execution::{choose_context, drop_tables, execute_stream};
use crate::logical::{LogicalOperator, LogicalRemote, Plan};

/// Results of remote expressions pulled during one run.
///
/// Two cache nodes over the same remote reference are computed by separate
/// executions. The second one reads the batches kept here instead of pulling
/// upstream again.
#[derive(Debug, Default)]
pub(crate) struct PulledRemotes {
    pulled: Mutex<HashMap<Plan, Vec<RecordBatch>>>,
}

impl PulledRemotes {
    fn get(&self, expr: &Plan) -> Option<Vec<RecordBatch>> {
        self.pulled.lock().get(expr).cloned()
    }

    fn insert(&self, expr: Plan, batches: Vec<RecordBatch>) {
        self.pulled.lock().insert(expr, batches);
    }
}

/// A graph with every remote reference replaced by a concrete table.
#[derive(Debug)]
pub struct Materialized {
    pub plan: Plan,
    /// Tables registered while materializing, with the context holding each.
    pub tables: Vec<(String, ContextRef)>,
}

/// Where a remote reference occurs: a child slot of a distinct parent, or the
/// root itself.
#[derive(Debug, Clone)]
struct Site {
    parent: Option<Plan>,
    slot: usize,
    remote: Plan,
}

fn find_sites(plan: &Plan) -> Vec<Site> {
    let mut sites = Vec::new();
    if matches!(plan.op(), LogicalOperator::Remote(_)) {
        sites.push(Site {
            parent: None,
            slot: 0,
            remote: plan.clone(),
        });
    }
    for node in plan.toposort() {
        for (slot, child) in node.children().into_iter().enumerate() {
            if matches!(child.op(), LogicalOperator::Remote(_)) {
                sites.push(Site {
                    parent: Some(node.clone()),
                    slot,
                    remote: child,
                });
            }
        }
    }
    sites
}

fn remote_of(plan: &Plan) -> Result<&LogicalRemote> {
    match plan.op() {
        LogicalOperator::Remote(remote) => Ok(remote),
        other => Err(internal!("expected remote node, got {}", other.name())),
    }
}

/// Pull each distinct remote expression once and register one copy per
/// occurrence in that occurrence's destination context.
///
/// Simple remote expressions run natively in their context. Anything holding
/// caches, remotes or deferred leaves goes through the full execution
/// pipeline, so remote references nested inside are materialized first. If
/// anything fails, tables registered so far are dropped before returning the
/// error.
pub async fn materialize_remotes(plan: &Plan, config: &ExecutionConfig) -> Result<Materialized> {
    let sites = find_sites(plan);
    if sites.is_empty() {
        return Ok(Materialized {
            plan: plan.clone(),
            tables: Vec::new(),
        });
    }

    // Group sites by the expression they pull, in first seen order.
    let mut groups: Vec<(Plan, Vec<usize>)> = Vec::new();
    let mut group_idx: HashMap<Plan, usize> = HashMap::new();
    for (idx, site) in sites.iter().enumerate() {
        let expr = remote_of(&site.remote)?.remote_expr.clone();
        match group_idx.get(&expr) {
            Some(&g) => groups[g].1.push(idx),
            None => {
                group_idx.insert(expr.clone(), groups.len());
                groups.push((expr, vec![idx]));
            }
        }
    }

    let mut tables: Vec<(String, ContextRef)> = Vec::new();
    match register_sites(&sites, &groups, config, &mut tables).await {
        Ok(site_tables) => match splice(plan, &sites, site_tables) {
            Ok(plan) => Ok(Materialized { plan, tables }),
            Err(e) => {
                drop_tables(&tables);
                Err(e)
            }
        },
        Err(e) => {
            drop_tables(&tables);
            Err(e)
        }
    }
}

async fn register_sites(
    sites: &[Site],
    groups: &[(Plan, Vec<usize>)],
    config: &ExecutionConfig,
    tables: &mut Vec<(String, ContextRef)>,
) -> Result<Vec<Option<Plan>>> {
    let mut site_tables: Vec<Option<Plan>> = vec![None; sites.len()];
    let mut counters: HashMap<String, usize> = HashMap::new();

    for (expr, site_idxs) in groups {
        let remembered = config.pulls.as_ref().and_then(|pulls| pulls.get(expr));
        let reused = remembered.is_some();
        let stream: SendableBatchStream = match remembered {
            Some(batches) => {
                debug!(sites = site_idxs.len(), "reusing remote expression pulled earlier in this run");
                stream::iter(batches.into_iter().map(Ok)).boxed()
            }
            None => pull(expr, config).await?,
        };

        // One extra view keeps the pulled batches for later executions in
        // this run.
        let keep = config.pulls.is_some() && !reused;
        let mut views = tee_batches(stream, site_idxs.len() + usize::from(keep));
        let kept = if keep { views.pop() } else { None };
        if !reused {
            info!(sites = site_idxs.len(), "pulled remote expression");
        }

        for (&idx, view) in site_idxs.iter().zip(views) {
            let remote = remote_of(&sites[idx].remote)?;
            let n = counters.entry(remote.name.clone()).or_insert(0);
            let name = format!("{}_{}", remote.name, n);
            *n += 1;

            let table = remote
                .context
                .register_batches(&name, &remote.schema, view)
                .await?;
            debug!(table = %name, context = remote.context.name(), "registered remote copy");
            tables.push((name, remote.context.clone()));
            site_tables[idx] = Some(table);
        }

        if let (Some(kept), Some(pulls)) = (kept, config.pulls.as_ref()) {
            let batches: Vec<RecordBatch> = kept.try_collect().await?;
            pulls.insert(expr.clone(), batches);
        }
    }

    Ok(site_tables)
}

/// Whether `expr` can be handed straight to its context.
fn is_simple(expr: &Plan) -> bool {
    expr.find(|node| {
        matches!(
            node.op(),
            LogicalOperator::Cache(_)
                | LogicalOperator::Remote(_)
                | LogicalOperator::Read(_)
                | LogicalOperator::Exchange(_)
        )
    })
    .is_empty()
}

async fn pull(expr: &Plan, config: &ExecutionConfig) -> Result<SendableBatchStream> {
    if is_simple(expr) {
        let context = choose_context(expr, config)?;
        debug!(context = context.name(), "pulling remote expression natively");
        context.execute(expr).await
    } else {
        execute_stream(expr.clone(), config.clone()).await
    }
}

fn splice(plan: &Plan, sites: &[Site], site_tables: Vec<Option<Plan>>) -> Result<Plan> {
    let mut by_parent: HashMap<Plan, Vec<(usize, Plan)>> = HashMap::new();
    let mut root_table = None;
    for (site, table) in sites.iter().zip(site_tables) {
        let table = table.ok_or_else(|| internal!("remote site left unregistered"))?;
        match &site.parent {
            Some(parent) => by_parent
                .entry(parent.clone())
                .or_default()
                .push((site.slot, table)),
            None => root_table = Some(table),
        }
    }

    let out = plan.replace(|original, rebuilt| {
        let Some(slots) = by_parent.get(original) else {
            return Ok(rebuilt);
        };
        let mut children = rebuilt.children();
        for (slot, table) in slots {
            let child = children
                .get_mut(*slot)
                .ok_or_else(|| internal!("remote slot {slot} out of range"))?;
            *child = table.clone();
        }
        rebuilt.with_new_children(children)
    })?;

    Ok(root_table.unwrap_or(out))
}

#[cfg(test)]
mod tests {
    use datafusion::arrow::datatypes::DataType;

    use super::*;
    use crate::backend::DataFusionBackend;
    use crate::expr::{col, lit};
    use crate::schema::{Field, Schema};

    #[test]
    fn only_plain_relations_are_simple() {
        let a = DataFusionBackend::new("a");
        let b = DataFusionBackend::new("b");
        let schema = Schema::new([Field::new("k", DataType::Int64)]);

        let t = Plan::table("t", schema, a.context());
        let filtered = t.filter(col("k").gt(lit(1))).unwrap();
        assert!(is_simple(&filtered));

        let moved = filtered.into_backend(&b.context(), None).unwrap();
        assert!(!is_simple(&moved.limit(1).unwrap()));
    }
}
