//! Removing cache and remote markers from a graph.

use crate::config::ExecutionConfig;
use crate::errors::{internal, Result};
use crate::logical::{LogicalExchange, LogicalOperator, Plan};

/// Compile time unwrap.
///
/// Every cache node is replaced by its parent and every remote node by its
/// remote expression, recursively. The result describes the same computation
/// with no storage or placement information.
pub fn unwrap_caches(plan: &Plan) -> Result<Plan> {
    plan.replace(|_, rebuilt| match rebuilt.op() {
        LogicalOperator::Cache(n) => Ok(n.parent.clone()),
        LogicalOperator::Remote(n) => unwrap_caches(&n.remote_expr),
        LogicalOperator::Exchange(n) => {
            let input = unwrap_caches(&n.input)?;
            if input.ptr_eq(&n.input) {
                return Ok(rebuilt.clone());
            }
            Plan::new(LogicalOperator::Exchange(LogicalExchange {
                input,
                ..n.clone()
            }))
        }
        _ => Ok(rebuilt),
    })
}

/// Execution time resolve.
///
/// Every cache node is replaced by the relation its storage returns from
/// `set_default`, innermost first. Each distinct cache node is resolved once.
pub async fn resolve_caches(plan: &Plan, config: &ExecutionConfig) -> Result<Plan> {
    plan.replace_async(|original, rebuilt| {
        let config = config.clone();
        async move {
            let cache = match rebuilt.op() {
                LogicalOperator::Cache(cache) => cache.clone(),
                _ => return Ok(rebuilt),
            };
            let original_parent = match original.op() {
                LogicalOperator::Cache(original) => original.parent.clone(),
                _ => return Err(internal!("rebuilt cache node from non-cache node")),
            };
            cache
                .storage
                .set_default_with(&original_parent, &cache.parent, &config)
                .await
        }
    })
    .await
}
