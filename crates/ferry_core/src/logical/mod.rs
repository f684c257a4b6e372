//! The operator graph.
//!
//! Graphs are immutable DAGs of reference counted nodes. Subplans can be
//! shared by any number of parents; passes over the graph visit each distinct
//! node once.

pub mod builder;
pub mod display;
pub mod operator;
pub mod rewrite;

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub use operator::*;

use crate::context::ContextRef;
use crate::errors::Result;
use crate::schema::Schema;

#[derive(Debug)]
struct PlanInner {
    op: LogicalOperator,
    schema: Schema,
    hash: u64,
}

/// Shared handle to a node in the operator graph.
///
/// The node's hash is computed once on construction, making memo lookups keyed
/// by node cheap regardless of graph depth.
#[derive(Clone)]
pub struct Plan(Arc<PlanInner>);

impl Plan {
    /// Create a node, deriving its output schema.
    pub fn new(op: LogicalOperator) -> Result<Plan> {
        let schema = op.output_schema()?;
        Ok(Self::with_schema(op, schema))
    }

    pub(crate) fn with_schema(op: LogicalOperator, schema: Schema) -> Plan {
        let mut hasher = DefaultHasher::new();
        op.hash(&mut hasher);
        let hash = hasher.finish();
        Plan(Arc::new(PlanInner { op, schema, hash }))
    }

    pub fn op(&self) -> &LogicalOperator {
        &self.0.op
    }

    pub fn schema(&self) -> &Schema {
        &self.0.schema
    }

    pub fn ptr_eq(&self, other: &Plan) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Child slots: relational inputs followed by subqueries nested in
    /// scalar expressions.
    pub fn children(&self) -> Vec<Plan> {
        let op = self.op();
        let mut children: Vec<Plan> = op.inputs().into_iter().cloned().collect();
        for expr in op.expressions() {
            children.extend(expr.subqueries().into_iter().cloned());
        }
        children
    }

    /// Return a copy of this node over new children.
    pub fn with_new_children(&self, children: Vec<Plan>) -> Result<Plan> {
        Plan::new(self.op().with_new_children(children)?)
    }

    /// Execution contexts this graph is bound to, in first-seen order.
    ///
    /// Only nodes reachable through child slots are considered. The contexts
    /// of remote expressions and exchange inputs are not.
    pub fn contexts(&self) -> Vec<ContextRef> {
        let mut contexts: Vec<ContextRef> = Vec::new();
        for node in self.toposort() {
            let ctx = match node.op() {
                LogicalOperator::Table(n) => Some(&n.context),
                LogicalOperator::Read(n) => Some(&n.context),
                LogicalOperator::Remote(n) => Some(&n.context),
                LogicalOperator::Exchange(n) => Some(&n.context),
                LogicalOperator::Cache(n) => Some(n.storage.context()),
                _ => None,
            };
            if let Some(ctx) = ctx {
                if !contexts.contains(ctx) {
                    contexts.push(ctx.clone());
                }
            }
        }
        contexts
    }

    /// Short label used when printing nested plans.
    pub fn short_name(&self) -> String {
        match self.op() {
            LogicalOperator::Table(n) => format!("Table {}", n.name),
            LogicalOperator::Unbound(n) => format!("Unbound {}", n.name),
            LogicalOperator::Remote(n) => format!("Remote {}", n.name),
            LogicalOperator::Read(n) => format!("Read {}", n.name),
            LogicalOperator::Exchange(n) => format!("Exchange {}", n.name),
            op => op.name().to_string(),
        }
    }
}

impl PartialEq for Plan {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        self.0.hash == other.0.hash && self.0.op == other.0.op
    }
}

impl Eq for Plan {}

impl Hash for Plan {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash)
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Plan").field(&self.0.op).finish()
    }
}
