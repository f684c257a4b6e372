//! Fingerprints of uncached subexpressions.

use std::collections::HashMap;
use std::fmt;

use crate::errors::Result;
use crate::logical::{LogicalOperator, Plan};

/// How source state feeds into cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyStrategy {
    /// Keys include a freshness token for every source leaf. Changing a source
    /// changes the key, so stale entries are never hit.
    Modification,
    /// Keys depend on the expression only. Entries stay valid until removed.
    Snapshot,
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Modification => write!(f, "modification"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key for an expression with no cache or remote nodes left in it.
pub fn cache_key(unwrapped: &Plan, strategy: KeyStrategy, prefix: &str) -> Result<CacheKey> {
    let mut tokenizer = Tokenizer::new(strategy);
    let token = tokenizer.token(unwrapped)?;
    Ok(CacheKey(format!("{prefix}-{token}")))
}

/// Computes a digest per node from the node's own fields and the digests of
/// its children. Shared subplans are hashed once.
struct Tokenizer {
    strategy: KeyStrategy,
    memo: HashMap<Plan, String>,
}

impl Tokenizer {
    fn new(strategy: KeyStrategy) -> Self {
        Tokenizer {
            strategy,
            memo: HashMap::new(),
        }
    }

    fn token(&mut self, plan: &Plan) -> Result<String> {
        for node in plan.toposort() {
            if self.memo.contains_key(&node) {
                continue;
            }
            let token = self.node_token(&node)?;
            self.memo.insert(node, token);
        }
        Ok(self.memo.get(plan).cloned().unwrap_or_default())
    }

    fn child_tokens(&self, node: &Plan) -> String {
        node.children()
            .iter()
            .map(|child| self.memo.get(child).map(String::as_str).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn node_token(&mut self, node: &Plan) -> Result<String> {
        let local = match node.op() {
            // Markers with no meaning of their own.
            LogicalOperator::Cache(n) => return self.token(&n.parent),
            LogicalOperator::Remote(n) => return self.token(&n.remote_expr),

            LogicalOperator::Table(n) => {
                let mut s = format!("table:{}:{}", n.context.profile_token(), n.name);
                self.push_freshness(&mut s, node)?;
                s
            }
            LogicalOperator::Read(n) => {
                let mut s = format!(
                    "read:{}:{}:{}:{:?}",
                    n.context.profile_token(),
                    n.method,
                    n.name,
                    n.args
                );
                self.push_freshness(&mut s, node)?;
                s
            }
            LogicalOperator::Unbound(n) => format!("unbound:{}", n.name),
            LogicalOperator::Exchange(n) => {
                let unbound = self.token(&n.unbound)?;
                let input = self.token(&n.input)?;
                format!("exchange:{}:{unbound}:{input}", n.exchanger.token())
            }
            LogicalOperator::Project(n) => {
                let exprs: Vec<_> = n.exprs.iter().map(|(name, e)| format!("{name}={e}")).collect();
                format!("project:{}", exprs.join(";"))
            }
            LogicalOperator::Filter(n) => format!("filter:{}", n.predicate),
            LogicalOperator::Aggregate(n) => {
                let aggs: Vec<_> = n
                    .aggregates
                    .iter()
                    .map(|(name, a)| format!("{name}={a}"))
                    .collect();
                format!("aggregate:{}:{}", n.group_by.join(";"), aggs.join(";"))
            }
            LogicalOperator::Sort(n) => format!("sort:{:?}", n.keys),
            LogicalOperator::Limit(n) => format!("limit:{}:{:?}", n.skip, n.fetch),
            LogicalOperator::Union(_) => "union".to_string(),
        };

        let full = format!(
            "{local}|{}|{}|{}",
            node.schema(),
            self.child_tokens(node),
            self.strategy
        );
        Ok(format!("{:x}", md5::compute(full.as_bytes())))
    }

    fn push_freshness(&self, s: &mut String, leaf: &Plan) -> Result<()> {
        if self.strategy != KeyStrategy::Modification {
            return Ok(());
        }
        let ctx = match leaf.op() {
            LogicalOperator::Table(n) => &n.context,
            LogicalOperator::Read(n) => &n.context,
            _ => return Ok(()),
        };
        if let Some(freshness) = ctx.freshness(leaf)? {
            s.push(':');
            s.push_str(&freshness);
        }
        Ok(())
    }
}
