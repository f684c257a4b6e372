//! Memoized bottom-up rewriting.

use std::collections::{HashMap, HashSet};
use std::future::Future;

use super::Plan;
use crate::errors::{internal, Result};

impl Plan {
    /// Distinct nodes reachable through child slots, children before parents.
    ///
    /// Uses an explicit stack so deep graphs don't overflow.
    pub fn toposort(&self) -> Vec<Plan> {
        let mut order = Vec::new();
        let mut visited: HashSet<Plan> = HashSet::new();
        let mut stack: Vec<(Plan, bool)> = vec![(self.clone(), false)];

        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                if visited.insert(node.clone()) {
                    order.push(node);
                }
                continue;
            }
            if visited.contains(&node) {
                continue;
            }

            let children = node.children();
            stack.push((node, true));
            for child in children.into_iter().rev() {
                if !visited.contains(&child) {
                    stack.push((child, false));
                }
            }
        }

        order
    }

    /// Nodes matching a predicate, children before parents.
    pub fn find(&self, pred: impl Fn(&Plan) -> bool) -> Vec<Plan> {
        self.toposort().into_iter().filter(|n| pred(n)).collect()
    }

    /// Rewrite the graph bottom-up.
    ///
    /// `f` is called once per distinct node with the original node and the
    /// node rebuilt over already rewritten children. Its result is used at
    /// every occurrence of the original. If no child changed, the rebuilt node
    /// is the original.
    pub fn replace<F>(&self, mut f: F) -> Result<Plan>
    where
        F: FnMut(&Plan, Plan) -> Result<Plan>,
    {
        let mut memo: HashMap<Plan, Plan> = HashMap::new();
        for node in self.toposort() {
            let rebuilt = rebuild(&node, &memo)?;
            let out = f(&node, rebuilt)?;
            memo.insert(node, out);
        }
        memo.remove(self)
            .ok_or_else(|| internal!("root missing from rewrite memo"))
    }

    /// Async variant of `replace`.
    pub async fn replace_async<F, Fut>(&self, mut f: F) -> Result<Plan>
    where
        F: FnMut(Plan, Plan) -> Fut,
        Fut: Future<Output = Result<Plan>>,
    {
        let mut memo: HashMap<Plan, Plan> = HashMap::new();
        for node in self.toposort() {
            let rebuilt = rebuild(&node, &memo)?;
            let out = f(node.clone(), rebuilt).await?;
            memo.insert(node, out);
        }
        memo.remove(self)
            .ok_or_else(|| internal!("root missing from rewrite memo"))
    }
}

fn rebuild(node: &Plan, memo: &HashMap<Plan, Plan>) -> Result<Plan> {
    let children = node.children();
    if children.is_empty() {
        return Ok(node.clone());
    }

    let new_children = children
        .iter()
        .map(|child| {
            memo.get(child)
                .cloned()
                .ok_or_else(|| internal!("child visited after parent: {}", child.short_name()))
        })
        .collect::<Result<Vec<_>>>()?;

    let unchanged = children
        .iter()
        .zip(new_children.iter())
        .all(|(a, b)| a.ptr_eq(b));
    if unchanged {
        return Ok(node.clone());
    }

    node.with_new_children(new_children)
}

#[cfg(test)]
mod tests {
    use datafusion::arrow::datatypes::DataType;

    use super::*;
    use crate::expr::{col, lit};
    use crate::logical::LogicalOperator;
    use crate::schema::{Field, Schema};

    fn leaf(name: &str) -> Plan {
        Plan::unbound(name, Schema::new([Field::new("a", DataType::Int64)]))
    }

    #[test]
    fn diamond_visits_each_node_once() {
        let base = leaf("base");
        let left = base.filter(col("a").gt(lit(1))).unwrap();
        let right = base.filter(col("a").lt(lit(10))).unwrap();
        let root = left.union(&right).unwrap();

        let order = root.toposort();
        assert_eq!(4, order.len());
        assert_eq!(base, order[0]);
        assert_eq!(root, order[3]);

        let mut visits = 0;
        let out = root
            .replace(|_, rebuilt| {
                visits += 1;
                Ok(rebuilt)
            })
            .unwrap();
        assert_eq!(4, visits);
        assert!(out.ptr_eq(&root));
    }

    #[test]
    fn replacement_is_shared_across_occurrences() {
        let base = leaf("base");
        let root = base.union(&base).unwrap();

        let replacement = leaf("other");
        let out = root
            .replace(|node, rebuilt| match node.op() {
                LogicalOperator::Unbound(_) => Ok(replacement.clone()),
                _ => Ok(rebuilt),
            })
            .unwrap();

        let children = out.children();
        assert_eq!(2, children.len());
        assert!(children[0].ptr_eq(&replacement));
        assert!(children[1].ptr_eq(&replacement));
    }

    #[test]
    fn subqueries_are_child_slots() {
        let inner = leaf("inner");
        let outer = leaf("outer")
            .filter(col("a").in_subquery(inner.clone()))
            .unwrap();

        assert_eq!(vec![leaf("outer"), inner], outer.children());

        let swapped = leaf("swapped");
        let out = outer
            .replace(|node, rebuilt| match node.op() {
                LogicalOperator::Unbound(n) if n.name == "inner" => Ok(swapped.clone()),
                _ => Ok(rebuilt),
            })
            .unwrap();
        assert_eq!(swapped, out.children()[1]);
    }

    #[test]
    fn failed_rewrite_returns_error() {
        let root = leaf("base").limit(5).unwrap();
        root.replace(|node, rebuilt| match node.op() {
            LogicalOperator::Limit(_) => Err(internal!("boom")),
            _ => Ok(rebuilt),
        })
        .unwrap_err();
    }

    #[test]
    fn deep_graph_does_not_overflow() {
        let mut plan = leaf("base");
        for _ in 0..2_000 {
            plan = plan.limit(100).unwrap();
        }
        assert_eq!(2_001, plan.toposort().len());
    }
}
