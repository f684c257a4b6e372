//! Encoding unbound plans for shipping to another process.
//!
//! Only context-free plans can be encoded: placeholders and the relational
//! operators over them. Functions travel by registered name.
//!
//! A plan is encoded as a table of distinct nodes, children before parents.
//! Inputs and subqueries refer to earlier entries by index, so a subplan
//! shared by several parents is written once.

use std::collections::HashMap;

use datafusion::arrow::datatypes::DataType;
use serde::{Deserialize, Serialize};

use crate::errors::{FerryError, Result};
use crate::expr::{AggregateExpr, AggregateFunction, BinaryOperator, ScalarExpr, ScalarValue, SortKey};
use crate::logical::*;
use crate::schema::Schema;

/// Index of a node in [`WirePlan::nodes`].
pub type NodeIndex = usize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePlan {
    pub nodes: Vec<PlanNode>,
    pub root: NodeIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanNode {
    Unbound {
        name: String,
        schema: Schema,
    },
    Project {
        input: NodeIndex,
        exprs: Vec<(String, ExprNode)>,
    },
    Filter {
        input: NodeIndex,
        predicate: ExprNode,
    },
    Aggregate {
        input: NodeIndex,
        group_by: Vec<String>,
        aggregates: Vec<(String, AggregateNode)>,
    },
    Sort {
        input: NodeIndex,
        keys: Vec<SortKey>,
    },
    Limit {
        input: NodeIndex,
        skip: usize,
        fetch: Option<usize>,
    },
    Union {
        inputs: Vec<NodeIndex>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExprNode {
    Column {
        name: String,
    },
    Literal {
        value: ScalarValue,
    },
    Binary {
        left: Box<ExprNode>,
        op: BinaryOperator,
        right: Box<ExprNode>,
    },
    Not {
        expr: Box<ExprNode>,
    },
    IsNull {
        expr: Box<ExprNode>,
    },
    Function {
        name: String,
        args: Vec<ExprNode>,
        return_type: DataType,
    },
    InSubquery {
        expr: Box<ExprNode>,
        subquery: NodeIndex,
        negated: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateNode {
    pub func: AggregateFunction,
    pub arg: Option<ExprNode>,
}

/// Builds the node table for a plan.
#[derive(Debug, Default)]
struct PlanEncoder {
    nodes: Vec<PlanNode>,
    indices: HashMap<Plan, NodeIndex>,
}

impl PlanEncoder {
    fn encode(mut self, plan: &Plan) -> Result<WirePlan> {
        for node in plan.toposort() {
            let encoded = self.node(&node)?;
            self.indices.insert(node, self.nodes.len());
            self.nodes.push(encoded);
        }
        let root = self.index(plan)?;
        Ok(WirePlan {
            nodes: self.nodes,
            root,
        })
    }

    fn index(&self, plan: &Plan) -> Result<NodeIndex> {
        self.indices
            .get(plan)
            .copied()
            .ok_or_else(|| FerryError::Internal(format!("node not yet encoded: {}", plan.short_name())))
    }

    fn node(&self, plan: &Plan) -> Result<PlanNode> {
        Ok(match plan.op() {
            LogicalOperator::Unbound(n) => PlanNode::Unbound {
                name: n.name.clone(),
                schema: n.schema.clone(),
            },
            LogicalOperator::Project(n) => PlanNode::Project {
                input: self.index(&n.input)?,
                exprs: n
                    .exprs
                    .iter()
                    .map(|(name, e)| Ok((name.clone(), self.expr(e)?)))
                    .collect::<Result<_>>()?,
            },
            LogicalOperator::Filter(n) => PlanNode::Filter {
                input: self.index(&n.input)?,
                predicate: self.expr(&n.predicate)?,
            },
            LogicalOperator::Aggregate(n) => PlanNode::Aggregate {
                input: self.index(&n.input)?,
                group_by: n.group_by.clone(),
                aggregates: n
                    .aggregates
                    .iter()
                    .map(|(name, a)| Ok((name.clone(), self.aggregate(a)?)))
                    .collect::<Result<_>>()?,
            },
            LogicalOperator::Sort(n) => PlanNode::Sort {
                input: self.index(&n.input)?,
                keys: n.keys.clone(),
            },
            LogicalOperator::Limit(n) => PlanNode::Limit {
                input: self.index(&n.input)?,
                skip: n.skip,
                fetch: n.fetch,
            },
            LogicalOperator::Union(n) => PlanNode::Union {
                inputs: n.inputs.iter().map(|p| self.index(p)).collect::<Result<_>>()?,
            },
            op @ (LogicalOperator::Table(_)
            | LogicalOperator::Cache(_)
            | LogicalOperator::Remote(_)
            | LogicalOperator::Read(_)
            | LogicalOperator::Exchange(_)) => {
                return Err(FerryError::Plan(format!(
                    "cannot encode context bound node: {}",
                    op.name()
                )))
            }
        })
    }

    fn expr(&self, expr: &ScalarExpr) -> Result<ExprNode> {
        Ok(match expr {
            ScalarExpr::Column(name) => ExprNode::Column { name: name.clone() },
            ScalarExpr::Literal(value) => ExprNode::Literal {
                value: value.clone(),
            },
            ScalarExpr::Binary { left, op, right } => ExprNode::Binary {
                left: Box::new(self.expr(left)?),
                op: *op,
                right: Box::new(self.expr(right)?),
            },
            ScalarExpr::Not(e) => ExprNode::Not {
                expr: Box::new(self.expr(e)?),
            },
            ScalarExpr::IsNull(e) => ExprNode::IsNull {
                expr: Box::new(self.expr(e)?),
            },
            ScalarExpr::Function {
                name,
                args,
                return_type,
            } => ExprNode::Function {
                name: name.clone(),
                args: args.iter().map(|a| self.expr(a)).collect::<Result<_>>()?,
                return_type: return_type.clone(),
            },
            ScalarExpr::InSubquery {
                expr,
                subquery,
                negated,
            } => ExprNode::InSubquery {
                expr: Box::new(self.expr(expr)?),
                subquery: self.index(subquery)?,
                negated: *negated,
            },
        })
    }

    fn aggregate(&self, agg: &AggregateExpr) -> Result<AggregateNode> {
        Ok(AggregateNode {
            func: agg.func,
            arg: agg.arg.as_ref().map(|a| self.expr(a)).transpose()?,
        })
    }
}

/// Rebuilds plans from a node table. Entries may only refer to earlier
/// entries.
#[derive(Debug, Default)]
struct PlanDecoder {
    plans: Vec<Plan>,
}

impl PlanDecoder {
    fn decode(mut self, wire: WirePlan) -> Result<Plan> {
        for node in wire.nodes {
            let plan = self.node(node)?;
            self.plans.push(plan);
        }
        self.plan(wire.root)
    }

    fn plan(&self, index: NodeIndex) -> Result<Plan> {
        self.plans.get(index).cloned().ok_or_else(|| {
            FerryError::Plan(format!(
                "node {index} referenced before it was defined ({} nodes decoded)",
                self.plans.len()
            ))
        })
    }

    fn node(&self, node: PlanNode) -> Result<Plan> {
        let op = match node {
            PlanNode::Unbound { name, schema } => return Ok(Plan::unbound(name, schema)),
            PlanNode::Project { input, exprs } => LogicalOperator::Project(LogicalProject {
                input: self.plan(input)?,
                exprs: exprs
                    .into_iter()
                    .map(|(name, e)| Ok((name, self.expr(e)?)))
                    .collect::<Result<_>>()?,
            }),
            PlanNode::Filter { input, predicate } => LogicalOperator::Filter(LogicalFilter {
                input: self.plan(input)?,
                predicate: self.expr(predicate)?,
            }),
            PlanNode::Aggregate {
                input,
                group_by,
                aggregates,
            } => LogicalOperator::Aggregate(LogicalAggregate {
                input: self.plan(input)?,
                group_by,
                aggregates: aggregates
                    .into_iter()
                    .map(|(name, a)| Ok((name, self.aggregate(a)?)))
                    .collect::<Result<_>>()?,
            }),
            PlanNode::Sort { input, keys } => LogicalOperator::Sort(LogicalSort {
                input: self.plan(input)?,
                keys,
            }),
            PlanNode::Limit { input, skip, fetch } => LogicalOperator::Limit(LogicalLimit {
                input: self.plan(input)?,
                skip,
                fetch,
            }),
            PlanNode::Union { inputs } => LogicalOperator::Union(LogicalUnion {
                inputs: inputs
                    .into_iter()
                    .map(|i| self.plan(i))
                    .collect::<Result<_>>()?,
            }),
        };
        Plan::new(op)
    }

    fn expr(&self, expr: ExprNode) -> Result<ScalarExpr> {
        Ok(match expr {
            ExprNode::Column { name } => ScalarExpr::Column(name),
            ExprNode::Literal { value } => ScalarExpr::Literal(value),
            ExprNode::Binary { left, op, right } => ScalarExpr::Binary {
                left: Box::new(self.expr(*left)?),
                op,
                right: Box::new(self.expr(*right)?),
            },
            ExprNode::Not { expr } => ScalarExpr::Not(Box::new(self.expr(*expr)?)),
            ExprNode::IsNull { expr } => ScalarExpr::IsNull(Box::new(self.expr(*expr)?)),
            ExprNode::Function {
                name,
                args,
                return_type,
            } => ScalarExpr::Function {
                name,
                args: args
                    .into_iter()
                    .map(|a| self.expr(a))
                    .collect::<Result<_>>()?,
                return_type,
            },
            ExprNode::InSubquery {
                expr,
                subquery,
                negated,
            } => ScalarExpr::InSubquery {
                expr: Box::new(self.expr(*expr)?),
                subquery: self.plan(subquery)?,
                negated,
            },
        })
    }

    fn aggregate(&self, agg: AggregateNode) -> Result<AggregateExpr> {
        Ok(AggregateExpr {
            func: agg.func,
            arg: agg.arg.map(|a| self.expr(a)).transpose()?,
        })
    }
}

/// Node table for an unbound plan.
pub fn plan_to_wire(plan: &Plan) -> Result<WirePlan> {
    PlanEncoder::default().encode(plan)
}

pub fn plan_from_wire(wire: WirePlan) -> Result<Plan> {
    PlanDecoder::default().decode(wire)
}

/// Serialize an unbound plan.
pub fn encode_plan(plan: &Plan) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&plan_to_wire(plan)?)?)
}

pub fn decode_plan(bytes: &[u8]) -> Result<Plan> {
    let wire: WirePlan = serde_json::from_slice(bytes)?;
    plan_from_wire(wire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DataFusionBackend;
    use crate::expr::{call, col, lit, sum};
    use crate::schema::Field;

    fn schema() -> Schema {
        Schema::new([
            Field::new("k", DataType::Int64),
            Field::new("v", DataType::Float64),
        ])
    }

    #[test]
    fn decoded_plan_equals_original() {
        let input = Plan::unbound("input", schema());
        let lookup = Plan::unbound("input", schema()).select(["k"]).unwrap();
        let plan = input
            .filter(col("k").in_subquery(lookup).and(col("v").gt(lit(0.5))))
            .unwrap()
            .project([
                ("k", col("k")),
                ("score", call("sqrt", vec![col("v")], DataType::Float64)),
            ])
            .unwrap()
            .aggregate(["k"], [("total", sum(col("score")))])
            .unwrap();

        let decoded = decode_plan(&encode_plan(&plan).unwrap()).unwrap();
        assert_eq!(plan, decoded);
        assert_eq!(plan.schema(), decoded.schema());
    }

    #[test]
    fn context_bound_nodes_are_rejected() {
        let backend = DataFusionBackend::new("df");
        let table = Plan::table("t", schema(), backend.context());
        let err = encode_plan(&table.limit(1).unwrap()).unwrap_err();
        assert!(matches!(err, FerryError::Plan(_)));
    }

    #[test]
    fn shared_subplans_are_encoded_once() {
        let mut plan = Plan::unbound("input", schema());
        for depth in 0..40 {
            let left = plan.filter(col("k").gt(lit(depth))).unwrap();
            let right = plan.filter(col("k").lt(lit(depth))).unwrap();
            plan = left.union(&right).unwrap();
        }

        let wire = plan_to_wire(&plan).unwrap();
        // One placeholder plus three nodes per level.
        assert_eq!(1 + 3 * 40, wire.nodes.len());
        assert_eq!(wire.nodes.len() - 1, wire.root);

        let decoded = decode_plan(&encode_plan(&plan).unwrap()).unwrap();
        assert_eq!(plan, decoded);
    }

    #[test]
    fn forward_references_are_rejected() {
        let wire = WirePlan {
            nodes: vec![PlanNode::Limit {
                input: 1,
                skip: 0,
                fetch: Some(1),
            }],
            root: 0,
        };
        let err = plan_from_wire(wire).unwrap_err();
        assert!(matches!(err, FerryError::Plan(_)));
    }
}
