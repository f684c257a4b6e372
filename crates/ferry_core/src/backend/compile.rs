//! Translation of operator graphs into DataFusion logical plans.

use std::sync::Arc;

use datafusion::common::{Column, ScalarValue as DfScalarValue, TableReference};
use datafusion::datasource::provider_as_source;
use datafusion::execution::FunctionRegistry;
use datafusion::functions_aggregate::expr_fn as agg;
use datafusion::logical_expr::{
    binary_expr,
    in_subquery,
    lit,
    not_in_subquery,
    Expr,
    LogicalPlan,
    LogicalPlanBuilder,
    LogicalTableSource,
    Operator,
};

use super::DataFusionBackend;
use crate::errors::{internal, FerryError, Result};
use crate::expr::{AggregateExpr, AggregateFunction, BinaryOperator, ScalarExpr, ScalarValue};
use crate::logical::{LogicalOperator, Plan};
use crate::schema::Schema;

/// Whether placeholders and foreign tables are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompileMode {
    /// Produce a plan for display only.
    Display,
    /// Produce a plan that will be executed.
    Execute,
}

fn placeholder_scan(name: &str, schema: &Schema) -> Result<LogicalPlanBuilder> {
    let source = Arc::new(LogicalTableSource::new(schema.to_arrow()));
    Ok(LogicalPlanBuilder::scan(
        TableReference::bare(name),
        source,
        None,
    )?)
}

fn df_scalar(value: &ScalarValue) -> DfScalarValue {
    match value {
        ScalarValue::Null => DfScalarValue::Null,
        ScalarValue::Boolean(v) => DfScalarValue::Boolean(Some(*v)),
        ScalarValue::Int64(v) => DfScalarValue::Int64(Some(*v)),
        ScalarValue::Float64(v) => DfScalarValue::Float64(Some(*v)),
        ScalarValue::Utf8(v) => DfScalarValue::Utf8(Some(v.clone())),
    }
}

fn df_operator(op: BinaryOperator) -> Operator {
    match op {
        BinaryOperator::Eq => Operator::Eq,
        BinaryOperator::NotEq => Operator::NotEq,
        BinaryOperator::Lt => Operator::Lt,
        BinaryOperator::LtEq => Operator::LtEq,
        BinaryOperator::Gt => Operator::Gt,
        BinaryOperator::GtEq => Operator::GtEq,
        BinaryOperator::And => Operator::And,
        BinaryOperator::Or => Operator::Or,
        BinaryOperator::Plus => Operator::Plus,
        BinaryOperator::Minus => Operator::Minus,
        BinaryOperator::Multiply => Operator::Multiply,
        BinaryOperator::Divide => Operator::Divide,
        BinaryOperator::Modulo => Operator::Modulo,
    }
}

impl DataFusionBackend {
    pub(crate) fn logical_plan(&self, plan: &Plan, mode: CompileMode) -> Result<LogicalPlan> {
        Ok(self.builder(plan, mode)?.build()?)
    }

    fn builder(&self, plan: &Plan, mode: CompileMode) -> Result<LogicalPlanBuilder> {
        Ok(match plan.op() {
            LogicalOperator::Table(n) => {
                if n.context.id() != self.id {
                    if mode == CompileMode::Display {
                        return placeholder_scan(&n.name, &n.schema);
                    }
                    return Err(internal!(
                        "table '{}' belongs to context '{}', not '{}'",
                        n.name,
                        n.context.name(),
                        self.name
                    ));
                }
                let provider = self.provider(&n.name)?;
                if mode == CompileMode::Execute {
                    *self.scans.entry(n.name.clone()).or_insert(0) += 1;
                }
                LogicalPlanBuilder::scan(
                    TableReference::bare(n.name.as_str()),
                    provider_as_source(provider),
                    None,
                )?
            }
            LogicalOperator::Unbound(n) => match mode {
                CompileMode::Display => placeholder_scan(&n.name, &n.schema)?,
                CompileMode::Execute => {
                    return Err(FerryError::Plan(format!(
                        "cannot execute unbound table '{}'",
                        n.name
                    )))
                }
            },
            LogicalOperator::Project(n) => {
                let exprs = n
                    .exprs
                    .iter()
                    .map(|(name, e)| Ok(self.expr(e, mode)?.alias(name)))
                    .collect::<Result<Vec<_>>>()?;
                self.builder(&n.input, mode)?.project(exprs)?
            }
            LogicalOperator::Filter(n) => {
                let predicate = self.expr(&n.predicate, mode)?;
                self.builder(&n.input, mode)?.filter(predicate)?
            }
            LogicalOperator::Aggregate(n) => {
                let groups: Vec<Expr> = n
                    .group_by
                    .iter()
                    .map(|g| Expr::Column(Column::new_unqualified(g)))
                    .collect();
                let aggs = n
                    .aggregates
                    .iter()
                    .map(|(name, a)| Ok(self.aggregate(a, mode)?.alias(name)))
                    .collect::<Result<Vec<_>>>()?;
                self.builder(&n.input, mode)?.aggregate(groups, aggs)?
            }
            LogicalOperator::Sort(n) => {
                let keys: Vec<_> = n
                    .keys
                    .iter()
                    .map(|k| {
                        Expr::Column(Column::new_unqualified(&k.column))
                            .sort(k.ascending, k.nulls_first)
                    })
                    .collect();
                self.builder(&n.input, mode)?.sort(keys)?
            }
            LogicalOperator::Limit(n) => self.builder(&n.input, mode)?.limit(n.skip, n.fetch)?,
            LogicalOperator::Union(n) => {
                let mut inputs = n.inputs.iter();
                let first = inputs
                    .next()
                    .ok_or_else(|| FerryError::Plan("empty union".to_string()))?;
                let mut builder = self.builder(first, mode)?;
                for input in inputs {
                    builder = builder.union(self.logical_plan(input, mode)?)?;
                }
                builder
            }
            LogicalOperator::Cache(_)
            | LogicalOperator::Remote(_)
            | LogicalOperator::Read(_)
            | LogicalOperator::Exchange(_) => {
                return Err(internal!(
                    "{} nodes must be resolved before compiling",
                    plan.op().name()
                ))
            }
        })
    }

    fn expr(&self, expr: &ScalarExpr, mode: CompileMode) -> Result<Expr> {
        Ok(match expr {
            ScalarExpr::Column(name) => Expr::Column(Column::new_unqualified(name)),
            ScalarExpr::Literal(v) => lit(df_scalar(v)),
            ScalarExpr::Binary { left, op, right } => binary_expr(
                self.expr(left, mode)?,
                df_operator(*op),
                self.expr(right, mode)?,
            ),
            ScalarExpr::Not(e) => Expr::Not(Box::new(self.expr(e, mode)?)),
            ScalarExpr::IsNull(e) => self.expr(e, mode)?.is_null(),
            ScalarExpr::Function { name, args, .. } => {
                let udf = self.session.udf(name)?;
                let args = args
                    .iter()
                    .map(|a| self.expr(a, mode))
                    .collect::<Result<Vec<_>>>()?;
                udf.call(args)
            }
            ScalarExpr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                let expr = self.expr(expr, mode)?;
                let subquery = Arc::new(self.logical_plan(subquery, mode)?);
                if *negated {
                    not_in_subquery(expr, subquery)
                } else {
                    in_subquery(expr, subquery)
                }
            }
        })
    }

    fn aggregate(&self, agg_expr: &AggregateExpr, mode: CompileMode) -> Result<Expr> {
        let arg = match &agg_expr.arg {
            Some(arg) => self.expr(arg, mode)?,
            None if agg_expr.func == AggregateFunction::Count => lit(1_i64),
            None => {
                return Err(FerryError::Plan(format!(
                    "aggregate '{}' requires an argument",
                    agg_expr.func
                )))
            }
        };
        Ok(match agg_expr.func {
            AggregateFunction::Count => agg::count(arg),
            AggregateFunction::CountDistinct => agg::count_distinct(arg),
            AggregateFunction::Sum => agg::sum(arg),
            AggregateFunction::Min => agg::min(arg),
            AggregateFunction::Max => agg::max(arg),
            AggregateFunction::Avg => agg::avg(arg),
        })
    }
}
