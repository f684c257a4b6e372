use crate::cache::CacheStorage;
use crate::context::{ContextRef, ExchangerRef, ReadArgs};
use crate::errors::{FerryError, Result};
use crate::expr::{AggregateExpr, ScalarExpr, SortKey};
use crate::schema::{Field, Schema};

use super::Plan;

/// A named table living in a single execution context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalTable {
    pub name: String,
    pub schema: Schema,
    pub context: ContextRef,
}

/// A placeholder relation with a schema but no data or context.
///
/// Placeholders get bound to concrete data right before execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalUnbound {
    pub name: String,
    pub schema: Schema,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalProject {
    pub input: Plan,
    pub exprs: Vec<(String, ScalarExpr)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalFilter {
    pub input: Plan,
    pub predicate: ScalarExpr,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalAggregate {
    pub input: Plan,
    pub group_by: Vec<String>,
    pub aggregates: Vec<(String, AggregateExpr)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalSort {
    pub input: Plan,
    pub keys: Vec<SortKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalLimit {
    pub input: Plan,
    pub skip: usize,
    pub fetch: Option<usize>,
}

/// Union all. Every input must have the same schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalUnion {
    pub inputs: Vec<Plan>,
}

/// Marks `parent` as worth persisting in `storage`.
///
/// Never compiled into a backend query. Replaced by the stored relation during
/// execution, or by the parent during compilation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalCache {
    pub parent: Plan,
    pub storage: CacheStorage,
}

/// Result of `remote_expr` (evaluated wherever its own leaves live) made
/// available as a table in `context`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalRemote {
    pub name: String,
    pub schema: Schema,
    pub context: ContextRef,
    pub remote_expr: Plan,
}

/// A source read resolved lazily against `context`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalRead {
    pub method: String,
    pub name: String,
    pub schema: Schema,
    pub context: ContextRef,
    pub args: ReadArgs,
}

/// Output of running `unbound` with `input` bound to its placeholder through
/// an exchanger. Acts as a table in `context`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalExchange {
    pub name: String,
    pub schema: Schema,
    pub context: ContextRef,
    pub input: Plan,
    pub unbound: Plan,
    pub exchanger: ExchangerRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogicalOperator {
    Table(LogicalTable),
    Unbound(LogicalUnbound),
    Project(LogicalProject),
    Filter(LogicalFilter),
    Aggregate(LogicalAggregate),
    Sort(LogicalSort),
    Limit(LogicalLimit),
    Union(LogicalUnion),
    Cache(LogicalCache),
    Remote(LogicalRemote),
    Read(LogicalRead),
    Exchange(LogicalExchange),
}

impl LogicalOperator {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Table(_) => "Table",
            Self::Unbound(_) => "Unbound",
            Self::Project(_) => "Project",
            Self::Filter(_) => "Filter",
            Self::Aggregate(_) => "Aggregate",
            Self::Sort(_) => "Sort",
            Self::Limit(_) => "Limit",
            Self::Union(_) => "Union",
            Self::Cache(_) => "Cache",
            Self::Remote(_) => "Remote",
            Self::Read(_) => "Read",
            Self::Exchange(_) => "Exchange",
        }
    }

    /// Relational inputs. Opaque plans (remote expressions, exchange inputs)
    /// are not included.
    pub fn inputs(&self) -> Vec<&Plan> {
        match self {
            Self::Table(_) | Self::Unbound(_) | Self::Remote(_) | Self::Read(_) => Vec::new(),
            Self::Exchange(_) => Vec::new(),
            Self::Project(n) => vec![&n.input],
            Self::Filter(n) => vec![&n.input],
            Self::Aggregate(n) => vec![&n.input],
            Self::Sort(n) => vec![&n.input],
            Self::Limit(n) => vec![&n.input],
            Self::Union(n) => n.inputs.iter().collect(),
            Self::Cache(n) => vec![&n.parent],
        }
    }

    /// Scalar expressions held by this operator, in a stable order.
    pub fn expressions(&self) -> Vec<&ScalarExpr> {
        match self {
            Self::Project(n) => n.exprs.iter().map(|(_, expr)| expr).collect(),
            Self::Filter(n) => vec![&n.predicate],
            Self::Aggregate(n) => n
                .aggregates
                .iter()
                .filter_map(|(_, agg)| agg.arg.as_ref())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn output_schema(&self) -> Result<Schema> {
        Ok(match self {
            Self::Table(n) => n.schema.clone(),
            Self::Unbound(n) => n.schema.clone(),
            Self::Remote(n) => n.schema.clone(),
            Self::Read(n) => n.schema.clone(),
            Self::Exchange(n) => n.schema.clone(),
            Self::Cache(n) => n.parent.schema().clone(),
            Self::Sort(n) => {
                for key in &n.keys {
                    n.input.schema().field_or_err(&key.column)?;
                }
                n.input.schema().clone()
            }
            Self::Limit(n) => n.input.schema().clone(),
            Self::Filter(n) => {
                for col in n.predicate.columns() {
                    n.input.schema().field_or_err(col)?;
                }
                n.input.schema().clone()
            }
            Self::Project(n) => {
                let input = n.input.schema();
                Schema::new(
                    n.exprs
                        .iter()
                        .map(|(name, expr)| Ok(Field::new(name.clone(), expr.datatype(input)?)))
                        .collect::<Result<Vec<_>>>()?,
                )
            }
            Self::Aggregate(n) => {
                let input = n.input.schema();
                let mut fields = Vec::with_capacity(n.group_by.len() + n.aggregates.len());
                for group in &n.group_by {
                    fields.push(input.field_or_err(group)?.clone());
                }
                for (name, agg) in &n.aggregates {
                    fields.push(Field::new(name.clone(), agg.datatype(input)?));
                }
                Schema::new(fields)
            }
            Self::Union(n) => {
                let first = n
                    .inputs
                    .first()
                    .ok_or_else(|| FerryError::Plan("union requires at least one input".into()))?;
                for other in &n.inputs[1..] {
                    if other.schema() != first.schema() {
                        return Err(FerryError::Plan(format!(
                            "union inputs have different schemas: {} and {}",
                            first.schema(),
                            other.schema()
                        )));
                    }
                }
                first.schema().clone()
            }
        })
    }

    /// Rebuild this operator over new children.
    ///
    /// Children are ordered as `Plan::children` orders them: relational inputs
    /// first, then subqueries found in expressions.
    pub(crate) fn with_new_children(&self, children: Vec<Plan>) -> Result<LogicalOperator> {
        let num_inputs = self.inputs().len();
        if children.len() < num_inputs {
            return Err(FerryError::Internal(format!(
                "{} expects at least {num_inputs} children, got {}",
                self.name(),
                children.len()
            )));
        }

        let mut iter = children.into_iter();
        let mut inputs: Vec<Plan> = iter.by_ref().take(num_inputs).collect();

        let op = match self {
            Self::Table(_)
            | Self::Unbound(_)
            | Self::Remote(_)
            | Self::Read(_)
            | Self::Exchange(_) => self.clone(),
            Self::Project(n) => Self::Project(LogicalProject {
                input: inputs.remove(0),
                exprs: n
                    .exprs
                    .iter()
                    .map(|(name, expr)| Ok((name.clone(), expr.with_new_subqueries(&mut iter)?)))
                    .collect::<Result<Vec<_>>>()?,
            }),
            Self::Filter(n) => Self::Filter(LogicalFilter {
                input: inputs.remove(0),
                predicate: n.predicate.with_new_subqueries(&mut iter)?,
            }),
            Self::Aggregate(n) => Self::Aggregate(LogicalAggregate {
                input: inputs.remove(0),
                group_by: n.group_by.clone(),
                aggregates: n
                    .aggregates
                    .iter()
                    .map(|(name, agg)| {
                        let arg = match &agg.arg {
                            Some(arg) => Some(arg.with_new_subqueries(&mut iter)?),
                            None => None,
                        };
                        Ok((
                            name.clone(),
                            AggregateExpr {
                                func: agg.func,
                                arg,
                            },
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?,
            }),
            Self::Sort(n) => Self::Sort(LogicalSort {
                input: inputs.remove(0),
                keys: n.keys.clone(),
            }),
            Self::Limit(n) => Self::Limit(LogicalLimit {
                input: inputs.remove(0),
                skip: n.skip,
                fetch: n.fetch,
            }),
            Self::Union(_) => Self::Union(LogicalUnion { inputs }),
            Self::Cache(n) => Self::Cache(LogicalCache {
                parent: inputs.remove(0),
                storage: n.storage.clone(),
            }),
        };

        if iter.next().is_some() {
            return Err(FerryError::Internal(format!(
                "too many children for {}",
                self.name()
            )));
        }

        Ok(op)
    }
}
