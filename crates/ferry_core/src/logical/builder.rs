//! Constructors for building graphs by hand.

use uuid::Uuid;

use super::*;
use crate::cache::CacheStorage;
use crate::context::{ExchangerRef, ReadArgs};
use crate::errors::FerryError;
use crate::expr::{col, AggregateExpr, ScalarExpr, SortKey};

impl Plan {
    pub fn table(name: impl Into<String>, schema: Schema, context: ContextRef) -> Plan {
        let schema_copy = schema.clone();
        Plan::with_schema(
            LogicalOperator::Table(LogicalTable {
                name: name.into(),
                schema,
                context,
            }),
            schema_copy,
        )
    }

    pub fn unbound(name: impl Into<String>, schema: Schema) -> Plan {
        let schema_copy = schema.clone();
        Plan::with_schema(
            LogicalOperator::Unbound(LogicalUnbound {
                name: name.into(),
                schema,
            }),
            schema_copy,
        )
    }

    /// Source read resolved lazily against `context`. The schema is looked up
    /// now.
    pub async fn read(
        context: &ContextRef,
        method: &str,
        name: &str,
        args: ReadArgs,
    ) -> Result<Plan> {
        let schema = context.read_schema(method, &args).await?;
        Ok(Self::read_with_schema(context, method, name, schema, args))
    }

    pub fn read_with_schema(
        context: &ContextRef,
        method: &str,
        name: &str,
        schema: Schema,
        args: ReadArgs,
    ) -> Plan {
        let schema_copy = schema.clone();
        Plan::with_schema(
            LogicalOperator::Read(LogicalRead {
                method: method.to_string(),
                name: name.to_string(),
                schema,
                context: context.clone(),
                args,
            }),
            schema_copy,
        )
    }

    pub fn select<I, S>(&self, columns: I) -> Result<Plan>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.project(columns.into_iter().map(|c| {
            let name: String = c.into();
            (name.clone(), col(name))
        }))
    }

    pub fn project<I, S>(&self, exprs: I) -> Result<Plan>
    where
        I: IntoIterator<Item = (S, ScalarExpr)>,
        S: Into<String>,
    {
        Plan::new(LogicalOperator::Project(LogicalProject {
            input: self.clone(),
            exprs: exprs.into_iter().map(|(n, e)| (n.into(), e)).collect(),
        }))
    }

    pub fn filter(&self, predicate: ScalarExpr) -> Result<Plan> {
        Plan::new(LogicalOperator::Filter(LogicalFilter {
            input: self.clone(),
            predicate,
        }))
    }

    pub fn aggregate<G, A, S>(&self, group_by: G, aggregates: A) -> Result<Plan>
    where
        G: IntoIterator<Item = S>,
        A: IntoIterator<Item = (S, AggregateExpr)>,
        S: Into<String>,
    {
        Plan::new(LogicalOperator::Aggregate(LogicalAggregate {
            input: self.clone(),
            group_by: group_by.into_iter().map(Into::into).collect(),
            aggregates: aggregates.into_iter().map(|(n, a)| (n.into(), a)).collect(),
        }))
    }

    pub fn order_by(&self, keys: impl IntoIterator<Item = SortKey>) -> Result<Plan> {
        Plan::new(LogicalOperator::Sort(LogicalSort {
            input: self.clone(),
            keys: keys.into_iter().collect(),
        }))
    }

    pub fn limit(&self, fetch: usize) -> Result<Plan> {
        self.offset_limit(0, Some(fetch))
    }

    pub fn offset_limit(&self, skip: usize, fetch: Option<usize>) -> Result<Plan> {
        Plan::new(LogicalOperator::Limit(LogicalLimit {
            input: self.clone(),
            skip,
            fetch,
        }))
    }

    pub fn union(&self, other: &Plan) -> Result<Plan> {
        Plan::new(LogicalOperator::Union(LogicalUnion {
            inputs: vec![self.clone(), other.clone()],
        }))
    }

    /// Mark this plan for caching in `storage`.
    ///
    /// If the plan isn't bound to exactly the storage's context, it is first
    /// moved there with `into_backend`.
    pub fn cache(&self, storage: &CacheStorage) -> Result<Plan> {
        let parent = match self.contexts().as_slice() {
            [ctx] if ctx == storage.context() => self.clone(),
            _ => self.into_backend(storage.context(), None)?,
        };

        Plan::new(LogicalOperator::Cache(LogicalCache {
            parent,
            storage: storage.clone(),
        }))
    }

    /// Make the result of this plan available as a table in `context`.
    pub fn into_backend(&self, context: &ContextRef, name: Option<&str>) -> Result<Plan> {
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("ferry_remote_{}", Uuid::new_v4().simple()),
        };
        Plan::new(LogicalOperator::Remote(LogicalRemote {
            name,
            schema: self.schema().clone(),
            context: context.clone(),
            remote_expr: self.clone(),
        }))
    }

    /// Run `unbound` over this plan's output through `exchanger`.
    ///
    /// `unbound` must contain exactly one placeholder, with the same schema as
    /// this plan, and no context-bound nodes. The output becomes a table in
    /// the context this plan is bound to.
    pub fn exchange(&self, unbound: &Plan, exchanger: ExchangerRef) -> Result<Plan> {
        let placeholder = single_placeholder(unbound)?;
        if placeholder.schema() != self.schema() {
            return Err(FerryError::SchemaMismatch {
                expected: placeholder.schema().clone(),
                got: self.schema().clone(),
            });
        }
        if !unbound.contexts().is_empty() {
            return Err(FerryError::Plan(
                "exchanged plans may not reference execution contexts".to_string(),
            ));
        }

        let context = match self.contexts().as_slice() {
            [ctx] => ctx.clone(),
            other => {
                return Err(FerryError::AmbiguousBackend(format!(
                    "exchange input bound to {} contexts",
                    other.len()
                )))
            }
        };

        Plan::new(LogicalOperator::Exchange(LogicalExchange {
            name: format!("ferry_exchange_{}", Uuid::new_v4().simple()),
            schema: unbound.schema().clone(),
            context,
            input: self.clone(),
            unbound: unbound.clone(),
            exchanger,
        }))
    }
}

/// The only placeholder in `plan`. Errors if there are none or several.
pub fn single_placeholder(plan: &Plan) -> Result<Plan> {
    let placeholders = plan.find(|n| matches!(n.op(), LogicalOperator::Unbound(_)));
    match placeholders.as_slice() {
        [one] => Ok(one.clone()),
        other => Err(FerryError::Plan(format!(
            "expected exactly one unbound table, found {}",
            other.len()
        ))),
    }
}

impl LogicalRead {
    /// Name of the placeholder standing in for this read. Derived from the
    /// read itself so equal reads map to equal placeholders.
    pub fn placeholder_name(&self) -> String {
        let token = format!("{}:{}:{:?}:{}", self.method, self.name, self.args, self.schema);
        let digest = format!("{:x}", md5::compute(token.as_bytes()));
        format!("{}_{}", self.name, &digest[..12])
    }

    pub fn make_unbound(&self) -> Plan {
        Plan::unbound(self.placeholder_name(), self.schema.clone())
    }
}
