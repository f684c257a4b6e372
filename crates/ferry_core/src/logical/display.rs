use std::fmt;

use super::{LogicalOperator, Plan};

/// Indented tree rendering of a plan, one node per line.
///
/// Opaque plans (remote expressions, exchange inputs) are printed nested under
/// their owner.
pub struct PlanTree<'a>(pub &'a Plan);

impl Plan {
    pub fn display_tree(&self) -> PlanTree<'_> {
        PlanTree(self)
    }
}

impl fmt::Display for PlanTree<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_node(f, self.0, 0)
    }
}

fn write_node(f: &mut fmt::Formatter<'_>, plan: &Plan, indent: usize) -> fmt::Result {
    write!(f, "{:width$}", "", width = indent * 2)?;
    match plan.op() {
        LogicalOperator::Table(n) => writeln!(f, "Table: {} {} [{}]", n.name, n.schema, n.context.name())?,
        LogicalOperator::Unbound(n) => writeln!(f, "Unbound: {} {}", n.name, n.schema)?,
        LogicalOperator::Project(n) => {
            let exprs: Vec<_> = n.exprs.iter().map(|(name, e)| format!("{e} AS {name}")).collect();
            writeln!(f, "Project: {}", exprs.join(", "))?
        }
        LogicalOperator::Filter(n) => writeln!(f, "Filter: {}", n.predicate)?,
        LogicalOperator::Aggregate(n) => {
            let aggs: Vec<_> = n
                .aggregates
                .iter()
                .map(|(name, a)| format!("{a} AS {name}"))
                .collect();
            writeln!(f, "Aggregate: groups=[{}] aggs=[{}]", n.group_by.join(", "), aggs.join(", "))?
        }
        LogicalOperator::Sort(n) => {
            let keys: Vec<_> = n
                .keys
                .iter()
                .map(|k| format!("{} {}", k.column, if k.ascending { "ASC" } else { "DESC" }))
                .collect();
            writeln!(f, "Sort: {}", keys.join(", "))?
        }
        LogicalOperator::Limit(n) => match n.fetch {
            Some(fetch) => writeln!(f, "Limit: skip={} fetch={fetch}", n.skip)?,
            None => writeln!(f, "Limit: skip={}", n.skip)?,
        },
        LogicalOperator::Union(_) => writeln!(f, "Union")?,
        LogicalOperator::Cache(n) => {
            writeln!(f, "Cache: {} [{}]", n.storage, n.storage.context().name())?
        }
        LogicalOperator::Remote(n) => {
            writeln!(f, "Remote: {} [{}]", n.name, n.context.name())?;
            return write_node(f, &n.remote_expr, indent + 1);
        }
        LogicalOperator::Read(n) => {
            writeln!(f, "Read: {}({}) {} [{}]", n.method, n.name, n.schema, n.context.name())?
        }
        LogicalOperator::Exchange(n) => {
            writeln!(f, "Exchange: {} [{}]", n.name, n.context.name())?;
            write_node(f, &n.unbound, indent + 1)?;
            return write_node(f, &n.input, indent + 1);
        }
    }

    for child in plan.children() {
        write_node(f, &child, indent + 1)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use datafusion::arrow::datatypes::DataType;

    use crate::expr::{col, lit, sum};
    use crate::logical::Plan;
    use crate::schema::{Field, Schema};

    #[test]
    fn renders_indented_tree() {
        let t = Plan::unbound(
            "t",
            Schema::new([Field::new("k", DataType::Int64), Field::new("v", DataType::Int64)]),
        );
        let plan = t
            .filter(col("v").gt(lit(0)))
            .unwrap()
            .aggregate(["k"], [("total", sum(col("v")))])
            .unwrap();

        let expected = "\
Aggregate: groups=[k] aggs=[sum(v) AS total]
  Filter: (v > 0)
    Unbound: t (k: Int64, v: Int64)
";
        assert_eq!(expected, plan.display_tree().to_string());
    }
}
