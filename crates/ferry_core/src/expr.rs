//! Scalar expressions evaluated inside relational operators.

use std::fmt;
use std::hash::{Hash, Hasher};

use datafusion::arrow::datatypes::DataType;
use serde::{Deserialize, Serialize};

use crate::errors::{internal, FerryError, Result};
use crate::logical::Plan;
use crate::schema::Schema;

/// Literal values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl ScalarValue {
    pub fn datatype(&self) -> DataType {
        match self {
            Self::Null => DataType::Null,
            Self::Boolean(_) => DataType::Boolean,
            Self::Int64(_) => DataType::Int64,
            Self::Float64(_) => DataType::Float64,
            Self::Utf8(_) => DataType::Utf8,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Utf8(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

// Floats compare and hash by bit pattern so literals can participate in node
// identity.
impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a.to_bits() == b.to_bits(),
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => (),
            Self::Boolean(v) => v.hash(state),
            Self::Int64(v) => v.hash(state),
            Self::Float64(v) => v.to_bits().hash(state),
            Self::Utf8(v) => v.hash(state),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v:?}"),
            Self::Utf8(v) => write!(f, "'{v}'"),
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Int64(value)
    }
}

impl From<i32> for ScalarValue {
    fn from(value: i32) -> Self {
        ScalarValue::Int64(value as i64)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Float64(value)
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Boolean(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Utf8(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::Utf8(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOperator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
}

impl BinaryOperator {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Eq | Self::NotEq | Self::Lt | Self::LtEq | Self::Gt | Self::GtEq
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, Self::And | Self::Or)
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Modulo => "%",
        };
        write!(f, "{s}")
    }
}

/// A scalar expression.
///
/// Expressions may embed relations (`InSubquery`). Those relations are child
/// slots of the operator holding the expression, so rewrites reach them the
/// same way they reach relational inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarExpr {
    Column(String),
    Literal(ScalarValue),
    Binary {
        left: Box<ScalarExpr>,
        op: BinaryOperator,
        right: Box<ScalarExpr>,
    },
    Not(Box<ScalarExpr>),
    IsNull(Box<ScalarExpr>),
    /// Call to a function registered by name with the executing backend.
    Function {
        name: String,
        args: Vec<ScalarExpr>,
        return_type: DataType,
    },
    InSubquery {
        expr: Box<ScalarExpr>,
        subquery: Plan,
        negated: bool,
    },
}

pub fn col(name: impl Into<String>) -> ScalarExpr {
    ScalarExpr::Column(name.into())
}

pub fn lit(value: impl Into<ScalarValue>) -> ScalarExpr {
    ScalarExpr::Literal(value.into())
}

/// Call a named function registered with the backend.
pub fn call(name: impl Into<String>, args: Vec<ScalarExpr>, return_type: DataType) -> ScalarExpr {
    ScalarExpr::Function {
        name: name.into(),
        args,
        return_type,
    }
}

impl ScalarExpr {
    fn binary(self, op: BinaryOperator, other: ScalarExpr) -> ScalarExpr {
        ScalarExpr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other),
        }
    }

    pub fn eq(self, other: ScalarExpr) -> ScalarExpr {
        self.binary(BinaryOperator::Eq, other)
    }

    pub fn not_eq(self, other: ScalarExpr) -> ScalarExpr {
        self.binary(BinaryOperator::NotEq, other)
    }

    pub fn lt(self, other: ScalarExpr) -> ScalarExpr {
        self.binary(BinaryOperator::Lt, other)
    }

    pub fn lt_eq(self, other: ScalarExpr) -> ScalarExpr {
        self.binary(BinaryOperator::LtEq, other)
    }

    pub fn gt(self, other: ScalarExpr) -> ScalarExpr {
        self.binary(BinaryOperator::Gt, other)
    }

    pub fn gt_eq(self, other: ScalarExpr) -> ScalarExpr {
        self.binary(BinaryOperator::GtEq, other)
    }

    pub fn and(self, other: ScalarExpr) -> ScalarExpr {
        self.binary(BinaryOperator::And, other)
    }

    pub fn or(self, other: ScalarExpr) -> ScalarExpr {
        self.binary(BinaryOperator::Or, other)
    }

    pub fn add(self, other: ScalarExpr) -> ScalarExpr {
        self.binary(BinaryOperator::Plus, other)
    }

    pub fn sub(self, other: ScalarExpr) -> ScalarExpr {
        self.binary(BinaryOperator::Minus, other)
    }

    pub fn mul(self, other: ScalarExpr) -> ScalarExpr {
        self.binary(BinaryOperator::Multiply, other)
    }

    pub fn div(self, other: ScalarExpr) -> ScalarExpr {
        self.binary(BinaryOperator::Divide, other)
    }

    pub fn in_subquery(self, subquery: Plan) -> ScalarExpr {
        ScalarExpr::InSubquery {
            expr: Box::new(self),
            subquery,
            negated: false,
        }
    }

    /// Infer the output type of this expression against an input schema.
    pub fn datatype(&self, input: &Schema) -> Result<DataType> {
        Ok(match self {
            Self::Column(name) => input.field_or_err(name)?.datatype.clone(),
            Self::Literal(v) => v.datatype(),
            Self::Binary { left, op, right } => {
                if op.is_comparison() || op.is_logical() {
                    DataType::Boolean
                } else {
                    let left = left.datatype(input)?;
                    let right = right.datatype(input)?;
                    match (&left, &right) {
                        (DataType::Float64, _) | (_, DataType::Float64) => DataType::Float64,
                        (DataType::Float32, _) | (_, DataType::Float32) => DataType::Float32,
                        _ => left,
                    }
                }
            }
            Self::Not(_) | Self::IsNull(_) | Self::InSubquery { .. } => DataType::Boolean,
            Self::Function { return_type, .. } => return_type.clone(),
        })
    }

    /// Relations nested in this expression, in a stable order.
    pub fn subqueries(&self) -> Vec<&Plan> {
        let mut out = Vec::new();
        self.collect_subqueries(&mut out);
        out
    }

    fn collect_subqueries<'a>(&'a self, out: &mut Vec<&'a Plan>) {
        match self {
            Self::Column(_) | Self::Literal(_) => (),
            Self::Binary { left, right, .. } => {
                left.collect_subqueries(out);
                right.collect_subqueries(out);
            }
            Self::Not(expr) | Self::IsNull(expr) => expr.collect_subqueries(out),
            Self::Function { args, .. } => {
                for arg in args {
                    arg.collect_subqueries(out);
                }
            }
            Self::InSubquery { expr, subquery, .. } => {
                expr.collect_subqueries(out);
                out.push(subquery);
            }
        }
    }

    /// Rebuild this expression taking replacement subqueries from `iter` in
    /// the same order `subqueries` returns them.
    pub fn with_new_subqueries(&self, iter: &mut impl Iterator<Item = Plan>) -> Result<ScalarExpr> {
        Ok(match self {
            Self::Column(_) | Self::Literal(_) => self.clone(),
            Self::Binary { left, op, right } => ScalarExpr::Binary {
                left: Box::new(left.with_new_subqueries(iter)?),
                op: *op,
                right: Box::new(right.with_new_subqueries(iter)?),
            },
            Self::Not(expr) => ScalarExpr::Not(Box::new(expr.with_new_subqueries(iter)?)),
            Self::IsNull(expr) => ScalarExpr::IsNull(Box::new(expr.with_new_subqueries(iter)?)),
            Self::Function {
                name,
                args,
                return_type,
            } => ScalarExpr::Function {
                name: name.clone(),
                args: args
                    .iter()
                    .map(|arg| arg.with_new_subqueries(iter))
                    .collect::<Result<Vec<_>>>()?,
                return_type: return_type.clone(),
            },
            Self::InSubquery {
                expr,
                subquery: _,
                negated,
            } => {
                let expr = expr.with_new_subqueries(iter)?;
                let subquery = iter
                    .next()
                    .ok_or_else(|| internal!("ran out of replacement subqueries"))?;
                ScalarExpr::InSubquery {
                    expr: Box::new(expr),
                    subquery,
                    negated: *negated,
                }
            }
        })
    }

    /// Column names referenced by this expression, not including columns
    /// referenced inside subqueries.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Self::Column(name) => vec![name.as_str()],
            Self::Literal(_) => Vec::new(),
            Self::Binary { left, right, .. } => {
                let mut cols = left.columns();
                cols.extend(right.columns());
                cols
            }
            Self::Not(expr) | Self::IsNull(expr) => expr.columns(),
            Self::Function { args, .. } => args.iter().flat_map(|arg| arg.columns()).collect(),
            Self::InSubquery { expr, .. } => expr.columns(),
        }
    }
}

impl fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(name) => write!(f, "{name}"),
            Self::Literal(v) => write!(f, "{v}"),
            Self::Binary { left, op, right } => write!(f, "({left} {op} {right})"),
            Self::Not(expr) => write!(f, "NOT {expr}"),
            Self::IsNull(expr) => write!(f, "{expr} IS NULL"),
            Self::Function { name, args, .. } => {
                write!(f, "{name}(")?;
                for (idx, arg) in args.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Self::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                let not = if *negated { " NOT" } else { "" };
                write!(f, "{expr}{not} IN <subquery {}>", subquery.short_name())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunction {
    Count,
    CountDistinct,
    Sum,
    Min,
    Max,
    Avg,
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Count => "count",
            Self::CountDistinct => "count_distinct",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
        };
        write!(f, "{s}")
    }
}

/// An aggregate over an input column expression.
///
/// A missing argument only makes sense for `Count` and counts rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateExpr {
    pub func: AggregateFunction,
    pub arg: Option<ScalarExpr>,
}

impl AggregateExpr {
    pub fn datatype(&self, input: &Schema) -> Result<DataType> {
        let arg_type = match &self.arg {
            Some(arg) => Some(arg.datatype(input)?),
            None => None,
        };

        Ok(match (self.func, arg_type) {
            (AggregateFunction::Count | AggregateFunction::CountDistinct, _) => DataType::Int64,
            (AggregateFunction::Avg, _) => DataType::Float64,
            (AggregateFunction::Sum, Some(DataType::Float32 | DataType::Float64)) => {
                DataType::Float64
            }
            (AggregateFunction::Sum, Some(_)) => DataType::Int64,
            (AggregateFunction::Min | AggregateFunction::Max, Some(t)) => t,
            (func, None) => {
                return Err(FerryError::Plan(format!(
                    "aggregate '{func}' requires an argument"
                )))
            }
        })
    }
}

impl fmt::Display for AggregateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.arg {
            Some(arg) => write!(f, "{}({arg})", self.func),
            None => write!(f, "{}(*)", self.func),
        }
    }
}

pub fn count_star() -> AggregateExpr {
    AggregateExpr {
        func: AggregateFunction::Count,
        arg: None,
    }
}

pub fn count(expr: ScalarExpr) -> AggregateExpr {
    AggregateExpr {
        func: AggregateFunction::Count,
        arg: Some(expr),
    }
}

pub fn count_distinct(expr: ScalarExpr) -> AggregateExpr {
    AggregateExpr {
        func: AggregateFunction::CountDistinct,
        arg: Some(expr),
    }
}

pub fn sum(expr: ScalarExpr) -> AggregateExpr {
    AggregateExpr {
        func: AggregateFunction::Sum,
        arg: Some(expr),
    }
}

pub fn min(expr: ScalarExpr) -> AggregateExpr {
    AggregateExpr {
        func: AggregateFunction::Min,
        arg: Some(expr),
    }
}

pub fn max(expr: ScalarExpr) -> AggregateExpr {
    AggregateExpr {
        func: AggregateFunction::Max,
        arg: Some(expr),
    }
}

pub fn avg(expr: ScalarExpr) -> AggregateExpr {
    AggregateExpr {
        func: AggregateFunction::Avg,
        arg: Some(expr),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    pub ascending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(column: impl Into<String>) -> Self {
        SortKey {
            column: column.into(),
            ascending: true,
            nulls_first: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        SortKey {
            column: column.into(),
            ascending: false,
            nulls_first: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;
    use crate::schema::Field;

    fn hash_of(v: &ScalarValue) -> u64 {
        let mut hasher = DefaultHasher::new();
        v.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn float_literals_hash_by_bits() {
        let a = ScalarValue::Float64(1.5);
        let b = ScalarValue::Float64(1.5);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        assert_ne!(ScalarValue::Float64(0.0), ScalarValue::Float64(-0.0));
        assert_ne!(ScalarValue::Int64(1), ScalarValue::Float64(1.0));
    }

    #[test]
    fn infer_types() {
        let schema = Schema::new([
            Field::new("a", DataType::Int64),
            Field::new("b", DataType::Float64),
        ]);

        assert_eq!(
            DataType::Int64,
            col("a").add(lit(1)).datatype(&schema).unwrap()
        );
        assert_eq!(
            DataType::Float64,
            col("a").mul(col("b")).datatype(&schema).unwrap()
        );
        assert_eq!(
            DataType::Boolean,
            col("a").gt(lit(3)).and(col("b").lt(lit(1.0))).datatype(&schema).unwrap()
        );
        assert_eq!(DataType::Int64, sum(col("a")).datatype(&schema).unwrap());
        assert_eq!(DataType::Float64, avg(col("a")).datatype(&schema).unwrap());
        assert_eq!(DataType::Int64, count_star().datatype(&schema).unwrap());

        col("missing").datatype(&schema).unwrap_err();
        AggregateExpr {
            func: AggregateFunction::Sum,
            arg: None,
        }
        .datatype(&schema)
        .unwrap_err();
    }
}
