//! Scalar and predicate expressions used by merge and filters.
//!
//! Expressions are parsed from SQL text into [`Expr<ColumnName>`], then bound
//! against the merge schemas into [`Expr<BoundColumn>`] for evaluation. The
//! column type parameter keeps unresolved names out of the evaluator.

mod eval;
mod parser;

pub use eval::{ColumnSource, MergeRow};
pub use parser::{parse_expression, parse_predicate};

use crate::error::{Result, TableError};
use crate::schema::{DataType, Schema};
use crate::value::Value;

/// A column reference as written, optionally qualified by a table alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnName {
    /// Table alias, e.g. `target` in `target.id`.
    pub qualifier: Option<String>,
    /// Column name.
    pub name: String,
}

impl ColumnName {
    /// Creates an unqualified column reference.
    #[must_use]
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ColumnName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{q}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Which input of a merge a bound column reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The table being merged into.
    Target,
    /// The incoming rows.
    Source,
}

/// A column resolved to a side and a position in that side's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundColumn {
    /// Input side.
    pub side: Side,
    /// Column position.
    pub index: usize,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `AND`
    And,
    /// `OR`
    Or,
    /// `=`
    Eq,
    /// `<>` / `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Multiply,
    /// `/`
    Divide,
    /// `%`
    Modulo,
    /// `||`
    Concat,
}

impl BinaryOp {
    fn is_boolean(self) -> bool {
        matches!(
            self,
            Self::And | Self::Or | Self::Eq | Self::NotEq | Self::Lt | Self::LtEq | Self::Gt | Self::GtEq
        )
    }
}

/// Supported scalar functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFunction {
    /// First non-null argument.
    Coalesce,
    /// `NULL` if both arguments are equal, else the first.
    NullIf,
    /// Absolute value.
    Abs,
    /// Round to an optional number of decimal places.
    Round,
    /// Upper-case a string.
    Upper,
    /// Lower-case a string.
    Lower,
    /// Trim surrounding whitespace.
    Trim,
    /// Character length.
    Length,
    /// Concatenate arguments, skipping nulls.
    Concat,
}

impl ScalarFunction {
    /// Looks up a function by SQL name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "coalesce" => Self::Coalesce,
            "nullif" => Self::NullIf,
            "abs" => Self::Abs,
            "round" => Self::Round,
            "upper" => Self::Upper,
            "lower" => Self::Lower,
            "trim" | "btrim" => Self::Trim,
            "length" | "char_length" => Self::Length,
            "concat" => Self::Concat,
            _ => return None,
        })
    }

    fn arity(self) -> (usize, Option<usize>) {
        match self {
            Self::Coalesce | Self::Concat => (1, None),
            Self::NullIf => (2, Some(2)),
            Self::Round => (1, Some(2)),
            Self::Abs | Self::Upper | Self::Lower | Self::Trim | Self::Length => (1, Some(1)),
        }
    }
}

/// An expression tree, generic over its column representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr<C = ColumnName> {
    /// Column reference.
    Column(C),
    /// Constant.
    Literal(Value),
    /// Binary operation.
    Binary {
        /// Left operand.
        left: Box<Expr<C>>,
        /// Operator.
        op: BinaryOp,
        /// Right operand.
        right: Box<Expr<C>>,
    },
    /// Logical negation.
    Not(Box<Expr<C>>),
    /// Arithmetic negation.
    Negate(Box<Expr<C>>),
    /// `IS [NOT] NULL`
    IsNull {
        /// Tested expression.
        expr: Box<Expr<C>>,
        /// `IS NOT NULL` when true.
        negated: bool,
    },
    /// `[NOT] BETWEEN low AND high`
    Between {
        /// Tested expression.
        expr: Box<Expr<C>>,
        /// Inclusive lower bound.
        low: Box<Expr<C>>,
        /// Inclusive upper bound.
        high: Box<Expr<C>>,
        /// `NOT BETWEEN` when true.
        negated: bool,
    },
    /// `[NOT] IN (...)`
    InList {
        /// Tested expression.
        expr: Box<Expr<C>>,
        /// Candidates.
        list: Vec<Expr<C>>,
        /// `NOT IN` when true.
        negated: bool,
    },
    /// `[NOT] LIKE` / `ILIKE`
    Like {
        /// Tested expression.
        expr: Box<Expr<C>>,
        /// Pattern with `%` and `_` wildcards.
        pattern: Box<Expr<C>>,
        /// `NOT LIKE` when true.
        negated: bool,
        /// `ILIKE` when true.
        case_insensitive: bool,
    },
    /// `CASE [operand] WHEN ... THEN ... [ELSE ...] END`
    Case {
        /// Simple-case operand.
        operand: Option<Box<Expr<C>>>,
        /// `(when, then)` pairs in order.
        branches: Vec<(Expr<C>, Expr<C>)>,
        /// `ELSE` result; `NULL` when absent.
        else_result: Option<Box<Expr<C>>>,
    },
    /// `CAST(expr AS type)`
    Cast {
        /// Converted expression.
        expr: Box<Expr<C>>,
        /// Target type.
        data_type: DataType,
    },
    /// Scalar function call.
    Function {
        /// Function.
        func: ScalarFunction,
        /// Arguments.
        args: Vec<Expr<C>>,
    },
}

impl<C> Expr<C> {
    /// Builds `left op right`.
    #[must_use]
    pub fn binary(left: Expr<C>, op: BinaryOp, right: Expr<C>) -> Self {
        Self::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Splits a tree of `AND`s into its conjuncts.
    #[must_use]
    pub fn into_conjuncts(self) -> Vec<Expr<C>> {
        let mut out = Vec::new();
        let mut pending = vec![self];
        while let Some(expr) = pending.pop() {
            match expr {
                Expr::Binary {
                    left,
                    op: BinaryOp::And,
                    right,
                } => {
                    pending.push(*right);
                    pending.push(*left);
                }
                other => out.push(other),
            }
        }
        out
    }

    /// Joins conjuncts back with `AND`; `None` for an empty list.
    #[must_use]
    pub fn conjunction(conjuncts: Vec<Expr<C>>) -> Option<Expr<C>> {
        conjuncts
            .into_iter()
            .reduce(|acc, next| Expr::binary(acc, BinaryOp::And, next))
    }

    /// Returns true if the root can produce a boolean.
    ///
    /// Columns, `CASE`, casts to boolean, `COALESCE`/`NULLIF`, and `NULL`
    /// literals are accepted since their type is only known after binding.
    #[must_use]
    pub fn is_predicate_shaped(&self) -> bool {
        match self {
            Expr::Binary { op, .. } => op.is_boolean(),
            Expr::Not(_)
            | Expr::IsNull { .. }
            | Expr::Between { .. }
            | Expr::InList { .. }
            | Expr::Like { .. }
            | Expr::Column(_)
            | Expr::Case { .. } => true,
            Expr::Literal(v) => matches!(v, Value::Boolean(_) | Value::Null),
            Expr::Cast { data_type, .. } => *data_type == DataType::Boolean,
            Expr::Function { func, .. } => {
                matches!(func, ScalarFunction::Coalesce | ScalarFunction::NullIf)
            }
            Expr::Negate(_) => false,
        }
    }

    /// Visits every column reference.
    pub fn for_each_column(&self, f: &mut dyn FnMut(&C)) {
        match self {
            Expr::Column(c) => f(c),
            Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                left.for_each_column(f);
                right.for_each_column(f);
            }
            Expr::Not(e) | Expr::Negate(e) | Expr::IsNull { expr: e, .. } => e.for_each_column(f),
            Expr::Cast { expr, .. } => expr.for_each_column(f),
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.for_each_column(f);
                low.for_each_column(f);
                high.for_each_column(f);
            }
            Expr::InList { expr, list, .. } => {
                expr.for_each_column(f);
                for e in list {
                    e.for_each_column(f);
                }
            }
            Expr::Like { expr, pattern, .. } => {
                expr.for_each_column(f);
                pattern.for_each_column(f);
            }
            Expr::Case {
                operand,
                branches,
                else_result,
            } => {
                if let Some(operand) = operand {
                    operand.for_each_column(f);
                }
                for (when, then) in branches {
                    when.for_each_column(f);
                    then.for_each_column(f);
                }
                if let Some(e) = else_result {
                    e.for_each_column(f);
                }
            }
            Expr::Function { args, .. } => {
                for e in args {
                    e.for_each_column(f);
                }
            }
        }
    }

    /// Rewrites every column reference, failing on the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `f`.
    pub fn try_map_columns<D, E>(
        self,
        f: &mut dyn FnMut(C) -> std::result::Result<D, E>,
    ) -> std::result::Result<Expr<D>, E> {
        fn boxed<C, D, E>(
            e: Box<Expr<C>>,
            f: &mut dyn FnMut(C) -> std::result::Result<D, E>,
        ) -> std::result::Result<Box<Expr<D>>, E> {
            e.try_map_columns(f).map(Box::new)
        }
        Ok(match self {
            Expr::Column(c) => Expr::Column(f(c)?),
            Expr::Literal(v) => Expr::Literal(v),
            Expr::Binary { left, op, right } => Expr::Binary {
                left: boxed(left, &mut *f)?,
                op,
                right: boxed(right, &mut *f)?,
            },
            Expr::Not(e) => Expr::Not(boxed(e, &mut *f)?),
            Expr::Negate(e) => Expr::Negate(boxed(e, &mut *f)?),
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: boxed(expr, &mut *f)?,
                negated,
            },
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => Expr::Between {
                expr: boxed(expr, &mut *f)?,
                low: boxed(low, &mut *f)?,
                high: boxed(high, &mut *f)?,
                negated,
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => Expr::InList {
                expr: boxed(expr, &mut *f)?,
                list: list
                    .into_iter()
                    .map(|e| e.try_map_columns(&mut *f))
                    .collect::<std::result::Result<_, _>>()?,
                negated,
            },
            Expr::Like {
                expr,
                pattern,
                negated,
                case_insensitive,
            } => Expr::Like {
                expr: boxed(expr, &mut *f)?,
                pattern: boxed(pattern, &mut *f)?,
                negated,
                case_insensitive,
            },
            Expr::Case {
                operand,
                branches,
                else_result,
            } => Expr::Case {
                operand: operand.map(|o| boxed(o, &mut *f)).transpose()?,
                branches: branches
                    .into_iter()
                    .map(|(w, t)| Ok((w.try_map_columns(&mut *f)?, t.try_map_columns(&mut *f)?)))
                    .collect::<std::result::Result<_, E>>()?,
                else_result: else_result.map(|e| boxed(e, &mut *f)).transpose()?,
            },
            Expr::Cast { expr, data_type } => Expr::Cast {
                expr: boxed(expr, &mut *f)?,
                data_type,
            },
            Expr::Function { func, args } => Expr::Function {
                func,
                args: args
                    .into_iter()
                    .map(|e| e.try_map_columns(&mut *f))
                    .collect::<std::result::Result<_, _>>()?,
            },
        })
    }
}

/// Which sides of a merge an expression may read, and their aliases and
/// schemas.
#[derive(Debug, Clone, Copy)]
pub struct BindScope<'a> {
    /// Target alias and schema, if target columns are visible.
    pub target: Option<(&'a str, &'a Schema)>,
    /// Source alias and schema, if source columns are visible.
    pub source: Option<(&'a str, &'a Schema)>,
}

impl<'a> BindScope<'a> {
    /// Both sides visible.
    #[must_use]
    pub fn both(target: (&'a str, &'a Schema), source: (&'a str, &'a Schema)) -> Self {
        Self {
            target: Some(target),
            source: Some(source),
        }
    }

    /// Only the given side is visible; the other alias is still recognized
    /// so references to it produce a precise error.
    #[must_use]
    pub fn only(self, side: Side) -> Self {
        match side {
            Side::Target => Self {
                target: self.target,
                source: None,
            },
            Side::Source => Self {
                target: None,
                source: self.source,
            },
        }
    }

    fn lookup(schema: &Schema, name: &str) -> std::result::Result<Option<usize>, String> {
        if let Some(index) = schema.index_of(name) {
            return Ok(Some(index));
        }
        let mut matches = schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| f.name.eq_ignore_ascii_case(name));
        match (matches.next(), matches.next()) {
            (Some((index, _)), None) => Ok(Some(index)),
            (Some(_), Some(_)) => Err(format!("column `{name}` matches several columns by case")),
            _ => Ok(None),
        }
    }

    /// Resolves a column reference.
    ///
    /// # Errors
    ///
    /// Returns a message for unknown aliases, unknown or ambiguous columns,
    /// and references to a side that is not visible.
    pub fn resolve(
        &self,
        column: &ColumnName,
        target_alias: &str,
        source_alias: &str,
    ) -> std::result::Result<BoundColumn, String> {
        if let Some(qualifier) = &column.qualifier {
            let side = if qualifier.eq_ignore_ascii_case(target_alias) {
                Side::Target
            } else if qualifier.eq_ignore_ascii_case(source_alias) {
                Side::Source
            } else {
                return Err(format!("unknown table alias `{qualifier}` in `{column}`"));
            };
            let visible = match side {
                Side::Target => self.target,
                Side::Source => self.source,
            };
            let (_, schema) = visible.ok_or_else(|| {
                format!("`{column}` refers to {qualifier} columns, which are not available here")
            })?;
            return Self::lookup(schema, &column.name)?
                .map(|index| BoundColumn { side, index })
                .ok_or_else(|| format!("unknown column `{column}`"));
        }

        let in_target = match self.target {
            Some((_, schema)) => Self::lookup(schema, &column.name)?,
            None => None,
        };
        let in_source = match self.source {
            Some((_, schema)) => Self::lookup(schema, &column.name)?,
            None => None,
        };
        match (in_target, in_source) {
            (Some(index), None) => Ok(BoundColumn {
                side: Side::Target,
                index,
            }),
            (None, Some(index)) => Ok(BoundColumn {
                side: Side::Source,
                index,
            }),
            (Some(_), Some(_)) => Err(format!(
                "column `{column}` is ambiguous; qualify it with `{target_alias}.` or `{source_alias}.`"
            )),
            (None, None) => Err(format!("unknown column `{column}`")),
        }
    }
}

/// Binds every column of `expr` within `scope`.
///
/// # Errors
///
/// Returns `InvalidPredicate` carrying `sql` and the resolution failure.
pub fn bind(
    expr: Expr,
    scope: &BindScope<'_>,
    aliases: (&str, &str),
    sql: &str,
) -> Result<Expr<BoundColumn>> {
    expr.try_map_columns(&mut |column: ColumnName| scope.resolve(&column, aliases.0, aliases.1))
        .map_err(|message| TableError::invalid_predicate(sql, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StructField;

    fn schema(names: &[&str]) -> Schema {
        Schema::new(
            names
                .iter()
                .map(|n| StructField::new(*n, DataType::Long, true))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_conjuncts_split_and_rejoin() {
        let expr = parse_expression("a = 1 AND (b = 2 AND c = 3)").unwrap();
        let parts = expr.into_conjuncts();
        assert_eq!(parts.len(), 3);
        let rejoined = Expr::conjunction(parts).unwrap();
        assert_eq!(rejoined.into_conjuncts().len(), 3);
        assert!(Expr::<ColumnName>::conjunction(Vec::new()).is_none());
    }

    #[test]
    fn test_bind_resolves_qualified_and_bare_columns() {
        let target = schema(&["id", "y"]);
        let source = schema(&["id", "z"]);
        let scope = BindScope::both(("t", &target), ("s", &source));

        let bound = bind(
            parse_expression("t.id = s.id AND z > 0").unwrap(),
            &scope,
            ("t", "s"),
            "sql",
        )
        .unwrap();
        let mut columns = Vec::new();
        bound.for_each_column(&mut |c| columns.push(*c));
        assert_eq!(
            columns,
            vec![
                BoundColumn { side: Side::Target, index: 0 },
                BoundColumn { side: Side::Source, index: 0 },
                BoundColumn { side: Side::Source, index: 1 },
            ]
        );
    }

    #[test]
    fn test_bind_reports_ambiguity_and_hidden_sides() {
        let target = schema(&["id"]);
        let source = schema(&["id"]);
        let scope = BindScope::both(("target", &target), ("source", &source));

        let err = bind(parse_expression("id = 1").unwrap(), &scope, ("target", "source"), "id = 1")
            .unwrap_err();
        assert!(matches!(err, TableError::InvalidPredicate { ref message, .. } if message.contains("ambiguous")));

        let source_only = scope.only(Side::Source);
        let err = bind(
            parse_expression("target.id = 1").unwrap(),
            &source_only,
            ("target", "source"),
            "target.id = 1",
        )
        .unwrap_err();
        assert!(matches!(err, TableError::InvalidPredicate { ref message, .. } if message.contains("not available")));
    }

    #[test]
    fn test_bind_is_case_insensitive_fallback() {
        let target = schema(&["CustomerId"]);
        let source = schema(&["other"]);
        let scope = BindScope::both(("target", &target), ("source", &source));
        assert!(bind(
            parse_expression("target.customerid IS NULL").unwrap(),
            &scope,
            ("target", "source"),
            "sql"
        )
        .is_ok());
    }
}
