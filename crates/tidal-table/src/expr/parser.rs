//! SQL expression front-end.
//!
//! Uses `sqlparser`'s generic dialect to parse a single expression and
//! lowers the AST into [`Expr`]. Anything outside the supported subset is
//! rejected with `InvalidPredicate`.

use sqlparser::ast::{
    BinaryOperator, Expr as SqlExpr, FunctionArg, FunctionArgExpr, FunctionArguments,
    ObjectNamePart, UnaryOperator, Value as SqlValue, ValueWithSpan,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use super::{BinaryOp, ColumnName, Expr, ScalarFunction};
use crate::error::{Result, TableError};
use crate::schema::DataType;
use crate::value::Value;

/// Parses one scalar expression.
///
/// # Errors
///
/// Returns `InvalidPredicate` for empty input, syntax errors, trailing
/// tokens, and unsupported constructs.
pub fn parse_expression(sql: &str) -> Result<Expr> {
    if sql.trim().is_empty() {
        return Err(TableError::invalid_predicate(sql, "expression is empty"));
    }

    let dialect = GenericDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(sql)
        .map_err(|e| TableError::invalid_predicate(sql, e.to_string()))?;
    let ast = parser
        .parse_expr()
        .map_err(|e| TableError::invalid_predicate(sql, e.to_string()))?;
    let next = parser.peek_token();
    if next.token != Token::EOF {
        return Err(TableError::invalid_predicate(
            sql,
            format!("unexpected `{}` after expression", next.token),
        ));
    }

    lower(&ast).map_err(|message| TableError::invalid_predicate(sql, message))
}

/// Parses one expression that must yield a boolean.
///
/// # Errors
///
/// Returns `InvalidPredicate` if parsing fails or the root cannot be
/// boolean (e.g. `a + 1`).
pub fn parse_predicate(sql: &str) -> Result<Expr> {
    let expr = parse_expression(sql)?;
    if !expr.is_predicate_shaped() {
        return Err(TableError::invalid_predicate(
            sql,
            "expression does not produce a boolean",
        ));
    }
    Ok(expr)
}

type Lowered = std::result::Result<Expr, String>;

fn lower_box(expr: &SqlExpr) -> std::result::Result<Box<Expr>, String> {
    lower(expr).map(Box::new)
}

fn lower(expr: &SqlExpr) -> Lowered {
    match expr {
        SqlExpr::Identifier(ident) => Ok(Expr::Column(ColumnName::bare(&ident.value))),
        SqlExpr::CompoundIdentifier(parts) => match parts.as_slice() {
            [qualifier, name] => Ok(Expr::Column(ColumnName {
                qualifier: Some(qualifier.value.clone()),
                name: name.value.clone(),
            })),
            _ => Err(format!(
                "column references take the form alias.column, got `{expr}`"
            )),
        },
        SqlExpr::Value(value) => lower_value(value).map(Expr::Literal),
        SqlExpr::Nested(inner) => lower(inner),
        SqlExpr::UnaryOp { op, expr: inner } => match op {
            UnaryOperator::Not => Ok(Expr::Not(lower_box(inner)?)),
            UnaryOperator::Minus => match lower(inner)? {
                Expr::Literal(Value::Long(v)) => Ok(Expr::Literal(Value::Long(-v))),
                Expr::Literal(Value::Double(v)) => Ok(Expr::Literal(Value::Double(-v))),
                other => Ok(Expr::Negate(Box::new(other))),
            },
            UnaryOperator::Plus => lower(inner),
            other => Err(format!("unsupported unary operator `{other}`")),
        },
        SqlExpr::BinaryOp { left, op, right } => {
            let op = match op {
                BinaryOperator::And => BinaryOp::And,
                BinaryOperator::Or => BinaryOp::Or,
                BinaryOperator::Eq => BinaryOp::Eq,
                BinaryOperator::NotEq => BinaryOp::NotEq,
                BinaryOperator::Lt => BinaryOp::Lt,
                BinaryOperator::LtEq => BinaryOp::LtEq,
                BinaryOperator::Gt => BinaryOp::Gt,
                BinaryOperator::GtEq => BinaryOp::GtEq,
                BinaryOperator::Plus => BinaryOp::Plus,
                BinaryOperator::Minus => BinaryOp::Minus,
                BinaryOperator::Multiply => BinaryOp::Multiply,
                BinaryOperator::Divide => BinaryOp::Divide,
                BinaryOperator::Modulo => BinaryOp::Modulo,
                BinaryOperator::StringConcat => BinaryOp::Concat,
                other => return Err(format!("unsupported operator `{other}`")),
            };
            Ok(Expr::Binary {
                left: lower_box(left)?,
                op,
                right: lower_box(right)?,
            })
        }
        SqlExpr::IsNull(inner) => Ok(Expr::IsNull {
            expr: lower_box(inner)?,
            negated: false,
        }),
        SqlExpr::IsNotNull(inner) => Ok(Expr::IsNull {
            expr: lower_box(inner)?,
            negated: true,
        }),
        SqlExpr::Between {
            expr: inner,
            negated,
            low,
            high,
        } => Ok(Expr::Between {
            expr: lower_box(inner)?,
            low: lower_box(low)?,
            high: lower_box(high)?,
            negated: *negated,
        }),
        SqlExpr::InList {
            expr: inner,
            list,
            negated,
        } => Ok(Expr::InList {
            expr: lower_box(inner)?,
            list: list.iter().map(lower).collect::<std::result::Result<_, _>>()?,
            negated: *negated,
        }),
        SqlExpr::Like {
            negated,
            expr: inner,
            pattern,
            escape_char,
            ..
        } => lower_like(inner, pattern, *negated, false, escape_char.is_some()),
        SqlExpr::ILike {
            negated,
            expr: inner,
            pattern,
            escape_char,
            ..
        } => lower_like(inner, pattern, *negated, true, escape_char.is_some()),
        SqlExpr::Case {
            operand,
            conditions,
            else_result,
            ..
        } => Ok(Expr::Case {
            operand: operand.as_deref().map(lower_box).transpose()?,
            branches: conditions
                .iter()
                .map(|when| Ok((lower(&when.condition)?, lower(&when.result)?)))
                .collect::<std::result::Result<_, String>>()?,
            else_result: else_result.as_deref().map(lower_box).transpose()?,
        }),
        SqlExpr::Cast {
            expr: inner,
            data_type,
            ..
        } => {
            let name = data_type.to_string().to_ascii_lowercase();
            let target: DataType = name
                .parse()
                .map_err(|_| format!("unsupported cast target type `{data_type}`"))?;
            Ok(Expr::Cast {
                expr: lower_box(inner)?,
                data_type: target,
            })
        }
        SqlExpr::Function(function) => {
            let name = match function.name.0.as_slice() {
                [ObjectNamePart::Identifier(ident)] => ident.value.clone(),
                _ => return Err(format!("unsupported function `{}`", function.name)),
            };
            let func = ScalarFunction::from_name(&name)
                .ok_or_else(|| format!("unknown function `{name}`"))?;
            let args = match &function.args {
                FunctionArguments::List(list) => list
                    .args
                    .iter()
                    .map(|arg| match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => lower(e),
                        other => Err(format!("unsupported argument `{other}` to {name}")),
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?,
                FunctionArguments::None => Vec::new(),
                _ => return Err(format!("unsupported arguments to {name}")),
            };
            let (min, max) = func.arity();
            if args.len() < min || max.is_some_and(|max| args.len() > max) {
                return Err(format!(
                    "{name} takes {} arguments, got {}",
                    match max {
                        Some(max) if max == min => min.to_string(),
                        Some(max) => format!("{min} to {max}"),
                        None => format!("at least {min}"),
                    },
                    args.len()
                ));
            }
            Ok(Expr::Function { func, args })
        }
        SqlExpr::Trim {
            expr: inner,
            trim_where: None,
            trim_what: None,
            ..
        } => Ok(Expr::Function {
            func: ScalarFunction::Trim,
            args: vec![lower(inner)?],
        }),
        other => Err(format!("unsupported expression `{other}`")),
    }
}

fn lower_like(
    expr: &SqlExpr,
    pattern: &SqlExpr,
    negated: bool,
    case_insensitive: bool,
    has_escape: bool,
) -> Lowered {
    if has_escape {
        return Err("LIKE ... ESCAPE is not supported".into());
    }
    Ok(Expr::Like {
        expr: lower_box(expr)?,
        pattern: lower_box(pattern)?,
        negated,
        case_insensitive,
    })
}

fn lower_value(value: &ValueWithSpan) -> std::result::Result<Value, String> {
    match &value.value {
        SqlValue::Number(text, _) => {
            if text.contains(['.', 'e', 'E']) {
                text.parse::<f64>()
                    .map(Value::Double)
                    .map_err(|e| format!("invalid number `{text}`: {e}"))
            } else {
                text.parse::<i64>()
                    .map(Value::Long)
                    .map_err(|e| format!("invalid integer `{text}`: {e}"))
            }
        }
        SqlValue::SingleQuotedString(s) => Ok(Value::String(s.clone())),
        SqlValue::Boolean(b) => Ok(Value::Boolean(*b)),
        SqlValue::Null => Ok(Value::Null),
        other => Err(format!("unsupported literal `{other}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_join_predicate() {
        let expr = parse_predicate("target.x = source.x AND target.p = 'a'").unwrap();
        let conjuncts = expr.into_conjuncts();
        assert_eq!(conjuncts.len(), 2);
        assert!(matches!(
            &conjuncts[0],
            Expr::Binary { op: BinaryOp::Eq, left, .. }
                if **left == Expr::Column(ColumnName { qualifier: Some("target".into()), name: "x".into() })
        ));
    }

    #[test]
    fn test_rejects_empty_and_trailing_input() {
        assert!(matches!(
            parse_predicate("   "),
            Err(TableError::InvalidPredicate { .. })
        ));
        assert!(matches!(
            parse_predicate("a = 1, b = 2"),
            Err(TableError::InvalidPredicate { .. })
        ));
        assert!(matches!(
            parse_predicate("a = "),
            Err(TableError::InvalidPredicate { .. })
        ));
    }

    #[test]
    fn test_rejects_non_boolean_predicates() {
        assert!(parse_expression("a + 1").is_ok());
        assert!(parse_predicate("a + 1").is_err());
        assert!(parse_predicate("coalesce(a, false)").is_ok());
    }

    #[test]
    fn test_lowers_case_cast_and_functions() {
        let expr = parse_expression(
            "CASE WHEN s.y > 10 THEN CAST(s.y AS BIGINT) ELSE coalesce(t.y, 0) END",
        )
        .unwrap();
        let Expr::Case { branches, else_result, .. } = expr else {
            panic!("expected CASE");
        };
        assert_eq!(branches.len(), 1);
        assert!(matches!(branches[0].1, Expr::Cast { data_type: DataType::Long, .. }));
        assert!(matches!(
            else_result.as_deref(),
            Some(Expr::Function { func: ScalarFunction::Coalesce, .. })
        ));
    }

    #[test]
    fn test_negative_literals_fold() {
        assert_eq!(
            parse_expression("-5").unwrap(),
            Expr::Literal(Value::Long(-5))
        );
    }

    #[test]
    fn test_rejects_unknown_functions_and_arity() {
        assert!(parse_expression("frobnicate(a)").is_err());
        assert!(parse_expression("nullif(a)").is_err());
        assert!(parse_expression("(SELECT 1)").is_err());
    }
}
