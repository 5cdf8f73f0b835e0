//! Row-at-a-time evaluation with SQL three-valued logic.
//!
//! `NULL` propagates through comparisons and arithmetic. `AND`/`OR` follow
//! Kleene logic. Division or modulo by zero yields `NULL`. Integer
//! arithmetic is checked; overflow is an evaluation error.

use std::cmp::Ordering;

use super::{BinaryOp, BoundColumn, Expr, ScalarFunction, Side};
use crate::error::{Result, TableError};
use crate::value::{Numeric, Value};

static NULL: Value = Value::Null;

/// Supplies column values to the evaluator.
pub trait ColumnSource {
    /// Returns the value of a bound column, `NULL` if the side is absent.
    fn column(&self, column: &BoundColumn) -> &Value;
}

/// A merge candidate: a target row, a source row, or a matched pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeRow<'a> {
    /// Target row, if any.
    pub target: Option<&'a [Value]>,
    /// Source row, if any.
    pub source: Option<&'a [Value]>,
}

impl<'a> MergeRow<'a> {
    /// A matched pair.
    #[must_use]
    pub fn pair(target: &'a [Value], source: &'a [Value]) -> Self {
        Self {
            target: Some(target),
            source: Some(source),
        }
    }

    /// A source row with no target match.
    #[must_use]
    pub fn source_only(source: &'a [Value]) -> Self {
        Self {
            target: None,
            source: Some(source),
        }
    }

    /// A target row with no source match.
    #[must_use]
    pub fn target_only(target: &'a [Value]) -> Self {
        Self {
            target: Some(target),
            source: None,
        }
    }
}

impl ColumnSource for MergeRow<'_> {
    fn column(&self, column: &BoundColumn) -> &Value {
        let side = match column.side {
            Side::Target => self.target,
            Side::Source => self.source,
        };
        side.and_then(|row| row.get(column.index)).unwrap_or(&NULL)
    }
}

impl Expr<BoundColumn> {
    /// Evaluates the expression against one row.
    ///
    /// # Errors
    ///
    /// Returns `Evaluation` for type errors, overflow, and failed casts.
    pub fn evaluate(&self, row: &dyn ColumnSource) -> Result<Value> {
        match self {
            Expr::Column(column) => Ok(row.column(column).clone()),
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Binary { left, op, right } => match op {
                BinaryOp::And => {
                    let l = truth(left.evaluate(row)?)?;
                    if l == Some(false) {
                        return Ok(Value::Boolean(false));
                    }
                    let r = truth(right.evaluate(row)?)?;
                    Ok(match (l, r) {
                        (_, Some(false)) => Value::Boolean(false),
                        (Some(true), Some(true)) => Value::Boolean(true),
                        _ => Value::Null,
                    })
                }
                BinaryOp::Or => {
                    let l = truth(left.evaluate(row)?)?;
                    if l == Some(true) {
                        return Ok(Value::Boolean(true));
                    }
                    let r = truth(right.evaluate(row)?)?;
                    Ok(match (l, r) {
                        (_, Some(true)) => Value::Boolean(true),
                        (Some(false), Some(false)) => Value::Boolean(false),
                        _ => Value::Null,
                    })
                }
                BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq => compare(*op, &left.evaluate(row)?, &right.evaluate(row)?),
                BinaryOp::Concat => {
                    let (l, r) = (left.evaluate(row)?, right.evaluate(row)?);
                    if l.is_null() || r.is_null() {
                        Ok(Value::Null)
                    } else {
                        Ok(Value::String(format!("{l}{r}")))
                    }
                }
                BinaryOp::Plus
                | BinaryOp::Minus
                | BinaryOp::Multiply
                | BinaryOp::Divide
                | BinaryOp::Modulo => arithmetic(*op, &left.evaluate(row)?, &right.evaluate(row)?),
            },
            Expr::Not(inner) => Ok(match truth(inner.evaluate(row)?)? {
                Some(b) => Value::Boolean(!b),
                None => Value::Null,
            }),
            Expr::Negate(inner) => negate(inner.evaluate(row)?),
            Expr::IsNull { expr, negated } => {
                Ok(Value::Boolean(expr.evaluate(row)?.is_null() != *negated))
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let value = expr.evaluate(row)?;
                let above = truth(compare(BinaryOp::GtEq, &value, &low.evaluate(row)?)?)?;
                let below = truth(compare(BinaryOp::LtEq, &value, &high.evaluate(row)?)?)?;
                let within = match (above, below) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                };
                Ok(within.map_or(Value::Null, |w| Value::Boolean(w != *negated)))
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let value = expr.evaluate(row)?;
                if value.is_null() {
                    return Ok(Value::Null);
                }
                let mut saw_null = false;
                for candidate in list {
                    match truth(compare(BinaryOp::Eq, &value, &candidate.evaluate(row)?)?)? {
                        Some(true) => return Ok(Value::Boolean(!*negated)),
                        Some(false) => {}
                        None => saw_null = true,
                    }
                }
                Ok(if saw_null {
                    Value::Null
                } else {
                    Value::Boolean(*negated)
                })
            }
            Expr::Like {
                expr,
                pattern,
                negated,
                case_insensitive,
            } => {
                let (value, pattern) = (expr.evaluate(row)?, pattern.evaluate(row)?);
                match (&value, &pattern) {
                    (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                    (Value::String(text), Value::String(pattern)) => {
                        let matched = if *case_insensitive {
                            like_match(&text.to_lowercase(), &pattern.to_lowercase())
                        } else {
                            like_match(text, pattern)
                        };
                        Ok(Value::Boolean(matched != *negated))
                    }
                    _ => Err(TableError::evaluation(format!(
                        "LIKE requires strings, got {value:?} and {pattern:?}"
                    ))),
                }
            }
            Expr::Case {
                operand,
                branches,
                else_result,
            } => {
                let operand = operand.as_ref().map(|o| o.evaluate(row)).transpose()?;
                for (when, then) in branches {
                    let candidate = when.evaluate(row)?;
                    let hit = match &operand {
                        Some(operand) => {
                            truth(compare(BinaryOp::Eq, operand, &candidate)?)? == Some(true)
                        }
                        None => truth(candidate)? == Some(true),
                    };
                    if hit {
                        return then.evaluate(row);
                    }
                }
                else_result
                    .as_ref()
                    .map_or(Ok(Value::Null), |e| e.evaluate(row))
            }
            Expr::Cast { expr, data_type } => expr
                .evaluate(row)?
                .cast_truncating(data_type)
                .map_err(|e| TableError::evaluation(e.to_string())),
            Expr::Function { func, args } => {
                let args = args
                    .iter()
                    .map(|a| a.evaluate(row))
                    .collect::<Result<Vec<_>>>()?;
                call(*func, args)
            }
        }
    }

    /// Evaluates a predicate; `NULL` counts as false.
    ///
    /// # Errors
    ///
    /// Returns `Evaluation` if the result is not a boolean.
    pub fn evaluate_predicate(&self, row: &dyn ColumnSource) -> Result<bool> {
        Ok(truth(self.evaluate(row)?)? == Some(true))
    }
}

fn truth(value: Value) -> Result<Option<bool>> {
    match value {
        Value::Null => Ok(None),
        Value::Boolean(b) => Ok(Some(b)),
        other => Err(TableError::evaluation(format!(
            "expected a boolean, got {other:?}"
        ))),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    let ordering = left.compare(right).ok_or_else(|| {
        TableError::evaluation(format!("cannot compare {left:?} with {right:?}"))
    })?;
    let result = match op {
        BinaryOp::Eq => ordering == Ordering::Equal,
        BinaryOp::NotEq => ordering != Ordering::Equal,
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::LtEq => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::GtEq => ordering != Ordering::Less,
        other => {
            return Err(TableError::evaluation(format!(
                "{other:?} is not a comparison"
            )));
        }
    };
    Ok(Value::Boolean(result))
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    let (Some(a), Some(b)) = (left.numeric(), right.numeric()) else {
        return Err(TableError::evaluation(format!(
            "{op:?} requires numbers, got {left:?} and {right:?}"
        )));
    };
    let overflow = || TableError::evaluation(format!("{op:?} overflowed on {left} and {right}"));

    match (a, b) {
        (Numeric::Int(x), Numeric::Int(y)) => {
            let result = match op {
                BinaryOp::Plus => x.checked_add(y),
                BinaryOp::Minus => x.checked_sub(y),
                BinaryOp::Multiply => x.checked_mul(y),
                BinaryOp::Divide | BinaryOp::Modulo if y == 0 => return Ok(Value::Null),
                BinaryOp::Divide => x.checked_div(y),
                BinaryOp::Modulo => x.checked_rem(y),
                _ => None,
            }
            .ok_or_else(overflow)?;
            i64::try_from(result).map(Value::Long).map_err(|_| overflow())
        }
        (Numeric::Float(_), _) | (_, Numeric::Float(_)) => {
            let (x, y) = (a.to_f64(), b.to_f64());
            let result = match op {
                BinaryOp::Plus => x + y,
                BinaryOp::Minus => x - y,
                BinaryOp::Multiply => x * y,
                BinaryOp::Divide | BinaryOp::Modulo if y == 0.0 => return Ok(Value::Null),
                BinaryOp::Divide => x / y,
                BinaryOp::Modulo => x % y,
                _ => return Err(overflow()),
            };
            Ok(Value::Double(result))
        }
        _ => decimal_arithmetic(op, a, b).ok_or_else(overflow),
    }
}

fn decimal_arithmetic(op: BinaryOp, a: Numeric, b: Numeric) -> Option<Value> {
    let decimal = |value: i128, scale: i8| Value::Decimal {
        value,
        precision: crate::schema::MAX_DECIMAL_PRECISION,
        scale,
    };
    match op {
        BinaryOp::Plus | BinaryOp::Minus => {
            let (x, y, scale) = a.align(b)?;
            let value = if op == BinaryOp::Plus {
                x.checked_add(y)?
            } else {
                x.checked_sub(y)?
            };
            Some(decimal(value, scale))
        }
        BinaryOp::Multiply => {
            let (Numeric::Int(x) | Numeric::Decimal(x, _), Numeric::Int(y) | Numeric::Decimal(y, _)) =
                (a, b)
            else {
                return None;
            };
            let scale = decimal_scale(a) + decimal_scale(b);
            let value = x.checked_mul(y)?;
            let max = i8::try_from(crate::schema::MAX_DECIMAL_PRECISION).ok()?;
            if scale > max {
                Some(Value::Double(a.to_f64() * b.to_f64()))
            } else {
                Some(decimal(value, scale))
            }
        }
        BinaryOp::Divide | BinaryOp::Modulo => {
            let y = b.to_f64();
            if y == 0.0 {
                return Some(Value::Null);
            }
            let x = a.to_f64();
            Some(Value::Double(if op == BinaryOp::Divide { x / y } else { x % y }))
        }
        _ => None,
    }
}

fn decimal_scale(n: Numeric) -> i8 {
    match n {
        Numeric::Decimal(_, scale) => scale,
        _ => 0,
    }
}

fn negate(value: Value) -> Result<Value> {
    let overflow = || TableError::evaluation("negation overflowed");
    Ok(match value {
        Value::Null => Value::Null,
        Value::Byte(v) => Value::Byte(v.checked_neg().ok_or_else(overflow)?),
        Value::Short(v) => Value::Short(v.checked_neg().ok_or_else(overflow)?),
        Value::Integer(v) => Value::Integer(v.checked_neg().ok_or_else(overflow)?),
        Value::Long(v) => Value::Long(v.checked_neg().ok_or_else(overflow)?),
        Value::Float(v) => Value::Float(-v),
        Value::Double(v) => Value::Double(-v),
        Value::Decimal {
            value,
            precision,
            scale,
        } => Value::Decimal {
            value: -value,
            precision,
            scale,
        },
        other => {
            return Err(TableError::evaluation(format!(
                "cannot negate {other:?}"
            )));
        }
    })
}

fn call(func: ScalarFunction, mut args: Vec<Value>) -> Result<Value> {
    let string_arg = |value: &Value| -> Result<Option<String>> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            other => Err(TableError::evaluation(format!(
                "{func:?} requires a string, got {other:?}"
            ))),
        }
    };

    match func {
        ScalarFunction::Coalesce => Ok(args
            .into_iter()
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null)),
        ScalarFunction::NullIf => {
            let right = args.pop().unwrap_or(Value::Null);
            let left = args.pop().unwrap_or(Value::Null);
            let equal = truth(compare(BinaryOp::Eq, &left, &right)?)? == Some(true);
            Ok(if equal { Value::Null } else { left })
        }
        ScalarFunction::Abs => {
            let value = args.into_iter().next().unwrap_or(Value::Null);
            match value.numeric() {
                None if value.is_null() => Ok(Value::Null),
                None => Err(TableError::evaluation(format!(
                    "abs requires a number, got {value:?}"
                ))),
                Some(n) => {
                    let negative = n.to_f64() < 0.0;
                    if negative {
                        negate(value)
                    } else {
                        Ok(value)
                    }
                }
            }
        }
        ScalarFunction::Round => {
            let digits = match args.get(1) {
                Some(Value::Null) => return Ok(Value::Null),
                Some(v) => i32::try_from(
                    v.numeric()
                        .and_then(|n| match n {
                            Numeric::Int(i) => Some(i),
                            _ => None,
                        })
                        .ok_or_else(|| {
                            TableError::evaluation("round digits must be an integer")
                        })?,
                )
                .map_err(|_| TableError::evaluation("round digits out of range"))?,
                None => 0,
            };
            let value = args.into_iter().next().unwrap_or(Value::Null);
            round(value, digits)
        }
        ScalarFunction::Upper => Ok(string_arg(args.first().unwrap_or(&Value::Null))?
            .map_or(Value::Null, |s| Value::String(s.to_uppercase()))),
        ScalarFunction::Lower => Ok(string_arg(args.first().unwrap_or(&Value::Null))?
            .map_or(Value::Null, |s| Value::String(s.to_lowercase()))),
        ScalarFunction::Trim => Ok(string_arg(args.first().unwrap_or(&Value::Null))?
            .map_or(Value::Null, |s| Value::String(s.trim().to_string()))),
        ScalarFunction::Length => Ok(string_arg(args.first().unwrap_or(&Value::Null))?
            .map_or(Value::Null, |s| {
                Value::Long(i64::try_from(s.chars().count()).unwrap_or(i64::MAX))
            })),
        ScalarFunction::Concat => Ok(Value::String(
            args.iter()
                .filter(|v| !v.is_null())
                .map(ToString::to_string)
                .collect(),
        )),
    }
}

fn round(value: Value, digits: i32) -> Result<Value> {
    Ok(match value {
        Value::Double(v) => {
            let factor = 10_f64.powi(digits);
            Value::Double((v * factor).round() / factor)
        }
        Value::Float(v) => {
            let factor = 10_f32.powi(digits);
            Value::Float((v * factor).round() / factor)
        }
        Value::Decimal {
            value,
            precision,
            scale,
        } if i32::from(scale) > digits.max(0) => {
            let drop = u32::try_from(i32::from(scale) - digits.max(0))
                .map_err(|_| TableError::evaluation("round digits out of range"))?;
            let factor = 10_i128
                .checked_pow(drop)
                .ok_or_else(|| TableError::evaluation("round digits out of range"))?;
            let (quotient, remainder) = (value / factor, value % factor);
            let adjust = if remainder.abs() * 2 >= factor {
                value.signum()
            } else {
                0
            };
            Value::Decimal {
                value: (quotient + adjust) * factor,
                precision,
                scale,
            }
        }
        Value::Null
        | Value::Byte(_)
        | Value::Short(_)
        | Value::Integer(_)
        | Value::Long(_)
        | Value::Decimal { .. } => value,
        other => {
            return Err(TableError::evaluation(format!(
                "round requires a number, got {other:?}"
            )));
        }
    })
}

/// SQL `LIKE` matching with `%` (any run) and `_` (one character).
fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}
