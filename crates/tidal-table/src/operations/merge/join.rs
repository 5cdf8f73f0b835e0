//! Join planning for merge: hash keys, residual predicate, file pruning.

use std::collections::HashMap;

use crate::expr::{BinaryOp, BoundColumn, Expr, Side};
use crate::log::AddFile;
use crate::schema::{DataType, Schema};
use crate::value::{KeyValue, Row, Value};

/// Types whose join keys hash consistently with `Value::compare` equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyClass {
    Bool,
    Int,
    Float,
    Decimal,
    Str,
    Bytes,
    Date,
    Timestamp,
    TimestampNtz,
}

impl KeyClass {
    fn of(data_type: &DataType) -> Self {
        match data_type {
            DataType::Boolean => Self::Bool,
            DataType::Byte | DataType::Short | DataType::Integer | DataType::Long => Self::Int,
            DataType::Float | DataType::Double => Self::Float,
            DataType::Decimal { .. } => Self::Decimal,
            DataType::String => Self::Str,
            DataType::Binary => Self::Bytes,
            DataType::Date => Self::Date,
            DataType::Timestamp => Self::Timestamp,
            DataType::TimestampNtz => Self::TimestampNtz,
        }
    }

    fn hashes_with(self, other: Self) -> bool {
        self == other
            || matches!(
                (self, other),
                (Self::Int, Self::Float | Self::Decimal) | (Self::Float | Self::Decimal, Self::Int)
            )
    }
}

/// The join predicate split into equi-join keys and a residual.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct JoinPlan {
    /// Target column positions of the key equalities.
    pub target_keys: Vec<usize>,
    /// Source column positions, parallel to `target_keys`.
    pub source_keys: Vec<usize>,
    /// Conjuncts that are not hash keys; evaluated per candidate pair.
    pub residual: Option<Expr<BoundColumn>>,
    /// `target.col = literal` conjuncts, used for file pruning.
    pub target_literals: Vec<(usize, Value)>,
}

impl JoinPlan {
    pub(super) fn new(predicate: Expr<BoundColumn>, target: &Schema, source: &Schema) -> Self {
        let mut plan = Self {
            target_keys: Vec::new(),
            source_keys: Vec::new(),
            residual: None,
            target_literals: Vec::new(),
        };
        let mut residual = Vec::new();
        for conjunct in predicate.into_conjuncts() {
            if let Some((t, s)) = key_pair(&conjunct, target, source) {
                plan.target_keys.push(t);
                plan.source_keys.push(s);
                continue;
            }
            if let Some(literal) = target_literal(&conjunct) {
                plan.target_literals.push(literal);
            }
            residual.push(conjunct);
        }
        plan.residual = Expr::conjunction(residual);
        plan
    }

    /// Whether `file` may contain a row satisfying the literal conjuncts on
    /// partition columns.
    pub(super) fn may_match(&self, file: &AddFile, target: &Schema, partition_columns: &[String]) -> bool {
        self.target_literals.iter().all(|(index, literal)| {
            let field = &target.fields()[*index];
            if !partition_columns.contains(&field.name) {
                return true;
            }
            let raw = file.partition_values.get(&field.name).and_then(Option::as_deref);
            match Value::from_partition_value(raw, &field.data_type) {
                Ok(value) => value.compare(literal) == Some(std::cmp::Ordering::Equal),
                Err(_) => true,
            }
        })
    }
}

fn key_pair(conjunct: &Expr<BoundColumn>, target: &Schema, source: &Schema) -> Option<(usize, usize)> {
    let Expr::Binary {
        left,
        op: BinaryOp::Eq,
        right,
    } = conjunct
    else {
        return None;
    };
    let (Expr::Column(a), Expr::Column(b)) = (left.as_ref(), right.as_ref()) else {
        return None;
    };
    let (t, s) = match (a.side, b.side) {
        (Side::Target, Side::Source) => (a.index, b.index),
        (Side::Source, Side::Target) => (b.index, a.index),
        _ => return None,
    };
    let t_class = KeyClass::of(&target.fields()[t].data_type);
    let s_class = KeyClass::of(&source.fields()[s].data_type);
    t_class.hashes_with(s_class).then_some((t, s))
}

fn target_literal(conjunct: &Expr<BoundColumn>) -> Option<(usize, Value)> {
    let Expr::Binary {
        left,
        op: BinaryOp::Eq,
        right,
    } = conjunct
    else {
        return None;
    };
    match (left.as_ref(), right.as_ref()) {
        (Expr::Column(c), Expr::Literal(v)) | (Expr::Literal(v), Expr::Column(c))
            if c.side == Side::Target =>
        {
            Some((c.index, v.clone()))
        }
        _ => None,
    }
}

/// Position of a target row: (file, row within file).
pub(super) type RowId = (usize, usize);

/// Candidate lookup over the target rows.
#[derive(Debug)]
pub(super) enum TargetIndex {
    /// Rows bucketed by their key values; rows with a `NULL` key are absent.
    Hash {
        source_keys: Vec<usize>,
        buckets: HashMap<Vec<KeyValue>, Vec<RowId>>,
    },
    /// Every row is a candidate for every source row.
    NestedLoop(Vec<RowId>),
}

impl TargetIndex {
    pub(super) fn build(plan: &JoinPlan, files: &[Vec<Row>]) -> Self {
        let ids = files
            .iter()
            .enumerate()
            .flat_map(|(f, rows)| (0..rows.len()).map(move |r| (f, r)));
        if plan.target_keys.is_empty() {
            return Self::NestedLoop(ids.collect());
        }
        let mut buckets: HashMap<Vec<KeyValue>, Vec<RowId>> = HashMap::new();
        for (f, r) in ids {
            if let Some(key) = row_key(&files[f][r], &plan.target_keys) {
                buckets.entry(key).or_default().push((f, r));
            }
        }
        Self::Hash {
            source_keys: plan.source_keys.clone(),
            buckets,
        }
    }

    /// Target rows that may join with `source`.
    pub(super) fn candidates(&self, source: &[Value]) -> &[RowId] {
        match self {
            Self::Hash {
                source_keys,
                buckets,
            } => row_key(source, source_keys)
                .and_then(|key| buckets.get(&key))
                .map_or(&[][..], Vec::as_slice),
            Self::NestedLoop(all) => all,
        }
    }
}

fn row_key(row: &[Value], columns: &[usize]) -> Option<Vec<KeyValue>> {
    columns
        .iter()
        .map(|&i| row.get(i).and_then(Value::hash_key))
        .collect()
}
