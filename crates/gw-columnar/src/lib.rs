#![forbid(unsafe_code)]

use std::cmp::Ordering;

use gw_types::{DType, NullKind, Scalar, TypeError, cast_scalar, common_dtype, infer_dtype};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityMask {
    bits: Vec<bool>,
}

impl ValidityMask {
    #[must_use]
    pub fn from_values(values: &[Scalar]) -> Self {
        let bits = values.iter().map(|value| !value.is_missing()).collect();
        Self { bits }
    }

    #[must_use]
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    dtype: DType,
    values: Vec<Scalar>,
    validity: ValidityMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColumnError {
    #[error("column length mismatch: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("row {row} out of bounds for column of length {len}")]
    RowOutOfBounds { row: usize, len: usize },
    #[error("logical operation requires bool columns, found {dtype:?}")]
    NotLogical { dtype: DType },
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Length two columns combine to: equal lengths pass through, a length-1
/// side recycles to the other side, anything else is a mismatch.
fn recycled_len(left: usize, right: usize) -> Result<usize, ColumnError> {
    match (left, right) {
        (l, r) if l == r => Ok(l),
        (1, r) => Ok(r),
        (l, 1) => Ok(l),
        (l, r) => Err(ColumnError::LengthMismatch { left: l, right: r }),
    }
}

fn recycled(values: &[Scalar], idx: usize) -> &Scalar {
    if values.len() == 1 { &values[0] } else { &values[idx] }
}

impl Column {
    /// Construct a column, coercing values to the target dtype. Takes the
    /// values vec by move so already-conforming scalars are not cloned.
    pub fn new(dtype: DType, values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let needs_coercion = values.iter().any(|v| {
            let d = v.dtype();
            d != dtype && d != DType::Null
        });

        let coerced = if needs_coercion {
            values
                .into_iter()
                .map(|value| cast_scalar(value, dtype))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            // Values already match; only remap Null variants to the
            // dtype-specific missing marker.
            values
                .into_iter()
                .map(|value| match value {
                    Scalar::Null(_) => Scalar::missing_for_dtype(dtype),
                    other => other,
                })
                .collect()
        };

        let validity = ValidityMask::from_values(&coerced);

        Ok(Self {
            dtype,
            values: coerced,
            validity,
        })
    }

    pub fn from_values(values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let dtype = infer_dtype(&values)?;
        Self::new(dtype, values)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<&Scalar> {
        self.values.get(idx)
    }

    #[must_use]
    pub fn validity(&self) -> &ValidityMask {
        &self.validity
    }

    /// Positional subset. Strict by contract: an out-of-range row is an
    /// error, never a missing value, because callers hand in row sets they
    /// have already validated against the source length.
    pub fn take(&self, rows: &[usize]) -> Result<Self, ColumnError> {
        let mut values = Vec::with_capacity(rows.len());
        for &row in rows {
            let value = self
                .values
                .get(row)
                .ok_or(ColumnError::RowOutOfBounds { row, len: self.values.len() })?;
            values.push(value.clone());
        }
        Self::new(self.dtype, values)
    }

    pub fn binary_numeric(&self, right: &Self, op: ArithmeticOp) -> Result<Self, ColumnError> {
        let out_len = recycled_len(self.len(), right.len())?;

        let mut out_dtype = common_dtype(self.dtype, right.dtype)?;
        if matches!(out_dtype, DType::Bool) {
            out_dtype = DType::Int64;
        }
        if matches!(op, ArithmeticOp::Div) {
            out_dtype = DType::Float64;
        }

        let mut values = Vec::with_capacity(out_len);
        for idx in 0..out_len {
            let left = recycled(&self.values, idx);
            let rhs = recycled(&right.values, idx);

            if left.is_missing() || rhs.is_missing() {
                values.push(Scalar::missing_for_dtype(out_dtype));
                continue;
            }

            let result = {
                let lhs = left.to_f64()?;
                let rhs = rhs.to_f64()?;
                match op {
                    ArithmeticOp::Add => lhs + rhs,
                    ArithmeticOp::Sub => lhs - rhs,
                    ArithmeticOp::Mul => lhs * rhs,
                    ArithmeticOp::Div => lhs / rhs,
                }
            };

            if matches!(out_dtype, DType::Int64)
                && result.is_finite()
                && result == result.trunc()
                && result >= i64::MIN as f64
                && result <= i64::MAX as f64
            {
                values.push(Scalar::Int64(result as i64));
            } else {
                values.push(Scalar::Float64(result));
            }
        }

        Self::new(out_dtype, values)
    }

    /// Element-wise comparison producing a bool column. Numeric dtypes
    /// compare through f64, strings lexicographically; a missing operand
    /// yields a missing result.
    pub fn compare(&self, right: &Self, op: CompareOp) -> Result<Self, ColumnError> {
        let out_len = recycled_len(self.len(), right.len())?;
        common_dtype(self.dtype, right.dtype)?;

        let mut values = Vec::with_capacity(out_len);
        for idx in 0..out_len {
            let left = recycled(&self.values, idx);
            let rhs = recycled(&right.values, idx);

            if left.is_missing() || rhs.is_missing() {
                values.push(Scalar::Null(NullKind::Null));
                continue;
            }

            let ordering = match (left, rhs) {
                (Scalar::Utf8(a), Scalar::Utf8(b)) => a.cmp(b),
                // Non-missing operands are never NaN, so total_cmp agrees
                // with the partial order.
                _ => left.to_f64()?.total_cmp(&rhs.to_f64()?),
            };

            let keep = match op {
                CompareOp::Eq => ordering == Ordering::Equal,
                CompareOp::Ne => ordering != Ordering::Equal,
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Le => ordering != Ordering::Greater,
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::Ge => ordering != Ordering::Less,
            };
            values.push(Scalar::Bool(keep));
        }

        Self::new(DType::Bool, values)
    }

    /// Three-valued AND: false dominates missing.
    pub fn and(&self, right: &Self) -> Result<Self, ColumnError> {
        self.kleene(right, |left, rhs| match (left, rhs) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        })
    }

    /// Three-valued OR: true dominates missing.
    pub fn or(&self, right: &Self) -> Result<Self, ColumnError> {
        self.kleene(right, |left, rhs| match (left, rhs) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        })
    }

    pub fn not(&self) -> Result<Self, ColumnError> {
        if !self.dtype.is_logical() {
            return Err(ColumnError::NotLogical { dtype: self.dtype });
        }
        let values = self
            .values
            .iter()
            .map(|value| match value {
                Scalar::Bool(v) => Scalar::Bool(!v),
                _ => Scalar::Null(NullKind::Null),
            })
            .collect();
        Self::new(DType::Bool, values)
    }

    fn kleene(
        &self,
        right: &Self,
        table: impl Fn(Option<bool>, Option<bool>) -> Option<bool>,
    ) -> Result<Self, ColumnError> {
        for side in [self, right] {
            if !side.dtype.is_logical() {
                return Err(ColumnError::NotLogical { dtype: side.dtype });
            }
        }
        let out_len = recycled_len(self.len(), right.len())?;

        let mut values = Vec::with_capacity(out_len);
        for idx in 0..out_len {
            let left = match recycled(&self.values, idx) {
                Scalar::Bool(v) => Some(*v),
                _ => None,
            };
            let rhs = match recycled(&right.values, idx) {
                Scalar::Bool(v) => Some(*v),
                _ => None,
            };
            values.push(match table(left, rhs) {
                Some(v) => Scalar::Bool(v),
                None => Scalar::Null(NullKind::Null),
            });
        }

        Self::new(DType::Bool, values)
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(left, right)| left.semantic_eq(right))
    }
}

#[cfg(test)]
mod tests {
    use gw_types::{DType, NullKind, Scalar};

    use super::{ArithmeticOp, Column, ColumnError, CompareOp};

    fn ints(values: &[i64]) -> Column {
        Column::from_values(values.iter().map(|v| Scalar::Int64(*v)).collect())
            .expect("column should build")
    }

    #[test]
    fn take_subsets_by_position() {
        let column = ints(&[10, 20, 30, 40]);
        let out = column.take(&[3, 1]).expect("take should pass");
        assert_eq!(out.values(), &[Scalar::Int64(40), Scalar::Int64(20)]);
        assert_eq!(out.dtype(), DType::Int64);
    }

    #[test]
    fn take_rejects_out_of_bounds_rows() {
        let column = ints(&[10, 20]);
        let err = column.take(&[0, 2]).expect_err("must fail");
        assert_eq!(err, ColumnError::RowOutOfBounds { row: 2, len: 2 });
    }

    #[test]
    fn take_of_nothing_preserves_dtype() {
        let column = ints(&[10, 20]);
        let out = column.take(&[]).expect("empty take should pass");
        assert!(out.is_empty());
        assert_eq!(out.dtype(), DType::Int64);
    }

    #[test]
    fn numeric_addition_propagates_missing() {
        let left = Column::from_values(vec![
            Scalar::Int64(1),
            Scalar::Null(NullKind::Null),
            Scalar::Float64(f64::NAN),
        ])
        .expect("left");
        let right = ints(&[2, 5, 3]);

        let out = left
            .binary_numeric(&right, ArithmeticOp::Add)
            .expect("add should pass");

        assert_eq!(out.values()[0], Scalar::Float64(3.0));
        assert_eq!(out.values()[1], Scalar::Null(NullKind::NaN));
        assert_eq!(out.values()[2], Scalar::Null(NullKind::NaN));
    }

    #[test]
    fn length_one_side_recycles() {
        let left = ints(&[10, 20, 30]);
        let one = ints(&[7]);
        let out = left
            .binary_numeric(&one, ArithmeticOp::Add)
            .expect("recycled add");
        assert_eq!(
            out.values(),
            &[Scalar::Int64(17), Scalar::Int64(27), Scalar::Int64(37)]
        );

        let err = left.binary_numeric(&ints(&[1, 2]), ArithmeticOp::Add);
        assert_eq!(
            err.expect_err("must fail"),
            ColumnError::LengthMismatch { left: 3, right: 2 }
        );
    }

    #[test]
    fn division_always_produces_floats() {
        let out = ints(&[7, 8])
            .binary_numeric(&ints(&[2]), ArithmeticOp::Div)
            .expect("div");
        assert_eq!(out.dtype(), DType::Float64);
        assert_eq!(out.values()[0], Scalar::Float64(3.5));
    }

    #[test]
    fn comparison_handles_missing_and_recycling() {
        let left = Column::from_values(vec![
            Scalar::Int64(1),
            Scalar::Int64(5),
            Scalar::Null(NullKind::Null),
        ])
        .expect("left");
        let out = left.compare(&ints(&[3]), CompareOp::Lt).expect("compare");
        assert_eq!(
            out.values(),
            &[
                Scalar::Bool(true),
                Scalar::Bool(false),
                Scalar::Null(NullKind::Null)
            ]
        );
        assert_eq!(out.dtype(), DType::Bool);
    }

    #[test]
    fn string_comparison_is_lexicographic() {
        let left = Column::from_values(vec![
            Scalar::Utf8("apple".to_owned()),
            Scalar::Utf8("pear".to_owned()),
        ])
        .expect("left");
        let right = Column::from_values(vec![Scalar::Utf8("banana".to_owned())]).expect("right");
        let out = left.compare(&right, CompareOp::Lt).expect("compare");
        assert_eq!(out.values(), &[Scalar::Bool(true), Scalar::Bool(false)]);
    }

    #[test]
    fn comparing_strings_to_numbers_fails() {
        let left = Column::from_values(vec![Scalar::Utf8("a".to_owned())]).expect("left");
        let err = left.compare(&ints(&[1]), CompareOp::Eq);
        assert!(err.is_err());
    }

    #[test]
    fn kleene_and_lets_false_dominate() {
        let left = Column::from_values(vec![
            Scalar::Bool(false),
            Scalar::Bool(true),
            Scalar::Null(NullKind::Null),
        ])
        .expect("left");
        let missing =
            Column::from_values(vec![Scalar::Null(NullKind::Null)]).expect("missing mask");

        let out = left.and(&missing).expect("and should pass");
        assert_eq!(
            out.values(),
            &[
                Scalar::Bool(false),
                Scalar::Null(NullKind::Null),
                Scalar::Null(NullKind::Null)
            ]
        );
    }

    #[test]
    fn kleene_or_lets_true_dominate() {
        let left = Column::from_values(vec![Scalar::Bool(true), Scalar::Bool(false)]).expect("left");
        let missing =
            Column::from_values(vec![Scalar::Null(NullKind::Null)]).expect("missing mask");

        let out = left.or(&missing).expect("or should pass");
        assert_eq!(
            out.values(),
            &[Scalar::Bool(true), Scalar::Null(NullKind::Null)]
        );
    }

    #[test]
    fn not_requires_logical_input() {
        let err = ints(&[1]).not().expect_err("must fail");
        assert_eq!(err, ColumnError::NotLogical { dtype: DType::Int64 });
    }

    #[test]
    fn column_serde_round_trip() {
        let column = Column::from_values(vec![Scalar::Int64(1), Scalar::Null(NullKind::Null)])
            .expect("column");
        let json = serde_json::to_string(&column).expect("serialize");
        let back: Column = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, column);
    }
}
