#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Null,
    Bool,
    Int64,
    Float64,
    Utf8,
}

impl DType {
    /// Whether a column of this dtype can feed a boolean predicate.
    /// `Null` qualifies: an all-missing column carries no non-logical value.
    #[must_use]
    pub fn is_logical(self) -> bool {
        matches!(self, Self::Bool | Self::Null)
    }

    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Bool | Self::Int64 | Self::Float64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullKind {
    Null,
    NaN,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null(NullKind),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl Scalar {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Null(_) => DType::Null,
            Self::Bool(_) => DType::Bool,
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Utf8(_) => DType::Utf8,
        }
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null(_) => true,
            Self::Float64(v) => v.is_nan(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_nan(&self) -> bool {
        matches!(self, Self::Null(NullKind::NaN)) || matches!(self, Self::Float64(v) if v.is_nan())
    }

    #[must_use]
    pub fn missing_for_dtype(dtype: DType) -> Self {
        match dtype {
            DType::Float64 => Self::Null(NullKind::NaN),
            DType::Null | DType::Bool | DType::Int64 | DType::Utf8 => Self::Null(NullKind::Null),
        }
    }

    /// Equality that treats every missing marker as equal to every other,
    /// including `Float64(NaN)`. Test helpers and group keys want this;
    /// ordinary comparisons do not.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float64(a), Self::Float64(b)) => (a.is_nan() && b.is_nan()) || (a == b),
            _ if self.is_missing() && other.is_missing() => true,
            _ => self == other,
        }
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Int64(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            Self::Null(kind) => Err(TypeError::ValueIsMissing { kind: *kind }),
            Self::Utf8(v) => Err(TypeError::NonNumericValue {
                value: v.clone(),
                dtype: DType::Utf8,
            }),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("dtype coercion from {left:?} to {right:?} has no compatible common type")]
    IncompatibleDtypes { left: DType, right: DType },
    #[error("cannot cast scalar of dtype {from:?} to {to:?}")]
    InvalidCast { from: DType, to: DType },
    #[error("cannot cast float {value} to int64 without loss")]
    LossyFloatToInt { value: f64 },
    #[error("expected 0/1 for bool cast from int64 but found {value}")]
    InvalidBoolInt { value: i64 },
    #[error("value {value:?} has non-numeric dtype {dtype:?}")]
    NonNumericValue { value: String, dtype: DType },
    #[error("value is missing ({kind:?})")]
    ValueIsMissing { kind: NullKind },
}

pub fn common_dtype(left: DType, right: DType) -> Result<DType, TypeError> {
    use DType::{Bool, Float64, Int64, Null, Utf8};

    let out = match (left, right) {
        (a, b) if a == b => a,
        (Bool, Bool) => Bool,
        (Int64, Int64) => Int64,
        (Float64, Float64) => Float64,
        (Null, other) | (other, Null) => other,
        (Bool, Int64) | (Int64, Bool) => Int64,
        (Bool, Float64) | (Float64, Bool) => Float64,
        (Int64, Float64) | (Float64, Int64) => Float64,
        (Utf8, _) | (_, Utf8) => return Err(TypeError::IncompatibleDtypes { left, right }),
    };

    Ok(out)
}

pub fn infer_dtype(values: &[Scalar]) -> Result<DType, TypeError> {
    let mut current = DType::Null;
    for value in values {
        current = common_dtype(current, value.dtype())?;
    }
    Ok(current)
}

/// Casts an owned scalar to `target`, reusing the allocation when the dtype
/// already matches. Missing values become the target's missing marker.
pub fn cast_scalar(value: Scalar, target: DType) -> Result<Scalar, TypeError> {
    let from = value.dtype();
    if let Scalar::Null(_) = value {
        return Ok(Scalar::missing_for_dtype(target));
    }
    if from == target {
        return Ok(value);
    }

    match target {
        DType::Null => Ok(Scalar::Null(NullKind::Null)),
        DType::Bool => match value {
            Scalar::Int64(0) => Ok(Scalar::Bool(false)),
            Scalar::Int64(1) => Ok(Scalar::Bool(true)),
            Scalar::Int64(v) => Err(TypeError::InvalidBoolInt { value: v }),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Int64 => match value {
            Scalar::Bool(v) => Ok(Scalar::Int64(i64::from(v))),
            Scalar::Float64(v) => {
                if !v.is_finite() || v != v.trunc() {
                    return Err(TypeError::LossyFloatToInt { value: v });
                }
                if v < i64::MIN as f64 || v > i64::MAX as f64 {
                    return Err(TypeError::LossyFloatToInt { value: v });
                }
                Ok(Scalar::Int64(v as i64))
            }
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Float64 => match value {
            Scalar::Bool(v) => Ok(Scalar::Float64(if v { 1.0 } else { 0.0 })),
            Scalar::Int64(v) => Ok(Scalar::Float64(v as f64)),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Utf8 => Err(TypeError::InvalidCast { from, to: target }),
    }
}
