#![forbid(unsafe_code)]

use gw_columnar::{Column, ColumnError};
use gw_types::DType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("column `{name}` has length {column_len} but the frame has {n_rows} rows")]
    LengthMismatch {
        name: String,
        column_len: usize,
        n_rows: usize,
    },
    #[error("duplicate column name `{name}`")]
    DuplicateName { name: String },
    #[error("no column named `{name}`")]
    UnknownColumn { name: String },
    #[error("column `{name}` is not a vector")]
    NotAVector { name: String },
    #[error("row {row} out of bounds for value of length {len}")]
    RowOutOfBounds { row: usize, len: usize },
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// The engine's vector model. Everything an expression can produce or a
/// frame can hold is one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Flat homogeneous vector.
    Column(Column),
    /// List vector; each element is itself an arbitrary value.
    List(Vec<Value>),
    /// Record vector: named fields sharing one row count. Its length is
    /// the row count, not the field count.
    Record(Frame),
    /// The absent result. The only non-vector value.
    Null,
}

impl Value {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Column(column) => column.len(),
            Self::List(items) => items.len(),
            Self::Record(frame) => frame.n_rows(),
            Self::Null => 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_vector(&self) -> bool {
        !matches!(self, Self::Null)
    }

    #[must_use]
    pub fn is_record(&self) -> bool {
        matches!(self, Self::Record(_))
    }

    #[must_use]
    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    #[must_use]
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Self::Column(column) => Some(column.dtype()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_column(&self) -> Option<&Column> {
        match self {
            Self::Column(column) => Some(column),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_record(&self) -> Option<&Frame> {
        match self {
            Self::Record(frame) => Some(frame),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Positional row subset, recursing through records. Strict bounds,
    /// like `Column::take`.
    pub fn take(&self, rows: &[usize]) -> Result<Self, FrameError> {
        match self {
            Self::Column(column) => Ok(Self::Column(column.take(rows)?)),
            Self::List(items) => {
                let mut out = Vec::with_capacity(rows.len());
                for &row in rows {
                    let item = items.get(row).ok_or(FrameError::RowOutOfBounds {
                        row,
                        len: items.len(),
                    })?;
                    out.push(item.clone());
                }
                Ok(Self::List(out))
            }
            Self::Record(frame) => Ok(Self::Record(frame.take(rows)?)),
            Self::Null => match rows.first() {
                Some(&row) => Err(FrameError::RowOutOfBounds { row, len: 0 }),
                None => Ok(Self::Null),
            },
        }
    }

    /// Structural equality that treats missing markers as equal, for use
    /// in tests and group-key comparisons.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Column(a), Self::Column(b)) => a.semantic_eq(b),
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.semantic_eq(y))
            }
            (Self::Record(a), Self::Record(b)) => a.semantic_eq(b),
            (Self::Null, Self::Null) => true,
            _ => false,
        }
    }
}

impl From<Column> for Value {
    fn from(column: Column) -> Self {
        Self::Column(column)
    }
}

/// Ordered named columns with a shared row count. Also serves as the
/// payload of `Value::Record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    names: Vec<String>,
    columns: Vec<Value>,
    n_rows: usize,
}

impl Frame {
    /// Build a frame from ordered (name, column) pairs. Every column must
    /// be a vector and all lengths must agree; names must be unique.
    pub fn new(pairs: Vec<(String, Value)>) -> Result<Self, FrameError> {
        let mut names = Vec::with_capacity(pairs.len());
        let mut columns = Vec::with_capacity(pairs.len());
        let mut n_rows = None;

        for (name, value) in pairs {
            if names.contains(&name) {
                return Err(FrameError::DuplicateName { name });
            }
            if !value.is_vector() {
                return Err(FrameError::NotAVector { name });
            }
            match n_rows {
                None => n_rows = Some(value.len()),
                Some(expected) if expected != value.len() => {
                    return Err(FrameError::LengthMismatch {
                        name,
                        column_len: value.len(),
                        n_rows: expected,
                    });
                }
                Some(_) => {}
            }
            names.push(name);
            columns.push(value);
        }

        Ok(Self {
            names,
            columns,
            n_rows: n_rows.unwrap_or(0),
        })
    }

    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    #[must_use]
    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn columns(&self) -> &[Value] {
        &self.columns
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Value> {
        self.position(name).map(|idx| &self.columns[idx])
    }

    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.columns.iter())
    }

    /// Positional row subset applied to every column.
    pub fn take(&self, rows: &[usize]) -> Result<Self, FrameError> {
        let mut columns = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            columns.push(column.take(rows)?);
        }
        Ok(Self {
            names: self.names.clone(),
            columns,
            n_rows: rows.len(),
        })
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.names == other.names
            && self.n_rows == other.n_rows
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.semantic_eq(b))
    }
}

#[cfg(test)]
mod tests {
    use gw_columnar::Column;
    use gw_types::{NullKind, Scalar};

    use super::{Frame, FrameError, Value};

    fn int_column(values: &[i64]) -> Value {
        Value::Column(
            Column::from_values(values.iter().map(|v| Scalar::Int64(*v)).collect())
                .expect("column should build"),
        )
    }

    #[test]
    fn frame_rejects_ragged_columns() {
        let err = Frame::new(vec![
            ("a".to_owned(), int_column(&[1, 2])),
            ("b".to_owned(), int_column(&[1, 2, 3])),
        ])
        .expect_err("must fail");
        assert_eq!(
            err,
            FrameError::LengthMismatch {
                name: "b".to_owned(),
                column_len: 3,
                n_rows: 2
            }
        );
    }

    #[test]
    fn frame_rejects_duplicate_names() {
        let err = Frame::new(vec![
            ("a".to_owned(), int_column(&[1])),
            ("a".to_owned(), int_column(&[2])),
        ])
        .expect_err("must fail");
        assert_eq!(err, FrameError::DuplicateName { name: "a".to_owned() });
    }

    #[test]
    fn frame_rejects_null_columns() {
        let err = Frame::new(vec![("a".to_owned(), Value::Null)]).expect_err("must fail");
        assert_eq!(err, FrameError::NotAVector { name: "a".to_owned() });
    }

    #[test]
    fn record_length_is_row_count_not_field_count() {
        let frame = Frame::new(vec![
            ("a".to_owned(), int_column(&[1, 2, 3])),
            ("b".to_owned(), int_column(&[4, 5, 6])),
        ])
        .expect("frame should build");
        let record = Value::Record(frame);
        assert_eq!(record.len(), 3);
        assert!(record.is_vector());
    }

    #[test]
    fn take_recurses_through_records_and_lists() {
        let frame = Frame::new(vec![
            ("a".to_owned(), int_column(&[10, 20, 30])),
            (
                "tags".to_owned(),
                Value::List(vec![int_column(&[1]), int_column(&[2, 3]), int_column(&[])]),
            ),
        ])
        .expect("frame should build");

        let out = frame.take(&[2, 0]).expect("take should pass");
        assert_eq!(out.n_rows(), 2);
        assert_eq!(
            out.column("a").expect("a"),
            &int_column(&[30, 10])
        );
        assert_eq!(
            out.column("tags").expect("tags"),
            &Value::List(vec![int_column(&[]), int_column(&[1])])
        );
    }

    #[test]
    fn take_on_null_rejects_any_row() {
        assert_eq!(Value::Null.take(&[]).expect("empty take"), Value::Null);
        let err = Value::Null.take(&[0]).expect_err("must fail");
        assert_eq!(err, FrameError::RowOutOfBounds { row: 0, len: 0 });
    }

    #[test]
    fn null_value_is_not_a_vector() {
        assert!(!Value::Null.is_vector());
        assert_eq!(Value::Null.len(), 0);
        assert!(int_column(&[]).is_vector());
    }

    #[test]
    fn value_serde_round_trip() {
        let frame = Frame::new(vec![(
            "x".to_owned(),
            Value::Column(
                Column::from_values(vec![Scalar::Int64(1), Scalar::Null(NullKind::Null)])
                    .expect("column"),
            ),
        )])
        .expect("frame");
        let value = Value::Record(frame);

        let json = serde_json::to_string(&value).expect("serialize");
        let back: Value = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, value);
    }
}
