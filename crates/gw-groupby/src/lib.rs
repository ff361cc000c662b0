#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use gw_columnar::{Column, ColumnError};
use gw_eval::{Partition, PartitionError};
use gw_frame::{Frame, FrameError, Value};
use gw_types::Scalar;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOptions {
    /// Drop rows whose key is missing instead of collecting them into
    /// their own group. Dropped rows belong to no group and are never
    /// evaluated.
    pub drop_missing: bool,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self { drop_missing: true }
    }
}

#[derive(Debug, Error)]
pub enum GroupByError {
    #[error("unknown key column: {0}")]
    UnknownKey(String),
    #[error("key column `{name}` must be a plain column, found a {found}")]
    InvalidKey { name: String, found: &'static str },
    #[error("at least one key column is required")]
    NoKeys,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
}

/// A partition plus one representative key row per group, both in
/// first-seen order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedPartition {
    partition: Partition,
    keys: Frame,
}

impl KeyedPartition {
    #[must_use]
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// One row per group: the key values that define it, in the order the
    /// groups were first seen.
    #[must_use]
    pub fn keys(&self) -> &Frame {
        &self.keys
    }

    #[must_use]
    pub fn n_groups(&self) -> usize {
        self.partition.n_groups()
    }

    #[must_use]
    pub fn into_parts(self) -> (Partition, Frame) {
        (self.partition, self.keys)
    }
}

/// Partition `data` by the distinct combinations of the named key
/// columns. Groups come out in first-seen row order, each holding its
/// rows in ascending order.
pub fn partition_by_keys(
    data: &Frame,
    key_names: &[&str],
    options: PartitionOptions,
) -> Result<KeyedPartition, GroupByError> {
    if key_names.is_empty() {
        return Err(GroupByError::NoKeys);
    }

    let mut key_columns = Vec::with_capacity(key_names.len());
    for name in key_names {
        let value = data
            .column(name)
            .ok_or_else(|| GroupByError::UnknownKey((*name).to_owned()))?;
        let column = value.as_column().ok_or_else(|| GroupByError::InvalidKey {
            name: (*name).to_owned(),
            found: value_kind(value),
        })?;
        key_columns.push((*name, column));
    }

    let dense = if let [(_, single)] = key_columns.as_slice() {
        try_partition_dense_int64(single, options.drop_missing)
    } else {
        None
    };
    let (groups, first_rows) = match dense {
        Some(parts) => parts,
        None => partition_generic(&key_columns, data.n_rows(), options.drop_missing),
    };

    let mut key_pairs = Vec::with_capacity(key_columns.len());
    for (name, column) in &key_columns {
        key_pairs.push(((*name).to_owned(), Value::Column(column.take(&first_rows)?)));
    }

    Ok(KeyedPartition {
        partition: Partition::grouped(groups, data.n_rows())?,
        keys: Frame::new(key_pairs)?,
    })
}

/// Single-key partition with default options.
pub fn partition_by_key(data: &Frame, key: &str) -> Result<KeyedPartition, GroupByError> {
    partition_by_keys(data, &[key], PartitionOptions::default())
}

fn partition_generic(
    key_columns: &[(&str, &Column)],
    n_rows: usize,
    drop_missing: bool,
) -> (Vec<Vec<usize>>, Vec<usize>) {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut first_rows: Vec<usize> = Vec::new();
    let mut slots: HashMap<Vec<GroupKeyRef<'_>>, usize> = HashMap::new();

    'rows: for row in 0..n_rows {
        let mut key = Vec::with_capacity(key_columns.len());
        for (_, column) in key_columns {
            let scalar = column
                .value(row)
                .expect("key columns match the frame length");
            if drop_missing && scalar.is_missing() {
                continue 'rows;
            }
            key.push(GroupKeyRef::from_scalar(scalar));
        }
        match slots.entry(key) {
            Entry::Occupied(entry) => groups[*entry.get()].push(row),
            Entry::Vacant(entry) => {
                entry.insert(groups.len());
                groups.push(vec![row]);
                first_rows.push(row);
            }
        }
    }

    (groups, first_rows)
}

/// Hashable view of a key scalar. Every missing marker collapses to one
/// key, matching `Scalar::semantic_eq`; present floats key by bit
/// pattern.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum GroupKeyRef<'a> {
    Missing,
    Bool(bool),
    Int64(i64),
    FloatBits(u64),
    Utf8(&'a str),
}

impl<'a> GroupKeyRef<'a> {
    fn from_scalar(key: &'a Scalar) -> Self {
        match key {
            Scalar::Null(_) => Self::Missing,
            Scalar::Float64(v) if v.is_nan() => Self::Missing,
            Scalar::Bool(v) => Self::Bool(*v),
            Scalar::Int64(v) => Self::Int64(*v),
            Scalar::Float64(v) => Self::FloatBits(v.to_bits()),
            Scalar::Utf8(v) => Self::Utf8(v.as_str()),
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Column(_) => "column",
        Value::List(_) => "list",
        Value::Record(_) => "record",
        Value::Null => "null",
    }
}

const DENSE_INT_KEY_RANGE_LIMIT: i128 = 65_536;

/// Dense-bucket fast path for a single `Int64` key column.
///
/// Falls back to the generic map path unless every non-dropped key is
/// `Int64` and the key span stays under `DENSE_INT_KEY_RANGE_LIMIT`.
fn try_partition_dense_int64(
    keys: &Column,
    drop_missing: bool,
) -> Option<(Vec<Vec<usize>>, Vec<usize>)> {
    let mut min_key = i64::MAX;
    let mut max_key = i64::MIN;
    let mut saw_int_key = false;

    for key in keys.values() {
        match key {
            Scalar::Int64(v) => {
                saw_int_key = true;
                min_key = min_key.min(*v);
                max_key = max_key.max(*v);
            }
            Scalar::Null(_) if drop_missing => continue,
            _ => return None,
        }
    }

    if !saw_int_key {
        return Some((Vec::new(), Vec::new()));
    }

    let span = i128::from(max_key) - i128::from(min_key) + 1;
    if span <= 0 || span > DENSE_INT_KEY_RANGE_LIMIT {
        return None;
    }

    let bucket_len = usize::try_from(span).ok()?;
    let mut slots: Vec<Option<usize>> = vec![None; bucket_len];
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut first_rows: Vec<usize> = Vec::new();

    for (row, key) in keys.values().iter().enumerate() {
        let key = match key {
            Scalar::Int64(v) => *v,
            Scalar::Null(_) if drop_missing => continue,
            _ => return None,
        };

        let bucket = usize::try_from(i128::from(key) - i128::from(min_key)).ok()?;
        match slots[bucket] {
            Some(group) => groups[group].push(row),
            None => {
                slots[bucket] = Some(groups.len());
                groups.push(vec![row]);
                first_rows.push(row);
            }
        }
    }

    Some((groups, first_rows))
}
