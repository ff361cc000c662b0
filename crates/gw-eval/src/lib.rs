#![forbid(unsafe_code)]

use std::cell::OnceCell;
use std::collections::{HashMap, HashSet};
use std::fmt;

use gw_frame::{Frame, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingMode {
    Grouped,
    Rowwise,
    Ungrouped,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("row {row} out of bounds for a frame of {n_rows} rows")]
    RowOutOfBounds { row: usize, n_rows: usize },
    #[error("row {row} appears in more than one group")]
    OverlappingGroups { row: usize },
    #[error("partition built for {partition_rows} rows but the frame has {frame_rows}")]
    FrameMismatch {
        partition_rows: usize,
        frame_rows: usize,
    },
}

/// How a frame's rows are split into groups. Groups are ordered sets of
/// 0-based row indices; a row belongs to at most one group. Rows missing
/// from every group are simply never evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    groups: Vec<Vec<usize>>,
    mode: GroupingMode,
    n_rows: usize,
}

impl Partition {
    /// Explicit row groups. Every index must be in range and no row may
    /// appear twice, in the same group or across groups. Empty groups are
    /// legal and evaluate like any other.
    pub fn grouped(groups: Vec<Vec<usize>>, n_rows: usize) -> Result<Self, PartitionError> {
        let mut seen = vec![false; n_rows];
        for group in &groups {
            for &row in group {
                if row >= n_rows {
                    return Err(PartitionError::RowOutOfBounds { row, n_rows });
                }
                if seen[row] {
                    return Err(PartitionError::OverlappingGroups { row });
                }
                seen[row] = true;
            }
        }
        Ok(Self {
            groups,
            mode: GroupingMode::Grouped,
            n_rows,
        })
    }

    /// One group per row, in row order.
    #[must_use]
    pub fn rowwise(n_rows: usize) -> Self {
        Self {
            groups: (0..n_rows).map(|row| vec![row]).collect(),
            mode: GroupingMode::Rowwise,
            n_rows,
        }
    }

    /// A single group spanning all rows.
    #[must_use]
    pub fn ungrouped(n_rows: usize) -> Self {
        Self {
            groups: vec![(0..n_rows).collect()],
            mode: GroupingMode::Ungrouped,
            n_rows,
        }
    }

    #[must_use]
    pub fn mode(&self) -> GroupingMode {
        self.mode
    }

    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    #[must_use]
    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn groups(&self) -> &[Vec<usize>] {
        &self.groups
    }

    #[must_use]
    pub fn rows(&self, group: usize) -> &[usize] {
        &self.groups[group]
    }
}

#[derive(Debug)]
enum ChopPlan {
    /// Ungrouped: the single group's slice is the column itself, borrowed.
    Whole,
    /// Rowwise list column: each group's slice is the element at its row,
    /// borrowed. Compound elements are not decomposed further.
    Element,
    /// Everything else: a lazily taken, memoized copy per group.
    Slice { cells: Vec<OnceCell<Value>> },
}

/// Per-(column, group) slices of a frame, computed on first access and
/// memoized for the rest of the evaluation pass.
#[derive(Debug)]
pub struct ChoppedFrame<'a> {
    data: &'a Frame,
    partition: &'a Partition,
    plans: Vec<ChopPlan>,
}

impl<'a> ChoppedFrame<'a> {
    pub fn new(data: &'a Frame, partition: &'a Partition) -> Result<Self, PartitionError> {
        if partition.n_rows() != data.n_rows() {
            return Err(PartitionError::FrameMismatch {
                partition_rows: partition.n_rows(),
                frame_rows: data.n_rows(),
            });
        }

        let n_groups = partition.n_groups();
        let plans = data
            .columns()
            .iter()
            .map(|column| match partition.mode() {
                GroupingMode::Ungrouped => ChopPlan::Whole,
                GroupingMode::Rowwise if column.is_list() => ChopPlan::Element,
                GroupingMode::Grouped | GroupingMode::Rowwise => ChopPlan::Slice {
                    cells: (0..n_groups).map(|_| OnceCell::new()).collect(),
                },
            })
            .collect();

        Ok(Self {
            data,
            partition,
            plans,
        })
    }

    #[must_use]
    pub fn data(&self) -> &'a Frame {
        self.data
    }

    #[must_use]
    pub fn partition(&self) -> &'a Partition {
        self.partition
    }

    #[must_use]
    pub fn n_groups(&self) -> usize {
        self.partition.n_groups()
    }

    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.data.position(name)
    }

    /// The slice of column `col` for `group`, forcing and memoizing it on
    /// first access. Ungrouped columns and rowwise list elements are
    /// borrowed from the source frame and never copied.
    #[must_use]
    pub fn slice(&self, col: usize, group: usize) -> &Value {
        let column = &self.data.columns()[col];
        match &self.plans[col] {
            ChopPlan::Whole => column,
            ChopPlan::Element => {
                let items = column
                    .as_list()
                    .expect("element chops are only planned for list columns");
                &items[self.partition.rows(group)[0]]
            }
            ChopPlan::Slice { cells } => cells[group].get_or_init(|| {
                column
                    .take(self.partition.rows(group))
                    .expect("partition rows validated against the frame")
            }),
        }
    }

    /// Whether the slice of `name` for `group` has been materialized yet.
    /// Borrowed chops (whole columns, rowwise list elements) have nothing
    /// to materialize and always report `true`.
    #[must_use]
    pub fn forced(&self, name: &str, group: usize) -> Option<bool> {
        let col = self.position(name)?;
        match &self.plans[col] {
            ChopPlan::Whole | ChopPlan::Element => Some(true),
            ChopPlan::Slice { cells } => cells.get(group).map(|cell| cell.get().is_some()),
        }
    }
}

/// One group's variable scope: results bound so far shadow the lazy
/// column slices underneath.
pub struct GroupMask<'a> {
    chops: &'a ChoppedFrame<'a>,
    group: usize,
    locals: HashMap<String, Value>,
}

impl GroupMask<'_> {
    /// Two-level lookup: locals first, then the group's column slice,
    /// forcing it transparently.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.locals.get(name) {
            return Some(value);
        }
        let col = self.chops.position(name)?;
        Some(self.chops.slice(col, self.group))
    }

    /// Bind a result under `name`, shadowing any column of the same name.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    #[must_use]
    pub fn rows(&self) -> &[usize] {
        self.chops.partition().rows(self.group)
    }

    #[must_use]
    pub fn group_size(&self) -> usize {
        self.rows().len()
    }

    /// 1-based group ordinal, matching failure-site numbering.
    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.group + 1
    }
}

/// One mask per group, sharing the chopped frame.
#[must_use]
pub fn build_masks<'a>(chops: &'a ChoppedFrame<'a>) -> Vec<GroupMask<'a>> {
    (0..chops.n_groups())
        .map(|group| GroupMask {
            chops,
            group,
            locals: HashMap::new(),
        })
        .collect()
}

/// The operation on whose behalf expressions are evaluated. Only
/// validation consults this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Filter,
    Slice,
    Mutate,
    Summarise,
    Other,
}

impl Verb {
    #[must_use]
    pub fn classify(name: &str) -> Self {
        match name {
            "filter" => Self::Filter,
            "slice" => Self::Slice,
            "mutate" => Self::Mutate,
            "summarise" => Self::Summarise,
            _ => Self::Other,
        }
    }
}

/// An expression plus its naming: `name` when the caller declared one,
/// else `auto_name` (typically the deparsed source text) is used for
/// non-record results.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedExpr<E> {
    pub expr: E,
    pub name: Option<String>,
    pub auto_name: String,
}

impl<E> NamedExpr<E> {
    pub fn named(name: impl Into<String>, expr: E) -> Self {
        let name = name.into();
        Self {
            auto_name: name.clone(),
            name: Some(name),
            expr,
        }
    }

    pub fn unnamed(auto_name: impl Into<String>, expr: E) -> Self {
        Self {
            expr,
            name: None,
            auto_name: auto_name.into(),
        }
    }
}

/// The declared shape of a fast-path result. Record shapes auto-splice
/// when the expression is unnamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    Vector,
    Record { fields: Vec<String> },
}

/// A whole pass worth of fast-path results: one chunk per group, in
/// group order.
#[derive(Debug, Clone, PartialEq)]
pub struct FastChunks {
    pub chunks: Vec<Value>,
    pub shape: ResultShape,
}

/// What the vectorized fast path is allowed to see: the chopped slices,
/// the verb being executed, and the set of names already rebound by
/// earlier expressions. Fast chunks are bound without validation, so a
/// conforming implementation declines whenever an expression touches a
/// shadowed or unknown name, or would produce a shape the verb's
/// fallback validation would reject.
pub struct FastView<'a> {
    chops: &'a ChoppedFrame<'a>,
    shadowed: &'a HashSet<String>,
    verb: Verb,
}

impl<'a> FastView<'a> {
    #[must_use]
    pub fn verb(&self) -> Verb {
        self.verb
    }

    #[must_use]
    pub fn is_shadowed(&self, name: &str) -> bool {
        self.shadowed.contains(name)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.chops.position(name).is_some()
    }

    /// The source column, untouched by grouping. Useful for dtype checks
    /// that should not force any slice.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&'a Value> {
        let col = self.chops.position(name)?;
        Some(&self.chops.data().columns()[col])
    }

    #[must_use]
    pub fn slice(&self, name: &str, group: usize) -> Option<&'a Value> {
        let col = self.chops.position(name)?;
        Some(self.chops.slice(col, group))
    }

    #[must_use]
    pub fn n_groups(&self) -> usize {
        self.chops.n_groups()
    }

    #[must_use]
    pub fn rows(&self, group: usize) -> &'a [usize] {
        self.chops.partition().rows(group)
    }
}

/// The expression representation and both evaluation strategies, supplied
/// by the caller. `try_fast` is optional; the default never takes the
/// fast path.
pub trait GroupEvaluator {
    type Expr;
    type Error: std::error::Error + Send + Sync + 'static;

    fn eval_group(
        &self,
        expr: &Self::Expr,
        mask: &GroupMask<'_>,
    ) -> Result<Value, Self::Error>;

    fn try_fast(
        &self,
        expr: &Self::Expr,
        view: &FastView<'_>,
    ) -> Result<Option<FastChunks>, Self::Error> {
        let _ = (expr, view);
        Ok(None)
    }
}

/// Where a failure happened: 1-based expression ordinal, and the 1-based
/// group ordinal for fallback failures. Fast-path failures concern every
/// group at once and carry no group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSite {
    pub expression: usize,
    pub group: Option<usize>,
}

impl fmt::Display for FailureSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.group {
            Some(group) => write!(f, "expression {} in group {}", self.expression, group),
            None => write!(f, "expression {}", self.expression),
        }
    }
}

fn size_message(expected: &usize, actual: &usize) -> String {
    if *expected == 1 {
        format!("incompatible size: must be size 1, not size {actual}")
    } else {
        format!("incompatible size: must be size 1 or {expected}, not size {actual}")
    }
}

#[derive(Debug, Error)]
pub enum FailureKind {
    #[error("incompatible type: must be a logical vector")]
    FilterIncompatibleType { found: Value },
    #[error("incompatible type in column `{column}`: must be a logical vector")]
    FilterIncompatibleTypeInColumn { column: String, found: Value },
    #[error("incompatible type: must be a vector")]
    IncompatibleType,
    #[error("{}", size_message(.expected, .actual))]
    IncompatibleSize { expected: usize, actual: usize },
    /// Fast-path contract violations. These indicate a defective
    /// `GroupEvaluator`, not bad user data.
    #[error("malformed fast path result: expected {expected} chunks, found {actual}")]
    MalformedFastPathLength { expected: usize, actual: usize },
    #[error("malformed fast path result: chunk for group {group} is not a record")]
    MalformedFastPathShape { group: usize },
    #[error("{0}")]
    Evaluator(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// A failed pass: what went wrong and exactly where.
#[derive(Debug, Error)]
#[error("{site}: {kind}")]
pub struct EvalFailure {
    pub site: FailureSite,
    #[source]
    pub kind: FailureKind,
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("expected {expected} group masks, found {actual}")]
    MaskCountMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Failure(#[from] EvalFailure),
}

/// One result slot per expression per group. Slot names are shared by
/// all groups; auto-spliced record slots keep an empty name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalOutput {
    names: Vec<String>,
    groups: Vec<Vec<Value>>,
}

impl EvalOutput {
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn n_exprs(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn group(&self, group: usize) -> &[Value] {
        &self.groups[group]
    }

    /// The first slot named `name` in `group`.
    #[must_use]
    pub fn result(&self, group: usize, name: &str) -> Option<&Value> {
        let idx = self.names.iter().position(|n| n == name)?;
        self.groups.get(group)?.get(idx)
    }

    #[must_use]
    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<Value>>) {
        (self.names, self.groups)
    }
}

fn validate_type(verb: Verb, result: &Value, site: FailureSite) -> Result<(), EvalFailure> {
    match verb {
        Verb::Filter => match result {
            Value::Column(column) if column.dtype().is_logical() => Ok(()),
            Value::Record(frame) => {
                for (name, field) in frame.iter() {
                    let logical = field
                        .as_column()
                        .is_some_and(|column| column.dtype().is_logical());
                    if !logical {
                        return Err(EvalFailure {
                            site,
                            kind: FailureKind::FilterIncompatibleTypeInColumn {
                                column: name.to_owned(),
                                found: field.clone(),
                            },
                        });
                    }
                }
                Ok(())
            }
            other => Err(EvalFailure {
                site,
                kind: FailureKind::FilterIncompatibleType {
                    found: other.clone(),
                },
            }),
        },
        Verb::Summarise if !result.is_vector() => Err(EvalFailure {
            site,
            kind: FailureKind::IncompatibleType,
        }),
        _ => Ok(()),
    }
}

fn validate_size(
    verb: Verb,
    result: &Value,
    expected: usize,
    site: FailureSite,
) -> Result<(), EvalFailure> {
    if !matches!(verb, Verb::Filter | Verb::Mutate) {
        return Ok(());
    }
    let actual = result.len();
    if actual == 1 || actual == expected {
        return Ok(());
    }
    Err(EvalFailure {
        site,
        kind: FailureKind::IncompatibleSize { expected, actual },
    })
}

/// Evaluate `exprs` in order against every group.
///
/// Each expression first gets one shot at the vectorized fast path; its
/// chunks are trusted and bound without validation. Otherwise the
/// expression falls back to per-group evaluation in ascending group
/// order, with verb-aware type and size validation. Either way the
/// result is bound into each group's mask, under the declared name, the
/// auto-derived name, or (for unnamed record results) spliced
/// field-by-field, so later expressions can refer to it. The first
/// failure aborts the pass.
pub fn evaluate_exprs<Ev: GroupEvaluator>(
    verb: Verb,
    exprs: &[NamedExpr<Ev::Expr>],
    chops: &ChoppedFrame<'_>,
    masks: &mut [GroupMask<'_>],
    evaluator: &Ev,
) -> Result<EvalOutput, EvalError> {
    let n_groups = chops.n_groups();
    if masks.len() != n_groups {
        return Err(EvalError::MaskCountMismatch {
            expected: n_groups,
            actual: masks.len(),
        });
    }

    let mut names: Vec<String> = exprs
        .iter()
        .map(|named| named.name.clone().unwrap_or_default())
        .collect();
    let mut groups: Vec<Vec<Value>> = (0..n_groups)
        .map(|_| Vec::with_capacity(exprs.len()))
        .collect();
    let mut shadowed: HashSet<String> = HashSet::new();

    for (i_expr, named) in exprs.iter().enumerate() {
        let fast_site = FailureSite {
            expression: i_expr + 1,
            group: None,
        };

        let fast = evaluator
            .try_fast(&named.expr, &FastView {
                chops,
                shadowed: &shadowed,
                verb,
            })
            .map_err(|err| EvalFailure {
                site: fast_site,
                kind: FailureKind::Evaluator(Box::new(err)),
            })?;

        if let Some(FastChunks { chunks, shape }) = fast {
            #[cfg(feature = "tracing")]
            tracing::debug!(expression = i_expr + 1, n_groups, "fast path hit");

            if chunks.len() != n_groups {
                return Err(EvalFailure {
                    site: fast_site,
                    kind: FailureKind::MalformedFastPathLength {
                        expected: n_groups,
                        actual: chunks.len(),
                    },
                }
                .into());
            }

            match (&named.name, &shape) {
                (Some(name), _) => {
                    for (group, chunk) in chunks.into_iter().enumerate() {
                        masks[group].bind(name.clone(), chunk.clone());
                        groups[group].push(chunk);
                    }
                    shadowed.insert(name.clone());
                }
                (None, ResultShape::Record { .. }) => {
                    // One result slot, one binding per field. Chunks are
                    // assumed to match the declared shape field-for-field.
                    for (group, chunk) in chunks.into_iter().enumerate() {
                        let Value::Record(record) = &chunk else {
                            return Err(EvalFailure {
                                site: fast_site,
                                kind: FailureKind::MalformedFastPathShape { group: group + 1 },
                            }
                            .into());
                        };
                        let fields: Vec<(String, Value)> = record
                            .iter()
                            .map(|(field, value)| (field.to_owned(), value.clone()))
                            .collect();
                        for (field, value) in fields {
                            shadowed.insert(field.clone());
                            masks[group].bind(field, value);
                        }
                        groups[group].push(chunk);
                    }
                }
                (None, ResultShape::Vector) => {
                    names[i_expr] = named.auto_name.clone();
                    for (group, chunk) in chunks.into_iter().enumerate() {
                        masks[group].bind(named.auto_name.clone(), chunk.clone());
                        groups[group].push(chunk);
                    }
                    shadowed.insert(named.auto_name.clone());
                }
            }
            continue;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(expression = i_expr + 1, "per-group fallback");

        for group in 0..n_groups {
            let site = FailureSite {
                expression: i_expr + 1,
                group: Some(group + 1),
            };

            let result = evaluator
                .eval_group(&named.expr, &masks[group])
                .map_err(|err| EvalFailure {
                    site,
                    kind: FailureKind::Evaluator(Box::new(err)),
                })?;

            validate_type(verb, &result, site)?;
            validate_size(verb, &result, masks[group].group_size(), site)?;

            match &named.name {
                Some(name) => {
                    shadowed.insert(name.clone());
                    masks[group].bind(name.clone(), result.clone());
                }
                None => {
                    if let Value::Record(record) = &result {
                        let fields: Vec<(String, Value)> = record
                            .iter()
                            .map(|(field, value)| (field.to_owned(), value.clone()))
                            .collect();
                        for (field, value) in fields {
                            shadowed.insert(field.clone());
                            masks[group].bind(field, value);
                        }
                    } else {
                        names[i_expr] = named.auto_name.clone();
                        shadowed.insert(named.auto_name.clone());
                        masks[group].bind(named.auto_name.clone(), result.clone());
                    }
                }
            }
            groups[group].push(result);
        }
    }

    Ok(EvalOutput { names, groups })
}

/// One-call wrapper: chop `data` by `partition`, build masks, dispatch.
pub fn evaluate_grouped<Ev: GroupEvaluator>(
    data: &Frame,
    partition: &Partition,
    verb: Verb,
    exprs: &[NamedExpr<Ev::Expr>],
    evaluator: &Ev,
) -> Result<EvalOutput, EvalError> {
    let chops = ChoppedFrame::new(data, partition)?;
    let mut masks = build_masks(&chops);
    evaluate_exprs(verb, exprs, &chops, &mut masks, evaluator)
}
