#![forbid(unsafe_code)]

pub use gw_columnar::{ArithmeticOp, Column, ColumnError, CompareOp, ValidityMask};
pub use gw_eval::{
    ChoppedFrame, EvalError, EvalFailure, EvalOutput, FailureKind, FailureSite, FastChunks,
    FastView, GroupEvaluator, GroupMask, GroupingMode, NamedExpr, Partition, PartitionError,
    ResultShape, Verb, build_masks, evaluate_exprs, evaluate_grouped,
};
pub use gw_expr::{ColumnRef, Evaluator, Expr, ExprError, Func, evaluate, parse_expr, parse_named};
pub use gw_frame::{Frame, FrameError, Value};
pub use gw_groupby::{
    GroupByError, KeyedPartition, PartitionOptions, partition_by_key, partition_by_keys,
};
pub use gw_types::{DType, NullKind, Scalar, TypeError, cast_scalar, common_dtype, infer_dtype};
