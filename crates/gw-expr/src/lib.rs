#![forbid(unsafe_code)]

use std::fmt;

use gw_columnar::{ArithmeticOp, Column, ColumnError, CompareOp};
use gw_eval::{FastChunks, FastView, GroupEvaluator, GroupMask, NamedExpr, ResultShape, Verb};
use gw_frame::{Frame, FrameError, Value};
use gw_types::{DType, Scalar, TypeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnRef(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Column {
        name: ColumnRef,
    },
    Add {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Sub {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Mul {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Div {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Or {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not {
        expr: Box<Expr>,
    },
    Compare {
        left: Box<Expr>,
        right: Box<Expr>,
        op: CompareOp,
    },
    Call {
        func: Func,
        args: Vec<Expr>,
    },
    Literal {
        value: Scalar,
    },
    Record {
        fields: Vec<(String, Expr)>,
    },
}

/// Built-in functions. `n()` and `group_id()` read the group context; the
/// rest collapse a numeric column to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Func {
    Mean,
    Sum,
    Min,
    Max,
    Count,
    GroupId,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "mean" => Some(Self::Mean),
            "sum" => Some(Self::Sum),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "n" => Some(Self::Count),
            "group_id" => Some(Self::GroupId),
            _ => None,
        }
    }

    /// The surface name, as the parser accepts it.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "n",
            Self::GroupId => "group_id",
        }
    }

    #[must_use]
    pub fn arity(self) -> usize {
        match self {
            Self::Mean | Self::Sum | Self::Min | Self::Max => 1,
            Self::Count | Self::GroupId => 0,
        }
    }
}

impl fmt::Display for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("unknown column reference: {0}")]
    UnknownColumn(String),
    #[error("unknown function: {0}()")]
    UnknownFunction(String),
    #[error("{func}() expects {expected} argument(s), found {actual}")]
    WrongArity {
        func: Func,
        expected: usize,
        actual: usize,
    },
    #[error("{func}() expects a numeric column")]
    AggregateInput { func: Func },
    #[error("operand must be a column, found a {found}")]
    NonColumnOperand { found: &'static str },
    #[error("record field `{field}` has size {actual}, expected {expected}")]
    RaggedRecord {
        field: String,
        expected: usize,
        actual: usize,
    },
    #[error("parse error: {0}")]
    ParseError(String),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Evaluate an expression against one group's mask. Results are always
/// frame values; scalar-producing expressions come back as length-1
/// columns so the caller's recycling rules apply uniformly.
pub fn evaluate(expr: &Expr, mask: &GroupMask<'_>) -> Result<Value, ExprError> {
    match expr {
        Expr::Column { name } => mask
            .get(&name.0)
            .cloned()
            .ok_or_else(|| ExprError::UnknownColumn(name.0.clone())),
        Expr::Literal { value } => Ok(Value::Column(Column::from_values(vec![value.clone()])?)),
        Expr::Add { left, right } => eval_arithmetic(left, right, ArithmeticOp::Add, mask),
        Expr::Sub { left, right } => eval_arithmetic(left, right, ArithmeticOp::Sub, mask),
        Expr::Mul { left, right } => eval_arithmetic(left, right, ArithmeticOp::Mul, mask),
        Expr::Div { left, right } => eval_arithmetic(left, right, ArithmeticOp::Div, mask),
        Expr::And { left, right } => {
            let lhs = eval_column(left, mask)?;
            let rhs = eval_column(right, mask)?;
            Ok(Value::Column(lhs.and(&rhs)?))
        }
        Expr::Or { left, right } => {
            let lhs = eval_column(left, mask)?;
            let rhs = eval_column(right, mask)?;
            Ok(Value::Column(lhs.or(&rhs)?))
        }
        Expr::Not { expr } => {
            let input = eval_column(expr, mask)?;
            Ok(Value::Column(input.not()?))
        }
        Expr::Compare { left, right, op } => {
            let lhs = eval_column(left, mask)?;
            let rhs = eval_column(right, mask)?;
            Ok(Value::Column(lhs.compare(&rhs, *op)?))
        }
        Expr::Call { func, args } => eval_call(*func, args, mask),
        Expr::Record { fields } => {
            let mut pairs = Vec::with_capacity(fields.len());
            for (name, field) in fields {
                pairs.push((name.clone(), evaluate(field, mask)?));
            }
            assemble_record(pairs)
        }
    }
}

fn eval_column(expr: &Expr, mask: &GroupMask<'_>) -> Result<Column, ExprError> {
    match evaluate(expr, mask)? {
        Value::Column(column) => Ok(column),
        other => Err(ExprError::NonColumnOperand {
            found: value_kind(&other),
        }),
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

fn eval_arithmetic(
    left: &Expr,
    right: &Expr,
    op: ArithmeticOp,
    mask: &GroupMask<'_>,
) -> Result<Value, ExprError> {
    let lhs = eval_column(left, mask)?;
    let rhs = eval_column(right, mask)?;
    Ok(Value::Column(lhs.binary_numeric(&rhs, op)?))
}

fn eval_call(func: Func, args: &[Expr], mask: &GroupMask<'_>) -> Result<Value, ExprError> {
    check_arity(func, args.len())?;
    let (dtype, value) = match func {
        Func::Count => (DType::Int64, Scalar::Int64(mask.group_size() as i64)),
        Func::GroupId => (DType::Int64, Scalar::Int64(mask.ordinal() as i64)),
        Func::Mean | Func::Sum | Func::Min | Func::Max => {
            let input = eval_column(&args[0], mask)?;
            aggregate(func, &input)?
        }
    };
    Ok(Value::Column(Column::new(dtype, vec![value])?))
}

fn check_arity(func: Func, actual: usize) -> Result<(), ExprError> {
    let expected = func.arity();
    if actual == expected {
        Ok(())
    } else {
        Err(ExprError::WrongArity {
            func,
            expected,
            actual,
        })
    }
}

/// Collapse a numeric column to one scalar, skipping missing values.
///
/// Empty and all-missing inputs sum to zero and aggregate to a missing
/// value everywhere else. Means are always floats; min and max keep the
/// input dtype and hand back the winning scalar unchanged.
fn aggregate(func: Func, input: &Column) -> Result<(DType, Scalar), ExprError> {
    if !(input.dtype().is_numeric() || input.dtype() == DType::Null) {
        return Err(ExprError::AggregateInput { func });
    }

    let out = match func {
        Func::Sum => {
            if input.dtype() == DType::Float64 {
                let mut total = 0.0;
                for value in input.values() {
                    if !value.is_missing() {
                        total += value.to_f64()?;
                    }
                }
                (DType::Float64, Scalar::Float64(total))
            } else {
                // Integer sums that overflow collapse to missing.
                let mut total: Option<i64> = Some(0);
                for value in input.values() {
                    let v = match value {
                        Scalar::Bool(v) => i64::from(*v),
                        Scalar::Int64(v) => *v,
                        _ => continue,
                    };
                    total = total.and_then(|acc| acc.checked_add(v));
                }
                let scalar = match total {
                    Some(v) => Scalar::Int64(v),
                    None => Scalar::missing_for_dtype(DType::Int64),
                };
                (DType::Int64, scalar)
            }
        }
        Func::Mean => {
            let mut total = 0.0;
            let mut count = 0usize;
            for value in input.values() {
                if !value.is_missing() {
                    total += value.to_f64()?;
                    count += 1;
                }
            }
            let scalar = if count == 0 {
                Scalar::missing_for_dtype(DType::Float64)
            } else {
                Scalar::Float64(total / count as f64)
            };
            (DType::Float64, scalar)
        }
        Func::Min | Func::Max => {
            let mut winner: Option<(usize, f64)> = None;
            for (idx, value) in input.values().iter().enumerate() {
                if value.is_missing() {
                    continue;
                }
                let key = value.to_f64()?;
                let better = match winner {
                    None => true,
                    Some((_, best)) => {
                        if func == Func::Min {
                            key < best
                        } else {
                            key > best
                        }
                    }
                };
                if better {
                    winner = Some((idx, key));
                }
            }
            let dtype = if input.dtype() == DType::Null {
                DType::Float64
            } else {
                input.dtype()
            };
            match winner {
                Some((idx, _)) => (dtype, input.values()[idx].clone()),
                None => (dtype, Scalar::missing_for_dtype(dtype)),
            }
        }
        Func::Count | Func::GroupId => return Err(ExprError::AggregateInput { func }),
    };
    Ok(out)
}

/// Build a record from evaluated fields, recycling length-1 fields to
/// the record's common size. A field that is neither size 1 nor the
/// common size is ragged.
fn assemble_record(mut pairs: Vec<(String, Value)>) -> Result<Value, ExprError> {
    let target = pairs
        .iter()
        .map(|(_, value)| value.len())
        .find(|len| *len != 1);
    if let Some(target) = target {
        for (name, value) in &mut pairs {
            if value.len() == target {
                continue;
            }
            if value.len() == 1 {
                *value = value.take(&vec![0; target])?;
            } else {
                return Err(ExprError::RaggedRecord {
                    field: name.clone(),
                    expected: target,
                    actual: value.len(),
                });
            }
        }
    }
    Ok(Value::Record(Frame::new(pairs)?))
}

/// The crate's [`GroupEvaluator`]: per-group evaluation through
/// [`evaluate`], plus a vectorized fast path over unshadowed chopped
/// columns. [`Evaluator::without_fast_path`] forces every expression
/// down the per-group route, which keeps the two strategies comparable
/// in tests.
#[derive(Debug, Clone)]
pub struct Evaluator {
    fast_path: bool,
}

impl Evaluator {
    #[must_use]
    pub fn new() -> Self {
        Self { fast_path: true }
    }

    #[must_use]
    pub fn without_fast_path() -> Self {
        Self { fast_path: false }
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupEvaluator for Evaluator {
    type Expr = Expr;
    type Error = ExprError;

    fn eval_group(&self, expr: &Expr, mask: &GroupMask<'_>) -> Result<Value, ExprError> {
        evaluate(expr, mask)
    }

    fn try_fast(
        &self,
        expr: &Expr,
        view: &FastView<'_>,
    ) -> Result<Option<FastChunks>, ExprError> {
        if !self.fast_path {
            return Ok(None);
        }
        Ok(fast_chunks(expr, view))
    }
}

/// Run one expression vectorized across every group, or decline.
///
/// Declines are silent: anything the fast path cannot reproduce exactly,
/// including every error case, goes back to the per-group route where
/// failures pick up a group-level site.
fn fast_chunks(expr: &Expr, view: &FastView<'_>) -> Option<FastChunks> {
    let shape = match expr {
        Expr::Record { fields } => ResultShape::Record {
            fields: fields.iter().map(|(name, _)| name.clone()).collect(),
        },
        _ => ResultShape::Vector,
    };
    let mut chunks = Vec::with_capacity(view.n_groups());
    for group in 0..view.n_groups() {
        let chunk = fast_value(expr, view, group)?;
        if !chunk_admissible(view.verb(), &chunk, view.rows(group).len()) {
            return None;
        }
        chunks.push(chunk);
    }
    Some(FastChunks { chunks, shape })
}

/// Fast chunks bind without validation, so a chunk the fallback
/// validation would refuse forces the whole expression down the
/// per-group route instead.
fn chunk_admissible(verb: Verb, chunk: &Value, group_size: usize) -> bool {
    let size_ok = chunk.len() == 1 || chunk.len() == group_size;
    match verb {
        Verb::Filter => {
            size_ok
                && match chunk {
                    Value::Column(column) => column.dtype().is_logical(),
                    Value::Record(fields) => fields.columns().iter().all(|field| {
                        field
                            .as_column()
                            .is_some_and(|column| column.dtype().is_logical())
                    }),
                    _ => false,
                }
        }
        Verb::Mutate => size_ok,
        Verb::Summarise => chunk.is_vector(),
        Verb::Slice | Verb::Other => true,
    }
}

fn fast_value(expr: &Expr, view: &FastView<'_>, group: usize) -> Option<Value> {
    match expr {
        Expr::Column { name } => {
            if view.is_shadowed(&name.0) {
                return None;
            }
            view.slice(&name.0, group).cloned()
        }
        Expr::Literal { value } => Column::from_values(vec![value.clone()])
            .ok()
            .map(Value::Column),
        Expr::Add { left, right } => fast_arithmetic(left, right, ArithmeticOp::Add, view, group),
        Expr::Sub { left, right } => fast_arithmetic(left, right, ArithmeticOp::Sub, view, group),
        Expr::Mul { left, right } => fast_arithmetic(left, right, ArithmeticOp::Mul, view, group),
        Expr::Div { left, right } => fast_arithmetic(left, right, ArithmeticOp::Div, view, group),
        Expr::And { left, right } => {
            let lhs = fast_column(left, view, group)?;
            let rhs = fast_column(right, view, group)?;
            lhs.and(&rhs).ok().map(Value::Column)
        }
        Expr::Or { left, right } => {
            let lhs = fast_column(left, view, group)?;
            let rhs = fast_column(right, view, group)?;
            lhs.or(&rhs).ok().map(Value::Column)
        }
        Expr::Not { expr } => {
            let input = fast_column(expr, view, group)?;
            input.not().ok().map(Value::Column)
        }
        Expr::Compare { left, right, op } => {
            let lhs = fast_column(left, view, group)?;
            let rhs = fast_column(right, view, group)?;
            lhs.compare(&rhs, *op).ok().map(Value::Column)
        }
        Expr::Call { func, args } => fast_call(*func, args, view, group),
        Expr::Record { fields } => {
            let mut pairs = Vec::with_capacity(fields.len());
            for (name, field) in fields {
                pairs.push((name.clone(), fast_value(field, view, group)?));
            }
            assemble_record(pairs).ok()
        }
    }
}

fn fast_column(expr: &Expr, view: &FastView<'_>, group: usize) -> Option<Column> {
    match fast_value(expr, view, group)? {
        Value::Column(column) => Some(column),
        _ => None,
    }
}

fn fast_arithmetic(
    left: &Expr,
    right: &Expr,
    op: ArithmeticOp,
    view: &FastView<'_>,
    group: usize,
) -> Option<Value> {
    let lhs = fast_column(left, view, group)?;
    let rhs = fast_column(right, view, group)?;
    lhs.binary_numeric(&rhs, op).ok().map(Value::Column)
}

fn fast_call(func: Func, args: &[Expr], view: &FastView<'_>, group: usize) -> Option<Value> {
    if args.len() != func.arity() {
        return None;
    }
    let (dtype, value) = match func {
        Func::Count => (DType::Int64, Scalar::Int64(view.rows(group).len() as i64)),
        Func::GroupId => (DType::Int64, Scalar::Int64((group + 1) as i64)),
        Func::Mean | Func::Sum | Func::Min | Func::Max => {
            let input = fast_column(&args[0], view, group)?;
            aggregate(func, &input).ok()?
        }
    };
    Column::new(dtype, vec![value]).ok().map(Value::Column)
}

// ── Expression Parser ───────────────────────────────────────────────────
//
// A recursive-descent parser for groupwise expressions. Supports:
//   - Column references (identifiers)
//   - Numeric literals (integer and float)
//   - String literals ('...' or "...")
//   - Comparison operators: ==, !=, >, >=, <, <=
//   - Logical operators: and, or, not
//   - Arithmetic operators: +, -, *, /
//   - Function calls: mean, sum, min, max, n, group_id
//   - Record construction: record(name = expr, ...)
//   - Parenthesized sub-expressions

/// Parse a string expression into an [`Expr`] AST.
///
/// Syntax:
///   expr       → or_expr
///   or_expr    → and_expr ( "or" and_expr )*
///   and_expr   → not_expr ( "and" not_expr )*
///   not_expr   → "not" not_expr | comparison
///   comparison → add_expr ( ("==" | "!=" | ">" | ">=" | "<" | "<=") add_expr )?
///   add_expr   → mul_expr ( ("+" | "-") mul_expr )*
///   mul_expr   → atom ( ("*" | "/") atom )*
///   atom       → NUMBER | STRING | call | IDENT | "(" expr ")"
///   call       → IDENT "(" ( expr ("," expr)* )? ")"
///              | "record" "(" ( IDENT "=" expr ("," IDENT "=" expr)* )? ")"
pub fn parse_expr(input: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(input)?;
    let mut pos = 0;
    let result = parse_or(&tokens, &mut pos)?;
    if pos < tokens.len() {
        return Err(ExprError::ParseError(format!(
            "unexpected token at position {pos}: {:?}",
            tokens[pos]
        )));
    }
    Ok(result)
}

/// Parse one `name = expression` pair for the dispatcher. Unnamed
/// expressions take their own source text as the display name.
pub fn parse_named(name: Option<&str>, source: &str) -> Result<NamedExpr<Expr>, ExprError> {
    let expr = parse_expr(source)?;
    Ok(match name {
        Some(name) => NamedExpr::named(name, expr),
        None => NamedExpr::unnamed(source.trim(), expr),
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    // Comparison
    EqEq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    // Arithmetic
    Plus,
    Minus,
    Star,
    Slash,
    // Grouping and arguments
    LParen,
    RParen,
    Comma,
    Assign,
    // Logical (keywords)
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                // Check for negative number literal
                if i + 1 < chars.len()
                    && chars[i + 1].is_ascii_digit()
                    && (tokens.is_empty()
                        || matches!(
                            tokens.last(),
                            Some(
                                Token::LParen
                                    | Token::Comma
                                    | Token::Assign
                                    | Token::EqEq
                                    | Token::NotEq
                                    | Token::Gt
                                    | Token::Ge
                                    | Token::Lt
                                    | Token::Le
                                    | Token::Plus
                                    | Token::Minus
                                    | Token::Star
                                    | Token::Slash
                                    | Token::And
                                    | Token::Or
                                    | Token::Not
                            )
                        ))
                {
                    let start = i;
                    i += 1;
                    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                        i += 1;
                    }
                    let num_str: String = chars[start..i].iter().collect();
                    if num_str.contains('.') {
                        tokens.push(Token::Float(num_str.parse::<f64>().map_err(|_| {
                            ExprError::ParseError(format!("invalid float: {num_str}"))
                        })?));
                    } else {
                        tokens.push(Token::Int(num_str.parse::<i64>().map_err(|_| {
                            ExprError::ParseError(format!("invalid integer: {num_str}"))
                        })?));
                    }
                } else {
                    tokens.push(Token::Minus);
                    i += 1;
                }
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    tokens.push(Token::Assign);
                    i += 1;
                }
            }
            '!' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    return Err(ExprError::ParseError(
                        "expected '!=' but found single '!'".into(),
                    ));
                }
            }
            '>' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '<' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ExprError::ParseError("unterminated string literal".into()));
                }
                let s: String = chars[start..i].iter().collect();
                tokens.push(Token::Str(s));
                i += 1; // skip closing quote
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                if num_str.contains('.') {
                    tokens.push(Token::Float(num_str.parse::<f64>().map_err(|_| {
                        ExprError::ParseError(format!("invalid float: {num_str}"))
                    })?));
                } else {
                    tokens.push(Token::Int(num_str.parse::<i64>().map_err(|_| {
                        ExprError::ParseError(format!("invalid integer: {num_str}"))
                    })?));
                }
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            _ => {
                return Err(ExprError::ParseError(format!(
                    "unexpected character: '{c}'"
                )));
            }
        }
    }
    Ok(tokens)
}

fn parse_or(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    let mut left = parse_and(tokens, pos)?;
    while *pos < tokens.len() && tokens[*pos] == Token::Or {
        *pos += 1;
        let right = parse_and(tokens, pos)?;
        left = Expr::Or {
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

fn parse_and(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    let mut left = parse_not(tokens, pos)?;
    while *pos < tokens.len() && tokens[*pos] == Token::And {
        *pos += 1;
        let right = parse_not(tokens, pos)?;
        left = Expr::And {
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

fn parse_not(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    if *pos < tokens.len() && tokens[*pos] == Token::Not {
        *pos += 1;
        let inner = parse_not(tokens, pos)?;
        return Ok(Expr::Not {
            expr: Box::new(inner),
        });
    }
    parse_comparison(tokens, pos)
}

fn parse_comparison(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    let left = parse_add(tokens, pos)?;
    if *pos < tokens.len() {
        let op = match &tokens[*pos] {
            Token::EqEq => Some(CompareOp::Eq),
            Token::NotEq => Some(CompareOp::Ne),
            Token::Gt => Some(CompareOp::Gt),
            Token::Ge => Some(CompareOp::Ge),
            Token::Lt => Some(CompareOp::Lt),
            Token::Le => Some(CompareOp::Le),
            _ => None,
        };
        if let Some(op) = op {
            *pos += 1;
            let right = parse_add(tokens, pos)?;
            return Ok(Expr::Compare {
                left: Box::new(left),
                right: Box::new(right),
                op,
            });
        }
    }
    Ok(left)
}

fn parse_add(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    let mut left = parse_mul(tokens, pos)?;
    while *pos < tokens.len() {
        match &tokens[*pos] {
            Token::Plus => {
                *pos += 1;
                let right = parse_mul(tokens, pos)?;
                left = Expr::Add {
                    left: Box::new(left),
                    right: Box::new(right),
                };
            }
            Token::Minus => {
                *pos += 1;
                let right = parse_mul(tokens, pos)?;
                left = Expr::Sub {
                    left: Box::new(left),
                    right: Box::new(right),
                };
            }
            _ => break,
        }
    }
    Ok(left)
}

fn parse_mul(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    let mut left = parse_atom(tokens, pos)?;
    while *pos < tokens.len() {
        match &tokens[*pos] {
            Token::Star => {
                *pos += 1;
                let right = parse_atom(tokens, pos)?;
                left = Expr::Mul {
                    left: Box::new(left),
                    right: Box::new(right),
                };
            }
            Token::Slash => {
                *pos += 1;
                let right = parse_atom(tokens, pos)?;
                left = Expr::Div {
                    left: Box::new(left),
                    right: Box::new(right),
                };
            }
            _ => break,
        }
    }
    Ok(left)
}

fn parse_atom(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    if *pos >= tokens.len() {
        return Err(ExprError::ParseError(
            "unexpected end of expression".into(),
        ));
    }
    match &tokens[*pos] {
        Token::Int(n) => {
            let val = *n;
            *pos += 1;
            Ok(Expr::Literal {
                value: Scalar::Int64(val),
            })
        }
        Token::Float(f) => {
            let val = *f;
            *pos += 1;
            Ok(Expr::Literal {
                value: Scalar::Float64(val),
            })
        }
        Token::Str(s) => {
            let val = s.clone();
            *pos += 1;
            Ok(Expr::Literal {
                value: Scalar::Utf8(val),
            })
        }
        Token::Ident(name) => {
            let name = name.clone();
            *pos += 1;
            if tokens.get(*pos) == Some(&Token::LParen) {
                *pos += 1; // skip '('
                if name == "record" {
                    return parse_record_fields(tokens, pos);
                }
                let Some(func) = Func::from_name(&name) else {
                    return Err(ExprError::UnknownFunction(name));
                };
                let args = parse_call_args(tokens, pos)?;
                return Ok(Expr::Call { func, args });
            }
            Ok(Expr::Column {
                name: ColumnRef(name),
            })
        }
        Token::LParen => {
            *pos += 1; // skip '('
            let inner = parse_or(tokens, pos)?;
            if *pos >= tokens.len() || tokens[*pos] != Token::RParen {
                return Err(ExprError::ParseError("expected closing ')'".into()));
            }
            *pos += 1; // skip ')'
            Ok(inner)
        }
        other => Err(ExprError::ParseError(format!(
            "unexpected token: {other:?}"
        ))),
    }
}

fn parse_call_args(tokens: &[Token], pos: &mut usize) -> Result<Vec<Expr>, ExprError> {
    let mut args = Vec::new();
    if tokens.get(*pos) == Some(&Token::RParen) {
        *pos += 1;
        return Ok(args);
    }
    loop {
        args.push(parse_or(tokens, pos)?);
        match tokens.get(*pos) {
            Some(Token::Comma) => *pos += 1,
            Some(Token::RParen) => {
                *pos += 1;
                return Ok(args);
            }
            _ => {
                return Err(ExprError::ParseError(
                    "expected ',' or ')' in call arguments".into(),
                ));
            }
        }
    }
}

fn parse_record_fields(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    let mut fields = Vec::new();
    if tokens.get(*pos) == Some(&Token::RParen) {
        *pos += 1;
        return Ok(Expr::Record { fields });
    }
    loop {
        let Some(Token::Ident(field)) = tokens.get(*pos) else {
            return Err(ExprError::ParseError(
                "expected a field name in record(...)".into(),
            ));
        };
        let field = field.clone();
        *pos += 1;
        if tokens.get(*pos) != Some(&Token::Assign) {
            return Err(ExprError::ParseError(format!(
                "expected '=' after record field `{field}`"
            )));
        }
        *pos += 1;
        let value = parse_or(tokens, pos)?;
        fields.push((field, value));
        match tokens.get(*pos) {
            Some(Token::Comma) => *pos += 1,
            Some(Token::RParen) => {
                *pos += 1;
                return Ok(Expr::Record { fields });
            }
            _ => {
                return Err(ExprError::ParseError(
                    "expected ',' or ')' in record(...)".into(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use gw_columnar::{Column, CompareOp};
    use gw_eval::{ChoppedFrame, Partition, Verb, build_masks, evaluate_grouped};
    use gw_frame::{Frame, Value};
    use gw_types::{DType, NullKind, Scalar};
    use proptest::prelude::*;

    use super::{ColumnRef, Evaluator, Expr, ExprError, Func, evaluate, parse_expr, parse_named};

    fn int_column(values: &[i64]) -> Value {
        Value::Column(
            Column::from_values(values.iter().map(|v| Scalar::Int64(*v)).collect())
                .expect("column should build"),
        )
    }

    fn float_column(values: &[f64]) -> Value {
        Value::Column(
            Column::from_values(values.iter().map(|v| Scalar::Float64(*v)).collect())
                .expect("column should build"),
        )
    }

    fn utf8_column(values: &[&str]) -> Value {
        Value::Column(
            Column::from_values(values.iter().map(|v| Scalar::Utf8((*v).to_owned())).collect())
                .expect("column should build"),
        )
    }

    fn sales_frame() -> Frame {
        Frame::new(vec![
            (
                "region".to_owned(),
                utf8_column(&["east", "east", "west", "west", "west"]),
            ),
            ("units".to_owned(), int_column(&[10, 20, 30, 40, 50])),
            (
                "price".to_owned(),
                float_column(&[1.0, 2.0, 3.0, 4.0, 5.0]),
            ),
        ])
        .expect("frame should build")
    }

    fn by_region() -> Partition {
        Partition::grouped(vec![vec![0, 1], vec![2, 3, 4]], 5).expect("partition should build")
    }

    fn column(name: &str) -> Expr {
        Expr::Column {
            name: ColumnRef(name.to_owned()),
        }
    }

    #[test]
    fn parses_operator_precedence() {
        let expr = parse_expr("units + price * 2 > 3 and not flag").expect("parse should pass");
        let expected = Expr::And {
            left: Box::new(Expr::Compare {
                left: Box::new(Expr::Add {
                    left: Box::new(column("units")),
                    right: Box::new(Expr::Mul {
                        left: Box::new(column("price")),
                        right: Box::new(Expr::Literal {
                            value: Scalar::Int64(2),
                        }),
                    }),
                }),
                right: Box::new(Expr::Literal {
                    value: Scalar::Int64(3),
                }),
                op: CompareOp::Gt,
            }),
            right: Box::new(Expr::Not {
                expr: Box::new(column("flag")),
            }),
        };
        assert_eq!(expr, expected);
    }

    #[test]
    fn parses_calls_and_records() {
        let expr =
            parse_expr("record(total = sum(units), share = units / sum(units))")
                .expect("parse should pass");
        let sum_units = Expr::Call {
            func: Func::Sum,
            args: vec![column("units")],
        };
        let expected = Expr::Record {
            fields: vec![
                ("total".to_owned(), sum_units.clone()),
                (
                    "share".to_owned(),
                    Expr::Div {
                        left: Box::new(column("units")),
                        right: Box::new(sum_units),
                    },
                ),
            ],
        };
        assert_eq!(expr, expected);
    }

    #[test]
    fn parses_negative_literals_in_arguments() {
        let expr = parse_expr("record(low = -1.5, shift = units + -2)").expect("parse should pass");
        let Expr::Record { fields } = expr else {
            panic!("expected a record expression");
        };
        assert_eq!(
            fields[0].1,
            Expr::Literal {
                value: Scalar::Float64(-1.5)
            }
        );
        assert_eq!(
            fields[1].1,
            Expr::Add {
                left: Box::new(column("units")),
                right: Box::new(Expr::Literal {
                    value: Scalar::Int64(-2)
                }),
            }
        );
    }

    #[test]
    fn rejects_unknown_functions_at_parse_time() {
        let err = parse_expr("median(units)").expect_err("must fail");
        assert_eq!(err.to_string(), "unknown function: median()");
    }

    #[test]
    fn rejects_malformed_records() {
        let err = parse_expr("record(1 = units)").expect_err("must fail");
        assert!(err.to_string().contains("expected a field name"));

        let err = parse_expr("record(a units)").expect_err("must fail");
        assert!(err.to_string().contains("expected '=' after record field `a`"));
    }

    #[test]
    fn rejects_trailing_tokens() {
        let err = parse_expr("units = 1").expect_err("must fail");
        assert!(err.to_string().contains("unexpected token"));
    }

    #[test]
    fn parse_named_keeps_the_source_as_auto_name() {
        let named = parse_named(None, "  units + 1 ").expect("parse should pass");
        assert_eq!(named.name, None);
        assert_eq!(named.auto_name, "units + 1");

        let named = parse_named(Some("gain"), "units + 1").expect("parse should pass");
        assert_eq!(named.name.as_deref(), Some("gain"));
    }

    #[test]
    fn column_references_read_the_group_slice() {
        let frame = sales_frame();
        let partition = by_region();
        let chops = ChoppedFrame::new(&frame, &partition).expect("chops should build");
        let masks = build_masks(&chops);

        let out = evaluate(&column("units"), &masks[1]).expect("eval should pass");
        assert!(out.semantic_eq(&int_column(&[30, 40, 50])));
    }

    #[test]
    fn arithmetic_recycles_length_one_results() {
        let frame = sales_frame();
        let partition = by_region();
        let chops = ChoppedFrame::new(&frame, &partition).expect("chops should build");
        let masks = build_masks(&chops);

        let expr = parse_expr("units - mean(units)").expect("parse should pass");
        let out = evaluate(&expr, &masks[0]).expect("eval should pass");
        assert!(out.semantic_eq(&float_column(&[-5.0, 5.0])));
    }

    #[test]
    fn aggregates_skip_missing_values() {
        let data = Frame::new(vec![(
            "v".to_owned(),
            Value::Column(
                Column::from_values(vec![
                    Scalar::Int64(10),
                    Scalar::Null(NullKind::Null),
                    Scalar::Int64(30),
                ])
                .expect("column should build"),
            ),
        )])
        .expect("frame should build");
        let partition = Partition::ungrouped(3);
        let chops = ChoppedFrame::new(&data, &partition).expect("chops should build");
        let masks = build_masks(&chops);

        for (source, expected) in [
            ("mean(v)", Scalar::Float64(20.0)),
            ("sum(v)", Scalar::Int64(40)),
            ("min(v)", Scalar::Int64(10)),
            ("max(v)", Scalar::Int64(30)),
        ] {
            let expr = parse_expr(source).expect("parse should pass");
            let out = evaluate(&expr, &masks[0]).expect("eval should pass");
            let Value::Column(out) = out else {
                panic!("expected a column from {source}");
            };
            assert_eq!(out.len(), 1, "{source}");
            assert!(out.values()[0].semantic_eq(&expected), "{source}");
        }
    }

    #[test]
    fn boolean_columns_sum_as_counts() {
        let data = Frame::new(vec![(
            "flag".to_owned(),
            Value::Column(
                Column::from_values(vec![
                    Scalar::Bool(true),
                    Scalar::Null(NullKind::Null),
                    Scalar::Bool(false),
                    Scalar::Bool(true),
                ])
                .expect("column should build"),
            ),
        )])
        .expect("frame should build");
        let partition = Partition::ungrouped(4);
        let chops = ChoppedFrame::new(&data, &partition).expect("chops should build");
        let masks = build_masks(&chops);

        let sum = evaluate(&parse_expr("sum(flag)").expect("parse"), &masks[0]).expect("eval");
        assert!(sum.semantic_eq(&int_column(&[2])));

        let mean = evaluate(&parse_expr("mean(flag)").expect("parse"), &masks[0]).expect("eval");
        assert!(mean.semantic_eq(&float_column(&[2.0 / 3.0])));
    }

    #[test]
    fn aggregates_over_nothing_yield_identity_or_missing() {
        let data = Frame::new(vec![(
            "v".to_owned(),
            Value::Column(
                Column::from_values(vec![
                    Scalar::Null(NullKind::Null),
                    Scalar::Null(NullKind::Null),
                ])
                .expect("column should build"),
            ),
        )])
        .expect("frame should build");
        let partition = Partition::ungrouped(2);
        let chops = ChoppedFrame::new(&data, &partition).expect("chops should build");
        let masks = build_masks(&chops);

        let sum = evaluate(&parse_expr("sum(v)").expect("parse"), &masks[0]).expect("eval");
        assert!(sum.semantic_eq(&int_column(&[0])));

        let mean = evaluate(&parse_expr("mean(v)").expect("parse"), &masks[0]).expect("eval");
        let Value::Column(mean) = mean else {
            panic!("expected a column");
        };
        assert_eq!(mean.dtype(), DType::Float64);
        assert!(mean.values()[0].is_missing());

        let min = evaluate(&parse_expr("min(v)").expect("parse"), &masks[0]).expect("eval");
        let Value::Column(min) = min else {
            panic!("expected a column");
        };
        assert!(min.values()[0].is_missing());
    }

    #[test]
    fn group_context_functions_read_the_mask() {
        let frame = sales_frame();
        let partition = by_region();
        let chops = ChoppedFrame::new(&frame, &partition).expect("chops should build");
        let masks = build_masks(&chops);

        let n = evaluate(&parse_expr("n()").expect("parse"), &masks[1]).expect("eval");
        assert!(n.semantic_eq(&int_column(&[3])));

        let id = evaluate(&parse_expr("group_id()").expect("parse"), &masks[1]).expect("eval");
        assert!(id.semantic_eq(&int_column(&[2])));
    }

    #[test]
    fn records_recycle_scalar_fields() {
        let frame = sales_frame();
        let partition = by_region();
        let chops = ChoppedFrame::new(&frame, &partition).expect("chops should build");
        let masks = build_masks(&chops);

        let expr = parse_expr("record(total = sum(units), each = units)").expect("parse");
        let out = evaluate(&expr, &masks[0]).expect("eval should pass");
        let Value::Record(record) = out else {
            panic!("expected a record");
        };
        assert!(
            record
                .column("total")
                .expect("total field")
                .semantic_eq(&int_column(&[30, 30]))
        );
        assert!(
            record
                .column("each")
                .expect("each field")
                .semantic_eq(&int_column(&[10, 20]))
        );
    }

    #[test]
    fn ragged_records_name_the_offending_field() {
        let frame = sales_frame();
        let partition = by_region();
        let chops = ChoppedFrame::new(&frame, &partition).expect("chops should build");
        let mut masks = build_masks(&chops);
        masks[0].bind("three", int_column(&[1, 2, 3]));

        let expr = Expr::Record {
            fields: vec![
                ("a".to_owned(), column("three")),
                ("b".to_owned(), column("units")),
            ],
        };
        let err = evaluate(&expr, &masks[0]).expect_err("must fail");
        assert_eq!(err.to_string(), "record field `b` has size 2, expected 3");
    }

    #[test]
    fn arity_and_input_errors_name_the_function() {
        let frame = sales_frame();
        let partition = by_region();
        let chops = ChoppedFrame::new(&frame, &partition).expect("chops should build");
        let masks = build_masks(&chops);

        let expr = parse_expr("mean(units, price)").expect("parse");
        let err = evaluate(&expr, &masks[0]).expect_err("must fail");
        assert_eq!(err.to_string(), "mean() expects 1 argument(s), found 2");

        let expr = parse_expr("mean(region)").expect("parse");
        let err = evaluate(&expr, &masks[0]).expect_err("must fail");
        assert_eq!(err.to_string(), "mean() expects a numeric column");
    }

    #[test]
    fn unknown_columns_are_reported_by_name() {
        let frame = sales_frame();
        let partition = by_region();
        let chops = ChoppedFrame::new(&frame, &partition).expect("chops should build");
        let masks = build_masks(&chops);

        let err = evaluate(&parse_expr("missing + 1").expect("parse"), &masks[0])
            .expect_err("must fail");
        assert!(matches!(err, ExprError::UnknownColumn(name) if name == "missing"));
    }

    #[test]
    fn fast_and_fallback_agree_on_mutate() {
        let frame = sales_frame();
        let partition = by_region();
        let exprs = vec![
            parse_named(Some("gain"), "units * price").expect("parse"),
            parse_named(None, "record(share = units / sum(units), idx = group_id())")
                .expect("parse"),
        ];

        let fast = evaluate_grouped(&frame, &partition, Verb::Mutate, &exprs, &Evaluator::new())
            .expect("fast pass");
        let slow = evaluate_grouped(
            &frame,
            &partition,
            Verb::Mutate,
            &exprs,
            &Evaluator::without_fast_path(),
        )
        .expect("fallback pass");

        assert_eq!(fast.names(), slow.names());
        assert_eq!(fast.n_groups(), slow.n_groups());
        for group in 0..fast.n_groups() {
            for (lhs, rhs) in fast.group(group).iter().zip(slow.group(group)) {
                assert!(lhs.semantic_eq(rhs));
            }
        }
    }

    #[test]
    fn filter_fast_path_matches_fallback_validation() {
        let frame = sales_frame();
        let partition = by_region();

        let keep = vec![parse_named(None, "units > 15").expect("parse")];
        let fast = evaluate_grouped(&frame, &partition, Verb::Filter, &keep, &Evaluator::new())
            .expect("filter should pass");
        assert!(fast.group(0)[0].semantic_eq(&Value::Column(
            Column::from_values(vec![Scalar::Bool(false), Scalar::Bool(true)]).expect("mask")
        )));

        let bad = vec![parse_named(None, "units + 1").expect("parse")];
        for evaluator in [Evaluator::new(), Evaluator::without_fast_path()] {
            let err = evaluate_grouped(&frame, &partition, Verb::Filter, &bad, &evaluator)
                .expect_err("must fail");
            assert_eq!(
                err.to_string(),
                "expression 1 in group 1: incompatible type: must be a logical vector"
            );
        }
    }

    #[test]
    fn summarise_collapses_each_group() {
        let frame = sales_frame();
        let partition = by_region();
        let exprs = vec![
            parse_named(Some("avg"), "mean(price)").expect("parse"),
            parse_named(Some("rows"), "n()").expect("parse"),
        ];

        let out = evaluate_grouped(&frame, &partition, Verb::Summarise, &exprs, &Evaluator::new())
            .expect("summarise should pass");
        assert!(out.result(0, "avg").expect("avg").semantic_eq(&float_column(&[1.5])));
        assert!(out.result(1, "avg").expect("avg").semantic_eq(&float_column(&[4.0])));
        assert!(out.result(1, "rows").expect("rows").semantic_eq(&int_column(&[3])));
    }

    #[test]
    fn rebound_names_feed_later_expressions() {
        let frame = sales_frame();
        let partition = by_region();
        let exprs = vec![
            parse_named(Some("units"), "units * 2").expect("parse"),
            parse_named(Some("total"), "sum(units)").expect("parse"),
        ];

        let fast = evaluate_grouped(&frame, &partition, Verb::Mutate, &exprs, &Evaluator::new())
            .expect("pass");
        assert!(fast.result(0, "total").expect("total").semantic_eq(&int_column(&[60])));
        assert!(fast.result(1, "total").expect("total").semantic_eq(&int_column(&[240])));

        let slow = evaluate_grouped(
            &frame,
            &partition,
            Verb::Mutate,
            &exprs,
            &Evaluator::without_fast_path(),
        )
        .expect("pass");
        for group in 0..fast.n_groups() {
            for (lhs, rhs) in fast.group(group).iter().zip(slow.group(group)) {
                assert!(lhs.semantic_eq(rhs));
            }
        }
    }

    #[test]
    fn evaluator_failures_carry_the_group_site() {
        let frame = sales_frame();
        let partition = by_region();
        let exprs = vec![
            parse_named(Some("ok"), "units + 1").expect("parse"),
            parse_named(Some("bad"), "missing * 2").expect("parse"),
        ];

        let err = evaluate_grouped(&frame, &partition, Verb::Mutate, &exprs, &Evaluator::new())
            .expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "expression 2 in group 1: unknown column reference: missing"
        );
    }

    #[test]
    fn expr_serde_round_trip() {
        let expr = parse_expr("record(keep = units > 3, avg = mean(price))").expect("parse");
        let json = serde_json::to_string(&expr).expect("serialize");
        assert!(json.contains("\"kind\":\"record\""));
        let back: Expr = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, expr);
    }

    proptest! {
        #[test]
        fn parser_never_panics(input in "[ -~]{0,40}") {
            let _ = parse_expr(&input);
        }

        #[test]
        fn fast_path_agrees_with_fallback(
            values in prop::collection::vec(-50i64..50, 1..12),
            cut in 0usize..12,
        ) {
            let cut = cut.min(values.len());
            let frame = Frame::new(vec![("v".to_owned(), int_column(&values))])
                .expect("frame should build");
            let partition = Partition::grouped(
                vec![(0..cut).collect(), (cut..values.len()).collect()],
                values.len(),
            )
            .expect("partition should build");
            let exprs = vec![
                parse_named(Some("centered"), "v - mean(v)").expect("parse"),
                parse_named(Some("keep"), "v >= 0").expect("parse"),
            ];

            let fast = evaluate_grouped(&frame, &partition, Verb::Mutate, &exprs, &Evaluator::new())
                .expect("fast pass");
            let slow = evaluate_grouped(
                &frame,
                &partition,
                Verb::Mutate,
                &exprs,
                &Evaluator::without_fast_path(),
            )
            .expect("fallback pass");

            prop_assert_eq!(fast.names(), slow.names());
            for group in 0..fast.n_groups() {
                for (lhs, rhs) in fast.group(group).iter().zip(slow.group(group)) {
                    prop_assert!(lhs.semantic_eq(rhs));
                }
            }
        }
    }
}
