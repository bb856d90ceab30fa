//! Immutable query expression tree.
//!
//! Every tree renders (via `Display`) to text that [`crate::parse`] reads back
//! into an equivalent tree; that text is what travels to the server.

use std::fmt;

use ktable_common::{KtableError, Result};
use serde::{Deserialize, Serialize};

/// Query expression node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Field(Field),
    Func(Func),
    Scalar(Scalar),
    BinOp(BinOp),
    UnaryOp(UnaryOp),
    Parens(Box<Op>),
}

/// Column reference, optionally qualified by an invocant (`a.b`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub invocant: Option<Box<Op>>,
}

/// Function call, optionally qualified (`a.f(x)`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Func {
    pub name: String,
    pub args: Vec<Op>,
    pub invocant: Option<Box<Op>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarKind {
    Number,
    String,
    Bool,
    Null,
}

/// Literal, kept as its source text plus a type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    pub src: String,
    pub kind: ScalarKind,
}

/// Decoded literal value.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Pow,
    And,
    Or,
    Intersects,
    Contains,
    Within,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinOp {
    pub left: Box<Op>,
    pub op: BinaryOp,
    pub right: Box<Op>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnaryOp {
    pub prefix: String,
    pub expr: Box<Op>,
    pub suffix: String,
}

// Binding strength, used both by the parser and when rendering text.
pub(crate) const PREC_OR: u8 = 1;
pub(crate) const PREC_AND: u8 = 2;
pub(crate) const PREC_NOT: u8 = 3;
pub(crate) const PREC_EQ: u8 = 4;
pub(crate) const PREC_ORD: u8 = 5;
pub(crate) const PREC_ADD: u8 = 6;
pub(crate) const PREC_MUL: u8 = 7;
pub(crate) const PREC_POW: u8 = 8;
const PREC_ATOM: u8 = 10;

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Pow => "**",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Intersects => "intersects",
            BinaryOp::Contains => "contains",
            BinaryOp::Within => "within",
        }
    }

    pub(crate) fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => PREC_OR,
            BinaryOp::And => PREC_AND,
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Intersects
            | BinaryOp::Contains
            | BinaryOp::Within => PREC_EQ,
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => PREC_ORD,
            BinaryOp::Plus | BinaryOp::Minus => PREC_ADD,
            BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Modulo => PREC_MUL,
            BinaryOp::Pow => PREC_POW,
        }
    }

    /// `==`, `!=`, `<`, `<=`, `>`, `>=`.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }

    /// `intersects`, `contains`, `within`.
    pub fn is_spatial(self) -> bool {
        matches!(
            self,
            BinaryOp::Intersects | BinaryOp::Contains | BinaryOp::Within
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Plus
                | BinaryOp::Minus
                | BinaryOp::Multiply
                | BinaryOp::Divide
                | BinaryOp::Modulo
                | BinaryOp::Pow
        )
    }

    /// Operator giving the same result with operands swapped.
    pub fn mirrored(self) -> Option<BinaryOp> {
        match self {
            BinaryOp::Eq => Some(BinaryOp::Eq),
            BinaryOp::NotEq => Some(BinaryOp::NotEq),
            BinaryOp::Lt => Some(BinaryOp::Gt),
            BinaryOp::LtEq => Some(BinaryOp::GtEq),
            BinaryOp::Gt => Some(BinaryOp::Lt),
            BinaryOp::GtEq => Some(BinaryOp::LtEq),
            BinaryOp::Intersects => Some(BinaryOp::Intersects),
            BinaryOp::Contains => Some(BinaryOp::Within),
            BinaryOp::Within => Some(BinaryOp::Contains),
            _ => None,
        }
    }

    fn right_assoc(self) -> bool {
        matches!(self, BinaryOp::Pow)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl Op {
    pub fn field(name: impl Into<String>) -> Op {
        Op::Field(Field {
            name: name.into(),
            invocant: None,
        })
    }

    pub fn func(name: impl Into<String>, args: Vec<Op>) -> Op {
        Op::Func(Func {
            name: name.into(),
            args,
            invocant: None,
        })
    }

    pub fn binary(left: Op, op: BinaryOp, right: Op) -> Op {
        Op::BinOp(BinOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
    }

    pub fn parens(inner: Op) -> Op {
        Op::Parens(Box::new(inner))
    }

    /// `~inner`.
    pub fn negate(inner: Op) -> Op {
        Op::UnaryOp(UnaryOp {
            prefix: "~".to_string(),
            expr: Box::new(inner),
            suffix: String::new(),
        })
    }

    pub fn and(left: Op, right: Op) -> Op {
        Op::binary(left, BinaryOp::And, right)
    }

    pub fn or(left: Op, right: Op) -> Op {
        Op::binary(left, BinaryOp::Or, right)
    }

    pub fn null() -> Op {
        Op::Scalar(Scalar::null())
    }

    pub fn bool(v: bool) -> Op {
        Op::Scalar(Scalar::from_bool(v))
    }

    pub fn str(v: &str) -> Op {
        Op::Scalar(Scalar::from_str_value(v))
    }

    /// Float literal; NaN and infinities have no literal form.
    pub fn f64(v: f64) -> Result<Op> {
        Ok(Op::Scalar(Scalar::from_f64(v)?))
    }

    pub fn i64(v: i64) -> Op {
        Op::Scalar(Scalar::from_i64(v))
    }

    /// Pre-order traversal of every node.
    pub fn all(&self) -> All<'_> {
        All { stack: vec![self] }
    }

    /// Rebuilds the tree applying `f` to every node, parent first.
    ///
    /// `f` sees each node before its children; the children of whatever `f`
    /// returns are then walked in turn.
    pub fn walk<F>(self, f: &mut F) -> Op
    where
        F: FnMut(Op) -> Op,
    {
        let out = f(self);
        match out {
            Op::Field(Field { name, invocant }) => Op::Field(Field {
                name,
                invocant: invocant.map(|i| Box::new(i.walk(f))),
            }),
            Op::Func(Func {
                name,
                args,
                invocant,
            }) => Op::Func(Func {
                name,
                args: args.into_iter().map(|a| a.walk(f)).collect(),
                invocant: invocant.map(|i| Box::new(i.walk(f))),
            }),
            Op::Scalar(s) => Op::Scalar(s),
            Op::BinOp(BinOp { left, op, right }) => Op::BinOp(BinOp {
                left: Box::new(left.walk(f)),
                op,
                right: Box::new(right.walk(f)),
            }),
            Op::UnaryOp(UnaryOp {
                prefix,
                expr,
                suffix,
            }) => Op::UnaryOp(UnaryOp {
                prefix,
                expr: Box::new(expr.walk(f)),
                suffix,
            }),
            Op::Parens(inner) => Op::Parens(Box::new(inner.walk(f))),
        }
    }

    /// Dotted names of every field referenced by the tree, deduplicated in first-seen order.
    pub fn fields(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for node in self.all() {
            if let Op::Field(field) = node {
                if let Some(path) = field.path() {
                    if !out.contains(&path) {
                        out.push(path);
                    }
                }
            }
        }
        out
    }

    /// Dotted path when this node is a plain (possibly qualified) field.
    pub fn field_path(&self) -> Option<String> {
        match self {
            Op::Field(f) => f.path(),
            _ => None,
        }
    }

    pub(crate) fn precedence(&self) -> u8 {
        match self {
            Op::BinOp(b) => b.op.precedence(),
            Op::UnaryOp(_) => PREC_NOT,
            _ => PREC_ATOM,
        }
    }
}

/// Iterator returned by [`Op::all`].
pub struct All<'a> {
    stack: Vec<&'a Op>,
}

impl<'a> Iterator for All<'a> {
    type Item = &'a Op;

    fn next(&mut self) -> Option<&'a Op> {
        let node = self.stack.pop()?;
        match node {
            Op::Field(f) => {
                if let Some(inv) = &f.invocant {
                    self.stack.push(inv);
                }
            }
            Op::Func(func) => {
                for a in func.args.iter().rev() {
                    self.stack.push(a);
                }
                if let Some(inv) = &func.invocant {
                    self.stack.push(inv);
                }
            }
            Op::Scalar(_) => {}
            Op::BinOp(b) => {
                self.stack.push(&b.right);
                self.stack.push(&b.left);
            }
            Op::UnaryOp(u) => self.stack.push(&u.expr),
            Op::Parens(inner) => self.stack.push(inner),
        }
        Some(node)
    }
}

impl Field {
    /// `a.b.c` for a chain of fields; `None` if an invocant is not a field.
    pub fn path(&self) -> Option<String> {
        match &self.invocant {
            None => Some(self.name.clone()),
            Some(inv) => match inv.as_ref() {
                Op::Field(parent) => parent.path().map(|p| format!("{p}.{}", self.name)),
                _ => None,
            },
        }
    }
}

impl BinOp {
    /// Swaps operands, mirroring the operator.
    ///
    /// Defined for order and spatial predicates only.
    pub fn flip(&self) -> Result<BinOp> {
        let op = self.op.mirrored().ok_or_else(|| {
            KtableError::Compile(format!("can't flip operator '{}'", self.op))
        })?;
        Ok(BinOp {
            left: self.right.clone(),
            op,
            right: self.left.clone(),
        })
    }
}

impl UnaryOp {
    /// True for the logical negation prefixes.
    pub fn is_negation(&self) -> bool {
        matches!(self.prefix.as_str(), "~" | "not" | "!")
    }
}

impl Scalar {
    pub fn null() -> Self {
        Self {
            src: "null".to_string(),
            kind: ScalarKind::Null,
        }
    }

    pub fn from_bool(v: bool) -> Self {
        Self {
            src: if v { "true" } else { "false" }.to_string(),
            kind: ScalarKind::Bool,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        Self {
            src: v.to_string(),
            kind: ScalarKind::Number,
        }
    }

    pub fn from_f64(v: f64) -> Result<Self> {
        if !v.is_finite() {
            return Err(KtableError::Compile(format!("no literal form for {v}")));
        }
        Ok(Self {
            src: format!("{v:?}"),
            kind: ScalarKind::Number,
        })
    }

    /// String literal, stored JSON-quoted.
    pub fn from_str_value(v: &str) -> Self {
        Self {
            src: serde_json::Value::String(v.to_string()).to_string(),
            kind: ScalarKind::String,
        }
    }

    /// Literal from a plain JSON value (numbers, strings, bools, null).
    pub fn from_json(v: &serde_json::Value) -> Result<Self> {
        match v {
            serde_json::Value::Null => Ok(Self::null()),
            serde_json::Value::Bool(b) => Ok(Self::from_bool(*b)),
            serde_json::Value::Number(n) => Ok(Self {
                src: n.to_string(),
                kind: ScalarKind::Number,
            }),
            serde_json::Value::String(s) => Ok(Self::from_str_value(s)),
            other => Err(KtableError::Parse {
                message: "expected a scalar value".to_string(),
                at: other.to_string(),
            }),
        }
    }

    pub fn value(&self) -> Result<ScalarValue> {
        match self.kind {
            ScalarKind::Null => Ok(ScalarValue::Null),
            ScalarKind::Bool => match self.src.to_ascii_lowercase().as_str() {
                "true" => Ok(ScalarValue::Boolean(true)),
                "false" => Ok(ScalarValue::Boolean(false)),
                _ => Err(KtableError::Compile(format!(
                    "unexpected bool value: {}",
                    self.src
                ))),
            },
            ScalarKind::Number => {
                if let Ok(i) = self.src.parse::<i64>() {
                    return Ok(ScalarValue::Int64(i));
                }
                self.src.parse::<f64>().map(ScalarValue::Float64).map_err(|_| {
                    KtableError::Compile(format!("unexpected number: {}", self.src))
                })
            }
            ScalarKind::String => {
                if let Some(raw) = self
                    .src
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                {
                    return Ok(ScalarValue::Utf8(raw.to_string()));
                }
                serde_json::from_str::<String>(&self.src)
                    .map(ScalarValue::Utf8)
                    .map_err(|e| {
                        KtableError::Compile(format!("bad string literal {}: {e}", self.src))
                    })
            }
        }
    }

    /// String payload for string literals.
    pub fn as_str_value(&self) -> Option<String> {
        match self.value() {
            Ok(ScalarValue::Utf8(s)) => Some(s),
            _ => None,
        }
    }
}

const KEYWORDS: [&str; 21] = [
    "and", "AND", "or", "OR", "not", "NOT", "is", "IS", "null", "NULL", "None", "true", "True",
    "TRUE", "false", "False", "FALSE", "intersects", "contains", "within", "in",
];

fn is_plain_segment(seg: &str) -> bool {
    let mut chars = seg.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !KEYWORDS.contains(&seg)
}

// Names the parser would not read back verbatim go in backticks.
fn write_name(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    if name.split('.').all(is_plain_segment) {
        f.write_str(name)
    } else {
        write!(f, "`{name}`")
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, child: &Op, wrap: bool) -> fmt::Result {
    if wrap {
        write!(f, "({child})")
    } else {
        write!(f, "{child}")
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Field(field) => {
                if let Some(inv) = &field.invocant {
                    write_operand(f, inv, inv.precedence() < PREC_ATOM)?;
                    write!(f, ".")?;
                }
                write_name(f, &field.name)
            }
            Op::Func(func) => {
                if let Some(inv) = &func.invocant {
                    write_operand(f, inv, inv.precedence() < PREC_ATOM)?;
                    write!(f, ".")?;
                }
                write!(f, "{}(", func.name)?;
                for (i, a) in func.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Op::Scalar(s) => f.write_str(&s.src),
            Op::BinOp(b) => {
                let p = b.op.precedence();
                let (wrap_left, wrap_right) = if b.op.right_assoc() {
                    (b.left.precedence() <= p, b.right.precedence() < p)
                } else {
                    (b.left.precedence() < p, b.right.precedence() <= p)
                };
                write_operand(f, &b.left, wrap_left)?;
                write!(f, " {} ", b.op)?;
                write_operand(f, &b.right, wrap_right)
            }
            Op::UnaryOp(u) => {
                f.write_str(&u.prefix)?;
                if u.prefix.chars().last().is_some_and(|c| c.is_alphabetic()) {
                    f.write_str(" ")?;
                }
                write_operand(f, &u.expr, matches!(u.expr.as_ref(), Op::BinOp(_)))?;
                f.write_str(&u.suffix)
            }
            Op::Parens(inner) => write!(f, "({inner})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use ktable_common::KtableError;

    use super::{BinaryOp, Op, ScalarValue};

    #[test]
    fn all_is_preorder() {
        let op = Op::and(
            Op::binary(Op::field("a"), BinaryOp::Eq, Op::i64(1)),
            Op::negate(Op::field("b")),
        );
        let kinds = op
            .all()
            .map(|n| match n {
                Op::BinOp(b) => b.op.symbol().to_string(),
                Op::Field(f) => f.name.clone(),
                Op::Scalar(s) => s.src.clone(),
                Op::UnaryOp(u) => u.prefix.clone(),
                _ => "?".to_string(),
            })
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["and", "==", "a", "1", "~", "b"]);
    }

    #[test]
    fn walk_rewrites_every_field() {
        let op = Op::binary(Op::field("a"), BinaryOp::Plus, Op::field("b"));
        let out = op.walk(&mut |n| match n {
            Op::Field(f) => Op::field(format!("{}_x", f.name)),
            other => other,
        });
        assert_eq!(out.to_string(), "a_x + b_x");
    }

    #[test]
    fn flip_mirrors_order_and_rejects_arithmetic() {
        let Op::BinOp(b) = Op::binary(Op::i64(3), BinaryOp::Lt, Op::field("a")) else {
            unreachable!()
        };
        let flipped = b.flip().expect("flip");
        assert_eq!(Op::BinOp(flipped).to_string(), "a > 3");

        let Op::BinOp(b) = Op::binary(Op::i64(3), BinaryOp::Plus, Op::field("a")) else {
            unreachable!()
        };
        let err = b.flip().expect_err("not flippable");
        assert!(err.to_string().contains("'+'"));
    }

    #[test]
    fn display_adds_parens_only_where_needed() {
        let op = Op::and(
            Op::or(Op::field("a"), Op::field("b")),
            Op::binary(
                Op::binary(Op::field("x"), BinaryOp::Plus, Op::field("q")),
                BinaryOp::GtEq,
                Op::f64(-1.5).expect("finite"),
            ),
        );
        assert_eq!(op.to_string(), "(a or b) and x + q >= -1.5");
        assert_eq!(Op::negate(op.clone()).to_string(), format!("~({op})"));
    }

    #[test]
    fn non_finite_floats_have_no_literal() {
        for v in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(Op::f64(v), Err(KtableError::Compile(_))));
        }
        let op = Op::f64(0.25).expect("finite");
        assert_eq!(crate::parse(&op.to_string()).expect("reparse"), op);
    }

    #[test]
    fn string_scalars_decode_both_quote_styles() {
        let Op::Scalar(s) = Op::str("it's \"quoted\"") else {
            unreachable!()
        };
        assert_eq!(
            s.value().expect("value"),
            ScalarValue::Utf8("it's \"quoted\"".to_string())
        );
    }

    #[test]
    fn fields_are_dotted_and_deduplicated() {
        let op = Op::and(
            Op::binary(Op::field("loc.x"), BinaryOp::Gt, Op::i64(0)),
            Op::binary(Op::field("loc.x"), BinaryOp::Lt, Op::field("name")),
        );
        assert_eq!(op.fields(), vec!["loc.x".to_string(), "name".to_string()]);
    }
}
