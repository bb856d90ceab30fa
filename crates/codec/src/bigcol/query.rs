//! Pushdown of comparisons on big columns.
//!
//! The server only sees tokens, so a predicate on the full value is replaced
//! by one on the token that keeps every true match (false positives are
//! removed by the exact filter after decoding). Under negation the rewrite
//! must instead imply the original, so ranges collapse to `false`.

use arrow_schema::{DataType, Schema};
use ktable_common::{KtableError, Result};
use ktable_expr::{BinOp, BinaryOp, Func, Op, Scalar, ScalarKind, ScalarValue, UnaryOp};
use tracing::{debug, warn};

use super::reference::{is_short, str_prefix};
use super::is_big_field;

/// Rewrites predicates on big columns of `schema` into token predicates.
pub fn inner_exp(schema: &Schema, op: &Op) -> Result<Op> {
    let ctx = Ctx {
        schema,
        negate: false,
    };
    let out = ctx.visit(op)?;
    debug!(query = %out, "big: inner expression");
    Ok(out)
}

#[derive(Clone, Copy)]
struct Ctx<'a> {
    schema: &'a Schema,
    negate: bool,
}

impl Ctx<'_> {
    fn neg(self) -> Self {
        Self {
            negate: !self.negate,
            ..self
        }
    }

    fn big_type(&self, op: &Op) -> Option<DataType> {
        let name = op.field_path()?;
        let field = self.schema.field_with_name(&name).ok()?;
        is_big_field(field).then(|| field.data_type().clone())
    }

    fn visit(self, op: &Op) -> Result<Op> {
        match op {
            Op::Field(_) | Op::Scalar(_) => Ok(op.clone()),
            Op::Parens(inner) => Ok(Op::parens(self.visit(inner)?)),
            Op::UnaryOp(u) => {
                let cur = if u.is_negation() { self.neg() } else { self };
                Ok(Op::UnaryOp(UnaryOp {
                    prefix: u.prefix.clone(),
                    expr: Box::new(cur.visit(&u.expr)?),
                    suffix: u.suffix.clone(),
                }))
            }
            Op::Func(f) => {
                let cur = if f.name == "invert" { self.neg() } else { self };
                Ok(Op::Func(Func {
                    name: f.name.clone(),
                    args: f.args.iter().map(|a| cur.visit(a)).collect::<Result<_>>()?,
                    invocant: match &f.invocant {
                        Some(inv) => Some(Box::new(cur.visit(inv)?)),
                        None => None,
                    },
                }))
            }
            Op::BinOp(b) => self.visit_binop(b),
        }
    }

    fn visit_binop(self, b: &BinOp) -> Result<Op> {
        if let Some(dt) = self.big_type(&b.left) {
            return self.rewrite(b, dt);
        }
        if self.big_type(&b.right).is_some() {
            return match b.flip() {
                Ok(flipped) => self.visit_binop(&flipped),
                Err(_) => {
                    warn!(query = %Op::BinOp(b.clone()), "can't flip big-column expression");
                    Ok(self.unknown())
                }
            };
        }
        Ok(Op::binary(self.visit(&b.left)?, b.op, self.visit(&b.right)?))
    }

    /// Always-admit placeholder: `true`, or `false` under negation.
    fn unknown(self) -> Op {
        Op::bool(!self.negate)
    }

    fn rewrite(self, b: &BinOp, dt: DataType) -> Result<Op> {
        let literal = match b.right.as_ref() {
            Op::Scalar(Scalar {
                kind: ScalarKind::Null,
                ..
            }) => return Ok(Op::BinOp(b.clone())),
            Op::Scalar(s) => s,
            _ => return Ok(self.unknown()),
        };
        if !b.op.is_comparison() {
            return Err(KtableError::Compile(format!(
                "operator '{}' not supported on big column {}",
                b.op, b.left
            )));
        }
        let ScalarValue::Utf8(value) = literal.value()? else {
            return Err(KtableError::Compile(format!(
                "big column {} compared with non-string literal {}",
                b.left, literal.src
            )));
        };
        if dt != DataType::Utf8 {
            return Ok(self.unknown());
        }
        let field = b.left.as_ref().clone();
        let short = is_short(value.len());
        Ok(match b.op {
            BinaryOp::Eq | BinaryOp::NotEq if short => {
                Op::binary(field, b.op, Op::str(&format!("{value}~")))
            }
            BinaryOp::Eq if self.negate => Op::bool(false),
            BinaryOp::Eq => {
                let low = str_prefix(&value).to_string();
                match successor(&low) {
                    Some(high) => Op::parens(Op::and(
                        Op::binary(Op::str(&low), BinaryOp::LtEq, field.clone()),
                        Op::binary(field, BinaryOp::Lt, Op::str(&high)),
                    )),
                    None => Op::binary(field, BinaryOp::GtEq, Op::str(&low)),
                }
            }
            BinaryOp::NotEq => self.unknown(),
            BinaryOp::Gt | BinaryOp::GtEq if self.negate => Op::bool(false),
            BinaryOp::Gt | BinaryOp::GtEq => {
                Op::binary(field, b.op, Op::str(str_prefix(&value)))
            }
            // tokens append '~' and pointers, so no upper bound is safe
            _ => self.unknown(),
        })
    }
}

/// `s` with its last character replaced by the next code point.
fn successor(s: &str) -> Option<String> {
    let mut chars = s.chars();
    let last = chars.next_back()?;
    let next = (last as u32 + 1..=char::MAX as u32).find_map(char::from_u32)?;
    let mut out = chars.as_str().to_string();
    out.push(next);
    Some(out)
}
