//! OQS: the nested-operator JSON query dialect.
//!
//! A document is either a plain JSON scalar, a `"$field"` reference, a GeoJSON
//! geometry object, or a single-key object `{"#OPERATOR": [operands...]}`.

use ktable_common::{KtableError, Result};
use serde_json::Value;

use crate::ast::{BinaryOp, Op, Scalar};
use crate::geometry::{geojson_to_wkt, looks_like_geojson};

/// Parses an OQS document into an expression tree.
pub fn parse_oqs(doc: &Value) -> Result<Op> {
    match node(doc)? {
        Node::Op(op) => Ok(op),
        Node::List(_) => Err(oqs_error("a list is only valid as an operand", doc)),
    }
}

/// Parses OQS JSON text.
pub fn parse_oqs_str(text: &str) -> Result<Op> {
    let doc: Value = serde_json::from_str(text).map_err(|e| KtableError::Parse {
        message: format!("invalid OQS JSON: {e}"),
        at: text.chars().take(80).collect(),
    })?;
    parse_oqs(&doc)
}

/// Folds a list into a balanced tree by pairing neighbours, level by level.
///
/// `[a, b, c, d, e]` becomes `((a op b) op (c op d)) op e`. Returns `None`
/// for an empty list.
pub fn list_to_tree_expression(mut ops: Vec<Op>, op: BinaryOp) -> Option<Op> {
    while ops.len() > 1 {
        let mut next = Vec::with_capacity(ops.len().div_ceil(2));
        let mut it = ops.into_iter();
        while let Some(left) = it.next() {
            match it.next() {
                Some(right) => next.push(Op::binary(left, op, right)),
                None => next.push(left),
            }
        }
        ops = next;
    }
    ops.pop()
}

enum Node {
    Op(Op),
    List(Vec<Op>),
}

fn oqs_error(message: &str, doc: &Value) -> KtableError {
    KtableError::Parse {
        message: message.to_string(),
        at: doc.to_string(),
    }
}

fn node(doc: &Value) -> Result<Node> {
    match doc {
        Value::Object(map) if map.is_empty() => Ok(Node::Op(Op::null())),
        Value::Object(map) => {
            if looks_like_geojson(doc) {
                return Ok(Node::Op(Op::str(&geojson_to_wkt(doc)?)));
            }
            if map.len() != 1 {
                return Err(oqs_error("expected a single operator key", doc));
            }
            let Some((key, operands)) = map.iter().next() else {
                return Ok(Node::Op(Op::null()));
            };
            operator(&key.to_ascii_lowercase(), operands, doc)
        }
        Value::String(s) => match s.strip_prefix('$') {
            Some(name) => Ok(Node::Op(Op::field(name))),
            None => Ok(Node::Op(Op::str(s))),
        },
        Value::Array(_) => Err(oqs_error("bare list; use #LIST", doc)),
        scalar => Ok(Node::Op(Op::Scalar(Scalar::from_json(scalar)?))),
    }
}

fn operand_values(operands: &Value) -> Vec<&Value> {
    match operands {
        Value::Array(items) => items.iter().collect(),
        Value::Null => vec![],
        single => vec![single],
    }
}

fn single_op(v: &Value) -> Result<Op> {
    match node(v)? {
        Node::Op(op) => Ok(op),
        Node::List(_) => Err(oqs_error("unexpected list operand", v)),
    }
}

fn nth(args: &[&Value], i: usize, doc: &Value) -> Result<Op> {
    let v = args
        .get(i)
        .ok_or_else(|| oqs_error(&format!("missing operand #{}", i + 1), doc))?;
    single_op(v)
}

fn binary(args: &[&Value], op: BinaryOp, doc: &Value) -> Result<Node> {
    if args.len() != 2 {
        return Err(oqs_error("expected exactly two operands", doc));
    }
    Ok(Node::Op(Op::binary(nth(args, 0, doc)?, op, nth(args, 1, doc)?)))
}

// Variadic arithmetic accepts either the operands inline or one #LIST.
fn folded(args: &[&Value], op: BinaryOp, balanced: bool, doc: &Value) -> Result<Node> {
    let mut ops = Vec::new();
    for v in args {
        match node(v)? {
            Node::Op(o) => ops.push(o),
            Node::List(items) => ops.extend(items),
        }
    }
    if ops.is_empty() {
        return Err(oqs_error("expected at least one operand", doc));
    }
    let tree = if balanced {
        list_to_tree_expression(ops, op)
    } else {
        ops.into_iter().reduce(|l, r| Op::binary(l, op, r))
    };
    tree.map(Node::Op)
        .ok_or_else(|| oqs_error("expected at least one operand", doc))
}

fn operator(key: &str, operands: &Value, doc: &Value) -> Result<Node> {
    let args = operand_values(operands);
    let args = args.as_slice();
    match key {
        "#constant" => match args.first() {
            Some(Value::String(s)) => Ok(Node::Op(Op::str(s))),
            Some(v) => Ok(Node::Op(Op::Scalar(Scalar::from_json(v)?))),
            None => Ok(Node::Op(Op::null())),
        },
        "#ref" => match args.first() {
            Some(Value::String(s)) => Ok(Node::Op(Op::field(s.trim_start_matches('$')))),
            _ => Err(oqs_error("#REF expects a field name", doc)),
        },
        "#list" => Ok(Node::List(
            args.iter().map(|v| single_op(v)).collect::<Result<_>>()?,
        )),
        "#equals" => binary(args, BinaryOp::Eq, doc),
        "#not_equals" => binary(args, BinaryOp::NotEq, doc),
        "#greater_than" => binary(args, BinaryOp::Gt, doc),
        "#greater_than_or_equals" => binary(args, BinaryOp::GtEq, doc),
        "#less_than" => binary(args, BinaryOp::Lt, doc),
        "#less_than_or_equals" => binary(args, BinaryOp::LtEq, doc),
        "#and" | "#or" => {
            let op = if key == "#and" {
                BinaryOp::And
            } else {
                BinaryOp::Or
            };
            let ops = args.iter().map(|v| single_op(v)).collect::<Result<Vec<_>>>()?;
            list_to_tree_expression(ops, op)
                .map(Node::Op)
                .ok_or_else(|| oqs_error("empty boolean list", doc))
        }
        "#xor" => Err(oqs_error("#XOR is not supported", doc)),
        "#within" => {
            if args.len() != 2 {
                return Err(oqs_error("expected exactly two operands", doc));
            }
            let left = nth(args, 0, doc)?;
            match node(args[1])? {
                Node::List(items) => {
                    let ors = items
                        .into_iter()
                        .map(|item| Op::binary(left.clone(), BinaryOp::Eq, item))
                        .collect::<Vec<_>>();
                    // membership in an empty list is never true
                    Ok(Node::Op(
                        list_to_tree_expression(ors, BinaryOp::Or).unwrap_or_else(|| Op::bool(false)),
                    ))
                }
                Node::Op(right) => Ok(Node::Op(Op::binary(left, BinaryOp::Eq, right))),
            }
        }
        "#negate" => Ok(Node::Op(Op::negate(nth(args, 0, doc)?))),
        "#null" => Ok(Node::Op(Op::binary(nth(args, 0, doc)?, BinaryOp::Eq, Op::null()))),
        "#non_null" => Ok(Node::Op(Op::binary(
            nth(args, 0, doc)?,
            BinaryOp::NotEq,
            Op::null(),
        ))),
        "#true" => Ok(Node::Op(Op::bool(true))),
        "#false" => Ok(Node::Op(Op::bool(false))),
        "#sum" => folded(args, BinaryOp::Plus, true, doc),
        "#product" => folded(args, BinaryOp::Multiply, true, doc),
        "#difference" => folded(args, BinaryOp::Minus, false, doc),
        "#quotient" | "#floor_quotient" => binary(args, BinaryOp::Divide, doc),
        "#modulo" => binary(args, BinaryOp::Modulo, doc),
        "#exponentiation" => binary(args, BinaryOp::Pow, doc),
        "#st_within" => binary(args, BinaryOp::Within, doc),
        "#st_contains" => binary(args, BinaryOp::Contains, doc),
        "#st_intersects" => binary(args, BinaryOp::Intersects, doc),
        "#st_equals" => binary(args, BinaryOp::Eq, doc),
        other if other.starts_with('#') => {
            Err(oqs_error(&format!("unexpected operator {other}"), doc))
        }
        _ => Err(oqs_error("expected an operator key or GeoJSON geometry", doc)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{list_to_tree_expression, parse_oqs, parse_oqs_str};
    use crate::ast::{BinaryOp, Op};
    use crate::parse;

    #[test]
    fn equals_and_matches_infix() {
        let oqs = parse_oqs(&json!({"#AND": [{"#EQUALS": ["$a", 1]}, {"#EQUALS": ["$b", 2]}]}))
            .expect("oqs");
        assert_eq!(oqs, parse("a == 1 and b == 2").expect("infix"));
    }

    #[test]
    fn balanced_fold() {
        let ops = (0..5).map(|i| Op::field(format!("f{i}"))).collect::<Vec<_>>();
        let tree = list_to_tree_expression(ops, BinaryOp::Or).expect("non-empty");
        assert_eq!(tree.to_string(), "f0 or f1 or (f2 or f3) or f4");
        assert!(list_to_tree_expression(vec![], BinaryOp::And).is_none());
    }

    #[test]
    fn within_list_is_or_of_equals() {
        let op = parse_oqs(&json!({"#WITHIN": ["$k", {"#LIST": [1, 2, 3]}]})).expect("oqs");
        assert_eq!(op.to_string(), "k == 1 or k == 2 or k == 3");
    }

    #[test]
    fn null_checks_and_negation() {
        let op = parse_oqs(&json!({"#NEGATE": [{"#NULL": ["$x"]}]})).expect("oqs");
        assert_eq!(op.to_string(), "~(x == null)");
        let op = parse_oqs(&json!({"#NON_NULL": ["$x"]})).expect("oqs");
        assert_eq!(op.to_string(), "x != null");
    }

    #[test]
    fn spatial_with_geojson_literal() {
        let op = parse_oqs(&json!({"#ST_INTERSECTS": [
            "$loc",
            {"type": "Point", "coordinates": [1.0, 2.0]}
        ]}))
        .expect("oqs");
        let Op::BinOp(b) = op else { panic!("binop") };
        assert_eq!(b.op, BinaryOp::Intersects);
        let Op::Scalar(s) = *b.right else {
            panic!("scalar")
        };
        assert!(s.as_str_value().expect("string").starts_with("POINT"));
    }

    #[test]
    fn arithmetic_and_constants() {
        let op = parse_oqs(&json!({"#GREATER_THAN": [
            {"#SUM": [{"#LIST": ["$a", "$b", {"#CONSTANT": [1.5]}]}]},
            {"#REF": ["c"]}
        ]}))
        .expect("oqs");
        assert_eq!(op.to_string(), "a + b + 1.5 > c");

        let op = parse_oqs(&json!({"#DIFFERENCE": ["$a", "$b", "$c"]})).expect("oqs");
        assert_eq!(op.to_string(), "a - b - c");
    }

    #[test]
    fn rejects_xor_and_unknown_keys() {
        assert!(parse_oqs(&json!({"#XOR": [true, false]})).is_err());
        assert!(parse_oqs(&json!({"#WHATEVER": []})).is_err());
        assert!(parse_oqs(&json!([1, 2])).is_err());
        assert!(parse_oqs_str("{not json").is_err());
    }

    #[test]
    fn empty_document_is_null() {
        assert_eq!(parse_oqs(&json!({})).expect("oqs"), Op::null());
    }
}
