//! BSquare: bounding-square pushdown for geometry predicates.
//!
//! Each geometry is summarised by its bounding-box centre `(x, y)` and the
//! half-extent `q` of the longer side, so the shape lies inside the square
//! `[x - q, x + q] x [y - q, y + q]`. Spatial predicates against a literal are
//! rewritten into range checks on those columns. The rewrite only prunes; the
//! exact predicate must run again on decoded rows.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Float64Builder};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Schema};
use ktable_common::{KtableError, Result};
use ktable_expr::geometry::{bounds, is_axis_rectangle, is_point, parse_wkt, Bounds};
use ktable_expr::{is_geometry_field, BinOp, BinaryOp, Func, Op, Scalar, ScalarKind, UnaryOp};
use tracing::debug;

use crate::schema::{derived_base, derived_name, transform_inward, transform_outward};

/// Rewrites an outer-schema query into one over the inner schema.
pub fn convert_query(outer: &Schema, query: &Op) -> Result<Op> {
    let ctx = QueryContext {
        geo_fields: outer
            .fields()
            .iter()
            .filter(|f| is_geometry_field(f))
            .map(|f| f.name().clone())
            .collect(),
        negate: false,
    };
    ctx.convert(query)
}

#[derive(Clone)]
struct QueryContext {
    geo_fields: Vec<String>,
    negate: bool,
}

impl QueryContext {
    fn neg(&self) -> Self {
        Self {
            geo_fields: self.geo_fields.clone(),
            negate: !self.negate,
        }
    }

    fn geo_field(&self, op: &Op) -> Option<String> {
        op.field_path().filter(|name| self.geo_fields.contains(name))
    }

    fn convert(&self, op: &Op) -> Result<Op> {
        match op {
            Op::Field(_) | Op::Scalar(_) => Ok(op.clone()),
            Op::Parens(inner) => match self.convert(inner)? {
                p @ Op::Parens(_) => Ok(p),
                other => Ok(Op::parens(other)),
            },
            Op::UnaryOp(u) => {
                let cur = if u.is_negation() { self.neg() } else { self.clone() };
                Ok(Op::UnaryOp(UnaryOp {
                    prefix: u.prefix.clone(),
                    expr: Box::new(cur.convert(&u.expr)?),
                    suffix: u.suffix.clone(),
                }))
            }
            Op::Func(f) => {
                let cur = if f.name == "invert" { self.neg() } else { self.clone() };
                Ok(Op::Func(Func {
                    name: f.name.clone(),
                    args: f
                        .args
                        .iter()
                        .map(|a| cur.convert(a))
                        .collect::<Result<Vec<_>>>()?,
                    invocant: match &f.invocant {
                        Some(inv) => Some(Box::new(cur.convert(inv)?)),
                        None => None,
                    },
                }))
            }
            Op::BinOp(b) => self.convert_binop(b),
        }
    }

    fn convert_binop(&self, b: &BinOp) -> Result<Op> {
        let left_geo = self.geo_field(&b.left);
        let right_geo = self.geo_field(&b.right);
        if left_geo.is_none() && right_geo.is_none() {
            if b.op.is_spatial() {
                return Err(KtableError::Compile(format!(
                    "can't do '{}' on non-geometry fields: {}",
                    b.op,
                    Op::BinOp(b.clone())
                )));
            }
            return Ok(Op::binary(self.convert(&b.left)?, b.op, self.convert(&b.right)?));
        }
        match b.op {
            BinaryOp::Intersects | BinaryOp::Contains | BinaryOp::Within | BinaryOp::Eq => {
                self.convert_spatial(b)
            }
            // a != g is not (a == g)
            BinaryOp::NotEq => {
                let eq = BinOp {
                    left: b.left.clone(),
                    op: BinaryOp::Eq,
                    right: b.right.clone(),
                };
                Ok(Op::negate(Op::parens(self.neg().convert_spatial(&eq)?)))
            }
            _ => Ok(Op::BinOp(b.clone())),
        }
    }

    fn convert_spatial(&self, b: &BinOp) -> Result<Op> {
        let b = if self.geo_field(&b.left).is_none() {
            b.flip()?
        } else {
            b.clone()
        };
        let Some(field) = self.geo_field(&b.left) else {
            return Ok(Op::BinOp(b));
        };
        let literal = match b.right.as_ref() {
            Op::Scalar(Scalar {
                kind: ScalarKind::Null,
                ..
            }) => return Ok(Op::BinOp(b)),
            Op::Scalar(s) => s.as_str_value().ok_or_else(|| {
                KtableError::Compile(format!(
                    "'{}' on geometry field '{field}' expects a WKT literal",
                    b.op
                ))
            })?,
            // shape against shape: cannot prune
            _ => return Ok(Op::bool(!self.negate)),
        };
        let geo = parse_wkt(&literal)?;
        let Some(bbox) = bounds(&geo) else {
            // empty literal never matches
            return Ok(Op::bool(false));
        };
        debug!(field = %field, op = %b.op, negate = self.negate, "bsquare rewrite");
        if !self.negate {
            return overlap(&field, bbox);
        }
        // only intersection has a sufficient range form: a zero-extent row at a
        // point literal may be a multipoint or a degenerate line, which breaks
        // equality and the containment relations
        let tight = b.op == BinaryOp::Intersects && (is_point(&geo) || is_axis_rectangle(&geo));
        if !tight {
            return Ok(Op::bool(false));
        }
        // empty geometries carry null bounds; keep them out of the sufficient
        // check so the enclosing negation does not turn them into nulls
        Ok(Op::parens(Op::and(
            Op::negate(Op::func("is_null", vec![col(&field, "x")])),
            inside(&field, bbox)?,
        )))
    }
}

fn col(field: &str, suffix: &str) -> Op {
    Op::field(derived_name(field, suffix))
}

fn bound_check(centre: &str, sign: BinaryOp, field: &str, cmp: BinaryOp, v: f64) -> Result<Op> {
    Ok(Op::binary(
        Op::binary(col(field, centre), sign, col(field, "q")),
        cmp,
        Op::f64(v)?,
    ))
}

fn all_of(checks: [Result<Op>; 4]) -> Result<Op> {
    let [a, b, c, d] = checks;
    Ok(Op::parens(Op::and(Op::and(a?, b?), Op::and(c?, d?))))
}

/// The bounding square overlaps the box: necessary for any spatial match.
fn overlap(field: &str, (x0, y0, x1, y1): Bounds) -> Result<Op> {
    all_of([
        bound_check("x", BinaryOp::Plus, field, BinaryOp::GtEq, x0),
        bound_check("x", BinaryOp::Minus, field, BinaryOp::LtEq, x1),
        bound_check("y", BinaryOp::Plus, field, BinaryOp::GtEq, y0),
        bound_check("y", BinaryOp::Minus, field, BinaryOp::LtEq, y1),
    ])
}

/// The bounding square lies inside the box: sufficient for a match.
fn inside(field: &str, (x0, y0, x1, y1): Bounds) -> Result<Op> {
    all_of([
        bound_check("x", BinaryOp::Minus, field, BinaryOp::GtEq, x0),
        bound_check("x", BinaryOp::Plus, field, BinaryOp::LtEq, x1),
        bound_check("y", BinaryOp::Minus, field, BinaryOp::GtEq, y0),
        bound_check("y", BinaryOp::Plus, field, BinaryOp::LtEq, y1),
    ])
}

/// `(x, y, q)` from a bounding box.
pub fn square_of(b: Bounds) -> (f64, f64, f64) {
    let (min_x, min_y, max_x, max_y) = b;
    (
        (min_x + max_x) / 2.0,
        (min_y + max_y) / 2.0,
        (max_x - min_x).max(max_y - min_y) / 2.0,
    )
}

fn derived_columns(name: &str, values: &ArrayRef) -> Result<[ArrayRef; 3]> {
    let strings = match values.data_type() {
        DataType::Utf8 => values.as_string::<i32>().clone(),
        DataType::LargeUtf8 => {
            let cast = arrow::compute::cast(values, &DataType::Utf8)
                .map_err(|e| KtableError::Execution(format!("cast failed: {e}")))?;
            cast.as_string::<i32>().clone()
        }
        DataType::Binary | DataType::LargeBinary => {
            return Err(KtableError::Unsupported(format!(
                "WKB geometry in column '{name}'"
            )))
        }
        other => {
            return Err(KtableError::InvalidArgument(format!(
                "geometry column '{name}' must hold WKT strings, got {other:?}"
            )))
        }
    };
    let n = strings.len();
    let mut xs = Float64Builder::with_capacity(n);
    let mut ys = Float64Builder::with_capacity(n);
    let mut qs = Float64Builder::with_capacity(n);
    for row in 0..n {
        if strings.is_null(row) {
            xs.append_null();
            ys.append_null();
            qs.append_null();
            continue;
        }
        let geo = parse_wkt(strings.value(row)).map_err(|e| {
            KtableError::InvalidArgument(format!("column '{name}' row {row}: {e}"))
        })?;
        match bounds(&geo) {
            Some(b) => {
                let (x, y, q) = square_of(b);
                xs.append_value(x);
                ys.append_value(y);
                qs.append_value(q);
            }
            None => {
                xs.append_null();
                ys.append_null();
                qs.append_null();
            }
        }
    }
    Ok([
        Arc::new(xs.finish()),
        Arc::new(ys.finish()),
        Arc::new(qs.finish()),
    ])
}

/// Adds the derived bsquare columns to an outer-schema batch.
pub fn encode(batch: &RecordBatch) -> Result<RecordBatch> {
    let schema = batch.schema();
    let inner = transform_inward(&schema);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(inner.fields().len());
    let mut geo_count = 0usize;
    for (field, values) in schema.fields().iter().zip(batch.columns()) {
        columns.push(values.clone());
        if is_geometry_field(field) {
            geo_count += 1;
            columns.extend(derived_columns(field.name(), values)?);
        }
    }
    if geo_count > 0 {
        debug!(rows = batch.num_rows(), geometry_columns = geo_count, "bsquare encode");
    }
    RecordBatch::try_new(inner, columns)
        .map_err(|e| KtableError::Execution(format!("bsquare encode failed: {e}")))
}

/// Drops derived columns and lays the rest out in the outer order of `inner`.
///
/// Columns the batch does not carry (a projected response) are skipped;
/// columns `inner` does not know keep their place after the known ones.
pub fn decode(batch: &RecordBatch, inner: &Schema) -> Result<RecordBatch> {
    let schema = batch.schema();
    let kept = transform_outward(&schema);
    let order = transform_outward(inner);
    let rank = |name: &str| order.index_of(name).unwrap_or(usize::MAX);
    let mut picked = kept
        .fields()
        .iter()
        .filter_map(|f| schema.index_of(f.name()).ok().map(|i| (rank(f.name()), i, f.clone())))
        .collect::<Vec<_>>();
    picked.sort_by_key(|(r, i, _)| (*r, *i));
    let fields = picked.iter().map(|(_, _, f)| f.clone()).collect::<Vec<_>>();
    let columns = picked
        .iter()
        .map(|(_, i, _)| batch.column(*i).clone())
        .collect::<Vec<_>>();
    let outer = Arc::new(Schema::new_with_metadata(fields, kept.metadata().clone()));
    RecordBatch::try_new(outer, columns)
        .map_err(|e| KtableError::Execution(format!("bsquare decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use arrow::array::{Array, AsArray, StringArray};
    use arrow::datatypes::Float64Type;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema, SchemaRef};
    use ktable_expr::{parse, Predicate, GEOMETRY_META};

    use super::{convert_query, decode, encode};
    use crate::schema::transform_inward;

    fn outer() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("color", DataType::Utf8, true),
            Field::new("area", DataType::Utf8, true)
                .with_metadata(HashMap::from([(GEOMETRY_META.to_string(), "1".to_string())])),
        ]))
    }

    fn batch() -> RecordBatch {
        RecordBatch::try_new(
            outer(),
            vec![
                Arc::new(StringArray::from(vec![
                    "red", "blue", "green", "red", "grey", "pink", "teal", "gold",
                ])),
                Arc::new(StringArray::from(vec![
                    Some("POINT(0.5 0.5)"),
                    Some("POLYGON((2 2, 4 2, 4 3, 2 3, 2 2))"),
                    Some("LINESTRING(0.5 5, 0.5 7)"),
                    None,
                    Some("POINT EMPTY"),
                    Some("MULTIPOINT((0.5 0.5))"),
                    Some("LINESTRING(0.5 0.5, 0.5 0.5)"),
                    Some("POINT(9 9)"),
                ])),
            ],
        )
        .expect("batch")
    }

    #[test]
    fn encode_computes_centre_and_half_extent() {
        let inner = encode(&batch()).expect("encode");
        assert_eq!(inner.schema(), transform_inward(&outer()));
        let x = inner.column(2).as_primitive::<Float64Type>();
        let y = inner.column(3).as_primitive::<Float64Type>();
        let q = inner.column(4).as_primitive::<Float64Type>();
        assert_eq!((x.value(1), y.value(1), q.value(1)), (3.0, 2.5, 1.0));
        assert_eq!((x.value(2), y.value(2), q.value(2)), (0.5, 6.0, 1.0));
        assert_eq!(q.value(0), 0.0);
        assert!(x.is_null(3));
        assert!(x.is_null(4) && q.is_null(4));
        assert_eq!((x.value(5), y.value(5), q.value(5)), (0.5, 0.5, 0.0));
        assert_eq!(decode(&inner, &inner.schema()).expect("decode"), batch());
    }

    #[test]
    fn rewrite_flips_bounds_under_negation() {
        let q = parse(
            "color == 'red' and not (area intersects 'POLYGON ((0 0, 0 1, 1 1, 1 0, 0 0))')",
        )
        .expect("parse");
        let inner = convert_query(&outer(), &q).expect("convert").to_string();
        assert!(inner.contains("color == 'red'"), "{inner}");
        assert!(inner.contains("area.x - area.q >= 0.0"), "{inner}");

        let q = parse("area intersects 'POLYGON ((0 0, 0 1, 1 1, 1 0, 0 0))'").expect("parse");
        let inner = convert_query(&outer(), &q).expect("convert").to_string();
        assert!(inner.contains("area.x + area.q >= 0.0"), "{inner}");
        assert!(inner.contains("area.y - area.q <= 1.0"), "{inner}");
    }

    #[test]
    fn spatial_op_on_plain_field_is_rejected() {
        let q = parse("color intersects 'POINT(0 0)'").expect("parse");
        let err = convert_query(&outer(), &q).expect_err("non-geometry");
        assert!(err.to_string().contains("intersects"));
    }

    #[test]
    fn literal_on_the_left_is_flipped() {
        let q = parse("'POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))' contains area").expect("parse");
        let inner = convert_query(&outer(), &q).expect("convert").to_string();
        assert!(inner.contains("area.x + area.q >= 0.0"), "{inner}");
    }

    #[test]
    fn negated_non_rectangle_becomes_pass_through() {
        let q = parse("~(area contains 'POLYGON((0 0, 1 0, 0 1, 0 0))')").expect("parse");
        let inner = convert_query(&outer(), &q).expect("convert").to_string();
        assert_eq!(inner, "~(false)");
    }

    fn matches(query: &str) -> Vec<bool> {
        let encoded = encode(&batch()).expect("encode");
        let q = convert_query(&outer(), &parse(query).expect("parse")).expect("convert");
        let p = Predicate::compile(&q, &encoded.schema()).expect("compile");
        let mask = p.evaluate(&encoded).expect("eval");
        (0..mask.len())
            .map(|i| mask.is_valid(i) && mask.value(i))
            .collect()
    }

    fn exact(query: &str) -> Vec<bool> {
        let b = batch();
        let p = Predicate::compile(&parse(query).expect("parse"), &b.schema()).expect("compile");
        let mask = p.evaluate(&b).expect("eval");
        (0..mask.len())
            .map(|i| mask.is_valid(i) && mask.value(i))
            .collect()
    }

    #[test]
    fn rewrite_never_drops_a_true_match() {
        for query in [
            "area intersects 'POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))'",
            "area intersects 'POLYGON((3 0, 5 4, 3 4, 3 0))'",
            "area within 'POLYGON((-1 -1, 10 -1, 10 10, -1 10, -1 -1))'",
            "not (area intersects 'POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))')",
            "not (area within 'POLYGON((1 1, 5 1, 5 4, 1 4, 1 1))')",
            "~(area contains 'POINT(3 2.5)')",
            "area == 'POINT(0.5 0.5)'",
            "area != 'POINT(0.5 0.5)'",
            "not (area == 'POINT(0.5 0.5)')",
            "not (area intersects 'POINT(0.5 0.5)')",
            "not (area within 'POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))')",
            "not (area intersects 'POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))') and color != 'x'",
        ] {
            let pruned = matches(query);
            for (row, truth) in exact(query).into_iter().enumerate() {
                assert!(!truth || pruned[row], "{query}: row {row} lost");
            }
        }
    }

    #[test]
    fn negated_rewrite_keeps_empty_and_degenerate_rows() {
        let lost = |query: &str| matches(query);
        // POINT EMPTY, MULTIPOINT at the literal, degenerate line at the literal
        let hits = lost("area != 'POINT(0.5 0.5)'");
        assert!(hits[4] && hits[5] && hits[6], "{hits:?}");
        let hits = lost("not (area intersects 'POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))')");
        assert!(hits[4], "{hits:?}");
        assert!(!hits[0], "{hits:?}");
    }

    #[test]
    fn decode_restores_outer_column_order() {
        let inner = encode(&batch()).expect("encode");
        // a server free to reorder columns
        let shuffled = inner.project(&[3, 1, 4, 0, 2]).expect("shuffle");
        let decoded = decode(&shuffled, &inner.schema()).expect("decode");
        assert_eq!(decoded, batch());

        // a projected response keeps only what was sent
        let partial = inner.project(&[1, 0]).expect("project");
        let decoded = decode(&partial, &inner.schema()).expect("decode");
        let names = decoded
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["color", "area"]);
    }

    #[test]
    fn decode_keeps_plain_dotted_columns() {
        let schema = Arc::new(Schema::new(vec![Field::new("a.x", DataType::Utf8, true)]));
        let b = RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(vec!["v"]))])
            .expect("batch");
        assert_eq!(decode(&b, &b.schema()).expect("decode").num_columns(), 1);
    }
}
