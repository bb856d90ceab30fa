//! Expression compilation and evaluation against Arrow record batches.
//!
//! Output contract:
//! - each evaluation returns an `ArrayRef` aligned to the input batch row count;
//! - a [`Predicate`] always evaluates to a `BooleanArray` where null means
//!   "not selected".

use std::sync::Arc;

use arrow::array::{
    new_null_array, Array, ArrayRef, AsArray, BooleanArray, BooleanBuilder, Float64Array,
    Int64Array, StringArray,
};
use arrow::compute::kernels::{
    arity::binary,
    boolean::{and_kleene, is_not_null, is_null, not, or_kleene},
    cast::cast,
    cmp::{eq, gt, gt_eq, lt, lt_eq, neq},
    numeric::{add, div, mul, rem, sub},
};
use arrow::compute::{filter_record_batch, prep_null_mask_filter};
use arrow::datatypes::Float64Type;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use geo::Geometry;
use ktable_common::{KtableError, Result};

use crate::ast::{BinaryOp, Op, Scalar, ScalarKind, ScalarValue};
use crate::geometry::{is_geometry_field, parse_wkt, relate};

/// Executable expression.
pub trait PhysicalExpr: Send + Sync {
    /// Static output data type of this expression.
    fn data_type(&self) -> DataType;
    /// Evaluate the expression for every row in `batch`.
    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef>;
}

/// Compile an expression tree against `schema`.
///
/// Columns are resolved by dotted name; unsupported operator/type
/// combinations fail with [`KtableError::Compile`] naming the operator.
pub fn compile(op: &Op, schema: &SchemaRef) -> Result<Arc<dyn PhysicalExpr>> {
    match op {
        Op::Field(field) => {
            let name = field.path().ok_or_else(|| {
                KtableError::Compile(format!("unsupported member access: {op}"))
            })?;
            let index = schema
                .index_of(&name)
                .map_err(|_| KtableError::Compile(format!("unknown column: {name}")))?;
            let dt = schema.field(index).data_type().clone();
            Ok(Arc::new(ColumnExpr { index, dt }))
        }
        Op::Scalar(s) => {
            let v = s.value()?;
            let dt = literal_type(&v);
            Ok(Arc::new(LiteralExpr { v, dt }))
        }
        Op::Parens(inner) => compile(inner, schema),
        Op::UnaryOp(u) => {
            if !u.is_negation() || !u.suffix.is_empty() {
                return Err(KtableError::Compile(format!(
                    "unsupported unary operator '{}{}'",
                    u.prefix, u.suffix
                )));
            }
            let inner = boolean_operand(compile(&u.expr, schema)?, &u.prefix)?;
            Ok(Arc::new(NotExpr { inner }))
        }
        Op::Func(func) => {
            let mut args = Vec::with_capacity(func.args.len() + 1);
            if let Some(inv) = &func.invocant {
                args.push(compile(inv, schema)?);
            }
            for a in &func.args {
                args.push(compile(a, schema)?);
            }
            compile_func(&func.name, args)
        }
        Op::BinOp(b) => compile_binary(&b.left, b.op, &b.right, schema),
    }
}

fn compile_func(name: &str, mut args: Vec<Arc<dyn PhysicalExpr>>) -> Result<Arc<dyn PhysicalExpr>> {
    if args.len() != 1 {
        return Err(KtableError::Compile(format!(
            "function '{name}' expects one argument, got {}",
            args.len()
        )));
    }
    let Some(arg) = args.pop() else {
        return Err(KtableError::Compile(format!("function '{name}' has no argument")));
    };
    match name {
        "is_null" => Ok(Arc::new(NullCheckExpr {
            inner: arg,
            negated: false,
        })),
        "is_valid" => Ok(Arc::new(NullCheckExpr {
            inner: arg,
            negated: true,
        })),
        "invert" => Ok(Arc::new(NotExpr {
            inner: boolean_operand(arg, name)?,
        })),
        other => Err(KtableError::Compile(format!("unknown function '{other}'"))),
    }
}

fn is_null_literal(op: &Op) -> bool {
    match op {
        Op::Scalar(Scalar {
            kind: ScalarKind::Null,
            ..
        }) => true,
        Op::Parens(inner) => is_null_literal(inner),
        _ => false,
    }
}

fn is_geometry_operand(op: &Op, schema: &SchemaRef) -> bool {
    op.field_path()
        .and_then(|name| schema.field_with_name(&name).ok().map(is_geometry_field))
        .unwrap_or(false)
}

fn compile_binary(
    left: &Op,
    op: BinaryOp,
    right: &Op,
    schema: &SchemaRef,
) -> Result<Arc<dyn PhysicalExpr>> {
    match op {
        BinaryOp::And | BinaryOp::Or => {
            let l = boolean_operand(compile(left, schema)?, op.symbol())?;
            let r = boolean_operand(compile(right, schema)?, op.symbol())?;
            return Ok(Arc::new(BoolBinaryExpr { left: l, right: r, op }));
        }
        BinaryOp::Eq | BinaryOp::NotEq if is_null_literal(right) || is_null_literal(left) => {
            let other = if is_null_literal(right) { left } else { right };
            return Ok(Arc::new(NullCheckExpr {
                inner: compile(other, schema)?,
                negated: op == BinaryOp::NotEq,
            }));
        }
        _ => {}
    }

    let geometric = op.is_spatial()
        || (matches!(op, BinaryOp::Eq | BinaryOp::NotEq)
            && (is_geometry_operand(left, schema) || is_geometry_operand(right, schema)));
    if geometric {
        return Ok(Arc::new(SpatialExpr {
            left: spatial_side(left, op, schema)?,
            right: spatial_side(right, op, schema)?,
            op,
        }));
    }

    let l = compile(left, schema)?;
    let r = compile(right, schema)?;
    let (l, r, common) = coerce(l, r, op)?;
    let out = if op.is_arithmetic() {
        if !common.is_numeric() {
            return Err(KtableError::Compile(format!(
                "operator '{op}' requires numeric operands, got {common:?}"
            )));
        }
        if op == BinaryOp::Pow {
            DataType::Float64
        } else {
            common
        }
    } else {
        DataType::Boolean
    };
    Ok(Arc::new(BinaryExpr {
        left: l,
        right: r,
        op,
        out,
    }))
}

fn boolean_operand(e: Arc<dyn PhysicalExpr>, op: &str) -> Result<Arc<dyn PhysicalExpr>> {
    match e.data_type() {
        DataType::Boolean => Ok(e),
        DataType::Null => Ok(Arc::new(CastExpr {
            inner: e,
            to_type: DataType::Boolean,
        })),
        other => Err(KtableError::Compile(format!(
            "operator '{op}' expects boolean operands, got {other:?}"
        ))),
    }
}

fn is_string(dt: &DataType) -> bool {
    matches!(dt, DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View)
}

fn common_type(op: BinaryOp, l: &DataType, r: &DataType) -> Result<DataType> {
    if l == r {
        return Ok(l.clone());
    }
    match (l, r) {
        (DataType::Null, other) | (other, DataType::Null) => Ok(other.clone()),
        (a, b) if a.is_numeric() && b.is_numeric() => {
            if a.is_floating() || b.is_floating() {
                Ok(DataType::Float64)
            } else {
                Ok(DataType::Int64)
            }
        }
        (a, b) if is_string(a) && is_string(b) => Ok(DataType::Utf8),
        _ => Err(KtableError::Compile(format!(
            "operator '{op}' not supported between {l:?} and {r:?}"
        ))),
    }
}

fn with_type(e: Arc<dyn PhysicalExpr>, to: &DataType) -> Arc<dyn PhysicalExpr> {
    if &e.data_type() == to {
        e
    } else {
        Arc::new(CastExpr {
            inner: e,
            to_type: to.clone(),
        })
    }
}

type Coerced = (Arc<dyn PhysicalExpr>, Arc<dyn PhysicalExpr>, DataType);

fn coerce(l: Arc<dyn PhysicalExpr>, r: Arc<dyn PhysicalExpr>, op: BinaryOp) -> Result<Coerced> {
    let common = common_type(op, &l.data_type(), &r.data_type())?;
    Ok((with_type(l, &common), with_type(r, &common), common))
}

enum SpatialSide {
    Const(Option<Geometry<f64>>),
    Column(Arc<dyn PhysicalExpr>),
}

fn spatial_side(op: &Op, bin: BinaryOp, schema: &SchemaRef) -> Result<SpatialSide> {
    if let Op::Scalar(s) = op {
        return match s.value()? {
            ScalarValue::Utf8(text) => Ok(SpatialSide::Const(Some(parse_wkt(&text)?))),
            ScalarValue::Null => Ok(SpatialSide::Const(None)),
            other => Err(KtableError::Compile(format!(
                "operator '{bin}' expects a WKT geometry, got {other:?}"
            ))),
        };
    }
    let e = compile(op, schema)?;
    let dt = e.data_type();
    if !is_string(&dt) {
        return Err(KtableError::Compile(format!(
            "operator '{bin}' expects a geometry column, got {dt:?}"
        )));
    }
    Ok(SpatialSide::Column(with_type(e, &DataType::Utf8)))
}

/// Compiled boolean filter.
pub struct Predicate {
    expr: Arc<dyn PhysicalExpr>,
}

impl Predicate {
    /// Compiles `op`, which must produce a boolean.
    pub fn compile(op: &Op, schema: &SchemaRef) -> Result<Self> {
        let expr = compile(op, schema)?;
        let expr = boolean_operand(expr, "where").map_err(|_| {
            KtableError::Compile(format!("query does not produce a boolean: {op}"))
        })?;
        Ok(Self { expr })
    }

    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let arr = self.expr.evaluate(batch)?;
        arr.as_boolean_opt()
            .cloned()
            .ok_or_else(|| KtableError::Execution("predicate must be boolean".to_string()))
    }

    /// Rows where the predicate is true.
    pub fn filter(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let mask = self.evaluate(batch)?;
        filter_record_batch(batch, &mask)
            .map_err(|e| KtableError::Execution(format!("filter failed: {e}")))
    }

    /// `(matched, rest)`; rows evaluating to null land in `rest`.
    pub fn split(&self, batch: &RecordBatch) -> Result<(RecordBatch, RecordBatch)> {
        let mask = self.evaluate(batch)?;
        let mask = if mask.null_count() > 0 {
            prep_null_mask_filter(&mask)
        } else {
            mask
        };
        let inverse = not(&mask).map_err(|e| KtableError::Execution(format!("not failed: {e}")))?;
        let matched = filter_record_batch(batch, &mask)
            .map_err(|e| KtableError::Execution(format!("filter failed: {e}")))?;
        let rest = filter_record_batch(batch, &inverse)
            .map_err(|e| KtableError::Execution(format!("filter failed: {e}")))?;
        Ok((matched, rest))
    }
}

// =====================
// Standard expressions
// =====================

struct ColumnExpr {
    index: usize,
    dt: DataType,
}

impl PhysicalExpr for ColumnExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        if self.index >= batch.num_columns() {
            return Err(KtableError::Execution(format!(
                "column index {} out of range for batch with {} columns",
                self.index,
                batch.num_columns()
            )));
        }
        Ok(batch.column(self.index).clone())
    }
}

struct LiteralExpr {
    v: ScalarValue,
    dt: DataType,
}

impl PhysicalExpr for LiteralExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        Ok(scalar_to_array(&self.v, batch.num_rows()))
    }
}

struct CastExpr {
    inner: Arc<dyn PhysicalExpr>,
    to_type: DataType,
}

impl PhysicalExpr for CastExpr {
    fn data_type(&self) -> DataType {
        self.to_type.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        cast(&arr, &self.to_type).map_err(|e| KtableError::Execution(format!("cast failed: {e}")))
    }
}

struct NotExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for NotExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let b = arr
            .as_boolean_opt()
            .ok_or_else(|| KtableError::Execution("NOT expects boolean".to_string()))?;
        let out = not(b).map_err(|e| KtableError::Execution(format!("not failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

struct NullCheckExpr {
    inner: Arc<dyn PhysicalExpr>,
    negated: bool,
}

impl PhysicalExpr for NullCheckExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let out = if self.negated {
            is_not_null(&arr)
        } else {
            is_null(&arr)
        }
        .map_err(|e| KtableError::Execution(format!("null check failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

struct BoolBinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BinaryOp,
}

impl PhysicalExpr for BoolBinaryExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        let lb = l
            .as_boolean_opt()
            .ok_or_else(|| KtableError::Execution("AND/OR expects boolean".to_string()))?;
        let rb = r
            .as_boolean_opt()
            .ok_or_else(|| KtableError::Execution("AND/OR expects boolean".to_string()))?;
        let out = match self.op {
            BinaryOp::And => and_kleene(lb, rb),
            _ => or_kleene(lb, rb),
        }
        .map_err(|e| KtableError::Execution(format!("boolean kernel failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

struct BinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BinaryOp,
    out: DataType,
}

impl PhysicalExpr for BinaryExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        if self.op == BinaryOp::Pow {
            return eval_pow(&l, &r);
        }
        let res = match self.op {
            BinaryOp::Plus => add(&l, &r),
            BinaryOp::Minus => sub(&l, &r),
            BinaryOp::Multiply => mul(&l, &r),
            BinaryOp::Divide => div(&l, &r),
            BinaryOp::Modulo => rem(&l, &r),
            BinaryOp::Eq => eq(&l, &r).map(|b| Arc::new(b) as ArrayRef),
            BinaryOp::NotEq => neq(&l, &r).map(|b| Arc::new(b) as ArrayRef),
            BinaryOp::Lt => lt(&l, &r).map(|b| Arc::new(b) as ArrayRef),
            BinaryOp::LtEq => lt_eq(&l, &r).map(|b| Arc::new(b) as ArrayRef),
            BinaryOp::Gt => gt(&l, &r).map(|b| Arc::new(b) as ArrayRef),
            BinaryOp::GtEq => gt_eq(&l, &r).map(|b| Arc::new(b) as ArrayRef),
            other => {
                return Err(KtableError::Compile(format!(
                    "operator '{other}' is not a scalar operator"
                )))
            }
        };
        res.map_err(|e| KtableError::Execution(format!("operator '{}' failed: {e}", self.op)))
    }
}

fn eval_pow(l: &ArrayRef, r: &ArrayRef) -> Result<ArrayRef> {
    let l = cast(l, &DataType::Float64)
        .map_err(|e| KtableError::Execution(format!("cast failed: {e}")))?;
    let r = cast(r, &DataType::Float64)
        .map_err(|e| KtableError::Execution(format!("cast failed: {e}")))?;
    let (Some(la), Some(ra)) = (
        l.as_primitive_opt::<Float64Type>(),
        r.as_primitive_opt::<Float64Type>(),
    ) else {
        return Err(KtableError::Execution("expected Float64 array".to_string()));
    };
    let out: Float64Array = binary(la, ra, f64::powf)
        .map_err(|e| KtableError::Execution(format!("operator '**' failed: {e}")))?;
    Ok(Arc::new(out))
}

struct SpatialExpr {
    left: SpatialSide,
    right: SpatialSide,
    op: BinaryOp,
}

fn side_values(side: &SpatialSide, batch: &RecordBatch) -> Result<Option<StringArray>> {
    match side {
        SpatialSide::Const(_) => Ok(None),
        SpatialSide::Column(e) => {
            let arr = e.evaluate(batch)?;
            arr.as_string_opt::<i32>()
                .cloned()
                .map(Some)
                .ok_or_else(|| KtableError::Execution("geometry column must be Utf8".to_string()))
        }
    }
}

fn side_geometry(
    side: &SpatialSide,
    values: &Option<StringArray>,
    row: usize,
) -> Option<Geometry<f64>> {
    match (side, values) {
        (SpatialSide::Const(g), _) => g.clone(),
        (SpatialSide::Column(_), Some(arr)) if arr.is_valid(row) => parse_wkt(arr.value(row)).ok(),
        _ => None,
    }
}

impl PhysicalExpr for SpatialExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let lv = side_values(&self.left, batch)?;
        let rv = side_values(&self.right, batch)?;
        let mut out = BooleanBuilder::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            match (
                side_geometry(&self.left, &lv, row),
                side_geometry(&self.right, &rv, row),
            ) {
                (Some(a), Some(b)) => out.append_value(relate(self.op, &a, &b)?),
                _ => out.append_null(),
            }
        }
        Ok(Arc::new(out.finish()))
    }
}

// ------------------ helpers ------------------

fn literal_type(v: &ScalarValue) -> DataType {
    match v {
        ScalarValue::Int64(_) => DataType::Int64,
        ScalarValue::Float64(_) => DataType::Float64,
        ScalarValue::Utf8(_) => DataType::Utf8,
        ScalarValue::Boolean(_) => DataType::Boolean,
        ScalarValue::Null => DataType::Null,
    }
}

fn scalar_to_array(v: &ScalarValue, len: usize) -> ArrayRef {
    match v {
        ScalarValue::Int64(x) => Arc::new(Int64Array::from(vec![*x; len])),
        ScalarValue::Float64(x) => Arc::new(Float64Array::from(vec![*x; len])),
        ScalarValue::Boolean(x) => Arc::new(BooleanArray::from(vec![*x; len])),
        ScalarValue::Utf8(s) => Arc::new(StringArray::from(vec![s.as_str(); len])),
        ScalarValue::Null => new_null_array(&DataType::Null, len),
    }
}
