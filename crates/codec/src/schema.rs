//! Outer (user-facing) and inner (storage) schema mapping.
//!
//! Every geometry column `g` is followed in the inner schema by three
//! nullable Float64 columns `g.x`, `g.y`, `g.q` carrying its bsquare bounds.
//! The `index` marker moves from `g` to `g.x` on the way in and back on the
//! way out.

use std::collections::HashMap;
use std::sync::Arc;

use arrow_schema::{DataType, Field, FieldRef, Schema, SchemaRef};
use ktable_expr::is_geometry_field;

/// Field metadata key for indexed columns.
pub const INDEX_META: &str = "index";

/// Suffixes of the derived bsquare columns, in schema order.
pub const DERIVED_SUFFIXES: [&str; 3] = ["x", "y", "q"];

pub fn derived_name(base: &str, suffix: &str) -> String {
    format!("{base}.{suffix}")
}

pub fn transform_inward(outer: &Schema) -> SchemaRef {
    let mut fields: Vec<FieldRef> = Vec::with_capacity(outer.fields().len());
    for f in outer.fields() {
        if !is_geometry_field(f) {
            fields.push(f.clone());
            continue;
        }
        let meta = f.metadata().clone();
        let mut stripped = meta.clone();
        stripped.remove(INDEX_META);
        fields.push(Arc::new(f.as_ref().clone().with_metadata(stripped)));
        for suffix in DERIVED_SUFFIXES {
            fields.push(Arc::new(
                Field::new(derived_name(f.name(), suffix), DataType::Float64, true)
                    .with_metadata(meta.clone()),
            ));
        }
    }
    Arc::new(Schema::new_with_metadata(fields, outer.metadata().clone()))
}

/// Base column name when `name` is a derived column of a geometry field in `schema`.
pub fn derived_base<'a>(schema: &Schema, name: &'a str) -> Option<&'a str> {
    let (base, suffix) = name.rsplit_once('.')?;
    if !DERIVED_SUFFIXES.contains(&suffix) {
        return None;
    }
    let field = schema.field_with_name(base).ok()?;
    is_geometry_field(field).then_some(base)
}

pub fn transform_outward(inner: &Schema) -> SchemaRef {
    let mut restored: HashMap<&str, String> = HashMap::new();
    let mut fields: Vec<FieldRef> = Vec::with_capacity(inner.fields().len());
    for f in inner.fields() {
        match derived_base(inner, f.name()) {
            Some(base) => {
                if f.name().ends_with(".x") {
                    if let Some(v) = f.metadata().get(INDEX_META) {
                        restored.insert(base, v.clone());
                    }
                }
            }
            None => fields.push(f.clone()),
        }
    }
    let fields = fields
        .into_iter()
        .map(|f| match restored.get(f.name().as_str()) {
            Some(v) => {
                let mut meta = f.metadata().clone();
                meta.insert(INDEX_META.to_string(), v.clone());
                Arc::new(f.as_ref().clone().with_metadata(meta))
            }
            None => f,
        })
        .collect::<Vec<_>>();
    Arc::new(Schema::new_with_metadata(fields, inner.metadata().clone()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use arrow_schema::{DataType, Field, Schema};
    use ktable_expr::GEOMETRY_META;

    use super::{transform_inward, transform_outward, INDEX_META};

    fn outer() -> Schema {
        Schema::new(vec![
            Field::new("name", DataType::Utf8, true),
            Field::new("loc", DataType::Utf8, true).with_metadata(HashMap::from([
                (GEOMETRY_META.to_string(), "1".to_string()),
                (INDEX_META.to_string(), "1".to_string()),
            ])),
            Field::new("area", DataType::Utf8, true)
                .with_metadata(HashMap::from([(GEOMETRY_META.to_string(), "1".to_string())])),
            Field::new("n", DataType::Int64, false),
        ])
    }

    #[test]
    fn inward_adds_derived_columns_after_each_geometry() {
        let inner = transform_inward(&outer());
        let names = inner
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "name", "loc", "loc.x", "loc.y", "loc.q", "area", "area.x", "area.y", "area.q",
                "n"
            ]
        );
        let loc = inner.field_with_name("loc").expect("loc");
        assert!(!loc.metadata().contains_key(INDEX_META));
        let lx = inner.field_with_name("loc.x").expect("loc.x");
        assert_eq!(lx.metadata().get(INDEX_META).map(String::as_str), Some("1"));
        assert_eq!(lx.data_type(), &DataType::Float64);
        assert!(lx.is_nullable());
    }

    #[test]
    fn outward_inverts_inward() {
        let outer = outer();
        let back = transform_outward(&transform_inward(&outer));
        assert_eq!(back.as_ref(), &outer);
    }

    #[test]
    fn dotted_names_without_geometry_base_survive() {
        let inner = Schema::new(vec![
            Field::new("pos", DataType::Utf8, true),
            Field::new("pos.x", DataType::Float64, true),
        ]);
        assert_eq!(transform_outward(&inner).fields().len(), 2);
    }
}
