//! WKT geometry helpers shared by the compiler and the bsquare codec.

use arrow_schema::Field;
use geo::{Area, BoundingRect, Geometry, Intersects, Relate};
use ktable_common::{KtableError, Result};
use wkt::{ToWkt, TryFromWkt};

use crate::ast::BinaryOp;

/// Field metadata key marking a geometry column.
pub const GEOMETRY_META: &str = "isGeometry";

pub fn is_geometry_field(field: &Field) -> bool {
    field.metadata().contains_key(GEOMETRY_META)
}

/// Axis-aligned bounds `(min_x, min_y, max_x, max_y)`.
pub type Bounds = (f64, f64, f64, f64);

pub fn parse_wkt(text: &str) -> Result<Geometry<f64>> {
    Geometry::<f64>::try_from_wkt_str(text)
        .map_err(|e| KtableError::Compile(format!("invalid WKT '{text}': {e}")))
}

/// `None` for empty geometries.
pub fn bounds(g: &Geometry<f64>) -> Option<Bounds> {
    g.bounding_rect()
        .map(|r| (r.min().x, r.min().y, r.max().x, r.max().y))
}

pub fn is_point(g: &Geometry<f64>) -> bool {
    matches!(g, Geometry::Point(_))
}

/// True when the shape fills its own bounding box exactly.
pub fn is_axis_rectangle(g: &Geometry<f64>) -> bool {
    match g {
        Geometry::Rect(_) => true,
        Geometry::Polygon(p) if p.interiors().is_empty() => {
            let Some((x0, y0, x1, y1)) = bounds(g) else {
                return false;
            };
            let box_area = (x1 - x0) * (y1 - y0);
            if box_area <= 0.0 {
                return false;
            }
            let corner = |x: f64, y: f64| (x == x0 || x == x1) && (y == y0 || y == y1);
            p.exterior().coords().all(|c| corner(c.x, c.y))
                && (p.unsigned_area() - box_area).abs() <= box_area * 1e-12
        }
        _ => false,
    }
}

/// Exact evaluation of a spatial relation between two shapes.
///
/// `==` is structural equality of the parsed shapes.
pub fn relate(op: BinaryOp, a: &Geometry<f64>, b: &Geometry<f64>) -> Result<bool> {
    match op {
        BinaryOp::Intersects => Ok(a.intersects(b)),
        BinaryOp::Contains => Ok(a.relate(b).is_contains()),
        BinaryOp::Within => Ok(a.relate(b).is_within()),
        BinaryOp::Eq => Ok(a == b),
        BinaryOp::NotEq => Ok(a != b),
        other => Err(KtableError::Compile(format!(
            "operator '{other}' is not a spatial relation"
        ))),
    }
}

/// Converts a GeoJSON geometry object into WKT text.
pub fn geojson_to_wkt(value: &serde_json::Value) -> Result<String> {
    let gj = geojson::Geometry::from_json_value(value.clone()).map_err(|e| {
        KtableError::Parse {
            message: format!("invalid GeoJSON geometry: {e}"),
            at: value.to_string(),
        }
    })?;
    let g: Geometry<f64> = gj.try_into().map_err(|e: geojson::Error| KtableError::Parse {
        message: format!("unsupported GeoJSON geometry: {e}"),
        at: value.to_string(),
    })?;
    Ok(g.wkt_string())
}

/// True for JSON objects shaped like a GeoJSON geometry.
pub fn looks_like_geojson(value: &serde_json::Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    matches!(
        obj.get("type").and_then(|t| t.as_str()),
        Some(
            "Point"
                | "MultiPoint"
                | "LineString"
                | "MultiLineString"
                | "Polygon"
                | "MultiPolygon"
                | "GeometryCollection"
        )
    ) && (obj.contains_key("coordinates") || obj.contains_key("geometries"))
}
