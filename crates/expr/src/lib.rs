//! Query expressions: tree, parsers and the Arrow predicate compiler.
//!
//! Architecture role:
//! - [`Op`] is the one expression type every layer rewrites and renders
//! - two surface syntaxes (infix text and OQS JSON) parse into it
//! - [`Predicate`] evaluates a tree exactly against decoded batches
//!
//! Key modules:
//! - [`ast`]
//! - [`parser`]
//! - [`oqs`]
//! - [`compile`]
//! - [`geometry`]

pub mod ast;
pub mod compile;
pub mod geometry;
pub mod oqs;
pub mod parser;

pub use ast::{BinOp, BinaryOp, Field, Func, Op, Scalar, ScalarKind, ScalarValue, UnaryOp};
pub use compile::{compile, PhysicalExpr, Predicate};
pub use geometry::{is_geometry_field, GEOMETRY_META};
pub use oqs::{list_to_tree_expression, parse_oqs, parse_oqs_str};
pub use parser::parse;
