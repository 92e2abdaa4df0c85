//! Foundation types for the Tarn object store.
//!
//! This crate provides the identity, value, and schema types shared by every
//! other Tarn crate.
//!
//! # Key Types
//!
//! - [`Version`] — Monotonically increasing identifier of a committed snapshot
//! - [`ObjectKey`] — Stable per-table object identity, never reused
//! - [`Value`] — A single property value (primitive, link, or list)
//! - [`Schema`] / [`ObjectSchema`] / [`Property`] — Table and property descriptors
//! - [`SchemaChange`] — One difference between two schemas

pub mod error;
pub mod object;
pub mod schema;
pub mod value;
pub mod version;

pub use error::TypeError;
pub use object::ObjectKey;
pub use schema::{ObjectSchema, Property, PropertyType, Schema, SchemaChange};
pub use value::Value;
pub use version::Version;
