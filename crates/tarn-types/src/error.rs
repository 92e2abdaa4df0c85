use thiserror::Error;

/// Errors produced by type and schema operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("duplicate table name: {0}")]
    DuplicateTable(String),

    #[error("duplicate property {property} in table {table}")]
    DuplicateProperty { table: String, property: String },

    #[error("table {table}: primary key {property} is not a property of the table")]
    MissingPrimaryKey { table: String, property: String },

    #[error("table {table}: primary key {property} must be a non-nullable int or string")]
    InvalidPrimaryKey { table: String, property: String },

    #[error("table {table}: property {property} links to unknown table {target}")]
    UnknownLinkTarget {
        table: String,
        property: String,
        target: String,
    },

    #[error("table {table}: property {property} has an unsupported type ({reason})")]
    InvalidPropertyType {
        table: String,
        property: String,
        reason: String,
    },

    #[error("value of type {actual} does not conform to property type {expected}")]
    TypeMismatch { expected: String, actual: String },
}
