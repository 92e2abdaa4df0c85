//! Schema descriptors: tables, typed properties, and schema diffing.
//!
//! A [`Schema`] is an ordered list of [`ObjectSchema`]s. Each table has an
//! ordered list of [`Property`]s and at most one primary-key property. The
//! store keeps row values in property order, so property position matters.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// The type of a property.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    Bool,
    Int,
    Double,
    String,
    Bytes,
    /// Link to an object in `target`.
    Link { target: String },
    /// List of primitives or links.
    List(Box<PropertyType>),
}

impl PropertyType {
    /// Shorthand for a link property type.
    pub fn link(target: impl Into<String>) -> Self {
        Self::Link {
            target: target.into(),
        }
    }

    /// Shorthand for a list property type.
    pub fn list(element: PropertyType) -> Self {
        Self::List(Box::new(element))
    }

    /// The table linked to by this property (directly or through a list).
    pub fn link_target(&self) -> Option<&str> {
        match self {
            Self::Link { target } => Some(target),
            Self::List(element) => element.link_target(),
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Double => write!(f, "double"),
            Self::String => write!(f, "string"),
            Self::Bytes => write!(f, "bytes"),
            Self::Link { target } => write!(f, "link<{target}>"),
            Self::List(element) => write!(f, "list<{element}>"),
        }
    }
}

/// A single typed property of a table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub ty: PropertyType,
    pub nullable: bool,
}

impl Property {
    /// A non-nullable property.
    pub fn new(name: impl Into<String>, ty: PropertyType) -> Self {
        let nullable = matches!(ty, PropertyType::Link { .. });
        Self {
            name: name.into(),
            ty,
            nullable,
        }
    }

    /// A nullable property. Lists are never nullable.
    pub fn nullable(name: impl Into<String>, ty: PropertyType) -> Self {
        let nullable = !ty.is_list();
        Self {
            name: name.into(),
            ty,
            nullable,
        }
    }
}

/// Descriptor for one table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSchema {
    pub name: String,
    pub properties: Vec<Property>,
    pub primary_key: Option<String>,
}

impl ObjectSchema {
    pub fn new(name: impl Into<String>, properties: Vec<Property>) -> Self {
        Self {
            name: name.into(),
            properties,
            primary_key: None,
        }
    }

    /// Set the primary-key property.
    pub fn with_primary_key(mut self, property: impl Into<String>) -> Self {
        self.primary_key = Some(property.into());
        self
    }

    /// Position of a property by name.
    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    /// Look up a property by name.
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Position of the primary-key property, if any.
    pub fn primary_key_index(&self) -> Option<usize> {
        self.primary_key
            .as_deref()
            .and_then(|pk| self.property_index(pk))
    }
}

/// One difference between an existing schema and a requested schema.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaChange {
    AddTable(ObjectSchema),
    RemoveTable(String),
    AddProperty { table: String, property: Property },
    RemoveProperty { table: String, property: String },
    ChangePropertyType {
        table: String,
        property: String,
        old: Property,
        new: Property,
    },
    ChangePrimaryKey {
        table: String,
        old: Option<String>,
        new: Option<String>,
    },
}

impl SchemaChange {
    /// Additive changes can be applied without a schema version bump.
    pub fn is_additive(&self) -> bool {
        matches!(self, Self::AddTable(_) | Self::AddProperty { .. })
    }
}

/// An ordered collection of table descriptors.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<ObjectSchema>,
}

impl Schema {
    pub fn new(tables: Vec<ObjectSchema>) -> Self {
        Self { tables }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Option<&ObjectSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut ObjectSchema> {
        self.tables.iter_mut().find(|t| t.name == name)
    }

    /// Check the structural rules every stored schema must satisfy.
    pub fn validate(&self) -> Result<(), TypeError> {
        let mut table_names = HashSet::new();
        for table in &self.tables {
            if !table_names.insert(table.name.as_str()) {
                return Err(TypeError::DuplicateTable(table.name.clone()));
            }
        }

        for table in &self.tables {
            let mut property_names = HashSet::new();
            for property in &table.properties {
                if !property_names.insert(property.name.as_str()) {
                    return Err(TypeError::DuplicateProperty {
                        table: table.name.clone(),
                        property: property.name.clone(),
                    });
                }
                self.validate_property(table, property)?;
            }

            if let Some(pk) = &table.primary_key {
                let property = table.property(pk).ok_or_else(|| TypeError::MissingPrimaryKey {
                    table: table.name.clone(),
                    property: pk.clone(),
                })?;
                let valid = !property.nullable
                    && matches!(property.ty, PropertyType::Int | PropertyType::String);
                if !valid {
                    return Err(TypeError::InvalidPrimaryKey {
                        table: table.name.clone(),
                        property: pk.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_property(&self, table: &ObjectSchema, property: &Property) -> Result<(), TypeError> {
        let invalid = |reason: &str| TypeError::InvalidPropertyType {
            table: table.name.clone(),
            property: property.name.clone(),
            reason: reason.to_string(),
        };

        match &property.ty {
            PropertyType::Link { .. } if !property.nullable => {
                return Err(invalid("links must be nullable"));
            }
            PropertyType::List(element) => {
                if property.nullable {
                    return Err(invalid("lists cannot be nullable"));
                }
                if element.is_list() {
                    return Err(invalid("nested lists are not supported"));
                }
            }
            _ => {}
        }

        if let Some(target) = property.ty.link_target() {
            if self.table(target).is_none() {
                return Err(TypeError::UnknownLinkTarget {
                    table: table.name.clone(),
                    property: property.name.clone(),
                    target: target.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Compute the changes needed to turn `self` into `target`.
    ///
    /// Table and property order of `target` is preserved for additions.
    pub fn diff(&self, target: &Schema) -> Vec<SchemaChange> {
        let mut changes = Vec::new();

        for table in &self.tables {
            if target.table(&table.name).is_none() {
                changes.push(SchemaChange::RemoveTable(table.name.clone()));
            }
        }

        for new_table in &target.tables {
            let Some(old_table) = self.table(&new_table.name) else {
                changes.push(SchemaChange::AddTable(new_table.clone()));
                continue;
            };

            for old_prop in &old_table.properties {
                match new_table.property(&old_prop.name) {
                    None => changes.push(SchemaChange::RemoveProperty {
                        table: new_table.name.clone(),
                        property: old_prop.name.clone(),
                    }),
                    Some(new_prop) if new_prop != old_prop => {
                        changes.push(SchemaChange::ChangePropertyType {
                            table: new_table.name.clone(),
                            property: old_prop.name.clone(),
                            old: old_prop.clone(),
                            new: new_prop.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }

            for new_prop in &new_table.properties {
                if old_table.property(&new_prop.name).is_none() {
                    changes.push(SchemaChange::AddProperty {
                        table: new_table.name.clone(),
                        property: new_prop.clone(),
                    });
                }
            }

            if old_table.primary_key != new_table.primary_key {
                changes.push(SchemaChange::ChangePrimaryKey {
                    table: new_table.name.clone(),
                    old: old_table.primary_key.clone(),
                    new: new_table.primary_key.clone(),
                });
            }
        }

        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dog_schema() -> Schema {
        Schema::new(vec![
            ObjectSchema::new(
                "Person",
                vec![
                    Property::new("id", PropertyType::Int),
                    Property::new("name", PropertyType::String),
                    Property::new("dogs", PropertyType::list(PropertyType::link("Dog"))),
                ],
            )
            .with_primary_key("id"),
            ObjectSchema::new(
                "Dog",
                vec![
                    Property::new("name", PropertyType::String),
                    Property::nullable("age", PropertyType::Int),
                    Property::new("owner", PropertyType::link("Person")),
                ],
            ),
        ])
    }

    #[test]
    fn valid_schema_passes() {
        dog_schema().validate().unwrap();
    }

    #[test]
    fn duplicate_table_rejected() {
        let mut schema = dog_schema();
        schema.tables.push(ObjectSchema::new("Dog", vec![]));
        assert_eq!(
            schema.validate().unwrap_err(),
            TypeError::DuplicateTable("Dog".into())
        );
    }

    #[test]
    fn unknown_link_target_rejected() {
        let schema = Schema::new(vec![ObjectSchema::new(
            "Dog",
            vec![Property::new("owner", PropertyType::link("Cat"))],
        )]);
        assert!(matches!(
            schema.validate(),
            Err(TypeError::UnknownLinkTarget { .. })
        ));
    }

    #[test]
    fn nullable_primary_key_rejected() {
        let schema = Schema::new(vec![ObjectSchema::new(
            "Dog",
            vec![Property::nullable("id", PropertyType::Int)],
        )
        .with_primary_key("id")]);
        assert!(matches!(
            schema.validate(),
            Err(TypeError::InvalidPrimaryKey { .. })
        ));
    }

    #[test]
    fn nested_list_rejected() {
        let schema = Schema::new(vec![ObjectSchema::new(
            "Grid",
            vec![Property::new(
                "cells",
                PropertyType::list(PropertyType::list(PropertyType::Int)),
            )],
        )]);
        assert!(matches!(
            schema.validate(),
            Err(TypeError::InvalidPropertyType { .. })
        ));
    }

    #[test]
    fn property_constructors_pick_nullability() {
        assert!(Property::new("owner", PropertyType::link("Person")).nullable);
        assert!(!Property::nullable("tags", PropertyType::list(PropertyType::String)).nullable);
        assert!(Property::nullable("age", PropertyType::Int).nullable);
    }

    #[test]
    fn diff_identical_is_empty() {
        let schema = dog_schema();
        assert!(schema.diff(&schema).is_empty());
    }

    #[test]
    fn diff_detects_additions_and_removals() {
        let old = dog_schema();
        let mut new = dog_schema();
        new.tables.retain(|t| t.name != "Dog");
        new.table_mut("Person").unwrap().properties.retain(|p| p.name != "dogs");
        new.table_mut("Person")
            .unwrap()
            .properties
            .push(Property::nullable("email", PropertyType::String));
        new.tables.push(ObjectSchema::new("Cat", vec![]));

        let changes = old.diff(&new);
        assert!(changes.contains(&SchemaChange::RemoveTable("Dog".into())));
        assert!(changes.contains(&SchemaChange::RemoveProperty {
            table: "Person".into(),
            property: "dogs".into(),
        }));
        assert!(changes.iter().any(|c| matches!(
            c,
            SchemaChange::AddProperty { property, .. } if property.name == "email"
        )));
        assert!(changes
            .iter()
            .any(|c| matches!(c, SchemaChange::AddTable(t) if t.name == "Cat")));
    }

    #[test]
    fn diff_detects_type_change() {
        let old = dog_schema();
        let mut new = dog_schema();
        new.table_mut("Dog").unwrap().properties[1] = Property::nullable("age", PropertyType::Double);
        let changes = old.diff(&new);
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].is_additive());
    }

    #[test]
    fn primary_key_index_lookup() {
        let schema = dog_schema();
        assert_eq!(schema.table("Person").unwrap().primary_key_index(), Some(0));
        assert_eq!(schema.table("Dog").unwrap().primary_key_index(), None);
    }
}
