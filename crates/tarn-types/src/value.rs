use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::object::ObjectKey;
use crate::schema::PropertyType;

/// A single property value.
///
/// Lists hold either primitives or links, never other lists; this is enforced
/// by schema validation, not by the type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Link to an object in the property's target table.
    Link(ObjectKey),
    List(Vec<Value>),
}

impl Value {
    /// Name of the value's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Link(_) => "link",
            Self::List(_) => "list",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<ObjectKey> {
        match self {
            Self::Link(key) => Some(*key),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns `true` if this value may be stored in a property of the given
    /// type and nullability.
    pub fn conforms_to(&self, ty: &PropertyType, nullable: bool) -> bool {
        match (self, ty) {
            (Self::Null, PropertyType::List(_)) => false,
            (Self::Null, _) => nullable,
            (Self::Bool(_), PropertyType::Bool) => true,
            (Self::Int(_), PropertyType::Int) => true,
            (Self::Double(_), PropertyType::Double) => true,
            (Self::String(_), PropertyType::String) => true,
            (Self::Bytes(_), PropertyType::Bytes) => true,
            (Self::Link(_), PropertyType::Link { .. }) => true,
            (Self::List(items), PropertyType::List(element)) => items
                .iter()
                .all(|item| !matches!(item, Self::List(_)) && item.conforms_to(element, false)),
            _ => false,
        }
    }

    /// The value a new column of the given type is filled with.
    pub fn default_for(ty: &PropertyType, nullable: bool) -> Value {
        if nullable {
            return Self::Null;
        }
        match ty {
            PropertyType::Bool => Self::Bool(false),
            PropertyType::Int => Self::Int(0),
            PropertyType::Double => Self::Double(0.0),
            PropertyType::String => Self::String(String::new()),
            PropertyType::Bytes => Self::Bytes(Vec::new()),
            PropertyType::Link { .. } => Self::Null,
            PropertyType::List(_) => Self::List(Vec::new()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Double(_) => 2,
            Self::String(_) => 3,
            Self::Bytes(_) => 4,
            Self::Link(_) => 5,
            Self::List(_) => 6,
        }
    }

    /// Total order over all values, used for sorting query results.
    ///
    /// Values of different kinds order by kind (null first). Ints and doubles
    /// compare numerically with each other; NaN sorts after every number.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Int(a), Self::Double(b)) => (*a as f64).total_cmp(b),
            (Self::Double(a), Self::Int(b)) => a.total_cmp(&(*b as f64)),
            (Self::Double(a), Self::Double(b)) => a.total_cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Link(a), Self::Link(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.total_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Link(key) => write!(f, "->{key}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<ObjectKey> for Value {
    fn from(v: ObjectKey) -> Self {
        Self::Link(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}
