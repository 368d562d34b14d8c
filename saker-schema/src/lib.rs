//! Saker Entity Schema
//!
//! This module defines the shared vocabulary of the Saker query engine: the
//! operator set, the scalar value model, property descriptors and the property
//! registry consulted during query translation. Backends depend on these types
//! but never on each other.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Operators
// ============================================================================

/// Operator set of the entity query language.
///
/// Every operator has a canonical token string used both by the parser when
/// matching input and by error messages when enumerating the operators a
/// property supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityQueryOps {
    Eq,
    Neq,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    NotLike,
    LikeIc,
    NotLikeIc,
    Contains,
    NotContains,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    IsEmpty,
    IsNotEmpty,
}

impl EntityQueryOps {
    /// Canonical token string of the operator.
    pub fn token(&self) -> &'static str {
        match self {
            EntityQueryOps::Eq => "=",
            EntityQueryOps::Neq => "!=",
            EntityQueryOps::Gt => ">",
            EntityQueryOps::Ge => ">=",
            EntityQueryOps::Lt => "<",
            EntityQueryOps::Le => "<=",
            EntityQueryOps::Like => "like",
            EntityQueryOps::NotLike => "not like",
            EntityQueryOps::LikeIc => "ilike",
            EntityQueryOps::NotLikeIc => "not ilike",
            EntityQueryOps::Contains => "contains",
            EntityQueryOps::NotContains => "not contains",
            EntityQueryOps::In => "in",
            EntityQueryOps::NotIn => "not in",
            EntityQueryOps::IsNull => "is null",
            EntityQueryOps::IsNotNull => "is not null",
            EntityQueryOps::IsEmpty => "is empty",
            EntityQueryOps::IsNotEmpty => "is not empty",
        }
    }

    /// Whether this operator is the negated form of another operator.
    ///
    /// Backends that only know how to build the positive form combine
    /// [`EntityQueryOps::base_operator`] with an outer negation.
    pub fn is_negation(&self) -> bool {
        matches!(
            self,
            EntityQueryOps::Neq
                | EntityQueryOps::NotLike
                | EntityQueryOps::NotLikeIc
                | EntityQueryOps::NotContains
                | EntityQueryOps::NotIn
                | EntityQueryOps::IsNotNull
                | EntityQueryOps::IsNotEmpty
        )
    }

    /// The positive counterpart of a negated operator, or the operator itself.
    pub fn base_operator(&self) -> EntityQueryOps {
        match self {
            EntityQueryOps::Neq => EntityQueryOps::Eq,
            EntityQueryOps::NotLike => EntityQueryOps::Like,
            EntityQueryOps::NotLikeIc => EntityQueryOps::LikeIc,
            EntityQueryOps::NotContains => EntityQueryOps::Contains,
            EntityQueryOps::NotIn => EntityQueryOps::In,
            EntityQueryOps::IsNotNull => EntityQueryOps::IsNull,
            EntityQueryOps::IsNotEmpty => EntityQueryOps::IsEmpty,
            other => *other,
        }
    }

    /// Whether the operator takes no argument (the `is …` family).
    pub fn is_unary(&self) -> bool {
        matches!(
            self,
            EntityQueryOps::IsNull
                | EntityQueryOps::IsNotNull
                | EntityQueryOps::IsEmpty
                | EntityQueryOps::IsNotEmpty
        )
    }

    /// Whether a parenthesized value group is a legal argument.
    pub fn accepts_group(&self) -> bool {
        matches!(
            self,
            EntityQueryOps::In
                | EntityQueryOps::NotIn
                | EntityQueryOps::Contains
                | EntityQueryOps::NotContains
        )
    }
}

impl fmt::Display for EntityQueryOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

// ============================================================================
// Scalar values
// ============================================================================

/// A typed scalar value produced by query translation.
///
/// Numeric literals are carried as [`Decimal`] or `i64` so that the whole
/// value model is `Eq + Hash`, which is what makes translated query trees
/// structurally comparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarValue {
    Text(String),
    Int(i64),
    Decimal(Decimal),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Null,
}

impl ScalarValue {
    /// Get as string slice if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get as i64 if possible.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as bool if possible.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScalarValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view of the value, widening `Int` to `Decimal`.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            ScalarValue::Decimal(d) => Some(*d),
            ScalarValue::Int(v) => Some(Decimal::from(*v)),
            _ => None,
        }
    }

    /// Date-time view of the value, widening `Date` to midnight.
    pub fn as_date_time(&self) -> Option<NaiveDateTime> {
        match self {
            ScalarValue::DateTime(dt) => Some(*dt),
            ScalarValue::Date(d) => d.and_hms_opt(0, 0, 0),
            _ => None,
        }
    }

    /// Check if value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    /// Ordering comparison across compatible value kinds.
    ///
    /// Numeric kinds compare across `Int`/`Decimal`, temporal kinds across
    /// `Date`/`DateTime`. Incompatible kinds return `None`.
    pub fn compare(&self, other: &ScalarValue) -> Option<Ordering> {
        match (self, other) {
            (ScalarValue::Text(a), ScalarValue::Text(b)) => Some(a.cmp(b)),
            (ScalarValue::Bool(a), ScalarValue::Bool(b)) => Some(a.cmp(b)),
            (ScalarValue::Null, ScalarValue::Null) => Some(Ordering::Equal),
            (a, b) => {
                if let (Some(x), Some(y)) = (a.as_decimal(), b.as_decimal()) {
                    return Some(x.cmp(&y));
                }
                if let (Some(x), Some(y)) = (a.as_date_time(), b.as_date_time()) {
                    return Some(x.cmp(&y));
                }
                None
            }
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Text(s) => f.write_str(s),
            ScalarValue::Int(v) => write!(f, "{}", v),
            ScalarValue::Decimal(d) => write!(f, "{}", d),
            ScalarValue::Bool(b) => write!(f, "{}", b),
            ScalarValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            ScalarValue::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S")),
            ScalarValue::Null => f.write_str("NULL"),
        }
    }
}

// ============================================================================
// Property metadata
// ============================================================================

/// Declared type of an entity property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    DateTime,
    /// Opaque reference to another entity, compared by identity only.
    Entity,
    /// Collection of elements of the given kind.
    Collection(Box<PropertyKind>),
}

const TEXT_OPS: &[EntityQueryOps] = &[
    EntityQueryOps::Eq,
    EntityQueryOps::Neq,
    EntityQueryOps::In,
    EntityQueryOps::NotIn,
    EntityQueryOps::Like,
    EntityQueryOps::NotLike,
    EntityQueryOps::LikeIc,
    EntityQueryOps::NotLikeIc,
    EntityQueryOps::IsNull,
    EntityQueryOps::IsNotNull,
    EntityQueryOps::IsEmpty,
    EntityQueryOps::IsNotEmpty,
    EntityQueryOps::Contains,
    EntityQueryOps::NotContains,
];

const ORDERED_OPS: &[EntityQueryOps] = &[
    EntityQueryOps::Eq,
    EntityQueryOps::Neq,
    EntityQueryOps::In,
    EntityQueryOps::NotIn,
    EntityQueryOps::Gt,
    EntityQueryOps::Ge,
    EntityQueryOps::Lt,
    EntityQueryOps::Le,
    EntityQueryOps::IsNull,
    EntityQueryOps::IsNotNull,
    EntityQueryOps::IsEmpty,
    EntityQueryOps::IsNotEmpty,
];

const REFERENCE_OPS: &[EntityQueryOps] = &[
    EntityQueryOps::Eq,
    EntityQueryOps::Neq,
    EntityQueryOps::In,
    EntityQueryOps::NotIn,
    EntityQueryOps::IsNull,
    EntityQueryOps::IsNotNull,
    EntityQueryOps::IsEmpty,
    EntityQueryOps::IsNotEmpty,
];

const COLLECTION_OPS: &[EntityQueryOps] = &[
    EntityQueryOps::Contains,
    EntityQueryOps::NotContains,
    EntityQueryOps::IsNull,
    EntityQueryOps::IsNotNull,
    EntityQueryOps::IsEmpty,
    EntityQueryOps::IsNotEmpty,
];

impl PropertyKind {
    /// The operators that are legal for a property of this kind.
    pub fn supported_operators(&self) -> &'static [EntityQueryOps] {
        match self {
            PropertyKind::Text => TEXT_OPS,
            PropertyKind::Integer
            | PropertyKind::Decimal
            | PropertyKind::Date
            | PropertyKind::DateTime => ORDERED_OPS,
            PropertyKind::Boolean | PropertyKind::Entity => REFERENCE_OPS,
            PropertyKind::Collection(_) => COLLECTION_OPS,
        }
    }

    /// Whether the given operator is legal for this kind.
    pub fn supports(&self, op: EntityQueryOps) -> bool {
        self.supported_operators().contains(&op)
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, PropertyKind::Collection(_))
    }

    /// The kind of a single element: the element kind for collections, the
    /// kind itself otherwise. Argument conversion always targets this.
    pub fn element_kind(&self) -> &PropertyKind {
        match self {
            PropertyKind::Collection(inner) => inner.element_kind(),
            other => other,
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKind::Text => f.write_str("text"),
            PropertyKind::Integer => f.write_str("integer"),
            PropertyKind::Decimal => f.write_str("decimal"),
            PropertyKind::Boolean => f.write_str("boolean"),
            PropertyKind::Date => f.write_str("date"),
            PropertyKind::DateTime => f.write_str("datetime"),
            PropertyKind::Entity => f.write_str("entity"),
            PropertyKind::Collection(inner) => write!(f, "collection<{}>", inner),
        }
    }
}

/// Descriptor of a single queryable property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    /// Property name as used in queries (e.g. "name", "company.address.city").
    pub name: String,
    /// Declared kind of the property.
    pub kind: PropertyKind,
    /// Whether text comparisons on this property are case-insensitive.
    pub case_insensitive: bool,
    /// Physical path the logical name translates to, if they differ.
    pub target_path: Option<String>,
}

impl PropertyDescriptor {
    /// Create a descriptor with default flags.
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            case_insensitive: false,
            target_path: None,
        }
    }

    /// Mark text comparisons on this property as case-insensitive.
    pub fn with_case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// Set the physical path the logical name maps to.
    pub fn with_target_path(mut self, path: impl Into<String>) -> Self {
        self.target_path = Some(path.into());
        self
    }

    /// The name backends should address: the target path when present.
    pub fn resolved_name(&self) -> &str {
        self.target_path.as_deref().unwrap_or(&self.name)
    }
}

// ============================================================================
// Property registry
// ============================================================================

/// Registry of queryable properties.
///
/// Uses DashMap for concurrent access without locking; translation and
/// compilation may run from any number of threads against one registry.
#[derive(Debug, Default)]
pub struct PropertyRegistry {
    properties: dashmap::DashMap<String, PropertyDescriptor>,
}

impl PropertyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            properties: dashmap::DashMap::new(),
        }
    }

    /// Register a property descriptor.
    pub fn register(&self, descriptor: PropertyDescriptor) -> Result<(), SchemaError> {
        if self.properties.contains_key(&descriptor.name) {
            return Err(SchemaError::PropertyAlreadyExists(descriptor.name));
        }
        self.properties.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Get a descriptor by its registered name.
    pub fn property(&self, name: &str) -> Option<PropertyDescriptor> {
        self.properties.get(name).map(|v| v.value().clone())
    }

    /// Resolve a name to a descriptor, accepting translated names.
    ///
    /// Looks up the registered name first, then falls back to matching the
    /// target path of any descriptor. The fallback is what keeps translation
    /// idempotent: a query whose properties were already rewritten to their
    /// physical paths still resolves.
    pub fn resolve(&self, name: &str) -> Option<PropertyDescriptor> {
        if let Some(found) = self.property(name) {
            return Some(found);
        }
        self.properties
            .iter()
            .find(|entry| entry.value().target_path.as_deref() == Some(name))
            .map(|entry| entry.value().clone())
    }

    pub fn is_valid_property(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Whether the operator is legal for the named property's declared kind.
    pub fn is_valid_operator_for_property(&self, op: EntityQueryOps, name: &str) -> bool {
        self.resolve(name)
            .map(|descriptor| descriptor.kind.supports(op))
            .unwrap_or(false)
    }

    /// List all registered descriptors.
    pub fn list_properties(&self) -> Vec<PropertyDescriptor> {
        self.properties
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

// ============================================================================
// Type conversion
// ============================================================================

/// Converts raw query literals to typed scalar values.
pub trait TypeConverter: Send + Sync {
    /// Convert one raw literal to the target kind.
    fn convert(&self, raw: &str, target: &PropertyKind) -> Result<ScalarValue, ConversionError>;

    /// Convert a batch of raw literals, preserving order.
    fn convert_all(
        &self,
        raw: &[String],
        target: &PropertyKind,
    ) -> Result<Vec<ScalarValue>, ConversionError> {
        raw.iter().map(|value| self.convert(value, target)).collect()
    }
}

/// Literal-parsing converter covering the built-in property kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTypeConverter;

impl TypeConverter for DefaultTypeConverter {
    fn convert(&self, raw: &str, target: &PropertyKind) -> Result<ScalarValue, ConversionError> {
        match target {
            PropertyKind::Text | PropertyKind::Entity => Ok(ScalarValue::Text(raw.to_string())),
            PropertyKind::Integer => raw
                .parse::<i64>()
                .map(ScalarValue::Int)
                .map_err(|_| ConversionError::new(raw, target)),
            PropertyKind::Decimal => Decimal::from_str(raw)
                .map(ScalarValue::Decimal)
                .map_err(|_| ConversionError::new(raw, target)),
            PropertyKind::Boolean => {
                if raw.eq_ignore_ascii_case("true") {
                    Ok(ScalarValue::Bool(true))
                } else if raw.eq_ignore_ascii_case("false") {
                    Ok(ScalarValue::Bool(false))
                } else {
                    Err(ConversionError::new(raw, target))
                }
            }
            PropertyKind::Date => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(ScalarValue::Date)
                .map_err(|_| ConversionError::new(raw, target)),
            PropertyKind::DateTime => parse_date_time(raw)
                .map(ScalarValue::DateTime)
                .ok_or_else(|| ConversionError::new(raw, target)),
            PropertyKind::Collection(inner) => self.convert(raw, inner),
        }
    }
}

fn parse_date_time(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

// ============================================================================
// Errors
// ============================================================================

/// Schema errors
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Property already exists: {0}")]
    PropertyAlreadyExists(String),

    #[error("Property not found: {0}")]
    PropertyNotFound(String),
}

/// A raw literal could not be converted to the requested kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cannot convert '{raw}' to {target}")]
pub struct ConversionError {
    pub raw: String,
    pub target: String,
}

impl ConversionError {
    pub fn new(raw: impl Into<String>, target: &PropertyKind) -> Self {
        Self {
            raw: raw.into(),
            target: target.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = PropertyRegistry::new();
        registry
            .register(PropertyDescriptor::new("name", PropertyKind::Text))
            .unwrap();

        let descriptor = registry.property("name").unwrap();
        assert_eq!(descriptor.name, "name");
        assert_eq!(descriptor.kind, PropertyKind::Text);
        assert!(registry.is_valid_property("name"));
        assert!(!registry.is_valid_property("unknown"));
    }

    #[test]
    fn test_duplicate_property() {
        let registry = PropertyRegistry::new();
        let descriptor = PropertyDescriptor::new("name", PropertyKind::Text);

        registry.register(descriptor.clone()).unwrap();
        let result = registry.register(descriptor);
        assert!(matches!(result, Err(SchemaError::PropertyAlreadyExists(_))));
    }

    #[test]
    fn test_resolve_accepts_target_path() {
        let registry = PropertyRegistry::new();
        registry
            .register(
                PropertyDescriptor::new("id", PropertyKind::Entity).with_target_path("identifier"),
            )
            .unwrap();

        assert_eq!(registry.resolve("id").unwrap().name, "id");
        assert_eq!(registry.resolve("identifier").unwrap().name, "id");
    }

    #[test]
    fn test_operator_matrix() {
        assert!(PropertyKind::Text.supports(EntityQueryOps::Like));
        assert!(PropertyKind::Text.supports(EntityQueryOps::Contains));
        assert!(!PropertyKind::Text.supports(EntityQueryOps::Gt));

        assert!(PropertyKind::Integer.supports(EntityQueryOps::Gt));
        assert!(!PropertyKind::Integer.supports(EntityQueryOps::Like));

        assert!(PropertyKind::Entity.supports(EntityQueryOps::In));
        assert!(!PropertyKind::Entity.supports(EntityQueryOps::Contains));

        let collection = PropertyKind::Collection(Box::new(PropertyKind::Text));
        assert!(collection.supports(EntityQueryOps::Contains));
        assert!(collection.supports(EntityQueryOps::IsEmpty));
        assert!(!collection.supports(EntityQueryOps::Eq));
    }

    #[test]
    fn test_operator_tokens_and_negation() {
        assert_eq!(EntityQueryOps::NotLikeIc.token(), "not ilike");
        assert_eq!(EntityQueryOps::IsNotEmpty.token(), "is not empty");

        assert!(EntityQueryOps::NotIn.is_negation());
        assert_eq!(
            EntityQueryOps::NotIn.base_operator(),
            EntityQueryOps::In
        );
        assert!(!EntityQueryOps::Eq.is_negation());
        assert_eq!(EntityQueryOps::Eq.base_operator(), EntityQueryOps::Eq);

        assert!(EntityQueryOps::IsNull.is_unary());
        assert!(!EntityQueryOps::In.is_unary());
    }

    #[test]
    fn test_scalar_compare_across_kinds() {
        let int = ScalarValue::Int(2);
        let decimal = ScalarValue::Decimal(Decimal::from_str("2.5").unwrap());
        assert_eq!(int.compare(&decimal), Some(Ordering::Less));

        let date = ScalarValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let date_time = ScalarValue::DateTime(
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
        );
        assert_eq!(date.compare(&date_time), Some(Ordering::Less));

        assert_eq!(int.compare(&ScalarValue::Text("2".into())), None);
    }

    #[test]
    fn test_default_converter() {
        let converter = DefaultTypeConverter;

        assert_eq!(
            converter.convert("42", &PropertyKind::Integer).unwrap(),
            ScalarValue::Int(42)
        );
        assert_eq!(
            converter.convert("TRUE", &PropertyKind::Boolean).unwrap(),
            ScalarValue::Bool(true)
        );
        assert_eq!(
            converter.convert("2024-03-01", &PropertyKind::Date).unwrap(),
            ScalarValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
        assert!(converter.convert("nope", &PropertyKind::Integer).is_err());

        let collection = PropertyKind::Collection(Box::new(PropertyKind::Integer));
        assert_eq!(
            converter.convert("7", &collection).unwrap(),
            ScalarValue::Int(7)
        );
    }

    #[test]
    fn test_convert_all_preserves_order() {
        let converter = DefaultTypeConverter;
        let raw = vec!["3".to_string(), "1".to_string(), "2".to_string()];
        let values = converter.convert_all(&raw, &PropertyKind::Integer).unwrap();
        assert_eq!(
            values,
            vec![ScalarValue::Int(3), ScalarValue::Int(1), ScalarValue::Int(2)]
        );
    }
}
