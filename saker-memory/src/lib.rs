//! In-memory backend
//!
//! Compiles translated entity query trees into native predicates over a
//! bean-style property accessor, and filters in-process collections with
//! them. Operator semantics mirror the SQL backend: negated operators only
//! match entities whose property value is present, and collection membership
//! follows the EXISTS rendering.

use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::debug;

use saker_eql::like::LikePattern;
use saker_eql::{BooleanOp, EntityQuery, EntityQueryCondition, EntityQueryExpression, EqlArg};
use saker_schema::{EntityQueryOps, ScalarValue};

/// Value of one property of an entity, as seen by the accessor.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Scalar(ScalarValue),
    Collection(Vec<ScalarValue>),
    Absent,
}

/// Bean-style property access over an entity.
pub trait PropertyAccessor {
    /// Read a property by its (possibly dotted, possibly `[]`-indexed) path.
    fn read(&self, property: &str) -> FieldValue;
}

/// `PropertyAccessor` over a JSON document.
///
/// Dotted paths traverse objects; a `[]` segment (and any array encountered
/// along the way) fans out over the elements, producing a collection value.
#[derive(Debug, Clone)]
pub struct JsonRecord {
    root: serde_json::Value,
}

impl JsonRecord {
    pub fn new(root: serde_json::Value) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &serde_json::Value {
        &self.root
    }
}

impl PropertyAccessor for JsonRecord {
    fn read(&self, property: &str) -> FieldValue {
        let mut nodes: Vec<&serde_json::Value> = vec![&self.root];
        let mut fanned = false;

        for segment in property.split('.') {
            let name = segment.strip_suffix("[]").unwrap_or(segment);
            let mut next = Vec::new();
            for node in nodes {
                let Some(child) = node.get(name) else { continue };
                if let Some(array) = child.as_array() {
                    fanned = true;
                    next.extend(array.iter());
                } else {
                    next.push(child);
                }
            }
            nodes = next;
        }

        if fanned {
            FieldValue::Collection(nodes.into_iter().map(json_scalar).collect())
        } else {
            match nodes.first() {
                Some(node) => FieldValue::Scalar(json_scalar(node)),
                None => FieldValue::Absent,
            }
        }
    }
}

fn json_scalar(value: &serde_json::Value) -> ScalarValue {
    match value {
        serde_json::Value::Null => ScalarValue::Null,
        serde_json::Value::Bool(b) => ScalarValue::Bool(*b),
        serde_json::Value::Number(number) => match number.as_i64() {
            Some(int) => ScalarValue::Int(int),
            None => Decimal::from_str(&number.to_string())
                .map(ScalarValue::Decimal)
                .unwrap_or_else(|_| ScalarValue::Text(number.to_string())),
        },
        serde_json::Value::String(text) => ScalarValue::Text(text.clone()),
        other => ScalarValue::Text(other.to_string()),
    }
}

/// In-memory compilation errors; the counterparts of the SQL backend's.
#[derive(Debug, Error)]
pub enum MemoryCompileError {
    #[error("Unsupported function '{function}' in in-memory query compilation")]
    UnsupportedFunction { function: String },

    #[error("Argument of '{property} {operator}' was not translated to a typed value")]
    UntranslatedArgument { property: String, operator: String },

    #[error("Missing argument for '{property} {operator}'")]
    MissingArgument { property: String, operator: String },
}

type Result<T> = std::result::Result<T, MemoryCompileError>;

/// A compiled query predicate. Compilation validates the tree; evaluation
/// itself is total.
pub struct EntityPredicate {
    test: Box<dyn Fn(&dyn PropertyAccessor) -> bool + Send + Sync>,
}

impl EntityPredicate {
    pub fn test(&self, entity: &dyn PropertyAccessor) -> bool {
        (self.test)(entity)
    }
}

/// Compiles translated query trees into predicates.
pub struct MemoryQueryCompiler;

impl MemoryQueryCompiler {
    pub fn compile(query: &EntityQuery) -> Result<EntityPredicate> {
        let test = compile_group(query)?;
        debug!("compiled entity query to in-memory predicate");
        Ok(EntityPredicate { test })
    }
}

type Predicate = Box<dyn Fn(&dyn PropertyAccessor) -> bool + Send + Sync>;

fn compile_group(query: &EntityQuery) -> Result<Predicate> {
    let children = query
        .expressions
        .iter()
        .map(|expression| match expression {
            EntityQueryExpression::Condition(condition) => compile_condition(condition),
            EntityQueryExpression::Query(sub) => compile_group(sub),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(match query.operand {
        // The empty "all" query conjoins nothing and matches everything.
        BooleanOp::And => Box::new(move |entity| children.iter().all(|child| child(entity))),
        BooleanOp::Or => Box::new(move |entity| children.iter().any(|child| child(entity))),
    })
}

fn compile_condition(condition: &EntityQueryCondition) -> Result<Predicate> {
    let property = condition.property.clone();

    Ok(match condition.operand {
        EntityQueryOps::Eq => {
            let target = scalar_arg(condition)?;
            on_values(property, move |value| values_equal(value, &target))
        }
        EntityQueryOps::Neq => {
            let target = scalar_arg(condition)?;
            on_values(property, move |value| {
                !value.is_null() && !values_equal(value, &target)
            })
        }
        EntityQueryOps::Gt => ordering_predicate(condition, property, |o| o.is_gt())?,
        EntityQueryOps::Ge => ordering_predicate(condition, property, |o| o.is_ge())?,
        EntityQueryOps::Lt => ordering_predicate(condition, property, |o| o.is_lt())?,
        EntityQueryOps::Le => ordering_predicate(condition, property, |o| o.is_le())?,
        EntityQueryOps::In => {
            let targets = group_args(condition)?;
            on_values(property, move |value| {
                targets.iter().any(|target| values_equal(value, target))
            })
        }
        EntityQueryOps::NotIn => {
            let targets = group_args(condition)?;
            on_values(property, move |value| {
                !value.is_null() && !targets.iter().any(|target| values_equal(value, target))
            })
        }
        EntityQueryOps::Like => like_predicate(condition, property, false, false)?,
        EntityQueryOps::NotLike => like_predicate(condition, property, false, true)?,
        EntityQueryOps::LikeIc => like_predicate(condition, property, true, false)?,
        EntityQueryOps::NotLikeIc => like_predicate(condition, property, true, true)?,
        EntityQueryOps::Contains => {
            let target = scalar_arg(condition)?;
            Box::new(move |entity| contains_value(&entity.read(&property), &target))
        }
        EntityQueryOps::NotContains => {
            let target = scalar_arg(condition)?;
            Box::new(move |entity| match entity.read(&property) {
                FieldValue::Absent => false,
                value => !contains_value(&value, &target),
            })
        }
        EntityQueryOps::IsNull => Box::new(move |entity| match entity.read(&property) {
            FieldValue::Absent => true,
            FieldValue::Scalar(value) => value.is_null(),
            FieldValue::Collection(values) => values.is_empty(),
        }),
        EntityQueryOps::IsNotNull => Box::new(move |entity| match entity.read(&property) {
            FieldValue::Absent => false,
            FieldValue::Scalar(value) => !value.is_null(),
            FieldValue::Collection(values) => !values.is_empty(),
        }),
        EntityQueryOps::IsEmpty => Box::new(move |entity| match entity.read(&property) {
            FieldValue::Absent => true,
            FieldValue::Collection(values) => values.is_empty(),
            FieldValue::Scalar(_) => false,
        }),
        EntityQueryOps::IsNotEmpty => Box::new(move |entity| match entity.read(&property) {
            FieldValue::Absent => false,
            FieldValue::Collection(values) => !values.is_empty(),
            FieldValue::Scalar(_) => true,
        }),
    })
}

/// Predicate testing every scalar reachable through the property path; a
/// condition on a collection-valued path matches if any element does.
fn on_values(
    property: String,
    test: impl Fn(&ScalarValue) -> bool + Send + Sync + 'static,
) -> Predicate {
    Box::new(move |entity| match entity.read(&property) {
        FieldValue::Scalar(value) => test(&value),
        FieldValue::Collection(values) => values.iter().any(&test),
        FieldValue::Absent => false,
    })
}

fn ordering_predicate(
    condition: &EntityQueryCondition,
    property: String,
    accept: impl Fn(std::cmp::Ordering) -> bool + Send + Sync + 'static,
) -> Result<Predicate> {
    let target = scalar_arg(condition)?;
    Ok(on_values(property, move |value| {
        coerce(value, &target)
            .compare(&target)
            .map(&accept)
            .unwrap_or(false)
    }))
}

fn like_predicate(
    condition: &EntityQueryCondition,
    property: String,
    ignore_case: bool,
    negated: bool,
) -> Result<Predicate> {
    let raw = match scalar_arg(condition)? {
        ScalarValue::Text(text) => text,
        other => other.to_string(),
    };
    let pattern = LikePattern::parse(&raw);
    Ok(Box::new(move |entity| {
        let matched = |value: &ScalarValue| match value {
            ScalarValue::Text(text) => {
                if ignore_case {
                    pattern.matches_ignore_case(text)
                } else {
                    pattern.matches(text)
                }
            }
            _ => false,
        };
        match entity.read(&property) {
            FieldValue::Scalar(ScalarValue::Null) | FieldValue::Absent => false,
            FieldValue::Scalar(value) => matched(&value) != negated,
            FieldValue::Collection(values) => {
                let any = values.iter().any(matched);
                any != negated
            }
        }
    }))
}

/// Membership on collections, substring on text.
fn contains_value(value: &FieldValue, target: &ScalarValue) -> bool {
    match value {
        FieldValue::Collection(values) => {
            values.iter().any(|value| values_equal(value, target))
        }
        FieldValue::Scalar(ScalarValue::Text(text)) => match target {
            ScalarValue::Text(needle) => text.contains(needle.as_str()),
            other => text.contains(&other.to_string()),
        },
        _ => false,
    }
}

fn values_equal(value: &ScalarValue, target: &ScalarValue) -> bool {
    coerce(value, target)
        .compare(target)
        .map(|ordering| ordering.is_eq())
        .unwrap_or(false)
}

/// JSON carries dates as strings; when the comparison target is temporal,
/// lift text values into the temporal kinds before comparing.
fn coerce(value: &ScalarValue, target: &ScalarValue) -> ScalarValue {
    match (value, target) {
        (ScalarValue::Text(text), ScalarValue::Date(_)) => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(ScalarValue::Date)
            .unwrap_or_else(|_| value.clone()),
        (ScalarValue::Text(text), ScalarValue::DateTime(_)) => parse_date_time(text)
            .map(ScalarValue::DateTime)
            .unwrap_or_else(|_| value.clone()),
        _ => value.clone(),
    }
}

fn parse_date_time(text: &str) -> std::result::Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d").map(|d| d.and_time(chrono::NaiveTime::MIN))
        })
}

fn scalar_arg(condition: &EntityQueryCondition) -> Result<ScalarValue> {
    match condition.arguments.first() {
        Some(EqlArg::Value(value)) => Ok(value.clone()),
        Some(EqlArg::Function(function)) => Err(MemoryCompileError::UnsupportedFunction {
            function: function.name.clone(),
        }),
        Some(_) => Err(MemoryCompileError::UntranslatedArgument {
            property: condition.property.clone(),
            operator: condition.operand.token().to_string(),
        }),
        None => Err(MemoryCompileError::MissingArgument {
            property: condition.property.clone(),
            operator: condition.operand.token().to_string(),
        }),
    }
}

fn group_args(condition: &EntityQueryCondition) -> Result<Vec<ScalarValue>> {
    match condition.arguments.first() {
        Some(EqlArg::Group(items)) => items
            .iter()
            .map(|item| match item {
                EqlArg::Value(value) => Ok(value.clone()),
                EqlArg::Function(function) => Err(MemoryCompileError::UnsupportedFunction {
                    function: function.name.clone(),
                }),
                _ => Err(MemoryCompileError::UntranslatedArgument {
                    property: condition.property.clone(),
                    operator: condition.operand.token().to_string(),
                }),
            })
            .collect(),
        Some(EqlArg::Value(value)) => Ok(vec![value.clone()]),
        _ => scalar_arg(condition).map(|value| vec![value]),
    }
}

/// Executes entity queries against in-process collections.
pub struct CollectionEntityQueryExecutor;

impl CollectionEntityQueryExecutor {
    /// All items matching the query, in input order.
    pub fn find_all<'a, T: PropertyAccessor>(
        query: &EntityQuery,
        items: impl IntoIterator<Item = &'a T>,
    ) -> Result<Vec<&'a T>> {
        let predicate = MemoryQueryCompiler::compile(query)?;
        Ok(items
            .into_iter()
            .filter(|item| predicate.test(*item))
            .collect())
    }
}
