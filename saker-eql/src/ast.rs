//! EQL Abstract Syntax Tree (AST) definitions
//!
//! All nodes are immutable value objects: parsing builds a tree once and
//! translation produces a new tree, so the raw and translated forms of a
//! query can be retained and compared structurally.

use saker_schema::{EntityQueryOps, ScalarValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Argument value of a condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EqlArg {
    /// Bare literal as written in the query, before type coercion.
    Literal(String),
    /// Quoted string literal; delimiter escapes already removed.
    Str(String),
    /// Parenthesized value list for `in`/`contains`. Groups may not nest.
    Group(Vec<EqlArg>),
    /// Function call. Functions may nest as arguments of other functions.
    Function(EqlFunction),
    /// Typed value produced by translation. A fixed point under translation.
    Value(ScalarValue),
}

impl EqlArg {
    /// The raw text of an untranslated literal or string argument.
    pub fn raw_text(&self) -> Option<&str> {
        match self {
            EqlArg::Literal(text) | EqlArg::Str(text) => Some(text),
            _ => None,
        }
    }

    /// The typed value of a translated argument.
    pub fn as_value(&self) -> Option<&ScalarValue> {
        match self {
            EqlArg::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// Function call value: `now()`, `currentUser()`, `today(-1y)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EqlFunction {
    pub name: String,
    pub args: Vec<EqlArg>,
}

impl EqlFunction {
    pub fn new(name: impl Into<String>, args: Vec<EqlArg>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Boolean operand combining the expressions of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BooleanOp {
    And,
    Or,
}

impl fmt::Display for BooleanOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BooleanOp::And => f.write_str("and"),
            BooleanOp::Or => f.write_str("or"),
        }
    }
}

/// A single `property operator argument(s)` clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityQueryCondition {
    pub property: String,
    pub operand: EntityQueryOps,
    pub arguments: Vec<EqlArg>,
}

impl EntityQueryCondition {
    pub fn new(property: impl Into<String>, operand: EntityQueryOps, arguments: Vec<EqlArg>) -> Self {
        Self {
            property: property.into(),
            operand,
            arguments,
        }
    }

    /// Condition without arguments, for the unary `is ...` operators.
    pub fn unary(property: impl Into<String>, operand: EntityQueryOps) -> Self {
        Self::new(property, operand, Vec::new())
    }
}

/// One expression of a query group: a condition or a nested group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityQueryExpression {
    Condition(EntityQueryCondition),
    Query(EntityQuery),
}

impl From<EntityQueryCondition> for EntityQueryExpression {
    fn from(condition: EntityQueryCondition) -> Self {
        EntityQueryExpression::Condition(condition)
    }
}

impl From<EntityQuery> for EntityQueryExpression {
    fn from(query: EntityQuery) -> Self {
        EntityQueryExpression::Query(query)
    }
}

/// A group of expressions combined with a single boolean operand.
///
/// A query with zero expressions is the universal "all" query. The operand is
/// uniform across the children of one group; mixing `and`/`or` on the same
/// level requires explicit sub-grouping and is rejected by the parser.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityQuery {
    pub operand: BooleanOp,
    pub expressions: Vec<EntityQueryExpression>,
}

impl EntityQuery {
    /// The universal query matching every entity.
    pub fn all() -> Self {
        Self {
            operand: BooleanOp::And,
            expressions: Vec::new(),
        }
    }

    /// Combine expressions with `and`.
    pub fn and(expressions: impl IntoIterator<Item = EntityQueryExpression>) -> Self {
        Self {
            operand: BooleanOp::And,
            expressions: expressions.into_iter().collect(),
        }
    }

    /// Combine expressions with `or`.
    pub fn or(expressions: impl IntoIterator<Item = EntityQueryExpression>) -> Self {
        Self {
            operand: BooleanOp::Or,
            expressions: expressions.into_iter().collect(),
        }
    }

    pub fn is_all(&self) -> bool {
        self.expressions.is_empty()
    }
}

impl Default for EntityQuery {
    fn default() -> Self {
        Self::all()
    }
}

// Rendering back to EQL text, used for error context and debug output.

fn write_quoted(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    write!(f, "'{}'", text.replace('\'', "\\'"))
}

impl fmt::Display for EqlArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EqlArg::Literal(text) => f.write_str(text),
            EqlArg::Str(text) => write_quoted(f, text),
            EqlArg::Group(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            EqlArg::Function(function) => write!(f, "{}", function),
            EqlArg::Value(value) => match value {
                ScalarValue::Text(text) => write_quoted(f, text),
                ScalarValue::Date(_) | ScalarValue::DateTime(_) => write_quoted(f, &value.to_string()),
                other => write!(f, "{}", other),
            },
        }
    }
}

impl fmt::Display for EqlFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        f.write_str(")")
    }
}

impl fmt::Display for EntityQueryCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.property, self.operand)?;
        for argument in &self.arguments {
            write!(f, " {}", argument)?;
        }
        Ok(())
    }
}

impl fmt::Display for EntityQueryExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityQueryExpression::Condition(condition) => write!(f, "{}", condition),
            EntityQueryExpression::Query(query) => write!(f, "({})", query),
        }
    }
}

impl fmt::Display for EntityQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, expression) in self.expressions.iter().enumerate() {
            if i > 0 {
                write!(f, " {} ", self.operand)?;
            }
            write!(f, "{}", expression)?;
        }
        Ok(())
    }
}
