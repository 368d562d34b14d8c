//! Elasticsearch backend compiler
//!
//! Compiles translated entity query trees into a criteria tree that renders
//! to Elasticsearch query DSL JSON. Backend-specific functions (`between`)
//! are resolved through an ordered handler list registered on the compiler.

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use thiserror::Error;
use tracing::debug;

use saker_eql::like::{LikePattern, LikeSegment};
use saker_eql::{BooleanOp, EntityQuery, EntityQueryCondition, EntityQueryExpression, EqlArg, EqlFunction};
use saker_schema::{EntityQueryOps, PropertyRegistry, ScalarValue};

/// Leaf clause of a criteria tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClauseKind {
    Term(ScalarValue),
    Terms(Vec<ScalarValue>),
    Range {
        gt: Option<ScalarValue>,
        gte: Option<ScalarValue>,
        lt: Option<ScalarValue>,
        lte: Option<ScalarValue>,
    },
    Wildcard {
        pattern: String,
        case_insensitive: bool,
    },
    Exists,
}

/// Criteria tree composed with boolean combinators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Criteria {
    Clause { field: String, kind: ClauseKind },
    And(Vec<Criteria>),
    Or(Vec<Criteria>),
    Not(Box<Criteria>),
}

impl Criteria {
    pub fn clause(field: impl Into<String>, kind: ClauseKind) -> Self {
        Criteria::Clause {
            field: field.into(),
            kind,
        }
    }

    /// Conjoin with another criteria, flattening nested conjunctions.
    pub fn and(self, other: Criteria) -> Criteria {
        match self {
            Criteria::And(mut children) => {
                children.push(other);
                Criteria::And(children)
            }
            first => Criteria::And(vec![first, other]),
        }
    }

    /// Disjoin with another criteria, flattening nested disjunctions.
    pub fn or(self, other: Criteria) -> Criteria {
        match self {
            Criteria::Or(mut children) => {
                children.push(other);
                Criteria::Or(children)
            }
            first => Criteria::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Criteria {
        Criteria::Not(Box::new(self))
    }

    /// Render to Elasticsearch query DSL JSON.
    pub fn to_query_dsl(&self) -> Json {
        match self {
            Criteria::Clause { field, kind } => match kind {
                ClauseKind::Term(value) => json!({ "term": { field: { "value": scalar_json(value) } } }),
                ClauseKind::Terms(values) => {
                    let values: Vec<Json> = values.iter().map(scalar_json).collect();
                    json!({ "terms": { field: values } })
                }
                ClauseKind::Range { gt, gte, lt, lte } => {
                    let mut bounds = serde_json::Map::new();
                    if let Some(value) = gt {
                        bounds.insert("gt".to_string(), scalar_json(value));
                    }
                    if let Some(value) = gte {
                        bounds.insert("gte".to_string(), scalar_json(value));
                    }
                    if let Some(value) = lt {
                        bounds.insert("lt".to_string(), scalar_json(value));
                    }
                    if let Some(value) = lte {
                        bounds.insert("lte".to_string(), scalar_json(value));
                    }
                    json!({ "range": { field: Json::Object(bounds) } })
                }
                ClauseKind::Wildcard {
                    pattern,
                    case_insensitive,
                } => json!({
                    "wildcard": {
                        field: { "value": pattern, "case_insensitive": case_insensitive }
                    }
                }),
                ClauseKind::Exists => json!({ "exists": { "field": field } }),
            },
            Criteria::And(children) if children.is_empty() => json!({ "match_all": {} }),
            Criteria::And(children) => {
                let must: Vec<Json> = children.iter().map(Criteria::to_query_dsl).collect();
                json!({ "bool": { "must": must } })
            }
            Criteria::Or(children) => {
                let should: Vec<Json> = children.iter().map(Criteria::to_query_dsl).collect();
                json!({ "bool": { "should": should, "minimum_should_match": 1 } })
            }
            Criteria::Not(inner) => json!({ "bool": { "must_not": [inner.to_query_dsl()] } }),
        }
    }
}

fn scalar_json(value: &ScalarValue) -> Json {
    match value {
        ScalarValue::Text(text) => json!(text),
        ScalarValue::Int(i) => json!(i),
        ScalarValue::Decimal(d) => d
            .to_f64()
            .map(|f| json!(f))
            .unwrap_or_else(|| json!(d.to_string())),
        ScalarValue::Bool(b) => json!(b),
        ScalarValue::Date(_) | ScalarValue::DateTime(_) => json!(value.to_string()),
        ScalarValue::Null => Json::Null,
    }
}

/// Elasticsearch compilation errors. Like the SQL backend these are
/// programmer errors: translation has already validated the query.
#[derive(Debug, Error)]
pub enum ElasticCompileError {
    #[error("Unknown property: {property}")]
    UnknownProperty { property: String },

    #[error("Unsupported function '{function}' in Elasticsearch query compilation")]
    UnsupportedFunction { function: String },

    #[error("Function '{function}' expects {expected} arguments, got {actual}")]
    FunctionArity {
        function: String,
        expected: usize,
        actual: usize,
    },

    #[error("Function '{function}' does not support operator '{operator}'")]
    FunctionOperator { function: String, operator: String },

    #[error("Argument of '{property} {operator}' was not translated to a typed value")]
    UntranslatedArgument { property: String, operator: String },

    #[error("Missing argument for '{property} {operator}'")]
    MissingArgument { property: String, operator: String },
}

type Result<T> = std::result::Result<T, ElasticCompileError>;

/// Backend-specific function compiler.
///
/// Handlers are consulted in registration order and only need to accept the
/// function names and arities they understand; anything unaccepted fails the
/// compilation loudly.
pub trait ElasticFunctionHandler: Send + Sync {
    fn accepts(&self, function: &str, arg_count: usize) -> bool;

    fn compile(
        &self,
        field: &str,
        operator: EntityQueryOps,
        function: &EqlFunction,
    ) -> Result<Criteria>;
}

/// `between(a, b)` compiles to a closed range, negated for `!=`.
pub struct BetweenFunction;

impl ElasticFunctionHandler for BetweenFunction {
    fn accepts(&self, function: &str, arg_count: usize) -> bool {
        function.eq_ignore_ascii_case("between") && arg_count == 2
    }

    fn compile(
        &self,
        field: &str,
        operator: EntityQueryOps,
        function: &EqlFunction,
    ) -> Result<Criteria> {
        if function.args.len() != 2 {
            return Err(ElasticCompileError::FunctionArity {
                function: function.name.clone(),
                expected: 2,
                actual: function.args.len(),
            });
        }
        let lower = function_bound(function, 0)?;
        let upper = function_bound(function, 1)?;
        let range = Criteria::clause(
            field,
            ClauseKind::Range {
                gt: None,
                gte: Some(lower),
                lt: None,
                lte: Some(upper),
            },
        );
        match operator.base_operator() {
            EntityQueryOps::Eq => {
                if operator.is_negation() {
                    Ok(range.negate())
                } else {
                    Ok(range)
                }
            }
            _ => Err(ElasticCompileError::FunctionOperator {
                function: function.name.clone(),
                operator: operator.token().to_string(),
            }),
        }
    }
}

/// Bound argument of a range function: a typed value, or a raw literal.
/// Raw numbers become numbers; anything else stays text, which Elasticsearch
/// parses itself in range clauses (dates).
fn function_bound(function: &EqlFunction, index: usize) -> Result<ScalarValue> {
    match function.args.get(index) {
        Some(EqlArg::Value(value)) => Ok(value.clone()),
        Some(EqlArg::Literal(raw)) | Some(EqlArg::Str(raw)) => {
            if let Ok(int) = raw.parse::<i64>() {
                return Ok(ScalarValue::Int(int));
            }
            if let Ok(decimal) = raw.parse::<rust_decimal::Decimal>() {
                return Ok(ScalarValue::Decimal(decimal));
            }
            Ok(ScalarValue::Text(raw.clone()))
        }
        _ => Err(ElasticCompileError::UnsupportedFunction {
            function: function.name.clone(),
        }),
    }
}

/// Compiles translated entity queries into criteria trees.
pub struct ElasticQueryCompiler {
    registry: Arc<PropertyRegistry>,
    functions: Vec<Box<dyn ElasticFunctionHandler>>,
}

impl ElasticQueryCompiler {
    /// Create a compiler with the built-in `between` function.
    pub fn new(registry: Arc<PropertyRegistry>) -> Self {
        Self {
            registry,
            functions: vec![Box::new(BetweenFunction)],
        }
    }

    /// Append a function handler. Earlier registrations win.
    pub fn register_function(&mut self, handler: Box<dyn ElasticFunctionHandler>) {
        self.functions.push(handler);
    }

    /// Compile a query tree into a criteria tree.
    pub fn compile(&self, query: &EntityQuery) -> Result<Criteria> {
        let criteria = self.compile_group(query)?;
        debug!("compiled entity query to Elasticsearch criteria");
        Ok(criteria)
    }

    /// Compile straight to query DSL JSON.
    pub fn to_query_dsl(&self, query: &EntityQuery) -> Result<Json> {
        Ok(self.compile(query)?.to_query_dsl())
    }

    fn compile_group(&self, query: &EntityQuery) -> Result<Criteria> {
        let children = query
            .expressions
            .iter()
            .map(|expression| match expression {
                EntityQueryExpression::Condition(condition) => self.compile_condition(condition),
                EntityQueryExpression::Query(sub) => self.compile_group(sub),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(match query.operand {
            BooleanOp::And => Criteria::And(children),
            BooleanOp::Or => Criteria::Or(children),
        })
    }

    fn compile_condition(&self, condition: &EntityQueryCondition) -> Result<Criteria> {
        // Indexer paths flatten: representatives[].name -> representatives.name
        let field = condition.property.replace("[]", "");

        if let Some(EqlArg::Function(function)) = condition.arguments.first() {
            let handler = self
                .functions
                .iter()
                .find(|handler| handler.accepts(&function.name, function.args.len()))
                .ok_or_else(|| ElasticCompileError::UnsupportedFunction {
                    function: function.name.clone(),
                })?;
            return handler.compile(&field, condition.operand, function);
        }

        let criteria = match condition.operand {
            EntityQueryOps::Eq => {
                Criteria::clause(field, ClauseKind::Term(self.scalar_value(condition)?))
            }
            EntityQueryOps::Neq => {
                Criteria::clause(field, ClauseKind::Term(self.scalar_value(condition)?)).negate()
            }
            EntityQueryOps::Gt => Criteria::clause(
                field,
                ClauseKind::Range {
                    gt: Some(self.scalar_value(condition)?),
                    gte: None,
                    lt: None,
                    lte: None,
                },
            ),
            EntityQueryOps::Ge => Criteria::clause(
                field,
                ClauseKind::Range {
                    gt: None,
                    gte: Some(self.scalar_value(condition)?),
                    lt: None,
                    lte: None,
                },
            ),
            EntityQueryOps::Lt => Criteria::clause(
                field,
                ClauseKind::Range {
                    gt: None,
                    gte: None,
                    lt: Some(self.scalar_value(condition)?),
                    lte: None,
                },
            ),
            EntityQueryOps::Le => Criteria::clause(
                field,
                ClauseKind::Range {
                    gt: None,
                    gte: None,
                    lt: None,
                    lte: Some(self.scalar_value(condition)?),
                },
            ),
            EntityQueryOps::In => {
                Criteria::clause(field, ClauseKind::Terms(self.group_values(condition)?))
            }
            EntityQueryOps::NotIn => {
                Criteria::clause(field, ClauseKind::Terms(self.group_values(condition)?)).negate()
            }
            EntityQueryOps::Like => self.wildcard(condition, field, false)?,
            EntityQueryOps::NotLike => self.wildcard(condition, field, false)?.negate(),
            EntityQueryOps::LikeIc => self.wildcard(condition, field, true)?,
            EntityQueryOps::NotLikeIc => self.wildcard(condition, field, true)?.negate(),
            EntityQueryOps::Contains => self.contains(condition, field)?,
            EntityQueryOps::NotContains => self.contains(condition, field)?.negate(),
            // Empty arrays are not indexed, so null and empty collapse here.
            EntityQueryOps::IsNull | EntityQueryOps::IsEmpty => {
                Criteria::clause(field, ClauseKind::Exists).negate()
            }
            EntityQueryOps::IsNotNull | EntityQueryOps::IsNotEmpty => {
                Criteria::clause(field, ClauseKind::Exists)
            }
        };
        Ok(criteria)
    }

    /// `contains` is membership on collection properties and a substring
    /// wildcard on text.
    fn contains(&self, condition: &EntityQueryCondition, field: String) -> Result<Criteria> {
        let descriptor = self.registry.resolve(&condition.property).ok_or_else(|| {
            ElasticCompileError::UnknownProperty {
                property: condition.property.clone(),
            }
        })?;
        let value = self.scalar_value(condition)?;
        if descriptor.kind.is_collection() {
            return Ok(Criteria::clause(field, ClauseKind::Term(value)));
        }
        let text = match &value {
            ScalarValue::Text(text) => text.clone(),
            other => other.to_string(),
        };
        Ok(Criteria::clause(
            field,
            ClauseKind::Wildcard {
                pattern: render_wildcard(&LikePattern::containing(&text)),
                case_insensitive: descriptor.case_insensitive,
            },
        ))
    }

    fn wildcard(
        &self,
        condition: &EntityQueryCondition,
        field: String,
        case_insensitive: bool,
    ) -> Result<Criteria> {
        let raw = match self.scalar_value(condition)? {
            ScalarValue::Text(text) => text,
            other => other.to_string(),
        };
        Ok(Criteria::clause(
            field,
            ClauseKind::Wildcard {
                pattern: render_wildcard(&LikePattern::parse(&raw)),
                case_insensitive,
            },
        ))
    }

    fn scalar_value(&self, condition: &EntityQueryCondition) -> Result<ScalarValue> {
        match condition.arguments.first() {
            Some(EqlArg::Value(value)) => Ok(value.clone()),
            Some(EqlArg::Function(function)) => Err(ElasticCompileError::UnsupportedFunction {
                function: function.name.clone(),
            }),
            Some(_) => Err(ElasticCompileError::UntranslatedArgument {
                property: condition.property.clone(),
                operator: condition.operand.token().to_string(),
            }),
            None => Err(ElasticCompileError::MissingArgument {
                property: condition.property.clone(),
                operator: condition.operand.token().to_string(),
            }),
        }
    }

    fn group_values(&self, condition: &EntityQueryCondition) -> Result<Vec<ScalarValue>> {
        match condition.arguments.first() {
            Some(EqlArg::Group(items)) => items
                .iter()
                .map(|item| match item {
                    EqlArg::Value(value) => Ok(value.clone()),
                    EqlArg::Function(function) => Err(ElasticCompileError::UnsupportedFunction {
                        function: function.name.clone(),
                    }),
                    _ => Err(ElasticCompileError::UntranslatedArgument {
                        property: condition.property.clone(),
                        operator: condition.operand.token().to_string(),
                    }),
                })
                .collect(),
            Some(EqlArg::Value(value)) => Ok(vec![value.clone()]),
            _ => self.scalar_value(condition).map(|value| vec![value]),
        }
    }
}

/// Render a parsed LIKE pattern as an Elasticsearch wildcard string:
/// `%` runs become `*`, literal text has the ES metacharacters escaped.
fn render_wildcard(pattern: &LikePattern) -> String {
    let mut out = String::new();
    for segment in pattern.segments() {
        match segment {
            LikeSegment::AnyRun => out.push('*'),
            LikeSegment::Literal(text) => {
                for c in text.chars() {
                    if matches!(c, '*' | '?' | '\\') {
                        out.push('\\');
                    }
                    out.push(c);
                }
            }
        }
    }
    out
}
