//! SQL backend compiler
//!
//! Compiles translated entity query trees into sea-query conditions and
//! select statements. Collection-valued paths (`representatives[].name`)
//! become correlated EXISTS subqueries against a registered collection
//! mapping; LIKE text is re-escaped to use `;` as the escape character.

use std::collections::HashMap;

use sea_query::{
    Asterisk, Cond, Condition, Expr, Func, Iden, LikeExpr, SelectStatement, SimpleExpr, Value,
};
use thiserror::Error;
use tracing::debug;

use saker_eql::{EntityQuery, EntityQueryCondition, EntityQueryExpression, EqlArg};
use saker_schema::{EntityQueryOps, ScalarValue};

/// Column identifier wrapper
#[derive(Debug, Clone)]
pub struct ColumnName(pub String);

impl Iden for ColumnName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        write!(s, "{}", self.0).unwrap();
    }
}

/// Table identifier wrapper
#[derive(Debug, Clone)]
pub struct TableName(pub String);

impl Iden for TableName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        write!(s, "{}", self.0).unwrap();
    }
}

/// Relational mapping of a collection-valued property.
#[derive(Debug, Clone)]
pub struct CollectionMapping {
    /// Property name as it appears in queries, without the `[]` suffix.
    pub property: String,
    /// Table holding the collection elements.
    pub table: String,
    /// Column of that table referencing the base table's id.
    pub fk_column: String,
    /// Column holding the element value, used for bare membership tests.
    pub value_column: String,
}

/// SQL compilation errors. These indicate a malformed query against known
/// metadata (a programmer error), not bad user input: translation has
/// already validated operator legality and converted every argument.
#[derive(Debug, Error)]
pub enum SqlCompileError {
    #[error("Illegal field: {path}. You can only use an indexer in the form of: collection[].name = 'John'.")]
    TerminalIndexer { path: String },

    #[error("No collection mapping registered for property '{property}'")]
    UnknownCollection { property: String },

    #[error("Operator '{operator}' is not supported for single-value property '{property}', use IS NULL instead")]
    EmptyCheckOnScalar { property: String, operator: String },

    #[error("Operator '{operator}' is not supported for collection property '{property}'")]
    UnsupportedCollectionOperator { property: String, operator: String },

    #[error("Unsupported function '{function}' in SQL query compilation")]
    UnsupportedFunction { function: String },

    #[error("Argument of '{property} {operator}' was not translated to a typed value")]
    UntranslatedArgument { property: String, operator: String },

    #[error("Missing argument for '{property} {operator}'")]
    MissingArgument { property: String, operator: String },
}

type Result<T> = std::result::Result<T, SqlCompileError>;

/// Compiles translated entity queries for one base table.
pub struct SqlQueryCompiler {
    base_table: String,
    id_column: String,
    columns: HashMap<String, String>,
    collections: HashMap<String, CollectionMapping>,
}

impl SqlQueryCompiler {
    pub fn new(base_table: impl Into<String>) -> Self {
        Self {
            base_table: base_table.into(),
            id_column: "id".to_string(),
            columns: HashMap::new(),
            collections: HashMap::new(),
        }
    }

    /// Column of the base table that collection foreign keys reference.
    pub fn with_id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    /// Override the column a property maps to. Unmapped properties use their
    /// name as the column.
    pub fn map_column(mut self, property: impl Into<String>, column: impl Into<String>) -> Self {
        self.columns.insert(property.into(), column.into());
        self
    }

    /// Register the relational mapping of a collection-valued property.
    pub fn map_collection(mut self, mapping: CollectionMapping) -> Self {
        self.collections.insert(mapping.property.clone(), mapping);
        self
    }

    /// Compile a query into a `SELECT * FROM base` statement.
    pub fn to_select(&self, query: &EntityQuery) -> Result<SelectStatement> {
        let condition = self.to_condition(query)?;
        let mut select = SelectStatement::new();
        select
            .column(Asterisk)
            .from(TableName(self.base_table.clone()))
            .cond_where(condition);
        Ok(select)
    }

    /// Compile a query into a sea-query condition tree.
    pub fn to_condition(&self, query: &EntityQuery) -> Result<Condition> {
        let condition = self.compile_group(query)?;
        debug!(table = %self.base_table, "compiled entity query to SQL condition");
        Ok(condition)
    }

    fn compile_group(&self, query: &EntityQuery) -> Result<Condition> {
        let mut condition = match query.operand {
            saker_eql::BooleanOp::And => Cond::all(),
            saker_eql::BooleanOp::Or => Cond::any(),
        };
        // The empty "all" query stays an unconstrained conjunction.
        for expression in &query.expressions {
            condition = match expression {
                EntityQueryExpression::Condition(leaf) => {
                    condition.add(self.compile_condition(leaf)?)
                }
                EntityQueryExpression::Query(sub) => condition.add(self.compile_group(sub)?),
            };
        }
        Ok(condition)
    }

    fn compile_condition(&self, condition: &EntityQueryCondition) -> Result<SimpleExpr> {
        match self.resolve_path(&condition.property)? {
            ResolvedPath::Column(column) => self.compile_scalar(condition, column),
            ResolvedPath::Collection { mapping, column } => {
                self.compile_collection(condition, mapping, column)
            }
        }
    }

    /// Split a property path into a plain column or a collection traversal.
    fn resolve_path(&self, property: &str) -> Result<ResolvedPath<'_>> {
        if let Some(index) = property.find("[]") {
            let head = &property[..index];
            let rest = &property[index + 2..];
            let column = match rest.strip_prefix('.') {
                Some(nested) if !nested.is_empty() => nested.to_string(),
                _ => {
                    return Err(SqlCompileError::TerminalIndexer {
                        path: property.to_string(),
                    })
                }
            };
            let mapping = self.collections.get(head).ok_or_else(|| {
                SqlCompileError::UnknownCollection {
                    property: head.to_string(),
                }
            })?;
            return Ok(ResolvedPath::Collection {
                mapping,
                column: Some(column),
            });
        }

        if let Some(mapping) = self.collections.get(property) {
            return Ok(ResolvedPath::Collection {
                mapping,
                column: None,
            });
        }

        let column = self
            .columns
            .get(property)
            .cloned()
            .unwrap_or_else(|| property.to_string());
        Ok(ResolvedPath::Column(column))
    }

    fn compile_scalar(
        &self,
        condition: &EntityQueryCondition,
        column: String,
    ) -> Result<SimpleExpr> {
        let col = || Expr::col(ColumnName(column.clone()));

        let expr = match condition.operand {
            EntityQueryOps::Eq => col().eq(self.scalar_value(condition)?),
            EntityQueryOps::Neq => col().ne(self.scalar_value(condition)?),
            EntityQueryOps::Gt => col().gt(self.scalar_value(condition)?),
            EntityQueryOps::Ge => col().gte(self.scalar_value(condition)?),
            EntityQueryOps::Lt => col().lt(self.scalar_value(condition)?),
            EntityQueryOps::Le => col().lte(self.scalar_value(condition)?),
            EntityQueryOps::In => col().is_in(self.group_values(condition)?),
            EntityQueryOps::NotIn => col().is_in(self.group_values(condition)?).not(),
            EntityQueryOps::Like => col().like(self.like_expr(condition, false, false)?),
            EntityQueryOps::NotLike => col().like(self.like_expr(condition, false, false)?).not(),
            EntityQueryOps::LikeIc => {
                lowered(col()).like(self.like_expr(condition, true, false)?)
            }
            EntityQueryOps::NotLikeIc => lowered(col())
                .like(self.like_expr(condition, true, false)?)
                .not(),
            EntityQueryOps::Contains => col().like(self.like_expr(condition, false, true)?),
            EntityQueryOps::NotContains => {
                col().like(self.like_expr(condition, false, true)?).not()
            }
            EntityQueryOps::IsNull => col().is_null(),
            EntityQueryOps::IsNotNull => col().is_not_null(),
            EntityQueryOps::IsEmpty | EntityQueryOps::IsNotEmpty => {
                return Err(SqlCompileError::EmptyCheckOnScalar {
                    property: condition.property.clone(),
                    operator: condition.operand.token().to_string(),
                })
            }
        };
        Ok(expr)
    }

    fn compile_collection(
        &self,
        condition: &EntityQueryCondition,
        mapping: &CollectionMapping,
        column: Option<String>,
    ) -> Result<SimpleExpr> {
        let column = column.unwrap_or_else(|| mapping.value_column.clone());

        let exists = |inner: Option<SimpleExpr>| {
            let mut select = SelectStatement::new();
            select
                .expr(Expr::value(1))
                .from(TableName(mapping.table.clone()))
                .and_where(
                    Expr::col((
                        TableName(mapping.table.clone()),
                        ColumnName(mapping.fk_column.clone()),
                    ))
                    .equals((
                        TableName(self.base_table.clone()),
                        ColumnName(self.id_column.clone()),
                    )),
                );
            if let Some(inner) = inner {
                select.and_where(inner);
            }
            Expr::exists(select)
        };

        let expr = match condition.operand {
            EntityQueryOps::Contains => {
                let value = self.scalar_value(condition)?;
                exists(Some(Expr::col(ColumnName(column)).eq(value)))
            }
            EntityQueryOps::NotContains => {
                let value = self.scalar_value(condition)?;
                exists(Some(Expr::col(ColumnName(column)).eq(value))).not()
            }
            // Nested condition through the indexer: representatives[].name = 'John'
            EntityQueryOps::Eq => {
                let value = self.scalar_value(condition)?;
                exists(Some(Expr::col(ColumnName(column)).eq(value)))
            }
            EntityQueryOps::Neq => {
                let value = self.scalar_value(condition)?;
                exists(Some(Expr::col(ColumnName(column)).ne(value)))
            }
            EntityQueryOps::Like => {
                let like = self.like_expr(condition, false, false)?;
                exists(Some(Expr::col(ColumnName(column)).like(like)))
            }
            EntityQueryOps::LikeIc => {
                let like = self.like_expr(condition, true, false)?;
                exists(Some(lowered(Expr::col(ColumnName(column))).like(like)))
            }
            EntityQueryOps::In => {
                let values = self.group_values(condition)?;
                exists(Some(Expr::col(ColumnName(column)).is_in(values)))
            }
            // A relational collection is never null, only empty.
            EntityQueryOps::IsEmpty | EntityQueryOps::IsNull => exists(None).not(),
            EntityQueryOps::IsNotEmpty | EntityQueryOps::IsNotNull => exists(None),
            _ => {
                return Err(SqlCompileError::UnsupportedCollectionOperator {
                    property: condition.property.clone(),
                    operator: condition.operand.token().to_string(),
                })
            }
        };
        Ok(expr)
    }

    /// The single typed argument of a condition.
    fn scalar_arg<'a>(&self, condition: &'a EntityQueryCondition) -> Result<&'a ScalarValue> {
        match condition.arguments.first() {
            Some(EqlArg::Value(value)) => Ok(value),
            Some(EqlArg::Function(function)) => Err(SqlCompileError::UnsupportedFunction {
                function: function.name.clone(),
            }),
            Some(_) => Err(SqlCompileError::UntranslatedArgument {
                property: condition.property.clone(),
                operator: condition.operand.token().to_string(),
            }),
            None => Err(SqlCompileError::MissingArgument {
                property: condition.property.clone(),
                operator: condition.operand.token().to_string(),
            }),
        }
    }

    fn scalar_value(&self, condition: &EntityQueryCondition) -> Result<Value> {
        Ok(to_sql_value(self.scalar_arg(condition)?))
    }

    /// The values of a membership group; a translated single value (from a
    /// function) is treated as a one-element group.
    fn group_values(&self, condition: &EntityQueryCondition) -> Result<Vec<Value>> {
        match condition.arguments.first() {
            Some(EqlArg::Group(items)) => items
                .iter()
                .map(|item| match item {
                    EqlArg::Value(value) => Ok(to_sql_value(value)),
                    EqlArg::Function(function) => Err(SqlCompileError::UnsupportedFunction {
                        function: function.name.clone(),
                    }),
                    _ => Err(SqlCompileError::UntranslatedArgument {
                        property: condition.property.clone(),
                        operator: condition.operand.token().to_string(),
                    }),
                })
                .collect(),
            Some(EqlArg::Value(value)) => Ok(vec![to_sql_value(value)]),
            Some(EqlArg::Function(function)) => Err(SqlCompileError::UnsupportedFunction {
                function: function.name.clone(),
            }),
            Some(_) => Err(SqlCompileError::UntranslatedArgument {
                property: condition.property.clone(),
                operator: condition.operand.token().to_string(),
            }),
            None => Err(SqlCompileError::MissingArgument {
                property: condition.property.clone(),
                operator: condition.operand.token().to_string(),
            }),
        }
    }

    /// LIKE pattern of a condition: re-escaped argument text, optionally
    /// lowercased, optionally wrapped in `%` for contains semantics.
    fn like_expr(
        &self,
        condition: &EntityQueryCondition,
        lowercase: bool,
        wrap: bool,
    ) -> Result<LikeExpr> {
        let raw = match self.scalar_arg(condition)? {
            ScalarValue::Text(text) => text.clone(),
            other => other.to_string(),
        };
        let mut pattern = to_escaped_string(&raw);
        if lowercase {
            pattern = pattern.to_lowercase();
        }
        if wrap {
            pattern = format!("%{}%", pattern);
        }
        Ok(LikeExpr::new(pattern).escape(';'))
    }
}

enum ResolvedPath<'a> {
    Column(String),
    Collection {
        mapping: &'a CollectionMapping,
        column: Option<String>,
    },
}

fn lowered(expr: Expr) -> Expr {
    Expr::expr(Func::lower(expr))
}

fn to_sql_value(value: &ScalarValue) -> Value {
    match value {
        ScalarValue::Text(text) => Value::String(Some(Box::new(text.clone()))),
        ScalarValue::Int(i) => Value::BigInt(Some(*i)),
        ScalarValue::Decimal(d) => (*d).into(),
        ScalarValue::Bool(b) => Value::Bool(Some(*b)),
        ScalarValue::Date(d) => (*d).into(),
        ScalarValue::DateTime(dt) => (*dt).into(),
        ScalarValue::Null => Value::String(None),
    }
}

/// Re-map EQL backslash escapes to `;`-escaped LIKE text.
///
/// The EQL grammar escapes LIKE metacharacters with a backslash; SQL LIKE
/// here runs with `ESCAPE ';'`. The remap order is load-bearing: underscore
/// is neutralized first so it never acts as a wildcard, literal semicolons
/// are protected before backslashes become the escape prefix, and escaped
/// backslashes survive through a sentinel.
pub fn to_escaped_string(raw: &str) -> String {
    const SENTINEL: &str = "\u{0}";
    raw.replace("\\_", "_")
        .replace('_', "\\_")
        .replace(';', "\\;")
        .replace("\\\\", SENTINEL)
        .replace('\\', ";")
        .replace(SENTINEL, "\\")
}

#[cfg(test)]
mod tests {
    use super::*;
    use saker_eql::{EntityQuery, EntityQueryCondition, EqlArg, EqlFunction};
    use sea_query::PostgresQueryBuilder;

    fn compiler() -> SqlQueryCompiler {
        SqlQueryCompiler::new("companies").map_collection(CollectionMapping {
            property: "representatives".to_string(),
            table: "representatives".to_string(),
            fk_column: "company_id".to_string(),
            value_column: "name".to_string(),
        })
    }

    fn sql(query: &EntityQuery) -> String {
        compiler()
            .to_select(query)
            .unwrap()
            .to_string(PostgresQueryBuilder)
    }

    fn condition(property: &str, op: EntityQueryOps, value: ScalarValue) -> EntityQuery {
        EntityQuery::and([
            EntityQueryCondition::new(property, op, vec![EqlArg::Value(value)]).into(),
        ])
    }

    #[test]
    fn test_equality_and_comparison() {
        let sql = sql(&condition(
            "number",
            EntityQueryOps::Gt,
            ScalarValue::Int(1),
        ));
        assert!(sql.contains(r#""number" > 1"#), "{sql}");
        assert!(sql.starts_with(r#"SELECT * FROM "companies""#), "{sql}");
    }

    #[test]
    fn test_in_group() {
        let query = EntityQuery::and([EntityQueryCondition::new(
            "status",
            EntityQueryOps::In,
            vec![EqlArg::Group(vec![
                EqlArg::Value(ScalarValue::Text("BROKE".into())),
                EqlArg::Value(ScalarValue::Text("IN_BUSINESS".into())),
            ])],
        )
        .into()]);
        let sql = sql(&query);
        assert!(sql.contains(r#""status" IN ('BROKE', 'IN_BUSINESS')"#), "{sql}");
    }

    #[test]
    fn test_not_in_is_negated_in() {
        let query = EntityQuery::and([EntityQueryCondition::new(
            "status",
            EntityQueryOps::NotIn,
            vec![EqlArg::Group(vec![EqlArg::Value(ScalarValue::Text(
                "BROKE".into(),
            ))])],
        )
        .into()]);
        let sql = sql(&query);
        assert!(sql.contains("NOT"), "{sql}");
        assert!(sql.contains("IN ('BROKE')"), "{sql}");
    }

    #[test]
    fn test_like_uses_custom_escape() {
        let sql = sql(&condition(
            "name",
            EntityQueryOps::Like,
            ScalarValue::Text(r"John \% Surname".into()),
        ));
        assert!(sql.contains("John ;% Surname"), "{sql}");
        assert!(sql.contains("ESCAPE"), "{sql}");
    }

    #[test]
    fn test_ilike_lowercases_both_sides() {
        let sql = sql(&condition(
            "name",
            EntityQueryOps::LikeIc,
            ScalarValue::Text("Jo%".into()),
        ));
        assert!(sql.contains("LOWER"), "{sql}");
        assert!(sql.contains("jo%"), "{sql}");
    }

    #[test]
    fn test_contains_on_text_wraps_with_wildcards() {
        let sql = sql(&condition(
            "name",
            EntityQueryOps::Contains,
            ScalarValue::Text("John".into()),
        ));
        assert!(sql.contains("%John%"), "{sql}");
    }

    #[test]
    fn test_null_checks() {
        let query = EntityQuery::and([
            EntityQueryCondition::unary("status", EntityQueryOps::IsNull).into(),
        ]);
        let sql = sql(&query);
        assert!(sql.contains(r#""status" IS NULL"#), "{sql}");
    }

    #[test]
    fn test_boolean_grouping() {
        let query = EntityQuery::and([
            condition("number", EntityQueryOps::Gt, ScalarValue::Int(1)).expressions[0].clone(),
            EntityQuery::or([
                EntityQueryCondition::new(
                    "status",
                    EntityQueryOps::Eq,
                    vec![EqlArg::Value(ScalarValue::Text("BROKE".into()))],
                )
                .into(),
                EntityQueryCondition::unary("status", EntityQueryOps::IsNull).into(),
            ])
            .into(),
        ]);
        let sql = sql(&query);
        assert!(sql.contains("AND"), "{sql}");
        assert!(sql.contains("OR"), "{sql}");
    }

    #[test]
    fn test_all_query_has_no_where() {
        let sql = sql(&EntityQuery::all());
        assert_eq!(sql, r#"SELECT * FROM "companies""#);
    }

    #[test]
    fn test_collection_membership_is_exists_subquery() {
        let sql = sql(&condition(
            "representatives",
            EntityQueryOps::Contains,
            ScalarValue::Text("John".into()),
        ));
        assert!(sql.contains("EXISTS"), "{sql}");
        assert!(sql.contains(r#""representatives""#), "{sql}");
        assert!(sql.contains(r#""company_id""#), "{sql}");
        assert!(sql.contains("'John'"), "{sql}");
    }

    #[test]
    fn test_indexer_path_filters_joined_column() {
        let sql = sql(&condition(
            "representatives[].name",
            EntityQueryOps::Eq,
            ScalarValue::Text("John".into()),
        ));
        assert!(sql.contains("EXISTS"), "{sql}");
        assert!(sql.contains(r#""name" = 'John'"#), "{sql}");
    }

    #[test]
    fn test_terminal_indexer_is_illegal() {
        let err = compiler()
            .to_condition(&condition(
                "representatives[]",
                EntityQueryOps::Eq,
                ScalarValue::Text("John".into()),
            ))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Illegal field: representatives[]. You can only use an indexer in the form of: collection[].name = 'John'."
        );
    }

    #[test]
    fn test_is_empty_only_on_collections() {
        let query = EntityQuery::and([
            EntityQueryCondition::unary("name", EntityQueryOps::IsEmpty).into(),
        ]);
        let err = compiler().to_condition(&query).unwrap_err();
        assert!(matches!(err, SqlCompileError::EmptyCheckOnScalar { .. }));
        assert!(err.to_string().contains("use IS NULL instead"));

        let query = EntityQuery::and([
            EntityQueryCondition::unary("representatives", EntityQueryOps::IsEmpty).into(),
        ]);
        let sql = compiler()
            .to_select(&query)
            .unwrap()
            .to_string(PostgresQueryBuilder);
        assert!(sql.contains("NOT EXISTS"), "{sql}");
    }

    #[test]
    fn test_retained_function_fails_loudly() {
        let query = EntityQuery::and([EntityQueryCondition::new(
            "name",
            EntityQueryOps::Eq,
            vec![EqlArg::Function(EqlFunction::new("customLookup", vec![]))],
        )
        .into()]);
        let err = compiler().to_condition(&query).unwrap_err();
        assert!(matches!(err, SqlCompileError::UnsupportedFunction { .. }));
    }

    #[test]
    fn test_escaping_fixtures() {
        assert_eq!(to_escaped_string("John"), "John");
        assert_eq!(to_escaped_string("Jo%n"), "Jo%n");
        assert_eq!(to_escaped_string(r"John \% Surname"), "John ;% Surname");
        assert_eq!(to_escaped_string("IN_BUSINESS"), "IN;_BUSINESS");
        assert_eq!(to_escaped_string(r"IN\_BUSINESS"), "IN;_BUSINESS");
        assert_eq!(to_escaped_string("a;b"), "a;;b");
        assert_eq!(to_escaped_string(r"a\\b"), r"a\b");
    }

    proptest::proptest! {
        /// Text without LIKE metacharacters passes through unchanged.
        #[test]
        fn prop_clean_text_unchanged(s in "[a-zA-Z0-9 ]{0,32}") {
            proptest::prop_assert_eq!(to_escaped_string(&s), s);
        }

        /// Without backslashes and semicolons, escaping only neutralizes
        /// underscores.
        #[test]
        fn prop_underscores_neutralized(s in "[a-zA-Z0-9_ ]{0,32}") {
            proptest::prop_assert_eq!(to_escaped_string(&s), s.replace('_', ";_"));
        }

        /// Escaped percents always become `;`-escaped percents.
        #[test]
        fn prop_escaped_percent(s in "[a-zA-Z0-9 ]{0,16}") {
            let input = format!(r"{}\%", s);
            proptest::prop_assert_eq!(to_escaped_string(&input), format!("{};%", s));
        }

        /// A double backslash collapses to one literal backslash.
        #[test]
        fn prop_double_backslash(s in "[a-zA-Z0-9 ]{0,16}") {
            let input = format!(r"{0}\\{0}", s);
            proptest::prop_assert_eq!(to_escaped_string(&input), format!(r"{0}\{0}", s));
        }
    }
}
