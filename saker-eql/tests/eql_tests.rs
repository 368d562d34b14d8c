//! EQL pipeline integration tests

use std::sync::Arc;

use saker_eql::functions::{CurrentUserFunction, CurrentUserProvider, FunctionRegistry};
use saker_eql::{
    EntityQuery, EntityQueryCondition, EntityQueryExpression, EntityQueryParser, EqlArg, EqlError,
};
use saker_schema::{
    DefaultTypeConverter, EntityQueryOps, PropertyDescriptor, PropertyKind, PropertyRegistry,
    ScalarValue,
};

fn create_registry() -> Arc<PropertyRegistry> {
    let registry = PropertyRegistry::new();
    registry
        .register(PropertyDescriptor::new("id", PropertyKind::Entity))
        .unwrap();
    registry
        .register(PropertyDescriptor::new("name", PropertyKind::Text))
        .unwrap();
    registry
        .register(PropertyDescriptor::new("number", PropertyKind::Integer))
        .unwrap();
    registry
        .register(PropertyDescriptor::new("status", PropertyKind::Text))
        .unwrap();
    registry
        .register(PropertyDescriptor::new("created", PropertyKind::DateTime))
        .unwrap();
    registry
        .register(PropertyDescriptor::new(
            "representatives",
            PropertyKind::Collection(Box::new(PropertyKind::Text)),
        ))
        .unwrap();
    registry
        .register(PropertyDescriptor::new(
            "representatives[].name",
            PropertyKind::Text,
        ))
        .unwrap();
    Arc::new(registry)
}

fn create_parser() -> EntityQueryParser {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    EntityQueryParser::new(create_registry(), Arc::new(DefaultTypeConverter))
}

#[test]
fn test_parse_simple_condition() {
    let parser = create_parser();

    let query = parser.parse("id = 'two'").unwrap();
    assert_eq!(
        query,
        EntityQuery::and([EntityQueryCondition::new(
            "id",
            EntityQueryOps::Eq,
            vec![EqlArg::Value(ScalarValue::Text("two".into()))],
        )
        .into()])
    );
}

#[test]
fn test_parse_conjunction_with_typed_values() {
    let parser = create_parser();

    let query = parser.parse("number > 1 and number < 3").unwrap();
    assert_eq!(
        query,
        EntityQuery::and([
            EntityQueryCondition::new(
                "number",
                EntityQueryOps::Gt,
                vec![EqlArg::Value(ScalarValue::Int(1))],
            )
            .into(),
            EntityQueryCondition::new(
                "number",
                EntityQueryOps::Lt,
                vec![EqlArg::Value(ScalarValue::Int(3))],
            )
            .into(),
        ])
    );
}

#[test]
fn test_parse_membership_group() {
    let parser = create_parser();

    let query = parser.parse("id in (one, two)").unwrap();
    assert_eq!(
        query,
        EntityQuery::and([EntityQueryCondition::new(
            "id",
            EntityQueryOps::In,
            vec![EqlArg::Group(vec![
                EqlArg::Value(ScalarValue::Text("one".into())),
                EqlArg::Value(ScalarValue::Text("two".into())),
            ])],
        )
        .into()])
    );
}

#[test]
fn test_parse_is_idempotent() {
    let parser = create_parser();

    let sources = [
        "id = 'two'",
        "number > 1 and number < 3",
        "status in (BROKE, IN_BUSINESS)",
        "representatives contains 'X' and representatives contains 'Y'",
        "number >= 1 and (status is null or name like 'Jo%')",
    ];

    for source in sources {
        let once = parser.parse(source).unwrap();
        let twice = parser.translator().translate(&once).unwrap();
        assert_eq!(once, twice, "translation not idempotent for {source}");
    }
}

#[test]
fn test_date_function_is_translated() {
    let parser = create_parser();

    let query = parser.parse("created > today()").unwrap();
    let EntityQueryExpression::Condition(condition) = &query.expressions[0] else {
        panic!("expected condition");
    };
    match &condition.arguments[0] {
        EqlArg::Value(ScalarValue::DateTime(start_of_day)) => {
            assert_eq!(start_of_day.time(), chrono::NaiveTime::MIN);
        }
        other => panic!("Expected translated date-time, got {:?}", other),
    }
}

struct FixedUser;

impl CurrentUserProvider for FixedUser {
    fn current_user(&self) -> Option<String> {
        Some("admin".to_string())
    }
}

#[test]
fn test_current_user_function() {
    let mut functions = FunctionRegistry::with_defaults();
    functions.register(Box::new(CurrentUserFunction::new(Arc::new(FixedUser))));
    let parser = EntityQueryParser::new(create_registry(), Arc::new(DefaultTypeConverter))
        .with_functions(functions);

    let query = parser.parse("id = currentUser()").unwrap();
    assert_eq!(
        query,
        EntityQuery::and([EntityQueryCondition::new(
            "id",
            EntityQueryOps::Eq,
            vec![EqlArg::Value(ScalarValue::Text("admin".into()))],
        )
        .into()])
    );
}

#[test]
fn test_unknown_property_fails_before_backends() {
    let parser = create_parser();

    let err = parser.parse("missing = 1").unwrap_err();
    match err {
        EqlError::UnknownProperty { property } => assert_eq!(property, "missing"),
        other => panic!("Expected unknown property, got {:?}", other),
    }
}

#[test]
fn test_operator_legality_for_string_property() {
    let parser = create_parser();

    // Every operator of the string set parses and validates.
    for eql in [
        "name = 'a'",
        "name != 'a'",
        "name in ('a', 'b')",
        "name not in ('a', 'b')",
        "name like 'a%'",
        "name not like 'a%'",
        "name ilike 'a%'",
        "name not ilike 'a%'",
        "name contains 'a'",
        "name not contains 'a'",
        "name is null",
        "name is not null",
        "name is empty",
        "name is not empty",
    ] {
        assert!(parser.parse(eql).is_ok(), "expected {eql} to be legal");
    }

    // Ordering operators are not in the set.
    let err = parser.parse("name > 'a'").unwrap_err();
    match err {
        EqlError::IllegalOperator {
            property,
            operator,
            supported,
        } => {
            assert_eq!(property, "name");
            assert_eq!(operator, ">");
            assert_eq!(
                supported,
                "=, !=, in, not in, like, not like, ilike, not ilike, is null, is not null, \
                 is empty, is not empty, contains, not contains"
            );
        }
        other => panic!("Expected illegal operator, got {:?}", other),
    }
}

#[test]
fn test_grammar_rejection_messages() {
    let parser = create_parser();

    let cases = [
        ("a =", "Missing value after: a = ", 5),
        ("value 123", "Illegal operator: 123", 6),
        ("a", "Missing operator for: a", 3),
    ];
    for (source, message, position) in cases {
        match parser.parse(source).unwrap_err() {
            EqlError::Parse(parse) => {
                assert_eq!(parse.message, message, "message for {source:?}");
                assert_eq!(parse.error_position, position, "position for {source:?}");
            }
            other => panic!("Expected parse error for {source:?}, got {other:?}"),
        }
    }
}

#[test]
fn test_mixed_conjunctions_need_grouping() {
    let parser = create_parser();

    let err = parser
        .parse("number = 123 and name contains 'abc' or created != 2")
        .unwrap_err();
    match err {
        EqlError::Parse(parse) => assert_eq!(
            parse.message,
            "Illegal keyword or - cannot combine and/or on the same level without explicit grouping"
        ),
        other => panic!("Expected parse error, got {:?}", other),
    }

    // The explicitly grouped form is accepted.
    assert!(parser
        .parse("(number = 123 and name contains 'abc') or created is null")
        .is_ok());
}

#[test]
fn test_empty_query_matches_all() {
    let parser = create_parser();
    assert!(parser.parse("").unwrap().is_all());
}

#[test]
fn test_query_round_trips_through_display() {
    let parser = create_parser();

    let query = parser
        .parse("number > 1 and (id = 'two' or status is null)")
        .unwrap();
    let reparsed = parser.parse(&query.to_string()).unwrap();
    assert_eq!(query, reparsed);
}

#[test]
fn test_serde_round_trip() {
    let parser = create_parser();

    let query = parser.parse("status in (BROKE, IN_BUSINESS)").unwrap();
    let json = serde_json::to_string(&query).unwrap();
    let back: EntityQuery = serde_json::from_str(&json).unwrap();
    assert_eq!(query, back);
}
