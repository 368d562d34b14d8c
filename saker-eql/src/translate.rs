//! Schema-aware query translation
//!
//! Rewrites a raw query tree into its executable form: property names are
//! resolved against the registry (honoring logical-to-physical indirection),
//! raw arguments are converted to the property's declared kind, and function
//! calls are applied through the registered handlers. Translation never
//! mutates its input and is idempotent: translating an already-translated
//! query returns a structurally equal tree.

use std::sync::Arc;

use saker_schema::{EntityQueryOps, PropertyDescriptor, PropertyRegistry, TypeConverter};
use tracing::trace;

use crate::ast::{EntityQuery, EntityQueryCondition, EntityQueryExpression, EqlArg};
use crate::error::{EqlError, Result};
use crate::functions::FunctionRegistry;

/// Translates raw query trees against a property registry.
pub struct EqlTranslator {
    registry: Arc<PropertyRegistry>,
    converter: Arc<dyn TypeConverter>,
    functions: FunctionRegistry,
}

impl EqlTranslator {
    /// Create a translator. Both collaborators are required up front; a
    /// translator cannot exist half-configured.
    pub fn new(registry: Arc<PropertyRegistry>, converter: Arc<dyn TypeConverter>) -> Self {
        Self {
            registry,
            converter,
            functions: FunctionRegistry::with_defaults(),
        }
    }

    /// Replace the function handler registry.
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn registry(&self) -> &PropertyRegistry {
        &self.registry
    }

    /// Translate a query tree. Group structure and operands are preserved;
    /// only conditions are rewritten.
    pub fn translate(&self, query: &EntityQuery) -> Result<EntityQuery> {
        let expressions = query
            .expressions
            .iter()
            .map(|expression| self.translate_expression(expression))
            .collect::<Result<Vec<_>>>()?;
        Ok(EntityQuery {
            operand: query.operand,
            expressions,
        })
    }

    fn translate_expression(
        &self,
        expression: &EntityQueryExpression,
    ) -> Result<EntityQueryExpression> {
        match expression {
            EntityQueryExpression::Condition(condition) => Ok(EntityQueryExpression::Condition(
                self.translate_condition(condition)?,
            )),
            EntityQueryExpression::Query(query) => {
                Ok(EntityQueryExpression::Query(self.translate(query)?))
            }
        }
    }

    fn translate_condition(&self, condition: &EntityQueryCondition) -> Result<EntityQueryCondition> {
        let descriptor = self
            .registry
            .resolve(&condition.property)
            .ok_or_else(|| EqlError::unknown_property(&condition.property))?;

        validate_condition(condition, &descriptor)?;

        let arguments = condition
            .arguments
            .iter()
            .map(|argument| self.translate_argument(argument, &descriptor))
            .collect::<Result<Vec<_>>>()?;

        let property = descriptor.resolved_name().to_string();
        trace!(property = %property, operator = %condition.operand, "translated condition");

        Ok(EntityQueryCondition {
            property,
            operand: condition.operand,
            arguments,
        })
    }

    fn translate_argument(
        &self,
        argument: &EqlArg,
        descriptor: &PropertyDescriptor,
    ) -> Result<EqlArg> {
        let target = descriptor.kind.element_kind();
        match argument {
            EqlArg::Literal(raw) | EqlArg::Str(raw) => Ok(EqlArg::Value(
                self.converter.convert(raw, target)?,
            )),
            EqlArg::Group(items) => {
                let translated = items
                    .iter()
                    .map(|item| self.translate_argument(item, descriptor))
                    .collect::<Result<Vec<_>>>()?;
                Ok(EqlArg::Group(translated))
            }
            EqlArg::Function(function) => {
                match self.functions.find(&function.name, &descriptor.kind) {
                    Some(handler) => Ok(EqlArg::Value(handler.apply(
                        &function.name,
                        &function.args,
                        &descriptor.kind,
                        self.converter.as_ref(),
                    )?)),
                    // No translate-time handler: the function is retained for
                    // a backend-specific handler to compile.
                    None => Ok(EqlArg::Function(function.clone())),
                }
            }
            EqlArg::Value(value) => Ok(EqlArg::Value(value.clone())),
        }
    }
}

/// Validate operator legality and argument shapes for one condition.
///
/// Runs for parsed and programmatically-built trees alike: the parser already
/// rejects a value group after a scalar operator, but nothing stops calling
/// code from constructing that condition by hand.
pub fn validate_condition(
    condition: &EntityQueryCondition,
    descriptor: &PropertyDescriptor,
) -> Result<()> {
    if !descriptor.kind.supports(condition.operand) {
        let supported = descriptor
            .kind
            .supported_operators()
            .iter()
            .map(|op| op.token())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(EqlError::illegal_operator(
            &condition.property,
            condition.operand.token(),
            supported,
        ));
    }

    if condition.operand.is_unary() {
        if !condition.arguments.is_empty() {
            return Err(EqlError::illegal_value(
                &condition.property,
                condition.operand.token(),
                "operator takes no arguments",
            ));
        }
        return Ok(());
    }

    let membership = matches!(
        condition.operand,
        EntityQueryOps::In | EntityQueryOps::NotIn
    );
    for argument in &condition.arguments {
        match argument {
            EqlArg::Group(items) => {
                if !condition.operand.accepts_group() {
                    return Err(EqlError::illegal_value(
                        &condition.property,
                        condition.operand.token(),
                        "a value group is only valid for in/not in/contains/not contains",
                    ));
                }
                if items.iter().any(|item| matches!(item, EqlArg::Group(_))) {
                    return Err(EqlError::illegal_value(
                        &condition.property,
                        condition.operand.token(),
                        "value groups may not nest",
                    ));
                }
            }
            EqlArg::Function(_) => {}
            EqlArg::Literal(_) | EqlArg::Str(_) if membership => {
                return Err(EqlError::illegal_value(
                    &condition.property,
                    condition.operand.token(),
                    "a single value is not valid, use a value group or function",
                ));
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::EqlFunction;
    use saker_schema::{DefaultTypeConverter, PropertyKind, ScalarValue};

    fn registry() -> Arc<PropertyRegistry> {
        let registry = PropertyRegistry::new();
        registry
            .register(PropertyDescriptor::new("name", PropertyKind::Text))
            .unwrap();
        registry
            .register(PropertyDescriptor::new("number", PropertyKind::Integer))
            .unwrap();
        registry
            .register(
                PropertyDescriptor::new("id", PropertyKind::Entity).with_target_path("identifier"),
            )
            .unwrap();
        registry
            .register(PropertyDescriptor::new(
                "representatives",
                PropertyKind::Collection(Box::new(PropertyKind::Text)),
            ))
            .unwrap();
        Arc::new(registry)
    }

    fn translator() -> EqlTranslator {
        EqlTranslator::new(registry(), Arc::new(DefaultTypeConverter))
    }

    #[test]
    fn test_converts_arguments_to_declared_kind() {
        let raw = EntityQuery::and([EntityQueryCondition::new(
            "number",
            EntityQueryOps::Gt,
            vec![EqlArg::Literal("1".into())],
        )
        .into()]);

        let translated = translator().translate(&raw).unwrap();
        assert_eq!(
            translated,
            EntityQuery::and([EntityQueryCondition::new(
                "number",
                EntityQueryOps::Gt,
                vec![EqlArg::Value(ScalarValue::Int(1))],
            )
            .into()])
        );
    }

    #[test]
    fn test_rewrites_property_to_target_path() {
        let raw = EntityQuery::and([EntityQueryCondition::new(
            "id",
            EntityQueryOps::Eq,
            vec![EqlArg::Str("two".into())],
        )
        .into()]);

        let translated = translator().translate(&raw).unwrap();
        let EntityQueryExpression::Condition(condition) = &translated.expressions[0] else {
            panic!("expected condition");
        };
        assert_eq!(condition.property, "identifier");
    }

    #[test]
    fn test_translation_is_idempotent() {
        let raw = EntityQuery::and([
            EntityQueryCondition::new(
                "id",
                EntityQueryOps::In,
                vec![EqlArg::Group(vec![
                    EqlArg::Literal("one".into()),
                    EqlArg::Literal("two".into()),
                ])],
            )
            .into(),
            EntityQuery::or([
                EntityQueryCondition::new(
                    "number",
                    EntityQueryOps::Lt,
                    vec![EqlArg::Literal("3".into())],
                )
                .into(),
                EntityQueryCondition::unary("name", EntityQueryOps::IsNull).into(),
            ])
            .into(),
        ]);

        let translator = translator();
        let once = translator.translate(&raw).unwrap();
        let twice = translator.translate(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unknown_property() {
        let raw = EntityQuery::and([EntityQueryCondition::new(
            "missing",
            EntityQueryOps::Eq,
            vec![EqlArg::Literal("1".into())],
        )
        .into()]);

        let err = translator().translate(&raw).unwrap_err();
        match err {
            EqlError::UnknownProperty { property } => assert_eq!(property, "missing"),
            other => panic!("Expected unknown property, got {:?}", other),
        }
    }

    #[test]
    fn test_illegal_operator_names_supported_set() {
        let raw = EntityQuery::and([EntityQueryCondition::new(
            "number",
            EntityQueryOps::Like,
            vec![EqlArg::Str("1%".into())],
        )
        .into()]);

        let err = translator().translate(&raw).unwrap_err();
        match err {
            EqlError::IllegalOperator {
                property,
                operator,
                supported,
            } => {
                assert_eq!(property, "number");
                assert_eq!(operator, "like");
                assert_eq!(
                    supported,
                    "=, !=, in, not in, >, >=, <, <=, is null, is not null, is empty, is not empty"
                );
            }
            other => panic!("Expected illegal operator, got {:?}", other),
        }
    }

    #[test]
    fn test_bare_value_invalid_for_in() {
        let raw = EntityQuery::and([EntityQueryCondition::new(
            "number",
            EntityQueryOps::In,
            vec![EqlArg::Literal("1".into())],
        )
        .into()]);

        let err = translator().translate(&raw).unwrap_err();
        assert!(matches!(err, EqlError::IllegalValue { .. }));
    }

    #[test]
    fn test_group_invalid_for_scalar_operator() {
        let raw = EntityQuery::and([EntityQueryCondition::new(
            "number",
            EntityQueryOps::Eq,
            vec![EqlArg::Group(vec![EqlArg::Literal("1".into())])],
        )
        .into()]);

        let err = translator().translate(&raw).unwrap_err();
        assert!(matches!(err, EqlError::IllegalValue { .. }));
    }

    #[test]
    fn test_conversion_failure_propagates() {
        let raw = EntityQuery::and([EntityQueryCondition::new(
            "number",
            EntityQueryOps::Eq,
            vec![EqlArg::Literal("one".into())],
        )
        .into()]);

        let err = translator().translate(&raw).unwrap_err();
        assert!(matches!(err, EqlError::Conversion(_)));
    }

    #[test]
    fn test_unhandled_function_is_retained() {
        let raw = EntityQuery::and([EntityQueryCondition::new(
            "name",
            EntityQueryOps::Eq,
            vec![EqlArg::Function(EqlFunction::new("customLookup", vec![]))],
        )
        .into()]);

        let translated = translator().translate(&raw).unwrap();
        let EntityQueryExpression::Condition(condition) = &translated.expressions[0] else {
            panic!("expected condition");
        };
        assert_eq!(
            condition.arguments,
            vec![EqlArg::Function(EqlFunction::new("customLookup", vec![]))]
        );
    }

    #[test]
    fn test_collection_arguments_convert_to_element_kind() {
        let raw = EntityQuery::and([EntityQueryCondition::new(
            "representatives",
            EntityQueryOps::Contains,
            vec![EqlArg::Str("John".into())],
        )
        .into()]);

        let translated = translator().translate(&raw).unwrap();
        let EntityQueryExpression::Condition(condition) = &translated.expressions[0] else {
            panic!("expected condition");
        };
        assert_eq!(
            condition.arguments,
            vec![EqlArg::Value(ScalarValue::Text("John".into()))]
        );
    }
}
