//! Entity query parser - main interface
//!
//! Runs the full pipeline: tokenize, convert to the raw tree, translate
//! against the property registry.

use std::sync::Arc;

use saker_schema::{PropertyRegistry, TypeConverter};
use tracing::debug;

use crate::ast::EntityQuery;
use crate::converter;
use crate::error::Result;
use crate::functions::FunctionRegistry;
use crate::tokenizer;
use crate::translate::EqlTranslator;

/// Parses EQL strings into executable query trees.
pub struct EntityQueryParser {
    translator: EqlTranslator,
}

impl EntityQueryParser {
    /// Create a parser over the given registry and converter.
    pub fn new(registry: Arc<PropertyRegistry>, converter: Arc<dyn TypeConverter>) -> Self {
        Self {
            translator: EqlTranslator::new(registry, converter),
        }
    }

    /// Replace the function handler registry of the translator.
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.translator = self.translator.with_functions(functions);
        self
    }

    /// Parse and translate a query string.
    pub fn parse(&self, eql: &str) -> Result<EntityQuery> {
        let raw = self.parse_raw(eql)?;
        let translated = self.translator.translate(&raw)?;
        debug!(query = %translated, "parsed entity query");
        Ok(translated)
    }

    /// Parse a query string without translating it.
    pub fn parse_raw(&self, eql: &str) -> Result<EntityQuery> {
        let tokens = tokenizer::tokenize(eql)?;
        converter::convert(eql, &tokens)
    }

    pub fn translator(&self) -> &EqlTranslator {
        &self.translator
    }
}
