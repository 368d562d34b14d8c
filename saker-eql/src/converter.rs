//! Token-to-AST converter
//!
//! Recursive descent over the token list. Every error carries the offending
//! text, its absolute character offset, and the clause under construction so
//! a caller can highlight the malformed part of the query.

use crate::ast::{
    BooleanOp, EntityQuery, EntityQueryCondition, EntityQueryExpression, EqlArg, EqlFunction,
};
use crate::error::{EqlError, ParseError, Result};
use crate::tokenizer::Token;
use saker_schema::EntityQueryOps;

/// Convert a token list into a raw (untranslated) query tree.
///
/// The original source string is needed alongside the tokens to slice the
/// context expression attached to parse errors.
pub fn convert(source: &str, tokens: &[Token]) -> Result<EntityQuery> {
    let mut converter = Converter {
        source,
        tokens,
        pos: 0,
        context_start: 0,
    };
    let query = converter.convert_group(true)?;
    Ok(query)
}

struct Converter<'a> {
    source: &'a str,
    tokens: &'a [Token],
    pos: usize,
    /// Offset of the first token of the clause currently being parsed.
    context_start: usize,
}

impl<'a> Converter<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Position reported for something missing at the end of the input.
    fn missing_position(&self) -> usize {
        match self.pos.checked_sub(1).and_then(|i| self.tokens.get(i)) {
            Some(last) => last.end() + 2,
            None => self.source.len(),
        }
    }

    /// Literal text of the clause being parsed, up to the last consumed token.
    fn context_expression(&self) -> String {
        let end = self
            .pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|t| t.end())
            .unwrap_or(self.source.len())
            .max(self.context_start);
        self.source[self.context_start..end].to_string()
    }

    fn error(&self, message: String, position: usize) -> EqlError {
        EqlError::Parse(ParseError {
            message,
            error_position: position,
            context_start: self.context_start,
            context_expression: self.context_expression(),
        })
    }

    fn illegal_token(&self, token: &Token) -> EqlError {
        self.error(format!("Illegal token: {}", token.text), token.position)
    }

    /// Parse one group of expressions. The root group ends at end of input;
    /// nested groups consume their closing parenthesis.
    fn convert_group(&mut self, root: bool) -> Result<EntityQuery> {
        let mut expressions: Vec<EntityQueryExpression> = Vec::new();
        let mut operand: Option<BooleanOp> = None;

        loop {
            let token = match self.peek() {
                Some(token) => token,
                None if root && expressions.is_empty() => break,
                None => {
                    return Err(self.error(
                        "Missing closing parenthesis".to_string(),
                        self.missing_position(),
                    ))
                }
            };

            self.context_start = token.position;
            let expression = if token.text == "(" {
                self.next();
                EntityQueryExpression::Query(self.convert_group(false)?)
            } else {
                EntityQueryExpression::Condition(self.convert_condition()?)
            };
            expressions.push(expression);

            match self.peek() {
                None if root => break,
                None => {
                    return Err(self.error(
                        "Missing closing parenthesis".to_string(),
                        self.missing_position(),
                    ))
                }
                Some(token) if token.text == ")" => {
                    if root {
                        return Err(self.illegal_token(token));
                    }
                    self.next();
                    break;
                }
                Some(token) => {
                    let keyword = token.text.to_lowercase();
                    let next_operand = match keyword.as_str() {
                        "and" => BooleanOp::And,
                        "or" => BooleanOp::Or,
                        _ => {
                            return Err(self.error(
                                format!("Illegal keyword: {}", token.text),
                                token.position,
                            ))
                        }
                    };
                    if let Some(current) = operand {
                        if current != next_operand {
                            return Err(self.error(
                                format!(
                                    "Illegal keyword {} - cannot combine and/or on the same level without explicit grouping",
                                    keyword
                                ),
                                token.position,
                            ));
                        }
                    }
                    operand = Some(next_operand);
                    self.next();
                    if self.peek().is_none() {
                        return Err(self.error(
                            format!("Missing expression after: {}", keyword),
                            self.missing_position(),
                        ));
                    }
                }
            }
        }

        Ok(EntityQuery {
            operand: operand.unwrap_or(BooleanOp::And),
            expressions,
        })
    }

    /// Parse a single `property operator value(s)` condition.
    fn convert_condition(&mut self) -> Result<EntityQueryCondition> {
        let field = self.next().expect("caller peeked a token");
        if !is_field_name(&field.text) {
            return Err(self.error(format!("Illegal field: {}", field.text), field.position));
        }
        let property = field.text.clone();

        let operand = self.convert_operator(&property)?;

        let arguments = if operand.is_unary() {
            Vec::new()
        } else {
            vec![self.convert_value(&property, operand)?]
        };

        Ok(EntityQueryCondition {
            property,
            operand,
            arguments,
        })
    }

    /// Match the (possibly multi-token) operator of a condition.
    fn convert_operator(&mut self, property: &str) -> Result<EntityQueryOps> {
        let token = match self.next() {
            Some(token) => token,
            None => {
                return Err(self.error(
                    format!("Missing operator for: {}", property),
                    self.missing_position(),
                ))
            }
        };

        match token.text.to_lowercase().as_str() {
            "=" => Ok(EntityQueryOps::Eq),
            "!=" => Ok(EntityQueryOps::Neq),
            ">" => Ok(EntityQueryOps::Gt),
            ">=" => Ok(EntityQueryOps::Ge),
            "<" => Ok(EntityQueryOps::Lt),
            "<=" => Ok(EntityQueryOps::Le),
            "like" => Ok(EntityQueryOps::Like),
            "ilike" => Ok(EntityQueryOps::LikeIc),
            "contains" => Ok(EntityQueryOps::Contains),
            "in" => Ok(EntityQueryOps::In),
            "not" => match self.keyword_after(token)?.as_str() {
                "like" => Ok(EntityQueryOps::NotLike),
                "ilike" => Ok(EntityQueryOps::NotLikeIc),
                "contains" => Ok(EntityQueryOps::NotContains),
                "in" => Ok(EntityQueryOps::NotIn),
                other => Err(self.error(
                    format!("Illegal operator: not {}", other),
                    token.position,
                )),
            },
            "is" => match self.keyword_after(token)?.as_str() {
                "null" => Ok(EntityQueryOps::IsNull),
                "empty" => Ok(EntityQueryOps::IsEmpty),
                "not" => match self.keyword_after(token)?.as_str() {
                    "null" => Ok(EntityQueryOps::IsNotNull),
                    "empty" => Ok(EntityQueryOps::IsNotEmpty),
                    other => Err(self.error(
                        format!("Illegal operator: is not {}", other),
                        token.position,
                    )),
                },
                other => Err(self.error(
                    format!("Illegal operator: is {}", other),
                    token.position,
                )),
            },
            _ => Err(self.error(
                format!("Illegal operator: {}", token.text),
                token.position,
            )),
        }
    }

    /// Consume the keyword continuing a multi-token operator.
    fn keyword_after(&mut self, first: &Token) -> Result<String> {
        match self.next() {
            Some(token) => Ok(token.text.to_lowercase()),
            None => Err(self.error(
                format!("Illegal operator: {}", first.text),
                first.position,
            )),
        }
    }

    /// Parse the value of a binary condition: a single scalar, a function
    /// call, or - for the membership operators - a parenthesized group.
    fn convert_value(&mut self, property: &str, operand: EntityQueryOps) -> Result<EqlArg> {
        let token = match self.peek() {
            Some(token) => token,
            None => {
                return Err(self.error(
                    format!("Missing value after: {} {} ", property, operand.token()),
                    self.missing_position(),
                ))
            }
        };

        if token.text == "(" {
            if !operand.accepts_group() {
                return Err(self.illegal_token(token));
            }
            self.next();
            return Ok(EqlArg::Group(self.convert_group_values()?));
        }

        self.convert_scalar()
    }

    /// Parse the comma-separated values of a group. The opening parenthesis
    /// has already been consumed; groups may not nest.
    fn convert_group_values(&mut self) -> Result<Vec<EqlArg>> {
        let mut values = Vec::new();

        loop {
            let token = match self.peek() {
                Some(token) => token,
                None => {
                    return Err(self.error(
                        "Missing closing parenthesis".to_string(),
                        self.missing_position(),
                    ))
                }
            };

            match token.text.as_str() {
                ")" => {
                    // An empty group is illegal.
                    if values.is_empty() {
                        return Err(self.illegal_token(token));
                    }
                    self.next();
                    return Ok(values);
                }
                "," | "(" => return Err(self.illegal_token(token)),
                _ => values.push(self.convert_scalar()?),
            }

            match self.peek() {
                Some(token) if token.text == "," => {
                    self.next();
                    // A trailing comma is illegal.
                    if let Some(next) = self.peek() {
                        if next.text == ")" {
                            return Err(self.illegal_token(next));
                        }
                    }
                }
                Some(token) if token.text == ")" => {
                    self.next();
                    return Ok(values);
                }
                Some(token) => return Err(self.illegal_token(token)),
                None => {
                    return Err(self.error(
                        "Missing closing parenthesis".to_string(),
                        self.missing_position(),
                    ))
                }
            }
        }
    }

    /// Parse a single scalar value: quoted string, bare literal, or function
    /// call when the next token opens an argument list.
    fn convert_scalar(&mut self) -> Result<EqlArg> {
        let token = self.next().expect("caller peeked a token");
        if matches!(token.text.as_str(), "(" | ")" | ",") {
            return Err(self.illegal_token(token));
        }

        if token.is_string_literal() {
            return Ok(EqlArg::Str(unescape_string_literal(&token.text)));
        }

        if self.peek().map(|t| t.text == "(").unwrap_or(false) {
            self.next();
            let args = self.convert_function_args()?;
            return Ok(EqlArg::Function(EqlFunction::new(token.text.clone(), args)));
        }

        Ok(EqlArg::Literal(token.text.clone()))
    }

    /// Parse a function argument list. The opening parenthesis has been
    /// consumed; an empty list is legal, value groups are not, nested
    /// functions are.
    fn convert_function_args(&mut self) -> Result<Vec<EqlArg>> {
        let mut args = Vec::new();

        if let Some(token) = self.peek() {
            if token.text == ")" {
                self.next();
                return Ok(args);
            }
        }

        loop {
            let token = match self.peek() {
                Some(token) => token,
                None => {
                    return Err(self.error(
                        "Missing closing parenthesis".to_string(),
                        self.missing_position(),
                    ))
                }
            };
            if matches!(token.text.as_str(), "," | "(" | ")") {
                return Err(self.illegal_token(token));
            }
            args.push(self.convert_scalar()?);

            match self.peek() {
                Some(token) if token.text == "," => {
                    self.next();
                    if let Some(next) = self.peek() {
                        if next.text == ")" {
                            return Err(self.illegal_token(next));
                        }
                    }
                }
                Some(token) if token.text == ")" => {
                    self.next();
                    return Ok(args);
                }
                Some(token) => return Err(self.illegal_token(token)),
                None => {
                    return Err(self.error(
                        "Missing closing parenthesis".to_string(),
                        self.missing_position(),
                    ))
                }
            }
        }
    }
}

/// Field names are identifiers with dotted segments and an optional `[]`
/// collection indexer suffix per segment, e.g. `representatives[].name`.
fn is_field_name(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    text.chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '[' | ']'))
}

/// Strip the delimiters of a quoted literal and remove delimiter escapes.
fn unescape_string_literal(text: &str) -> String {
    let delimiter = text.chars().next().expect("string literal has a delimiter");
    let inner = &text[1..text.len() - 1];
    inner.replace(&format!("\\{}", delimiter), &delimiter.to_string())
}
