//! EQL tokenizer
//!
//! Splits a raw query string into positioned tokens. Tokens carry their
//! starting byte offset in the source so every downstream error can cite the
//! exact spot in the query.

use crate::error::{EqlError, ParseError, Result};

/// A single token with its starting offset in the source string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub position: usize,
}

impl Token {
    pub fn new(text: impl Into<String>, position: usize) -> Self {
        Self {
            text: text.into(),
            position,
        }
    }

    /// Offset one past the last character of the token.
    pub fn end(&self) -> usize {
        self.position + self.text.len()
    }

    /// Whether this token is a quoted string literal (delimiters included).
    pub fn is_string_literal(&self) -> bool {
        self.text.starts_with('\'') || self.text.starts_with('"')
    }
}

/// Split a raw query into tokens.
///
/// Whitespace separates tokens outside of quoted literals; `(`, `)` and `,`
/// are always single-character tokens and terminate any bare token in
/// progress. Quoted literals (`'...'` or `"..."`) become one token including
/// their delimiters; inside a literal, a backslash escapes the literal's own
/// delimiter and nothing else.
pub fn tokenize(raw: &str) -> Result<Vec<Token>> {
    Tokenizer::new(raw).run()
}

struct Tokenizer<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Tokenizer { input, position: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if let Some(c) = c {
            self.position += c.len_utf8();
        }
        c
    }

    fn run(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();

        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
                continue;
            }
            let start = self.position;
            match c {
                '(' | ')' | ',' => {
                    self.bump();
                    tokens.push(Token::new(c, start));
                }
                '\'' | '"' => tokens.push(self.read_string(c, start)?),
                _ => tokens.push(self.read_bare(start)),
            }
        }

        Ok(tokens)
    }

    /// Read a quoted literal, delimiters included. The opening quote has not
    /// been consumed yet.
    fn read_string(&mut self, delimiter: char, start: usize) -> Result<Token> {
        self.bump();
        while let Some(c) = self.bump() {
            if c == '\\' && self.peek() == Some(delimiter) {
                self.bump();
            } else if c == delimiter {
                return Ok(Token::new(&self.input[start..self.position], start));
            }
        }

        let text = &self.input[start..];
        Err(EqlError::Parse(ParseError {
            message: format!("Unterminated string literal: {}", text),
            error_position: start,
            context_start: start,
            context_expression: text.to_string(),
        }))
    }

    /// Read a bare token up to whitespace, punctuation or a quote.
    fn read_bare(&mut self, start: usize) -> Token {
        while let Some(c) = self.peek() {
            if c.is_whitespace() || matches!(c, '(' | ')' | ',' | '\'' | '"') {
                break;
            }
            self.bump();
        }
        Token::new(&self.input[start..self.position], start)
    }
}
