//! LIKE pattern semantics
//!
//! In EQL patterns, `%` is the only wildcard; `\%` is a literal percent,
//! `\\` a literal backslash, and `_` always matches itself. This module is
//! the single interpretation of that grammar shared by the in-memory and
//! Elasticsearch backends; the SQL backend re-escapes the raw pattern text
//! instead (see the sql crate) and is held to the same semantics by the
//! parallel fixtures.

use serde::{Deserialize, Serialize};

/// One segment of a parsed pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LikeSegment {
    /// Literal text to match verbatim.
    Literal(String),
    /// A `%` run matching any (possibly empty) substring.
    AnyRun,
}

/// A parsed LIKE pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikePattern {
    segments: Vec<LikeSegment>,
}

impl LikePattern {
    /// Parse pattern text. A backslash escapes the following character;
    /// a trailing backslash is kept literally. Consecutive `%` collapse.
    pub fn parse(pattern: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars();

        while let Some(c) = chars.next() {
            match c {
                '%' => {
                    if !literal.is_empty() {
                        segments.push(LikeSegment::Literal(std::mem::take(&mut literal)));
                    }
                    if segments.last() != Some(&LikeSegment::AnyRun) {
                        segments.push(LikeSegment::AnyRun);
                    }
                }
                '\\' => literal.push(chars.next().unwrap_or('\\')),
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(LikeSegment::Literal(literal));
        }

        Self { segments }
    }

    pub fn segments(&self) -> &[LikeSegment] {
        &self.segments
    }

    /// Whether the value matches the pattern.
    pub fn matches(&self, value: &str) -> bool {
        if !self.segments.iter().any(|s| *s == LikeSegment::AnyRun) {
            let literal: String = self
                .segments
                .iter()
                .map(|s| match s {
                    LikeSegment::Literal(text) => text.as_str(),
                    LikeSegment::AnyRun => "",
                })
                .collect();
            return literal == value;
        }

        let mut start = 0usize;
        let mut end = value.len();
        let mut first = 0usize;
        let mut last = self.segments.len();

        // A leading literal anchors the start, a trailing literal the end.
        if let Some(LikeSegment::Literal(text)) = self.segments.first() {
            if !value.starts_with(text.as_str()) {
                return false;
            }
            start = text.len();
            first = 1;
        }
        if last > first {
            if let Some(LikeSegment::Literal(text)) = self.segments.last() {
                if end - start < text.len() || !value[start..end].ends_with(text.as_str()) {
                    return false;
                }
                end -= text.len();
                last -= 1;
            }
        }

        // Everything in between matches greedily left to right.
        for segment in &self.segments[first..last] {
            if let LikeSegment::Literal(text) = segment {
                match value[start..end].find(text.as_str()) {
                    Some(index) => start += index + text.len(),
                    None => return false,
                }
            }
        }

        true
    }

    /// Case-insensitive match; pattern literals and value are lowercased.
    pub fn matches_ignore_case(&self, value: &str) -> bool {
        let lowered = LikePattern {
            segments: self
                .segments
                .iter()
                .map(|s| match s {
                    LikeSegment::Literal(text) => LikeSegment::Literal(text.to_lowercase()),
                    LikeSegment::AnyRun => LikeSegment::AnyRun,
                })
                .collect(),
        };
        lowered.matches(&value.to_lowercase())
    }

    /// Pattern that matches values containing the given literal text.
    pub fn containing(text: &str) -> Self {
        Self {
            segments: vec![
                LikeSegment::AnyRun,
                LikeSegment::Literal(text.to_string()),
                LikeSegment::AnyRun,
            ],
        }
    }
}
