/*
 * escape.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Text escapers.
//!
//! Escaping applies only to values rendered by `@Get`, never to the
//! surrounding literal text. Escapers are looked up by name through the
//! frame stack, innermost first; the identity escaper is pre-registered
//! under [`DEFAULT_ESCAPER`] on the root frame.
//!
//! `@Escape` can also build an escaper from a fetched resource: a text of
//! whitespace-separated `(codepoint, replacement)` pairs, one substitution
//! per pair.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Name of the pre-registered identity escaper.
pub const DEFAULT_ESCAPER: &str = "*";

/// A named text-escaping function applied to `@Get` output.
pub trait Escaper: fmt::Debug + Send + Sync {
    fn escape(&self, text: &str) -> String;
}

/// The identity escaper: output passes through untouched.
#[derive(Debug, Clone, Default)]
pub struct IdentityEscaper;

impl Escaper for IdentityEscaper {
    fn escape(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Malformed escaper table resource.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TableError {
    #[error("escaper table has a trailing codepoint with no replacement")]
    MissingReplacement,

    #[error("invalid codepoint `{token}` in escaper table")]
    InvalidCodepoint { token: String },
}

/// Character-substitution escaper built from `(codepoint, replacement)` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableEscaper {
    table: HashMap<char, String>,
}

impl TableEscaper {
    /// Parse the wire format: whitespace-separated pairs of a codepoint
    /// (decimal, or hex with an `0x` prefix) and its replacement text.
    pub fn parse(source: &str) -> Result<Self, TableError> {
        let mut table = HashMap::new();
        let mut tokens = source.split_whitespace();
        while let Some(code_token) = tokens.next() {
            let replacement = tokens.next().ok_or(TableError::MissingReplacement)?;
            let code = parse_codepoint(code_token).ok_or_else(|| TableError::InvalidCodepoint {
                token: code_token.to_string(),
            })?;
            table.insert(code, replacement.to_string());
        }
        Ok(Self { table })
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (char, &'static str)>) -> Self {
        Self {
            table: pairs
                .into_iter()
                .map(|(c, r)| (c, r.to_string()))
                .collect(),
        }
    }
}

fn parse_codepoint(token: &str) -> Option<char> {
    let code = match token.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => token.parse::<u32>().ok()?,
    };
    char::from_u32(code)
}

impl Escaper for TableEscaper {
    fn escape(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            match self.table.get(&c) {
                Some(replacement) => out.push_str(replacement),
                None => out.push(c),
            }
        }
        out
    }
}

/// The built-in `html` escaper registered on every engine.
pub fn html_escaper() -> TableEscaper {
    TableEscaper::from_pairs([
        ('&', "&amp;"),
        ('<', "&lt;"),
        ('>', "&gt;"),
        ('"', "&quot;"),
        ('\'', "&#39;"),
    ])
}
