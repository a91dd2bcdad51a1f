/*
 * matcher.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The directive matcher.
//!
//! A pure parse step invoked repeatedly on the remainder of the current
//! line: it extracts the leading literal (decoding the `@@` escape), an
//! optional directive, and the trailing remainder. It has no side effects
//! and no knowledge of directive semantics.
//!
//! Grammar per match:
//!
//! ```text
//! literal  := any run without an unescaped `@` (`@@` is a literal `@`)
//! name     := letter alnum* (`.` letter alnum*)*
//! match    := literal [ `@` name ( `!` | `(` payload `)` [`!`] ) ] rest
//! ```
//!
//! If the text after an `@` does not form a directive, the entire input
//! remainder is the terminal literal for this line. A `!` immediately
//! following the closing parenthesis is consumed as an explicit
//! terminator and produces no output.

/// One matched step of a line remainder.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectiveMatch<'a> {
    /// Leading literal text with `@@` decoded to `@`.
    pub literal: String,
    /// The directive, if one was matched.
    pub directive: Option<Directive>,
    /// Unconsumed remainder after the directive.
    pub rest: &'a str,
}

/// A matched directive.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    /// Directive name, possibly dot-qualified (`alias.name`).
    pub name: String,
    pub arg: Arg,
}

/// Directive argument form.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// `@Name!` — the payload-less close form.
    Close,
    /// `@Name(payload)` — payload text, possibly empty.
    Payload(String),
}

impl Directive {
    /// True for both close spellings: `@Name!` and `@Name()`.
    pub fn is_close(&self) -> bool {
        match &self.arg {
            Arg::Close => true,
            Arg::Payload(p) => p.trim().is_empty(),
        }
    }

    /// Non-empty payload text, trimmed.
    pub fn payload(&self) -> Option<&str> {
        match &self.arg {
            Arg::Payload(p) if !p.trim().is_empty() => Some(p.trim()),
            _ => None,
        }
    }
}

/// Decode the full remainder as literal text (`@@` becomes `@`).
fn decode_all(text: &str) -> String {
    text.replace("@@", "@")
}

/// Match the next directive in `input`.
pub fn match_directive(input: &str) -> DirectiveMatch<'_> {
    let mut literal = String::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'@' {
            // Advance over a whole UTF-8 character.
            let ch_len = utf8_len(bytes[i]);
            literal.push_str(&input[i..i + ch_len]);
            i += ch_len;
            continue;
        }
        // `@@` is a literal at-sign.
        if bytes.get(i + 1) == Some(&b'@') {
            literal.push('@');
            i += 2;
            continue;
        }
        // Candidate directive start.
        match parse_directive(&input[i..]) {
            Some((directive, consumed)) => {
                return DirectiveMatch {
                    literal,
                    directive: Some(directive),
                    rest: &input[i + consumed..],
                };
            }
            None => {
                // Not a directive: the whole remainder is terminal literal.
                literal.push_str(&decode_all(&input[i..]));
                return DirectiveMatch {
                    literal,
                    directive: None,
                    rest: "",
                };
            }
        }
    }

    DirectiveMatch {
        literal,
        directive: None,
        rest: "",
    }
}

/// Parse `@name(...)` / `@name!` at the start of `text`.
/// Returns the directive and the number of bytes consumed.
fn parse_directive(text: &str) -> Option<(Directive, usize)> {
    debug_assert!(text.starts_with('@'));
    let body = &text[1..];
    let name_len = scan_name(body)?;
    let name = &body[..name_len];
    let after = &body[name_len..];

    if let Some(stripped) = after.strip_prefix('!') {
        let consumed = text.len() - stripped.len();
        return Some((
            Directive {
                name: name.to_string(),
                arg: Arg::Close,
            },
            consumed,
        ));
    }

    let inner = after.strip_prefix('(')?;
    let payload_len = scan_payload(inner)?;
    let payload = &inner[..payload_len];
    // consumed: '@' + name + '(' + payload + ')'
    let mut consumed = 1 + name_len + 1 + payload_len + 1;
    // Optional explicit terminator after the closing parenthesis.
    if text[consumed..].starts_with('!') {
        consumed += 1;
    }
    Some((
        Directive {
            name: name.to_string(),
            arg: Arg::Payload(payload.to_string()),
        },
        consumed,
    ))
}

/// Length of a directive name: letter alnum*, dot-qualified segments allowed.
fn scan_name(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    if !bytes.first().is_some_and(u8::is_ascii_alphabetic) {
        return None;
    }
    let mut i = 1;
    while i < bytes.len() && bytes[i].is_ascii_alphanumeric() {
        i += 1;
    }
    // A dot continues the name only if another segment follows.
    while i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_alphabetic() {
        i += 2;
        while i < bytes.len() && bytes[i].is_ascii_alphanumeric() {
            i += 1;
        }
    }
    Some(i)
}

/// Length of a payload: text up to the matching `)`, parentheses balanced.
fn scan_payload(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (at, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                if depth == 0 {
                    return Some(at);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}
