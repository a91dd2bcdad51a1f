/*
 * error.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Error types for page compilation and rendering.
//!
//! Every fatal condition carries a [`PageRef`]: the identity of the page
//! being interpreted plus a 1-based line number. There is no partial-output
//! mode; a failed render must not be mistaken for a valid document.

use std::fmt;

use thiserror::Error;

/// A source position: page identity plus 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRef {
    /// Resolved location of the page (as used for the page cache key).
    pub page: String,
    /// 1-based line number within the page.
    pub line: usize,
}

impl PageRef {
    pub fn new(page: impl Into<String>, line: usize) -> Self {
        Self {
            page: page.into(),
            line,
        }
    }
}

impl fmt::Display for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page, self.line)
    }
}

/// Errors that can occur while compiling or rendering a page.
#[derive(Debug, Error)]
pub enum WeftError {
    /// Unbalanced or misplaced block directive.
    #[error("{at}: {message}")]
    Structural { message: String, at: PageRef },

    /// A path expression names a property its context does not expose.
    #[error("{at}: cannot resolve `{expression}`: {detail}")]
    Path {
        expression: String,
        detail: String,
        at: PageRef,
    },

    /// An expression was used where its shape is invalid.
    #[error("{at}: {message}")]
    Type { message: String, at: PageRef },

    /// Failure to load a template, import, or escaper resource.
    #[error("failed to load `{location}`: {message}")]
    Resource { location: String, message: String },

    /// The instance provider cannot supply a bound type.
    #[error("{at}: no instance for type `{type_name}`: {message}")]
    Instance {
        type_name: String,
        message: String,
        at: PageRef,
    },

    /// Stencil invocations nested beyond the recursion limit.
    #[error("{at}: stencil `{name}` recursion exceeds depth {max_depth}")]
    RecursiveStencil {
        name: String,
        max_depth: usize,
        at: PageRef,
    },

    /// I/O error writing rendered output.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for template operations.
pub type WeftResult<T> = Result<T, WeftError>;
