/*
 * page.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Compiled pages and resumable bookmarks.
//!
//! A [`Page`] is the immutable, cached representation of one template
//! source: its raw lines, its modification stamp, and the table of
//! stencils declared anywhere on the page. A [`Bookmark`] is an exact
//! resume point inside a page; the interpreter yields bookmarks whenever
//! control leaves a line stream (stencil calls, nested-content splices)
//! so the caller can continue precisely where it left off.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::PageRef;

/// A position within some page: line index, pending remainder of that
/// line, how many directives on the line were already consumed, and the
/// line's indentation column.
#[derive(Debug, Clone, PartialEq)]
pub struct Mark {
    /// 0-based index into [`Page::lines`].
    pub line: usize,
    /// Unconsumed remainder of the line at this position.
    pub rest: String,
    /// Directives already dispatched on this line.
    pub count: usize,
    /// Leading-whitespace column of the line.
    pub indent: usize,
}

/// A [`Mark`] tied to its page: a fully resumable cursor.
#[derive(Debug, Clone)]
pub struct Bookmark {
    pub page: Arc<Page>,
    pub mark: Mark,
}

impl Bookmark {
    /// Source position for error reporting (1-based line).
    pub fn page_ref(&self) -> PageRef {
        PageRef::new(self.page.location.clone(), self.mark.line + 1)
    }
}

/// One compiled template source. Never mutated in place: recompilation
/// replaces the cached page wholesale.
#[derive(Debug)]
pub struct Page {
    /// Resolved location, also the page cache key.
    pub location: String,
    /// Raw source lines; the interpreter treats them as opaque text.
    pub lines: Vec<String>,
    /// Whether the source ended with a newline. Preserved on output.
    pub ends_with_newline: bool,
    /// Modification stamp of the backing resource at compile time.
    pub modified: Option<SystemTime>,
    /// Declared stencil name to body start, visible page-wide.
    pub stencils: HashMap<String, Mark>,
}

impl Page {
    /// Split a source text into a page skeleton. The stencil table is
    /// filled in by the compile pass.
    pub fn from_source(
        location: impl Into<String>,
        source: &str,
        modified: Option<SystemTime>,
    ) -> Self {
        Self {
            location: location.into(),
            lines: source.lines().map(str::to_string).collect(),
            ends_with_newline: source.ends_with('\n'),
            modified,
            stencils: HashMap::new(),
        }
    }

    /// Source position for error reporting (1-based line).
    pub fn page_ref(&self, line: usize) -> PageRef {
        PageRef::new(self.location.clone(), line + 1)
    }

    /// A bookmark for a declared stencil body, by name.
    pub fn stencil(self: &Arc<Self>, name: &str) -> Option<Bookmark> {
        self.stencils.get(name).map(|mark| Bookmark {
            page: Arc::clone(self),
            mark: mark.clone(),
        })
    }
}

/// Leading-whitespace column of a line (spaces and tabs each count one).
pub fn indent_of(line: &str) -> usize {
    line.chars().take_while(|c| *c == ' ' || *c == '\t').count()
}
