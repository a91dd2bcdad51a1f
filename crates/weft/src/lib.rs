/*
 * lib.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Line-oriented directive template engine.
//!
//! Templates are plain text pages carrying `@Directive(payload)` markers.
//! Everything outside a directive is literal output (`@@` renders a
//! literal `@`); directives interpolate values, branch, iterate, and
//! invoke named sub-templates ("stencils") against typed data supplied by
//! the host application. It supports:
//!
//! - Value interpolation: `@Get(.firstName)`, with optional escaping via
//!   `@Get(html => .title)`
//! - Context binding: `@Bind(type)`, served by an [`InstanceProvider`]
//! - Conditionals: `@If(expr)`/`@ElseIf(expr)`/`@Else!`/`@If()`, plus
//!   `@Unless(expr)`
//! - Iteration: `@Each(items)` with `@Separator(, )`
//! - Stencils: `@Stencil(name)` declarations, invoked as `@name!`, with
//!   `@Nested(block)` splicing caller-supplied content
//! - Cross-page reuse: `@Import(alias => location)`
//!
//! Blocks close explicitly (`@If()`, `@Each!`) or implicitly when a line's
//! indentation drops below the block body's column.
//!
//! # Architecture
//!
//! Every resolved value travels with a static [`Shape`], so a page can be
//! fully validated with no live data: [`Engine::check`] runs the same
//! interpreter as rendering, minus output and instance lookups. Compiled
//! pages are cached and republished atomically when their source changes.
//!
//! # Example
//!
//! ```ignore
//! use weft::{Engine, Value};
//!
//! let engine = Engine::new();
//! let output = engine.render_str_with_context(
//!     "hello.wft",
//!     "Hello @Get(.firstName)!",
//!     Value::from(serde_json::json!({"firstName": "Ada"})),
//! )?;
//! assert_eq!(output, "Hello Ada");
//! ```

pub mod engine;
pub mod error;
pub mod escape;
mod interp;
pub mod loader;
pub mod matcher;
pub mod page;
pub mod path;
pub mod value;

// Re-export main types at crate root
pub use engine::Engine;
pub use error::{PageRef, WeftError, WeftResult};
pub use escape::{DEFAULT_ESCAPER, Escaper, IdentityEscaper, TableEscaper};
pub use loader::{FileLoader, LoadError, MemoryLoader, ResourceLoader, SchemeResolver};
pub use matcher::{Arg, Directive, DirectiveMatch, match_directive};
pub use page::{Bookmark, Mark, Page};
pub use value::{
    InstanceProvider, MapProvider, MapRecord, ProvideError, Record, RecordShape, Shape,
    TypeRegistry, TypedValue, Value,
};
