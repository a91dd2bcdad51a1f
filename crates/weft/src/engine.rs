/*
 * engine.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The page engine: compilation, caching, and the public render API.
//!
//! Pages compile in two passes. Pass one scans every line with the
//! directive matcher and fills the page-wide stencil table. Pass two runs
//! the interpreter in check mode: block structure, path expressions, and
//! imports are validated with no live data and no output. Only a page
//! that passes both is published to the cache, atomically — concurrent
//! readers see either the previous compiled page or the new one, never a
//! half-built state.
//!
//! Rendering always goes through the cache. With dirty-checking enabled
//! (the default), a cached page whose backing resource has a newer
//! modification stamp is recompiled first.

use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::{WeftError, WeftResult};
use crate::escape::{Escaper, html_escaper};
use crate::interp::{Interp, Mode, Session};
use crate::loader::{
    FileLoader, ResourceLoader, SchemeResolver, join_location, parent_of, split_scheme,
};
use crate::matcher::match_directive;
use crate::page::{Mark, Page, indent_of};
use crate::value::{InstanceProvider, RecordShape, Shape, TypeRegistry, TypedValue, Value};

/// The template engine. One engine owns a page cache, the registered
/// record types, named escapers, and location schemes; it is shared by
/// reference across renders.
pub struct Engine {
    loader: Arc<dyn ResourceLoader>,
    resolvers: HashMap<String, Arc<dyn SchemeResolver>>,
    types: TypeRegistry,
    escapers: HashMap<String, Arc<dyn Escaper>>,
    /// String conversion applied by `@Get` before escaping.
    display: fn(&Value) -> String,
    base_location: Option<String>,
    check_dirty: bool,
    cache: RwLock<HashMap<String, Arc<Page>>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// An engine reading templates from the filesystem.
    pub fn new() -> Self {
        Self::with_loader(Arc::new(FileLoader))
    }

    pub fn with_loader(loader: Arc<dyn ResourceLoader>) -> Self {
        let mut escapers: HashMap<String, Arc<dyn Escaper>> = HashMap::new();
        escapers.insert("html".to_string(), Arc::new(html_escaper()));
        Self {
            loader,
            resolvers: HashMap::new(),
            types: TypeRegistry::new(),
            escapers,
            display: Value::render,
            base_location: None,
            check_dirty: true,
            cache: RwLock::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Base location for resolving relative template locations.
    pub fn set_base_location(&mut self, base: impl Into<String>) {
        self.base_location = Some(base.into());
    }

    /// Whether cached pages are recompiled when their backing resource
    /// changes. On by default.
    pub fn set_check_dirty(&mut self, check: bool) {
        self.check_dirty = check;
    }

    /// Register a location scheme, consulted for `scheme:rest` locations.
    pub fn add_resolver(&mut self, scheme: impl Into<String>, resolver: Arc<dyn SchemeResolver>) {
        self.resolvers.insert(scheme.into(), resolver);
    }

    /// Declare a record type for `@Bind(name)`.
    pub fn register_type(&mut self, shape: RecordShape) {
        self.types.register(shape);
    }

    /// Register a named escaper implementation for `@Escape`.
    pub fn register_escaper(&mut self, name: impl Into<String>, escaper: Arc<dyn Escaper>) {
        self.escapers.insert(name.into(), escaper);
    }

    /// Replace the string conversion `@Get` applies to resolved values.
    pub fn set_display(&mut self, display: fn(&Value) -> String) {
        self.display = display;
    }

    // ------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------

    /// Render a page. Context enters through `@Bind` directives, served
    /// by `provider`.
    pub fn render(&self, provider: &dyn InstanceProvider, location: &str) -> WeftResult<String> {
        self.render_impl(Some(provider), location, None)
    }

    /// Render a page against a root context value bound before the first
    /// line. The context's shape is inferred from the data.
    pub fn render_with_context(&self, location: &str, context: Value) -> WeftResult<String> {
        self.render_impl(None, location, Some(TypedValue::of_value(context)))
    }

    /// Render a page into a writer.
    pub fn render_to(
        &self,
        provider: &dyn InstanceProvider,
        location: &str,
        out: &mut dyn io::Write,
    ) -> WeftResult<()> {
        let text = self.render(provider, location)?;
        out.write_all(text.as_bytes())?;
        Ok(())
    }

    /// Compile and statically validate a page without rendering it.
    pub fn check(&self, location: &str) -> WeftResult<()> {
        let resolved = self.resolve_location(location, None);
        let session = self.session(Mode::Check, None);
        self.page_checked(&resolved, &session)?;
        Ok(())
    }

    /// Render template text directly, bypassing the loader and cache.
    /// `name` identifies the source in error messages.
    pub fn render_str(
        &self,
        name: &str,
        source: &str,
        provider: &dyn InstanceProvider,
    ) -> WeftResult<String> {
        self.render_str_impl(name, source, Some(provider), None)
    }

    /// Render template text directly against a root context value.
    pub fn render_str_with_context(
        &self,
        name: &str,
        source: &str,
        context: Value,
    ) -> WeftResult<String> {
        self.render_str_impl(name, source, None, Some(TypedValue::of_value(context)))
    }

    /// Statically validate template text directly.
    pub fn check_str(&self, name: &str, source: &str) -> WeftResult<()> {
        self.compile_source(name, source, None, &self.session(Mode::Check, None))
            .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Compilation
    // ------------------------------------------------------------------

    fn session<'e>(&'e self, mode: Mode, provider: Option<&'e dyn InstanceProvider>) -> Session<'e> {
        Session {
            engine: self,
            provider,
            mode,
            chain: Default::default(),
        }
    }

    fn render_impl(
        &self,
        provider: Option<&dyn InstanceProvider>,
        location: &str,
        root_context: Option<TypedValue>,
    ) -> WeftResult<String> {
        let resolved = self.resolve_location(location, None);
        let session = self.session(Mode::Render, provider);
        let page = self.page_checked(&resolved, &session)?;
        let mut out = String::new();
        Interp::new(&session, page, Some(&mut out), root_context).run()?;
        Ok(out)
    }

    fn render_str_impl(
        &self,
        name: &str,
        source: &str,
        provider: Option<&dyn InstanceProvider>,
        root_context: Option<TypedValue>,
    ) -> WeftResult<String> {
        let session = self.session(Mode::Render, provider);
        let root_shape = root_context.as_ref().map(|c| c.shape.clone());
        let page = self.compile_source(name, source, root_shape, &session)?;
        let mut out = String::new();
        Interp::new(&session, page, Some(&mut out), root_context).run()?;
        Ok(out)
    }

    /// Fetch a page through the cache, compiling (or recompiling a dirty
    /// entry) as needed.
    pub(crate) fn page_checked(
        &self,
        resolved: &str,
        session: &Session<'_>,
    ) -> WeftResult<Arc<Page>> {
        if let Some(cached) = self.cache.read().expect("cache lock").get(resolved) {
            if !self.check_dirty || self.loader.modified(resolved) == cached.modified {
                return Ok(Arc::clone(cached));
            }
            debug!(page = resolved, "recompiling modified page");
        }

        if session.chain.borrow().iter().any(|l| l == resolved) {
            return Err(WeftError::Resource {
                location: resolved.to_string(),
                message: format!(
                    "import cycle: {} -> {resolved}",
                    session.chain.borrow().join(" -> ")
                ),
            });
        }

        session.chain.borrow_mut().push(resolved.to_string());
        let compiled = self.compile_location(resolved, session);
        session.chain.borrow_mut().pop();
        let page = compiled?;

        self.cache
            .write()
            .expect("cache lock")
            .insert(resolved.to_string(), Arc::clone(&page));
        Ok(page)
    }

    fn compile_location(&self, resolved: &str, session: &Session<'_>) -> WeftResult<Arc<Page>> {
        debug!(page = resolved, "compiling page");
        let source = self
            .loader
            .fetch(resolved)
            .map_err(|e| WeftError::Resource {
                location: resolved.to_string(),
                message: e.to_string(),
            })?;
        let modified = self.loader.modified(resolved);
        let mut page = Page::from_source(resolved, &source, modified);
        page.stencils = scan_stencils(&page)?;
        let page = Arc::new(page);
        self.check_page(&page, None, session)?;
        Ok(page)
    }

    fn compile_source(
        &self,
        name: &str,
        source: &str,
        root_shape: Option<Shape>,
        session: &Session<'_>,
    ) -> WeftResult<Arc<Page>> {
        let mut page = Page::from_source(name, source, None);
        page.stencils = scan_stencils(&page)?;
        let page = Arc::new(page);
        self.check_page(&page, root_shape, session)?;
        Ok(page)
    }

    /// Pass two: a full check-mode interpretation.
    fn check_page(
        &self,
        page: &Arc<Page>,
        root_shape: Option<Shape>,
        session: &Session<'_>,
    ) -> WeftResult<()> {
        let check = Session {
            engine: self,
            provider: None,
            mode: Mode::Check,
            chain: Rc::clone(&session.chain),
        };
        let root_context = root_shape.map(TypedValue::unbound);
        Interp::new(&check, Arc::clone(page), None, root_context).run()
    }

    // ------------------------------------------------------------------
    // Services for the interpreter
    // ------------------------------------------------------------------

    /// Compile a page reached through `@Import`, relative to the
    /// importing page.
    pub(crate) fn import_page(
        &self,
        session: &Session<'_>,
        location: &str,
        from_page: &str,
    ) -> WeftResult<Arc<Page>> {
        let resolved = self.resolve_location(location, Some(from_page));
        self.page_checked(&resolved, session)
    }

    /// Turn a location into a fetchable one: registered schemes first,
    /// then relative resolution against the importing page's directory or
    /// the engine base.
    pub(crate) fn resolve_location(&self, location: &str, from_page: Option<&str>) -> String {
        if let Some((scheme, rest)) = split_scheme(location) {
            if let Some(resolver) = self.resolvers.get(scheme) {
                if let Some(concrete) = resolver.resolve(rest) {
                    return concrete;
                }
            }
            return location.to_string();
        }
        let base = from_page
            .and_then(parent_of)
            .or_else(|| self.base_location.clone());
        join_location(base.as_deref(), location)
    }

    pub(crate) fn fetch(&self, location: &str) -> WeftResult<String> {
        self.loader
            .fetch(location)
            .map_err(|e| WeftError::Resource {
                location: location.to_string(),
                message: e.to_string(),
            })
    }

    pub(crate) fn type_shape(&self, name: &str) -> Option<Arc<RecordShape>> {
        self.types.get(name)
    }

    pub(crate) fn escaper_impl(&self, name: &str) -> Option<Arc<dyn Escaper>> {
        self.escapers.get(name).cloned()
    }

    pub(crate) fn display(&self, value: &Value) -> String {
        (self.display)(value)
    }
}

/// Pass one: collect every `@Stencil(name)` declaration into the
/// page-wide table. Bodies are not interpreted here; only the matcher
/// runs, so the scan cannot fail on semantics — just on duplicates.
fn scan_stencils(page: &Page) -> WeftResult<HashMap<String, Mark>> {
    let mut stencils = HashMap::new();
    for (line_index, line) in page.lines.iter().enumerate() {
        let indent = indent_of(line);
        let mut rest: &str = line;
        let mut count = 0;
        loop {
            let m = match_directive(rest);
            let Some(directive) = m.directive else {
                break;
            };
            count += 1;
            if directive.name == "Stencil" {
                if let Some(name) = directive.payload() {
                    let mark = Mark {
                        line: line_index,
                        rest: m.rest.to_string(),
                        count,
                        indent,
                    };
                    if stencils.insert(name.to_string(), mark).is_some() {
                        return Err(WeftError::Structural {
                            message: format!("stencil `{name}` declared twice"),
                            at: page.page_ref(line_index),
                        });
                    }
                }
            }
            rest = m.rest;
        }
    }
    Ok(stencils)
}
