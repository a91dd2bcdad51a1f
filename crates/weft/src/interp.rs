/*
 * interp.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The scope-stack interpreter.
//!
//! Pages are consumed line by line. Each line is scanned with the
//! directive matcher; directives manipulate a stack of open block frames
//! ([`Level`]), and block bodies close either through an explicit
//! no-payload close directive or when a later line's indentation drops
//! below the frame's threshold.
//!
//! Control flow into stencil bodies and nested-content splices does not
//! use host recursion: the interpreter owns its cursor and pushes
//! [`CallRecord`]s on an explicit call stack, so every descent yields a
//! resumable bookmark and recursion depth is bounded deterministically.
//!
//! The same machine runs in two modes: `Render` produces output through
//! live data, `Check` validates structure and path expressions without
//! touching the instance provider or emitting anything.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use tracing::trace;

use crate::engine::Engine;
use crate::error::{PageRef, WeftError, WeftResult};
use crate::escape::{DEFAULT_ESCAPER, Escaper, IdentityEscaper, TableEscaper};
use crate::matcher::{Arg, Directive, match_directive};
use crate::page::{Bookmark, Mark, Page, indent_of};
use crate::path::{self, segments};
use crate::value::{InstanceProvider, Shape, TypedValue, Value};

/// Maximum stencil call depth before a recursion error.
const MAX_CALL_DEPTH: usize = 64;

/// Interpreter mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Produce output against live data.
    Render,
    /// Static-only validation: no output, no instance provider calls.
    Check,
}

/// Services shared by one compile or render invocation.
pub(crate) struct Session<'e> {
    pub engine: &'e Engine,
    pub provider: Option<&'e dyn InstanceProvider>,
    pub mode: Mode,
    /// Locations currently being compiled, for import cycle detection.
    pub chain: Rc<RefCell<Vec<String>>>,
}

/// What kind of block a frame represents.
#[derive(Debug, Clone, PartialEq)]
enum LevelKind {
    /// The sentinel frame; never closed.
    Root,
    /// `@Bind(type)`.
    Bind,
    /// `@If(expr)` / `@Unless(expr)`.
    Cond,
    /// `@Each(expr)`.
    Each,
    /// A stencil declaration body encountered in page order.
    StencilDecl,
    /// A stencil body entered through invocation.
    StencilCall,
    /// An opaque named block: a `@Nested` splice region, or a block
    /// tracked only for balance inside an inert declaration body.
    Block { name: String, splice: bool },
}

/// Iteration state of an open `@Each` frame.
#[derive(Debug, Clone)]
struct EachState {
    items: Vec<Value>,
    index: usize,
    /// Loop-body bookmark, captured immediately after the opening
    /// directive's own remainder is determined.
    body: Mark,
    elem_shape: Shape,
}

impl EachState {
    fn has_more(&self) -> bool {
        self.index + 1 < self.items.len()
    }
}

/// One open block frame.
struct Level {
    kind: LevelKind,
    opened_at: PageRef,
    /// Required indentation column; `None` until the first line after the
    /// frame opened fixes it.
    threshold: Option<usize>,
    /// Body currently suppressed (failed condition, empty loop,
    /// declaration body during render).
    skip: bool,
    /// For If/ElseIf/Else chains: some branch already matched.
    matched: bool,
    /// Declaration body during render: directives are tracked for
    /// balance only, never executed.
    inert: bool,
    /// Context bound by `@Bind` or the current `@Each` element.
    bound: Option<TypedValue>,
    /// Static walk only: the frame's render-time context is unknown
    /// (an `@Each` whose own expression was deferred), so paths under
    /// it cannot be judged here.
    deferred: bool,
    each: Option<EachState>,
    escapers: HashMap<String, Arc<dyn Escaper>>,
    stencils: HashMap<String, Bookmark>,
    aliases: HashMap<String, String>,
}

impl Level {
    fn new(kind: LevelKind, opened_at: PageRef) -> Self {
        Self {
            kind,
            opened_at,
            threshold: None,
            skip: false,
            matched: false,
            inert: false,
            bound: None,
            deferred: false,
            each: None,
            escapers: HashMap::new(),
            stencils: HashMap::new(),
            aliases: HashMap::new(),
        }
    }
}

/// Why a call record exists.
#[derive(Debug, Clone, PartialEq)]
enum CallKind {
    /// A stencil invocation.
    Stencil { name: String },
    /// A `@Nested` splice into the caller's content.
    Splice,
}

/// Interpreter position: page, line, pending remainder, directives
/// consumed on the line, and the line's indentation column.
#[derive(Clone)]
struct Cursor {
    page: Arc<Page>,
    line: usize,
    /// `None` means the line has not been entered yet.
    rest: Option<String>,
    count: usize,
    indent: usize,
}

impl Cursor {
    fn at_start(page: Arc<Page>) -> Self {
        Self {
            page,
            line: 0,
            rest: None,
            count: 0,
            indent: 0,
        }
    }

    fn from_bookmark(bookmark: &Bookmark) -> Self {
        Self {
            page: Arc::clone(&bookmark.page),
            line: bookmark.mark.line,
            rest: Some(bookmark.mark.rest.clone()),
            count: bookmark.mark.count,
            indent: bookmark.mark.indent,
        }
    }

    fn page_ref(&self) -> PageRef {
        let line = self.line.min(self.page.lines.len().saturating_sub(1));
        self.page.page_ref(line)
    }
}

/// One suspended caller position on the explicit call stack.
struct CallRecord {
    kind: CallKind,
    /// Where the caller resumes when the callee's frame closes.
    return_cursor: Cursor,
    /// Caller-side content start, available to `@Nested`.
    nested_start: Option<Cursor>,
    /// Set when a splice finishes: the caller resumes past the content.
    resume_after_nested: Option<Cursor>,
    /// Stack depth when the call was entered; its frame sits here.
    levels_base: usize,
}

/// Outcome of closing the innermost frame through a dedent.
enum CloseOutcome {
    /// Frame popped; the current line is still pending.
    Popped,
    /// Cursor moved (loop rewind or call return); re-enter the main loop.
    Moved,
}

pub(crate) struct Interp<'a> {
    session: &'a Session<'a>,
    levels: Vec<Level>,
    calls: Vec<CallRecord>,
    cursor: Cursor,
    out: Option<&'a mut String>,
    // Per-physical-line output state.
    pending_ws: String,
    emitted_this_line: bool,
    had_directive: bool,
    /// Set by `@Separator!` on the final iteration: literal output for
    /// the remainder of the line is dropped.
    tail_suppressed: bool,
}

impl<'a> Interp<'a> {
    pub(crate) fn new(
        session: &'a Session<'a>,
        page: Arc<Page>,
        out: Option<&'a mut String>,
        root_context: Option<TypedValue>,
    ) -> Self {
        let mut root = Level::new(LevelKind::Root, page.page_ref(0));
        root.threshold = Some(0);
        root.bound = root_context;
        root.escapers
            .insert(DEFAULT_ESCAPER.to_string(), Arc::new(IdentityEscaper));
        Self {
            session,
            levels: vec![root],
            calls: Vec::new(),
            cursor: Cursor::at_start(page),
            out,
            pending_ws: String::new(),
            emitted_this_line: false,
            had_directive: false,
            tail_suppressed: false,
        }
    }

    /// Interpret until the root page is exhausted.
    pub(crate) fn run(mut self) -> WeftResult<()> {
        loop {
            if self.cursor.rest.is_some() {
                self.step()?;
            } else if !self.advance_line()? {
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Line entry and indentation handling
    // ------------------------------------------------------------------

    /// Enter the next physical line (or handle end of page).
    /// Returns `false` when the whole render is complete.
    fn advance_line(&mut self) -> WeftResult<bool> {
        if self.cursor.line >= self.cursor.page.lines.len() {
            return self.handle_end_of_page();
        }

        let raw = self.cursor.page.lines[self.cursor.line].clone();
        if raw.trim().is_empty() {
            // Blank lines never close frames and never set thresholds.
            // Under a suppressed frame they are discarded outright.
            if !self.suppressed() {
                self.push_out(&raw);
                self.push_line_end();
            }
            self.cursor.line += 1;
            return Ok(true);
        }

        let indent = indent_of(&raw);
        self.assign_thresholds(indent);
        if let CloseOutcome::Moved = self.close_by_indent(indent, &raw)? {
            return Ok(true);
        }

        self.cursor.rest = Some(raw);
        self.cursor.indent = indent;
        self.cursor.count = 0;
        self.pending_ws.clear();
        self.emitted_this_line = false;
        self.had_directive = false;
        self.tail_suppressed = false;
        Ok(true)
    }

    /// Frames opened since the last line entry get their threshold from
    /// this line, clamped so thresholds never decrease with depth.
    fn assign_thresholds(&mut self, indent: usize) {
        let mut floor = 0;
        for level in self.levels.iter_mut() {
            match level.threshold {
                Some(t) => floor = floor.max(t),
                None => {
                    let t = indent.max(floor);
                    level.threshold = Some(t);
                    floor = t;
                }
            }
        }
    }

    /// Close frames whose threshold the new line's indentation undercuts.
    fn close_by_indent(&mut self, indent: usize, raw: &str) -> WeftResult<CloseOutcome> {
        while self.levels.len() > 1 {
            let level = self.levels.last().expect("stack never empty");
            let threshold = level.threshold.unwrap_or(0);
            if indent >= threshold {
                break;
            }
            // A line that opens with the frame's own continuation or
            // close directive handles the frame itself.
            if line_continues_frame(level, raw) {
                break;
            }
            if let CloseOutcome::Moved = self.close_innermost()? {
                return Ok(CloseOutcome::Moved);
            }
        }
        Ok(CloseOutcome::Popped)
    }

    /// End of the current page's line list: a virtual dedent to column
    /// zero. Frames that cannot close by indentation are unclosed blocks.
    fn handle_end_of_page(&mut self) -> WeftResult<bool> {
        loop {
            if self.levels.len() == 1 {
                return Ok(false);
            }
            let level = self.levels.last().expect("stack never empty");
            match level.threshold {
                Some(t) if t > 0 => {}
                _ => {
                    return Err(WeftError::Structural {
                        message: format!(
                            "block opened here is never closed: {}",
                            describe_kind(&level.kind)
                        ),
                        at: level.opened_at.clone(),
                    });
                }
            }
            if let CloseOutcome::Moved = self.close_innermost()? {
                return Ok(true);
            }
        }
    }

    /// Close the innermost frame as if by dedent. Loop frames with
    /// remaining elements rewind instead of closing; call frames return
    /// control to their caller.
    fn close_innermost(&mut self) -> WeftResult<CloseOutcome> {
        enum Action {
            Rewind,
            Return,
            Splice,
            Pop,
        }
        let action = match &self.levels.last().expect("stack never empty").kind {
            LevelKind::Each => Action::Rewind,
            LevelKind::StencilCall => Action::Return,
            LevelKind::Block { splice: true, .. } => Action::Splice,
            _ => Action::Pop,
        };
        match action {
            Action::Rewind => {
                if self.rewind_each()? {
                    return Ok(CloseOutcome::Moved);
                }
                self.levels.pop();
                Ok(CloseOutcome::Popped)
            }
            Action::Return => {
                self.return_from_stencil();
                Ok(CloseOutcome::Moved)
            }
            Action::Splice => {
                self.return_from_splice();
                Ok(CloseOutcome::Moved)
            }
            Action::Pop => {
                self.levels.pop();
                Ok(CloseOutcome::Popped)
            }
        }
    }

    /// Advance the innermost Each frame. Returns `true` when the cursor
    /// was rewound to the loop-body bookmark for another iteration.
    fn rewind_each(&mut self) -> WeftResult<bool> {
        let level = self.levels.last_mut().expect("stack never empty");
        let Some(state) = level.each.as_mut() else {
            return Ok(false);
        };
        if self.session.mode == Mode::Check || !state.has_more() {
            return Ok(false);
        }
        state.index += 1;
        let element = state.items[state.index].clone();
        let elem_shape = state.elem_shape.clone();
        let body = state.body.clone();
        level.bound = Some(TypedValue::new(element, elem_shape));
        let page = Arc::clone(&self.cursor.page);
        self.jump(Cursor {
            page,
            line: body.line,
            rest: Some(body.rest),
            count: body.count,
            indent: body.indent,
        });
        Ok(true)
    }

    /// Teleport the cursor. Per-line output state belongs to the physical
    /// line being consumed, so it starts fresh at the landing point; the
    /// landing segment always counts as directive-bearing.
    fn jump(&mut self, cursor: Cursor) {
        self.cursor = cursor;
        self.pending_ws.clear();
        self.emitted_this_line = false;
        self.had_directive = true;
        self.tail_suppressed = false;
    }

    /// Pop a finished stencil call and resume its caller.
    fn return_from_stencil(&mut self) {
        self.levels.pop();
        let record = self.calls.pop().expect("stencil frame without call record");
        debug_assert_eq!(record.levels_base, self.levels.len());
        debug_assert!(matches!(record.kind, CallKind::Stencil { .. }));
        self.jump(record.resume_after_nested.unwrap_or(record.return_cursor));
    }

    /// Pop a finished nested-content splice and resume the callee. The
    /// enclosing stencil call remembers where the caller's content ended.
    fn return_from_splice(&mut self) {
        self.levels.pop();
        let record = self.calls.pop().expect("splice frame without call record");
        debug_assert!(matches!(record.kind, CallKind::Splice));
        let end_of_content = self.cursor.clone();
        if let Some(owner) = self.calls.last_mut() {
            owner.resume_after_nested = Some(end_of_content);
        }
        self.jump(record.return_cursor);
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    fn suppressed(&self) -> bool {
        self.levels.iter().any(|l| l.skip)
    }

    fn inert(&self) -> bool {
        self.levels.iter().any(|l| l.inert)
    }

    /// Emit literal text subject to suppression. Whitespace at the start
    /// of a line is withheld until the line produces real output, so a
    /// line holding only an indented block directive leaves no residue.
    fn emit_literal(&mut self, text: &str) {
        if text.is_empty() || self.suppressed() || self.tail_suppressed {
            return;
        }
        if !self.emitted_this_line && text.trim().is_empty() {
            self.pending_ws.push_str(text);
            return;
        }
        self.emit(text);
    }

    /// Emit rendered output (a `@Get` value or separator text).
    fn emit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(out) = self.out.as_deref_mut() {
            if !self.pending_ws.is_empty() {
                out.push_str(&self.pending_ws);
                self.pending_ws.clear();
            }
            out.push_str(text);
        }
        self.emitted_this_line = true;
    }

    /// Raw output without the pending-whitespace dance (blank lines).
    fn push_out(&mut self, text: &str) {
        if let Some(out) = self.out.as_deref_mut() {
            out.push_str(text);
        }
    }

    /// Emit the newline ending the current line, unless the source did
    /// not end with one and this is its final line.
    fn push_line_end(&mut self) {
        let last = self.cursor.line + 1 >= self.cursor.page.lines.len();
        if last && !self.cursor.page.ends_with_newline {
            return;
        }
        self.push_out("\n");
    }

    /// Wrap up the current physical line after its remainder is consumed.
    fn finish_line(&mut self) {
        let wants_newline = self.emitted_this_line || !self.had_directive;
        if wants_newline && !self.suppressed() {
            self.push_line_end();
        }
        self.pending_ws.clear();
        self.tail_suppressed = false;
        self.cursor.line += 1;
        self.cursor.rest = None;
    }

    // ------------------------------------------------------------------
    // Directive dispatch
    // ------------------------------------------------------------------

    /// One matcher step over the current line remainder.
    fn step(&mut self) -> WeftResult<()> {
        let rest = self.cursor.rest.take().expect("step without remainder");
        let m = match_directive(&rest);
        self.emit_literal(&m.literal);
        match m.directive {
            None => {
                self.finish_line();
                Ok(())
            }
            Some(directive) => {
                self.had_directive = true;
                self.cursor.count += 1;
                self.cursor.rest = Some(m.rest.to_string());
                self.dispatch(directive)
            }
        }
    }

    fn dispatch(&mut self, d: Directive) -> WeftResult<()> {
        if self.inert() {
            return self.dispatch_inert(&d);
        }
        match d.name.as_str() {
            "Bind" => self.on_bind(&d),
            "If" => self.on_cond(&d, false),
            "Unless" => self.on_cond(&d, true),
            "ElseIf" => self.on_else_if(&d),
            "Else" => self.on_else(&d),
            "Each" => self.on_each(&d),
            "Separator" => self.on_separator(&d),
            "Get" => self.on_get(&d),
            "Escape" => self.on_escape(&d),
            "Import" => self.on_import(&d),
            "Stencil" => self.on_stencil(&d),
            "Nested" => self.on_nested(&d),
            _ => self.on_invoke(&d),
        }
    }

    /// Inside a declaration body during render, directives are tracked
    /// for balance only: opens push opaque blocks, closes pop them.
    fn dispatch_inert(&mut self, d: &Directive) -> WeftResult<()> {
        const OPENERS: [&str; 5] = ["Bind", "If", "Unless", "Each", "Stencil"];
        if d.is_close() {
            let matches_frame = {
                let level = self.levels.last().expect("stack never empty");
                close_matches(&level.kind, &d.name)
            };
            if matches_frame {
                self.levels.pop();
            }
            // Close-form names that match no frame are stencil invocations
            // inside the declaration body; nothing to do while inert.
            Ok(())
        } else if OPENERS.contains(&d.name.as_str()) {
            self.levels.push(Level::new(
                LevelKind::Block {
                    name: d.name.clone(),
                    splice: false,
                },
                self.cursor.page_ref(),
            ));
            Ok(())
        } else {
            Ok(())
        }
    }

    fn on_bind(&mut self, d: &Directive) -> WeftResult<()> {
        let Some(type_ref) = d.payload() else {
            return self.close_frame("Bind");
        };
        let type_name = self
            .lookup_alias(type_ref)
            .unwrap_or_else(|| type_ref.to_string());
        let Some(record) = self.session.engine.type_shape(&type_name) else {
            return Err(WeftError::Type {
                message: format!("@Bind: unknown type `{type_name}`"),
                at: self.cursor.page_ref(),
            });
        };
        let shape = Shape::Record(record);

        let mut level = Level::new(LevelKind::Bind, self.cursor.page_ref());
        level.bound = if self.session.mode == Mode::Render && !self.suppressed() {
            let provider = self.session.provider.ok_or_else(|| WeftError::Instance {
                type_name: type_name.clone(),
                message: "no instance provider supplied".to_string(),
                at: self.cursor.page_ref(),
            })?;
            let instance =
                provider
                    .provide(&type_name)
                    .map_err(|e| WeftError::Instance {
                        type_name: type_name.clone(),
                        message: e.message,
                        at: self.cursor.page_ref(),
                    })?;
            Some(TypedValue::new(instance, shape))
        } else {
            // Static mode (and suppressed bodies) record the type only.
            Some(TypedValue::unbound(shape))
        };
        self.levels.push(level);
        Ok(())
    }

    fn on_cond(&mut self, d: &Directive, negated: bool) -> WeftResult<()> {
        let Some(expr) = d.payload() else {
            return self.close_frame(&d.name);
        };
        let resolved = self.resolve_in_frames(expr)?;
        let mut level = Level::new(LevelKind::Cond, self.cursor.page_ref());
        if self.session.mode == Mode::Render {
            let truth = resolved.map(|v| v.is_truthy()).unwrap_or(false) != negated;
            level.skip = !truth;
            level.matched = truth;
        }
        self.levels.push(level);
        Ok(())
    }

    fn on_else_if(&mut self, d: &Directive) -> WeftResult<()> {
        let Some(expr) = d.payload() else {
            return Err(self.structural("@ElseIf requires an expression"));
        };
        if !matches!(self.innermost_kind(), LevelKind::Cond) {
            return Err(self.structural("@ElseIf outside an open @If/@Unless block"));
        }
        let resolved = self.resolve_in_frames(expr)?;
        if self.session.mode == Mode::Render {
            let level = self.levels.last_mut().expect("stack never empty");
            if level.matched {
                level.skip = true;
            } else {
                let truth = resolved.map(|v| v.is_truthy()).unwrap_or(false);
                level.skip = !truth;
                level.matched = truth;
            }
        }
        Ok(())
    }

    fn on_else(&mut self, d: &Directive) -> WeftResult<()> {
        if !d.is_close() {
            return Err(self.structural("@Else takes no expression"));
        }
        if !matches!(self.innermost_kind(), LevelKind::Cond) {
            return Err(self.structural("@Else outside an open @If/@Unless block"));
        }
        if self.session.mode == Mode::Render {
            let level = self.levels.last_mut().expect("stack never empty");
            level.skip = level.matched;
            level.matched = true;
        }
        Ok(())
    }

    fn on_each(&mut self, d: &Directive) -> WeftResult<()> {
        let Some(expr) = d.payload() else {
            return self.close_each();
        };
        let resolved = self.resolve_in_frames(expr)?;
        let mut level = Level::new(LevelKind::Each, self.cursor.page_ref());
        let (elem_shape, value) = match resolved {
            Some(tv) => {
                let elem = match &tv.shape {
                    Shape::Sequence(elem) => (**elem).clone(),
                    Shape::Mapping(value_shape) => (**value_shape).clone(),
                    other => {
                        return Err(WeftError::Type {
                            message: format!(
                                "@Each needs a collection, `{expr}` is a {other}"
                            ),
                            at: self.cursor.page_ref(),
                        });
                    }
                };
                (elem, tv.value)
            }
            // The expression itself was deferred, so the element shape is
            // unknowable until render time; body paths stay deferred too.
            None => {
                level.deferred = true;
                (Shape::Scalar, None)
            }
        };

        if self.session.mode == Mode::Check {
            // Type-check the body once against an absent representative
            // element instead of iterating.
            if !level.deferred {
                level.bound = Some(TypedValue::unbound(elem_shape));
            }
            self.levels.push(level);
            return Ok(());
        }

        let items: Vec<Value> = if self.suppressed() {
            Vec::new()
        } else {
            match value {
                Some(Value::Seq(items)) => items,
                Some(Value::Map(entries)) => entries.into_values().collect(),
                _ => Vec::new(),
            }
        };
        // The loop-body bookmark is captured now, before any further
        // directive on this line executes.
        let body = Mark {
            line: self.cursor.line,
            rest: self.cursor.rest.clone().unwrap_or_default(),
            count: self.cursor.count,
            indent: self.cursor.indent,
        };
        if items.is_empty() {
            level.skip = true;
        } else {
            level.bound = Some(TypedValue::new(items[0].clone(), elem_shape.clone()));
        }
        level.each = Some(EachState {
            items,
            index: 0,
            body,
            elem_shape,
        });
        self.levels.push(level);
        Ok(())
    }

    /// Explicit `@Each()` close: advance the cursor element or pop.
    fn close_each(&mut self) -> WeftResult<()> {
        if !matches!(self.innermost_kind(), LevelKind::Each) {
            return Err(self.structural("unmatched @Each() close"));
        }
        if self.rewind_each()? {
            return Ok(());
        }
        self.levels.pop();
        Ok(())
    }

    fn on_separator(&mut self, d: &Directive) -> WeftResult<()> {
        if !matches!(self.innermost_kind(), LevelKind::Each) {
            return Err(self.structural("@Separator outside an @Each block"));
        }
        if self.session.mode == Mode::Check {
            return Ok(());
        }
        let has_more = self
            .levels
            .last()
            .and_then(|l| l.each.as_ref())
            .is_some_and(EachState::has_more);
        match &d.arg {
            // Separator text keeps its spacing; emit only between elements.
            Arg::Payload(text) if !text.is_empty() => {
                if has_more && !self.suppressed() && !self.tail_suppressed {
                    self.emit(text);
                }
            }
            // No payload: the rest of the line appears only between elements.
            _ => {
                if !has_more {
                    self.tail_suppressed = true;
                }
            }
        }
        Ok(())
    }

    fn on_get(&mut self, d: &Directive) -> WeftResult<()> {
        let Some(payload) = d.payload() else {
            return Err(self.structural("@Get requires a path"));
        };
        let (escaper_name, expr) = match payload.split_once("=>") {
            Some((name, path)) => (name.trim(), path.trim()),
            None => (DEFAULT_ESCAPER, payload),
        };

        if self.session.mode == Mode::Check {
            self.resolve_in_frames(expr)?;
            if self.find_escaper(escaper_name).is_none() {
                return Err(self.structural(&format!("no escaper named `{escaper_name}` in scope")));
            }
            return Ok(());
        }
        if self.suppressed() || self.tail_suppressed {
            return Ok(());
        }

        let resolved = self.resolve_in_frames(expr)?;
        let value = resolved.and_then(|tv| tv.value).unwrap_or(Value::Null);
        let escaper = self
            .find_escaper(escaper_name)
            .ok_or_else(|| self.structural(&format!("no escaper named `{escaper_name}` in scope")))?;
        let text = escaper.escape(&self.session.engine.display(&value));
        self.emit(&text);
        Ok(())
    }

    fn on_escape(&mut self, d: &Directive) -> WeftResult<()> {
        let Some(payload) = d.payload() else {
            return Err(self.structural("@Escape requires a source"));
        };
        let (name, source) = match payload.split_once("=>") {
            Some((name, source)) => (name.trim().to_string(), source.trim()),
            None => (DEFAULT_ESCAPER.to_string(), payload),
        };
        if self.suppressed() {
            return Ok(());
        }

        // Source resolution order: imported alias, a loadable escaper
        // implementation, then a fetched substitution-table resource.
        let target = self
            .lookup_alias(source)
            .unwrap_or_else(|| source.to_string());
        let escaper: Arc<dyn Escaper> = match self.session.engine.escaper_impl(&target) {
            Some(found) => found,
            None => {
                let location = self
                    .session
                    .engine
                    .resolve_location(&target, Some(&self.cursor.page.location));
                let table = self.session.engine.fetch(&location)?;
                let parsed = TableEscaper::parse(&table).map_err(|e| WeftError::Resource {
                    location,
                    message: e.to_string(),
                })?;
                Arc::new(parsed)
            }
        };
        self.levels
            .last_mut()
            .expect("stack never empty")
            .escapers
            .insert(name, escaper);
        Ok(())
    }

    fn on_import(&mut self, d: &Directive) -> WeftResult<()> {
        let Some(payload) = d.payload() else {
            return Err(self.structural("@Import requires `alias => location`"));
        };
        let Some((alias, location)) = payload.split_once("=>") else {
            return Err(self.structural("@Import requires `alias => location`"));
        };
        let (alias, location) = (alias.trim(), location.trim());
        if alias.is_empty() || location.is_empty() {
            return Err(self.structural("@Import requires `alias => location`"));
        }
        if self.suppressed() {
            return Ok(());
        }

        let page = self
            .session
            .engine
            .import_page(self.session, location, &self.cursor.page.location)?;
        let level = self.levels.last_mut().expect("stack never empty");
        for (name, mark) in &page.stencils {
            level.stencils.insert(
                format!("{alias}.{name}"),
                Bookmark {
                    page: Arc::clone(&page),
                    mark: mark.clone(),
                },
            );
        }
        level
            .aliases
            .insert(alias.to_string(), location.to_string());
        Ok(())
    }

    fn on_stencil(&mut self, d: &Directive) -> WeftResult<()> {
        match d.payload() {
            Some(_name) => {
                // The page-wide stencil table was filled by the compile
                // scan; here the declaration only opens its body frame.
                let mut level = Level::new(LevelKind::StencilDecl, self.cursor.page_ref());
                if self.session.mode == Mode::Render {
                    level.skip = true;
                    level.inert = true;
                }
                self.levels.push(level);
                Ok(())
            }
            None => self.close_frame("Stencil"),
        }
    }

    fn on_nested(&mut self, d: &Directive) -> WeftResult<()> {
        let Some(block_name) = d.payload() else {
            return Err(self.structural("@Nested requires a block name"));
        };
        if self.session.mode == Mode::Check {
            return Ok(());
        }
        let Some(record) = self.calls.last() else {
            return Err(self.structural("@Nested outside an invoked stencil body"));
        };
        if !matches!(record.kind, CallKind::Stencil { .. }) {
            return Err(self.structural("@Nested outside an invoked stencil body"));
        }
        let start = record
            .nested_start
            .clone()
            .expect("stencil call without nested start");

        let return_cursor = self.cursor.clone();
        self.calls.push(CallRecord {
            kind: CallKind::Splice,
            return_cursor,
            nested_start: None,
            resume_after_nested: None,
            levels_base: self.levels.len(),
        });
        self.levels.push(Level::new(
            LevelKind::Block {
                name: block_name.to_string(),
                splice: true,
            },
            self.cursor.page_ref(),
        ));
        self.jump(start);
        Ok(())
    }

    /// A directive whose name is no keyword: a stencil invocation.
    fn on_invoke(&mut self, d: &Directive) -> WeftResult<()> {
        // An explicit close may target an open splice block first.
        if d.is_close() {
            if let LevelKind::Block { name, splice } = self.innermost_kind() {
                if *name == d.name {
                    if *splice {
                        self.return_from_splice();
                    } else {
                        self.levels.pop();
                    }
                    return Ok(());
                }
            }
        }
        if d.payload().is_some() {
            return Err(self.structural(&format!(
                "`@{}` is not a directive and stencil invocations take no payload",
                d.name
            )));
        }

        let Some(bookmark) = self.find_stencil(&d.name) else {
            return Err(self.structural(&format!("stencil `{}` not found", d.name)));
        };
        if self.session.mode == Mode::Check {
            // The body was validated where it was declared.
            return Ok(());
        }
        if self.suppressed() {
            return Ok(());
        }
        let depth = self
            .calls
            .iter()
            .filter(|c| matches!(c.kind, CallKind::Stencil { .. }))
            .count();
        if depth >= MAX_CALL_DEPTH {
            return Err(WeftError::RecursiveStencil {
                name: d.name.clone(),
                max_depth: MAX_CALL_DEPTH,
                at: self.cursor.page_ref(),
            });
        }

        trace!(stencil = %d.name, "invoking stencil");
        let return_cursor = self.cursor.clone();
        self.calls.push(CallRecord {
            kind: CallKind::Stencil {
                name: d.name.clone(),
            },
            return_cursor: return_cursor.clone(),
            nested_start: Some(return_cursor),
            resume_after_nested: None,
            levels_base: self.levels.len(),
        });
        self.levels
            .push(Level::new(LevelKind::StencilCall, self.cursor.page_ref()));
        self.jump(Cursor::from_bookmark(&bookmark));
        Ok(())
    }

    /// Handle an explicit close directive against the innermost frame.
    fn close_frame(&mut self, name: &str) -> WeftResult<()> {
        let (matches_frame, is_call) = {
            let level = self.levels.last().expect("stack never empty");
            (
                self.levels.len() > 1 && close_matches(&level.kind, name),
                matches!(level.kind, LevelKind::StencilCall),
            )
        };
        if !matches_frame {
            return Err(self.structural(&format!("unmatched @{name}() close")));
        }
        if is_call {
            self.return_from_stencil();
        } else {
            self.levels.pop();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    fn innermost_kind(&self) -> &LevelKind {
        &self.levels.last().expect("stack never empty").kind
    }

    /// Resolve a path against the nearest frame whose bound context can
    /// take its first segment. `Ok(None)` means resolution was deferred:
    /// a context-free static walk (e.g. a stencil body checked at its
    /// declaration site).
    fn resolve_in_frames(&self, expr: &str) -> WeftResult<Option<TypedValue>> {
        let segs = segments(expr);
        let bound: Vec<&TypedValue> = self
            .levels
            .iter()
            .rev()
            .filter_map(|l| l.bound.as_ref())
            .collect();

        if segs.is_empty() {
            // `.` denotes the nearest bound context itself.
            if self.session.mode == Mode::Check && self.has_deferred_context() {
                return Ok(None);
            }
            return match bound.first() {
                Some(context) => Ok(Some((*context).clone())),
                None if self.session.mode == Mode::Check => Ok(None),
                None => Err(WeftError::Path {
                    expression: expr.to_string(),
                    detail: "no bound context in scope".to_string(),
                    at: self.cursor.page_ref(),
                }),
            };
        }

        for context in bound.iter().copied() {
            if path::admits(&context.shape, segs[0]) {
                return path::resolve(expr, context)
                    .map(Some)
                    .map_err(|e| WeftError::Path {
                        expression: expr.to_string(),
                        detail: e.to_string(),
                        at: self.cursor.page_ref(),
                    });
            }
        }

        // No bound frame admits the path. When an enclosing context is
        // unknown to the static walk the path may still resolve against
        // it at render time, so judgment is deferred rather than fatal.
        if self.session.mode == Mode::Check && self.has_deferred_context() {
            return Ok(None);
        }

        match bound.first().copied() {
            // Report against the innermost bound context for a precise
            // "unknown property" message.
            Some(innermost) => {
                let err = path::resolve(expr, innermost)
                    .err()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unresolvable".to_string());
                Err(WeftError::Path {
                    expression: expr.to_string(),
                    detail: err,
                    at: self.cursor.page_ref(),
                })
            }
            None if self.session.mode == Mode::Check => Ok(None),
            None => Err(WeftError::Path {
                expression: expr.to_string(),
                detail: "no bound context in scope".to_string(),
                at: self.cursor.page_ref(),
            }),
        }
    }

    /// Whether any enclosing frame's render-time context is unknown to
    /// the static walk: a deferred `@Each`, or a stencil declaration body
    /// (its invokers' contexts cannot be known at the declaration site).
    fn has_deferred_context(&self) -> bool {
        self.levels
            .iter()
            .any(|l| l.deferred || matches!(l.kind, LevelKind::StencilDecl))
    }

    /// Escaper lookup: innermost frame first, then the engine's named
    /// registry (which holds the built-ins).
    fn find_escaper(&self, name: &str) -> Option<Arc<dyn Escaper>> {
        self.levels
            .iter()
            .rev()
            .find_map(|l| l.escapers.get(name).cloned())
            .or_else(|| self.session.engine.escaper_impl(name))
    }

    /// Stencil lookup: frame registries innermost first (imports), then
    /// the current page's page-wide table.
    fn find_stencil(&self, name: &str) -> Option<Bookmark> {
        self.levels
            .iter()
            .rev()
            .find_map(|l| l.stencils.get(name).cloned())
            .or_else(|| self.cursor.page.stencil(name))
    }

    fn lookup_alias(&self, name: &str) -> Option<String> {
        self.levels
            .iter()
            .rev()
            .find_map(|l| l.aliases.get(name).cloned())
    }

    fn structural(&self, message: &str) -> WeftError {
        WeftError::Structural {
            message: message.to_string(),
            at: self.cursor.page_ref(),
        }
    }
}

/// Whether a close directive named `name` closes a frame of `kind`.
fn close_matches(kind: &LevelKind, name: &str) -> bool {
    match kind {
        LevelKind::Cond => name == "If" || name == "Unless",
        LevelKind::Each => name == "Each",
        LevelKind::Bind => name == "Bind",
        LevelKind::StencilDecl | LevelKind::StencilCall => name == "Stencil",
        LevelKind::Block { name: n, .. } => n == name,
        LevelKind::Root => false,
    }
}

/// Whether the first directive on `raw` is a continuation (`@ElseIf`,
/// `@Else`) or explicit close of `level`, in which case dedent must not
/// close the frame before the directive can handle it.
fn line_continues_frame(level: &Level, raw: &str) -> bool {
    let m = match_directive(raw.trim_start());
    if !m.literal.is_empty() {
        return false;
    }
    let Some(d) = m.directive else {
        return false;
    };
    if matches!(level.kind, LevelKind::Cond) && (d.name == "ElseIf" || d.name == "Else") {
        return true;
    }
    d.is_close() && close_matches(&level.kind, &d.name)
}

fn describe_kind(kind: &LevelKind) -> &'static str {
    match kind {
        LevelKind::Root => "page",
        LevelKind::Bind => "@Bind block",
        LevelKind::Cond => "@If/@Unless block",
        LevelKind::Each => "@Each block",
        LevelKind::StencilDecl => "@Stencil declaration",
        LevelKind::StencilCall => "stencil body",
        LevelKind::Block { .. } => "nested block",
    }
}
