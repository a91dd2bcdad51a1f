/*
 * integration_tests.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! End-to-end rendering and static-checking tests.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use weft::{
    Engine, MapProvider, MapRecord, MemoryLoader, RecordShape, Shape, Value, WeftError, WeftResult,
};

fn engine() -> Engine {
    Engine::with_loader(Arc::new(MemoryLoader::new()))
}

fn engine_with(sources: &[(&str, &str)]) -> Engine {
    Engine::with_loader(Arc::new(MemoryLoader::with_sources(sources.iter().copied())))
}

fn render(source: &str, context: serde_json::Value) -> WeftResult<String> {
    engine().render_str_with_context("page.wft", source, Value::from(context))
}

// ----------------------------------------------------------------------
// Literals
// ----------------------------------------------------------------------

#[test]
fn test_directive_free_template_renders_verbatim() {
    let source = "line one\n  line two\n\nlast\n";
    assert_eq!(render(source, json!({})).unwrap(), source);
}

#[test]
fn test_missing_trailing_newline_is_preserved() {
    assert_eq!(render("no newline", json!({})).unwrap(), "no newline");
}

#[test]
fn test_escaped_at_sign() {
    let out = render("email: ada@@example.com\n", json!({})).unwrap();
    assert_eq!(out, "email: ada@example.com\n");
}

#[test]
fn test_lone_at_is_literal() {
    assert_eq!(render("2 @ 3 = 6\n", json!({})).unwrap(), "2 @ 3 = 6\n");
}

// ----------------------------------------------------------------------
// Interpolation
// ----------------------------------------------------------------------

#[test]
fn test_get_with_explicit_terminator() {
    let out = render("Hello @Get(.firstName)!", json!({"firstName": "Ada"})).unwrap();
    assert_eq!(out, "Hello Ada");
}

#[test]
fn test_get_nested_path() {
    let out = render(
        "@Get(.person.address.city)\n",
        json!({"person": {"address": {"city": "London"}}}),
    )
    .unwrap();
    assert_eq!(out, "London\n");
}

#[test]
fn test_unknown_property_fails_before_rendering() {
    let err = render("@Get(.nope)\n", json!({"firstName": "Ada"})).unwrap_err();
    assert!(matches!(err, WeftError::Path { .. }));
    assert!(err.to_string().contains("nope"));
}

#[test]
fn test_null_renders_as_empty() {
    assert_eq!(render("[@Get(.x)]\n", json!({"x": null})).unwrap(), "[]\n");
}

#[test]
fn test_html_escaper() {
    let out = render("@Get(html => .title)\n", json!({"title": "<b>&</b>"})).unwrap();
    assert_eq!(out, "&lt;b&gt;&amp;&lt;/b&gt;\n");
}

#[test]
fn test_unknown_escaper_fails_statically() {
    let err = engine()
        .check_str("t", "@Get(ghost => .x)\n")
        .unwrap_err();
    assert!(matches!(err, WeftError::Structural { .. }));
}

// ----------------------------------------------------------------------
// Conditionals
// ----------------------------------------------------------------------

#[test]
fn test_if_else_renders_exactly_one_branch() {
    let source = "@If(flag)\n  yes\n@Else!\n  no\n@If()\n";
    assert_eq!(render(source, json!({"flag": true})).unwrap(), "  yes\n");
    assert_eq!(render(source, json!({"flag": false})).unwrap(), "  no\n");
}

#[test]
fn test_else_if_chain() {
    let source = "@If(a)\n  A\n@ElseIf(b)\n  B\n@Else!\n  C\n@If()\n";
    assert_eq!(
        render(source, json!({"a": false, "b": true})).unwrap(),
        "  B\n"
    );
    assert_eq!(
        render(source, json!({"a": false, "b": false})).unwrap(),
        "  C\n"
    );
    // A matching branch wins even when later conditions also hold.
    assert_eq!(
        render(source, json!({"a": true, "b": true})).unwrap(),
        "  A\n"
    );
}

#[test]
fn test_unless_negates() {
    let source = "@Unless(x)fallback@Unless()\n";
    assert_eq!(render(source, json!({"x": null})).unwrap(), "fallback\n");
    assert_eq!(render(source, json!({"x": true})).unwrap(), "");
}

#[test]
fn test_nested_conditionals_on_one_line() {
    let out = render(
        "@If(a)X@If(b)Y@If()Z@If()W",
        json!({"a": true, "b": false}),
    )
    .unwrap();
    assert_eq!(out, "XZW");
}

#[test]
fn test_dedent_closes_block() {
    let source = "intro\n@If(flag)\n  inside\noutro\n";
    assert_eq!(
        render(source, json!({"flag": true})).unwrap(),
        "intro\n  inside\noutro\n"
    );
    assert_eq!(
        render(source, json!({"flag": false})).unwrap(),
        "intro\noutro\n"
    );
}

#[test]
fn test_truthiness_follows_value_kind() {
    let source = "@If(v)yes@Else!no@If()\n";
    assert_eq!(render(source, json!({"v": []})).unwrap(), "no\n");
    assert_eq!(render(source, json!({"v": [1]})).unwrap(), "yes\n");
    assert_eq!(render(source, json!({"v": ""})).unwrap(), "yes\n");
    assert_eq!(render(source, json!({"v": 0})).unwrap(), "yes\n");
    assert_eq!(render(source, json!({"v": null})).unwrap(), "no\n");
}

#[test]
fn test_else_outside_conditional_is_structural() {
    let err = engine().check_str("t", "text@Else!\n").unwrap_err();
    assert!(matches!(err, WeftError::Structural { .. }));
}

// ----------------------------------------------------------------------
// Iteration
// ----------------------------------------------------------------------

#[test]
fn test_each_single_line_with_separator() {
    let out = render(
        "@Each(names)@Get(.)@Separator(, )@Each()",
        json!({"names": ["A", "B", "C"]}),
    )
    .unwrap();
    assert_eq!(out, "A, B, C");
}

#[test]
fn test_each_multiline_body() {
    let source = "@Each(names)\n  - @Get(.)\n@Each()\n";
    let out = render(source, json!({"names": ["A", "B"]})).unwrap();
    assert_eq!(out, "  - A\n  - B\n");
}

#[test]
fn test_each_closed_by_dedent() {
    let source = "@Each(xs)\n  @Get(.)\nend\n";
    let out = render(source, json!({"xs": ["A", "B"]})).unwrap();
    assert_eq!(out, "  A\n  B\nend\n");
}

#[test]
fn test_each_closed_by_end_of_page() {
    let source = "@Each(xs)\n  @Get(.)\n";
    let out = render(source, json!({"xs": ["A", "B"]})).unwrap();
    assert_eq!(out, "  A\n  B\n");
}

#[test]
fn test_each_over_empty_collection_emits_nothing() {
    let source = "before\n@Each(items)\n  @Get(.)@Separator(, )\n@Each()\nafter\n";
    let out = render(source, json!({"items": []})).unwrap();
    assert_eq!(out, "before\nafter\n");
}

#[test]
fn test_separator_without_payload_drops_line_tail_on_last_element() {
    let source = "@Each(names)\n  @Get(.)@Separator!,\n@Each()\n";
    let out = render(source, json!({"names": ["A", "B"]})).unwrap();
    assert_eq!(out, "  A,\n  B\n");
}

#[test]
fn test_each_body_sees_element_fields() {
    let source = "@Each(people)\n@Get(.name): @Get(.age)\n@Each()\n";
    let out = render(
        source,
        json!({"people": [
            {"name": "Ada", "age": 36},
            {"name": "Alan", "age": 41},
        ]}),
    )
    .unwrap();
    assert_eq!(out, "Ada: 36\nAlan: 41\n");
}

#[test]
fn test_each_over_records_renders_through_the_cache() {
    // Pages loaded by location are checked without a root context; field
    // access under the loop must wait for render-time data instead of
    // failing the static walk.
    let engine = engine_with(&[("list.wft", "@Each(people)\n  @Get(.name)\n@Each()\n")]);
    let out = engine
        .render_with_context(
            "list.wft",
            Value::from(json!({"people": [{"name": "Ada"}, {"name": "Alan"}]})),
        )
        .unwrap();
    assert_eq!(out, "  Ada\n  Alan\n");
}

#[test]
fn test_each_over_scalar_is_type_error() {
    let err = render("@Each(x)@Each()\n", json!({"x": 3})).unwrap_err();
    assert!(matches!(err, WeftError::Type { .. }));
}

#[test]
fn test_separator_outside_each_is_structural() {
    let err = engine().check_str("t", "@Separator(, )\n").unwrap_err();
    assert!(matches!(err, WeftError::Structural { .. }));
}

// ----------------------------------------------------------------------
// Bind and typed contexts
// ----------------------------------------------------------------------

#[test]
fn test_bind_resolves_through_provider() {
    let mut engine = engine();
    engine.register_type(
        RecordShape::new("report")
            .property("title", Shape::Scalar)
            .property("labels", Shape::Mapping(Box::new(Shape::Scalar))),
    );
    let mut provider = MapProvider::new();
    provider.add(
        "report",
        MapRecord::new("report")
            .field("title", Value::Str("Q3".into()))
            .field("labels", {
                let mut labels = std::collections::BTreeMap::new();
                labels.insert("en".to_string(), Value::Str("Quarter".into()));
                Value::Map(labels)
            })
            .into_value(),
    );

    let source = "@Bind(report)@Get(.title): @Get(.labels.en)@Bind()\n";
    let out = engine.render_str("t", source, &provider).unwrap();
    assert_eq!(out, "Q3: Quarter\n");
}

#[test]
fn test_mapping_absent_key_reads_as_null() {
    let mut engine = engine();
    engine.register_type(
        RecordShape::new("page").property("labels", Shape::Mapping(Box::new(Shape::Scalar))),
    );
    let mut provider = MapProvider::new();
    provider.add(
        "page",
        MapRecord::new("page")
            .field("labels", Value::Map(Default::default()))
            .into_value(),
    );

    let out = engine
        .render_str("t", "@Bind(page)[@Get(.labels.missing)]@Bind()\n", &provider)
        .unwrap();
    assert_eq!(out, "[]\n");
}

#[test]
fn test_check_never_calls_the_provider() {
    let mut engine = engine();
    engine.register_type(RecordShape::new("cfg").property("x", Shape::Scalar));
    // Static validation with no provider at all.
    engine
        .check_str("t", "@Bind(cfg)@Get(.x)@Bind()\n")
        .unwrap();
}

#[test]
fn test_inner_bind_shadows_outer() {
    let mut engine = engine();
    engine.register_type(RecordShape::new("outer").property("name", Shape::Scalar));
    engine.register_type(RecordShape::new("inner").property("name", Shape::Scalar));
    let mut provider = MapProvider::new();
    provider.add(
        "outer",
        MapRecord::new("outer")
            .field("name", Value::Str("O".into()))
            .into_value(),
    );
    provider.add(
        "inner",
        MapRecord::new("inner")
            .field("name", Value::Str("I".into()))
            .into_value(),
    );

    let source = "@Bind(outer)@Get(.name)@Bind(inner)@Get(.name)@Bind()@Get(.name)@Bind()\n";
    let out = engine.render_str("t", source, &provider).unwrap();
    assert_eq!(out, "OIO\n");
}

// ----------------------------------------------------------------------
// Stencils
// ----------------------------------------------------------------------

#[test]
fn test_stencil_declaration_emits_nothing_and_invocation_renders() {
    let source = "@Stencil(card)\n  [@Get(.)]\n@Stencil!\n@card!\n";
    let out = render(source, json!("X")).unwrap();
    assert_eq!(out, "  [X]\n");
}

#[test]
fn test_stencil_table_is_page_wide() {
    // Invocation before the declaration in page order.
    let source = "@hello!\n@Stencil(hello)\n  hi\n@Stencil!\n";
    assert_eq!(render(source, json!({})).unwrap(), "  hi\n");
}

#[test]
fn test_stencil_invoked_twice() {
    let source = "@Stencil(dot)\n  *\n@Stencil!\n@dot!\n@dot!\n";
    assert_eq!(render(source, json!({})).unwrap(), "  *\n  *\n");
}

#[test]
fn test_unknown_stencil_fails_statically() {
    let err = engine().check_str("t", "@ghost!\n").unwrap_err();
    assert!(matches!(err, WeftError::Structural { .. }));
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn test_suppressed_invocation_emits_nothing() {
    let source = "@Stencil(s)\n  body\n@Stencil!\n@If(flag)@s!@If()\n";
    assert_eq!(render(source, json!({"flag": false})).unwrap(), "");
}

#[test]
fn test_stencil_recursion_is_bounded() {
    let source = "@Stencil(loop)\n  @loop!\n@Stencil!\n@loop!\n";
    let err = render(source, json!({})).unwrap_err();
    assert!(matches!(err, WeftError::RecursiveStencil { .. }));
}

#[test]
fn test_stencil_body_reads_fields_of_invoker_context() {
    // A declaration body cannot know its invokers' contexts, so `.name`
    // resolves when the body runs bound to the loop element.
    let source = "@Stencil(row)\n  - @Get(.name)\n@Stencil!\n@Each(people)\n  @row!\n@Each()\n";
    let out = render(source, json!({"people": [{"name": "Ada"}]})).unwrap();
    assert_eq!(out, "  - Ada\n");
}

#[test]
fn test_nested_content_splice() {
    // The callee's line fragment before `@Nested` glues onto the first
    // spliced line; the fragment after it starts a fresh output line.
    let source = "@Stencil(box)\n  <<@Nested(body)>>\n@Stencil!\n@box!\n  hello\ndone\n";
    let out = render(source, json!({})).unwrap();
    assert_eq!(out, "  <<  hello\n>>\ndone\n");
}

#[test]
fn test_nested_outside_stencil_body_is_structural() {
    let err = render("@Nested(body)\n", json!({})).unwrap_err();
    assert!(matches!(err, WeftError::Structural { .. }));
}

// ----------------------------------------------------------------------
// Imports
// ----------------------------------------------------------------------

#[test]
fn test_import_exposes_stencils_under_alias() {
    let engine = engine_with(&[
        (
            "lib.wft",
            "@Stencil(header)\n== @Get(.title) ==\n@Stencil!\n",
        ),
        ("main.wft", "@Import(ui => lib.wft)\n@ui.header!\n"),
    ]);
    let out = engine
        .render_with_context("main.wft", Value::from(json!({"title": "Hi"})))
        .unwrap();
    assert_eq!(out, "== Hi ==\n");
}

#[test]
fn test_import_resolves_relative_to_importer() {
    let engine = engine_with(&[
        ("site/lib.wft", "@Stencil(x)\nX\n@Stencil!\n"),
        ("site/main.wft", "@Import(lib => lib.wft)\n@lib.x!\n"),
    ]);
    let out = engine
        .render_with_context("site/main.wft", Value::Null)
        .unwrap();
    assert_eq!(out, "X\n");
}

#[test]
fn test_malformed_import_is_structural() {
    let err = engine().check_str("t", "@Import(lib.wft)\n").unwrap_err();
    assert!(matches!(err, WeftError::Structural { .. }));
}

// ----------------------------------------------------------------------
// Escapers as resources
// ----------------------------------------------------------------------

#[test]
fn test_escaper_from_table_resource() {
    let engine = engine_with(&[("caps.esc", "97 A 98 B")]);
    let out = engine
        .render_str_with_context(
            "t",
            "@Escape(subst => caps.esc)@Get(subst => .word)\n",
            Value::from(json!({"word": "abc"})),
        )
        .unwrap();
    assert_eq!(out, "ABc\n");
}

#[test]
fn test_escaper_default_can_be_replaced_in_scope() {
    let engine = engine_with(&[("caps.esc", "97 A")]);
    let out = engine
        .render_str_with_context(
            "t",
            "@Escape(caps.esc)@Get(.word)\n",
            Value::from(json!({"word": "aaa"})),
        )
        .unwrap();
    assert_eq!(out, "AAA\n");
}

#[test]
fn test_escaper_scope_ends_with_its_frame() {
    let engine = engine_with(&[("caps.esc", "97 A")]);
    let err = engine
        .check_str(
            "t",
            "@If(x)@Escape(u => caps.esc)@If()@Get(u => .word)\n",
        )
        .unwrap_err();
    assert!(matches!(err, WeftError::Structural { .. }));
}

#[test]
fn test_missing_escaper_resource_is_resource_error() {
    let err = engine()
        .check_str("t", "@Escape(u => ghost.esc)\n")
        .unwrap_err();
    assert!(matches!(err, WeftError::Resource { .. }));
}

// ----------------------------------------------------------------------
// Structure and blank lines
// ----------------------------------------------------------------------

#[test]
fn test_blank_lines_preserved_when_active() {
    let source = "@If(flag)\n  a\n\n  b\n@If()\n";
    assert_eq!(
        render(source, json!({"flag": true})).unwrap(),
        "  a\n\n  b\n"
    );
}

#[test]
fn test_blank_lines_discarded_when_suppressed() {
    let source = "@If(flag)\n  a\n\n  b\n@If()\nend\n";
    assert_eq!(render(source, json!({"flag": false})).unwrap(), "end\n");
}

#[test]
fn test_directive_only_line_leaves_no_output() {
    let source = "a\n  @If(flag)\n  x\n  @If()\nb\n";
    assert_eq!(render(source, json!({"flag": true})).unwrap(), "a\n  x\nb\n");
}

#[test]
fn test_unclosed_column_zero_block_is_structural() {
    let err = engine().check_str("t", "@If(x)\nbody\n").unwrap_err();
    assert!(matches!(err, WeftError::Structural { .. }));
}

#[test]
fn test_unmatched_close_is_structural() {
    let err = engine().check_str("t", "text@Each()\n").unwrap_err();
    assert!(matches!(err, WeftError::Structural { .. }));
}

#[test]
fn test_mismatched_close_is_structural() {
    let err = engine().check_str("t", "@If(x)@Each()\n").unwrap_err();
    assert!(matches!(err, WeftError::Structural { .. }));
}

#[test]
fn test_errors_carry_page_and_line() {
    let err = engine()
        .check_str("pages/main.wft", "fine\n@Get(ghost => .x)\n")
        .unwrap_err();
    assert!(err.to_string().starts_with("pages/main.wft:2"));
}
