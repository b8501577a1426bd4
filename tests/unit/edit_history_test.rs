use component_sandbox::editing::context::TRUNCATION_MARKER;
use component_sandbox::editing::{
    EditConfig, EditEngine, EditError, EditOperation, ElementTarget, InsertPosition, Theme,
    ToolCall, ToolOutcome,
};
use component_sandbox::{Document, DocumentError, NodeId};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

const PAGE: &str = concat!(
    r#"<html><head><title>Demo</title></head><body>"#,
    r#"<header id="top"><h1 class="title">Hello</h1></header>"#,
    r#"<main><p class="lead" style="color:red">First</p><p>Second</p><a href="/x">Link</a></main>"#,
    r#"<div data-i2-overlay=""><p class="lead">Overlay</p></div>"#,
    r#"</body></html>"#,
);

fn engine_with(config: EditConfig) -> EditEngine {
    EditEngine::new(Arc::new(Document::parse(PAGE)), config)
}

fn engine() -> EditEngine {
    engine_with(EditConfig::default())
}

fn body_html(engine: &EditEngine) -> String {
    let doc = engine.document();
    doc.outer_html(doc.body().unwrap()).unwrap()
}

fn html_of(engine: &EditEngine, selector: &str) -> String {
    let doc = engine.document();
    doc.outer_html(doc.query_selector(selector).unwrap().unwrap()).unwrap()
}

fn select(engine: &EditEngine, selectors: &[&str]) -> Vec<NodeId> {
    selectors
        .iter()
        .map(|s| engine.document().query_selector(s).unwrap().unwrap())
        .collect()
}

#[test]
fn test_batch_undo_restores_markup() {
    let engine = engine();
    let before = body_html(&engine);
    let selected = select(&engine, &["h1", "main p", "a"]);

    let operations: Vec<EditOperation> = serde_json::from_value(json!([
        {"type": "set-style", "elementIndex": 0, "property": "backgroundColor", "value": "navy"},
        {"type": "add-class", "elementIndex": 1, "className": "highlight"},
        {"type": "remove-class", "elementIndex": 0, "className": "title"},
        {"type": "set-attribute", "elementIndex": 2, "name": "target", "value": "_blank"},
        {"type": "remove-attribute", "elementIndex": 2, "name": "href"},
        {"type": "set-text-content", "elementIndex": 1, "text": "Changed"}
    ]))
    .unwrap();

    assert!(engine.apply_edits(&selected, &operations, "restyle").unwrap());
    assert_eq!(html_of(&engine, "h1"), r#"<h1 class="" style="background-color: navy;">Hello</h1>"#);
    assert_eq!(
        html_of(&engine, "main p"),
        r#"<p class="lead highlight" style="color:red">Changed</p>"#
    );
    assert_eq!(html_of(&engine, "a"), r#"<a target="_blank">Link</a>"#);

    assert_eq!(engine.history_descriptions(), vec!["restyle"]);
    assert!(engine.undo());
    assert_eq!(body_html(&engine), before);
    assert_eq!(engine.undo_count(), 0);
    assert!(!engine.undo());
}

#[test]
fn test_undo_keeps_element_identity() {
    let engine = engine();
    let selected = select(&engine, &["main p"]);
    let operations = vec![EditOperation::SetInnerHtml {
        target: ElementTarget::index(0),
        html: "<em>rich</em> text".into(),
    }];

    engine.apply_edits(&selected, &operations, "rewrite").unwrap();
    assert_eq!(engine.document().inner_html(selected[0]).unwrap(), "<em>rich</em> text");

    engine.undo();
    assert_eq!(engine.document().inner_html(selected[0]).unwrap(), "First");
    assert_eq!(engine.document().query_selector("main p").unwrap(), Some(selected[0]));
}

#[test]
fn test_selector_wins_over_element_index() {
    let engine = engine();
    let selected = select(&engine, &["h1"]);
    let operations = vec![EditOperation::AddClass {
        target: ElementTarget {
            element_index: Some(0),
            selector: Some("main p".into()),
        },
        class_name: "picked".into(),
    }];

    engine.apply_edits(&selected, &operations, "pick").unwrap();
    assert_eq!(html_of(&engine, "h1"), r#"<h1 class="title">Hello</h1>"#);
    let picked = engine.read_path(".picked", "text").unwrap();
    assert_eq!(picked, vec!["First", "Second"]);
}

#[test]
fn test_edits_without_targets_record_nothing() {
    let engine = engine();
    assert!(!engine.apply_edits(&[], &[], "nothing").unwrap());

    let operations = vec![EditOperation::SetStyle {
        target: ElementTarget::index(3),
        property: "color".into(),
        value: "red".into(),
    }];
    assert!(!engine.apply_edits(&[], &operations, "out of range").unwrap());
    assert!(!engine.apply_dom_write(".missing", "text", "x", None).unwrap());
    assert_eq!(engine.undo_count(), 0);
}

#[test]
fn test_insert_undo_removes_inserted_nodes() {
    let engine = engine();
    let before = body_html(&engine);

    assert!(engine
        .apply_dom_insert("h1", InsertPosition::After, "<h2>Sub</h2><p>Intro</p>", None)
        .unwrap());
    assert_eq!(
        engine.document().inner_html(engine.document().query_selector("header").unwrap().unwrap()).unwrap(),
        r#"<h1 class="title">Hello</h1><h2>Sub</h2><p>Intro</p>"#
    );

    assert!(engine
        .apply_dom_insert("main", InsertPosition::Prepend, "<p>A</p><p>B</p>", None)
        .unwrap());
    assert_eq!(engine.read_path("main > p", "text").unwrap(), vec!["A", "B", "First", "Second"]);

    assert_eq!(engine.history_descriptions(), vec!["dom_insert", "dom_insert"]);
    engine.undo();
    engine.undo();
    assert_eq!(body_html(&engine), before);
}

#[test]
fn test_insert_positions_keep_fragment_order() {
    let engine = engine();
    let fragment = "<i>1</i><i>2</i>";
    engine.apply_dom_insert("a", InsertPosition::Before, fragment, None).unwrap();
    engine.apply_dom_insert("a", InsertPosition::Append, fragment, None).unwrap();

    assert_eq!(
        engine.read_path("main", "html").unwrap(),
        vec![r#"<p class="lead" style="color:red">First</p><p>Second</p><i>1</i><i>2</i><a href="/x">Link<i>1</i><i>2</i></a>"#]
    );
}

#[test]
fn test_undo_skips_nodes_removed_by_later_edits() {
    let engine = engine();
    let before = body_html(&engine);

    engine
        .apply_dom_insert("main", InsertPosition::Append, r#"<span id="s">x</span>"#, None)
        .unwrap();
    engine.apply_dom_write("main", "html", "<b>y</b>", None).unwrap();
    assert_eq!(engine.read_path("#s", "text").unwrap(), Vec::<String>::new());

    assert!(engine.undo());
    assert_eq!(engine.read_path("#s", "text").unwrap(), vec!["x"]);
    assert!(engine.undo());
    assert_eq!(body_html(&engine), before);
}

#[test]
fn test_sibling_insert_needs_a_parent() {
    let engine = engine();
    let detached = engine.document().create_element("div");
    let operations = vec![EditOperation::InsertHtml {
        position: InsertPosition::Before,
        target_element_index: Some(0),
        target_selector: None,
        html: "<p>x</p>".into(),
    }];

    let err = engine.apply_edits(&[detached], &operations, "insert").unwrap_err();
    assert!(matches!(err, EditError::Document(DocumentError::InvalidOperation(_))));
    assert_eq!(engine.undo_count(), 0);
}

#[test]
fn test_dom_write_paths() {
    let engine = engine();

    engine.apply_dom_write("h1", "style.fontSize", "32px", None).unwrap();
    assert_eq!(engine.read_path("h1", "style").unwrap(), vec!["font-size: 32px !important;"]);
    assert_eq!(engine.read_path("h1", "style.fontSize").unwrap(), vec!["32px"]);

    engine.apply_dom_write("h1", "text", "Welcome", None).unwrap();
    engine.apply_dom_write("a", "attr.title", "Go", None).unwrap();
    engine.apply_dom_write("a", "attr.-href", "", None).unwrap();
    engine.apply_dom_write("h1", "class.big", "", None).unwrap();
    engine.apply_dom_write("h1", "-class.title", "", None).unwrap();
    engine.apply_dom_write("header", "html", "<nav>Menu</nav>", None).unwrap();

    assert_eq!(engine.read_path("a", "attr.title").unwrap(), vec!["Go"]);
    assert_eq!(engine.read_path("a", "attr.href").unwrap(), vec![""]);
    assert_eq!(engine.read_path("header", "html").unwrap(), vec!["<nav>Menu</nav>"]);
    assert_eq!(engine.undo_count(), 7);

    // The header undo brings back a fresh h1; the class undo that follows
    // points at the h1 the rewrite dropped and is skipped.
    engine.undo();
    engine.undo();
    assert_eq!(engine.read_path("h1", "classes").unwrap(), vec!["big"]);
    assert_eq!(engine.read_path("h1", "text").unwrap(), vec!["Welcome"]);
    assert_eq!(engine.undo_count(), 5);
}

#[test]
fn test_unknown_path_is_rejected_without_history() {
    let engine = engine();
    let before = body_html(&engine);

    let err = engine.apply_dom_write("h1", "outerHTML", "<p/>", None).unwrap_err();
    assert!(matches!(err, EditError::UnknownPath(path) if path == "outerHTML"));
    assert!(matches!(engine.read_path("h1", "bogus"), Err(EditError::UnknownPath(_))));
    assert_eq!(engine.undo_count(), 0);
    assert_eq!(body_html(&engine), before);
}

#[test]
fn test_invalid_selector_is_an_error() {
    let engine = engine();
    let err = engine.apply_dom_write("p:hover", "text", "x", None).unwrap_err();
    assert!(matches!(err, EditError::Document(DocumentError::InvalidSelector(_))));
    assert_eq!(engine.undo_count(), 0);
}

#[test]
fn test_overlay_elements_are_never_targeted() {
    let engine = engine();
    engine.apply_dom_write(".lead", "class.hit", "", None).unwrap();

    assert_eq!(engine.read_path(".hit", "text").unwrap(), vec!["First"]);
    assert_eq!(
        html_of(&engine, "[data-i2-overlay] p"),
        r#"<p class="lead">Overlay</p>"#
    );
    assert!(!engine
        .apply_dom_insert("[data-i2-overlay] p", InsertPosition::Append, "<b>x</b>", None)
        .unwrap());
}

#[test]
fn test_selection_marker_falls_back_to_body() {
    let engine = engine();
    assert!(engine
        .apply_dom_write("[data-i2-selected]", "style.backgroundColor", "rgb(20, 20, 20)", Some("dark mode"))
        .unwrap());

    assert_eq!(
        engine.read_path("body", "style").unwrap(),
        vec!["background-color: rgb(20, 20, 20) !important;"]
    );
    assert_eq!(engine.history_descriptions(), vec!["dark mode"]);
    assert_eq!(engine.page_context().theme, Theme::Dark);

    engine.undo();
    let body = engine.document().body().unwrap();
    assert_eq!(engine.document().get_attribute(body, "style"), None);
}

#[test]
fn test_body_restore_after_html_write() {
    let engine = engine();
    let before = body_html(&engine);

    engine.apply_dom_write("body", "html", "<p>gone</p>", None).unwrap();
    assert_eq!(body_html(&engine), "<body><p>gone</p></body>");

    engine.undo();
    assert_eq!(body_html(&engine), before);
}

#[test]
fn test_dispatch_tool_calls() {
    let engine = engine();
    let calls: Vec<ToolCall> = serde_json::from_value(json!([
        {"tool": "dom_write", "selector": "h1", "path": "text", "value": "Hi"},
        {"tool": "dom_insert", "targetSelector": "main", "position": "append", "html": "<p>End</p>"},
        {"tool": "dom_read", "selector": "main > p", "path": "text"}
    ]))
    .unwrap();

    let outcomes: Vec<ToolOutcome> = calls.iter().map(|c| engine.dispatch(c).unwrap()).collect();
    assert_eq!(
        outcomes,
        vec![
            ToolOutcome::Applied(true),
            ToolOutcome::Applied(true),
            ToolOutcome::Read(vec!["First".into(), "Second".into(), "End".into()]),
        ]
    );
    assert_eq!(engine.history_descriptions(), vec!["dom_insert", "dom_write"]);
}

#[test]
fn test_history_is_bounded() {
    let engine = engine_with(EditConfig {
        max_history: 2,
        ..EditConfig::default()
    });
    for text in ["one", "two", "three"] {
        engine.apply_dom_write("h1", "text", text, Some(text)).unwrap();
    }
    assert_eq!(engine.history_descriptions(), vec!["three", "two"]);

    engine.undo();
    engine.undo();
    assert!(!engine.undo());
    assert_eq!(engine.read_path("h1", "text").unwrap(), vec!["one"]);

    engine.apply_dom_write("h1", "text", "four", None).unwrap();
    engine.clear_history();
    assert_eq!(engine.undo_count(), 0);
}

#[test]
fn test_element_context_truncates() {
    let engine = engine_with(EditConfig {
        outer_html_limit: 12,
        text_limit: 3,
        ..EditConfig::default()
    });
    let selected = select(&engine, &["header", "a"]);
    let contexts = engine.serialize_elements(&selected).unwrap();

    assert_eq!(contexts[0].index, 0);
    assert_eq!(contexts[0].id.as_deref(), Some("top"));
    assert_eq!(contexts[0].tag_name, "header");
    assert_eq!(contexts[0].outer_html, format!("<header id=\"{TRUNCATION_MARKER}"));
    assert_eq!(contexts[0].text_content, "Hel");

    assert_eq!(contexts[1].index, 1);
    assert_eq!(contexts[1].id, None);
    assert_eq!(contexts[1].outer_html, format!("<a href=\"/x\"{TRUNCATION_MARKER}"));

    let value = serde_json::to_value(&contexts[1]).unwrap();
    assert_eq!(value["tagName"], "a");
    assert!(value.get("outerHTML").is_some());
    assert!(value.get("id").is_none());
}

#[test]
fn test_page_context_outline() {
    let engine = engine();
    let page = engine.page_context();

    assert_eq!(page.page_title.as_deref(), Some("Demo"));
    assert_eq!(page.theme, Theme::Light);
    assert_eq!(page.tag_counts.get("p"), Some(&2));
    assert_eq!(page.landmarks.len(), 2);
    assert_eq!(page.landmarks[0].id.as_deref(), Some("top"));
    assert_eq!(page.landmarks[1].tag, "main");
    assert_eq!(page.structure, "<body>\n  <header>\n  <main>");
}

#[derive(Debug, Clone)]
enum Step {
    Style(usize, &'static str, &'static str),
    AddClass(usize, &'static str),
    RemoveClass(usize, &'static str),
    SetAttribute(usize, &'static str, &'static str),
    RemoveAttribute(usize, &'static str),
    Text(usize, &'static str),
    Html(usize, &'static str),
}

impl Step {
    fn into_operation(self) -> EditOperation {
        match self {
            Step::Style(i, property, value) => EditOperation::SetStyle {
                target: ElementTarget::index(i),
                property: property.into(),
                value: value.into(),
            },
            Step::AddClass(i, class) => EditOperation::AddClass {
                target: ElementTarget::index(i),
                class_name: class.into(),
            },
            Step::RemoveClass(i, class) => EditOperation::RemoveClass {
                target: ElementTarget::index(i),
                class_name: class.into(),
            },
            Step::SetAttribute(i, name, value) => EditOperation::SetAttribute {
                target: ElementTarget::index(i),
                name: name.into(),
                value: value.into(),
            },
            Step::RemoveAttribute(i, name) => EditOperation::RemoveAttribute {
                target: ElementTarget::index(i),
                name: name.into(),
            },
            Step::Text(i, text) => EditOperation::SetTextContent {
                target: ElementTarget::index(i),
                text: text.into(),
            },
            Step::Html(i, html) => EditOperation::SetInnerHtml {
                target: ElementTarget::index(i),
                html: html.into(),
            },
        }
    }
}

fn step() -> impl Strategy<Value = Step> {
    let index = 0usize..4;
    prop_oneof![
        (
            index.clone(),
            prop::sample::select(vec!["color", "backgroundColor", "font-size"]),
            prop::sample::select(vec!["blue", "12px", ""]),
        )
            .prop_map(|(i, p, v)| Step::Style(i, p, v)),
        (index.clone(), prop::sample::select(vec!["lead", "title", "new"]))
            .prop_map(|(i, c)| Step::AddClass(i, c)),
        (index.clone(), prop::sample::select(vec!["lead", "title", "new"]))
            .prop_map(|(i, c)| Step::RemoveClass(i, c)),
        (
            index.clone(),
            prop::sample::select(vec!["data-x", "title", "href"]),
            prop::sample::select(vec!["1", "a b"]),
        )
            .prop_map(|(i, n, v)| Step::SetAttribute(i, n, v)),
        (index.clone(), prop::sample::select(vec!["href", "class", "style", "id"]))
            .prop_map(|(i, n)| Step::RemoveAttribute(i, n)),
        (index.clone(), prop::sample::select(vec!["", "plain", "a < b"]))
            .prop_map(|(i, t)| Step::Text(i, t)),
        (index, prop::sample::select(vec!["<em>x</em>", "<p>y</p>z", ""]))
            .prop_map(|(i, h)| Step::Html(i, h)),
    ]
}

proptest! {
    #[test]
    fn test_any_batch_undoes_to_original_markup(steps in prop::collection::vec(step(), 1..8)) {
        let engine = engine();
        let before = body_html(&engine);
        let selected = select(&engine, &["h1", "main p", "a", "main"]);
        let operations: Vec<EditOperation> = steps.into_iter().map(Step::into_operation).collect();

        prop_assert!(engine.apply_edits(&selected, &operations, "batch").unwrap());
        prop_assert!(engine.undo());
        prop_assert_eq!(body_html(&engine), before);
    }
}
