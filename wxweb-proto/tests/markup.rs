use wxweb_proto::markup::{self, ATTRS_KEY, MarkupError, MarkupTree, MarkupValue};

#[test]
fn scalar_children_round_trip() {
    let tree: MarkupTree = [("code", "0"), ("data", "hello world")].into_iter().collect();
    let mut doc = MarkupTree::new();
    doc.insert("res", tree);

    let text = markup::serialize(&doc);
    assert_eq!(text, "<res><code>0</code><data>hello world</data></res>");

    let parsed = markup::parse(&text).unwrap();
    assert_eq!(parsed, doc);
}

#[test]
fn list_serializes_as_one_merged_element() {
    let first: MarkupTree = [("code", "0")].into_iter().collect();
    let second: MarkupTree = [("data", "hello world")].into_iter().collect();
    let mut doc = MarkupTree::new();
    doc.insert("res", vec![first, second]);

    assert_eq!(
        markup::serialize(&doc),
        "<res><code>0</code><data>hello world</data></res>"
    );
}

#[test]
fn attributes_are_emitted_in_order() {
    let attrs: MarkupTree = [("x", "h"), ("y", "z")].into_iter().collect();
    let mut res = MarkupTree::new();
    res.insert(ATTRS_KEY, attrs);
    res.insert("code", "0");
    let mut doc = MarkupTree::new();
    doc.insert("res", res);

    assert_eq!(markup::serialize(&doc), "<res x=\"h\" y=\"z\"><code>0</code></res>");
}

#[test]
fn text_only_element_collapses_to_scalar() {
    let doc = markup::parse("<msg><title>report.pdf</title></msg>").unwrap();
    assert_eq!(doc.tree("msg").unwrap().text("title"), Some("report.pdf"));
}

#[test]
fn attributed_text_element_keeps_a_tree() {
    // The scalar lands under the element's own name next to the attributes.
    let doc = markup::parse("<msg><item id=\"7\">hi</item></msg>").unwrap();
    let item = doc.tree("msg").unwrap().tree("item").unwrap();
    assert_eq!(item.tree(ATTRS_KEY).unwrap().text("id"), Some("7"));
    assert_eq!(item.text("item"), Some("hi"));
}

#[test]
fn empty_tree_self_closes_and_empty_text_does_not() {
    let mut doc = MarkupTree::new();
    doc.insert("a", MarkupTree::new());
    doc.insert("b", "");
    assert_eq!(markup::serialize(&doc), "<a/><b></b>");
}

#[test]
fn self_closed_element_parses_as_empty_tree() {
    let doc = markup::parse("<msg><empty/></msg>").unwrap();
    assert!(doc.tree("msg").unwrap().tree("empty").unwrap().is_empty());
}

#[test]
fn text_escaping_round_trips() {
    let mut doc = MarkupTree::new();
    doc.insert("t", "a < b & c > d");
    let text = markup::serialize(&doc);
    assert_eq!(text, "<t>a &lt; b &amp; c &gt; d</t>");
    assert_eq!(markup::parse(&text).unwrap().text("t"), Some("a < b & c > d"));
}

#[test]
fn attr_values_escape_quotes() {
    let attrs: MarkupTree = [("q", "say \"hi\"")].into_iter().collect();
    let mut el = MarkupTree::new();
    el.insert(ATTRS_KEY, attrs);
    el.insert("v", "1");
    let mut doc = MarkupTree::new();
    doc.insert("e", el);
    assert_eq!(markup::serialize(&doc), "<e q=\"say &quot;hi&quot;\"><v>1</v></e>");
}

#[test]
fn cdata_becomes_text() {
    let doc = markup::parse("<msg><raw><![CDATA[a < b]]></raw></msg>").unwrap();
    assert_eq!(doc.tree("msg").unwrap().text("raw"), Some("a < b"));
}

#[test]
fn comments_are_skipped() {
    let doc = markup::parse("<msg><!-- noise --><a>1</a></msg>").unwrap();
    assert_eq!(doc.tree("msg").unwrap().text("a"), Some("1"));
}

#[test]
fn declaration_wrapped_document_is_unwrapped() {
    let text = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                <error>\t<br/><error><ret>201</ret>\t<message></message></error><br/>\
                </error>";
    let doc = markup::parse(text).unwrap();
    let error = doc.tree("error").unwrap();
    assert_eq!(error.text("ret"), Some("201"));
    assert_eq!(error.text("message"), Some(""));
}

#[test]
fn mismatched_close_is_rejected() {
    let err = markup::parse("<a><b>1</c></a>").unwrap_err();
    assert_eq!(
        err,
        MarkupError::MismatchedClose { expected: "b".into(), found: "c".into() }
    );
}

#[test]
fn truncated_document_is_rejected() {
    assert_eq!(markup::parse("<a><b>1</b>"), Err(MarkupError::UnexpectedEof));
    assert_eq!(markup::parse("   "), Err(MarkupError::EmptyDocument));
}

#[test]
fn duplicate_keys_keep_order() {
    let doc = markup::parse("<m><k>1</k><k>2</k></m>").unwrap();
    let m = doc.tree("m").unwrap();
    let keys: Vec<_> = m.entries().map(|(k, v)| (k, v.clone())).collect();
    assert_eq!(
        keys,
        vec![
            ("k", MarkupValue::Text("1".into())),
            ("k", MarkupValue::Text("2".into())),
        ]
    );
    assert_eq!(m.text("k"), Some("1"));
}

#[test]
fn nested_path_lookup() {
    let doc = markup::parse("<msg><appmsg><appattach><fileext>pdf</fileext></appattach></appmsg></msg>")
        .unwrap();
    let attach = doc.path(&["msg", "appmsg", "appattach"]).unwrap();
    assert_eq!(attach.text("fileext"), Some("pdf"));
}
