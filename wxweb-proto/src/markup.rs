//! Ordered-attribute tree ⇄ markup text conversion.
//!
//! Several webwx payloads embed a pseudo-XML document inside a JSON string
//! (the `appmsg` body of file and share messages, the login page). This
//! module converts between that markup text and an ordered tree of
//! `tag → value` entries, where a value is a scalar, a nested tree, or a
//! list of trees. Element attributes live in a reserved [`ATTRS_KEY`]
//! sub-tree.
//!
//! An element with exactly one text child and no attributes collapses to a
//! plain scalar on parse, so `serialize(parse(x)) == x` only holds for
//! documents free of that ambiguity. The collapse matches the wire producer
//! and is deliberate.

use std::fmt;

/// Reserved entry name holding an element's attributes.
pub const ATTRS_KEY: &str = "__attrs__";

// ─── Tree model ───────────────────────────────────────────────────────────────

/// An ordered mapping from tag name to [`MarkupValue`].
///
/// Duplicate keys are allowed and preserved in order; [`MarkupTree::get`]
/// returns the first match.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MarkupTree {
    entries: Vec<(String, MarkupValue)>,
}

/// A single tree entry value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkupValue {
    /// Scalar text content.
    Text(String),
    /// Nested element.
    Tree(MarkupTree),
    /// Several trees serialized as children of one element.
    List(Vec<MarkupTree>),
}

impl MarkupTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, keeping insertion order.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MarkupValue>) {
        self.entries.push((key.into(), value.into()));
    }

    /// First entry with the given key.
    pub fn get(&self, key: &str) -> Option<&MarkupValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// First entry with the given key, as scalar text.
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            MarkupValue::Text(t) => Some(t),
            _ => None,
        }
    }

    /// First entry with the given key, as a nested tree.
    pub fn tree(&self, key: &str) -> Option<&MarkupTree> {
        match self.get(key)? {
            MarkupValue::Tree(t) => Some(t),
            _ => None,
        }
    }

    /// Walk a chain of nested trees, e.g. `path(&["msg", "appmsg"])`.
    pub fn path(&self, keys: &[&str]) -> Option<&MarkupTree> {
        let mut cur = self;
        for key in keys {
            cur = cur.tree(key)?;
        }
        Some(cur)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &MarkupValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<MarkupValue>> FromIterator<(K, V)> for MarkupTree {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self { entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}

impl From<&str> for MarkupValue {
    fn from(s: &str) -> Self {
        MarkupValue::Text(s.to_string())
    }
}

impl From<String> for MarkupValue {
    fn from(s: String) -> Self {
        MarkupValue::Text(s)
    }
}

impl From<MarkupTree> for MarkupValue {
    fn from(t: MarkupTree) -> Self {
        MarkupValue::Tree(t)
    }
}

impl From<Vec<MarkupTree>> for MarkupValue {
    fn from(l: Vec<MarkupTree>) -> Self {
        MarkupValue::List(l)
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Markup parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkupError {
    /// Input ended inside an element, attribute or entity.
    UnexpectedEof,
    /// A character other than what the grammar allows at this position.
    Unexpected { pos: usize, expected: &'static str },
    /// Closing tag does not match the open element.
    MismatchedClose { expected: String, found: String },
    /// No root element found.
    EmptyDocument,
}

impl fmt::Display for MarkupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of markup"),
            Self::Unexpected { pos, expected } => {
                write!(f, "expected {expected} at byte {pos}")
            }
            Self::MismatchedClose { expected, found } => {
                write!(f, "mismatched closing tag: expected </{expected}>, found </{found}>")
            }
            Self::EmptyDocument => write!(f, "no root element"),
        }
    }
}

impl std::error::Error for MarkupError {}

// ─── Parsing ──────────────────────────────────────────────────────────────────

struct RawElement {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<RawNode>,
    self_closed: bool,
}

enum RawNode {
    Element(RawElement),
    Text(String),
}

/// Parse a markup document into a single-entry tree `{root_name: value}`.
pub fn parse(input: &str) -> Result<MarkupTree, MarkupError> {
    let doc = strip_preamble(input);
    let mut scanner = Scanner { src: doc.as_ref(), pos: 0 };
    scanner.skip_whitespace();
    if scanner.rest().is_empty() {
        return Err(MarkupError::EmptyDocument);
    }
    let root = scanner.parse_element()?;
    let mut tree = MarkupTree::new();
    let name = root.name.clone();
    tree.insert(name, convert(root));
    Ok(tree)
}

/// The login page arrives as a declaration-prefixed pseudo-XML document with
/// the real payload between `<br/>` markers; peel that wrapper off first.
fn strip_preamble(input: &str) -> std::borrow::Cow<'_, str> {
    if !input.starts_with("<?xml") {
        return std::borrow::Cow::Borrowed(input);
    }
    let segments: Vec<&str> = input.split("<br/>").collect();
    let inner = if segments.len() > 2 {
        segments[1..segments.len() - 1].join("<br/>")
    } else {
        // Declaration with no <br/> wrapper: drop everything through `?>`.
        match input.find("?>") {
            Some(idx) => input[idx + 2..].to_string(),
            None => input.to_string(),
        }
    };
    std::borrow::Cow::Owned(inner.replace('\t', ""))
}

fn convert(el: RawElement) -> MarkupValue {
    // Single text-only child degrades to its scalar, unless the element
    // itself carries attributes; then the scalar is kept under the
    // element's own tag name next to the attributes.
    // An explicitly closed empty element is empty text; only `<k/>` stays
    // an empty tree.
    if el.children.is_empty() && el.attrs.is_empty() && !el.self_closed {
        return MarkupValue::Text(String::new());
    }
    if el.children.len() == 1 {
        if let RawNode::Text(t) = &el.children[0] {
            if el.attrs.is_empty() {
                return MarkupValue::Text(t.clone());
            }
            let mut tree = MarkupTree::new();
            tree.insert(ATTRS_KEY, attrs_tree(&el.attrs));
            tree.insert(el.name.clone(), MarkupValue::Text(t.clone()));
            return MarkupValue::Tree(tree);
        }
    }

    let mut tree = MarkupTree::new();
    if !el.attrs.is_empty() {
        tree.insert(ATTRS_KEY, attrs_tree(&el.attrs));
    }
    for child in el.children {
        match child {
            RawNode::Element(e) => {
                let name = e.name.clone();
                tree.insert(name, convert(e));
            }
            RawNode::Text(t) => {
                if !t.trim().is_empty() {
                    tree.insert("#text", MarkupValue::Text(t));
                }
            }
        }
    }
    MarkupValue::Tree(tree)
}

fn attrs_tree(attrs: &[(String, String)]) -> MarkupTree {
    attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

struct Scanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str, what: &'static str) -> Result<(), MarkupError> {
        if self.eat(token) {
            Ok(())
        } else if self.rest().is_empty() {
            Err(MarkupError::UnexpectedEof)
        } else {
            Err(MarkupError::Unexpected { pos: self.pos, expected: what })
        }
    }

    fn take_until(&mut self, token: &str) -> Result<&'a str, MarkupError> {
        match self.rest().find(token) {
            Some(idx) => {
                let out = &self.rest()[..idx];
                self.pos += idx + token.len();
                Ok(out)
            }
            None => Err(MarkupError::UnexpectedEof),
        }
    }

    fn parse_name(&mut self) -> Result<String, MarkupError> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/' || c == '=')
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(MarkupError::Unexpected { pos: self.pos, expected: "tag or attribute name" });
        }
        self.pos += end;
        Ok(rest[..end].to_string())
    }

    fn parse_element(&mut self) -> Result<RawElement, MarkupError> {
        self.expect("<", "element")?;
        let name = self.parse_name()?;
        let attrs = self.parse_attrs()?;

        if self.eat("/>") {
            return Ok(RawElement { name, attrs, children: Vec::new(), self_closed: true });
        }
        self.expect(">", "'>' or '/>'")?;

        let mut children = Vec::new();
        loop {
            if self.eat("</") {
                let close = self.parse_name()?;
                self.skip_whitespace();
                self.expect(">", "'>'")?;
                if close != name {
                    return Err(MarkupError::MismatchedClose { expected: name, found: close });
                }
                return Ok(RawElement { name, attrs, children, self_closed: false });
            }
            if self.eat("<!--") {
                self.take_until("-->")?;
                continue;
            }
            if self.eat("<![CDATA[") {
                let data = self.take_until("]]>")?;
                children.push(RawNode::Text(data.to_string()));
                continue;
            }
            if self.rest().starts_with('<') {
                children.push(RawNode::Element(self.parse_element()?));
                continue;
            }
            if self.rest().is_empty() {
                return Err(MarkupError::UnexpectedEof);
            }
            let end = self.rest().find('<').ok_or(MarkupError::UnexpectedEof)?;
            let text = &self.rest()[..end];
            self.pos += end;
            children.push(RawNode::Text(unescape(text)));
        }
    }

    fn parse_attrs(&mut self) -> Result<Vec<(String, String)>, MarkupError> {
        let mut attrs = Vec::new();
        loop {
            self.skip_whitespace();
            if self.rest().starts_with('>') || self.rest().starts_with("/>") {
                return Ok(attrs);
            }
            if self.rest().is_empty() {
                return Err(MarkupError::UnexpectedEof);
            }
            let name = self.parse_name()?;
            self.skip_whitespace();
            self.expect("=", "'='")?;
            self.skip_whitespace();
            let quote = if self.eat("\"") {
                "\""
            } else if self.eat("'") {
                "'"
            } else {
                return Err(MarkupError::Unexpected { pos: self.pos, expected: "quoted attribute value" });
            };
            let value = self.take_until(quote)?;
            attrs.push((name, unescape(value)));
        }
    }
}

// ─── Serialization ────────────────────────────────────────────────────────────

/// Serialize a tree back into markup text.
pub fn serialize(tree: &MarkupTree) -> String {
    let mut out = String::new();
    for (key, value) in tree.entries() {
        write_value(&mut out, key, value);
    }
    out
}

fn write_value(out: &mut String, key: &str, value: &MarkupValue) {
    match value {
        MarkupValue::Text(t) => {
            out.push('<');
            out.push_str(key);
            out.push('>');
            out.push_str(&escape_text(t));
            out.push_str("</");
            out.push_str(key);
            out.push('>');
        }
        MarkupValue::Tree(tree) => {
            out.push('<');
            out.push_str(key);
            if let Some(attrs) = tree.tree(ATTRS_KEY) {
                for (name, val) in attrs.entries() {
                    if let MarkupValue::Text(v) = val {
                        out.push(' ');
                        out.push_str(name);
                        out.push_str("=\"");
                        out.push_str(&escape_attr(v));
                        out.push('"');
                    }
                }
            }
            let mut body = String::new();
            for (k, v) in tree.entries() {
                if k == ATTRS_KEY {
                    continue;
                }
                write_value(&mut body, k, v);
            }
            if body.is_empty() {
                out.push_str("/>");
            } else {
                out.push('>');
                out.push_str(&body);
                out.push_str("</");
                out.push_str(key);
                out.push('>');
            }
        }
        MarkupValue::List(items) => {
            let mut body = String::new();
            for item in items {
                for (k, v) in item.entries() {
                    write_value(&mut body, k, v);
                }
            }
            if body.is_empty() {
                out.push('<');
                out.push_str(key);
                out.push_str("/>");
            } else {
                out.push('<');
                out.push_str(key);
                out.push('>');
                out.push_str(&body);
                out.push_str("</");
                out.push_str(key);
                out.push('>');
            }
        }
    }
}

// ─── Entities ─────────────────────────────────────────────────────────────────

fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Decode HTML/XML character references. Unknown references pass through
/// untouched — the wire occasionally carries bare ampersands.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        // Entity names are short; a ';' any farther out belongs to the text.
        // Walk char boundaries so the window never splits a multibyte char.
        let end = rest
            .char_indices()
            .take_while(|&(idx, _)| idx < 12)
            .find_map(|(idx, c)| (c == ';').then_some(idx));
        let Some(end) = end else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{a0}'),
            _ => decode_numeric(entity),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_numeric(entity: &str) -> Option<char> {
    let code = if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
        u32::from_str_radix(hex, 16).ok()?
    } else if let Some(dec) = entity.strip_prefix('#') {
        dec.parse().ok()?
    } else {
        return None;
    };
    char::from_u32(code)
}
