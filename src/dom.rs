//! # Lenient HTML tree
//!
//! Mail bodies are rarely well-formed. The tree builder here never fails:
//! unknown constructs degrade to escaped text, which can neither load
//! anything nor be interpreted as markup.
//!
//! Text and attribute values are kept exactly as written, entity
//! references included, so that serializing an untouched tree gives back
//! markup equivalent to the input.
//!
//! Comments, doctypes and everything browsers read as a bogus comment
//! (`<?...>`, `<![CDATA[...]]>`, `<!x...>`) are tokenized here with the
//! same end rules a browser uses, never by the XML reader, and are written
//! back in a form that cannot end early.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Elements that never have children or an end tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "keygen", "link", "meta",
    "param", "source", "track", "wbr",
];

/// Elements whose content is raw text and not markup.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

/// A parsed HTML fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    children: Vec<Node>,
}

/// A node of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// An element with its subtree.
    Element(Element),

    /// Text, entity references kept as written.
    Text(String),

    /// A comment, bogus comments included. Serialized with every `>` of
    /// the body escaped.
    Comment(String),

    /// A doctype declaration without `<` and `>`, the text after `<!`.
    Doctype(String),
}

/// An HTML element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attrs: Vec<Attribute>,
    children: Vec<Node>,
    self_closing: bool,
}

/// An attribute with its raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Lowercase attribute name.
    pub name: String,

    /// Value as written, entity references not decoded.
    pub value: String,
}

impl Document {
    /// Parses an HTML fragment.
    pub fn parse(html: &str) -> Document {
        let mut builder = TreeBuilder::default();
        let mut offset = 0;

        'chunks: while offset < html.len() {
            let chunk = html.get(offset..).unwrap_or_default();
            let mut reader = Reader::from_str(chunk);
            let config = reader.config_mut();
            config.check_end_names = false;
            config.allow_unmatched_ends = true;

            loop {
                let start = offset + reader.buffer_position() as usize;
                if let Some((node, len)) = html.get(start..).and_then(markup_declaration) {
                    if let Some(node) = node {
                        builder.push(node);
                    }
                    offset = start + len;
                    continue 'chunks;
                }

                let event = match reader.read_event() {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!("Unparsable markup at byte {start}, keeping rest as text: {err}.");
                        let rest = html.get(start..).unwrap_or_default();
                        builder.push(Node::Text(escape_text(rest)));
                        break 'chunks;
                    }
                };
                let end = offset + reader.buffer_position() as usize;
                let raw = html.get(start..end).unwrap_or_default();

                match event {
                    Event::Start(ref e) => {
                        let name = lowercase_name(e);
                        if RAW_TEXT_ELEMENTS.contains(&name.as_str()) && is_tag_name(&name) {
                            let (text, resume) = split_raw_text(html, end, &name);
                            builder.open(e, raw, false);
                            if !text.is_empty() {
                                builder.push(Node::Text(text.to_string()));
                            }
                            builder.close(&name);
                            offset = resume;
                            continue 'chunks;
                        }
                        builder.open(e, raw, false);
                    }
                    Event::Empty(ref e) => builder.open(e, raw, true),
                    Event::End(ref e) => {
                        builder.close(&String::from_utf8_lossy(e.name().as_ref()).to_lowercase())
                    }
                    Event::Text(_) => builder.push(Node::Text(raw.to_string())),
                    Event::Eof => break 'chunks,
                    // Declarations are taken care of by `markup_declaration`.
                    _ => {}
                }
            }
        }

        builder.finish()
    }

    /// Top-level nodes.
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Mutable access to the top-level nodes.
    pub fn children_mut(&mut self) -> &mut Vec<Node> {
        &mut self.children
    }

    /// Serializes the tree back to HTML.
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            node.write_html(&mut out);
        }
        out
    }

    /// Returns all elements in document order.
    pub fn elements(&self) -> Vec<&Element> {
        let mut out = Vec::new();
        collect_elements(&self.children, &mut out);
        out
    }

    /// Calls `f` for every element, parents before children.
    pub fn for_each_element_mut(&mut self, mut f: impl FnMut(&mut Element)) {
        visit_elements_mut(&mut self.children, &mut f);
    }

    /// Removes every element, subtree included, for which `keep` returns false.
    /// Returns the number of removed elements.
    pub fn retain_elements(&mut self, mut keep: impl FnMut(&Element) -> bool) -> usize {
        retain_in(&mut self.children, &mut keep)
    }
}

impl From<Vec<Node>> for Document {
    fn from(children: Vec<Node>) -> Self {
        Document { children }
    }
}

impl Node {
    fn write_html(&self, out: &mut String) {
        match self {
            Node::Element(element) => element.write_html(out),
            Node::Text(text) => out.push_str(text),
            Node::Comment(body) => {
                out.push_str("<!--");
                out.push_str(&body.replace('>', "&gt;"));
                out.push_str("-->");
            }
            Node::Doctype(body) => {
                out.push_str("<!");
                out.push_str(body);
                out.push('>');
            }
        }
    }
}

impl Element {
    /// Creates an element without attributes or children.
    pub fn new(name: impl Into<String>) -> Self {
        Element {
            name: name.into().to_lowercase(),
            attrs: Vec::new(),
            children: Vec::new(),
            self_closing: false,
        }
    }

    /// Lowercase tag name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the element.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// All attributes in source order.
    pub fn attrs(&self) -> &[Attribute] {
        &self.attrs
    }

    /// Raw value of the first attribute called `name`.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| attr.value.as_str())
    }

    /// Whether the element carries the attribute `name`.
    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.iter().any(|attr| attr.name == name)
    }

    /// Sets the attribute `name`, replacing all previous occurrences.
    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter().position(|attr| attr.name == name) {
            Some(pos) => {
                let mut index = 0;
                self.attrs.retain(|attr| {
                    let keep = attr.name != name || index == pos;
                    index += 1;
                    keep
                });
                if let Some(attr) = self.attrs.iter_mut().find(|attr| attr.name == name) {
                    attr.value = value;
                }
            }
            None => self.attrs.push(Attribute {
                name: name.to_string(),
                value,
            }),
        }
    }

    /// Removes every occurrence of the attribute `name` and returns the
    /// value of the first one.
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let first = self.attr(name).map(ToString::to_string);
        if first.is_some() {
            self.attrs.retain(|attr| attr.name != name);
        }
        first
    }

    /// Renames the attribute `from` to `to` in place. An existing `to`
    /// attribute is dropped, duplicates of `from` are collapsed into the
    /// first one. Returns whether `from` was present.
    pub fn rename_attr(&mut self, from: &str, to: &str) -> bool {
        if !self.has_attr(from) {
            return false;
        }
        let mut seen = false;
        self.attrs.retain(|attr| {
            if attr.name == to {
                false
            } else if attr.name == from {
                let keep = !seen;
                seen = true;
                keep
            } else {
                true
            }
        });
        if let Some(attr) = self.attrs.iter_mut().find(|attr| attr.name == from) {
            attr.name = to.to_string();
        }
        true
    }

    /// Whether the `class` attribute lists `class`.
    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .map_or(false, |classes| classes.split_whitespace().any(|c| c == class))
    }

    /// Adds `class` to the `class` attribute unless it is already there.
    pub fn add_class(&mut self, class: &str) {
        if self.has_class(class) {
            return;
        }
        let classes = match self.attr("class").map(str::trim) {
            Some(existing) if !existing.is_empty() => format!("{existing} {class}"),
            _ => class.to_string(),
        };
        self.set_attr("class", classes);
    }

    /// Removes `class` from the `class` attribute, dropping the attribute
    /// when nothing is left.
    pub fn remove_class(&mut self, class: &str) {
        let Some(classes) = self.attr("class") else {
            return;
        };
        let remaining = classes
            .split_whitespace()
            .filter(|c| *c != class)
            .collect::<Vec<_>>()
            .join(" ");
        if remaining.is_empty() {
            self.remove_attr("class");
        } else {
            self.set_attr("class", remaining);
        }
    }

    /// Child nodes.
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Mutable access to the child nodes.
    pub fn children_mut(&mut self) -> &mut Vec<Node> {
        &mut self.children
    }

    /// Whether the element can have no content.
    pub fn is_void(&self) -> bool {
        VOID_ELEMENTS.contains(&self.name.as_str())
    }

    /// The start tag, `<name attr="value">`.
    pub fn start_tag(&self) -> String {
        let mut out = String::new();
        self.write_start_tag(&mut out);
        out
    }

    /// The end tag, if the element has one.
    pub fn end_tag(&self) -> Option<String> {
        if self.is_void() || self.self_closing {
            None
        } else {
            Some(format!("</{}>", self.name))
        }
    }

    fn write_start_tag(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for attr in &self.attrs {
            out.push(' ');
            out.push_str(&attr.name);
            out.push_str("=\"");
            out.push_str(&attr.value.replace('"', "&quot;"));
            out.push('"');
        }
        if self.self_closing && !self.is_void() {
            out.push_str(" /");
        }
        out.push('>');
    }

    fn write_html(&self, out: &mut String) {
        self.write_start_tag(out);
        if let Some(end_tag) = self.end_tag() {
            for child in &self.children {
                child.write_html(out);
            }
            out.push_str(&end_tag);
        }
    }
}

/// Escapes text so it is displayed literally.
pub(crate) fn escape_text(text: &str) -> String {
    escaper::encode_minimal(text)
}

#[derive(Debug, Default)]
struct TreeBuilder {
    root: Vec<Node>,
    open: Vec<Element>,
}

impl TreeBuilder {
    fn push(&mut self, node: Node) {
        match self.open.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.root.push(node),
        }
    }

    fn open(&mut self, start: &BytesStart, raw: &str, self_closing: bool) {
        let name = lowercase_name(start);
        if !is_tag_name(&name) {
            // Browsers would read `<img/src=x>` as an image, keep it inert.
            self.push(Node::Text(escape_text(raw)));
            return;
        }

        let attrs = start
            .html_attributes()
            .with_checks(false)
            .filter_map(Result::ok)
            .map(|attr| Attribute {
                name: String::from_utf8_lossy(attr.key.as_ref()).to_lowercase(),
                value: String::from_utf8_lossy(&attr.value).into_owned(),
            })
            .filter(|attr| is_attribute_name(&attr.name))
            .collect();

        let element = Element {
            name,
            attrs,
            children: Vec::new(),
            self_closing,
        };
        if self_closing || element.is_void() {
            self.push(Node::Element(element));
        } else {
            self.open.push(element);
        }
    }

    fn close(&mut self, name: &str) {
        let Some(pos) = self.open.iter().rposition(|element| element.name == name) else {
            // Stray end tag.
            return;
        };
        while self.open.len() > pos {
            if let Some(element) = self.open.pop() {
                self.push(Node::Element(element));
            }
        }
    }

    fn finish(mut self) -> Document {
        while let Some(element) = self.open.pop() {
            self.push(Node::Element(element));
        }
        Document {
            children: self.root,
        }
    }
}

fn lowercase_name(start: &BytesStart) -> String {
    String::from_utf8_lossy(start.name().as_ref()).to_lowercase()
}

fn is_tag_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().map_or(false, |c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
}

fn is_attribute_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| !c.is_whitespace() && !c.is_control() && !matches!(c, '"' | '\'' | '<' | '>' | '/' | '='))
}

/// Tokenizes a comment, doctype or bogus comment at the start of `rest`
/// the way a browser does. Returns the node to keep, if any, and the
/// number of bytes it spans; `None` if `rest` starts with something else.
fn markup_declaration(rest: &str) -> Option<(Option<Node>, usize)> {
    if let Some(after) = rest.strip_prefix("<!--") {
        // `<!-->` and `<!--->` are complete, empty comments.
        for abrupt in [">", "->"] {
            if after.starts_with(abrupt) {
                return Some((Some(Node::Comment(String::new())), 4 + abrupt.len()));
            }
        }
        let (body_len, end_len) = match (after.find("-->"), after.find("--!>")) {
            (Some(dashes), Some(bang)) if bang < dashes => (bang, 4),
            (Some(dashes), _) => (dashes, 3),
            (None, Some(bang)) => (bang, 4),
            // Runs until the end of the input.
            (None, None) => (after.len(), 0),
        };
        let body = after.get(..body_len).unwrap_or_default();
        return Some((Some(Node::Comment(body.to_string())), 4 + body_len + end_len));
    }

    let body_start = if rest.starts_with("<!") {
        2
    } else if rest.starts_with("<?") {
        1
    } else {
        return None;
    };
    let tail = rest.get(body_start..).unwrap_or_default();
    let (body, len) = match tail.find('>') {
        Some(gt) => (tail.get(..gt).unwrap_or_default(), body_start + gt + 1),
        None => (tail, rest.len()),
    };

    let is_doctype = body
        .get(..7)
        .map_or(false, |keyword| keyword.eq_ignore_ascii_case("doctype"));
    let node = if !is_doctype {
        Some(Node::Comment(body.to_string()))
    } else if body.contains('<') {
        None
    } else {
        Some(Node::Doctype(body.to_string()))
    };
    Some((node, len))
}

/// Returns the raw content of a `<script>`/`<style>` element starting at
/// `start` and the offset right behind its end tag.
fn split_raw_text<'a>(html: &'a str, start: usize, name: &str) -> (&'a str, usize) {
    let rest = html.get(start..).unwrap_or_default();
    let end_tag = format!("</{name}");
    let Some(text_len) = rest.to_ascii_lowercase().find(&end_tag) else {
        return (rest, html.len());
    };
    let text = rest.get(..text_len).unwrap_or_default();
    let after_end_tag = rest
        .get(text_len..)
        .and_then(|tail| tail.find('>'))
        .map_or(html.len(), |gt| start + text_len + gt + 1);
    (text, after_end_tag)
}

fn collect_elements<'a>(nodes: &'a [Node], out: &mut Vec<&'a Element>) {
    for node in nodes {
        if let Node::Element(element) = node {
            out.push(element);
            collect_elements(&element.children, out);
        }
    }
}

fn visit_elements_mut(nodes: &mut [Node], f: &mut impl FnMut(&mut Element)) {
    for node in nodes {
        if let Node::Element(element) = node {
            f(element);
            visit_elements_mut(&mut element.children, f);
        }
    }
}

fn retain_in(nodes: &mut Vec<Node>, keep: &mut impl FnMut(&Element) -> bool) -> usize {
    let mut removed = 0;
    nodes.retain(|node| match node {
        Node::Element(element) => {
            let kept = keep(element);
            if !kept {
                removed += 1;
            }
            kept
        }
        _ => true,
    });
    for node in nodes.iter_mut() {
        if let Node::Element(element) = node {
            removed += retain_in(&mut element.children, keep);
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_roundtrip_wellformed() {
        let html = r#"<div class="a"><p>Hello <b>world</b></p><img src="x.png"></div>"#;
        assert_eq!(Document::parse(html).to_html(), html);
    }

    #[test]
    fn test_entities_kept_raw() {
        let html = r#"<p title="a &amp; b">1 &lt; 2 &nbsp;&#117;</p>"#;
        assert_eq!(Document::parse(html).to_html(), html);
    }

    #[test]
    fn test_unclosed_elements() {
        let doc = Document::parse("<div><p>one<p>two");
        assert_eq!(doc.to_html(), "<div><p>one<p>two</p></p></div>");
    }

    #[test]
    fn test_stray_end_tag() {
        let doc = Document::parse("<div>text</span></div>");
        assert_eq!(doc.to_html(), "<div>text</div>");
    }

    #[test]
    fn test_uppercase_and_unquoted() {
        let doc = Document::parse("<IMG SRC=tracker.gif WIDTH=1>");
        let elements = doc.elements();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].name(), "img");
        assert_eq!(elements[0].attr("src"), Some("tracker.gif"));
        assert_eq!(doc.to_html(), r#"<img src="tracker.gif" width="1">"#);
    }

    #[test]
    fn test_void_elements_take_no_children() {
        let doc = Document::parse("<p><br>after</p>");
        let p = doc.elements()[0];
        assert_eq!(p.children().len(), 2);
        assert_eq!(doc.to_html(), "<p><br>after</p>");
    }

    #[test]
    fn test_slash_in_tag_name_is_text() {
        let doc = Document::parse("<img/src=x>");
        assert!(doc.elements().is_empty());
        assert_eq!(doc.to_html(), "&lt;img/src=x&gt;");
    }

    #[test]
    fn test_style_content_is_raw() {
        let html = "<style>a > b { color: red } /* </p> */</style><p>x</p>";
        let doc = Document::parse(html);
        let names: Vec<_> = doc.elements().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["style", "p"]);
        assert_eq!(doc.to_html(), html);
    }

    #[test]
    fn test_unterminated_style() {
        let doc = Document::parse("<style>body { color: red }");
        assert_eq!(doc.to_html(), "<style>body { color: red }</style>");
    }

    #[test]
    fn test_comments_and_doctype() {
        let html = "<!DOCTYPE html><!-- hello --><p>x</p>";
        assert_eq!(Document::parse(html).to_html(), html);
    }

    #[test]
    fn test_comment_ends_like_in_browsers() {
        for (html, comment, after) in [
            ("<!--><img src=a>-->", "", "img"),
            ("<!---><img src=a>-->", "", "img"),
            ("<!-- x --!><img src=a>-->", " x ", "img"),
            ("<!-- a -- b --><b>x</b>", " a -- b ", "b"),
        ] {
            let doc = Document::parse(html);
            assert_eq!(doc.children()[0], Node::Comment(comment.to_string()), "{html}");
            assert_eq!(doc.elements()[0].name(), after, "{html}");
        }
    }

    #[test]
    fn test_comment_body_is_escaped() {
        let doc = Document::from(vec![Node::Comment("--><img src=a>".to_string())]);
        let html = doc.to_html();
        assert_eq!(html, "<!----&gt;<img src=a&gt;-->");
        let again = Document::parse(&html);
        assert!(again.elements().is_empty());
        assert_eq!(again.to_html(), html);
    }

    #[test]
    fn test_unterminated_comment() {
        let doc = Document::parse("<p>x<!-- <img src=a>");
        assert_eq!(doc.elements().len(), 1);
        assert_eq!(doc.to_html(), "<p>x<!-- <img src=a&gt;--></p>");
    }

    #[test]
    fn test_bogus_comments() {
        // CDATA and processing instructions end at the first `>`.
        let doc = Document::parse("<![CDATA[><img src=a>]]>");
        assert_eq!(doc.children()[0], Node::Comment("[CDATA[".to_string()));
        assert_eq!(doc.elements()[0].name(), "img");
        assert_eq!(doc.to_html(), r#"<!--[CDATA[--><img src="a">]]>"#);

        let doc = Document::parse(r#"<?xml version="1.0"?><p>x</p>"#);
        assert_eq!(doc.children()[0], Node::Comment(r#"?xml version="1.0"?"#.to_string()));
        assert_eq!(doc.to_html(), r#"<!--?xml version="1.0"?--><p>x</p>"#);
    }

    #[test]
    fn test_unclosed_processing_instruction() {
        let doc = Document::parse(
            r#"<?xml:namespace prefix = o ns = "urn:schemas-microsoft-com:office:office" /><p class="MsoNormal">Hello</p>"#,
        );
        let names: Vec<_> = doc.elements().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["p"]);
        assert!(doc.to_html().ends_with(r#"<p class="MsoNormal">Hello</p>"#));
    }

    #[test]
    fn test_doctype_with_markup_dropped() {
        let doc = Document::parse("<!DOCTYPE html <img src=a><p>x</p>");
        assert!(!matches!(doc.children()[0], Node::Doctype(_)));
        assert!(!doc.to_html().contains("<!DOCTYPE"));
    }

    #[test]
    fn test_attribute_quotes() {
        let doc = Document::parse(r#"<a title='say "hi"'>x</a>"#);
        assert_eq!(doc.elements()[0].attr("title"), Some(r#"say "hi""#));
        assert_eq!(doc.to_html(), r#"<a title="say &quot;hi&quot;">x</a>"#);
    }

    #[test]
    fn test_set_and_remove_attr() {
        let mut element = Element::new("img");
        element.set_attr("src", "a");
        element.set_attr("alt", "b");
        element.set_attr("src", "c");
        assert_eq!(element.start_tag(), r#"<img src="c" alt="b">"#);
        assert_eq!(element.remove_attr("src"), Some("c".to_string()));
        assert_eq!(element.remove_attr("src"), None);
        assert_eq!(element.start_tag(), r#"<img alt="b">"#);
    }

    #[test]
    fn test_rename_attr() {
        let doc = Document::parse(r#"<img proton-src="old" src="new" alt="x" src="dup">"#);
        let mut element = doc.elements()[0].clone();
        assert!(element.rename_attr("src", "proton-src"));
        assert_eq!(element.start_tag(), r#"<img proton-src="new" alt="x">"#);
        assert!(!element.rename_attr("src", "proton-src"));
    }

    #[test]
    fn test_classes() {
        let mut element = Element::new("img");
        element.add_class("proton-embedded");
        element.add_class("proton-embedded");
        assert_eq!(element.attr("class"), Some("proton-embedded"));
        element.set_attr("class", "a proton-embedded b");
        element.remove_class("proton-embedded");
        assert_eq!(element.attr("class"), Some("a b"));
        element.remove_class("a");
        element.remove_class("b");
        assert!(!element.has_attr("class"));
    }

    #[test]
    fn test_retain_elements() {
        let mut doc = Document::parse(r#"<div><img src="a"><p><img src="b"></p></div>"#);
        let removed = doc.retain_elements(|e| e.name() != "img");
        assert_eq!(removed, 2);
        assert_eq!(doc.to_html(), "<div><p></p></div>");
    }

    #[test]
    fn test_never_panics_on_garbage() {
        for input in [
            "<",
            "<<<>>>",
            "<a href=\"",
            "</",
            "<!--",
            "<![CDATA[",
            "<div \u{0}>",
            "<p>\u{1F600}<",
        ] {
            let doc = Document::parse(input);
            let again = Document::parse(&doc.to_html());
            assert_eq!(again.to_html(), doc.to_html(), "input {input:?}");
        }
    }
}
