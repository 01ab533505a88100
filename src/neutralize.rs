//! # Content neutralization
//!
//! Rewrites untrusted HTML so that rendering it loads nothing: resource
//! attributes get the `proton-` prefix, `<svg>` becomes `<proton-svg>` and
//! CSS `url(` calls become `proton-url(`. The rewrite is reversible with
//! [`unlock_remote_content`] once the user asks for remote content.
//!
//! Large inline `data:` images are moved to a [`Base64Cache`] to keep the
//! markup small; [`expand`] puts them back.

use std::borrow::Cow;

use strum_macros::{AsRefStr, EnumString};

use crate::base64_cache::Base64Cache;
use crate::constants::{BASE64_MARKER_ATTR, DEFAULT_BASE64_THRESHOLD, NEUTRALIZED_PREFIX};
use crate::css::{self, StyleSource};
use crate::dom::{escape_text, Document, Element, Node};

/// Attributes that make a rendering surface fetch something.
/// Anchors' `href` is navigation and stays untouched.
const LOADING_ATTRIBUTES: &[&str] = &["src", "srcset", "background", "poster", "xlink:href"];

/// Elements whose content is shown as source code.
const CODE_ELEMENTS: &[&str] = &["code", "pre"];

const SVG: &str = "svg";
const NEUTRALIZED_SVG: &str = "proton-svg";

/// Contexts in which content is trusted and must not be rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
pub enum Action {
    /// The user is inserting their own content into the composer.
    #[strum(serialize = "user.inject")]
    UserInject,
}

/// Neutralizer input.
#[derive(Debug, Clone)]
pub enum Input<'a> {
    /// Markup that still has to be parsed.
    Html(&'a str),
    /// An already parsed tree.
    Document(Document),
}

impl<'a> From<&'a str> for Input<'a> {
    fn from(html: &'a str) -> Self {
        Input::Html(html)
    }
}

impl<'a> From<&'a String> for Input<'a> {
    fn from(html: &'a String) -> Self {
        Input::Html(html)
    }
}

impl From<Document> for Input<'_> {
    fn from(document: Document) -> Self {
        Input::Document(document)
    }
}

impl Input<'_> {
    fn into_document(self) -> Document {
        match self {
            Input::Html(html) => Document::parse(html),
            Input::Document(document) => document,
        }
    }
}

/// Options of [`neutralize`].
#[derive(Debug)]
pub struct NeutralizeOptions<'a> {
    /// Where to move large inline payloads. Without a cache they are
    /// neutralized like any other `src`.
    pub cache: Option<&'a mut Base64Cache>,

    /// Set for trusted contexts that skip neutralization.
    pub action: Option<Action>,

    /// Inline `data:` URIs longer than this are moved to the cache.
    pub base64_threshold: usize,
}

impl Default for NeutralizeOptions<'_> {
    fn default() -> Self {
        Self {
            cache: None,
            action: None,
            base64_threshold: DEFAULT_BASE64_THRESHOLD,
        }
    }
}

impl<'a> NeutralizeOptions<'a> {
    /// Options moving large payloads to `cache`.
    pub fn with_cache(cache: &'a mut Base64Cache) -> Self {
        Self {
            cache: Some(cache),
            ..Default::default()
        }
    }
}

/// Neutralizes untrusted content.
///
/// Never fails: markup the parser cannot make sense of ends up as escaped
/// text. Running it on its own output changes nothing.
pub fn neutralize<'a>(input: impl Into<Input<'a>>, options: NeutralizeOptions<'_>) -> Document {
    let mut document = input.into().into_document();
    if options.action == Some(Action::UserInject) {
        return document;
    }

    let mut pass = Pass {
        cache: options.cache,
        base64_threshold: options.base64_threshold,
        renamed: 0,
        extracted: 0,
        inerted: 0,
    };
    let children = std::mem::take(document.children_mut());
    *document.children_mut() = pass.walk(children, false);

    tracing::trace!(
        renamed = pass.renamed,
        extracted = pass.extracted,
        inerted = pass.inerted,
        "Neutralized content."
    );
    document
}

/// Puts payloads moved out by [`neutralize`] back into the markup.
///
/// Markers whose payload is not in `cache` are left as they are.
pub fn expand<'a>(input: impl Into<Input<'a>>, cache: &Base64Cache) -> String {
    let mut document = input.into().into_document();
    let mut missing = 0;
    document.for_each_element_mut(|element| {
        let Some(key) = element.attr(BASE64_MARKER_ATTR) else {
            return;
        };
        let Some(payload) = cache.get(key) else {
            missing += 1;
            return;
        };
        element.remove_attr(BASE64_MARKER_ATTR);
        element.set_attr("src", payload);
    });
    if missing > 0 {
        tracing::warn!("{missing} inline payloads are missing from the cache.");
    }
    document.to_html()
}

/// Reverts neutralization so the surface may load remote content.
///
/// `cid:` references stay neutralized, they are resolved by the embedded
/// content resolver instead.
pub fn unlock_remote_content(document: &mut Document) {
    document.for_each_element_mut(|element| {
        if element.name() == NEUTRALIZED_SVG {
            element.set_name(SVG);
        }
        for name in LOADING_ATTRIBUTES {
            let prefixed = format!("{NEUTRALIZED_PREFIX}{name}");
            let is_cid = element
                .attr(&prefixed)
                .map_or(false, |value| value.trim_start().starts_with("cid:"));
            if is_cid || element.has_attr(name) {
                continue;
            }
            element.rename_attr(&prefixed, name);
        }
        if let Some(style) = element.attr("style").and_then(|s| owned(css::restore_style(s))) {
            element.set_attr("style", style);
        }
        if element.name() == "style" {
            for child in element.children_mut() {
                if let Node::Text(text) = child {
                    if let Some(restored) = owned(css::restore_style(text)) {
                        *text = restored;
                    }
                }
            }
        }
    });
}

struct Pass<'a> {
    cache: Option<&'a mut Base64Cache>,
    base64_threshold: usize,
    renamed: usize,
    extracted: usize,
    inerted: usize,
}

impl Pass<'_> {
    fn walk(&mut self, nodes: Vec<Node>, in_code: bool) -> Vec<Node> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            let mut element = match node {
                Node::Element(element) => element,
                other => {
                    out.push(other);
                    continue;
                }
            };

            let children = std::mem::take(element.children_mut());
            if in_code {
                if loads_resources(&element, &children) {
                    // Source code shows markup, it does not render it.
                    self.inerted += 1;
                    out.push(Node::Text(escape_text(&element.start_tag())));
                    if element.name() == "style" {
                        out.extend(children.into_iter().map(|child| match child {
                            Node::Text(text) => Node::Text(escape_text(&text)),
                            other => other,
                        }));
                    } else {
                        out.extend(self.walk(children, true));
                    }
                    if let Some(end_tag) = element.end_tag() {
                        out.push(Node::Text(escape_text(&end_tag)));
                    }
                } else {
                    *element.children_mut() = self.walk(children, true);
                    out.push(Node::Element(element));
                }
                continue;
            }

            let children_in_code = CODE_ELEMENTS.contains(&element.name());
            self.neutralize_element(&mut element);
            *element.children_mut() = self.walk(children, children_in_code);
            if element.name() == "style" {
                self.neutralize_stylesheet(&mut element);
            }
            out.push(Node::Element(element));
        }
        out
    }

    fn neutralize_element(&mut self, element: &mut Element) {
        if element.name() == SVG {
            element.set_name(NEUTRALIZED_SVG);
            self.renamed += 1;
        }

        // Extraction comes first, cached payloads must not end up renamed.
        self.extract_payload(element);

        for name in LOADING_ATTRIBUTES {
            // A live attribute wins over a stale prefixed one.
            if element.rename_attr(name, &format!("{NEUTRALIZED_PREFIX}{name}")) {
                self.renamed += 1;
            }
        }

        if let Some(style) = element
            .attr("style")
            .and_then(|style| owned(css::neutralize_style(style, StyleSource::Attribute)))
        {
            element.set_attr("style", style);
            self.renamed += 1;
        }
    }

    fn neutralize_stylesheet(&mut self, element: &mut Element) {
        for child in element.children_mut() {
            if let Node::Text(text) = child {
                if let Some(rewritten) = owned(css::neutralize_style(text, StyleSource::Stylesheet))
                {
                    *text = rewritten;
                    self.renamed += 1;
                }
            }
        }
    }

    fn extract_payload(&mut self, element: &mut Element) {
        let threshold = self.base64_threshold;
        let Some(cache) = self.cache.as_deref_mut() else {
            return;
        };
        let Some(src) = element.attr("src") else {
            return;
        };
        if src.len() <= threshold || !is_base64_data_uri(src) {
            return;
        }
        let key = cache.put(src);
        element.remove_attr("src");
        element.set_attr(BASE64_MARKER_ATTR, key);
        self.extracted += 1;
    }
}

/// Whether an element inside source code would load something if it
/// stayed markup.
fn loads_resources(element: &Element, children: &[Node]) -> bool {
    element.name() == SVG
        || LOADING_ATTRIBUTES.iter().any(|name| element.has_attr(name))
        || element
            .attr("style")
            .map_or(false, |style| css::loads_resources(style, StyleSource::Attribute))
        || (element.name() == "style"
            && children.iter().any(|child| {
                matches!(child, Node::Text(text) if css::loads_resources(text, StyleSource::Stylesheet))
            }))
}

fn is_base64_data_uri(value: &str) -> bool {
    value
        .trim_start()
        .split_once(',')
        .map_or(false, |(head, _)| {
            let head = head.to_ascii_lowercase();
            head.starts_with("data:") && head.ends_with(";base64")
        })
}

fn owned(value: Cow<'_, str>) -> Option<String> {
    match value {
        Cow::Owned(value) => Some(value),
        Cow::Borrowed(_) => None,
    }
}

#[cfg(test)]
mod neutralize_tests;
