use std::str::FromStr;

use pretty_assertions::assert_eq;
use proptest::prelude::*;

use super::*;
use crate::base64_cache::content_hash;

fn neutralized(html: &str) -> String {
    neutralize(html, NeutralizeOptions::default()).to_html()
}

fn long_payload() -> String {
    format!("data:image/png;base64,{}", "iVBORw0KGgo".repeat(40))
}

#[test]
fn test_resource_attributes_renamed() {
    assert_eq!(
        neutralized(r#"<img src="https://tracker.example/p.gif" alt="pixel">"#),
        r#"<img proton-src="https://tracker.example/p.gif" alt="pixel">"#
    );
    assert_eq!(
        neutralized(
            r#"<video poster="p.jpg" src="v.webm"><source srcset="a.webp 2x"></video><table background="bg.png"><tr><td>x</td></tr></table>"#
        ),
        r#"<video proton-poster="p.jpg" proton-src="v.webm"><source proton-srcset="a.webp 2x"></video><table proton-background="bg.png"><tr><td>x</td></tr></table>"#
    );
}

#[test]
fn test_links_untouched() {
    let link = r#"<a href="https://proton.me/?src=x">link</a>"#;
    assert_eq!(neutralized(link), link);
    assert_eq!(
        neutralized(r#"<a href="https://proton.me"><img src="https://proton.me/logo.png"></a>"#),
        r#"<a href="https://proton.me"><img proton-src="https://proton.me/logo.png"></a>"#
    );
}

#[test]
fn test_text_untouched() {
    let text = r#"<p>Use src="x.png" or background: url(foo) in your template.</p>"#;
    assert_eq!(neutralized(text), text);
}

#[test]
fn test_svg() {
    assert_eq!(
        neutralized(r#"<svg width="5"><image xlink:href="https://t/x.png"/></svg>"#),
        r#"<proton-svg width="5"><image proton-xlink:href="https://t/x.png" /></proton-svg>"#
    );
}

#[test]
fn test_style_attribute() {
    assert_eq!(
        neutralized(r#"<div style="background: url('https://i.imgur.com/WScAnHr.jpg')">ddewdwed</div>"#),
        r#"<div style="background: proton-url('https://i.imgur.com/WScAnHr.jpg')">ddewdwed</div>"#
    );
}

#[test]
fn test_backslash_escaped_url() {
    let document = neutralize(
        r#"<div style="background:\75rl('https://t/')">x</div>"#,
        NeutralizeOptions::default(),
    );
    let style = document.elements()[0].attr("style").unwrap().to_string();
    assert!(style.contains("proton-url("), "{style}");
    assert!(!css::loads_resources(&style, StyleSource::Attribute));
}

#[test]
fn test_obfuscated_url_in_style_attribute() {
    for spelling in [
        "url(",
        "&#117;rl(",
        "&#x75;rl(",
        "u&#114l(",
        "url&lpar;",
        "url&#40;",
        "url&#x00028;",
        "u\\rl(",
        "\\75\\72\\6C(",
        "\\75 \\72 \\6C (",
        "\\x75\\x72\\x6C(",
        "\\u0075\\u0072\\u006C(",
        "&#x75r\\6c(",
    ] {
        let html = format!(r#"<div style="background: {spelling}'https://t/')">x</div>"#);
        let document = neutralize(html.as_str(), NeutralizeOptions::default());
        let style = document.elements()[0].attr("style").unwrap().to_string();
        assert!(
            !css::loads_resources(&style, StyleSource::Attribute),
            "{spelling}: {style}"
        );
        assert!(style.contains("proton-url("), "{spelling}: {style}");
    }
}

#[test]
fn test_stylesheet() {
    assert_eq!(
        neutralized("<style>body { background: url(https://t/bg.png) }</style><p>x</p>"),
        "<style>body { background: proton-url(https://t/bg.png) }</style><p>x</p>"
    );
}

#[test]
fn test_code_is_exempt() {
    assert_eq!(
        neutralized(r#"<pre><code><img src="polo.fr"></code></pre>"#),
        "<pre><code>&lt;img src=&quot;polo.fr&quot;&gt;</code></pre>"
    );

    let highlighted = r#"<pre><span class="kw">fn</span> main() { let src = "x"; }</pre>"#;
    assert_eq!(neutralized(highlighted), highlighted);

    assert_eq!(
        neutralized(r#"<code><span style="background:url(x)">a</span></code>"#),
        "<code>&lt;span style=&quot;background:url(x)&quot;&gt;a&lt;/span&gt;</code>"
    );

    // The code element itself is not inside source code.
    assert_eq!(
        neutralized(r#"<pre background="x.png">text</pre>"#),
        r#"<pre proton-background="x.png">text</pre>"#
    );
}

#[test]
fn test_nothing_renamed_inside_code() {
    let document = neutralize(
        r#"<div><pre><img src="a.png"><b class="x">bold</b><svg><image xlink:href="b"/></svg><i style="background:url(c)">i</i></pre></div>"#,
        NeutralizeOptions::default(),
    );
    let pre = document
        .elements()
        .into_iter()
        .find(|element| element.name() == "pre")
        .unwrap();
    let inside = Document::from(pre.children().to_vec());
    let names: Vec<_> = inside.elements().iter().map(|e| e.name().to_string()).collect();
    assert_eq!(names, vec!["b"]);
    for element in inside.elements() {
        for attr in element.attrs() {
            assert!(!attr.name.starts_with(NEUTRALIZED_PREFIX), "{attr:?}");
            assert!(!LOADING_ATTRIBUTES.contains(&attr.name.as_str()), "{attr:?}");
        }
    }
}

#[test]
fn test_user_inject_passthrough() {
    let html = r#"<img src="x.png"><svg></svg><div style="background:url(y)"></div>"#;
    let document = neutralize(
        html,
        NeutralizeOptions {
            action: Some(Action::UserInject),
            ..Default::default()
        },
    );
    assert_eq!(document.to_html(), html);
    assert_eq!(Action::from_str("user.inject"), Ok(Action::UserInject));
    assert_eq!(Action::UserInject.as_ref(), "user.inject");
}

#[test]
fn test_base64_extracted_and_expanded() {
    let payload = long_payload();
    let html = format!(r#"<p><img alt="inline" src="{payload}"></p>"#);
    let mut cache = Base64Cache::new();

    let document = neutralize(html.as_str(), NeutralizeOptions::with_cache(&mut cache));
    let output = document.to_html();
    let key = content_hash(&payload);
    assert_eq!(
        output,
        format!(r#"<p><img alt="inline" {BASE64_MARKER_ATTR}="{key}"></p>"#)
    );
    assert_eq!(cache.get(&key), Some(payload.as_str()));

    assert_eq!(expand(output.as_str(), &cache), html);
    assert_eq!(expand(document, &cache), html);
}

#[test]
fn test_base64_below_threshold() {
    let short = "data:image/png;base64,AAAA";
    let mut cache = Base64Cache::new();
    let output = neutralize(
        format!(r#"<img src="{short}">"#).as_str(),
        NeutralizeOptions::with_cache(&mut cache),
    )
    .to_html();
    assert_eq!(output, format!(r#"<img proton-src="{short}">"#));
    assert!(cache.is_empty());

    let mut cache = Base64Cache::new();
    let output = neutralize(
        format!(r#"<img src="{short}">"#).as_str(),
        NeutralizeOptions {
            cache: Some(&mut cache),
            base64_threshold: 10,
            action: None,
        },
    )
    .to_html();
    assert!(output.contains(BASE64_MARKER_ATTR));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_base64_without_cache() {
    let payload = long_payload();
    assert_eq!(
        neutralized(&format!(r#"<img src="{payload}">"#)),
        format!(r#"<img proton-src="{payload}">"#)
    );
}

#[test]
fn test_expand_missing_payload() {
    let html = format!(r#"<img {BASE64_MARKER_ATTR}="unknown">"#);
    assert_eq!(expand(html.as_str(), &Base64Cache::new()), html);
}

#[test]
fn test_idempotent() {
    let payload = long_payload();
    let html = format!(
        r#"<div style="background:url(a)"><img src="b.png"><img src="{payload}"><svg></svg><pre><img src="c"></pre><style>p{{background:url(d)}}</style></div>"#
    );
    let mut cache = Base64Cache::new();
    let once = neutralize(html.as_str(), NeutralizeOptions::with_cache(&mut cache)).to_html();
    assert_eq!(cache.len(), 1);
    let twice = neutralize(once.as_str(), NeutralizeOptions::with_cache(&mut cache)).to_html();
    assert_eq!(twice, once);
    assert_eq!(cache.len(), 1);
    assert!(!twice.contains("proton-proton-"));
}

#[test]
fn test_live_attribute_wins() {
    assert_eq!(
        neutralized(r#"<img proton-src="https://old" src="https://new">"#),
        r#"<img proton-src="https://new">"#
    );
}

#[test]
fn test_malformed_markup() {
    assert_eq!(
        neutralized(r#"<div><img src="x.png"></span><p>text"#),
        r#"<div><img proton-src="x.png"><p>text</p></div>"#
    );

    for html in [
        r#"<img src="https://t/x.png"#,
        r#"<p>hi</p><img src="https://t/x.png" <b>"#,
        r#"<IMG SRC=https://t/x.png>"#,
        r#"<img/src=https://t/x.png>"#,
        r#"<div style='background:url(https://t/)'"#,
    ] {
        let document = neutralize(html, NeutralizeOptions::default());
        for element in document.elements() {
            for name in LOADING_ATTRIBUTES {
                assert!(!element.has_attr(name), "{html} -> {}", document.to_html());
            }
            if let Some(style) = element.attr("style") {
                assert!(!css::loads_resources(style, StyleSource::Attribute));
            }
        }
    }
}

/// Asserts that nothing in the serialized `html` would load once a browser
/// parses it.
fn assert_inert(input: &str, html: &str) {
    for element in Document::parse(html).elements() {
        for name in LOADING_ATTRIBUTES {
            assert!(!element.has_attr(name), "{input} -> {html}");
        }
        assert_ne!(element.name(), SVG, "{input} -> {html}");
        if let Some(style) = element.attr("style") {
            assert!(
                !css::loads_resources(style, StyleSource::Attribute),
                "{input} -> {html}"
            );
        }
    }
}

#[test]
fn test_comments_cannot_hide_markup() {
    for html in [
        "<!--><img src=https://t/a.gif>-->",
        "<!---><img src=https://t/a.gif>-->",
        "<!-- x --!><img src=https://t/b.gif>-->",
        "<![CDATA[><img src=https://t/c.gif>]]>",
        "<!x><img src=https://t/d.gif>",
        "<!DOCTYPE html <img src=https://t/e.gif>><p>x</p>",
        "<p><!-- <img src=https://t/f.gif> -- > --></p>",
    ] {
        let output = neutralized(html);
        assert_inert(html, &output);
        assert_eq!(neutralized(&output), output, "{html}");
    }

    assert_eq!(
        neutralized("<!--><img src=https://t/a.gif>-->"),
        r#"<!----><img proton-src="https://t/a.gif">-->"#
    );
    assert_eq!(
        neutralized("<![CDATA[><img src=https://t/c.gif>]]>"),
        r#"<!--[CDATA[--><img proton-src="https://t/c.gif">]]>"#
    );
}

#[test]
fn test_outlook_namespace_declaration() {
    let html = r#"<?xml:namespace prefix = o ns = "urn:schemas-microsoft-com:office:office" /><p class="MsoNormal">Hello <img src="https://t/x.gif"></p>"#;
    let output = neutralized(html);
    assert!(
        output.ends_with(r#"<p class="MsoNormal">Hello <img proton-src="https://t/x.gif"></p>"#),
        "{output}"
    );
    assert!(!output.contains("&lt;p"), "{output}");
    assert_inert(html, &output);

    let closed = r#"<?php echo 1; ?><img src="https://t/y.gif">"#;
    let output = neutralized(closed);
    assert!(output.ends_with(r#"<img proton-src="https://t/y.gif">"#), "{output}");
    assert_inert(closed, &output);
}

#[test]
fn test_double_escaped_url_stays_inert() {
    let html = r#"<div style="background:url(https://t/1); background-image: \5c 75rl(https://t/2)">x</div>"#;
    let output = neutralized(html);
    assert_eq!(
        output,
        r#"<div style="background:proton-url(https://t/1); background-image: \5c 75rl(https://t/2)">x</div>"#
    );
    assert_inert(html, &output);

    let sheet = r"<style>a{background:url(x)} b{background:\5c 75rl(y)} i{background:\\75rl(z)}</style>";
    let output = neutralized(sheet);
    assert_eq!(
        output,
        r"<style>a{background:proton-url(x)} b{background:\5c 75rl(y)} i{background:\\75rl(z)}</style>"
    );
    let document = Document::parse(&output);
    let Node::Text(text) = &document.elements()[0].children()[0] else {
        panic!("no stylesheet text in {output}");
    };
    assert!(!css::loads_resources(text, StyleSource::Stylesheet));
}

#[test]
fn test_document_input() {
    let html = r#"<img src="a.png">"#;
    assert_eq!(
        neutralize(Document::parse(html), NeutralizeOptions::default()).to_html(),
        neutralized(html)
    );
}

#[test]
fn test_unlock_remote_content() {
    let mut document = neutralize(
        r#"<img src="a.png"><img src="cid:1"><svg></svg><div style="background:url(b.png)"></div><style>p{background:url(c)}</style>"#,
        NeutralizeOptions::default(),
    );
    unlock_remote_content(&mut document);
    assert_eq!(
        document.to_html(),
        r#"<img src="a.png"><img proton-src="cid:1"><svg></svg><div style="background:url(b.png)"></div><style>p{background:url(c)}</style>"#
    );
}

const FRAGMENTS: &[&str] = &[
    "<div>",
    "</div>",
    "<p>",
    "<pre>",
    "</pre>",
    "<code>",
    "</code>",
    "<svg>",
    "</svg>",
    "plain text",
    "Tom &amp; Jerry",
    "1 > 0",
    r#"<img src="a.png">"#,
    r#"<img src="data:image/gif;base64,R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7">"#,
    r#"<span style="background:\75rl(x)">"#,
    "</span>",
    r#"<a href="https://x/?src=1">l</a>"#,
    r#"<video poster="p.jpg" src="v.webm">"#,
    "</video>",
    "<style>a{background:url(x)}</style>",
    "<!-- comment -->",
    "<!-->",
    "<!--",
    "-->",
    "--!>",
    "<![CDATA[",
    "]]>",
    r#"<?xml:namespace prefix = o ns = "urn:x" />"#,
    r#"<div style="background:url(y); color:\5c 75rl(x)">"#,
    "<br>",
];

proptest! {
    #[test]
    fn test_fixed_point(fragments in prop::collection::vec(prop::sample::select(FRAGMENTS), 0..16)) {
        let html = fragments.concat();
        let mut cache = Base64Cache::new();
        let once = neutralize(html.as_str(), NeutralizeOptions::with_cache(&mut cache)).to_html();
        let cached = cache.len();
        let twice = neutralize(once.as_str(), NeutralizeOptions::with_cache(&mut cache)).to_html();
        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(cache.len(), cached);
    }
}
