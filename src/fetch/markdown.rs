//! Markdown detection and local HTML-to-markdown conversion.

use scraper::{ElementRef, Html, Selector};

/// Bodies smaller than this never pass the markdown heuristic.
const MIN_MARKDOWN_BYTES: usize = 64;

/// Does this body look like HTML rather than text/markdown?
pub fn is_htmlish(text: &str) -> bool {
    let head: String = text.trim_start().chars().take(200).collect::<String>().to_lowercase();
    if head.starts_with("<!doctype") || head.starts_with("<html") {
        return true;
    }
    let lines: Vec<&str> = text.lines().take(50).collect();
    if lines.is_empty() {
        return false;
    }
    let tag_lines = lines
        .iter()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with('<') && t.chars().nth(1).is_some_and(|c| c.is_ascii_alphabetic())
        })
        .count();
    tag_lines as f32 / lines.len() as f32 > 0.3
}

/// Markdown heuristic: non-trivial size, not HTML, and at least one heading,
/// list marker, or fenced code block.
pub fn looks_like_markdown(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.len() < MIN_MARKDOWN_BYTES || is_htmlish(trimmed) {
        return false;
    }
    trimmed.lines().any(|line| {
        let l = line.trim_start();
        l.starts_with("# ")
            || l.starts_with("## ")
            || l.starts_with("### ")
            || l.starts_with("- ")
            || l.starts_with("* ")
            || l.starts_with("```")
    })
}

const BLOCK_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "pre", "ul", "ol", "blockquote",
];

const SKIP_TAGS: &[&str] = &["script", "style", "nav", "header", "footer", "noscript"];

/// Convert an HTML document to markdown: headings, paragraphs, lists, links,
/// emphasis, inline and fenced code, blockquotes. Chrome (nav, scripts,
/// footers) is dropped.
pub fn html_to_markdown(html: &str) -> String {
    let document = Html::parse_document(html);
    let selector = Selector::parse(&BLOCK_TAGS.join(", ")).expect("static selector");

    let mut out = String::new();
    for element in document.select(&selector) {
        if has_block_or_skipped_ancestor(&element) {
            continue;
        }
        render_block(&element, &mut out);
    }
    // Collapse runs of blank lines left by empty elements.
    let mut collapsed = String::with_capacity(out.len());
    let mut blank_run = 0;
    for line in out.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        collapsed.push_str(line);
        collapsed.push('\n');
    }
    collapsed.trim().to_string()
}

fn has_block_or_skipped_ancestor(element: &ElementRef) -> bool {
    let mut node = element.parent();
    while let Some(n) = node {
        if let Some(parent) = ElementRef::wrap(n) {
            let name = parent.value().name();
            if BLOCK_TAGS.contains(&name) || SKIP_TAGS.contains(&name) {
                return true;
            }
        }
        node = n.parent();
    }
    false
}

fn render_block(element: &ElementRef, out: &mut String) {
    let name = element.value().name();
    match name {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = name[1..].parse::<usize>().unwrap_or(1);
            let mut text = String::new();
            render_inline(element, &mut text);
            let text = text.trim();
            if !text.is_empty() {
                out.push_str(&"#".repeat(level));
                out.push(' ');
                out.push_str(text);
                out.push_str("\n\n");
            }
        }
        "p" => {
            let mut text = String::new();
            render_inline(element, &mut text);
            let text = text.trim();
            if !text.is_empty() {
                out.push_str(text);
                out.push_str("\n\n");
            }
        }
        "pre" => {
            let code: String = element.text().collect();
            let code = code.trim_matches('\n');
            if !code.is_empty() {
                out.push_str("```\n");
                out.push_str(code);
                out.push_str("\n```\n\n");
            }
        }
        "ul" | "ol" => {
            render_list(element, out, name == "ol");
            out.push('\n');
        }
        "blockquote" => {
            let mut text = String::new();
            render_inline(element, &mut text);
            for line in text.trim().lines() {
                out.push_str("> ");
                out.push_str(line.trim());
                out.push('\n');
            }
            out.push('\n');
        }
        _ => {}
    }
}

fn render_list(element: &ElementRef, out: &mut String, ordered: bool) {
    let mut index = 1;
    for child in element.children() {
        let Some(item) = ElementRef::wrap(child) else {
            continue;
        };
        if item.value().name() != "li" {
            continue;
        }
        let mut text = String::new();
        render_inline(&item, &mut text);
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        if ordered {
            out.push_str(&format!("{index}. {text}\n"));
            index += 1;
        } else {
            out.push_str(&format!("- {text}\n"));
        }
    }
}

fn render_inline(element: &ElementRef, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(&text.replace('\n', " "));
            continue;
        }
        let Some(el) = ElementRef::wrap(child) else {
            continue;
        };
        let name = el.value().name();
        if SKIP_TAGS.contains(&name) {
            continue;
        }
        match name {
            "a" => {
                let mut label = String::new();
                render_inline(&el, &mut label);
                let label = label.trim().to_string();
                match el.value().attr("href") {
                    Some(href) if !label.is_empty() => {
                        out.push_str(&format!("[{label}]({href})"));
                    }
                    _ => out.push_str(&label),
                }
            }
            "code" => {
                let code: String = el.text().collect();
                out.push('`');
                out.push_str(code.trim());
                out.push('`');
            }
            "strong" | "b" => {
                let mut inner = String::new();
                render_inline(&el, &mut inner);
                out.push_str(&format!("**{}**", inner.trim()));
            }
            "em" | "i" => {
                let mut inner = String::new();
                render_inline(&el, &mut inner);
                out.push_str(&format!("*{}*", inner.trim()));
            }
            "br" => out.push('\n'),
            _ => render_inline(&el, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doctype_is_htmlish() {
        assert!(is_htmlish("<!DOCTYPE html><html><body>x</body></html>"));
        assert!(is_htmlish("<html lang=\"en\"><head></head></html>"));
    }

    #[test]
    fn markdown_body_is_not_htmlish() {
        let md = "# Title\n\nSome prose here.\n\n- item one\n- item two\n";
        assert!(!is_htmlish(md));
    }

    #[test]
    fn heuristic_requires_markers_and_size() {
        let with_markers = format!("# Heading\n\n{}", "prose ".repeat(30));
        assert!(looks_like_markdown(&with_markers));
        assert!(!looks_like_markdown("# tiny"));
        let plain = "just plain prose without any structure at all ".repeat(5);
        assert!(!looks_like_markdown(&plain));
    }

    #[test]
    fn converts_headings_and_paragraphs() {
        let html = "<html><body><h1>Guide</h1><p>Intro text.</p><h2>Setup</h2>\
                    <p>Install the thing.</p></body></html>";
        let md = html_to_markdown(html);
        assert!(md.contains("# Guide"));
        assert!(md.contains("## Setup"));
        assert!(md.contains("Intro text."));
    }

    #[test]
    fn converts_lists_links_and_code() {
        let html = r##"<body>
            <ul><li>alpha</li><li><a href="https://x.dev/doc">docs</a></li></ul>
            <ol><li>first</li><li>second</li></ol>
            <p>Run <code>cargo test</code> now.</p>
            <pre>fn main() {}</pre>
        </body>"##;
        let md = html_to_markdown(html);
        assert!(md.contains("- alpha"));
        assert!(md.contains("[docs](https://x.dev/doc)"));
        assert!(md.contains("1. first"));
        assert!(md.contains("2. second"));
        assert!(md.contains("`cargo test`"));
        assert!(md.contains("```\nfn main() {}\n```"));
    }

    #[test]
    fn drops_scripts_and_nav() {
        let html = "<body><nav><p>menu menu</p></nav><script>alert(1)</script>\
                    <p>real content</p></body>";
        let md = html_to_markdown(html);
        assert!(md.contains("real content"));
        assert!(!md.contains("menu"));
        assert!(!md.contains("alert"));
    }

    #[test]
    fn blockquote_prefixes_lines() {
        let html = "<body><blockquote>wise words</blockquote></body>";
        assert!(html_to_markdown(html).contains("> wise words"));
    }

    #[test]
    fn emphasis_renders() {
        let html = "<body><p>this is <strong>bold</strong> and <em>slanted</em></p></body>";
        let md = html_to_markdown(html);
        assert!(md.contains("**bold**"));
        assert!(md.contains("*slanted*"));
    }

    #[test]
    fn conversion_yields_a_heading_for_typical_pages() {
        let html = "<html><head><title>t</title></head><body><h1>API Reference</h1>\
                    <p>Endpoints below.</p></body></html>";
        let md = html_to_markdown(html);
        assert!(md.lines().any(|l| l.starts_with("# ")));
    }
}
