use scraper::{Html, Selector};

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlText {
    pub text: String,
    pub title: Option<String>,
    pub has_login_form: bool,
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_first_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn has_match(document: &Html, selector: &str) -> bool {
    Selector::parse(selector)
        .map(|sel| document.select(&sel).next().is_some())
        .unwrap_or(false)
}

/// Visible text of a page, with the title taken from `og:title`, `<title>`
/// or the first `<h1>`, in that order.
pub fn extract_html(bytes: &[u8]) -> HtmlText {
    let source = String::from_utf8_lossy(bytes);
    let document = Html::parse_document(&source);

    let mut parts = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| SKIPPED_ELEMENTS.contains(&el.name()))
        });
        if hidden {
            continue;
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
    }

    let title = select_first_attr(&document, r#"meta[property="og:title"]"#, "content")
        .or_else(|| select_first_attr(&document, r#"meta[name="og:title"]"#, "content"))
        .or_else(|| select_first_text(&document, "title"))
        .or_else(|| select_first_text(&document, "h1"));

    HtmlText {
        text: parts.join(" "),
        title,
        has_login_form: has_match(&document, r#"input[type="password"]"#),
    }
}
