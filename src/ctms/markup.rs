//! Structural lookups over CTMS pages.
//!
//! CTMS pages vary by account and by portal version, so every lookup here
//! returns `Option`/empty collections instead of failing when a node is absent.

use html_scraper::{ElementRef, Html, Node, Selector};
use std::sync::LazyLock;
use tracing::debug;

static ID_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("[id]").unwrap());

/// A parsed portal page.
#[derive(Debug)]
pub struct Document {
    html: Html,
}

impl Document {
    pub fn parse(body: &str) -> Self {
        Self {
            html: Html::parse_document(body),
        }
    }

    pub fn html(&self) -> &Html {
        &self.html
    }

    /// Find an element by its `id` attribute.
    pub fn by_id(&self, id: &str) -> Option<ElementRef<'_>> {
        self.html
            .select(&ID_SELECTOR)
            .find(|el| el.value().id() == Some(id))
    }

    /// First element matching a CSS selector. Invalid selectors match nothing.
    pub fn select_first(&self, selector: &str) -> Option<ElementRef<'_>> {
        let selector = parse_selector(selector)?;
        self.html.select(&selector).next()
    }

    /// All elements matching a CSS selector, in document order.
    pub fn select_all(&self, selector: &str) -> Vec<ElementRef<'_>> {
        match parse_selector(selector) {
            Some(selector) => self.html.select(&selector).collect(),
            None => Vec::new(),
        }
    }

    /// Whether any element carries the given class.
    pub fn has_class(&self, class: &str) -> bool {
        self.select_first(&format!(".{class}")).is_some()
    }

    /// `value` attribute of the element with the given id.
    pub fn input_value(&self, id: &str) -> Option<String> {
        self.by_id(id)
            .and_then(|el| el.value().attr("value"))
            .map(str::to_owned)
    }

    /// Trimmed text of the element with the given id.
    pub fn text_by_id(&self, id: &str) -> Option<String> {
        self.by_id(id).map(|el| text(el))
    }

    /// Label-style value (see [`label_value`]) of the first element matching `selector`.
    pub fn label_at(&self, selector: &str) -> Option<String> {
        self.select_first(selector).map(label_value)
    }
}

fn parse_selector(selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(s) => Some(s),
        Err(e) => {
            debug!(selector, error = %e, "Invalid selector");
            None
        }
    }
}

/// Element children only, skipping text and comment nodes.
pub fn child_elements(el: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    el.children().filter_map(ElementRef::wrap).collect()
}

/// The `n`th element child (0-based).
pub fn nth_child(el: ElementRef<'_>, n: usize) -> Option<ElementRef<'_>> {
    el.children().filter_map(ElementRef::wrap).nth(n)
}

/// First element child with the given tag name.
pub fn child_by_tag<'a>(el: ElementRef<'a>, tag: &str) -> Option<ElementRef<'a>> {
    el.children()
        .filter_map(ElementRef::wrap)
        .find(|child| child.value().name() == tag)
}

/// Parent element, if the parent node is an element.
pub fn parent_element(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    el.parent().and_then(ElementRef::wrap)
}

/// Table body rows, skipping the first (header) row.
pub fn data_rows(table: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    let body = child_by_tag(table, "tbody").unwrap_or(table);
    body.children()
        .filter_map(ElementRef::wrap)
        .filter(|row| row.value().name() == "tr")
        .skip(1)
        .collect()
}

/// Concatenated text content, trimmed.
pub fn text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_owned()
}

/// Text content with every whitespace run collapsed into a single space.
pub fn collapsed_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<String>())
}

/// Read a value rendered as `"Label:\n   value"` or `":\n value"`.
pub fn label_value(el: ElementRef<'_>) -> String {
    collapsed_text(el)
        .trim_start_matches(':')
        .trim()
        .to_owned()
}

pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split an element's text on `<br>` boundaries, collapsing whitespace per segment.
///
/// Empty segments are dropped.
pub fn split_on_breaks(el: ElementRef<'_>) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();

    for node in el.descendants() {
        match node.value() {
            Node::Text(t) => current.push_str(t),
            Node::Element(e) if e.name() == "br" => {
                segments.push(std::mem::take(&mut current));
            }
            _ => {}
        }
    }
    segments.push(current);

    segments
        .iter()
        .map(|s| collapse_whitespace(s))
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body>
        <div id="leftcontent">
            <table class="ThongtinSV">
                <tr><td>Họ tên</td><td>:
                    Nguyễn   Văn  An</td></tr>
            </table>
            <input type="hidden" id="__VIEWSTATE" name="__VIEWSTATE" value="vs-1" />
            <p class="NoPermission">denied</p>
            <table id="grid">
                <tr><th>A</th><th>B</th></tr>
                <tr><td>1</td><td>x<br>y <br/> z</td></tr>
                <tr><td>2</td><td></td></tr>
            </table>
        </div>
    </body></html>"#;

    #[test]
    fn test_by_id_and_input_value() {
        let doc = Document::parse(PAGE);
        assert!(doc.by_id("leftcontent").is_some());
        assert!(doc.by_id("missing").is_none());
        assert_eq!(doc.input_value("__VIEWSTATE").as_deref(), Some("vs-1"));
        assert_eq!(doc.input_value("missing"), None);
    }

    #[test]
    fn test_label_value_strips_prefix_and_collapses() {
        let doc = Document::parse(PAGE);
        let value = doc.label_at(
            "#leftcontent > table.ThongtinSV > tbody > tr:nth-child(1) > td:nth-child(2)",
        );
        assert_eq!(value.as_deref(), Some("Nguyễn Văn An"));
    }

    #[test]
    fn test_has_class() {
        let doc = Document::parse(PAGE);
        assert!(doc.has_class("NoPermission"));
        assert!(!doc.has_class("Other"));
    }

    #[test]
    fn test_invalid_selector_is_not_found() {
        let doc = Document::parse(PAGE);
        assert!(doc.select_first("td:::bad").is_none());
        assert!(doc.select_all("td:::bad").is_empty());
    }

    #[test]
    fn test_data_rows_skip_header() {
        let doc = Document::parse(PAGE);
        let table = doc.by_id("grid").unwrap();
        let rows = data_rows(table);
        assert_eq!(rows.len(), 2);
        assert_eq!(text(nth_child(rows[0], 0).unwrap()), "1");
    }

    #[test]
    fn test_split_on_breaks() {
        let doc = Document::parse(PAGE);
        let table = doc.by_id("grid").unwrap();
        let rows = data_rows(table);
        let cell = nth_child(rows[0], 1).unwrap();
        assert_eq!(split_on_breaks(cell), vec!["x", "y", "z"]);

        let empty = nth_child(rows[1], 1).unwrap();
        assert!(split_on_breaks(empty).is_empty());
    }
}
