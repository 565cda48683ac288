//! Normalizes wiki HTML into a small set of node kinds.
//!
//! Both extractors pattern-match over [`TableRow`], [`TextBlock`],
//! [`Heading`] and [`EpisodeEntry`] instead of probing the raw DOM, so the
//! markup quirks of each wiki live in this module only.

use scraper::{ElementRef, Html};

pub struct Document {
    html: Html,
}

impl Document {
    pub fn parse(html: &str) -> Self {
        Self {
            html: Html::parse_document(html),
        }
    }

    pub fn root(&self) -> ElementRef<'_> {
        self.html.root_element()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub text: String,
    pub href: Option<String>,
    pub title: Option<String>,
    /// The anchor only wraps an icon (`span.span-link`).
    pub decorative: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub text: String,
    pub colspan: Option<u32>,
    pub has_rowspan: bool,
    /// Text of the `align-self: flex-end` name plate, when the cell has one.
    pub speaker_plate: Option<String>,
    /// Any element child or non-blank text.
    pub has_content: bool,
    pub anchors: Vec<Anchor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub rows: Vec<TableRow>,
}

impl Table {
    /// Widest row, counting `colspan`.
    pub fn width(&self) -> u32 {
        self.rows
            .iter()
            .map(|row| {
                row.cells
                    .iter()
                    .map(|cell| cell.colspan.unwrap_or(1))
                    .sum::<u32>()
            })
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBlock {
    /// Trimmed text of each inner `div`, in order.
    pub parts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    pub combined: String,
    /// (source, translated) when the heading carries both titles.
    pub split: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeEntry {
    pub anchors: Vec<Anchor>,
    pub translated: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutlineNode {
    Heading(Heading),
    /// An `h2` without `span.mw-headline`; not a chapter.
    Untitled,
    Episode(EpisodeEntry),
}

pub fn has_class(element: ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

fn is_tag(element: ElementRef<'_>, name: &str) -> bool {
    element.value().name() == name
}

fn style_contains(element: ElementRef<'_>, needle: &str) -> bool {
    element
        .value()
        .attr("style")
        .map(|style| {
            let compact: String = style.chars().filter(|c| !c.is_whitespace()).collect();
            compact.contains(needle)
        })
        .unwrap_or(false)
}

/// Descendant elements of `scope` (excluding `scope`) in document order.
pub fn descendant_elements<'a>(scope: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    scope.descendants().skip(1).filter_map(ElementRef::wrap)
}

fn child_elements<'a>(scope: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    scope.children().filter_map(ElementRef::wrap)
}

fn find_first<'a>(
    scope: ElementRef<'a>,
    pred: impl Fn(ElementRef<'a>) -> bool,
) -> Option<ElementRef<'a>> {
    descendant_elements(scope).find(|el| pred(*el))
}

pub fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_owned()
}

fn nearest_ancestor<'a>(element: ElementRef<'a>, name: &str) -> Option<ElementRef<'a>> {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| is_tag(*el, name))
}

fn anchor(element: ElementRef<'_>) -> Anchor {
    Anchor {
        text: text_of(element),
        href: element.value().attr("href").map(str::to_owned),
        title: element.value().attr("title").map(str::to_owned),
        decorative: find_first(element, |el| is_tag(el, "span") && has_class(el, "span-link"))
            .is_some(),
    }
}

fn anchors_in(scope: ElementRef<'_>) -> Vec<Anchor> {
    descendant_elements(scope)
        .filter(|el| is_tag(*el, "a"))
        .map(anchor)
        .collect()
}

fn cell(element: ElementRef<'_>) -> Cell {
    let text = text_of(element);
    let has_content = !text.is_empty() || child_elements(element).next().is_some();
    Cell {
        colspan: element
            .value()
            .attr("colspan")
            .and_then(|v| v.trim().parse().ok()),
        has_rowspan: element.value().attr("rowspan").is_some(),
        speaker_plate: find_first(element, |el| {
            is_tag(el, "div") && style_contains(el, "align-self:flex-end")
        })
        .map(text_of),
        has_content,
        anchors: anchors_in(element),
        text,
    }
}

fn table(element: ElementRef<'_>) -> Table {
    let table_id = element.id();
    let rows = descendant_elements(element)
        .filter(|el| is_tag(*el, "tr"))
        .filter(|tr| nearest_ancestor(*tr, "table").map(|t| t.id()) == Some(table_id))
        .map(|tr| TableRow {
            cells: child_elements(tr)
                .filter(|el| is_tag(*el, "td"))
                .map(cell)
                .collect(),
        })
        .collect();
    Table { rows }
}

/// Every `table` carrying `class`, in document order.
pub fn tables(scope: ElementRef<'_>, class: &str) -> Vec<Table> {
    descendant_elements(scope)
        .filter(|el| is_tag(*el, "table") && has_class(*el, class))
        .map(table)
        .collect()
}

/// `div.story-text` blocks, restricted to the article body when there is one.
pub fn text_blocks(scope: ElementRef<'_>) -> Vec<TextBlock> {
    let body = find_first(scope, |el| has_class(el, "mw-parser-output")).unwrap_or(scope);
    descendant_elements(body)
        .filter(|el| is_tag(*el, "div") && has_class(*el, "story-text"))
        .map(|block| TextBlock {
            parts: child_elements(block)
                .filter(|el| is_tag(*el, "div"))
                .map(text_of)
                .collect(),
        })
        .collect()
}

pub fn has_episode_lists(scope: ElementRef<'_>) -> bool {
    find_first(scope, |el| has_class(el, "episode-list")).is_some()
}

fn heading(element: ElementRef<'_>) -> Option<Heading> {
    let headline = find_first(element, |el| has_class(el, "mw-headline"))?;

    let split = find_first(headline, |el| {
        is_tag(el, "span") && style_contains(el, "flex-direction:column")
    })
    .and_then(|column| {
        let source = find_first(column, |el| is_tag(el, "span")).map(text_of)?;
        let small = find_first(column, |el| is_tag(el, "small"))?;
        let translated = find_first(small, |el| is_tag(el, "span"))
            .map(text_of)
            .unwrap_or_else(|| text_of(small));
        (!source.is_empty()).then_some((source, translated))
    });

    Some(Heading {
        combined: text_of(headline),
        split,
    })
}

fn episode_entry(element: ElementRef<'_>) -> EpisodeEntry {
    let main = find_first(element, |el| is_tag(el, "div")).unwrap_or(element);
    EpisodeEntry {
        anchors: anchors_in(main),
        translated: find_first(element, |el| has_class(el, "episode-list--eng"))
            .map(text_of)
            .unwrap_or_default(),
    }
}

/// Headings and episode entries of the `tab`-th `.tabber-item` panel, in
/// document order. `None` when the panel does not exist.
pub fn outline(scope: ElementRef<'_>, tab: usize) -> Option<Vec<OutlineNode>> {
    let panel = descendant_elements(scope)
        .filter(|el| has_class(*el, "tabber-item"))
        .nth(tab)?;

    let nodes = descendant_elements(panel)
        .filter_map(|el| {
            if is_tag(el, "h2") {
                Some(heading(el).map_or(OutlineNode::Untitled, OutlineNode::Heading))
            } else if is_tag(el, "div") && has_class(el, "episode-list--single") {
                Some(OutlineNode::Episode(episode_entry(el)))
            } else {
                None
            }
        })
        .collect();
    Some(nodes)
}
