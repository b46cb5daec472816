//! Per-scope element index
//!
//! One pre-order walk of a subtree records every element by class token, by
//! a fixed set of frequently queried class substrings, and by tag name.
//! Rule selectors are compiled once into [`SelectorKind`]; the three simple
//! shapes are answered from the tables, everything else goes to a direct
//! query against the live subtree.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Selector};

/// Class substrings that get their own lookup table
pub const FREQUENT_CLASS_PATTERNS: &[&str] = &[
    "OrganicTitle",
    "EProductSnippet2",
    "EProductSnippet2-Title",
    "EShopName",
    "ShopName",
    "Path",
    "OrganicTextContentSpan",
    "EProductSnippet2-Text",
    "Organic-OfferThumbImage",
    "EProductSnippet2-Thumb",
    "EPriceGroup",
    "EPriceGroup-Pair",
    "EPriceGroup-Price",
    "EPrice-Value",
    "EPrice-Currency",
    "EPrice_view_old",
    "LabelDiscount",
    "Label-Content",
    "Rating",
    "Review",
    "Reviews",
    "ELabelRating",
    "LabelRating",
    "EPriceBarometer",
    "EProductSnippet2-Overlay",
    "AdvProductGallery",
    "AdvProductGalleryCard",
    "Organic-Label_type_advertisement",
    "Organic-Subtitle_type_advertisement",
    "Favicon",
    "ImagePlaceholder",
    "Image-Placeholder",
    "FaviconImage",
    "OrganicHost",
    "Organic_withOfferInfo",
    "EShopItem",
    "EOfferItem",
    "ProductTile-Item",
];

static EXACT_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\.(-?[A-Za-z_][A-Za-z0-9_-]*)$").expect("static regex"));
static SUBSTRING_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\[class\*=["']([^"']+)["']\]$"#).expect("static regex"));
static TAG_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]*$").expect("static regex"));

/// Closed selector grammar, resolved once per rule load
#[derive(Debug, Clone)]
pub enum SelectorKind {
    /// `.Name`
    ExactClass(String),
    /// `[class*="Name"]`
    SubstringClass(String),
    /// `div`, `img`, ...
    Tag(String),
    /// Anything else; `None` when the selector does not parse at all
    Unsupported(Option<Selector>),
}

impl SelectorKind {
    pub fn parse(selector: &str) -> Self {
        let selector = selector.trim();
        if let Some(caps) = EXACT_CLASS.captures(selector) {
            return SelectorKind::ExactClass(caps[1].to_string());
        }
        if let Some(caps) = SUBSTRING_CLASS.captures(selector) {
            return SelectorKind::SubstringClass(caps[1].to_string());
        }
        if TAG_NAME.is_match(selector) {
            return SelectorKind::Tag(selector.to_ascii_lowercase());
        }
        SelectorKind::Unsupported(Selector::parse(selector).ok())
    }

    pub fn is_indexed(&self) -> bool {
        !matches!(self, SelectorKind::Unsupported(_))
    }
}

/// A rule selector with its original text kept for logging
#[derive(Debug, Clone)]
pub struct CompiledSelector {
    pub source: String,
    pub kind: SelectorKind,
}

impl CompiledSelector {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            kind: SelectorKind::parse(source),
        }
    }
}

/// Lookup tables for one subtree. Every list is in document order and the
/// scope root is part of its own index.
#[derive(Debug)]
pub struct DocumentIndex<'a> {
    root: ElementRef<'a>,
    elements: Vec<ElementRef<'a>>,
    by_class: HashMap<&'a str, Vec<ElementRef<'a>>>,
    by_pattern: HashMap<&'static str, Vec<ElementRef<'a>>>,
    by_tag: HashMap<&'a str, Vec<ElementRef<'a>>>,
}

impl<'a> DocumentIndex<'a> {
    pub fn build(root: ElementRef<'a>) -> Self {
        let mut index = Self {
            root,
            elements: Vec::new(),
            by_class: HashMap::new(),
            by_pattern: HashMap::new(),
            by_tag: HashMap::new(),
        };

        for element in root.descendants().filter_map(ElementRef::wrap) {
            let value = element.value();
            index.elements.push(element);
            index.by_tag.entry(value.name()).or_default().push(element);

            for class in value.classes() {
                let list = index.by_class.entry(class).or_default();
                // "a a" would otherwise list the element twice
                if list.last() != Some(&element) {
                    list.push(element);
                }
            }

            if let Some(class_attr) = value.attr("class") {
                for &pattern in FREQUENT_CLASS_PATTERNS {
                    if class_attr.contains(pattern) {
                        index.by_pattern.entry(pattern).or_default().push(element);
                    }
                }
            }
        }

        index
    }

    pub fn root(&self) -> ElementRef<'a> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// All elements of the scope in document order
    pub fn elements(&self) -> &[ElementRef<'a>] {
        &self.elements
    }

    pub fn first_by_class(&self, class: &str) -> Option<ElementRef<'a>> {
        self.by_class.get(class).and_then(|list| list.first().copied())
    }

    pub fn by_class(&self, class: &str) -> &[ElementRef<'a>] {
        self.by_class.get(class).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn by_tag(&self, tag: &str) -> &[ElementRef<'a>] {
        self.by_tag.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Elements whose class attribute contains `pattern`
    pub fn by_class_substring(&self, pattern: &str) -> Vec<ElementRef<'a>> {
        if let Some(list) = self.by_pattern.get(pattern) {
            return list.clone();
        }
        if FREQUENT_CLASS_PATTERNS.contains(&pattern) {
            return Vec::new();
        }
        self.elements
            .iter()
            .filter(|el| {
                el.value()
                    .attr("class")
                    .map(|c| c.contains(pattern))
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    pub fn query_all(&self, selector: &CompiledSelector) -> Vec<ElementRef<'a>> {
        match &selector.kind {
            SelectorKind::ExactClass(name) => self.by_class(name).to_vec(),
            SelectorKind::SubstringClass(pattern) => self.by_class_substring(pattern),
            SelectorKind::Tag(tag) => self.by_tag(tag).to_vec(),
            SelectorKind::Unsupported(Some(parsed)) => query_direct(self.root, parsed),
            SelectorKind::Unsupported(None) => Vec::new(),
        }
    }

    pub fn query_first(&self, selector: &CompiledSelector) -> Option<ElementRef<'a>> {
        match &selector.kind {
            SelectorKind::ExactClass(name) => self.first_by_class(name),
            SelectorKind::SubstringClass(pattern) => match self.by_pattern.get(pattern.as_str()) {
                Some(list) => list.first().copied(),
                None => self.by_class_substring(pattern).first().copied(),
            },
            SelectorKind::Tag(tag) => self.by_tag(tag).first().copied(),
            SelectorKind::Unsupported(Some(parsed)) => self
                .root
                .descendants()
                .filter_map(ElementRef::wrap)
                .find(|el| parsed.matches(el)),
            SelectorKind::Unsupported(None) => None,
        }
    }

    pub fn has(&self, selector: &CompiledSelector) -> bool {
        self.query_first(selector).is_some()
    }

    /// First element matched by the first candidate that matches anything
    pub fn first_match(&self, candidates: &[CompiledSelector]) -> Option<ElementRef<'a>> {
        candidates.iter().find_map(|sel| self.query_first(sel))
    }
}

/// Uncached query over `root` and its descendants
pub fn query_direct<'a>(root: ElementRef<'a>, selector: &Selector) -> Vec<ElementRef<'a>> {
    root.descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| selector.matches(el))
        .collect()
}
