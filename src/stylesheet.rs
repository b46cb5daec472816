//! Embedded stylesheet index
//!
//! Only the declarations needed to resolve sprites are kept:
//! background image URL, background position and the first `px` of
//! background-size. Rules are indexed by each `.class` of their selector and
//! by the lowercased selector text.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;

/// Host path of list-style favicon sprites
pub const SPRITE_URL_MARKER: &str = "favicon.yandex.net/favicon/v2/";

static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("static regex"));
static RULE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^{}]+)\{([^{}]*)\}").expect("static regex"));
static BACKGROUND_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)background(?:-image)?\s*:[^;]*?url\s*\(\s*["']?([^"')]+?)["']?\s*\)"#)
        .expect("static regex")
});
static BACKGROUND_POSITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)background-position(?:-[xy])?\s*:\s*([^;]+)").expect("static regex")
});
static BACKGROUND_SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)background-size\s*:\s*([^;]+)").expect("static regex"));
static PX_VALUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)px").expect("static regex"));
static SELECTOR_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.([a-zA-Z_][a-zA-Z0-9_-]*)").expect("static regex"));
static STYLE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style[^>]*>(.*?)</style>").expect("static regex"));
static STYLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("style").expect("static selector"));

/// `background-image` (or `background` shorthand) URL of a declaration block
pub fn background_url(declarations: &str) -> Option<String> {
    BACKGROUND_URL
        .captures(declarations)
        .map(|c| c[1].trim().to_string())
        .filter(|u| !u.is_empty())
}

pub fn background_position(declarations: &str) -> Option<String> {
    BACKGROUND_POSITION
        .captures(declarations)
        .map(|c| c[1].trim().to_string())
}

/// First `px` value of background-size
pub fn background_size(declarations: &str) -> Option<f32> {
    BACKGROUND_SIZE
        .captures(declarations)
        .and_then(|c| PX_VALUE.captures(&c[1]).and_then(|px| px[1].parse().ok()))
}

/// One selector with its background declarations
#[derive(Debug, Clone, PartialEq)]
pub struct StyleRule {
    pub selector: String,
    pub classes: Vec<String>,
    pub background_url: Option<String>,
    pub background_position: Option<String>,
    pub background_size: Option<f32>,
}

impl StyleRule {
    pub fn is_sprite(&self) -> bool {
        self.background_url
            .as_deref()
            .map(|u| u.contains(SPRITE_URL_MARKER))
            .unwrap_or(false)
    }

    fn applies_to(&self, element_classes: &[&str]) -> bool {
        !self.classes.is_empty()
            && self
                .classes
                .iter()
                .all(|c| element_classes.contains(&c.as_str()))
    }
}

/// Background declarations of one document
#[derive(Debug, Default, Clone)]
pub struct StylesheetIndex {
    rules: Vec<StyleRule>,
    by_class: HashMap<String, Vec<usize>>,
    by_selector: HashMap<String, usize>,
}

impl StylesheetIndex {
    /// Index every `<style>` block of the document, scanning `raw_source`
    /// when the parsed tree kept no style text
    pub fn build(document: &Html, raw_source: &str) -> Self {
        let mut css: Vec<String> = document
            .select(&STYLE_SELECTOR)
            .map(|el| el.text().collect::<String>())
            .filter(|text| !text.trim().is_empty())
            .collect();

        if css.is_empty() {
            css = STYLE_TAG
                .captures_iter(raw_source)
                .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
                .filter(|text| !text.trim().is_empty())
                .collect();
            if !css.is_empty() {
                debug!(blocks = css.len(), "style text recovered from raw source");
            }
        }

        Self::from_css(&css.join("\n"))
    }

    pub fn from_css(css: &str) -> Self {
        let mut index = Self::default();
        let css = COMMENT.replace_all(css, "");

        for caps in RULE_BLOCK.captures_iter(&css) {
            let body = &caps[2];
            let background_url = background_url(body);
            let background_position = background_position(body);
            let background_size = background_size(body);

            if background_url.is_none() && background_position.is_none() && background_size.is_none() {
                continue;
            }

            for selector in caps[1].split(',') {
                let selector = selector.trim();
                if selector.is_empty() || selector.starts_with('@') {
                    continue;
                }
                index.push(StyleRule {
                    selector: selector.to_string(),
                    classes: SELECTOR_CLASS
                        .captures_iter(selector)
                        .map(|c| c[1].to_string())
                        .collect(),
                    background_url: background_url.clone(),
                    background_position: background_position.clone(),
                    background_size,
                });
            }
        }

        debug!(
            rules = index.rules.len(),
            sprites = index.rules.iter().filter(|r| r.is_sprite()).count(),
            "stylesheet index built"
        );
        index
    }

    fn push(&mut self, rule: StyleRule) {
        let id = self.rules.len();
        for class in &rule.classes {
            self.by_class.entry(class.clone()).or_default().push(id);
        }
        self.by_selector.insert(rule.selector.to_lowercase(), id);
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn rule_by_selector(&self, selector: &str) -> Option<&StyleRule> {
        self.by_selector
            .get(&selector.trim().to_lowercase())
            .map(|&id| &self.rules[id])
    }

    /// Rules whose selector classes are all present on the element, most
    /// specific first, later rules before earlier ones on ties
    fn applicable(&self, element_classes: &[&str]) -> Vec<&StyleRule> {
        let mut ids: Vec<usize> = element_classes
            .iter()
            .filter_map(|c| self.by_class.get(*c))
            .flatten()
            .copied()
            .filter(|&id| self.rules[id].applies_to(element_classes))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.sort_by(|a, b| {
            self.rules[*b]
                .classes
                .len()
                .cmp(&self.rules[*a].classes.len())
                .then(b.cmp(a))
        });
        ids.into_iter().map(|id| &self.rules[id]).collect()
    }

    /// Background-image rule for an element with these classes
    pub fn rule_for_classes(&self, element_classes: &[&str]) -> Option<&StyleRule> {
        if element_classes.is_empty() {
            return None;
        }
        let key = format!(".{}", element_classes.join("."));
        if let Some(rule) = self
            .rule_by_selector(&key)
            .filter(|r| r.background_url.is_some())
        {
            return Some(rule);
        }
        self.applicable(element_classes)
            .into_iter()
            .find(|r| r.background_url.is_some())
    }

    pub fn position_for_classes(&self, element_classes: &[&str]) -> Option<&str> {
        self.applicable(element_classes)
            .into_iter()
            .find_map(|r| r.background_position.as_deref())
    }

    pub fn size_for_classes(&self, element_classes: &[&str]) -> Option<f32> {
        self.applicable(element_classes)
            .into_iter()
            .find_map(|r| r.background_size)
    }

    /// Background-size shared by the document's sprite rules
    pub fn default_background_size(&self) -> Option<f32> {
        self.rules
            .iter()
            .filter(|r| r.is_sprite())
            .find_map(|r| r.background_size)
    }
}
