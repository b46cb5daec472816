//! Favicon resolution across rows
//!
//! A snippet's favicon is either its own URL, a cell of a CSS sprite, or a
//! list URL (`.../favicon/v2/a.ru;b.ru;c.ru`) declared once and consumed by
//! the following rows in document order. [`SpriteState`] carries the list
//! cursor from row to row.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::ElementRef;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::extractors::text::normalize_url;
use crate::stylesheet::{self, StylesheetIndex, SPRITE_URL_MARKER};

static POS_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Favicon-Page\d+_pos_(\d+)$").expect("static regex"));

/// What a row says about its own icon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IconDeclaration {
    None,
    Explicit(String),
    List(Vec<String>),
}

/// List cursor threaded through the rows of one document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpriteState {
    list: Vec<String>,
    cursor: usize,
    last_consumed: Option<usize>,
    after_override: bool,
}

impl SpriteState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_active_list(&self) -> bool {
        !self.list.is_empty()
    }

    /// Icon for one row and the state for the next.
    ///
    /// A new list resets the cursor and gives its first entry to this row.
    /// A row without an icon takes the entry under the cursor. An explicit
    /// icon is used as is and leaves the cursor alone; once the list is
    /// exhausted, the row right after such an override gets the last
    /// consumed entry again.
    pub fn step(mut self, declaration: IconDeclaration) -> (Option<String>, SpriteState) {
        match declaration {
            IconDeclaration::List(list) => {
                self.list = list;
                self.cursor = 0;
                self.last_consumed = None;
                self.after_override = false;
                let icon = self.consume();
                (icon, self)
            }
            IconDeclaration::Explicit(url) => {
                if self.has_active_list() {
                    self.after_override = true;
                }
                (Some(url), self)
            }
            IconDeclaration::None => {
                if self.cursor < self.list.len() {
                    let icon = self.consume();
                    return (icon, self);
                }
                if self.after_override {
                    self.after_override = false;
                    let icon = self.last_consumed.and_then(|i| self.list.get(i).cloned());
                    return (icon, self);
                }
                (None, self)
            }
        }
    }

    fn consume(&mut self) -> Option<String> {
        let icon = self.list.get(self.cursor).cloned()?;
        self.last_consumed = Some(self.cursor);
        self.cursor += 1;
        self.after_override = false;
        Some(icon)
    }
}

/// Host list of a favicon list URL, `None` for single-host URLs
pub fn list_hosts(url: &str) -> Option<Vec<String>> {
    let start = url.find(SPRITE_URL_MARKER)? + SPRITE_URL_MARKER.len();
    let path = &url[start..];
    let path = path.split(['?', '"', '\'', ')']).next().unwrap_or(path);
    let hosts: Vec<String> = path
        .split(';')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect();
    if hosts.len() > 1 {
        Some(hosts)
    } else {
        None
    }
}

/// One single-icon URL per host of a list URL
pub fn expand_list(url: &str, size: u32) -> Option<Vec<String>> {
    let hosts = list_hosts(url)?;
    Some(
        hosts
            .iter()
            .map(|host| format!("https://{}{}?size={}&stub=1", SPRITE_URL_MARKER, host, size))
            .collect(),
    )
}

/// Declaration for a bare favicon URL value
pub fn declaration_from_url(url: &str, size: u32) -> IconDeclaration {
    let url = url.trim();
    if url.is_empty() {
        return IconDeclaration::None;
    }
    match expand_list(url, size) {
        Some(list) => IconDeclaration::List(list),
        None => IconDeclaration::Explicit(normalize_url(url)),
    }
}

/// Vertical offset in px of a background-position value
fn position_y(position: &str) -> Option<f32> {
    let tokens: Vec<&str> = position.split_whitespace().collect();
    let token = match tokens.len() {
        0 => return None,
        1 => tokens[0],
        _ => tokens[1],
    };
    token.trim_end_matches("px").parse().ok()
}

/// Turns the favicon element of a container into an [`IconDeclaration`]
pub struct IconResolver<'s> {
    stylesheet: &'s StylesheetIndex,
    favicon_size: u32,
    strides: &'s [u32],
}

impl<'s> IconResolver<'s> {
    pub fn new(stylesheet: &'s StylesheetIndex, config: &'s PipelineConfig) -> Self {
        Self {
            stylesheet,
            favicon_size: config.favicon_size,
            strides: &config.sprite_strides,
        }
    }

    pub fn declaration(&self, element: Option<ElementRef<'_>>) -> IconDeclaration {
        let element = match element {
            Some(el) => el,
            None => return IconDeclaration::None,
        };

        let style = element.value().attr("style").unwrap_or("");
        if let Some(url) = stylesheet::background_url(style) {
            if let Some(list) = expand_list(&url, self.favicon_size) {
                return IconDeclaration::List(list);
            }
            return IconDeclaration::Explicit(normalize_url(&url));
        }

        if let Some(src) = image_source(element) {
            return IconDeclaration::Explicit(normalize_url(src));
        }

        self.from_stylesheet(element, style)
    }

    fn from_stylesheet(&self, element: ElementRef<'_>, inline_style: &str) -> IconDeclaration {
        let classes: Vec<&str> = element.value().classes().collect();
        let rule = match self.stylesheet.rule_for_classes(&classes) {
            Some(rule) => rule,
            None => return IconDeclaration::None,
        };
        let url = match rule.background_url.as_deref() {
            Some(url) => url,
            None => return IconDeclaration::None,
        };

        let list = match expand_list(url, self.favicon_size) {
            Some(list) => list,
            None => return IconDeclaration::Explicit(normalize_url(url)),
        };

        let index = classes
            .iter()
            .find_map(|c| POS_CLASS.captures(c).and_then(|caps| caps[1].parse::<usize>().ok()))
            .or_else(|| {
                let position = stylesheet::background_position(inline_style)
                    .or_else(|| self.stylesheet.position_for_classes(&classes).map(str::to_string))?;
                let size = self
                    .stylesheet
                    .size_for_classes(&classes)
                    .or_else(|| self.stylesheet.default_background_size());
                self.index_from_offset(position_y(&position)?, size)
            });

        match index.and_then(|i| list.get(i)) {
            Some(url) => {
                debug!(index = ?index, "favicon resolved from sprite");
                IconDeclaration::Explicit(url.clone())
            }
            None => IconDeclaration::None,
        }
    }

    /// Sprite cell for a vertical offset
    fn index_from_offset(&self, y: f32, size: Option<f32>) -> Option<usize> {
        let offset = y.abs().round() as u32;
        if offset == 0 {
            return Some(0);
        }
        let stride = size
            .map(|s| s.round() as u32)
            .filter(|s| *s > 0)
            .or_else(|| self.strides.iter().copied().find(|s| *s > 0 && offset % s == 0))?;
        Some((offset as f32 / stride as f32).round() as usize)
    }
}

fn image_source<'a>(element: ElementRef<'a>) -> Option<&'a str> {
    let src = |el: ElementRef<'a>| {
        el.value()
            .attr("src")
            .or_else(|| el.value().attr("data-src"))
            .filter(|s| !s.trim().is_empty())
    };
    if element.value().name() == "img" {
        return src(element);
    }
    element
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "img")
        .find_map(src)
}
