//! End-to-end run over one captured results page
//!
//! Every run owns its indexes, sprite cursor and row list. The compiled
//! rules are the only input shared between runs.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};

use crate::archive::{ArchiveReader, ArchiveSource};
use crate::assign::{assign, Assignment, Container};
use crate::config::PipelineConfig;
use crate::dedup::dedupe;
use crate::error::ParseError;
use crate::extractors::features::FeatureExtractor;
use crate::extractors::fields::{detect_snippet_type, FieldExtractor, PageContext, Platform};
use crate::extractors::json;
use crate::extractors::price::PriceResolver;
use crate::extractors::sprite::{declaration_from_url, IconResolver, SpriteState};
use crate::index::DocumentIndex;
use crate::row::{fields, Row};
use crate::rules::CompiledRules;
use crate::stylesheet::StylesheetIndex;
use crate::validate::validate_rows;

static CONTAINERS: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(
        "[class*=\"Organic_withOfferInfo\"], [class*=\"EProductSnippet2\"], .EShopItem, .EOfferItem, \
         .ProductTile-Item, [class*=\"ProductTile-Item\"]",
    )
    .expect("static selector")
});

/// Progress and yield notifications of a run. Both are advisory.
pub trait PipelineObserver {
    fn progress(&mut self, _percent: u8, _stage: &str) {}

    fn yield_point(&mut self, _parts_scanned: usize) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Adapts a progress closure into an observer
pub struct ProgressFn<F>(pub F);

impl<F: FnMut(u8, &str)> PipelineObserver for ProgressFn<F> {
    fn progress(&mut self, percent: u8, stage: &str) {
        (self.0)(percent, stage)
    }
}

/// Rows of one page, before assignment
#[derive(Debug, Clone)]
pub struct ParseOutput {
    pub rows: Vec<Row>,
    pub source: ArchiveSource,
    pub containers_found: usize,
    /// Rows came from the embedded search state, not the markup
    pub from_json: bool,
}

impl ParseOutput {
    /// Late correction from an image collaborator. Returns `false` when the
    /// row does not exist.
    pub fn apply_correction(&mut self, row_index: usize, field: &str, value: &str) -> bool {
        match self.rows.get_mut(row_index) {
            Some(row) => {
                row.set(field, value);
                debug!(row_index, field, "row corrected");
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub rows: Vec<Row>,
    pub assignment: Assignment,
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Decode, extract, deduplicate and validate the rows of one page
    pub fn parse(
        &self,
        input: &str,
        rules: &CompiledRules,
        observer: &mut dyn PipelineObserver,
    ) -> Result<ParseOutput, ParseError> {
        let reader = ArchiveReader::new(self.config.yield_every_parts);
        let recovered = reader.read(input, &mut |parts| observer.yield_point(parts))?;
        observer.progress(10, "archive decoded");

        let document = Html::parse_document(&recovered.html);
        let stylesheet = StylesheetIndex::build(&document, &recovered.html);
        let page = PageContext::detect(&DocumentIndex::build(document.root_element()));
        let containers = discover_containers(&document);
        info!(
            containers = containers.len(),
            style_rules = stylesheet.len(),
            "containers discovered"
        );
        observer.progress(30, "containers discovered");

        let from_json = containers.is_empty();
        let mut rows = if from_json {
            self.rows_from_state(&recovered.html, rules)
        } else {
            self.rows_from_markup(&containers, &stylesheet, rules, page.platform)
        };

        let before = rows.len();
        rows.retain(is_snippet);
        if rows.len() < before {
            debug!(dropped = before - rows.len(), "rows without title or shop dropped");
        }
        for row in rows.iter_mut() {
            page.apply(row);
        }
        observer.progress(70, "extraction complete");

        if rows.is_empty() {
            return Err(ParseError::NoSnippets);
        }

        let mut rows = dedupe(rows);
        let warnings = validate_rows(&mut rows);
        info!(rows = rows.len(), warnings, from_json, "rows ready");
        observer.progress(85, "deduplicated");

        Ok(ParseOutput {
            rows,
            source: recovered.source,
            containers_found: containers.len(),
            from_json,
        })
    }

    /// Parse the page and assign its rows to the host's containers
    pub fn run(
        &self,
        input: &str,
        rules: &CompiledRules,
        containers: &[Container],
        observer: &mut dyn PipelineObserver,
    ) -> Result<PipelineOutput, ParseError> {
        let parsed = self.parse(input, rules, observer)?;
        let assignment = assign(&parsed.rows, containers);
        observer.progress(100, "assignment complete");
        Ok(PipelineOutput {
            rows: parsed.rows,
            assignment,
        })
    }

    fn rows_from_markup(
        &self,
        containers: &[ElementRef<'_>],
        stylesheet: &StylesheetIndex,
        rules: &CompiledRules,
        platform: Platform,
    ) -> Vec<Row> {
        let extractor = FieldExtractor::new(rules);
        let prices = PriceResolver::new(&self.config);
        let features = FeatureExtractor::new(rules);
        let icons = IconResolver::new(stylesheet, &self.config);
        let mut sprite = SpriteState::new();

        let mut rows = Vec::with_capacity(containers.len());
        for container in containers {
            let index = DocumentIndex::build(*container);
            let detected = detect_snippet_type(*container, &index);
            let mut row = extractor.extract_row(*container, &index, detected);
            prices.resolve(&index, rules, &mut row);
            features.apply(*container, &index, detected.snippet_type, platform, &mut row);

            let favicon = index.first_match(rules.selectors(fields::FAVICON));
            let (icon, next) = sprite.step(icons.declaration(favicon));
            sprite = next;
            if let Some(icon) = icon {
                row.set(fields::FAVICON, icon);
            }
            rows.push(row);
        }
        rows
    }

    fn rows_from_state(&self, html: &str, rules: &CompiledRules) -> Vec<Row> {
        let mut sprite = SpriteState::new();
        let mut rows = json::extract_rows(html, rules);
        for row in rows.iter_mut() {
            let declared = row.remove(fields::FAVICON).unwrap_or_default();
            let (icon, next) = sprite.step(declaration_from_url(&declared, self.config.favicon_size));
            sprite = next;
            if let Some(icon) = icon {
                row.set(fields::FAVICON, icon);
            }
        }
        rows
    }
}

/// Snippet containers in document order, nested matches removed
pub fn discover_containers(document: &Html) -> Vec<ElementRef<'_>> {
    let matched: Vec<ElementRef<'_>> = document.select(&CONTAINERS).collect();
    let ids: HashSet<_> = matched.iter().map(|el| el.id()).collect();
    matched
        .into_iter()
        .filter(|el| !el.ancestors().any(|a| ids.contains(&a.id())))
        .collect()
}

fn is_snippet(row: &Row) -> bool {
    row.has(fields::TITLE) || row.has(fields::HOST) || row.has(fields::SHOP_NAME)
}
