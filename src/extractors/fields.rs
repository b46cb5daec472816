//! Generic rule-driven field extraction for one snippet container

use once_cell::sync::Lazy;
use scraper::{ElementRef, Selector};
use tracing::debug;

use crate::extractors::text::{clean_text, host_of, normalize_url, parse_rating};
use crate::index::{CompiledSelector, DocumentIndex};
use crate::row::{fields, Row, SnippetType};
use crate::rules::{CompiledRules, FieldRule, ValueType};

/// Links tried in order for `#ProductURL`
static PRODUCT_LINKS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        ".EProductSnippet2-Overlay[href], .EProductSnippet2-Overlay [href]",
        ".EProductSnippet2 a[href], [data-href]",
        ".EShopItem-ButtonLink[href], [class*=\"EShopItem-ButtonLink\"][href]",
        ".EShopItem-Title a[href], [class*=\"EShopItem-Title\"] a[href]",
        ".EShopItem a[href]",
        ".OrganicTitle a[href], [class*=\"OrganicTitle\"] a[href]",
        ".Organic-Title a[href], [class*=\"Organic-Title\"] a[href]",
        ".Organic-Checkout a[href], [class*=\"Organic-Checkout\"] a[href]",
        ".ProductTile-Item a[href], [class*=\"ProductTile\"] a[href]",
        "a[href], [data-href]",
    ]
    .iter()
    .filter_map(|s| Selector::parse(s).ok())
    .collect()
});

static ESNIPPET_PARTS: Lazy<CompiledSelector> =
    Lazy::new(|| CompiledSelector::new(".ESnippet, .ESnippet-Title, .ESnippet-Price"));
static ADV_LABEL: Lazy<CompiledSelector> =
    Lazy::new(|| CompiledSelector::new(".AdvLabel, .OrganicAdvLabel"));

/// Snippet type of a container plus the promo flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedType {
    pub snippet_type: SnippetType,
    pub is_promo: bool,
}

impl DetectedType {
    fn plain(snippet_type: SnippetType) -> Self {
        Self {
            snippet_type,
            is_promo: false,
        }
    }
}

/// Classify a container by its class attribute, first match wins
pub fn detect_snippet_type(container: ElementRef<'_>, index: &DocumentIndex<'_>) -> DetectedType {
    let class = container.value().attr("class").unwrap_or("");

    if class.contains("EOfferItem") {
        return DetectedType::plain(SnippetType::EOfferItem);
    }
    if class.contains("AdvProductGallery") && !class.contains("AdvProductGalleryCard") {
        return DetectedType::plain(SnippetType::AdvProductGallery);
    }
    if class.contains("AdvProductGalleryCard") {
        return DetectedType::plain(SnippetType::EProductSnippet2Adv);
    }
    if class.contains("EProductSnippet2") {
        return DetectedType::plain(SnippetType::EProductSnippet2);
    }
    if class.contains("EShopItem") {
        return DetectedType::plain(SnippetType::EShopItem);
    }
    if class.contains("ProductTile-Item") {
        return DetectedType::plain(SnippetType::ProductTileItem);
    }
    if class.contains("ESnippet") || index.has(&ESNIPPET_PARTS) {
        return DetectedType::plain(SnippetType::ESnippet);
    }
    let promo = class.contains("Organic_withAdvLabel")
        || class.contains("Organic_withPromoOffer")
        || (class.contains("Organic") && index.has(&ADV_LABEL));
    if promo {
        return DetectedType {
            snippet_type: SnippetType::ESnippet,
            is_promo: true,
        };
    }
    if class.contains("Organic_withOfferInfo") {
        return DetectedType::plain(SnippetType::OrganicWithOfferInfo);
    }
    DetectedType::plain(SnippetType::Organic)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Desktop,
    Touch,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Desktop => "desktop",
            Platform::Touch => "touch",
        }
    }
}

/// Facts about the whole results page, copied into every row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContext {
    pub query: Option<String>,
    pub platform: Platform,
}

impl PageContext {
    pub fn detect(index: &DocumentIndex<'_>) -> Self {
        let query = index
            .first_by_class("HeaderForm-Input")
            .and_then(|el| el.value().attr("value"))
            .map(clean_text)
            .filter(|q| !q.is_empty());

        let platform = if index.first_by_class("HeaderPhone").is_some() {
            Platform::Touch
        } else if index.first_by_class("HeaderDesktop").is_some() {
            Platform::Desktop
        } else if index.first_by_class("Header_preset_phone").is_some()
            || index.first_by_class("HeaderTouch").is_some()
        {
            Platform::Touch
        } else {
            Platform::Desktop
        };

        Self { query, platform }
    }

    pub fn apply(&self, row: &mut Row) {
        if let Some(query) = &self.query {
            row.set(fields::QUERY, query.as_str());
        }
        row.set(fields::PLATFORM, self.platform.as_str());
    }
}

/// Evaluates the generic `#` rules against one container
pub struct FieldExtractor<'r> {
    rules: &'r CompiledRules,
}

impl<'r> FieldExtractor<'r> {
    pub fn new(rules: &'r CompiledRules) -> Self {
        Self { rules }
    }

    /// Value of one rule inside the container, `None` on a soft miss
    pub fn extract_field(
        &self,
        index: &DocumentIndex<'_>,
        name: &str,
        rule: &FieldRule,
    ) -> Option<String> {
        let selectors = self.rules.selectors(name);
        match rule.value_type {
            ValueType::Text | ValueType::Html => selectors.iter().find_map(|sel| {
                let el = index.query_first(sel)?;
                Some(clean_text(&el.text().collect::<String>())).filter(|t| !t.is_empty())
            }),
            ValueType::Attribute => {
                let attr = rule.dom_attribute.as_deref().unwrap_or("href");
                selectors
                    .iter()
                    .filter_map(|sel| index.query_first(sel))
                    .find_map(|el| attribute_value(el, attr))
            }
            ValueType::Image => {
                let attr = rule.dom_attribute.as_deref().unwrap_or("src");
                selectors
                    .iter()
                    .filter_map(|sel| index.query_first(sel))
                    .find_map(|el| image_url(el, attr))
            }
            ValueType::Boolean => index.first_match(selectors).map(|_| "true".to_string()),
            ValueType::Rating => selectors
                .iter()
                .flat_map(|sel| index.query_all(sel))
                .find_map(|el| {
                    parse_rating(&clean_text(&el.text().collect::<String>()))
                        .or_else(|| el.value().attr("aria-label").and_then(parse_rating))
                }),
            // resolved together by the price resolver
            ValueType::Price => None,
        }
    }

    /// Row with every generic field of the container. Price and favicon
    /// fields are left to their resolvers.
    pub fn extract_row(
        &self,
        container: ElementRef<'_>,
        index: &DocumentIndex<'_>,
        detected: DetectedType,
    ) -> Row {
        let mut row = Row::new(detected.snippet_type.as_str());

        for (name, rule) in self.rules.row_fields() {
            if name == fields::SNIPPET_TYPE || name == fields::FAVICON {
                continue;
            }
            if let Some(value) = self.extract_field(index, name, rule) {
                row.set(name, value);
            }
        }

        if !row.has(fields::PRODUCT_URL) {
            if let Some(url) = product_url(container) {
                row.set(fields::PRODUCT_URL, url);
            }
        }
        if let Some(image) = row.get(fields::IMAGE).map(str::to_string) {
            row.set_if_absent(fields::THUMB_IMAGE, image);
        }
        apply_host_fallbacks(&mut row);

        if let Some(id) = serp_item_id(container) {
            row.set(fields::SERP_ITEM_ID, id);
        }
        if detected.snippet_type == SnippetType::EProductSnippet2Adv || inside_adv_gallery(container) {
            row.set(fields::IS_ADV, "true");
        }
        if detected.is_promo {
            row.set(fields::IS_PROMO, "true");
        }

        debug!(
            snippet_type = %detected.snippet_type,
            fields = row.len(),
            "row extracted"
        );
        row
    }
}

/// `#OrganicHost` from the product URL, then `#ShopName` from the host
pub fn apply_host_fallbacks(row: &mut Row) {
    if !row.has(fields::HOST) {
        if let Some(host) = row.get(fields::PRODUCT_URL).and_then(host_of) {
            row.set(fields::HOST, host);
        }
    }
    if let Some(host) = row.get(fields::HOST).map(str::to_string) {
        row.set_if_absent(fields::SHOP_NAME, host);
    }
}

fn attribute_value(el: ElementRef<'_>, attr: &str) -> Option<String> {
    el.value()
        .attr(attr)
        .or_else(|| el.value().attr(&format!("data-{}", attr)))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(normalize_url)
}

/// `srcset` 2x candidate, then the attribute, then `data-src`, then the
/// first descendant image
pub fn image_url(el: ElementRef<'_>, attr: &str) -> Option<String> {
    let own = |el: ElementRef<'_>| {
        let present = |name: &str| {
            el.value()
                .attr(name)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        el.value()
            .attr("srcset")
            .and_then(high_density_candidate)
            .or_else(|| present(attr))
            .or_else(|| present("data-src"))
            .map(|v| normalize_url(&v))
    };
    own(el).or_else(|| {
        el.descendants()
            .filter_map(ElementRef::wrap)
            .filter(|d| d.value().name() == "img" && *d != el)
            .find_map(own)
    })
}

fn high_density_candidate(srcset: &str) -> Option<String> {
    srcset.split(',').find_map(|candidate| {
        let mut parts = candidate.split_whitespace();
        let url = parts.next()?;
        let density: f32 = parts.next()?.strip_suffix('x')?.parse().ok()?;
        (density >= 2.0).then(|| url.to_string())
    })
}

/// Product link of a container: `href`, else `data-href`
pub fn product_url(container: ElementRef<'_>) -> Option<String> {
    PRODUCT_LINKS.iter().find_map(|selector| {
        let link = container.select(selector).next()?;
        let href = link
            .value()
            .attr("href")
            .or_else(|| link.value().attr("data-href"))?
            .trim();
        if href.is_empty() {
            None
        } else if href.starts_with("http") {
            Some(href.to_string())
        } else if href.starts_with("//") {
            Some(normalize_url(href))
        } else {
            Some(format!("https:{}", href))
        }
    })
}

fn serp_item_id(container: ElementRef<'_>) -> Option<String> {
    std::iter::once(container)
        .chain(container.ancestors().filter_map(ElementRef::wrap))
        .find(|el| el.value().name() == "li" && el.value().attr("data-cid").is_some())
        .and_then(|li| li.value().attr("data-cid"))
        .map(str::to_string)
}

fn inside_adv_gallery(container: ElementRef<'_>) -> bool {
    container
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|el| {
            el.value()
                .attr("class")
                .map(|c| c.contains("AdvProductGallery"))
                .unwrap_or(false)
        })
}
