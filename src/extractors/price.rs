//! Current/old price pairing inside one snippet
//!
//! Every price-like element is scoped to its price group: the nearest
//! ancestor matched by the `EPriceGroup_Container` or `EPriceGroup_Pair`
//! rules, or the snippet itself. Prices are only ever paired inside one
//! group, so a neighbouring offer's price can never become this offer's old
//! price. Old prices are whatever `EPrice_Old` marks.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::ElementRef;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::extractors::text::{clean_text, count_digits, detect_currency, format_price, parse_price};
use crate::index::DocumentIndex;
use crate::row::{fields, Row};
use crate::rules::CompiledRules;

static DISCOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\x{2212}\-\x{2013}\x{2014}]\s*([\d\s\x{2009}\x{00A0},]+)\s*%?|([\d\s\x{2009}\x{00A0},]+)\s*%")
        .expect("static regex")
});

static GROUP_SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"EPriceGroup_size_(\w+)").expect("static regex"));

/// The element a price is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceGroupContext<'a> {
    pub element: ElementRef<'a>,
}

#[derive(Debug, Clone)]
struct PriceCandidate<'a> {
    element: ElementRef<'a>,
    value: f64,
    is_old: bool,
    /// Matched by `EPriceGroup_Price`
    preferred: bool,
    group: PriceGroupContext<'a>,
}

/// Resolved prices, unformatted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePair {
    pub current: f64,
    pub old: Option<f64>,
}

pub struct PriceResolver<'c> {
    config: &'c PipelineConfig,
}

impl<'c> PriceResolver<'c> {
    pub fn new(config: &'c PipelineConfig) -> Self {
        Self { config }
    }

    /// Fill the price, currency and discount fields of `row`
    pub fn resolve(&self, index: &DocumentIndex<'_>, rules: &CompiledRules, row: &mut Row) {
        let candidates = self.candidates(index, rules);
        if let Some((pair, current_el)) = self.pair(&candidates) {
            row.set(fields::PRICE, format_price(pair.current));
            if let Some(old) = pair.old {
                row.set(fields::OLD_PRICE, format_price(old));
                row.set(fields::PRICE_GROUP_OLD_PRICE, "true");
            }
            if let Some(currency) = self.currency(index, rules, current_el) {
                row.set(fields::CURRENCY, currency);
            }
            debug!(current = pair.current, old = ?pair.old, "price resolved");
        }

        if let Some(discount) = self.discount(index, rules) {
            row.set(fields::DISCOUNT_PERCENT, discount.as_str());
            row.set(fields::DISCOUNT, format!("\u{2013}{}%", discount));
            row.set(fields::PRICE_GROUP_DISCOUNT, "true");
        }

        match index.first_match(rules.selectors("EPriceBarometer")) {
            Some(barometer) => {
                row.set(fields::PRICE_BAROMETER, "true");
                row.set(fields::LABEL_GROUP_BAROMETER, "true");
                let class = barometer.value().attr("class").unwrap_or("");
                if let Some(view) = barometer_view(class) {
                    row.set(fields::BAROMETER_VIEW, view);
                }
            }
            None => row.set(fields::LABEL_GROUP_BAROMETER, "false"),
        }

        if let Some(group) = index.first_match(rules.selectors("EPriceGroup_Container")) {
            apply_group_modifiers(group.value().attr("class").unwrap_or(""), row);
        }
    }

    /// Innermost price-like elements in document order
    fn candidates<'a>(&self, index: &DocumentIndex<'a>, rules: &CompiledRules) -> Vec<PriceCandidate<'a>> {
        let matched_ids = |names: &[&str]| -> HashSet<_> {
            names
                .iter()
                .flat_map(|name| rules.selectors(name))
                .flat_map(|sel| index.query_all(sel))
                .map(|el| el.id())
                .collect()
        };
        let matched = matched_ids(&[fields::PRICE]);
        if matched.is_empty() {
            return Vec::new();
        }
        let old_marks = matched_ids(&["EPrice_Old"]);
        let preferred = matched_ids(&["EPriceGroup_Price"]);
        let groups = matched_ids(&["EPriceGroup_Container", "EPriceGroup_Pair"]);

        // anything with a matched descendant is a wrapper, not a price
        let mut wrappers = HashSet::new();
        for el in index.elements() {
            if matched.contains(&el.id()) {
                for ancestor in el.ancestors() {
                    wrappers.insert(ancestor.id());
                }
            }
        }

        let root = index.root();
        index
            .elements()
            .iter()
            .filter(|el| matched.contains(&el.id()) && !wrappers.contains(&el.id()))
            .filter_map(|el| {
                let text = el.text().collect::<String>();
                if count_digits(&text) < self.config.min_price_digits {
                    return None;
                }
                Some(PriceCandidate {
                    element: *el,
                    value: parse_price(&text)?,
                    is_old: is_old(*el, root, &|e: ElementRef<'_>| old_marks.contains(&e.id())),
                    preferred: preferred.contains(&el.id()),
                    group: group_of(*el, root, &|e: ElementRef<'_>| groups.contains(&e.id())),
                })
            })
            .collect()
    }

    fn pair<'a>(&self, candidates: &[PriceCandidate<'a>]) -> Option<(PricePair, ElementRef<'a>)> {
        let first = candidates
            .iter()
            .find(|c| !c.is_old && c.preferred)
            .or_else(|| candidates.iter().find(|c| !c.is_old))?;
        let group = first.group;

        if let Some(old) = candidates.iter().find(|c| c.is_old && c.group == group) {
            let old = (old.value > first.value).then_some(old.value);
            return Some((
                PricePair {
                    current: first.value,
                    old,
                },
                first.element,
            ));
        }

        let in_group: Vec<&PriceCandidate<'a>> =
            candidates.iter().filter(|c| c.group == group).collect();
        let current = if first.preferred {
            first
        } else {
            in_group
                .iter()
                .min_by(|a, b| a.value.total_cmp(&b.value))
                .copied()
                .unwrap_or(first)
        };
        let largest = in_group
            .iter()
            .map(|c| c.value)
            .fold(current.value, f64::max);
        let old = (in_group.len() >= 2 && largest > current.value * self.config.old_price_min_gap)
            .then_some(largest);

        Some((
            PricePair {
                current: current.value,
                old,
            },
            current.element,
        ))
    }

    fn currency(
        &self,
        index: &DocumentIndex<'_>,
        rules: &CompiledRules,
        current: ElementRef<'_>,
    ) -> Option<&'static str> {
        if let Some(el) = index.first_match(rules.selectors("EPriceGroup_Currency")) {
            if let Some(currency) = detect_currency(&el.text().collect::<String>()) {
                return Some(currency);
            }
        }
        detect_currency(&current.text().collect::<String>()).or_else(|| {
            current
                .parent()
                .and_then(ElementRef::wrap)
                .and_then(|parent| detect_currency(&parent.text().collect::<String>()))
        })
    }

    /// Discount digits from the discount label, else the discount rule
    fn discount(&self, index: &DocumentIndex<'_>, rules: &CompiledRules) -> Option<String> {
        ["LabelDiscount_Content", fields::DISCOUNT_PERCENT]
            .iter()
            .filter_map(|field| index.first_match(rules.selectors(field)))
            .find_map(|el| discount_digits(&clean_text(&el.text().collect::<String>())))
    }
}

/// The element or one of its ancestors inside the snippet carries an old
/// price mark
fn is_old(
    element: ElementRef<'_>,
    root: ElementRef<'_>,
    marked: &dyn Fn(ElementRef<'_>) -> bool,
) -> bool {
    if marked(element) {
        return true;
    }
    for ancestor in element.ancestors().filter_map(ElementRef::wrap) {
        if marked(ancestor) {
            return true;
        }
        if ancestor == root {
            break;
        }
    }
    false
}

fn group_of<'a>(
    element: ElementRef<'a>,
    root: ElementRef<'a>,
    is_group: &dyn Fn(ElementRef<'_>) -> bool,
) -> PriceGroupContext<'a> {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .take_while(|ancestor| *ancestor != root)
        .find(|ancestor| is_group(*ancestor))
        .map(|element| PriceGroupContext { element })
        .unwrap_or(PriceGroupContext { element: root })
}

/// Market position shown by the price barometer
pub fn barometer_view(class: &str) -> Option<&'static str> {
    if class.contains("below-market") || class.contains("EPriceBarometer-Cheap") {
        Some("below-market")
    } else if class.contains("in-market") || class.contains("EPriceBarometer-Average") {
        Some("in-market")
    } else if class.contains("above-market") || class.contains("EPriceBarometer-Expensive") {
        Some("above-market")
    } else {
        None
    }
}

/// BEM modifiers of the price group block
fn apply_group_modifiers(class: &str, row: &mut Row) {
    if let Some(size) = GROUP_SIZE.captures(class).and_then(|caps| caps.get(1)) {
        row.set(fields::PRICE_GROUP_SIZE, size.as_str());
    }
    if class.contains("EPriceGroup_withBarometer") {
        row.set(fields::PRICE_GROUP_BAROMETER, "true");
    }
    if class.contains("EPriceGroup_withDisclaimer") {
        row.set(fields::PRICE_DISCLAIMER, "true");
    }
    if class.contains("EPriceGroup_plusCashback") || class.contains("EPriceGroup_withPlusCashback") {
        row.set(fields::PLUS_CASHBACK, "true");
    }
}

/// Digits of a discount label such as `−15%` or `15 %`
pub fn discount_digits(text: &str) -> Option<String> {
    let caps = DISCOUNT.captures(text)?;
    let raw = caps.get(1).or_else(|| caps.get(2))?.as_str();
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Thin-space formatted price of free text, as used for JSON values
pub fn format_price_text(text: &str) -> Option<String> {
    parse_price(text).map(format_price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{RuleSet, RuleSetPatch};
    use scraper::{Html, Selector};

    fn resolve(html: &str) -> Row {
        resolve_with(html, &PipelineConfig::default(), &CompiledRules::default())
    }

    fn resolve_with(html: &str, config: &PipelineConfig, rules: &CompiledRules) -> Row {
        let doc = Html::parse_fragment(html);
        let selector = Selector::parse(".Snippet").unwrap();
        let container = doc.select(&selector).next().unwrap();
        let index = DocumentIndex::build(container);
        let mut row = Row::new("EShopItem");
        PriceResolver::new(config).resolve(&index, rules, &mut row);
        row
    }

    #[test]
    fn test_marker_old_price_in_group() {
        let row = resolve(
            r#"<div class="Snippet">
                <div class="EPriceGroup">
                    <span class="EPrice"><span class="EPrice-Value">12 999</span><span class="EPrice-Currency">₽</span></span>
                    <span class="EPrice EPrice_view_old"><span class="EPrice-Value">15 999</span></span>
                    <div class="LabelDiscount"><span class="Label-Content">−19%</span></div>
                </div>
                <div class="EPriceBarometer">хорошая цена</div>
            </div>"#,
        );
        assert_eq!(row.get(fields::PRICE), Some("12\u{2009}999"));
        assert_eq!(row.get(fields::OLD_PRICE), Some("15\u{2009}999"));
        assert_eq!(row.get(fields::PRICE_GROUP_OLD_PRICE), Some("true"));
        assert_eq!(row.get(fields::CURRENCY), Some("₽"));
        assert_eq!(row.get(fields::DISCOUNT_PERCENT), Some("19"));
        assert_eq!(row.get(fields::DISCOUNT), Some("\u{2013}19%"));
        assert_eq!(row.get(fields::PRICE_GROUP_DISCOUNT), Some("true"));
        assert_eq!(row.get(fields::PRICE_BAROMETER), Some("true"));
    }

    #[test]
    fn test_barometer_and_group_modifiers() {
        let row = resolve(
            r#"<div class="Snippet">
                <div class="EPriceGroup EPriceGroup_size_m EPriceGroup_withBarometer EPriceGroup_plusCashback">
                    <span class="EPrice-Value">3 490 ₽</span>
                </div>
                <div class="EPriceBarometer EPriceBarometer-Cheap"></div>
            </div>"#,
        );
        assert_eq!(row.get(fields::BAROMETER_VIEW), Some("below-market"));
        assert_eq!(row.get(fields::LABEL_GROUP_BAROMETER), Some("true"));
        assert_eq!(row.get(fields::PRICE_GROUP_SIZE), Some("m"));
        assert_eq!(row.get(fields::PRICE_GROUP_BAROMETER), Some("true"));
        assert_eq!(row.get(fields::PLUS_CASHBACK), Some("true"));
        assert_eq!(row.get(fields::PRICE_DISCLAIMER), None);

        let row = resolve(r#"<div class="Snippet"><span class="EPrice-Value">990 ₽</span></div>"#);
        assert_eq!(row.get(fields::LABEL_GROUP_BAROMETER), Some("false"));
        assert_eq!(row.get(fields::BAROMETER_VIEW), None);
        assert_eq!(barometer_view("EPriceBarometer_type_above-market"), Some("above-market"));
    }

    #[test]
    fn test_other_groups_never_pair() {
        // two offers side by side; the second offer's price must not become an old price
        let row = resolve(
            r#"<div class="Snippet">
                <div class="EShopItem-Prices"><span class="EPrice-Value">1 000 ₽</span></div>
                <div class="EShopItem-Prices"><span class="EPrice-Value">5 000 ₽</span></div>
                <div class="EShopItem-Prices"><span class="EPrice-Value">900 ₽</span><span class="OldPrice"><span class="EPrice-Value">2 000 ₽</span></span></div>
            </div>"#,
        );
        assert_eq!(row.get(fields::PRICE), Some("1\u{2009}000"));
        assert_eq!(row.get(fields::OLD_PRICE), None);
        assert_eq!(row.get(fields::PRICE_GROUP_OLD_PRICE), None);
    }

    #[test]
    fn test_implicit_pair_respects_gap() {
        let html = r#"<div class="Snippet">
            <div class="EPriceGroup"><span class="EPrice-Value">1 000 ₽</span><span class="EPrice-Value">1 040 ₽</span></div>
        </div>"#;
        let row = resolve(html);
        assert_eq!(row.get(fields::PRICE), Some("1\u{2009}000"));
        assert_eq!(row.get(fields::OLD_PRICE), None);

        let config = PipelineConfig {
            old_price_min_gap: 1.01,
            ..PipelineConfig::default()
        };
        let row = resolve_with(html, &config, &CompiledRules::default());
        assert_eq!(row.get(fields::OLD_PRICE), Some("1\u{2009}040"));

        let row = resolve(
            r#"<div class="Snippet">
                <div class="EPriceGroup"><span class="EPrice-Value">2 490 ₽</span><span class="EPrice-Value">1 990 ₽</span></div>
            </div>"#,
        );
        assert_eq!(row.get(fields::PRICE), Some("1\u{2009}990"));
        assert_eq!(row.get(fields::OLD_PRICE), Some("2\u{2009}490"));
    }

    #[test]
    fn test_markers_follow_rule_updates() {
        let html = r#"<div class="Snippet">
            <div class="Offer"><span class="EPrice-Value">1 900 ₽</span><s class="Strike"><span class="EPrice-Value">1 980 ₽</span></s></div>
            <div class="Offer"><span class="EPrice-Value">5 000 ₽</span></div>
        </div>"#;

        // neither class means anything to the embedded rules
        let row = resolve(html);
        assert_eq!(row.get(fields::PRICE), Some("1\u{2009}900"));
        assert_eq!(row.get(fields::OLD_PRICE), Some("5\u{2009}000"));

        let patch = RuleSetPatch::from_json(
            r#"{"rules": {
                "EPrice_Old": {"domSelectors": [".Strike"]},
                "EPriceGroup_Container": {"domSelectors": [".Offer"]}
            }}"#,
        )
        .unwrap();
        let rules = CompiledRules::new(RuleSet::embedded().merge(&patch));
        let row = resolve_with(html, &PipelineConfig::default(), &rules);
        assert_eq!(row.get(fields::PRICE), Some("1\u{2009}900"));
        assert_eq!(row.get(fields::OLD_PRICE), Some("1\u{2009}980"));
    }

    #[test]
    fn test_group_price_preferred_as_current() {
        let row = resolve(
            r#"<div class="Snippet">
                <div class="EPriceGroup">
                    <span class="Installment"><span class="EPrice-Value">1 250 ₽</span></span>
                    <span class="EPriceGroup-Price"><span class="EPrice-Value">7 490 ₽</span></span>
                </div>
            </div>"#,
        );
        assert_eq!(row.get(fields::PRICE), Some("7\u{2009}490"));
        assert_eq!(row.get(fields::OLD_PRICE), None);
    }

    #[test]
    fn test_short_numbers_and_wrappers_ignored() {
        let row = resolve(
            r#"<div class="Snippet">
                <div class="Price"><span class="EPrice-Value">4 590 $</span></div>
                <span class="EPrice-Value">12</span>
            </div>"#,
        );
        assert_eq!(row.get(fields::PRICE), Some("4\u{2009}590"));
        assert_eq!(row.get(fields::CURRENCY), Some("$"));
        assert_eq!(row.get(fields::OLD_PRICE), None);
    }

    #[test]
    fn test_no_prices() {
        let row = resolve(r#"<div class="Snippet"><span class="Title">Телефон</span></div>"#);
        assert!(!row.has(fields::PRICE));
        assert!(!row.has(fields::DISCOUNT_PERCENT));
    }

    #[test]
    fn test_discount_digits() {
        assert_eq!(discount_digits("−15%").as_deref(), Some("15"));
        assert_eq!(discount_digits("- 7 %").as_deref(), Some("7"));
        assert_eq!(discount_digits("скидка 30 %").as_deref(), Some("30"));
        assert_eq!(discount_digits("12 999 ₽"), None);
        assert_eq!(format_price_text("12999").as_deref(), Some("12\u{2009}999"));
    }
}
