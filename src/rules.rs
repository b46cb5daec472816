//! Parsing rule sets
//!
//! A [`RuleSet`] maps field names to DOM selectors and JSON keys. Fields
//! starting with `#` end up in rows; the rest are lookups for the price
//! resolver. The embedded defaults are built in code and can be patched by a
//! remote [`RuleSetPatch`].

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::index::CompiledSelector;

/// Post-processing applied to a matched value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    Text,
    Image,
    Price,
    Boolean,
    Attribute,
    Rating,
    Html,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRule {
    #[serde(default)]
    pub dom_selectors: Vec<String>,
    #[serde(default)]
    pub json_keys: Vec<String>,
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_attribute: Option<String>,
}

impl FieldRule {
    fn new(dom_selectors: &[&str], json_keys: &[&str], value_type: ValueType) -> Self {
        Self {
            dom_selectors: dom_selectors.iter().map(|s| s.to_string()).collect(),
            json_keys: json_keys.iter().map(|s| s.to_string()).collect(),
            value_type,
            dom_attribute: None,
        }
    }

    fn with_attribute(mut self, attribute: &str) -> Self {
        self.dom_attribute = Some(attribute.to_string());
        self
    }

    /// Overlay the sub-properties the patch supplies
    fn patched(&self, patch: &FieldRulePatch) -> Self {
        Self {
            dom_selectors: patch
                .dom_selectors
                .clone()
                .unwrap_or_else(|| self.dom_selectors.clone()),
            json_keys: patch.json_keys.clone().unwrap_or_else(|| self.json_keys.clone()),
            value_type: patch.value_type.unwrap_or(self.value_type),
            dom_attribute: patch
                .dom_attribute
                .clone()
                .or_else(|| self.dom_attribute.clone()),
        }
    }
}

/// Field rule as sent by a remote source; absent keys keep the base value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRulePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_selectors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_keys: Option<Vec<String>>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_attribute: Option<String>,
}

impl From<&FieldRule> for FieldRulePatch {
    fn from(rule: &FieldRule) -> Self {
        Self {
            dom_selectors: Some(rule.dom_selectors.clone()),
            json_keys: Some(rule.json_keys.clone()),
            value_type: Some(rule.value_type),
            dom_attribute: rule.dom_attribute.clone(),
        }
    }
}

/// Partial rule set received from a remote source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSetPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub rules: BTreeMap<String, FieldRulePatch>,
}

impl RuleSetPatch {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl From<&RuleSet> for RuleSetPatch {
    fn from(set: &RuleSet) -> Self {
        Self {
            version: Some(set.version),
            rules: set
                .rules
                .iter()
                .map(|(name, rule)| (name.clone(), FieldRulePatch::from(rule)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub version: u32,
    pub rules: BTreeMap<String, FieldRule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::embedded()
    }
}

impl RuleSet {
    /// Built-in rules shipped with the crate
    pub fn embedded() -> Self {
        use ValueType::*;

        let rules: Vec<(&str, FieldRule)> = vec![
            ("#SnippetType", FieldRule::new(&[], &["type", "snippetType"], Text)),
            (
                "#ProductURL",
                FieldRule::new(&[], &["url", "link", "href", "productUrl"], Attribute)
                    .with_attribute("href"),
            ),
            (
                "#OrganicTitle",
                FieldRule::new(
                    &[
                        ".OrganicTitle",
                        "[class*=\"OrganicTitle\"]",
                        ".EProductSnippet2-Title",
                        "[class*=\"EProductSnippet2-Title\"]",
                        ".EProductSnippet2-Title a",
                        "[class*=\"EProductSnippet2-Title\"] a",
                    ],
                    &["title", "name", "headline", "text"],
                    Text,
                ),
            ),
            (
                "#ShopName",
                FieldRule::new(
                    &[".EShopName", "[class*=\"EShopName\"]", "[class*=\"ShopName\"]"],
                    &["shopName", "shop", "vendor", "domain"],
                    Text,
                ),
            ),
            (
                "#OrganicHost",
                FieldRule::new(
                    &[".OrganicHost", "[class*=\"OrganicHost\"]"],
                    &["host", "displayUrl"],
                    Text,
                ),
            ),
            (
                "#OrganicPath",
                FieldRule::new(&[".Path", "[class*=\"Path\"]"], &["path", "breadcrumbs"], Text),
            ),
            (
                "#OrganicText",
                FieldRule::new(
                    &[
                        ".OrganicTextContentSpan",
                        "[class*=\"OrganicTextContentSpan\"]",
                        ".EProductSnippet2-Text",
                        "[class*=\"EProductSnippet2-Text\"]",
                    ],
                    &["description", "text", "snippet"],
                    Text,
                ),
            ),
            (
                "#OrganicImage",
                FieldRule::new(
                    &[
                        ".Organic-OfferThumbImage",
                        "[class*=\"Organic-OfferThumbImage\"]",
                        ".EProductSnippet2-Thumb img",
                        "[class*=\"EProductSnippet2-Thumb\"] img",
                        "img",
                    ],
                    &["image", "thumbnail", "thumb", "img"],
                    Image,
                )
                .with_attribute("src"),
            ),
            ("#ThumbImage", FieldRule::new(&[], &["thumbnail", "thumb", "image"], Image)),
            (
                "#FaviconImage",
                FieldRule::new(
                    &[".Favicon", "[class*=\"FaviconImage\"]", "[class*=\"Favicon\"]"],
                    &["favicon", "faviconUrl"],
                    Image,
                ),
            ),
            (
                "#OrganicPrice",
                FieldRule::new(
                    &[
                        ".EPrice-Value",
                        "[class*=\"EPrice-Value\"]",
                        ".EProductSnippet2-Price",
                        "[class*=\"Price-Value\"]",
                        ".Price",
                    ],
                    &["price", "currentPrice", "value"],
                    Price,
                ),
            ),
            ("#OldPrice", FieldRule::new(&[], &["oldPrice"], Price)),
            (
                "#DiscountPercent",
                FieldRule::new(
                    &[
                        ".Price-DiscountPercent",
                        "[class*=\"Price-DiscountPercent\"]",
                        ".EProductSnippet2-Discount",
                        "[class*=\"Discount\"]",
                    ],
                    &["discount", "discountPercent"],
                    Text,
                ),
            ),
            (
                "#ShopRating",
                FieldRule::new(
                    &[".Rating", "[class*=\"Rating\"]", "[aria-label*=\"рейтинг\" i]"],
                    &["rating", "stars"],
                    Rating,
                ),
            ),
            (
                "#ReviewsNumber",
                FieldRule::new(
                    &[
                        "[class*=\"Review\"]",
                        ".Reviews",
                        "[class*=\"Reviews\"]",
                        "[aria-label*=\"отзыв\" i]",
                    ],
                    &["reviews", "reviewsCount"],
                    Text,
                ),
            ),
            (
                "#ProductRating",
                FieldRule::new(
                    &[
                        ".ELabelRating",
                        "[class*=\"ELabelRating\"]",
                        "[class*=\"LabelRating\"]",
                        "[class*=\"label-rating\"]",
                    ],
                    &["productRating"],
                    Rating,
                ),
            ),
            (
                "EOfferItem_Title",
                FieldRule::new(&[".EOfferItem-Title", "[class*=\"EOfferItem-Title\"]"], &[], Text),
            ),
            (
                "EOfferItem_ShopName",
                FieldRule::new(&[".EOfferItem-ShopName", "[class*=\"EOfferItem-ShopName\"]"], &[], Text),
            ),
            (
                "EOfferItem_Price",
                FieldRule::new(&[".EOfferItem .EPrice-Value", ".EPrice-Value"], &[], Price),
            ),
            ("EOfferItem_Reviews", FieldRule::new(&[".EOfferItem-Reviews"], &[], Text)),
            ("EOfferItem_Delivery", FieldRule::new(&[".EOfferItem-Deliveries"], &[], Text)),
            (
                "EOfferItem_Button",
                FieldRule::new(&[".EOfferItem-Button"], &[], Attribute).with_attribute("href"),
            ),
            (
                "CheckoutButton",
                FieldRule::new(
                    &[
                        "[data-market-url-type=\"market_checkout\"]",
                        ".MarketCheckout-Button",
                        "[class*=\"MarketCheckout-Button\"]",
                        ".EMarketCheckoutButton-Container",
                        ".EMarketCheckoutButton-Button",
                        ".Button_view_primary[href*=\"/cart\"]",
                        ".Button_view_primary[href*=\"/express\"]",
                    ],
                    &[],
                    Boolean,
                ),
            ),
            (
                "CheckoutLabel",
                FieldRule::new(&[".EMarketCheckoutLabel", ".EThumb-LabelsCheckoutContainer"], &[], Boolean),
            ),
            (
                "Button_view_white",
                FieldRule::new(&[".Button_view_white", "[class*=\"Button_view_white\"]"], &[], Boolean),
            ),
            (
                "Button_view_default",
                FieldRule::new(&[".Button_view_default", "[class*=\"Button_view_default\"]"], &[], Boolean),
            ),
            (
                "EMarketCheckoutLabel",
                FieldRule::new(
                    &[".EMarketCheckoutLabel", "[class*=\"EMarketCheckoutLabel\"]"],
                    &[],
                    Boolean,
                ),
            ),
            (
                "EDeliveryGroup",
                FieldRule::new(
                    &[
                        ".EDeliveryGroup",
                        "[class*=\"EDeliveryGroup\"]:not([class*=\"EDeliveryGroup-Item\"])",
                    ],
                    &[],
                    Boolean,
                ),
            ),
            (
                "EDeliveryGroup_Item",
                FieldRule::new(&[".EDeliveryGroup-Item", "[class*=\"EDeliveryGroup-Item\"]"], &[], Text),
            ),
            (
                "Crossborder",
                FieldRule::new(
                    &[".ECrossborderInfo", ".ShopInfo-Crossborder", "[class*=\"Crossborder\"]"],
                    &[],
                    Boolean,
                ),
            ),
            (
                "OfficialShop",
                FieldRule::new(
                    &[".EShopName .OfficialShop", "[class*=\"EShopName\"] .OfficialShop"],
                    &[],
                    Boolean,
                ),
            ),
            ("Verified", FieldRule::new(&[".Verified_type_goods", ".Verified"], &[], Boolean)),
            (
                "Fintech",
                FieldRule::new(
                    &[".Fintech:not(.Fintech-Icon)", "[class*=\"EPriceGroup-Fintech\"]"],
                    &[],
                    Boolean,
                ),
            ),
            (
                "EBnpl",
                FieldRule::new(
                    &[
                        ".EShopItem-Bnpl",
                        "[class*=\"EShopItem-Bnpl\"]",
                        ".EBnpl",
                        ".DeliveriesBnpl",
                        "[class*=\"DeliveriesBnpl\"]",
                        ".EDeliveryGroup-Bnpl",
                        "[class*=\"-Bnpl\"]",
                    ],
                    &[],
                    Boolean,
                ),
            ),
            (
                "EBnpl_Item",
                FieldRule::new(&[".Line-AddonContent", "[class*=\"Line-AddonContent\"]"], &[], Text),
            ),
            (
                "EThumbGroup",
                FieldRule::new(&[".EThumbGroup", "[class*=\"EThumbGroup\"]"], &[], Boolean),
            ),
            (
                "EThumbGroup_Image",
                FieldRule::new(&[".EThumb-Image, img[class*=\"EThumb\"]"], &[], Image),
            ),
            (
                "EQuote",
                FieldRule::new(
                    &[
                        ".EQuote",
                        ".OrganicUgcReviews-QuoteWrapper",
                        "[class*=\"EQuote\"]",
                        "[class*=\"OrganicUgcReviews-QuoteWrapper\"]",
                    ],
                    &[],
                    Boolean,
                ),
            ),
            (
                "EQuote_Text",
                FieldRule::new(&[".EQuote-Text", "[class*=\"EQuote-Text\"]"], &[], Text),
            ),
            (
                "Sitelinks",
                FieldRule::new(&[".Sitelinks", "[class*=\"Sitelinks\"]"], &[], Boolean),
            ),
            (
                "Sitelinks_Item",
                FieldRule::new(&[".Sitelinks-Title", "[class*=\"Sitelinks-Title\"]"], &[], Text),
            ),
            (
                "EPriceGroup_Pair",
                FieldRule::new(&[".EPriceGroup-Pair", "[class*=\"EPriceGroup-Pair\"]"], &[], Boolean),
            ),
            (
                "EPriceGroup_Container",
                FieldRule::new(&[".EPriceGroup", ".EShopItem-Prices"], &[], Boolean),
            ),
            (
                "EPriceGroup_Price",
                FieldRule::new(
                    &[
                        ".EPriceGroup-Price:not(.EPrice_view_old) .EPrice-Value",
                        "[class*=\"EPriceGroup-Price\"]:not([class*=\"EPrice_view_old\"]) .EPrice-Value",
                    ],
                    &[],
                    Price,
                ),
            ),
            (
                "EPriceGroup_Currency",
                FieldRule::new(
                    &[
                        ".EPriceGroup-Price:not(.EPrice_view_old) .EPrice-Currency",
                        "[class*=\"EPriceGroup-Price\"]:not([class*=\"EPrice_view_old\"]) .EPrice-Currency",
                    ],
                    &[],
                    Text,
                ),
            ),
            (
                "EPrice_Old",
                FieldRule::new(
                    &[
                        ".EPrice_view_old",
                        "[class*=\"EPrice_view_old\"]",
                        "[class*=\"OldPrice\"]",
                        "[class*=\"Price_old\"]",
                    ],
                    &[],
                    Price,
                ),
            ),
            (
                "LabelDiscount_Content",
                FieldRule::new(
                    &[
                        ".LabelDiscount .Label-Content",
                        "[class*=\"LabelDiscount\"] .Label-Content",
                        ".LabelDiscount [class*=\"Label-Content\"]",
                        ".LabelDiscount",
                        "[class*=\"LabelDiscount\"]",
                    ],
                    &[],
                    Text,
                ),
            ),
            (
                "EPriceBarometer",
                FieldRule::new(&[".EPriceBarometer", "[class*=\"EPriceBarometer\"]"], &[], Attribute),
            ),
        ];

        Self {
            version: 1,
            rules: rules
                .into_iter()
                .map(|(name, rule)| (name.to_string(), rule))
                .collect(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Canonical JSON: fields are ordered by name
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// blake3 digest of the canonical JSON
    pub fn content_hash(&self) -> String {
        content_hash(&self.to_json())
    }

    pub fn rule(&self, field: &str) -> Option<&FieldRule> {
        self.rules.get(field)
    }

    /// Overlay a patch. Fields are the union of both sets; a field present in
    /// both takes each sub-property from the patch when supplied.
    pub fn merge(&self, patch: &RuleSetPatch) -> RuleSet {
        let mut rules = self.rules.clone();
        for (name, field_patch) in &patch.rules {
            let merged = match rules.get(name) {
                Some(base) => base.patched(field_patch),
                None => FieldRule::default().patched(field_patch),
            };
            rules.insert(name.clone(), merged);
        }
        RuleSet {
            version: patch.version.filter(|v| *v != 0).unwrap_or(self.version),
            rules,
        }
    }
}

/// Hex blake3 digest of raw rule text
pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// A rule set with every selector resolved once
#[derive(Debug, Clone)]
pub struct CompiledRules {
    rules: RuleSet,
    selectors: HashMap<String, Vec<CompiledSelector>>,
}

impl CompiledRules {
    pub fn new(rules: RuleSet) -> Self {
        let selectors = rules
            .rules
            .iter()
            .map(|(name, rule)| {
                let compiled = rule
                    .dom_selectors
                    .iter()
                    .map(|s| CompiledSelector::new(s))
                    .collect();
                (name.clone(), compiled)
            })
            .collect::<HashMap<String, Vec<CompiledSelector>>>();
        let direct = selectors.values().flatten().filter(|s| !s.kind.is_indexed()).count();
        debug!(rules = rules.rules.len(), direct, "rules compiled");
        Self { rules, selectors }
    }

    pub fn rule_set(&self) -> &RuleSet {
        &self.rules
    }

    pub fn rule(&self, field: &str) -> Option<&FieldRule> {
        self.rules.rule(field)
    }

    pub fn selectors(&self, field: &str) -> &[CompiledSelector] {
        self.selectors.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `#`-prefixed rules in name order
    pub fn row_fields(&self) -> impl Iterator<Item = (&str, &FieldRule)> {
        self.rules
            .rules
            .iter()
            .filter(|(name, _)| name.starts_with('#'))
            .map(|(name, rule)| (name.as_str(), rule))
    }
}

impl Default for CompiledRules {
    fn default() -> Self {
        Self::new(RuleSet::embedded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SelectorKind;

    #[test]
    fn test_embedded_defaults() {
        let rules = RuleSet::embedded();
        assert_eq!(rules.version, 1);
        assert_eq!(rules.rules.len(), 48);
        assert_eq!(rules.rule("#ShopRating").unwrap().value_type, ValueType::Rating);
        assert_eq!(
            rules.rule("#OrganicImage").unwrap().dom_attribute.as_deref(),
            Some("src")
        );
        assert!(rules.rule("#OldPrice").unwrap().dom_selectors.is_empty());
    }

    #[test]
    fn test_wire_names() {
        let json = r##"{
            "version": 2,
            "rules": {
                "#OrganicTitle": {"domSelectors": [".T"], "jsonKeys": ["t"], "type": "html"}
            }
        }"##;
        let rules = RuleSet::from_json(json).unwrap();
        let title = rules.rule("#OrganicTitle").unwrap();
        assert_eq!(title.dom_selectors, vec![".T"]);
        assert_eq!(title.value_type, ValueType::Html);
        assert_eq!(title.dom_attribute, None);

        let value = serde_json::to_value(&rules).unwrap();
        assert_eq!(value["rules"]["#OrganicTitle"]["jsonKeys"][0], "t");
        assert!(value["rules"]["#OrganicTitle"].get("domAttribute").is_none());
    }

    #[test]
    fn test_merge_overlays_supplied_properties() {
        let base = RuleSet::embedded();
        let patch = RuleSetPatch::from_json(
            r##"{"version": 3, "rules": {
                "#ShopName": {"domSelectors": [".Shop"]},
                "#Brand": {"domSelectors": [".Brand"], "type": "text"}
            }}"##,
        )
        .unwrap();

        let merged = base.merge(&patch);
        assert_eq!(merged.version, 3);
        assert_eq!(merged.rules.len(), base.rules.len() + 1);

        let shop = merged.rule("#ShopName").unwrap();
        assert_eq!(shop.dom_selectors, vec![".Shop"]);
        assert_eq!(shop.json_keys, base.rule("#ShopName").unwrap().json_keys);
        assert_eq!(merged.rule("#Brand").unwrap().dom_selectors, vec![".Brand"]);

        let unversioned = RuleSetPatch::from_json(r#"{"rules": {}}"#).unwrap();
        assert_eq!(base.merge(&unversioned).version, 1);
    }

    #[test]
    fn test_merge_idempotence() {
        let base = RuleSet::embedded();
        assert_eq!(base.merge(&RuleSetPatch::from(&base)), base);
        assert_eq!(base.merge(&RuleSetPatch::default()), base);

        let patch = RuleSetPatch::from_json(r##"{"rules": {"#OrganicPath": {"jsonKeys": ["p"]}}}"##)
            .unwrap();
        let once = base.merge(&patch);
        assert_eq!(once.merge(&patch), once);
    }

    #[test]
    fn test_hash_is_stable() {
        let a = RuleSet::embedded().content_hash();
        let b = RuleSet::embedded().content_hash();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(content_hash("{}"), a);
    }

    #[test]
    fn test_compiled_rules() {
        let compiled = CompiledRules::default();
        let title = compiled.selectors("#OrganicTitle");
        assert_eq!(title.len(), 6);
        assert!(matches!(title[0].kind, SelectorKind::ExactClass(ref c) if c == "OrganicTitle"));
        assert!(matches!(title[1].kind, SelectorKind::SubstringClass(_)));
        assert!(matches!(title[4].kind, SelectorKind::Unsupported(Some(_))));
        assert!(compiled.selectors("#Missing").is_empty());
        assert!(compiled.row_fields().all(|(name, _)| name.starts_with('#')));
        assert_eq!(compiled.row_fields().count(), 16);
    }
}
