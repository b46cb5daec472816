//! Snippet features beyond the generic fields
//!
//! Badges, delivery options, payment offers, image collages, sitelinks,
//! review quotes and the call-to-action button. Each lookup is an auxiliary
//! rule, so remote rule updates retarget them. Visibility flags are always
//! written as `"true"` or `"false"` because renderers toggle layers on them.

use once_cell::sync::Lazy;
use scraper::{ElementRef, Selector};
use tracing::debug;

use crate::extractors::fields::{image_url, Platform};
use crate::extractors::offer;
use crate::extractors::text::clean_text;
use crate::index::DocumentIndex;
use crate::row::{fields, Row, SnippetType};
use crate::rules::CompiledRules;

const MAX_DELIVERY_ITEMS: usize = 3;
const MAX_BNPL_ITEMS: usize = 5;
const MAX_SITELINKS: usize = 5;
const MAX_THUMB_IMAGES: usize = 3;

static BUTTON_TEXT: Lazy<Selector> = Lazy::new(|| Selector::parse(".Button-Text").expect("static selector"));
static INFO_ICON: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(".InfoIcon .InfoIcon-Icon, .InfoIcon [class*=\"InfoIcon-Icon\"]").expect("static selector")
});

/// `Fintech_type_*` class fragment and the value renderers expect, most
/// specific first
const FINTECH_TYPES: &[(&str, &str)] = &[
    ("Fintech_type_split", "split"),
    ("Fintech_type_yandexPay", "yandexPay"),
    ("Fintech_type_pay", "pay"),
    ("Fintech_type_ozon", "ozon"),
    ("Fintech_type_dolyame", "Dolyami"),
    ("Fintech_type_plait", "Plait"),
    ("Fintech_type_podeli", "Podeli"),
    ("Fintech_type_mokka", "Mokka"),
    ("Fintech_type_mtsPay", "MTS Pay"),
    ("Fintech_type_tPay", "T-Pay"),
    ("Fintech_type_alfa", "alfaCard"),
    ("Fintech_type_wildberries", "Wildberries"),
];

const FINTECH_VIEWS: &[(&str, &str)] = &[
    ("Fintech_view_extra-short", "extra-short"),
    ("Fintech_view_short", "short"),
    ("Fintech_view_long", "long"),
    ("Fintech_view_extra-long", "extra-long"),
];

pub struct FeatureExtractor<'r> {
    rules: &'r CompiledRules,
}

impl<'r> FeatureExtractor<'r> {
    pub fn new(rules: &'r CompiledRules) -> Self {
        Self { rules }
    }

    /// Add the feature fields of one container. Runs after the price
    /// resolver so catalog detection can see the price.
    pub fn apply(
        &self,
        container: ElementRef<'_>,
        index: &DocumentIndex<'_>,
        snippet_type: SnippetType,
        platform: Platform,
        row: &mut Row,
    ) {
        if snippet_type == SnippetType::EOfferItem {
            offer::apply_offer(index, self.rules, row);
            return;
        }

        self.badges(index, row);
        self.delivery(index, row);
        self.fintech(index, row);
        self.bnpl(index, row);
        self.thumb_group(index, row);
        self.quote(index, row);
        self.sitelinks(index, row);
        self.button(container, index, snippet_type, platform, row);
    }

    fn first<'a>(&self, index: &DocumentIndex<'a>, name: &str) -> Option<ElementRef<'a>> {
        index.first_match(self.rules.selectors(name))
    }

    fn exists(&self, index: &DocumentIndex<'_>, name: &str) -> bool {
        self.first(index, name).is_some()
    }

    /// Unique non-empty texts of `item_rule` inside `scope`, in document order
    fn item_texts<'a>(
        &self,
        scope: ElementRef<'a>,
        item_rule: &str,
        scanned: usize,
        kept: usize,
        skip: impl Fn(ElementRef<'_>) -> bool,
    ) -> Vec<String> {
        let scoped = DocumentIndex::build(scope);
        let mut seen: Vec<ElementRef<'a>> = Vec::new();
        for selector in self.rules.selectors(item_rule) {
            for el in scoped.query_all(selector) {
                if !seen.contains(&el) {
                    seen.push(el);
                }
            }
        }
        // several selectors can match; restore document order
        seen.sort_by_key(|el| scoped.elements().iter().position(|e| e == el));

        let mut texts: Vec<String> = Vec::new();
        for el in seen.into_iter().take(scanned) {
            if skip(el) {
                continue;
            }
            let text = clean_text(&el.text().collect::<String>());
            if !text.is_empty() && !texts.contains(&text) {
                texts.push(text);
            }
            if texts.len() == kept {
                break;
            }
        }
        texts
    }

    fn badges(&self, index: &DocumentIndex<'_>, row: &mut Row) {
        if self.exists(index, "Verified") {
            row.set(fields::IS_VERIFIED, "true");
            row.set(fields::VERIFIED_TYPE, "goods");
        } else {
            row.set(fields::IS_VERIFIED, "false");
        }
        row.set(fields::OFFICIAL_SHOP, flag(self.exists(index, "OfficialShop")));
        row.set(
            fields::MARKET_CHECKOUT_LABEL,
            flag(self.exists(index, "EMarketCheckoutLabel")),
        );
    }

    fn delivery(&self, index: &DocumentIndex<'_>, row: &mut Row) {
        match self.first(index, "EDeliveryGroup") {
            Some(group) => {
                let items = self.item_texts(group, "EDeliveryGroup_Item", usize::MAX, MAX_DELIVERY_ITEMS, is_hidden);
                for (i, item) in items.iter().enumerate() {
                    row.set(&fields::delivery_item(i + 1), item.as_str());
                }
                row.set(fields::DELIVERY_GROUP_COUNT, items.len().to_string());
                row.set(fields::DELIVERY_GROUP, flag(!items.is_empty()));
            }
            None => {
                row.set(fields::DELIVERY_GROUP, "false");
                row.set(fields::DELIVERY_GROUP_COUNT, "0");
            }
        }
        row.set(fields::DELIVERY_ABROAD, flag(self.exists(index, "Crossborder")));
    }

    fn fintech(&self, index: &DocumentIndex<'_>, row: &mut Row) {
        let Some(fintech) = self.first(index, "Fintech") else {
            row.set(fields::FINTECH, "false");
            row.set(fields::INFO_ICON, "false");
            return;
        };
        row.set(fields::FINTECH, "true");
        row.set(fields::INFO_ICON, flag(fintech.select(&INFO_ICON).next().is_some()));

        let class = fintech.value().attr("class").unwrap_or("");
        if let Some((_, kind)) = FINTECH_TYPES.iter().find(|(marker, _)| class.contains(*marker)) {
            row.set(fields::FINTECH_TYPE, *kind);
        }
        let view = FINTECH_VIEWS
            .iter()
            .find(|(marker, _)| class.contains(*marker))
            .map(|(_, view)| *view)
            .unwrap_or("default");
        row.set(fields::FINTECH_VIEW, view);
    }

    fn bnpl(&self, index: &DocumentIndex<'_>, row: &mut Row) {
        match self.first(index, "EBnpl") {
            Some(block) => {
                let options = self.item_texts(block, "EBnpl_Item", MAX_BNPL_ITEMS, MAX_BNPL_ITEMS, |_| false);
                for (i, option) in options.iter().enumerate() {
                    row.set(&fields::bnpl_item(i + 1), option.as_str());
                }
                row.set(fields::BNPL_COUNT, options.len().to_string());
                row.set(fields::BNPL, flag(!options.is_empty()));
            }
            None => {
                row.set(fields::BNPL, "false");
                row.set(fields::BNPL_COUNT, "0");
            }
        }
    }

    /// Several images make a collage; a collage without a price is a
    /// catalog page
    fn thumb_group(&self, index: &DocumentIndex<'_>, row: &mut Row) {
        let images: Vec<String> = match self.first(index, "EThumbGroup") {
            Some(group) => {
                let scoped = DocumentIndex::build(group);
                self.rules
                    .selectors("EThumbGroup_Image")
                    .iter()
                    .flat_map(|sel| scoped.query_all(sel))
                    .filter_map(|img| image_url(img, "src"))
                    .collect()
            }
            None => Vec::new(),
        };

        match images.len() {
            0 => row.set(fields::IMAGE_TYPE, "EThumb"),
            1 => {
                row.set(fields::IMAGE_TYPE, "EThumb");
                row.set(fields::IMAGE, images[0].as_str());
                row.set(fields::THUMB_IMAGE, images[0].as_str());
            }
            count => {
                row.set(fields::IMAGE_TYPE, "EThumbGroup");
                for (i, image) in images.iter().take(MAX_THUMB_IMAGES).enumerate() {
                    row.set(&fields::thumb_group_image(i + 1), image.as_str());
                }
                row.set(fields::THUMB_GROUP_COUNT, count.to_string());
                row.set(fields::IS_CATALOG_PAGE, flag(!row.has(fields::PRICE)));
                debug!(images = count, "thumb group");
            }
        }
    }

    fn quote(&self, index: &DocumentIndex<'_>, row: &mut Row) {
        let text = self.first(index, "EQuote").and_then(|quote| {
            let scoped = DocumentIndex::build(quote);
            scoped
                .first_match(self.rules.selectors("EQuote_Text"))
                .map(|el| clean_text(&el.text().collect::<String>()))
                .filter(|t| !t.is_empty())
        });
        match text {
            Some(text) => {
                row.set(fields::QUOTE_TEXT, text.as_str());
                row.set(fields::LEGACY_QUOTE_TEXT, text);
                row.set(fields::WITH_QUOTES, "true");
            }
            None => row.set(fields::WITH_QUOTES, "false"),
        }
    }

    fn sitelinks(&self, index: &DocumentIndex<'_>, row: &mut Row) {
        if !self.exists(index, "Sitelinks") {
            row.set(fields::SITELINKS, "false");
            row.set(fields::SITELINKS_COUNT, "0");
            return;
        }
        row.set(fields::SITELINKS, "true");
        let links = self.item_texts(index.root(), "Sitelinks_Item", MAX_SITELINKS, MAX_SITELINKS, |_| false);
        for (i, link) in links.iter().enumerate() {
            row.set(&fields::sitelink(i + 1), link.as_str());
        }
        row.set(fields::SITELINKS_COUNT, links.len().to_string());
    }

    fn button(
        &self,
        container: ElementRef<'_>,
        index: &DocumentIndex<'_>,
        snippet_type: SnippetType,
        platform: Platform,
        row: &mut Row,
    ) {
        let class = container.value().attr("class").unwrap_or("");
        let checkout = self.exists(index, "CheckoutButton")
            || class.contains("EShopItem_withCheckout")
            || container
                .select(&BUTTON_TEXT)
                .next()
                .map(|el| el.text().collect::<String>().contains("Купить в 1 клик"))
                .unwrap_or(false);

        match snippet_type {
            SnippetType::EShopItem if platform == Platform::Touch => {
                row.set(fields::BUTTON, flag(checkout));
                if checkout {
                    row.set(fields::BUTTON_VIEW, "primaryShort");
                }
                row.set(fields::BUTTON_TYPE, if checkout { "checkout" } else { "shop" });
                row.set(fields::BUTTON_VISIBLE, flag(checkout));
            }
            SnippetType::EShopItem => {
                row.set(fields::BUTTON, "true");
                let (view, kind) = if checkout {
                    ("primaryLong", "checkout")
                } else {
                    ("secondary", "shop")
                };
                row.set(fields::BUTTON_VIEW, view);
                row.set(fields::BUTTON_TYPE, kind);
            }
            SnippetType::Organic | SnippetType::OrganicWithOfferInfo => {
                if class.contains("Organic-Checkout") || self.exists(index, "CheckoutLabel") {
                    row.set(fields::BUTTON, "true");
                    row.set(fields::BUTTON_VIEW, "primaryLong");
                    row.set(fields::BUTTON_VISIBLE, "true");
                    row.set(fields::BUTTON_TYPE, "checkout");
                } else {
                    row.set(fields::BUTTON, "false");
                    row.set(fields::BUTTON_VISIBLE, "false");
                    row.set(fields::BUTTON_TYPE, "shop");
                }
            }
            SnippetType::EProductSnippet2 => {
                if checkout || self.exists(index, "CheckoutLabel") {
                    row.set(fields::BUTTON, "true");
                    row.set(fields::BUTTON_VIEW, "primaryShort");
                    row.set(fields::BUTTON_TYPE, "checkout");
                    row.set(fields::MARKET_CHECKOUT_LABEL, "true");
                } else {
                    row.set(fields::BUTTON, "false");
                    row.set(fields::BUTTON_TYPE, "shop");
                    row.set(fields::MARKET_CHECKOUT_LABEL, "false");
                }
            }
            _ => {
                let any = checkout
                    || self.exists(index, "Button_view_white")
                    || self.exists(index, "Button_view_default");
                row.set(fields::BUTTON, flag(any));
            }
        }
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Screen-reader-only copies repeat the visible text
fn is_hidden(el: ElementRef<'_>) -> bool {
    std::iter::once(el)
        .chain(el.ancestors().filter_map(ElementRef::wrap))
        .any(|e| e.value().attr("class").map(|c| c.contains("A11yHidden")).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractors::fields::detect_snippet_type;
    use scraper::Html;

    fn extract(html: &str, platform: Platform) -> Row {
        let doc = Html::parse_fragment(html);
        let selector = Selector::parse("[data-test=container]").unwrap();
        let container = doc.select(&selector).next().unwrap();
        let index = DocumentIndex::build(container);
        let rules = CompiledRules::default();
        let detected = detect_snippet_type(container, &index);
        let mut row = Row::new(detected.snippet_type.as_str());
        FeatureExtractor::new(&rules).apply(container, &index, detected.snippet_type, platform, &mut row);
        row
    }

    #[test]
    fn test_delivery_and_badges() {
        let row = extract(
            r#"<div data-test="container" class="EShopItem">
                <div class="EShopName">Shop <span class="OfficialShop"></span></div>
                <span class="Verified Verified_type_goods"></span>
                <div class="EDeliveryGroup">
                    <span class="EDeliveryGroup-Item">Курьером завтра</span>
                    <span class="A11yHidden"><span class="EDeliveryGroup-Item">Курьером завтра, скрыто</span></span>
                    <span class="EDeliveryGroup-Item">Самовывоз</span>
                    <span class="EDeliveryGroup-Item">Самовывоз</span>
                    <span class="EDeliveryGroup-Item">Пункт выдачи</span>
                    <span class="EDeliveryGroup-Item">Почта</span>
                </div>
                <div class="ShopInfo-Crossborder">из-за рубежа</div>
            </div>"#,
            Platform::Desktop,
        );
        assert_eq!(row.get(fields::IS_VERIFIED), Some("true"));
        assert_eq!(row.get(fields::VERIFIED_TYPE), Some("goods"));
        assert_eq!(row.get(fields::OFFICIAL_SHOP), Some("true"));
        assert_eq!(row.get(fields::MARKET_CHECKOUT_LABEL), Some("false"));
        assert_eq!(row.get(fields::DELIVERY_GROUP), Some("true"));
        assert_eq!(row.get(fields::DELIVERY_GROUP_COUNT), Some("3"));
        assert_eq!(row.get(&fields::delivery_item(1)), Some("Курьером завтра"));
        assert_eq!(row.get(&fields::delivery_item(2)), Some("Самовывоз"));
        assert_eq!(row.get(&fields::delivery_item(3)), Some("Пункт выдачи"));
        assert_eq!(row.get(&fields::delivery_item(4)), None);
        assert_eq!(row.get(fields::DELIVERY_ABROAD), Some("true"));
    }

    #[test]
    fn test_flags_default_to_false() {
        let row = extract(
            r#"<div data-test="container" class="EShopItem"><div class="EShopName">Shop</div></div>"#,
            Platform::Desktop,
        );
        for field in [
            fields::IS_VERIFIED,
            fields::OFFICIAL_SHOP,
            fields::DELIVERY_GROUP,
            fields::DELIVERY_ABROAD,
            fields::FINTECH,
            fields::INFO_ICON,
            fields::BNPL,
            fields::SITELINKS,
            fields::WITH_QUOTES,
        ] {
            assert_eq!(row.get(field), Some("false"), "{}", field);
        }
        assert_eq!(row.get(fields::DELIVERY_GROUP_COUNT), Some("0"));
        assert_eq!(row.get(fields::IMAGE_TYPE), Some("EThumb"));
        assert_eq!(row.get(fields::BUTTON), Some("true"));
        assert_eq!(row.get(fields::BUTTON_VIEW), Some("secondary"));
    }

    #[test]
    fn test_fintech_and_bnpl() {
        let row = extract(
            r#"<div data-test="container" class="EProductSnippet2">
                <div class="Fintech Fintech_type_dolyame Fintech_view_extra-short">
                    <div class="InfoIcon"><span class="InfoIcon-Icon"></span></div>
                </div>
                <div class="EShopItem-Bnpl">
                    <span class="Line-AddonContent">Сплит</span>
                    <span class="Line-AddonContent">Долями</span>
                    <span class="Line-AddonContent">Сплит</span>
                </div>
            </div>"#,
            Platform::Desktop,
        );
        assert_eq!(row.get(fields::FINTECH), Some("true"));
        assert_eq!(row.get(fields::INFO_ICON), Some("true"));
        assert_eq!(row.get(fields::FINTECH_TYPE), Some("Dolyami"));
        assert_eq!(row.get(fields::FINTECH_VIEW), Some("extra-short"));
        assert_eq!(row.get(fields::BNPL), Some("true"));
        assert_eq!(row.get(fields::BNPL_COUNT), Some("2"));
        assert_eq!(row.get(&fields::bnpl_item(2)), Some("Долями"));
    }

    #[test]
    fn test_thumb_group_and_catalog_page() {
        let html = r#"<div data-test="container" class="Organic Organic_withOfferInfo">
            <div class="EThumbGroup">
                <img class="EThumb-Image" src="//img.test/1.jpg">
                <img class="EThumb-Image" src="//img.test/2.jpg">
                <img class="EThumb-Image" data-src="//img.test/3.jpg">
                <img class="EThumb-Image" src="//img.test/4.jpg">
            </div>
        </div>"#;
        let row = extract(html, Platform::Desktop);
        assert_eq!(row.get(fields::IMAGE_TYPE), Some("EThumbGroup"));
        assert_eq!(row.get(&fields::thumb_group_image(1)), Some("https://img.test/1.jpg"));
        assert_eq!(row.get(&fields::thumb_group_image(3)), Some("https://img.test/3.jpg"));
        assert_eq!(row.get(&fields::thumb_group_image(4)), None);
        assert_eq!(row.get(fields::THUMB_GROUP_COUNT), Some("4"));
        assert_eq!(row.get(fields::IS_CATALOG_PAGE), Some("true"));

        let single = extract(
            r#"<div data-test="container" class="Organic_withOfferInfo">
                <div class="EThumbGroup"><img class="EThumb-Image" src="//img.test/only.jpg"></div>
            </div>"#,
            Platform::Desktop,
        );
        assert_eq!(single.get(fields::IMAGE_TYPE), Some("EThumb"));
        assert_eq!(single.get(fields::IMAGE), Some("https://img.test/only.jpg"));
        assert_eq!(single.get(fields::THUMB_IMAGE), Some("https://img.test/only.jpg"));
    }

    #[test]
    fn test_quote_and_sitelinks() {
        let row = extract(
            r#"<div data-test="container" class="Organic_withOfferInfo">
                <div class="OrganicUgcReviews-QuoteWrapper"><span class="EQuote-Text"> «Быстрая доставка» </span></div>
                <div class="Sitelinks">
                    <a class="Sitelinks-Title">Доставка</a>
                    <a class="Sitelinks-Title">Оплата</a>
                    <a class="Sitelinks-Title">Доставка</a>
                </div>
            </div>"#,
            Platform::Desktop,
        );
        assert_eq!(row.get(fields::QUOTE_TEXT), Some("«Быстрая доставка»"));
        assert_eq!(row.get(fields::LEGACY_QUOTE_TEXT), Some("«Быстрая доставка»"));
        assert_eq!(row.get(fields::WITH_QUOTES), Some("true"));
        assert_eq!(row.get(fields::SITELINKS), Some("true"));
        assert_eq!(row.get(fields::SITELINKS_COUNT), Some("2"));
        assert_eq!(row.get(&fields::sitelink(2)), Some("Оплата"));
    }

    #[test]
    fn test_buttons_by_type_and_platform() {
        let shop_checkout = r#"<div data-test="container" class="EShopItem EShopItem_withCheckout"></div>"#;
        let row = extract(shop_checkout, Platform::Desktop);
        assert_eq!(row.get(fields::BUTTON), Some("true"));
        assert_eq!(row.get(fields::BUTTON_VIEW), Some("primaryLong"));
        assert_eq!(row.get(fields::BUTTON_TYPE), Some("checkout"));

        let row = extract(shop_checkout, Platform::Touch);
        assert_eq!(row.get(fields::BUTTON_VIEW), Some("primaryShort"));
        assert_eq!(row.get(fields::BUTTON_VISIBLE), Some("true"));

        let row = extract(r#"<div data-test="container" class="EShopItem"></div>"#, Platform::Touch);
        assert_eq!(row.get(fields::BUTTON), Some("false"));
        assert_eq!(row.get(fields::BUTTON_VIEW), None);
        assert_eq!(row.get(fields::BUTTON_VISIBLE), Some("false"));

        let row = extract(
            r#"<div data-test="container" class="Organic_withOfferInfo"><span class="EMarketCheckoutLabel"></span></div>"#,
            Platform::Desktop,
        );
        assert_eq!(row.get(fields::BUTTON), Some("true"));
        assert_eq!(row.get(fields::BUTTON_VIEW), Some("primaryLong"));
        assert_eq!(row.get(fields::BUTTON_VISIBLE), Some("true"));

        let row = extract(
            r#"<div data-test="container" class="EProductSnippet2">
                <a class="Button_view_primary" href="https://market.test/my/cart?id=1">
                    <span class="Button-Text">В корзину</span></a>
            </div>"#,
            Platform::Desktop,
        );
        assert_eq!(row.get(fields::BUTTON_VIEW), Some("primaryShort"));
        assert_eq!(row.get(fields::MARKET_CHECKOUT_LABEL), Some("true"));

        let row = extract(
            r#"<div data-test="container" class="ProductTile-Item"><a class="Button_view_default">Купить</a></div>"#,
            Platform::Desktop,
        );
        assert_eq!(row.get(fields::BUTTON), Some("true"));
    }
}
