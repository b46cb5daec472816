//! Offer rows of the multi-shop product card
//!
//! An `EOfferItem` is one shop's line inside a product card. It carries no
//! badges or delivery group of its own, so it gets a short field set of its
//! own instead of the generic features.

use scraper::ElementRef;

use crate::extractors::price::format_price_text;
use crate::extractors::text::{clean_text, parse_rating};
use crate::index::DocumentIndex;
use crate::row::{fields, Row};
use crate::rules::CompiledRules;

const RUBLE: &str = "₽";

fn text_of(index: &DocumentIndex<'_>, rules: &CompiledRules, name: &str) -> Option<String> {
    index
        .first_match(rules.selectors(name))
        .map(|el| clean_text(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

pub fn apply_offer(index: &DocumentIndex<'_>, rules: &CompiledRules, row: &mut Row) {
    let shop = text_of(index, rules, "EOfferItem_ShopName");
    if let Some(shop) = &shop {
        row.set(fields::SHOP_NAME, shop.as_str());
        row.set(fields::HOST, shop.as_str());
    }
    match text_of(index, rules, "EOfferItem_Title").or(shop) {
        Some(title) => row.set(fields::TITLE, title),
        None => row.add_warning("offer without title or shop name"),
    }

    if let Some(price) = text_of(index, rules, "EOfferItem_Price").and_then(|t| format_price_text(&t)) {
        row.set(fields::PRICE, price);
        row.set(fields::CURRENCY, RUBLE);
    }

    if let Some(reviews) = text_of(index, rules, "EOfferItem_Reviews") {
        if let Some(rating) = parse_rating(&reviews) {
            row.set(fields::SHOP_RATING, rating);
        }
        row.set(fields::REVIEWS, reviews);
    }

    if let Some(delivery) = text_of(index, rules, "EOfferItem_Delivery") {
        row.set(fields::DELIVERY_LIST, delivery);
    }

    let button = index.first_match(rules.selectors("EOfferItem_Button"));
    let (view, kind) = if button.map(is_checkout).unwrap_or(false) {
        ("primaryShort", "checkout")
    } else {
        ("white", "shop")
    };
    row.set(fields::BUTTON, "true");
    row.set(fields::BUTTON_VIEW, view);
    row.set(fields::BUTTON_TYPE, kind);
}

fn is_checkout(button: ElementRef<'_>) -> bool {
    let value = button.value();
    let primary = value
        .attr("class")
        .map(|c| c.contains("Button_view_primary"))
        .unwrap_or(false);
    let href = value.attr("href").unwrap_or("");
    primary || href.contains("/cart") || href.contains("/express")
}
