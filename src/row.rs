//! Extracted snippet rows

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Row field names shared by extraction, assignment and renderers
pub mod fields {
    pub const SNIPPET_TYPE: &str = "#SnippetType";
    pub const PRODUCT_URL: &str = "#ProductURL";
    pub const TITLE: &str = "#OrganicTitle";
    pub const SHOP_NAME: &str = "#ShopName";
    pub const HOST: &str = "#OrganicHost";
    pub const PATH: &str = "#OrganicPath";
    pub const TEXT: &str = "#OrganicText";
    pub const IMAGE: &str = "#OrganicImage";
    pub const THUMB_IMAGE: &str = "#ThumbImage";
    pub const FAVICON: &str = "#FaviconImage";
    pub const PRICE: &str = "#OrganicPrice";
    pub const OLD_PRICE: &str = "#OldPrice";
    pub const CURRENCY: &str = "#Currency";
    pub const DISCOUNT_PERCENT: &str = "#DiscountPercent";
    pub const DISCOUNT: &str = "#discount";
    pub const PRICE_GROUP_DISCOUNT: &str = "#EPriceGroup_Discount";
    pub const PRICE_GROUP_OLD_PRICE: &str = "#EPriceGroup_OldPrice";
    pub const PRICE_BAROMETER: &str = "#EPriceBarometer";
    pub const SHOP_RATING: &str = "#ShopRating";
    pub const PRODUCT_RATING: &str = "#ProductRating";
    pub const REVIEWS: &str = "#ReviewsNumber";
    pub const QUERY: &str = "#query";
    pub const PLATFORM: &str = "#platform";
    pub const SERP_ITEM_ID: &str = "#serpItemId";
    pub const IS_ADV: &str = "#isAdv";
    pub const IS_PROMO: &str = "#isPromo";
    pub const BUTTON: &str = "#BUTTON";
    pub const BUTTON_VIEW: &str = "#ButtonView";
    pub const BUTTON_TYPE: &str = "#ButtonType";
    pub const BUTTON_VISIBLE: &str = "#EButton_visible";

    pub const BAROMETER_VIEW: &str = "#EPriceBarometer_View";
    pub const LABEL_GROUP_BAROMETER: &str = "#ELabelGroup_Barometer";
    pub const PRICE_GROUP_BAROMETER: &str = "#EPriceGroup_Barometer";
    pub const PRICE_GROUP_SIZE: &str = "#EPriceGroup_Size";
    pub const PRICE_DISCLAIMER: &str = "#PriceDisclaimer";
    pub const PLUS_CASHBACK: &str = "#PlusCashback";

    pub const DELIVERY_LIST: &str = "#DeliveryList";
    pub const DELIVERY_GROUP: &str = "#EDeliveryGroup";
    pub const DELIVERY_GROUP_COUNT: &str = "#EDeliveryGroup-Count";
    pub const DELIVERY_ABROAD: &str = "#EDelivery_abroad";

    pub const IS_VERIFIED: &str = "#isVerified";
    pub const VERIFIED_TYPE: &str = "#VerifiedType";
    pub const OFFICIAL_SHOP: &str = "#OfficialShop";
    pub const MARKET_CHECKOUT_LABEL: &str = "#EMarketCheckoutLabel";

    pub const FINTECH: &str = "#EPriceGroup_Fintech";
    pub const FINTECH_TYPE: &str = "#Fintech_Type";
    pub const FINTECH_VIEW: &str = "#Fintech_View";
    pub const INFO_ICON: &str = "#InfoIcon";
    pub const BNPL: &str = "#EBnpl";
    pub const BNPL_COUNT: &str = "#EBnpl-Count";

    pub const IMAGE_TYPE: &str = "#imageType";
    pub const THUMB_GROUP_COUNT: &str = "#ThumbGroupCount";
    pub const IS_CATALOG_PAGE: &str = "#isCatalogPage";

    pub const SITELINKS: &str = "#Sitelinks";
    pub const SITELINKS_COUNT: &str = "#SitelinksCount";
    pub const QUOTE_TEXT: &str = "#EQuote-Text";
    pub const LEGACY_QUOTE_TEXT: &str = "#QuoteText";
    pub const WITH_QUOTES: &str = "#withQuotes";

    /// `#EDeliveryGroup-Item-N`, 1-based
    pub fn delivery_item(n: usize) -> String {
        format!("#EDeliveryGroup-Item-{}", n)
    }

    pub fn bnpl_item(n: usize) -> String {
        format!("#EBnpl-Item-{}", n)
    }

    pub fn thumb_group_image(n: usize) -> String {
        format!("#Image{}", n)
    }

    pub fn sitelink(n: usize) -> String {
        format!("#Sitelink_{}", n)
    }
}

/// Snippet kinds recognised on the page and in destination containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SnippetType {
    EOfferItem,
    EShopItem,
    EProductSnippet2,
    EProductSnippet2Adv,
    EProductSnippet,
    ProductTileItem,
    OrganicWithOfferInfo,
    ESnippet,
    Snippet,
    Organic,
    AdvProductGallery,
}

/// Container names in normalization order: exact match first, then prefix
const CONTAINER_NAMES: &[SnippetType] = &[
    SnippetType::EShopItem,
    SnippetType::EProductSnippet2,
    SnippetType::ESnippet,
    SnippetType::EProductSnippet,
    SnippetType::EOfferItem,
    SnippetType::Snippet,
    SnippetType::OrganicWithOfferInfo,
    SnippetType::ProductTileItem,
];

impl SnippetType {
    pub const ALL: &'static [SnippetType] = &[
        SnippetType::EOfferItem,
        SnippetType::EShopItem,
        SnippetType::EProductSnippet2,
        SnippetType::EProductSnippet2Adv,
        SnippetType::EProductSnippet,
        SnippetType::ProductTileItem,
        SnippetType::OrganicWithOfferInfo,
        SnippetType::ESnippet,
        SnippetType::Snippet,
        SnippetType::Organic,
        SnippetType::AdvProductGallery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SnippetType::EOfferItem => "EOfferItem",
            SnippetType::EShopItem => "EShopItem",
            SnippetType::EProductSnippet2 => "EProductSnippet2",
            SnippetType::EProductSnippet2Adv => "EProductSnippet2_Adv",
            SnippetType::EProductSnippet => "EProductSnippet",
            SnippetType::ProductTileItem => "ProductTile-Item",
            SnippetType::OrganicWithOfferInfo => "Organic_withOfferInfo",
            SnippetType::ESnippet => "ESnippet",
            SnippetType::Snippet => "Snippet",
            SnippetType::Organic => "Organic",
            SnippetType::AdvProductGallery => "AdvProductGallery",
        }
    }

    /// Exact (case-sensitive) row type name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }

    /// Map a destination container name onto a known type: exact
    /// case-insensitive match first, then the first type the name starts with
    pub fn from_container_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_lowercase();
        if lower.is_empty() {
            return None;
        }
        CONTAINER_NAMES
            .iter()
            .copied()
            .find(|t| t.as_str().to_lowercase() == lower)
            .or_else(|| {
                CONTAINER_NAMES
                    .iter()
                    .copied()
                    .find(|t| lower.starts_with(&t.as_str().to_lowercase()))
            })
    }

    /// Offers of one product in several shops
    pub fn is_multi_shop(&self) -> bool {
        matches!(self, SnippetType::EShopItem | SnippetType::EOfferItem)
    }
}

impl fmt::Display for SnippetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One extracted snippet: a sparse field map plus advisory warnings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    #[serde(flatten)]
    fields: BTreeMap<String, String>,
    #[serde(rename = "_warnings", default, skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
}

impl Row {
    pub fn new(snippet_type: &str) -> Self {
        let mut row = Self::default();
        row.set(fields::SNIPPET_TYPE, snippet_type);
        row
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Non-empty value after trimming
    pub fn value(&self, field: &str) -> Option<&str> {
        self.get(field).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn has(&self, field: &str) -> bool {
        self.value(field).is_some()
    }

    /// Set a field; empty values leave the key absent
    pub fn set(&mut self, field: &str, value: impl Into<String>) {
        let value = value.into();
        if value.trim().is_empty() {
            self.fields.remove(field);
        } else {
            self.fields.insert(field.to_string(), value);
        }
    }

    /// Set only when the field is still empty
    pub fn set_if_absent(&mut self, field: &str, value: impl Into<String>) {
        if !self.has(field) {
            self.set(field, value);
        }
    }

    pub fn remove(&mut self, field: &str) -> Option<String> {
        self.fields.remove(field)
    }

    pub fn snippet_type_name(&self) -> &str {
        self.get(fields::SNIPPET_TYPE).unwrap_or("")
    }

    pub fn snippet_type(&self) -> Option<SnippetType> {
        SnippetType::from_name(self.snippet_type_name())
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::default();
        for (k, v) in iter {
            let k = k.into();
            row.set(&k, v);
        }
        row
    }
}
