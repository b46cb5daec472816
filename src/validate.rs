//! Advisory checks of required fields per snippet type

use tracing::debug;

use crate::row::{fields, Row, SnippetType};

/// Fields every row of the given type is expected to carry
pub fn required_fields(snippet_type: Option<SnippetType>) -> &'static [&'static str] {
    use SnippetType::*;

    match snippet_type {
        Some(EShopItem | EOfferItem) => &[fields::SNIPPET_TYPE, fields::SHOP_NAME, fields::PRICE],
        Some(EProductSnippet2 | EProductSnippet | OrganicWithOfferInfo) => {
            &[fields::SNIPPET_TYPE, fields::TITLE, fields::PRICE]
        }
        Some(ProductTileItem | Organic) => &[fields::SNIPPET_TYPE, fields::TITLE],
        _ => &[fields::SNIPPET_TYPE],
    }
}

/// Record a warning for each missing required field. Returns the number of
/// warnings added.
pub fn validate_row(row: &mut Row) -> usize {
    let missing: Vec<&str> = required_fields(row.snippet_type())
        .iter()
        .copied()
        .filter(|field| !row.has(field))
        .collect();
    for field in &missing {
        row.add_warning(format!("missing {}", field));
    }
    if !missing.is_empty() {
        debug!(snippet_type = row.snippet_type_name(), missing = ?missing, "row incomplete");
    }
    missing.len()
}

pub fn validate_rows(rows: &mut [Row]) -> usize {
    rows.iter_mut().map(validate_row).sum()
}
