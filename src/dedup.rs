//! Collapse rows describing the same result

use std::collections::HashMap;

use tracing::debug;

use crate::extractors::text::collapse_whitespace;
use crate::row::{fields, Row};

/// Identity of a row. Multi-shop offers are keyed by URL and shop so the
/// same product sold by two shops stays two rows.
pub fn dedup_key(row: &Row) -> Option<String> {
    let url = row.get(fields::PRODUCT_URL).unwrap_or("").trim();
    let shop = row.get(fields::SHOP_NAME).unwrap_or("").trim().to_lowercase();

    if row.snippet_type().is_some_and(|t| t.is_multi_shop()) && !url.is_empty() {
        return Some(format!("{}|{}", url, shop));
    }
    if !url.is_empty() {
        return Some(url.to_string());
    }

    let title = collapse_whitespace(row.get(fields::TITLE).unwrap_or("")).to_lowercase();
    if title.is_empty() && shop.is_empty() {
        None
    } else {
        Some(format!("{}|{}", title, shop))
    }
}

fn has_image(row: &Row) -> bool {
    row.has(fields::IMAGE)
}

/// Drop duplicates in place of the first occurrence. A later duplicate
/// replaces the kept row only when it brings an image the kept row lacks.
pub fn dedupe(rows: Vec<Row>) -> Vec<Row> {
    let before = rows.len();
    let mut kept: Vec<Row> = Vec::with_capacity(rows.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for row in rows {
        let key = match dedup_key(&row) {
            Some(key) => key,
            None => {
                kept.push(row);
                continue;
            }
        };
        match positions.get(&key) {
            Some(&pos) => {
                if has_image(&row) && !has_image(&kept[pos]) {
                    debug!(key = %key, "duplicate with image replaces kept row");
                    kept[pos] = row;
                }
            }
            None => {
                positions.insert(key, kept.len());
                kept.push(row);
            }
        }
    }

    debug!(before, after = kept.len(), "rows deduplicated");
    kept
}
