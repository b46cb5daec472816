//! Per-snippet extraction stages
//!
//! `fields` evaluates the generic rules, `price` and `sprite` resolve the
//! fields that need structure or cross-row state, and `features` adds the
//! badge, delivery and button flags (`offer` for shop lines of a product
//! card). `json` reads rows from the embedded search state when the page
//! has no rendered snippets.

pub mod features;
pub mod fields;
pub mod json;
pub mod offer;
pub mod price;
pub mod sprite;
pub mod text;
