//! Pipeline configuration
//!
//! Every heuristic knob lives here so hosts can tune it without a rebuild.
//! Unknown keys are ignored and missing keys take their defaults.

use serde::{Deserialize, Serialize};

/// Tuning for one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// An implicit old price must exceed the current one by this factor
    pub old_price_min_gap: f64,
    /// Call the observer's yield hook after this many archive parts (0 = never)
    pub yield_every_parts: usize,
    /// `size` query parameter for expanded favicon list URLs
    pub favicon_size: u32,
    /// Sprite cell strides tried when background-size is unknown
    pub sprite_strides: Vec<u32>,
    /// Minimum digits for a price-like value
    pub min_price_digits: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            old_price_min_gap: 1.05,
            yield_every_parts: 10,
            favicon_size: 32,
            sprite_strides: vec![20, 16, 24, 32],
            min_price_digits: 3,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Settings for the rules lifecycle manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesManagerConfig {
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for RulesManagerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 10,
            user_agent: concat!("snippet_parser/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl RulesManagerConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = PipelineConfig::from_json(r#"{"old_price_min_gap": 1.2}"#).unwrap();
        assert_eq!(config.old_price_min_gap, 1.2);
        assert_eq!(config.yield_every_parts, 10);
        assert_eq!(config.sprite_strides, vec![20, 16, 24, 32]);
    }

    #[test]
    fn test_empty_config() {
        let config = PipelineConfig::from_json("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());

        let rules = RulesManagerConfig::from_json(r#"{"fetch_timeout_secs": 3}"#).unwrap();
        assert_eq!(rules.fetch_timeout_secs, 3);
        assert!(rules.user_agent.starts_with("snippet_parser/"));
    }
}
