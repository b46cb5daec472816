//! Search results snippet parser
//!
//! Turns a saved search results page (plain HTML or MHTML) into rows of
//! product snippet fields and assigns them to a host's typed containers:
//! - Archive decoding (quoted-printable and base64 MHTML parts)
//! - Rule-driven field extraction over a per-snippet class index
//! - Price pairing, discounts and favicon sprite resolution
//! - Badge, delivery, payment and button flags per snippet type
//! - Deduplication and row to container assignment
//! - Remote rule updates with an atomically swapped snapshot
//!
//! Hosts written in other languages use the JSON based FFI in [`ffi`].

pub mod archive;
pub mod assign;
pub mod config;
pub mod dedup;
pub mod error;
pub mod extractors;
pub mod ffi;
pub mod index;
pub mod pipeline;
pub mod row;
pub mod rules;
pub mod rules_manager;
pub mod stylesheet;
pub mod validate;

pub use assign::{assign, Assignment, Container, Slot};
pub use config::{PipelineConfig, RulesManagerConfig};
pub use error::{ParseError, RulesError, StorageError};
pub use pipeline::{NoopObserver, ParseOutput, Pipeline, PipelineObserver, PipelineOutput, ProgressFn};
pub use row::{Row, SnippetType};
pub use rules::{CompiledRules, FieldRule, RuleSet, RuleSetPatch, ValueType};
pub use rules_manager::{RuleSetMetadata, RulesManager, UpdateCheck};
