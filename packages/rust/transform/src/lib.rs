//! In-memory catalog transforms.
//!
//! This crate provides:
//! - [`dedup`]: history-aware dedup, vendor filters, and the history fold
//! - [`taxonomy`]: ordered first-match category mapping
//! - [`options`]: variant option rules
//! - [`normalize`]: canonical product records

pub mod dedup;
pub mod normalize;
pub mod options;
pub mod taxonomy;

pub use dedup::{
    DedupEngine, DedupOutcome, DedupPolicy, Disposition, SkipEntry, SkipReason, Verdict,
    fold_history,
};
pub use normalize::{NormalizeError, Normalizer, parse_price, round_to};
pub use options::{OptionRule, OptionRules};
pub use taxonomy::Taxonomy;
