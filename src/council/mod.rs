//! Council infrastructure shared by every stage: provider fan-out,
//! tolerant JSON extraction, output validation, anonymization, and
//! prompt construction.

pub mod anonymizer;
pub mod fanout;
pub mod parsing;
pub mod prompts;
pub mod validate;

pub use anonymizer::{anonymize, LabelEntry, LabelMap};
pub use fanout::{fan_out, ParseFn, ProviderCall, ProviderOutcome, ProviderResult};
