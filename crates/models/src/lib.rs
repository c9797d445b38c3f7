//! Token grammar and the per-domain model registry.
//!
//! A token is a dotted path whose first segment names a *domain*; the
//! remainder addresses a location inside that domain's data tree. Each domain
//! may register a JSON-Schema fragment with the [`ModelRegistry`], which then
//! gates every read and write: it computes schema defaults and validates
//! candidate values against the sub-schema a token resolves to.

mod registry;
mod token;
mod validate;

pub use registry::{global, ModelRegistry};
pub use token::{parse_key_path, split_token, Segment, Token, TokenError};
pub use validate::normalize_collections;
