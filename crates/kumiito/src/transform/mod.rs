//! Transformers that reshape response payloads.
//!
//! The [`Transformer`](kumiito_core::Transformer) contract lives in
//! `kumiito-core`; this module provides the combinators ([`SequentialChain`],
//! [`ParallelChain`], [`ConditionalChain`]) and the shaping transformers used
//! to trim payloads for mobile clients ([`FieldSelector`], [`Flatten`],
//! [`Unflatten`]).

mod chain;
mod flatten;
mod func;
mod select;

pub use chain::{
    merge_overwrite, ConditionalChain, MergeFn, ParallelChain, Predicate, SequentialChain,
};
pub use flatten::{Flatten, Unflatten, DEFAULT_MAX_DEPTH, DEFAULT_SEPARATOR};
pub use func::FnTransformer;
pub use select::{is_metadata_key, FieldSelector, METADATA_PREFIXES};
