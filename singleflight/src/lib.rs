//! Duplicate function call suppression.
//!
//! A [`Group`] makes sure that, for any given key, only one execution of a
//! piece of work is in flight at a time. Callers that arrive with the same key
//! while it runs wait for it and receive the same result, value or error.
//! Nothing is cached: once the execution finishes the key is forgotten and the
//! next call runs the work again.
//!
//! ```
//! use singleflight::Group;
//!
//! let group: Group<u64, String> = Group::new();
//! let answer = group.work("answer", || Ok(42));
//! assert_eq!(answer, Ok(42));
//! ```
//!
//! Results are cloned out to every caller. Wrap payloads in `Arc` when the
//! callers should share one allocation, or when the error type is not
//! `Clone`; [`SharedError`] covers the common `anyhow` case.

mod call;
mod group;

pub use group::Group;

/// An `anyhow::Error` that can be handed to every waiter of a call.
pub type SharedError = std::sync::Arc<anyhow::Error>;
