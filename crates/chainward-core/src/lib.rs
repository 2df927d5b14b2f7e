//! Chainward core: policy contracts, wire types, error surface, and the
//! condition evaluator.
//!
//! This crate defines everything a policy author or a protocol peer needs to
//! agree on: the request/response contexts policies run against, the closed
//! action vocabulary they return, typed parameter schemas, and the JSON
//! envelopes of the processing and distribution protocols. It carries no
//! runtime or transport dependencies so it can be reused by tooling.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! All fallible paths surface as `EngineError`/`Result`; a malformed
//! configuration push or hostile request must never bring the engine down.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod action;
pub mod context;
pub mod error;
pub mod expr;
pub mod headers;
pub mod params;
pub mod policy;
pub mod protocol;

/// Shared result type.
pub use error::{EngineError, ErrorCode, Result};
