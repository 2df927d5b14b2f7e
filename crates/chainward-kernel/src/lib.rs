//! Chainward engine library entry.
//!
//! Wires the policy registry, chain builder, worker core, kernel, embedded
//! distribution server and transports into one external-processing engine.
//! Consumed by the binary (`main.rs`) and by integration tests.

pub mod app_state;
pub mod chain;
pub mod config;
pub mod kernel;
pub mod obs;
pub mod ops;
pub mod policies;
pub mod registry;
pub mod reload;
pub mod router;
pub mod transport;
pub mod worker;
pub mod xds;
