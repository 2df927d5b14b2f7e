//! Transport layer (WebSocket).
//!
//! `/v1/ext_proc` carries one HTTP exchange per stream; `/v1/discovery`
//! carries one configuration subscription per stream. Both speak JSON text
//! frames decoded once by `codec`.

pub mod codec;
pub mod discovery;
pub mod ext_proc;
