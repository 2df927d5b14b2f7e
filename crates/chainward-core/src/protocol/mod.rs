//! Wire formats (JSON) of the two protocols the kernel speaks.
//!
//! - `extproc`: one bidirectional stream per HTTP exchange between the proxy
//!   and the engine (headers/body messages in, mutations or an immediate
//!   response out).
//! - `discovery`: the long-lived, versioned configuration-distribution stream
//!   (full snapshots of route chains, ACK/NACK by version and nonce).
//!
//! Decoding never panics: malformed frames surface as `EngineError::BadRequest`.

pub mod discovery;
pub mod extproc;

/// Base64 (standard alphabet) encoding for body bytes inside JSON.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(b: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(b))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
