//! Decode-once codec for WebSocket frames.
//!
//! - Text frames => one JSON message of the stream's type
//! - Binary frames are not part of either protocol
//! - Ping/Pong/Close are surfaced for lifecycle management

use axum::extract::ws::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;

use chainward_core::error::{EngineError, Result};

#[derive(Debug)]
pub enum Inbound<T> {
    Frame(T),
    Ping(Vec<u8>),
    Pong,
    Close,
}

pub fn decode<T: DeserializeOwned>(msg: Message) -> Result<Inbound<T>> {
    match msg {
        Message::Text(s) => serde_json::from_str(&s)
            .map(Inbound::Frame)
            .map_err(|e| EngineError::BadRequest(format!("invalid frame json: {e}"))),
        Message::Binary(b) => Err(EngineError::BadRequest(format!(
            "binary frames are not supported ({} bytes)",
            b.len()
        ))),
        Message::Ping(v) => Ok(Inbound::Ping(v)),
        Message::Pong(_) => Ok(Inbound::Pong),
        Message::Close(_) => Ok(Inbound::Close),
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Message> {
    serde_json::to_string(value)
        .map(Message::Text)
        .map_err(|e| EngineError::Internal(format!("encode failed: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use chainward_core::protocol::extproc::{ProcessingMessage, ProcessingRequest};

    #[test]
    fn text_frames_decode_to_messages() {
        let msg = Message::Text(r#"{"request_headers": {"headers": []}}"#.into());
        let Inbound::Frame(req) = decode::<ProcessingRequest>(msg).unwrap() else {
            panic!("expected frame");
        };
        assert!(matches!(req.message, ProcessingMessage::RequestHeaders(_)));
    }

    #[test]
    fn binary_and_garbage_are_rejected() {
        assert!(decode::<ProcessingRequest>(Message::Binary(vec![1, 2])).is_err());
        let err = decode::<ProcessingRequest>(Message::Text("{".into())).unwrap_err();
        assert_eq!(err.code().as_str(), "BAD_REQUEST");
    }
}
