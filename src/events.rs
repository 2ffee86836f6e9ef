//! Event payloads broadcast by an exchange session.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::codec::Codec;
use crate::error::{CodecError, ExchangeError};
use crate::frame::HEADER_LEN;
use crate::state::SessionState;

/// Notification that a session's state changed.
///
/// Fired synchronously on whichever task mutated the state; subscribers
/// must not assume a fixed task identity.
#[derive(Debug, Clone)]
pub struct StateChange {
    /// The new state.
    pub state: SessionState,
    /// The error that drove the transition, when there was one.
    pub error: Option<Arc<ExchangeError>>,
}

impl StateChange {
    pub(crate) fn new(state: SessionState) -> Self {
        Self { state, error: None }
    }

    pub(crate) fn with_error(state: SessionState, error: Arc<ExchangeError>) -> Self {
        Self {
            state,
            error: Some(error),
        }
    }

    /// True when this change carries an error condition.
    pub fn is_error_state(&self) -> bool {
        self.error.is_some() || self.state.is_error()
    }
}

/// One frame received from the peer.
///
/// The raw bytes are always present; `value` is populated only when the
/// frame's exchange code matched the session's and the payload decoded.
#[derive(Debug, Clone)]
pub struct Received {
    /// The decoded object, self-describing form.
    pub value: Option<serde_json::Value>,
    /// Type identifier the sender stamped on the frame.
    pub type_name: String,
    /// The complete frame as read from the wire.
    pub raw: Bytes,
    /// When the frame was read.
    pub timestamp: SystemTime,
}

impl Received {
    /// True if the payload was accepted and decoded.
    pub fn is_deserialized(&self) -> bool {
        self.value.is_some()
    }

    /// The serialized payload portion of the frame.
    pub fn payload(&self) -> Bytes {
        self.raw.slice(HEADER_LEN + self.type_name.len()..)
    }

    /// The payload as UTF-8 text.
    pub fn payload_text(&self) -> Result<&str, CodecError> {
        let start = HEADER_LEN + self.type_name.len();
        Ok(std::str::from_utf8(&self.raw[start..])?)
    }

    /// Re-decode the payload into a concrete type.
    pub fn decode_with<C: Codec, T: DeserializeOwned>(&self, codec: &C) -> Result<T, CodecError> {
        codec.decode(self.payload_text()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::frame::{Frame, DEFAULT_MAX_FRAME_LEN};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    fn received_from(frame: &Frame) -> Received {
        let raw = frame.encode(DEFAULT_MAX_FRAME_LEN).unwrap().freeze();
        Received {
            value: None,
            type_name: frame.type_name.clone(),
            raw,
            timestamp: SystemTime::now(),
        }
    }

    #[test]
    fn test_payload_accessors() {
        let codec = JsonCodec;
        let note = Note {
            text: "hi".to_string(),
        };
        let frame = Frame::for_object(&note, 5, &codec).unwrap();
        let received = received_from(&frame);

        assert_eq!(received.payload(), frame.payload);
        assert!(received.payload_text().unwrap().contains("\"hi\""));

        let back: Note = received.decode_with(&codec).unwrap();
        assert_eq!(back, note);
        assert!(!received.is_deserialized());
    }

    #[test]
    fn test_state_change_error_flag() {
        let plain = StateChange::new(SessionState::CONNECTED);
        assert!(!plain.is_error_state());

        let timed_out = StateChange::new(SessionState::TIMEOUT);
        assert!(timed_out.is_error_state());

        let failed = StateChange::with_error(
            SessionState::ERROR,
            Arc::new(ExchangeError::PeerClosed),
        );
        assert!(failed.is_error_state());
    }
}
