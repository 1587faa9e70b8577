//! JSON codec for control messages.

use crate::error::Result;
use crate::protocol::ControlMessage;
use bytes::Bytes;

/// Encode a control message as a JSON body.
pub fn encode(message: &ControlMessage) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Decode a JSON body.
///
/// Unknown actions decode successfully to [`ControlMessage::Unknown`];
/// malformed JSON, a missing `action`, or bad fields for a known action are
/// errors.
pub fn decode(body: &[u8]) -> Result<ControlMessage> {
    Ok(serde_json::from_slice(body)?)
}
