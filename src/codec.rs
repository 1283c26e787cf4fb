//! Message serialization.
//!
//! Messages travel as JSON objects. Anything else on the wire is a decode
//! error attributed to the channel it came from.

use serde_json::{Map, Value};

use crate::error::{LayerError, Result};

/// An application message: an opaque mapping of fields.
pub type Message = Map<String, Value>;

pub fn encode(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode(channel: &str, body: &[u8]) -> Result<Message> {
    serde_json::from_slice::<Message>(body).map_err(|e| LayerError::Decode {
        channel: channel.to_string(),
        message: e.to_string(),
    })
}
