//! Envelope and command codec
//!
//! Every transport carries UTF-8 JSON:
//!
//! ```text
//! Envelope : {"notes": [...], "projects": [...]}   (either key optional)
//! Command  : {"request_state": true}
//!            {"new_note": {"title": "...", "content": "...", ...}}
//! ```
//!
//! Unknown keys are ignored and missing optional keys decode to `None`, so
//! older and newer builds can talk to each other.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Command, Envelope, Note};

/// Failure to decode an inbound message. Callers log it and drop the message.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Payload was empty
    #[error("empty payload")]
    Empty,

    /// Payload was not valid JSON of the expected shape
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON object carried neither `request_state: true` nor `new_note`
    #[error("unrecognized command")]
    UnknownCommand,
}

/// Flat wire shape of a [`Command`]; the variant is chosen by key presence.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CommandWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_state: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    new_note: Option<Note>,
}

/// Encode an envelope to JSON bytes
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    // Envelope holds only strings, integers and options; serialization cannot fail.
    serde_json::to_vec(envelope).unwrap_or_default()
}

/// Decode an envelope from JSON bytes
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Encode a command to JSON bytes
pub fn encode_command(command: &Command) -> Vec<u8> {
    let wire = match command {
        Command::RequestState => CommandWire {
            request_state: Some(true),
            new_note: None,
        },
        Command::NewNote(note) => CommandWire {
            request_state: None,
            new_note: Some(note.clone()),
        },
    };
    serde_json::to_vec(&wire).unwrap_or_default()
}

/// Decode a command from JSON bytes.
///
/// `request_state: true` wins when both keys are present.
pub fn decode_command(bytes: &[u8]) -> Result<Command, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let wire: CommandWire = serde_json::from_slice(bytes)?;
    if wire.request_state == Some(true) {
        return Ok(Command::RequestState);
    }
    wire.new_note
        .map(Command::NewNote)
        .ok_or(DecodeError::UnknownCommand)
}
