//! Binary frame codec.
//!
//! Pure encode/decode for the agent's wire protocol — no I/O, no runtime
//! dependencies. The frame is a presence-based tagged union: see
//! [`frame`] for the layout and the slot-order contract.

pub mod frame;
pub mod wire;

pub use frame::{Action, Content, Frame, Response, WIRE_VERSION};

use thiserror::Error;

/// Codec-level errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The frame carries no recognized content variant, or an empty frame
    /// was handed to the encoder.
    #[error("unknown message")]
    UnknownMessage,

    /// The frame carries no recognized action variant.
    #[error("unknown action")]
    UnknownAction,

    /// The frame carries no recognized response variant.
    #[error("unknown response")]
    UnknownResponse,

    /// The byte sequence is not a well-formed frame.
    #[error("malformed frame: {0}")]
    Malformed(#[from] MalformedFrame),
}

/// Reasons a byte sequence fails to parse as a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedFrame {
    #[error("truncated input")]
    Truncated,
    #[error("unsupported wire version {0}")]
    BadVersion(u8),
    #[error("field length {0} exceeds limit")]
    Oversize(u32),
    #[error("invalid presence byte {0}")]
    BadPresenceByte(u8),
    #[error("invalid utf-8 in text field")]
    InvalidUtf8,
    #[error("trailing bytes after frame")]
    TrailingBytes,
}

/// Encode a content message as a full frame.
pub fn encode_content(content: &Content) -> Result<Vec<u8>, CodecError> {
    Frame::content(content.clone()).encode()
}

/// Encode an action as a full frame.
pub fn encode_action(action: &Action) -> Result<Vec<u8>, CodecError> {
    Frame::action(action.clone()).encode()
}

/// Encode a response as a full frame.
pub fn encode_response(response: &Response) -> Result<Vec<u8>, CodecError> {
    Frame::response(response.clone()).encode()
}

/// Decode a frame and extract its content variant.
pub fn decode_content(bytes: &[u8]) -> Result<Content, CodecError> {
    Frame::decode(bytes)?
        .content
        .ok_or(CodecError::UnknownMessage)
}

/// Decode a frame and extract its action variant.
pub fn decode_action(bytes: &[u8]) -> Result<Action, CodecError> {
    Frame::decode(bytes)?.action.ok_or(CodecError::UnknownAction)
}

/// Decode a frame and extract its response variant.
pub fn decode_response(bytes: &[u8]) -> Result<Response, CodecError> {
    Frame::decode(bytes)?
        .response
        .ok_or(CodecError::UnknownResponse)
}
