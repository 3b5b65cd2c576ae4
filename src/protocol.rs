//! Observer request/response lines.
//!
//! Observers mostly listen: every tick they receive one line holding the
//! serialized [`SatelliteState`](crate::state::SatelliteState). They may also
//! send a request line, which is answered on the same stream.

use crate::kernel::KernelStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_REQUEST_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObserverRequest {
    Ping,
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObserverResponse {
    Pong,
    Status(KernelStatus),
    Error { message: String },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("request exceeds 512 bytes")]
    MessageTooLarge,
    #[error("invalid request: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("failed to encode response: {0}")]
    Serialization(#[source] serde_json::Error),
}

pub fn parse_request(line: &str) -> Result<ObserverRequest, ProtocolError> {
    if line.len() > MAX_REQUEST_SIZE {
        return Err(ProtocolError::MessageTooLarge);
    }
    serde_json::from_str(line.trim()).map_err(ProtocolError::InvalidJson)
}

pub fn encode_response(response: &ObserverResponse) -> Result<String, ProtocolError> {
    serde_json::to_string(response).map_err(ProtocolError::Serialization)
}

/// Distinguish a response line from a state line on the observer side.
pub fn parse_response(line: &str) -> Option<ObserverResponse> {
    serde_json::from_str(line.trim()).ok()
}
