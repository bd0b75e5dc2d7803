// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Frame and inner-message types.
//!
//! Every wire object carries a `type` discriminator. [`Frame`] is what
//! travels on the control socket; [`Message`] is what an `enc` frame
//! decrypts to.

use serde::{Deserialize, Serialize};

/// The only upgrade path the relay accepts.
pub const RELAY_PATH: &str = "/__ra__";

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
}

/// Control-socket frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Relay hello: its X25519 public key and the attestation evidence
    /// binding that key to the enclave.
    ServerKx {
        #[serde(with = "serde_bytes")]
        x25519_public_key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        quote: Vec<u8>,
    },
    /// Client reply: the session key sealed to the relay's X25519 key.
    ClientKx {
        #[serde(with = "serde_bytes")]
        sealed_symmetric_key: Vec<u8>,
    },
    /// An encrypted inner message.
    Enc {
        #[serde(with = "serde_bytes")]
        nonce: Vec<u8>,
        #[serde(with = "serde_bytes")]
        ciphertext: Vec<u8>,
    },
}

/// A tunneled HTTP request.
///
/// The body is a string; binary bodies are base64-encoded at this layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub request_id: u64,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// A tunneled HTTP response. `error` is set when the host application
/// failed; the relay never forwards internal detail beyond the status text
/// and this message string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub request_id: u64,
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of a virtual WebSocket message, preserving the text/binary
/// distinction of the original frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dataType", content = "data", rename_all = "lowercase")]
pub enum WsData {
    String(String),
    #[serde(rename = "arraybuffer")]
    ArrayBuffer(#[serde(with = "serde_bytes")] Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsEventType {
    Open,
    Close,
    Error,
}

/// Inner messages, exchanged only inside `enc` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    HttpRequest(HttpRequest),
    HttpResponse(HttpResponse),
    #[serde(rename_all = "camelCase")]
    WsClientConnect {
        connection_id: u64,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocols: Option<Vec<String>>,
    },
    #[serde(rename_all = "camelCase")]
    WsClientClose {
        connection_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WsMessage {
        connection_id: u64,
        #[serde(flatten)]
        data: WsData,
    },
    #[serde(rename_all = "camelCase")]
    WsEvent {
        connection_id: u64,
        event_type: WsEventType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// CBOR-encode a frame for the wire.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(frame, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a CBOR frame from the wire.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    ciborium::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

pub(crate) fn encode_message(message: &Message) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn decode_message(bytes: &[u8]) -> Result<Message, WireError> {
    ciborium::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}
