//! Stored response envelope.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A captured `200 OK` response as kept in both tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPayload {
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    content_type: Option<String>,
    body: String,
}

impl CachedPayload {
    pub fn new(content_type: Option<String>, body: Bytes) -> Self {
        Self { content_type, body }
    }

    pub fn encode(&self) -> Bytes {
        let envelope = Envelope {
            content_type: self.content_type.clone(),
            body: STANDARD.encode(&self.body),
        };
        // Serializing a struct of strings cannot fail.
        Bytes::from(serde_json::to_vec(&envelope).unwrap_or_default())
    }

    /// `None` for bytes not written by [`CachedPayload::encode`].
    pub fn decode(raw: &[u8]) -> Option<Self> {
        let envelope: Envelope = serde_json::from_slice(raw).ok()?;
        let body = STANDARD.decode(envelope.body).ok()?;
        Some(Self {
            content_type: envelope.content_type,
            body: Bytes::from(body),
        })
    }
}
