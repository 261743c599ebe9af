//! Prompt attachment decoding.
//!
//! Clients send images as data URLs. Each entry is decoded on its own; a
//! malformed entry is logged and skipped without failing the prompt.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

use sidecar_core::protocol::{EncodedAttachment, ImagePayload};

const DEFAULT_MIME_TYPE: &str = "image/png";

/// A decoded binary attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: Option<String>,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    /// Re-encode for the backend's stdin protocol.
    pub fn encode(&self) -> EncodedAttachment {
        EncodedAttachment {
            mime_type: self.mime_type.clone(),
            data: STANDARD.encode(&self.data),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("Not a data URL")]
    NotDataUrl,

    #[error("Data URL has no payload")]
    MissingPayload,

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Decode every well-formed attachment, skipping the rest.
pub fn decode_attachments(images: &[ImagePayload]) -> Vec<Attachment> {
    images
        .iter()
        .filter_map(|image| match decode_one(image) {
            Ok(attachment) => {
                debug!(
                    name = image.name.as_deref().unwrap_or("unknown"),
                    bytes = attachment.data.len(),
                    "Decoded image attachment"
                );
                Some(attachment)
            }
            Err(e) => {
                warn!(
                    name = image.name.as_deref().unwrap_or("unknown"),
                    error = %e,
                    "Skipping malformed attachment"
                );
                None
            }
        })
        .collect()
}

fn decode_one(image: &ImagePayload) -> Result<Attachment, AttachmentError> {
    let rest = image
        .data_url
        .strip_prefix("data:")
        .ok_or(AttachmentError::NotDataUrl)?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or(AttachmentError::MissingPayload)?;
    let data = STANDARD.decode(payload.trim())?;

    let header_mime = header
        .split(';')
        .next()
        .filter(|m| !m.is_empty())
        .map(String::from);
    let mime_type = image
        .mime_type
        .clone()
        .filter(|m| !m.is_empty())
        .or(header_mime)
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());

    Ok(Attachment {
        name: image.name.clone(),
        mime_type,
        data,
    })
}
