use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use thiserror::Error;

/// Generous limit at capture time, so an image can be previewed before any
/// re-encoding happens.
pub const CAPTURE_LIMIT_BYTES: usize = 10 * 1024 * 1024;

/// Tighter limit when the image travels inline as base64 text: it bounds
/// the encoded payload the server must accept in one message body.
pub const INLINE_LIMIT_BYTES: usize = 5 * 1024 * 1024;

const ALLOWED_IMAGE_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Raw image handed over by the caller, exactly as picked.
#[derive(Debug, Clone)]
pub struct AttachmentFile {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Which transport leg the encoding targets. Multipart keeps the binary as
/// its own part (REST send); inline re-encodes to base64 for message-body
/// delivery over the live transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingMode {
    Multipart,
    Inline,
}

impl EncodingMode {
    fn size_limit(self) -> usize {
        match self {
            EncodingMode::Multipart => CAPTURE_LIMIT_BYTES,
            EncodingMode::Inline => INLINE_LIMIT_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachmentError {
    #[error("attachment is empty")]
    Empty,
    #[error("attachment is {actual} bytes, over the {limit}-byte limit")]
    TooLarge { actual: usize, limit: usize },
    #[error("attachment type {content_type:?} is not an image")]
    NotAnImage { content_type: String },
    #[error("image format {content_type:?} is not supported (JPEG, PNG, GIF or WEBP)")]
    UnsupportedFormat { content_type: String },
}

/// Attachment plus optional text, ready to become a multipart form: the
/// image as a binary `image` part, the text as a `text` part.
#[derive(Debug, Clone)]
pub struct MultipartPayload {
    pub text: Option<String>,
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl MultipartPayload {
    pub fn into_form(self) -> Result<reqwest::multipart::Form, AttachmentError> {
        let content_type = self.content_type.clone();
        let part = reqwest::multipart::Part::bytes(self.bytes)
            .file_name(self.filename)
            .mime_str(&self.content_type)
            .map_err(|_| AttachmentError::UnsupportedFormat { content_type })?;
        let mut form = reqwest::multipart::Form::new().part("image", part);
        if let Some(text) = self.text {
            form = form.text("text", text);
        }
        Ok(form)
    }
}

/// Attachment re-encoded as a base64 data URL plus optional text, the JSON
/// body shape the live transport and JSON send path carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlinePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub image: String,
    #[serde(skip)]
    pub content_type: String,
}

/// Validation only, in fail-fast order: non-empty, size for the target
/// mode, image family, allow-listed format. No partial output on failure.
pub fn validate(file: &AttachmentFile, mode: EncodingMode) -> Result<(), AttachmentError> {
    if file.bytes.is_empty() {
        return Err(AttachmentError::Empty);
    }
    let limit = mode.size_limit();
    if file.bytes.len() > limit {
        return Err(AttachmentError::TooLarge {
            actual: file.bytes.len(),
            limit,
        });
    }
    let declared = file.content_type.to_ascii_lowercase();
    if !declared.starts_with("image/") {
        return Err(AttachmentError::NotAnImage {
            content_type: file.content_type.clone(),
        });
    }
    if !ALLOWED_IMAGE_TYPES.contains(&declared.as_str()) {
        return Err(AttachmentError::UnsupportedFormat {
            content_type: file.content_type.clone(),
        });
    }
    Ok(())
}

/// Pure transform for the REST leg. Preview materialization stays the
/// caller's concern.
pub fn encode_multipart(
    file: &AttachmentFile,
    text: Option<&str>,
) -> Result<MultipartPayload, AttachmentError> {
    validate(file, EncodingMode::Multipart)?;
    Ok(MultipartPayload {
        text: text.map(str::to_string),
        filename: file.filename.clone(),
        content_type: file.content_type.to_ascii_lowercase(),
        bytes: file.bytes.clone(),
    })
}

/// Pure transform for the live-transport leg.
pub fn encode_inline(
    file: &AttachmentFile,
    text: Option<&str>,
) -> Result<InlinePayload, AttachmentError> {
    validate(file, EncodingMode::Inline)?;
    let content_type = file.content_type.to_ascii_lowercase();
    Ok(InlinePayload {
        text: text.map(str::to_string),
        image: format!("data:{};base64,{}", content_type, STANDARD.encode(&file.bytes)),
        content_type,
    })
}

#[cfg(test)]
#[path = "tests/attachment_tests.rs"]
mod tests;
