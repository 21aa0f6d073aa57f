use thiserror::Error;

use crate::attachment::AttachmentError;
use crate::config::ConfigError;
use crate::probe::ProbeError;

/// Errors surfaced from the client's operations. Transport failures carry
/// the server's own message when one could be parsed from the body.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client has no identity yet, call start first")]
    NotStarted,
    #[error("no conversation is selected")]
    NoConversationSelected,
    #[error("message has no text and no attachment")]
    EmptyMessage,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("transport: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}
