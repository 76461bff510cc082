//! Error types for state documents and the control-plane client.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading, saving or validating a document.
#[derive(Debug, Error)]
pub enum StateError {
    /// The document could not be read or written.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid YAML for the expected shape.
    #[error("parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The document parsed but violates an invariant.
    #[error("invalid document: {0}")]
    Invalid(String),
}

/// Errors returned by [`crate::ControlPlaneClient`].
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Node (or sub-resource) does not exist on the control plane.
    #[error("not found: {0}")]
    NotFound(String),

    /// Control plane rejected the payload.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Any other non-success status.
    #[error("control plane returned {code}: {body}")]
    Status { code: u16, body: String },

    /// Base URL cannot carry a path.
    #[error("invalid control plane url: {0}")]
    InvalidUrl(String),

    /// Transport failure (connect, timeout, TLS).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Request body could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),
}
