use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The server answered with a body that is neither a result nor an error.
    #[error("unexpected response from server (HTTP {status}): {body}")]
    Decode { status: u16, body: String },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
