use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The node answered 404: the run or resource is already gone
    #[error("'{url}' not found on node '{node}': {message}")]
    NotFound {
        node: String,
        url: String,
        message: String,
    },

    #[error("call to '{url}' failed with status {status}: {message}")]
    RemoteCallFailed {
        status: u16,
        url: String,
        message: String,
    },

    #[error("request to '{url}' failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The node processed the call but reported an error result
    #[error("node '{node}' rejected the request: {message}")]
    Rejected { node: String, message: String },

    #[error("unexpected response from '{url}': {message}")]
    InvalidResponse { url: String, message: String },

    #[error("unable to resolve address of '{hostname}': {message}")]
    AddressResolution { hostname: String, message: String },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether the remote resource no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClientError::NotFound { .. } | ClientError::RemoteCallFailed { status: 404, .. }
        )
    }

    /// HTTP status of a failed call, if the node answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::NotFound { .. } => Some(404),
            ClientError::RemoteCallFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { .. } => true,
            ClientError::RemoteCallFailed { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
