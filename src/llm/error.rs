use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("API key is required for {kind}")]
    MissingApiKey { kind: String },
    #[error("endpoint is required for local providers")]
    MissingEndpoint,
    #[error("network error calling {kind} backend: {source}")]
    Network {
        kind: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{kind} backend returned status {status}: {body}")]
    Status {
        kind: String,
        status: u16,
        body: String,
    },
    #[error("{kind} backend returned an invalid response: {reason}")]
    InvalidResponse { kind: String, reason: String },
    #[error("conversation exceeded maximum tool iterations ({limit})")]
    MaxIterations { limit: usize },
    #[error("tool execution aborted by user")]
    Aborted,
}

impl ModelError {
    pub fn network(kind: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            kind: kind.into(),
            source,
        }
    }

    pub fn invalid_response(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}
