use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool provider '{id}' not found")]
    NotFound { id: String },
    #[error("tool provider '{name}' is not in a ready state")]
    NotReady { name: String },
    #[error("failed to spawn tool provider '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tool provider '{name}' transport error: {message}")]
    Transport { name: String, message: String },
    #[error("tool provider '{name}' protocol error: {message}")]
    Protocol { name: String, message: String },
    #[error("tool provider '{name}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        name: String,
        code: i64,
        message: String,
    },
    #[error("request to tool provider '{name}' timed out")]
    Timeout { name: String },
    #[error("request to tool provider '{name}' was cancelled")]
    Cancelled { name: String },
}
