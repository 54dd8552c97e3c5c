/// Errors of the RPC layer, on both the serving and calling side.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RpcError {
    /// The request named a method the service does not export.
    #[error("unknown method {0:?}")]
    MethodNotFound(String),

    /// The parameter array did not decode into the handler's types.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The handler ran and failed; carries the service error message.
    #[error("{0}")]
    Handler(String),

    /// A result value failed to encode as JSON.
    #[error("failed to encode result value")]
    Encode(#[source] serde_json::Error),

    /// The HTTP exchange itself failed (caller side).
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    /// The remote service replied with an error (caller side).
    #[error("{0}")]
    Remote(String),
}

impl RpcError {
    /// Wrap a service-side operation failure, preserving its source chain in
    /// the message.
    pub fn handler(err: impl std::error::Error) -> Self {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        RpcError::Handler(message)
    }
}
