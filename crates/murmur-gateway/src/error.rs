use thiserror::Error;

/// Why a request could not be served.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The request was understood but refused; the text goes back to the client.
    #[error("{0}")]
    Validation(String),

    /// The store failed. Details are logged, the client gets a generic reply.
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl RouteError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Text safe to send back to the requester.
    pub fn reply_text(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::Storage(_) => "Internal server error".to_string(),
        }
    }
}
