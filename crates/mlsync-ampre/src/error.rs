use thiserror::Error;

#[derive(Debug, Error)]
pub enum AmpreError {
    /// 401/403 from the API. Never retried.
    #[error("authentication rejected by AMPRE (HTTP {status})")]
    Auth { status: u16 },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connect failures, timeouts and broken bodies.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The response was not an OData `{ "value": [...] }` envelope.
    #[error("unexpected response shape: {0}")]
    Decode(String),

    #[error("max retries exceeded after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl AmpreError {
    /// Transient failures worth another attempt after the retry delay.
    pub fn is_retryable(&self) -> bool {
        match self {
            AmpreError::Transport(_) => true,
            AmpreError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
