use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum NsqError {
    #[error("config: {0}")]
    Config(String),

    #[error("dial {addr}: {source}")]
    Dial { addr: String, source: std::io::Error },

    #[error("dial {addr}: timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("nsqd: {0}")]
    ErrorFrame(String),

    #[error("lookupd ({addr}): {detail}")]
    Lookup { addr: String, detail: String },

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid {kind} name '{name}'")]
    InvalidName { kind: &'static str, name: String },

    #[error("no handlers registered")]
    NoHandlers,

    #[error("already connected to {0}")]
    AlreadyConnected(String),

    #[error("consumer is stopping")]
    Stopping,

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Ошибка обработки сообщения. Сообщение уходит на REQ с задержкой.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
