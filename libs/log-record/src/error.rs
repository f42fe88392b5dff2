#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown level: {0}")]
    UnknownLevel(String),
}
