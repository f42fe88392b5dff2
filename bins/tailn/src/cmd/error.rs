#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error("{0}")]
    Usage(String),

    #[error("config: {0}")]
    Config(String),

    #[error("connect: {0}")]
    Connect(#[from] nsq_client::NsqError),

    #[error("cannot open {path}: {source}")]
    Io { path: String, source: std::io::Error },

    #[error("signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

impl TailError {
    /// Usage даёт 2, прочие фатальные ошибки 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            TailError::Usage(_) => 2,
            _ => 1,
        }
    }
}
