#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// the cooperative cancellation sentinel; not a failure
    #[error("operation aborted")]
    Aborted,
    #[error("authentication rejected")]
    AuthFailed,
    #[error("gateway closed: code {code} ({reason})")]
    GatewayClosed { code: u16, reason: String },
    #[error("gateway protocol error: {0}")]
    Protocol(String),
    #[error("bad request: {0}")]
    BadStatic(&'static str),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("database writer is gone")]
    WriterClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decompression error: {0}")]
    Inflate(String),
    /// a snapshot differed from the stored one but did not advance time
    #[error("snapshot timestamp did not advance for {0}")]
    TimestampRegression(String),
    #[error("tracing subscriber error: {0}")]
    TracingSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

impl Error {
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
