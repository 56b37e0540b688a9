//! Error handling for the mirror registry

/// Result type alias for registry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Hex decoding error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("Invalid digest (expected <algorithm>:<hex>): {0}")]
    InvalidDigest(String),

    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Mirror resolve retries exhausted for key: {0}")]
    ResolveExhausted(String),

    #[error("Router has no peers in its routing table")]
    RouterUnready,

    #[error("Failed to advertise {} keys: {}", failed.len(), failed.join(", "))]
    Advertise { failed: Vec<String> },

    #[error("DHT error: {0}")]
    Dht(String),

    #[error("libp2p error: {0}")]
    Libp2p(String),

    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Other error: {0}")]
    Other(String),
}

// libp2p error conversions
impl From<libp2p::swarm::DialError> for Error {
    fn from(err: libp2p::swarm::DialError) -> Self {
        Error::Libp2p(format!("Dial error: {err}"))
    }
}

impl From<libp2p::noise::Error> for Error {
    fn from(err: libp2p::noise::Error) -> Self {
        Error::Libp2p(format!("Noise error: {err}"))
    }
}

impl From<libp2p::TransportError<std::io::Error>> for Error {
    fn from(err: libp2p::TransportError<std::io::Error>) -> Self {
        Error::Libp2p(format!("Transport error: {err}"))
    }
}

impl From<libp2p::multiaddr::Error> for Error {
    fn from(err: libp2p::multiaddr::Error) -> Self {
        Error::Libp2p(format!("Multiaddr error: {err}"))
    }
}

impl From<multihash::Error> for Error {
    fn from(err: multihash::Error) -> Self {
        Error::Dht(format!("Multihash error: {err}"))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::Other(format!("Channel receive error: {err}"))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Other(format!("Channel send error: {err}"))
    }
}

impl Error {
    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a malformed request error
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Error::MalformedRequest(msg.into())
    }

    /// Create an invalid reference error
    pub fn invalid_reference<S: Into<String>>(msg: S) -> Self {
        Error::InvalidReference(msg.into())
    }

    /// Create a DHT error
    pub fn dht<S: Into<String>>(msg: S) -> Self {
        Error::Dht(msg.into())
    }

    /// Create a generic error
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Error::Other(msg.into())
    }

    /// True for errors that mean the requested content simply is not there.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::ResolveExhausted(_)
                | Error::InvalidDigest(_)
                | Error::InvalidReference(_)
                | Error::MalformedRequest(_)
        )
    }
}
