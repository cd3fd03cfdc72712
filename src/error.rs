use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Errors produced by a [`Channel`](crate::Channel).
///
/// Sources are `Arc`-wrapped so a single terminal error can be delivered to
/// every subscriber of the multicast event stream.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Error {
    /// A connect attempt failed. Recoverable: the channel keeps retrying
    /// until its attempt budget is exhausted.
    Connect(Arc<dyn StdError + Send + Sync>),
    /// A transport-level error occurred while a connection was live.
    /// Terminal: the channel shuts down and cannot be reused.
    Transport(Arc<dyn StdError + Send + Sync>),
    /// An outbound value could not be JSON-encoded
    Encode(Arc<serde_json::Error>),
    /// The configured address is not a valid `ws://` or `wss://` URL
    InvalidAddress {
        /// The rejected address
        address: String,
        /// Parse failure, when the address was not a URL at all
        source: Option<Arc<url::ParseError>>,
    },
    /// The channel has permanently terminated
    Terminated,
    /// A subscriber fell behind and missed messages
    Lagged {
        /// Number of messages that were missed
        count: u64,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "connect attempt failed: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Encode(e) => write!(f, "failed to encode outbound value: {e}"),
            Self::InvalidAddress { address, .. } => write!(f, "invalid channel address: {address}"),
            Self::Terminated => write!(f, "channel has terminated"),
            Self::Lagged { count } => write!(f, "subscriber lagged, missed {count} messages"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connect(e) | Self::Transport(e) => Some(&**e),
            Self::Encode(e) => Some(&**e),
            Self::InvalidAddress {
                source: Some(e), ..
            } => Some(&**e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(Arc::new(e))
    }
}
