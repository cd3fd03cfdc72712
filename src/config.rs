use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(5000);
const DEFAULT_MAX_RETRIES: u32 = 10;

/// Configuration for a [`Channel`](crate::Channel).
///
/// Immutable once the channel is constructed.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Target address (`ws://` or `wss://`)
    pub address: String,
    /// Sub-protocol identifiers offered during the handshake
    pub protocols: Vec<String>,
    /// Hint for transports that distinguish binary payload representations.
    /// The default transport delivers raw bytes either way.
    pub binary_type: Option<BinaryType>,
    /// Pause between reconnect attempts while no transport is live
    pub retry_interval: Duration,
    /// Number of reconnect attempts before the channel completes
    pub max_retries: u32,
}

impl Config {
    /// Create a configuration for the given address with defaults for
    /// everything else.
    #[must_use]
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            protocols: Vec::new(),
            binary_type: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Offer the given sub-protocols during the handshake.
    #[must_use]
    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Set the binary representation hint.
    #[must_use]
    pub const fn binary_type(mut self, binary_type: BinaryType) -> Self {
        self.binary_type = Some(binary_type);
        self
    }

    /// Set the pause between reconnect attempts.
    #[must_use]
    pub const fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the number of reconnect attempts before giving up.
    #[must_use]
    pub const fn max_retries(mut self, attempts: u32) -> Self {
        self.max_retries = attempts;
        self
    }
}

/// Preferred representation for inbound binary payloads, mirroring the two
/// representations browser sockets negotiate.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryType {
    Blob,
    ArrayBuffer,
}

// Retry ticks are strictly interval-paced: multiplier 1.0 and zero jitter pin
// every attempt exactly one retry_interval apart.
impl From<&Config> for ExponentialBackoff {
    fn from(config: &Config) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.retry_interval)
            .with_max_interval(config.retry_interval)
            .with_multiplier(1.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}
