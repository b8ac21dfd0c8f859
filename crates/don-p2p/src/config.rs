//! Stream and peer configuration.
//!
//! [`StreamConfig`] is the per-link policy a DON asks for. When several scopes
//! ask for the same peer, the link runs with the field-wise maximum of their
//! requests (see [`StreamConfig::merge`]).

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{P2pError, P2pResult};
use crate::protocol::PeerId;

/// Default capacity of the merged delivery channel behind `receive()`.
pub const DEFAULT_RECEIVE_CHANNEL_SIZE: usize = 10_000;

/// Token bucket parameters: refill `rate` per second, holding at most `capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketParams {
    /// Tokens added per second.
    pub rate: f64,
    /// Maximum tokens (burst size).
    pub capacity: u32,
}

impl TokenBucketParams {
    /// Creates new bucket parameters.
    #[must_use]
    pub const fn new(rate: f64, capacity: u32) -> Self {
        Self { rate, capacity }
    }

    /// Field-wise maximum of two parameter sets.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            rate: self.rate.max(other.rate),
            capacity: self.capacity.max(other.capacity),
        }
    }

    fn validate(&self, name: &str) -> P2pResult<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(P2pError::InvalidConfig(format!(
                "{name}: rate must be positive and finite, got {}",
                self.rate
            )));
        }
        if self.capacity == 0 {
            return Err(P2pError::InvalidConfig(format!(
                "{name}: capacity must be positive"
            )));
        }
        Ok(())
    }
}

/// Desired policy for one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Messages buffered per peer before new inbound messages are dropped.
    pub incoming_message_buffer_size: usize,
    /// Frames the transport may queue for transmission.
    pub outgoing_message_buffer_size: usize,
    /// Largest payload accepted in either direction.
    pub max_message_len_bytes: usize,
    /// Bucket limiting the number of messages sent.
    pub message_rate_limiter: TokenBucketParams,
    /// Bucket limiting payload bytes sent.
    pub bytes_rate_limiter: TokenBucketParams,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            incoming_message_buffer_size: 500,
            outgoing_message_buffer_size: 500,
            max_message_len_bytes: 500_000, // 500 KB
            message_rate_limiter: TokenBucketParams::new(100.0, 500),
            bytes_rate_limiter: TokenBucketParams::new(5_000_000.0, 10_000_000), // 5 MB/s, 10 MB burst
        }
    }
}

impl StreamConfig {
    /// Sets the incoming buffer size.
    #[must_use]
    pub const fn with_incoming_buffer(mut self, size: usize) -> Self {
        self.incoming_message_buffer_size = size;
        self
    }

    /// Sets the outgoing buffer size.
    #[must_use]
    pub const fn with_outgoing_buffer(mut self, size: usize) -> Self {
        self.outgoing_message_buffer_size = size;
        self
    }

    /// Sets the maximum message length.
    #[must_use]
    pub const fn with_max_message_len(mut self, len: usize) -> Self {
        self.max_message_len_bytes = len;
        self
    }

    /// Sets the message-count bucket.
    #[must_use]
    pub const fn with_message_rate(mut self, rate: f64, capacity: u32) -> Self {
        self.message_rate_limiter = TokenBucketParams::new(rate, capacity);
        self
    }

    /// Sets the byte bucket.
    #[must_use]
    pub const fn with_bytes_rate(mut self, rate: f64, capacity: u32) -> Self {
        self.bytes_rate_limiter = TokenBucketParams::new(rate, capacity);
        self
    }

    /// Field-wise maximum of two configs.
    ///
    /// Commutative, associative and idempotent, so the merge over any set of
    /// contributions does not depend on the order they arrived in.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            incoming_message_buffer_size: self
                .incoming_message_buffer_size
                .max(other.incoming_message_buffer_size),
            outgoing_message_buffer_size: self
                .outgoing_message_buffer_size
                .max(other.outgoing_message_buffer_size),
            max_message_len_bytes: self.max_message_len_bytes.max(other.max_message_len_bytes),
            message_rate_limiter: self.message_rate_limiter.merge(&other.message_rate_limiter),
            bytes_rate_limiter: self.bytes_rate_limiter.merge(&other.bytes_rate_limiter),
        }
    }

    /// Merges every config yielded by `configs`, or `None` if there are none.
    pub fn merge_all<'a>(configs: impl IntoIterator<Item = &'a Self>) -> Option<Self> {
        configs
            .into_iter()
            .fold(None, |acc: Option<Self>, cfg| {
                Some(acc.map_or(*cfg, |merged| merged.merge(cfg)))
            })
    }

    /// Checks that every field is usable.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> P2pResult<()> {
        if self.incoming_message_buffer_size == 0 {
            return Err(P2pError::InvalidConfig(
                "incoming_message_buffer_size must be positive".to_string(),
            ));
        }
        if self.outgoing_message_buffer_size == 0 {
            return Err(P2pError::InvalidConfig(
                "outgoing_message_buffer_size must be positive".to_string(),
            ));
        }
        if self.max_message_len_bytes == 0 {
            return Err(P2pError::InvalidConfig(
                "max_message_len_bytes must be positive".to_string(),
            ));
        }
        self.message_rate_limiter.validate("message_rate_limiter")?;
        self.bytes_rate_limiter.validate("bytes_rate_limiter")
    }
}

/// A statically configured bootstrap peer.
///
/// Parses from and displays as `<peer_id>@<address>[,<address>...]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapperLocator {
    /// Identity of the bootstrap peer.
    pub peer_id: PeerId,
    /// Addresses the transport may dial.
    pub addresses: Vec<String>,
}

impl BootstrapperLocator {
    /// Creates a new locator.
    #[must_use]
    pub const fn new(peer_id: PeerId, addresses: Vec<String>) -> Self {
        Self { peer_id, addresses }
    }
}

impl fmt::Display for BootstrapperLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer_id, self.addresses.join(","))
    }
}

impl FromStr for BootstrapperLocator {
    type Err = P2pError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addrs) = s.split_once('@').ok_or_else(|| {
            P2pError::InvalidConfig(format!("bootstrapper locator {s:?} is missing '@'"))
        })?;
        let addresses: Vec<String> = addrs
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect();
        if addresses.is_empty() {
            return Err(P2pError::InvalidConfig(format!(
                "bootstrapper locator {s:?} has no addresses"
            )));
        }
        Ok(Self {
            peer_id: id.trim().parse()?,
            addresses,
        })
    }
}

/// Configuration of a peer service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Peers that are always kept connected.
    pub bootstrappers: Vec<BootstrapperLocator>,
    /// Stream policy applied to bootstrap links.
    pub bootstrap_stream_config: StreamConfig,
    /// Capacity of the merged delivery channel.
    pub receive_channel_size: usize,
    /// How often required links that are down are re-opened.
    pub reconnect_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bootstrappers: Vec::new(),
            bootstrap_stream_config: StreamConfig::default(),
            receive_channel_size: DEFAULT_RECEIVE_CHANNEL_SIZE,
            reconnect_interval: Duration::from_secs(5),
        }
    }
}

impl PeerConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bootstrappers.
    #[must_use]
    pub fn with_bootstrappers(mut self, bootstrappers: Vec<BootstrapperLocator>) -> Self {
        self.bootstrappers = bootstrappers;
        self
    }

    /// Sets the bootstrap stream config.
    #[must_use]
    pub const fn with_bootstrap_stream_config(mut self, config: StreamConfig) -> Self {
        self.bootstrap_stream_config = config;
        self
    }

    /// Sets the delivery channel size.
    #[must_use]
    pub const fn with_receive_channel_size(mut self, size: usize) -> Self {
        self.receive_channel_size = size;
        self
    }

    /// Sets the reconnect interval.
    #[must_use]
    pub const fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Returns true if `peer` is one of the configured bootstrappers.
    #[must_use]
    pub fn is_bootstrapper(&self, peer: &PeerId) -> bool {
        self.bootstrappers.iter().any(|b| &b.peer_id == peer)
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::InvalidConfig`] for unusable values.
    pub fn validate(&self) -> P2pResult<()> {
        if self.receive_channel_size == 0 {
            return Err(P2pError::InvalidConfig(
                "receive_channel_size must be positive".to_string(),
            ));
        }
        if self.reconnect_interval.is_zero() {
            return Err(P2pError::InvalidConfig(
                "reconnect_interval must be positive".to_string(),
            ));
        }
        self.bootstrap_stream_config.validate()
    }

    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or the result fails validation.
    pub fn from_json(json: &str) -> P2pResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> P2pResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn stream_config_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.incoming_message_buffer_size, 500);
        assert_eq!(config.outgoing_message_buffer_size, 500);
        assert_eq!(config.max_message_len_bytes, 500_000);
        assert_eq!(config.message_rate_limiter, TokenBucketParams::new(100.0, 500));
        assert_eq!(
            config.bytes_rate_limiter,
            TokenBucketParams::new(5_000_000.0, 10_000_000)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn merge_takes_field_wise_maximum() {
        let a = StreamConfig::default()
            .with_incoming_buffer(10)
            .with_outgoing_buffer(300)
            .with_max_message_len(1024)
            .with_message_rate(10.0, 50)
            .with_bytes_rate(100.0, 5000);
        let b = StreamConfig::default()
            .with_incoming_buffer(20)
            .with_outgoing_buffer(100)
            .with_max_message_len(512)
            .with_message_rate(5.0, 80)
            .with_bytes_rate(200.0, 1000);

        let merged = a.merge(&b);
        assert_eq!(merged.incoming_message_buffer_size, 20);
        assert_eq!(merged.outgoing_message_buffer_size, 300);
        assert_eq!(merged.max_message_len_bytes, 1024);
        assert_eq!(merged.message_rate_limiter, TokenBucketParams::new(10.0, 80));
        assert_eq!(merged.bytes_rate_limiter, TokenBucketParams::new(200.0, 5000));
    }

    #[test]
    fn merge_all_of_nothing_is_none() {
        assert!(StreamConfig::merge_all(std::iter::empty()).is_none());
    }

    #[test]
    fn merge_all_single_is_identity() {
        let cfg = StreamConfig::default().with_message_rate(10.0, 5);
        assert_eq!(StreamConfig::merge_all([&cfg]), Some(cfg));
    }

    #[test_case(StreamConfig::default().with_incoming_buffer(0), "incoming_message_buffer_size" ; "zero incoming buffer")]
    #[test_case(StreamConfig::default().with_outgoing_buffer(0), "outgoing_message_buffer_size" ; "zero outgoing buffer")]
    #[test_case(StreamConfig::default().with_max_message_len(0), "max_message_len_bytes" ; "zero max length")]
    #[test_case(StreamConfig::default().with_message_rate(10.0, 0), "message_rate_limiter" ; "zero message capacity")]
    #[test_case(StreamConfig::default().with_message_rate(0.0, 10), "message_rate_limiter" ; "zero message rate")]
    #[test_case(StreamConfig::default().with_bytes_rate(-1.0, 10), "bytes_rate_limiter" ; "negative byte rate")]
    #[test_case(StreamConfig::default().with_bytes_rate(f64::NAN, 10), "bytes_rate_limiter" ; "nan byte rate")]
    #[test_case(StreamConfig::default().with_bytes_rate(f64::INFINITY, 10), "bytes_rate_limiter" ; "infinite byte rate")]
    fn validate_rejects(config: StreamConfig, field: &str) {
        let err = config.validate().unwrap_err();
        assert!(matches!(err, P2pError::InvalidConfig(_)));
        assert!(err.to_string().contains(field), "{err} should name {field}");
    }

    #[test]
    fn stream_config_json_fills_missing_fields() {
        let config: StreamConfig =
            serde_json::from_str(r#"{"incoming_message_buffer_size": 7}"#).unwrap();
        assert_eq!(config.incoming_message_buffer_size, 7);
        assert_eq!(config.max_message_len_bytes, 500_000);
    }

    #[test]
    fn bootstrapper_locator_parse_and_display() {
        let id = PeerId::from_bytes([3u8; 32]);
        let text = format!("{id}@10.0.0.1:6690,10.0.0.2:6690");

        let locator: BootstrapperLocator = text.parse().unwrap();
        assert_eq!(locator.peer_id, id);
        assert_eq!(locator.addresses, vec!["10.0.0.1:6690", "10.0.0.2:6690"]);
        assert_eq!(locator.to_string(), text);
    }

    #[test]
    fn bootstrapper_locator_rejects_missing_parts() {
        let id = PeerId::from_bytes([3u8; 32]);
        assert!(id.to_string().parse::<BootstrapperLocator>().is_err());
        assert!(format!("{id}@").parse::<BootstrapperLocator>().is_err());
        assert!("garbage@10.0.0.1:1".parse::<BootstrapperLocator>().is_err());
    }

    #[test]
    fn peer_config_from_json() {
        let id = PeerId::from_bytes([9u8; 32]);
        let json = format!(
            r#"{{
                "bootstrappers": [{{"peer_id": "{id}", "addresses": ["127.0.0.1:6690"]}}],
                "receive_channel_size": 64,
                "reconnect_interval": {{"secs": 1, "nanos": 0}}
            }}"#
        );

        let config = PeerConfig::from_json(&json).unwrap();
        assert!(config.is_bootstrapper(&id));
        assert_eq!(config.receive_channel_size, 64);
        assert_eq!(config.reconnect_interval, Duration::from_secs(1));
        assert_eq!(config.bootstrap_stream_config, StreamConfig::default());
    }

    #[test]
    fn peer_config_rejects_zero_channel() {
        let err = PeerConfig::from_json(r#"{"receive_channel_size": 0}"#).unwrap_err();
        assert!(matches!(err, P2pError::InvalidConfig(_)));
    }

    #[test]
    fn peer_config_rejects_bad_json() {
        assert!(matches!(
            PeerConfig::from_json("{not json").unwrap_err(),
            P2pError::Json(_)
        ));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_config() -> impl Strategy<Value = StreamConfig> {
            (1usize..1000, 1usize..1000, 1usize..100_000, 1u32..1000, 1u32..1000, 1u32..1000, 1u32..1000)
                .prop_map(|(inc, out, max, mr, mc, br, bc)| {
                    StreamConfig::default()
                        .with_incoming_buffer(inc)
                        .with_outgoing_buffer(out)
                        .with_max_message_len(max)
                        .with_message_rate(f64::from(mr), mc)
                        .with_bytes_rate(f64::from(br), bc)
                })
        }

        proptest! {
            #[test]
            fn merge_is_commutative(a in arb_config(), b in arb_config()) {
                prop_assert_eq!(a.merge(&b), b.merge(&a));
            }

            #[test]
            fn merge_is_associative(a in arb_config(), b in arb_config(), c in arb_config()) {
                prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
            }

            #[test]
            fn merge_is_idempotent(a in arb_config()) {
                prop_assert_eq!(a.merge(&a), a);
            }

            #[test]
            fn merge_of_valid_configs_is_valid(a in arb_config(), b in arb_config()) {
                prop_assert!(a.merge(&b).validate().is_ok());
            }
        }
    }
}
