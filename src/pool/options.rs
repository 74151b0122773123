use std::time::Duration;

use typed_builder::TypedBuilder;

/// Options for an individual connection within a pool.
#[derive(Clone, Debug, TypedBuilder)]
pub struct ConnectionOptions {
    /// How long a `connect()` attempt may take before it's considered failed.
    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,

    /// CQL protocol version to send in the `STARTUP` frame.
    #[builder(default = crate::frame::DEFAULT_VERSION)]
    pub protocol_version: crate::frame::Version,

    /// Extra `STARTUP` options beyond `CQL_VERSION`, e.g. `COMPRESSION`.
    #[builder(default)]
    pub startup_options: Vec<(String, String)>,
}

/// Options governing how a pool manages its connections, one per configured contact point. The
/// connection count itself isn't configured here: it's implied by how many contact points the
/// owning `Cluster` was given.
#[derive(Clone, Debug, TypedBuilder)]
pub struct PoolOptions {
    /// Starting reconnect back-off, used after a connection's first unexpected close.
    #[builder(default = Duration::from_millis(200))]
    pub reconnect_backoff_start: Duration,

    /// Ceiling the reconnect back-off is capped at, regardless of how many consecutive closes a
    /// connection has seen.
    #[builder(default = Duration::from_secs(5))]
    pub reconnect_backoff_max: Duration,

    /// Number of consecutive request failures a connection may accumulate before it is forcibly
    /// reconnected, even if the transport itself hasn't reported a close.
    #[builder(default = 500)]
    pub consecutive_error_threshold: u32,

    /// Per-connection options, shared by every connection the pool opens.
    #[builder(default)]
    pub connection: ConnectionOptions,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions::builder().build()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = PoolOptions::builder().build();
        assert_eq!(options.reconnect_backoff_start, Duration::from_millis(200));
        assert_eq!(options.reconnect_backoff_max, Duration::from_secs(5));
        assert_eq!(options.consecutive_error_threshold, 500);
    }
}
