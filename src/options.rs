use std::time::Duration;

/// Server-wide tuning knobs (§3).
///
/// A real embedder will usually want these configurable from the command
/// line or a config file; the core only defines the struct and its
/// defaults, the way a single `MAX_CONNECTIONS` constant stands in for
/// a single knob before it grows into a proper config struct.
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum number of simultaneously registered clients. `0` means
    /// unlimited.
    pub connection_limit: u32,
    /// Maximum number of simultaneously registered clients sharing the same
    /// network key (§4.2). `0` means unlimited. Loopback remotes are always
    /// exempt regardless of this value.
    pub connections_per_ip_limit: u32,
    /// Whether response compression is enabled. The core never performs
    /// compression itself (out of scope, §1); this flag is only plumbed
    /// through to observers/drivers that implement it.
    pub compression_enabled: bool,
    /// Budget handed to each client's `stop()` during shutdown.
    pub shutdown_timeout: Duration,
    /// Interval between `TimeoutWheel` sweeps.
    pub timeout_tick: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            connection_limit: 0,
            connections_per_ip_limit: 0,
            compression_enabled: false,
            shutdown_timeout: Duration::from_millis(3000),
            timeout_tick: Duration::from_millis(1000),
        }
    }
}
