//! Client and server configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{ReconnectPolicy, DEFAULT_BASE_DELAY, DEFAULT_JITTER_RATIO, DEFAULT_MAX_DELAY};
use crate::broadcast::DEFAULT_BROADCAST_CAPACITY;
use crate::error::LinkError;
use crate::fragment::{DEFAULT_FRAGMENT_THRESHOLD, FRAME_HEADROOM};
use crate::ping::{DEFAULT_PING_INTERVAL, DEFAULT_PING_TIMEOUT};
use crate::protocol::MAX_FRAME_SIZE;

/// Callback run when an open socket is lost, before the status changes.
/// A local `close()` or `destroy()` does not run it.
#[derive(Clone)]
pub struct WsCloseHook(Arc<dyn Fn() + Send + Sync>);

impl WsCloseHook {
    pub fn new(hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }

    pub fn call(&self) {
        (self.0)()
    }
}

impl fmt::Debug for WsCloseHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WsCloseHook")
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the server
    pub url: String,
    /// Interval between liveness pings
    pub ping_interval: Duration,
    /// Disable the periodic ping entirely
    pub disable_ping: bool,
    /// Default deadline for manual `ping()` calls
    pub ping_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Jitter ratio in `0.0..=1.0` added on top of the backoff
    pub reconnect_jitter: f64,
    /// Update payloads above this size are fragmented
    pub fragment_threshold: usize,
    pub on_ws_close: Option<WsCloseHook>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: DEFAULT_PING_INTERVAL,
            disable_ping: false,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            reconnect_base_delay: DEFAULT_BASE_DELAY,
            reconnect_max_delay: DEFAULT_MAX_DELAY,
            reconnect_jitter: DEFAULT_JITTER_RATIO,
            fragment_threshold: DEFAULT_FRAGMENT_THRESHOLD,
            on_ws_close: None,
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_ping_disabled(mut self) -> Self {
        self.disable_ping = true;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_reconnect_delays(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max;
        self
    }

    pub fn with_reconnect_jitter(mut self, ratio: f64) -> Self {
        self.reconnect_jitter = ratio;
        self
    }

    pub fn with_fragment_threshold(mut self, threshold: usize) -> Self {
        self.fragment_threshold = threshold;
        self
    }

    /// Observe low-level socket closes.
    pub fn with_on_ws_close(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_ws_close = Some(WsCloseHook::new(hook));
        self
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: self.reconnect_base_delay,
            max_delay: self.reconnect_max_delay,
            jitter_ratio: self.reconnect_jitter,
        }
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.url.is_empty() {
            return Err(LinkError::InvalidConfig("url is empty".into()));
        }
        if !self.disable_ping && self.ping_interval.is_zero() {
            return Err(LinkError::InvalidConfig("ping_interval must be non-zero".into()));
        }
        if self.ping_timeout.is_zero() {
            return Err(LinkError::InvalidConfig("ping_timeout must be non-zero".into()));
        }
        if self.reconnect_base_delay.is_zero()
            || self.reconnect_base_delay > self.reconnect_max_delay
        {
            return Err(LinkError::InvalidConfig(format!(
                "reconnect delays must satisfy 0 < base ({:?}) <= max ({:?})",
                self.reconnect_base_delay, self.reconnect_max_delay
            )));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(LinkError::InvalidConfig(format!(
                "reconnect_jitter {} is outside 0.0..=1.0",
                self.reconnect_jitter
            )));
        }
        validate_fragment_threshold(self.fragment_threshold)
    }
}

/// Reference server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// How often dirty documents are handed to `save_document`
    pub save_interval: Duration,
    pub fragment_threshold: usize,
    /// Frames buffered per peer before a lagging peer starts missing them
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            save_interval: Duration::from_secs(60),
            fragment_threshold: DEFAULT_FRAGMENT_THRESHOLD,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.save_interval.is_zero() {
            return Err(LinkError::InvalidConfig("save_interval must be non-zero".into()));
        }
        if self.broadcast_capacity == 0 {
            return Err(LinkError::InvalidConfig("broadcast_capacity must be non-zero".into()));
        }
        validate_fragment_threshold(self.fragment_threshold)
    }
}

fn validate_fragment_threshold(threshold: usize) -> Result<(), LinkError> {
    if threshold == 0 || threshold > MAX_FRAME_SIZE - FRAME_HEADROOM {
        return Err(LinkError::InvalidConfig(format!(
            "fragment_threshold {} must be in 1..={}",
            threshold,
            MAX_FRAME_SIZE - FRAME_HEADROOM
        )));
    }
    Ok(())
}
