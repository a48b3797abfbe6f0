//! Client Configuration
//!
//! Endpoints, transport selection and timing knobs for the sync client.
//! Defaults suit a local development server; `from_env` overrides them
//! from `LIVE_SYNC_*` variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which push transport a client opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Type-multiplexed full-duplex socket.
    #[default]
    WebSocket,
    /// Named-event stream over HTTP.
    EventStream,
    /// No push transport; polling and mirror only.
    None,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "websocket" | "ws" | "pusher" => Ok(TransportKind::WebSocket),
            "sse" | "event-stream" | "eventstream" => Ok(TransportKind::EventStream),
            "none" | "poll" | "off" => Ok(TransportKind::None),
            _ => Err(ConfigError::Invalid {
                var: "LIVE_SYNC_TRANSPORT",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::EventStream => "sse",
            TransportKind::None => "none",
        };
        f.write_str(name)
    }
}

/// Exponential backoff for abnormal closures.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth per attempt.
    pub factor: f64,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Retries before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            factor: 1.5,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// `base * factor^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.min(64) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.factor.powi(exp);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.round() as u64)
    }
}

/// Sync client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// REST base URL (snapshots and privileged writes).
    pub api_base: String,
    /// Push endpoint. `ws://` for sockets, `http://` for event streams.
    pub push_url: Option<String>,
    /// Push transport to open.
    pub transport: TransportKind,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Ping interval. The connection is dead after twice this without a pong.
    pub heartbeat_interval: Duration,
    /// Bound on waiting for the subscription acknowledgement.
    pub open_timeout: Duration,
    /// Fallback snapshot poll interval.
    pub poll_interval: Duration,
    /// Bearer token forwarded on privileged writes.
    pub auth_token: Option<String>,
    /// Coalescing window for update callbacks. `None` delivers every merge
    /// as it happens.
    pub batch_window: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8000".to_string(),
            push_url: Some("ws://127.0.0.1:6001/app/live".to_string()),
            transport: TransportKind::WebSocket,
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            open_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            auth_token: None,
            batch_window: None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Variable present but unparseable.
    #[error("Invalid value for {var}: {value:?}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },

    /// A timing knob is zero.
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    /// Push transport selected without an endpoint.
    #[error("Transport {0} requires a push URL")]
    MissingPushUrl(TransportKind),
}

fn env_millis(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(None),
    }
}

impl ClientConfig {
    /// Load from `LIVE_SYNC_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(api_base) = std::env::var("LIVE_SYNC_API_BASE") {
            config.api_base = api_base;
        }
        if let Ok(push_url) = std::env::var("LIVE_SYNC_PUSH_URL") {
            config.push_url = Some(push_url).filter(|u| !u.is_empty());
        }
        if let Ok(transport) = std::env::var("LIVE_SYNC_TRANSPORT") {
            config.transport = transport.parse()?;
        }
        if let Some(base) = env_millis("LIVE_SYNC_RECONNECT_BASE_MS")? {
            config.reconnect.base_delay = base;
        }
        if let Some(max) = env_millis("LIVE_SYNC_RECONNECT_MAX_MS")? {
            config.reconnect.max_delay = max;
        }
        if let Ok(value) = std::env::var("LIVE_SYNC_RECONNECT_MAX_ATTEMPTS") {
            config.reconnect.max_attempts = value.trim().parse().map_err(|_| {
                ConfigError::Invalid { var: "LIVE_SYNC_RECONNECT_MAX_ATTEMPTS", value }
            })?;
        }
        if let Some(interval) = env_millis("LIVE_SYNC_HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval = interval;
        }
        if let Some(timeout) = env_millis("LIVE_SYNC_OPEN_TIMEOUT_MS")? {
            config.open_timeout = timeout;
        }
        if let Some(interval) = env_millis("LIVE_SYNC_POLL_INTERVAL_MS")? {
            config.poll_interval = interval;
        }
        if let Some(window) = env_millis("LIVE_SYNC_BATCH_WINDOW_MS")? {
            config.batch_window = Some(window).filter(|w| !w.is_zero());
        }
        config.auth_token = std::env::var("LIVE_SYNC_AUTH_TOKEN").ok().filter(|t| !t.is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the client cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("reconnect base delay", self.reconnect.base_delay),
            ("heartbeat interval", self.heartbeat_interval),
            ("open timeout", self.open_timeout),
            ("poll interval", self.poll_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if self.batch_window.is_some_and(|w| w.is_zero()) {
            return Err(ConfigError::ZeroInterval("batch window"));
        }
        if self.transport != TransportKind::None && self.push_url.is_none() {
            return Err(ConfigError::MissingPushUrl(self.transport));
        }
        Ok(())
    }
}
