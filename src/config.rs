use std::time::Duration;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:5001";
pub const SERVER_URL_ENV: &str = "NOTIFY_API_URL";

/// Bounded reconnection schedule. Delays double from `initial_delay` up to
/// `max_delay`; after `max_attempts` failed retries the connection gives up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based). Never decreases as
    /// `attempt` grows and never exceeds `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL shared by the REST endpoints and the realtime socket.
    pub server_url: String,
    pub reconnect: ReconnectPolicy,
    /// Upper bound for dialing plus the authentication handshake.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Reads the server URL from `NOTIFY_API_URL`, falling back to the default.
    pub fn from_env() -> Self {
        match std::env::var(SERVER_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => Self::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// REST endpoint for `path` (which must start with `/`).
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }

    /// WebSocket endpoint of the realtime channel.
    pub fn socket_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!(
            "{base}/socket.io/?EIO={}&transport=websocket",
            crate::protocol::ENGINE_IO_VERSION
        )
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(20),
        }
    }
}
