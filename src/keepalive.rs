use crate::protocol::EnginePacket;
use crate::transport::Transport;
use log::trace;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks the server's heartbeat. Engine.IO servers ping every
/// `ping_interval`; if nothing arrives within `ping_interval + ping_timeout`
/// the connection is considered dead.
#[derive(Debug, Clone)]
pub struct PingWatchdog {
    window: Duration,
    deadline: Instant,
}

impl PingWatchdog {
    pub fn new(ping_interval: Duration, ping_timeout: Duration) -> Self {
        let window = ping_interval + ping_timeout;
        Self {
            window,
            deadline: Instant::now() + window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Re-arms the watchdog and answers the ping with a pong.
    pub async fn answer_ping(&mut self, transport: &dyn Transport) -> Result<(), anyhow::Error> {
        self.deadline = Instant::now() + self.window;
        trace!(target: "Connection/Keepalive", "Ping received, answering");
        transport.send(&EnginePacket::Pong.encode()).await
    }
}
