pub mod types {
    pub mod events;
    pub mod notification;

    pub use notification::*;
}

pub mod api;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod http;
pub mod keepalive;
pub mod notification_cache;
pub mod protocol;
pub mod session;
pub mod sync;
pub mod transport;

pub use config::{ClientConfig, ReconnectPolicy};
pub use connection::{ConnectOutcome, ConnectionManager};
pub use notification_cache::{DuplicatePolicy, NotificationCache};
pub use session::{Credential, SessionGate, TokenSession};
pub use sync::{NotificationSync, SyncError};
