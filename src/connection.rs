//! Owner of the single realtime connection.
//!
//! [`ConnectionManager::connect`] spawns a supervisor task that dials, runs
//! the handshake, pumps frames and reconnects with the configured backoff.
//! Each supervisor is tagged with a generation number; status transitions and
//! forwarded notifications from a superseded generation are dropped under the
//! same lock [`ConnectionManager::disconnect`] takes to retire it, so a
//! teardown can never be overwritten by a late reconnect.
//!
//! The session is re-read before every attempt and whenever a frame arrives.
//! A credential withdrawn on an idle connection is therefore noticed at the
//! latest with the next server ping (`pingInterval`, 25 s on default servers).
//! Owners that need an immediate teardown call
//! [`ConnectionManager::disconnect`] themselves.

use crate::config::ClientConfig;
use crate::handshake::{self, Handshake, HandshakeError};
use crate::keepalive::PingWatchdog;
use crate::protocol::{EnginePacket, SocketPacket, connect_error_reason};
use crate::session::{Credential, RejectionPolicy, SessionGate};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::events::{Event, EventBus};
use crate::types::notification::{ConnectionStatus, Notification};
use log::{debug, error, info, trace, warn};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout};

/// Name of the only server event this client consumes.
pub const NOTIFICATION_EVENT: &str = "notification";

/// How a call to [`ConnectionManager::connect`] resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// A connection for the same credential already exists (it may be between
    /// reconnection attempts).
    AlreadyConnected,
    /// The retry budget ran out, or the session owner gave up after a
    /// rejected handshake. Status is left at `error`.
    GaveUp,
    /// Torn down before a connection was established.
    Cancelled,
}

struct LiveConnection {
    credential: Credential,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Established {
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    handshake: Handshake,
}

enum PumpExit {
    Shutdown,
    ServerClosed,
    CredentialWithdrawn,
    Failed(String),
}

pub struct ConnectionManager {
    config: ClientConfig,
    transport_factory: Arc<dyn TransportFactory>,
    session: Arc<dyn SessionGate>,
    event_bus: EventBus,
    current: Mutex<Option<LiveConnection>>,
    generation: StdMutex<u64>,
}

impl ConnectionManager {
    pub fn new(
        config: ClientConfig,
        transport_factory: Arc<dyn TransportFactory>,
        session: Arc<dyn SessionGate>,
    ) -> Arc<Self> {
        Self::with_event_bus(config, transport_factory, session, EventBus::new())
    }

    pub fn with_event_bus(
        config: ClientConfig,
        transport_factory: Arc<dyn TransportFactory>,
        session: Arc<dyn SessionGate>,
        event_bus: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport_factory,
            session,
            event_bus,
            current: Mutex::new(None),
            generation: StdMutex::new(0),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.event_bus.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.event_bus.watch_status()
    }

    /// Opens the realtime connection for `credential`.
    ///
    /// Resolves once the first connection is up, the retry budget is spent,
    /// or the attempt is cancelled. Transport and handshake failures never
    /// surface here; they are reported on the status channel.
    pub async fn connect(self: &Arc<Self>, credential: Credential) -> ConnectOutcome {
        let ready_rx = {
            let mut current = self.current.lock().await;
            if let Some(live) = current.as_ref() {
                if live.credential == credential && !live.task.is_finished() {
                    debug!(target: "Connection", "Connect requested but a connection already exists for this credential");
                    return ConnectOutcome::AlreadyConnected;
                }
            }
            if let Some(previous) = current.take() {
                let status = if previous.task.is_finished() {
                    None
                } else {
                    info!(target: "Connection", "Replacing connection for a different credential");
                    Some(ConnectionStatus::Disconnected)
                };
                self.advance_generation(status);
                self.stop(previous).await;
            }

            let generation = self.advance_generation(None);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = tokio::spawn(self.clone().supervise(
                generation,
                credential.clone(),
                shutdown_rx,
                ready_tx,
            ));
            *current = Some(LiveConnection {
                credential,
                shutdown_tx,
                task,
            });
            ready_rx
        };

        ready_rx.await.unwrap_or(ConnectOutcome::Cancelled)
    }

    /// Tears down the connection, cancels any pending reconnect, forces the
    /// status to `disconnected` and releases every event subscription.
    /// Does nothing when no connection exists.
    pub async fn disconnect(&self) {
        let mut current = self.current.lock().await;
        let Some(live) = current.take() else {
            debug!(target: "Connection", "Disconnect requested with no connection");
            return;
        };
        info!(target: "Connection", "Disconnecting intentionally.");
        self.advance_generation(Some(ConnectionStatus::Disconnected));
        self.stop(live).await;
        self.event_bus.clear();
    }

    async fn stop(&self, live: LiveConnection) {
        let LiveConnection {
            shutdown_tx,
            mut task,
            ..
        } = live;
        shutdown_tx.send_replace(true);
        match timeout(self.config.connect_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target: "Connection", "Connection task ended abnormally: {e}"),
            Err(_) => {
                warn!(target: "Connection", "Connection task did not stop in time, aborting it");
                task.abort();
            }
        }
    }

    /// Retires the running generation, optionally moving the status slot
    /// while still holding the generation lock.
    fn advance_generation(&self, status: Option<ConnectionStatus>) -> u64 {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        if let Some(status) = status {
            self.event_bus.set_status(status);
        }
        *generation
    }

    fn transition(&self, generation: u64, status: ConnectionStatus) -> bool {
        let current = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != generation {
            debug!(target: "Connection", "Dropping stale status {status} from generation {generation}");
            return false;
        }
        if self.event_bus.set_status(status).is_some() {
            info!(target: "Connection", "Status changed to {status}");
        }
        true
    }

    fn forward(&self, generation: u64, notification: Notification) {
        let current = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != generation {
            debug!(target: "Connection", "Dropping notification {} from a retired connection", notification.id);
            return;
        }
        let report = self
            .event_bus
            .publish(&Event::NotificationReceived(Arc::new(notification)));
        if report.failed > 0 {
            warn!(target: "Connection", "{} notification handler(s) failed", report.failed);
        }
    }

    async fn supervise(
        self: Arc<Self>,
        generation: u64,
        credential: Credential,
        mut shutdown: watch::Receiver<bool>,
        ready: oneshot::Sender<ConnectOutcome>,
    ) {
        let mut ready = Some(ready);
        let outcome = self
            .run_attempts(generation, &credential, &mut shutdown, &mut ready)
            .await;
        settle(&mut ready, outcome);
        debug!(target: "Connection", "Supervisor for generation {generation} finished");
    }

    async fn run_attempts(
        &self,
        generation: u64,
        credential: &Credential,
        shutdown: &mut watch::Receiver<bool>,
        ready: &mut Option<oneshot::Sender<ConnectOutcome>>,
    ) -> ConnectOutcome {
        let policy = &self.config.reconnect;
        let mut failures = 0u32;

        loop {
            if !self.credential_current(credential) {
                info!(target: "Connection", "Credential is no longer available, not connecting");
                self.transition(generation, ConnectionStatus::Disconnected);
                return ConnectOutcome::Cancelled;
            }

            let attempt = tokio::select! {
                biased;
                _ = shutdown.changed() => return ConnectOutcome::Cancelled,
                result = timeout(self.config.connect_timeout, self.establish(credential)) => {
                    result.unwrap_or(Err(HandshakeError::Timeout))
                }
            };

            match attempt {
                Ok(established) => {
                    failures = 0;
                    if !self.transition(generation, ConnectionStatus::Connected) {
                        established.transport.disconnect().await;
                        return ConnectOutcome::Cancelled;
                    }
                    info!(target: "Connection", "Connected (session {})", established.handshake.sid);
                    settle(ready, ConnectOutcome::Connected);

                    match self.pump(generation, credential, established, shutdown).await {
                        PumpExit::Shutdown => return ConnectOutcome::Cancelled,
                        PumpExit::ServerClosed => {
                            info!(target: "Connection", "Server ended the session");
                            self.transition(generation, ConnectionStatus::Disconnected);
                            return ConnectOutcome::Cancelled;
                        }
                        PumpExit::CredentialWithdrawn => {
                            info!(target: "Connection", "Credential withdrawn, closing connection");
                            self.transition(generation, ConnectionStatus::Disconnected);
                            return ConnectOutcome::Cancelled;
                        }
                        PumpExit::Failed(reason) => {
                            warn!(target: "Connection", "Connection lost: {reason}");
                            self.transition(generation, ConnectionStatus::Error);
                        }
                    }
                }
                Err(HandshakeError::Rejected(reason)) => {
                    warn!(target: "Connection", "Server rejected the credential: {reason}");
                    self.transition(generation, ConnectionStatus::Error);
                    if self.session.handshake_rejected(&reason) == RejectionPolicy::GiveUp {
                        info!(target: "Connection", "Session owner gave up after rejection");
                        return ConnectOutcome::GaveUp;
                    }
                }
                Err(e) => {
                    warn!(target: "Connection", "Connection attempt failed: {e}");
                    self.transition(generation, ConnectionStatus::Error);
                }
            }

            failures += 1;
            if !policy.allows(failures) {
                error!(
                    target: "Connection",
                    "Giving up after {} reconnection attempts",
                    policy.max_attempts
                );
                return ConnectOutcome::GaveUp;
            }
            let delay = policy.delay_for(failures);
            info!(
                target: "Connection",
                "Will attempt to reconnect in {:?} (attempt {}/{})",
                delay, failures, policy.max_attempts
            );
            tokio::select! {
                biased;
                _ = shutdown.changed() => return ConnectOutcome::Cancelled,
                _ = sleep(delay) => {}
            }
        }
    }

    fn credential_current(&self, credential: &Credential) -> bool {
        self.session.current_credential().as_ref() == Some(credential)
    }

    async fn establish(&self, credential: &Credential) -> Result<Established, HandshakeError> {
        let url = self.config.socket_url();
        let (transport, mut events) = self.transport_factory.create_transport(&url).await?;
        match handshake::do_handshake(transport.as_ref(), &mut events, credential).await {
            Ok(handshake) => Ok(Established {
                transport,
                events,
                handshake,
            }),
            Err(e) => {
                transport.disconnect().await;
                Err(e)
            }
        }
    }

    async fn pump(
        &self,
        generation: u64,
        credential: &Credential,
        established: Established,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PumpExit {
        let Established {
            transport,
            mut events,
            handshake,
        } = established;
        let mut watchdog = PingWatchdog::new(handshake.ping_interval, handshake.ping_timeout);

        let exit = loop {
            let deadline = watchdog.deadline();
            let event = tokio::select! {
                biased;
                _ = shutdown.changed() => break PumpExit::Shutdown,
                _ = sleep_until(deadline) => {
                    break PumpExit::Failed(format!("no ping from server within {:?}", watchdog.window()));
                }
                event = events.recv() => event,
            };
            let frame = match event {
                Some(TransportEvent::Message(frame)) => frame,
                Some(TransportEvent::Connected) => continue,
                Some(TransportEvent::Disconnected) | None => {
                    break PumpExit::Failed("transport closed".to_string());
                }
            };
            // Any inbound frame, pings included, re-reads the session first so
            // nothing is forwarded for a credential that was withdrawn.
            if !self.credential_current(credential) {
                break PumpExit::CredentialWithdrawn;
            }
            if let Some(exit) = self
                .handle_frame(generation, &frame, transport.as_ref(), &mut watchdog)
                .await
            {
                break exit;
            }
        };

        transport.disconnect().await;
        exit
    }

    async fn handle_frame(
        &self,
        generation: u64,
        frame: &str,
        transport: &dyn Transport,
        watchdog: &mut PingWatchdog,
    ) -> Option<PumpExit> {
        let packet = match EnginePacket::parse(frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(target: "Connection", "Ignoring malformed frame: {e}");
                return None;
            }
        };
        match packet {
            EnginePacket::Ping => {
                if let Err(e) = watchdog.answer_ping(transport).await {
                    return Some(PumpExit::Failed(format!("failed to answer ping: {e}")));
                }
                None
            }
            EnginePacket::Message(inner) => self.handle_socket_packet(generation, &inner),
            EnginePacket::Close => Some(PumpExit::Failed("server closed the transport".to_string())),
            EnginePacket::Open(_) | EnginePacket::Pong | EnginePacket::Upgrade | EnginePacket::Noop => {
                None
            }
        }
    }

    fn handle_socket_packet(&self, generation: u64, packet: &str) -> Option<PumpExit> {
        match SocketPacket::parse(packet) {
            Ok(SocketPacket::Event { name, args, .. }) if name == NOTIFICATION_EVENT => {
                let Some(payload) = args.into_iter().next() else {
                    warn!(target: "Connection", "Notification event without payload");
                    return None;
                };
                match serde_json::from_value::<Notification>(payload) {
                    Ok(notification) => {
                        debug!(target: "Connection", "Received notification {}", notification.id);
                        self.forward(generation, notification);
                    }
                    Err(e) => warn!(target: "Connection", "Discarding malformed notification: {e}"),
                }
                None
            }
            Ok(SocketPacket::Event { name, .. }) => {
                debug!(target: "Connection", "Ignoring unhandled event {name:?}");
                None
            }
            Ok(SocketPacket::Disconnect { .. }) => Some(PumpExit::ServerClosed),
            Ok(SocketPacket::ConnectError { payload, .. }) => {
                Some(PumpExit::Failed(connect_error_reason(&payload)))
            }
            Ok(other) => {
                trace!(target: "Connection", "Ignoring {other:?}");
                None
            }
            Err(e) => {
                warn!(target: "Connection", "Ignoring malformed socket packet: {e}");
                None
            }
        }
    }
}

fn settle(ready: &mut Option<oneshot::Sender<ConnectOutcome>>, outcome: ConnectOutcome) {
    if let Some(tx) = ready.take() {
        let _ = tx.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::session::TokenSession;
    use crate::transport::mock::{MockTransportFactory, Script, Then};
    use crate::types::events::{EventKind, Subscription};
    use crate::types::notification::{AuthResponse, User};
    use std::time::Duration;

    const PUSHED: &str = r#"42["notification",{"id":"n-9","userId":"u-1","title":"Build green","message":"main is deployable","read":false,"createdAt":"2024-05-01T10:15:00Z"}]"#;

    fn fast_config() -> ClientConfig {
        ClientConfig::new("http://mock.local")
            .with_reconnect(ReconnectPolicy {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                max_attempts: 3,
            })
            .with_connect_timeout(Duration::from_millis(500))
    }

    fn setup(
        factory: MockTransportFactory,
        config: ClientConfig,
    ) -> (Arc<ConnectionManager>, Arc<MockTransportFactory>, Arc<TokenSession>) {
        let factory = Arc::new(factory);
        let session = Arc::new(TokenSession::with_token("t-1"));
        let manager = ConnectionManager::new(config, factory.clone(), session.clone());
        (manager, factory, session)
    }

    fn record_statuses(manager: &ConnectionManager) -> (Arc<StdMutex<Vec<ConnectionStatus>>>, Subscription) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = manager.events().subscribe(EventKind::Status, move |event| {
            if let Event::StatusChanged(status) = event {
                sink.lock().unwrap().push(*status);
            }
            Ok(())
        });
        (seen, subscription)
    }

    fn signed_in(token: &str) -> AuthResponse {
        AuthResponse {
            access_token: token.to_string(),
            user: User {
                id: "u-1".to_string(),
                email: "u1@example.com".to_string(),
                name: None,
                picture: None,
                google_id: "g-1".to_string(),
                created_at: chrono::Utc::now(),
            },
        }
    }

    async fn wait_for_status(manager: &ConnectionManager, expected: ConnectionStatus) {
        let mut rx = manager.watch_status();
        timeout(Duration::from_secs(2), rx.wait_for(|s| *s == expected))
            .await
            .expect("status reached in time")
            .expect("status channel alive");
    }

    async fn wait_for_len(seen: &StdMutex<Vec<ConnectionStatus>>, len: usize) {
        timeout(Duration::from_secs(2), async {
            while seen.lock().unwrap().len() < len {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("statuses observed in time");
    }

    #[tokio::test]
    async fn connecting_twice_performs_one_handshake() {
        let (manager, factory, _session) =
            setup(MockTransportFactory::new(vec![], Script::hold()), fast_config());

        assert_eq!(manager.connect(Credential::new("t-1")).await, ConnectOutcome::Connected);
        assert_eq!(
            manager.connect(Credential::new("t-1")).await,
            ConnectOutcome::AlreadyConnected
        );

        assert_eq!(factory.dials(), 1);
        assert_eq!(factory.handshakes(), 1);
        assert_eq!(factory.sent_frames()[0], r#"40{"token":"t-1"}"#);
        assert!(manager.is_connected());
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_connection() {
        let (manager, factory, _session) =
            setup(MockTransportFactory::new(vec![], Script::hold()), fast_config());

        let (a, b) = tokio::join!(
            manager.connect(Credential::new("t-1")),
            manager.connect(Credential::new("t-1"))
        );

        let mut outcomes = vec![a, b];
        outcomes.sort_by_key(|o| *o == ConnectOutcome::Connected);
        assert_eq!(outcomes, vec![ConnectOutcome::AlreadyConnected, ConnectOutcome::Connected]);
        assert_eq!(factory.handshakes(), 1);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn repeated_failures_collapse_into_one_error_status() {
        let scripts = vec![Script::drop_after(vec![]), Script::Refuse, Script::Refuse];
        let (manager, factory, _session) =
            setup(MockTransportFactory::new(scripts, Script::hold()), fast_config());
        let (seen, _sub) = record_statuses(&manager);

        assert_eq!(manager.connect(Credential::new("t-1")).await, ConnectOutcome::Connected);
        wait_for_len(&seen, 4).await;
        sleep(Duration::from_millis(30)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connected,
                ConnectionStatus::Error,
                ConnectionStatus::Connected,
            ]
        );
        assert_eq!(factory.dials(), 4);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn pushed_notifications_are_forwarded() {
        let pushes = vec![
            r#"42["typing",{}]"#.to_string(),
            r#"42["notification",{"id":"broken"}]"#.to_string(),
            "4garbage".to_string(),
            PUSHED.to_string(),
        ];
        let scripts = vec![Script::Accept {
            pushes,
            then: Then::Hold,
        }];
        let (manager, _factory, _session) =
            setup(MockTransportFactory::new(scripts, Script::hold()), fast_config());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = manager.events().subscribe(EventKind::Notification, move |event| {
            if let Event::NotificationReceived(n) = event {
                tx.send(n.as_ref().clone())?;
            }
            Ok(())
        });

        manager.connect(Credential::new("t-1")).await;
        let received = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("notification in time")
            .expect("channel open");

        assert_eq!(received.id, "n-9");
        assert_eq!(received.title, "Build green");
        assert!(rx.try_recv().is_err());
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn exhausted_retries_settle_in_error() {
        let (manager, factory, _session) =
            setup(MockTransportFactory::new(vec![], Script::Refuse), fast_config());

        assert_eq!(manager.connect(Credential::new("t-1")).await, ConnectOutcome::GaveUp);

        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert_eq!(factory.dials(), 4);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(factory.dials(), 4);
    }

    #[tokio::test]
    async fn connect_after_giving_up_starts_fresh() {
        let (manager, factory, _session) = setup(
            MockTransportFactory::new(vec![Script::Refuse; 4], Script::hold()),
            fast_config(),
        );

        assert_eq!(manager.connect(Credential::new("t-1")).await, ConnectOutcome::GaveUp);
        assert_eq!(manager.connect(Credential::new("t-1")).await, ConnectOutcome::Connected);
        assert_eq!(factory.dials(), 5);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_during_backoff_prevents_reconnection() {
        let config = fast_config().with_reconnect(ReconnectPolicy {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(200),
            max_attempts: 3,
        });
        let (manager, factory, _session) =
            setup(MockTransportFactory::new(vec![Script::Refuse], Script::hold()), config);

        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(Credential::new("t-1")).await })
        };
        wait_for_status(&manager, ConnectionStatus::Error).await;

        manager.disconnect().await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(connecting.await.unwrap(), ConnectOutcome::Cancelled);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(factory.dials(), 1);
    }

    #[tokio::test]
    async fn disconnect_mid_handshake_cancels() {
        let (manager, factory, _session) =
            setup(MockTransportFactory::new(vec![Script::Stall], Script::hold()), fast_config());

        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(Credential::new("t-1")).await })
        };
        timeout(Duration::from_secs(2), async {
            while factory.handshakes() == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handshake started");

        manager.disconnect().await;
        assert_eq!(connecting.await.unwrap(), ConnectOutcome::Cancelled);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(factory.dials(), 1);
    }

    #[tokio::test]
    async fn disconnect_releases_subscriptions_and_is_idempotent() {
        let (manager, _factory, _session) =
            setup(MockTransportFactory::new(vec![], Script::hold()), fast_config());
        manager.disconnect().await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        let (_seen, _sub) = record_statuses(&manager);
        manager.connect(Credential::new("t-1")).await;
        assert_eq!(manager.events().subscriber_count(EventKind::Status), 1);

        manager.disconnect().await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(manager.events().subscriber_count(EventKind::Status), 0);

        manager.disconnect().await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn rejected_handshake_respects_session_decision() {
        let factory = Arc::new(MockTransportFactory::new(
            vec![],
            Script::Reject("invalid token".to_string()),
        ));
        let session = Arc::new(TokenSession::with_token("t-1").give_up_on_rejection(true));
        let manager = ConnectionManager::new(fast_config(), factory.clone(), session);

        assert_eq!(manager.connect(Credential::new("t-1")).await, ConnectOutcome::GaveUp);
        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert_eq!(factory.dials(), 1);
    }

    #[tokio::test]
    async fn rejected_handshake_is_retried_by_default() {
        let scripts = vec![Script::Reject("token not yet valid".to_string())];
        let (manager, factory, _session) =
            setup(MockTransportFactory::new(scripts, Script::hold()), fast_config());
        let (seen, _sub) = record_statuses(&manager);

        assert_eq!(manager.connect(Credential::new("t-1")).await, ConnectOutcome::Connected);
        assert_eq!(factory.dials(), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionStatus::Disconnected,
                ConnectionStatus::Error,
                ConnectionStatus::Connected,
            ]
        );
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn server_disconnect_is_final() {
        let scripts = vec![Script::Accept {
            pushes: vec![],
            then: Then::ServerDisconnect,
        }];
        let (manager, factory, _session) =
            setup(MockTransportFactory::new(scripts, Script::hold()), fast_config());

        assert_eq!(manager.connect(Credential::new("t-1")).await, ConnectOutcome::Connected);
        wait_for_status(&manager, ConnectionStatus::Disconnected).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(factory.dials(), 1);
    }

    #[tokio::test]
    async fn server_pings_are_answered() {
        let scripts = vec![Script::Accept {
            pushes: vec!["2".to_string()],
            then: Then::Hold,
        }];
        let (manager, factory, _session) =
            setup(MockTransportFactory::new(scripts, Script::hold()), fast_config());

        manager.connect(Credential::new("t-1")).await;
        timeout(Duration::from_secs(2), async {
            while !factory.sent_frames().iter().any(|f| f == "3") {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pong sent");
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn silent_server_trips_the_watchdog() {
        let factory = MockTransportFactory::new(vec![], Script::hold()).with_ping(30, 30);
        let (manager, factory, _session) = setup(factory, fast_config());
        let (seen, _sub) = record_statuses(&manager);

        manager.connect(Credential::new("t-1")).await;
        timeout(Duration::from_secs(2), async {
            while factory.dials() < 2 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reconnected after ping timeout");

        assert!(seen.lock().unwrap().contains(&ConnectionStatus::Error));
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn stalled_handshake_times_out_and_retries() {
        let config = fast_config().with_connect_timeout(Duration::from_millis(50));
        let (manager, factory, _session) =
            setup(MockTransportFactory::new(vec![Script::Stall], Script::hold()), config);

        assert_eq!(manager.connect(Credential::new("t-1")).await, ConnectOutcome::Connected);
        assert_eq!(factory.dials(), 2);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn withdrawn_credential_stops_reconnecting() {
        let config = fast_config().with_reconnect(ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            max_attempts: 3,
        });
        let (manager, factory, session) =
            setup(MockTransportFactory::new(vec![Script::Refuse], Script::hold()), config);

        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(Credential::new("t-1")).await })
        };
        wait_for_status(&manager, ConnectionStatus::Error).await;
        session.sign_out();

        assert_eq!(connecting.await.unwrap(), ConnectOutcome::Cancelled);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(factory.dials(), 1);
    }

    #[tokio::test]
    async fn new_credential_replaces_the_live_connection() {
        let (manager, factory, session) =
            setup(MockTransportFactory::new(vec![], Script::hold()), fast_config());
        let (seen, _sub) = record_statuses(&manager);

        assert_eq!(manager.connect(Credential::new("t-1")).await, ConnectOutcome::Connected);
        session.sign_in(signed_in("t-2"));
        assert_eq!(manager.connect(Credential::new("t-2")).await, ConnectOutcome::Connected);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connected,
            ]
        );
        assert_eq!(factory.dials(), 2);
        let presented: Vec<String> = factory
            .sent_frames()
            .into_iter()
            .filter(|f| f.starts_with("40"))
            .collect();
        assert_eq!(presented, [r#"40{"token":"t-1"}"#, r#"40{"token":"t-2"}"#]);
        assert_eq!(
            manager.connect(Credential::new("t-2")).await,
            ConnectOutcome::AlreadyConnected
        );
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn credential_withdrawn_while_connected_ends_on_next_ping() {
        let (manager, factory, session) =
            setup(MockTransportFactory::new(vec![], Script::hold()), fast_config());

        assert_eq!(manager.connect(Credential::new("t-1")).await, ConnectOutcome::Connected);
        session.sign_out();
        assert!(factory.push("2").await);

        wait_for_status(&manager, ConnectionStatus::Disconnected).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(factory.dials(), 1);
        assert!(!factory.sent_frames().iter().any(|f| f == "3"));
    }

    #[tokio::test]
    async fn push_after_withdrawal_is_not_forwarded() {
        let (manager, factory, session) =
            setup(MockTransportFactory::new(vec![], Script::hold()), fast_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = manager.events().subscribe(EventKind::Notification, move |event| {
            if let Event::NotificationReceived(n) = event {
                tx.send(n.id.clone())?;
            }
            Ok(())
        });

        manager.connect(Credential::new("t-1")).await;
        session.sign_out();
        assert!(factory.push(PUSHED).await);

        wait_for_status(&manager, ConnectionStatus::Disconnected).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(factory.dials(), 1);
    }
}
