//! Ties the realtime channel, the REST API and the local cache together for
//! one signed-in user.

use crate::api::{ApiError, NotificationsApi};
use crate::config::ClientConfig;
use crate::connection::{ConnectOutcome, ConnectionManager};
use crate::http::HttpClient;
use crate::notification_cache::NotificationCache;
use crate::session::SessionGate;
use crate::transport::TransportFactory;
use crate::types::events::{Event, EventKind, Subscription};
use crate::types::notification::{CreateNotification, Notification};
use log::{info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no signed-in session")]
    NotAuthenticated,
    #[error(transparent)]
    Api(#[from] ApiError),
}

pub struct NotificationSync {
    connection: Arc<ConnectionManager>,
    api: NotificationsApi,
    cache: Arc<NotificationCache>,
    session: Arc<dyn SessionGate>,
    subscription: Mutex<Option<Subscription>>,
}

impl NotificationSync {
    pub fn new(
        config: ClientConfig,
        transport_factory: Arc<dyn TransportFactory>,
        http: Arc<dyn HttpClient>,
        session: Arc<dyn SessionGate>,
    ) -> Self {
        let connection = ConnectionManager::new(config.clone(), transport_factory, session.clone());
        let api = NotificationsApi::new(config, http, session.clone());
        Self::from_parts(connection, api, Arc::new(NotificationCache::new()), session)
    }

    pub fn from_parts(
        connection: Arc<ConnectionManager>,
        api: NotificationsApi,
        cache: Arc<NotificationCache>,
        session: Arc<dyn SessionGate>,
    ) -> Self {
        Self {
            connection,
            api,
            cache,
            session,
            subscription: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<NotificationCache> {
        &self.cache
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn api(&self) -> &NotificationsApi {
        &self.api
    }

    /// Subscribes the cache to pushes, opens the realtime channel and loads
    /// the authoritative list.
    pub async fn start(&self) -> Result<ConnectOutcome, SyncError> {
        let credential = self
            .session
            .current_credential()
            .ok_or(SyncError::NotAuthenticated)?;

        {
            // A disconnect made directly on the connection clears the bus, so
            // a held handle may be stale. Always register afresh.
            let mut subscription = self.subscription.lock().await;
            if let Some(previous) = subscription.take() {
                previous.unsubscribe();
            }
            let cache = self.cache.clone();
            *subscription = Some(self.connection.events().subscribe(
                EventKind::Notification,
                move |event| {
                    if let Event::NotificationReceived(notification) = event {
                        cache.insert_newest(notification.as_ref().clone());
                    }
                    Ok(())
                },
            ));
        }

        let outcome = self.connection.connect(credential).await;
        info!(target: "Sync", "Realtime channel: {outcome:?}");
        self.refresh().await?;
        Ok(outcome)
    }

    /// Replaces the cache with the server's list.
    pub async fn refresh(&self) -> Result<usize, SyncError> {
        let notifications = self.guard(self.api.fetch_all().await).await?;
        let count = notifications.len();
        self.cache.replace_all(notifications);
        info!(target: "Sync", "Loaded {count} notifications");
        Ok(count)
    }

    /// Acknowledges on the server, then mirrors the change locally. On failure
    /// the cache is left untouched.
    pub async fn mark_read(&self, id: &str) -> Result<(), SyncError> {
        self.guard(self.api.mark_read(id).await).await?;
        self.cache.mark_read(id);
        Ok(())
    }

    /// Creates on the server only. The server echoes the new item over the
    /// realtime channel, which is what inserts it into the cache.
    pub async fn create(&self, notification: &CreateNotification) -> Result<Notification, SyncError> {
        Ok(self.guard(self.api.create(notification).await).await?)
    }

    pub async fn stop(&self) {
        if let Some(subscription) = self.subscription.lock().await.take() {
            subscription.unsubscribe();
        }
        self.connection.disconnect().await;
        self.cache.clear();
        info!(target: "Sync", "Stopped");
    }

    async fn guard<T>(&self, result: Result<T, ApiError>) -> Result<T, ApiError> {
        if result.as_ref().is_err_and(ApiError::is_unauthorized) {
            warn!(target: "Sync", "Session is no longer authorized, stopping");
            self.stop().await;
        }
        result
    }
}
