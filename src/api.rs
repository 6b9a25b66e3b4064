//! Request/response side of the notification service.

use crate::config::ClientConfig;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::session::SessionGate;
use crate::types::notification::{AuthResponse, CreateNotification, Notification};
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request was not authorized")]
    Unauthorized,
    #[error("server responded with status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}

/// Shared request plumbing: base URL, bearer header, JSON handling and the
/// 401 hook.
struct ApiCore {
    config: ClientConfig,
    http: Arc<dyn HttpClient>,
    session: Arc<dyn SessionGate>,
}

impl ApiCore {
    fn request(&self, request: HttpRequest) -> HttpRequest {
        let request = request.with_header("Content-Type", "application/json");
        match self.session.current_credential() {
            Some(credential) => request.with_header("Authorization", credential.bearer()),
            None => request,
        }
    }

    fn with_json<T: Serialize>(request: HttpRequest, body: &T) -> Result<HttpRequest, ApiError> {
        Ok(request.with_body(serde_json::to_vec(body)?))
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let (method, url) = (request.method.clone(), request.url.clone());
        debug!(target: "Api", "{method} {url}");
        let response = self.http.execute(self.request(request)).await?;

        if response.status_code == 401 {
            warn!(target: "Api", "{method} {url} was unauthorized, clearing session");
            self.session.unauthorized();
            return Err(ApiError::Unauthorized);
        }
        if !response.is_success() {
            warn!(target: "Api", "{method} {url} failed with status {}", response.status_code);
            return Err(ApiError::Status {
                code: response.status_code,
                body: response.body_text(),
            });
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: HttpRequest) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        Ok(serde_json::from_slice(&response.body)?)
    }
}

/// Fetch, create and acknowledge notifications.
#[derive(Clone)]
pub struct NotificationsApi {
    core: Arc<ApiCore>,
}

impl NotificationsApi {
    pub fn new(
        config: ClientConfig,
        http: Arc<dyn HttpClient>,
        session: Arc<dyn SessionGate>,
    ) -> Self {
        Self {
            core: Arc::new(ApiCore {
                config,
                http,
                session,
            }),
        }
    }

    /// The authoritative list for the signed-in user, newest first.
    pub async fn fetch_all(&self) -> Result<Vec<Notification>, ApiError> {
        let url = self.core.config.api_url("/notifications");
        self.core.send_json(HttpRequest::get(url)).await
    }

    pub async fn create(&self, notification: &CreateNotification) -> Result<Notification, ApiError> {
        let url = self.core.config.api_url("/notifications");
        let request = ApiCore::with_json(HttpRequest::post(url), notification)?;
        self.core.send_json(request).await
    }

    pub async fn mark_read(&self, id: &str) -> Result<Notification, ApiError> {
        let path = format!("/notifications/{}/read", urlencoding::encode(id));
        let url = self.core.config.api_url(&path);
        self.core.send_json(HttpRequest::patch(url)).await
    }
}

pub struct AuthApi {
    core: ApiCore,
}

impl AuthApi {
    pub fn new(
        config: ClientConfig,
        http: Arc<dyn HttpClient>,
        session: Arc<dyn SessionGate>,
    ) -> Self {
        Self {
            core: ApiCore {
                config,
                http,
                session,
            },
        }
    }

    /// Exchanges a Google ID token for a service access token.
    pub async fn login_with_google(&self, id_token: &str) -> Result<AuthResponse, ApiError> {
        let url = self.core.config.api_url("/auth/google");
        let request = ApiCore::with_json(HttpRequest::post(url), &json!({ "idToken": id_token }))?;
        self.core.send_json(request).await
    }
}
