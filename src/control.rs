//! Control API
//!
//! REST endpoints for app lifecycle management: deploy, status, activate,
//! deactivate, remove and list. The `fnctl` CLI talks to this API.

use crate::registry::ApplicationRecord;
use crate::service::{AppService, ServiceResponse, ServiceStatus};
use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Longest app name; app names are DNS labels
const MAX_APP_NAME_LEN: usize = 63;

#[derive(Debug, Clone)]
pub struct ControlApiConfig {
    pub bind_addr: SocketAddr,
    pub auth_token: String,
    /// Upper bound on a deploy request, activation wait included
    pub deploy_timeout: Duration,
    /// Largest deploy request body
    pub max_artifact_bytes: usize,
}

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Request to deploy an app
#[derive(Debug, Deserialize, Serialize)]
pub struct DeployRequest {
    pub name: String,
    /// Base64-encoded deployment package
    pub archive: String,
}

/// Check that `name` can be used as a subdomain label
pub fn validate_app_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() || name.len() > MAX_APP_NAME_LEN {
        return Err(format!("App name must be 1-{} characters", MAX_APP_NAME_LEN));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err("App name may only contain lowercase letters, digits and '-'".to_string());
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err("App name cannot start or end with '-'".to_string());
    }
    Ok(())
}

pub struct ControlApi {
    config: ControlApiConfig,
    service: Arc<AppService>,
    shutdown_rx: watch::Receiver<bool>,
    /// Cancelled on shutdown; aborts in-flight activation waits
    cancel: CancellationToken,
}

impl ControlApi {
    pub fn new(
        config: ControlApiConfig,
        service: Arc<AppService>,
        shutdown_rx: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            service,
            shutdown_rx,
            cancel,
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.config.auth_token
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "Control API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream, addr).await {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, _addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Control connection error: {}", e))?;

        Ok(())
    }

    fn check_auth<B>(&self, req: &Request<B>) -> bool {
        req.headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|auth| {
                // Support "Bearer <token>" format
                auth.strip_prefix("Bearer ")
                    .unwrap_or(auth)
                    .eq(&self.config.auth_token)
            })
            .unwrap_or(false)
    }

    pub async fn handle_request<B>(self: Arc<Self>, req: Request<B>) -> Result<Response<Full<Bytes>>, hyper::Error>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "Control API request");

        // Health check - no auth required
        if path == "/health" && method == Method::GET {
            return Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#));
        }

        // Version - no auth required
        if path == "/version" && method == Method::GET {
            let version = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version.to_string()));
        }

        if !self.check_auth(&req) {
            warn!(%path, "Unauthorized control API request");
            return Ok(json_error(StatusCode::UNAUTHORIZED, "unauthorized"));
        }

        let response = match (method, path.as_str()) {
            (Method::GET, "/apps") => self.list_apps(),
            (Method::POST, "/apps/deploy") => self.deploy_app(req).await,
            (method, path) if path.starts_with("/apps/") => {
                let rest = path.strip_prefix("/apps/").unwrap_or_default();
                match (method, rest.split_once('/')) {
                    (Method::GET, Some((name, "status"))) => self.app_status(name),
                    (Method::POST, Some((name, "activate"))) => self.set_active(name, true),
                    (Method::POST, Some((name, "deactivate"))) => self.set_active(name, false),
                    (Method::POST, Some((name, "remove"))) => self.remove_app(name).await,
                    _ => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
                }
            }
            _ => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
        };

        Ok(response.unwrap_or_else(|e| {
            error!(error = %e, "Control API error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Internal error: {}", e))
        }))
    }

    fn list_apps(&self) -> Result<Response<Full<Bytes>>> {
        match self.service.list() {
            Ok(apps) => {
                let response = ApiResponse::ok(apps);
                Ok(json_response(StatusCode::OK, serde_json::to_string(&response)?))
            }
            Err(status) => Ok(service_error(status, false)),
        }
    }

    async fn deploy_app<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let body = match Limited::new(req.into_body(), self.config.max_artifact_bytes)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return Ok(json_error(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("Deploy request exceeds {} bytes", self.config.max_artifact_bytes),
                ));
            }
            Err(e) => return Err(anyhow::anyhow!("Failed to read request body: {}", e)),
        };

        let deploy_req: DeployRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return Ok(json_error(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e)));
            }
        };

        if let Err(msg) = validate_app_name(&deploy_req.name) {
            return Ok(json_error(StatusCode::BAD_REQUEST, msg));
        }

        let artifact = match BASE64.decode(deploy_req.archive.trim()) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                return Ok(json_error(StatusCode::BAD_REQUEST, format!("Invalid base64 archive: {}", e)));
            }
        };

        info!(app = %deploy_req.name, artifact_bytes = artifact.len(), "Deploying app");

        // Shutdown and the deploy deadline both end the activation wait
        let cancel = self.cancel.child_token();
        let deadline = cancel.clone();
        let timeout = self.config.deploy_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            deadline.cancel();
        });

        let response = self.service.deploy(&deploy_req.name, artifact, &cancel).await;
        timer.abort();

        service_response(response, true)
    }

    fn app_status(&self, name: &str) -> Result<Response<Full<Bytes>>> {
        if let Err(msg) = validate_app_name(name) {
            return Ok(json_error(StatusCode::BAD_REQUEST, msg));
        }
        service_response(self.service.get_by_name(name), false)
    }

    fn set_active(&self, name: &str, active: bool) -> Result<Response<Full<Bytes>>> {
        if let Err(msg) = validate_app_name(name) {
            return Ok(json_error(StatusCode::BAD_REQUEST, msg));
        }
        let response = if active {
            self.service.activate(name)
        } else {
            self.service.deactivate(name)
        };
        service_response(response, false)
    }

    async fn remove_app(&self, name: &str) -> Result<Response<Full<Bytes>>> {
        if let Err(msg) = validate_app_name(name) {
            return Ok(json_error(StatusCode::BAD_REQUEST, msg));
        }
        info!(app = %name, "Removing app");
        service_response(self.service.remove(name).await, false)
    }
}

// ==================== Helper Functions ====================

/// HTTP status for a service outcome. Deploy reports caller-side problems as 400.
fn http_status(status: ServiceStatus, deploy: bool) -> StatusCode {
    match status {
        ServiceStatus::Success => StatusCode::OK,
        ServiceStatus::NotFound if deploy => StatusCode::BAD_REQUEST,
        ServiceStatus::NotFound => StatusCode::NOT_FOUND,
        ServiceStatus::AlreadyExists | ServiceStatus::ConcurrentUpdate => StatusCode::CONFLICT,
        ServiceStatus::UnknownError if deploy => StatusCode::BAD_REQUEST,
        ServiceStatus::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn status_message(status: ServiceStatus) -> &'static str {
    match status {
        ServiceStatus::Success => "ok",
        ServiceStatus::NotFound => "App not found",
        ServiceStatus::AlreadyExists => "App already exists",
        ServiceStatus::ConcurrentUpdate => "Another update of this app is in progress",
        ServiceStatus::UnknownError => "Operation failed, see server logs",
    }
}

fn service_error(status: ServiceStatus, deploy: bool) -> Response<Full<Bytes>> {
    json_error(http_status(status, deploy), status_message(status))
}

fn service_response(response: ServiceResponse, deploy: bool) -> Result<Response<Full<Bytes>>> {
    if !response.is_success() {
        return Ok(service_error(response.status, deploy));
    }
    let body: ApiResponse<Option<ApplicationRecord>> = ApiResponse::ok(response.app);
    Ok(json_response(StatusCode::OK, serde_json::to_string(&body)?))
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response")
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let response: ApiResponse<()> = ApiResponse::error(message);
    let body = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"success":false,"error":"internal error"}"#.to_string());
    json_response(status, body)
}
