use crate::backend::{BackendError, InvocationResult};
use crate::bridge::{build_event, parse_function_response, resolve_host, tenant_from_host};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::registry::AppStatus;
use crate::service::{AppService, ServiceStatus};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_LENGTH, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Limits applied to every proxied request
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 6 * 1024 * 1024,
        }
    }
}

/// Routes requests to the function of the app named by the Host subdomain
pub struct ProxyServer {
    bind_addr: SocketAddr,
    service: Arc<AppService>,
    settings: Arc<ProxySettings>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        service: Arc<AppService>,
        settings: ProxySettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            service,
            settings: Arc::new(settings),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let service = Arc::clone(&self.service);
                            let settings = Arc::clone(&self.settings);
                            let local_addr = stream.local_addr().unwrap_or(self.bind_addr);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, local_addr, service, settings).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    client_addr: SocketAddr,
    local_addr: SocketAddr,
    service: Arc<AppService>,
    settings: Arc<ProxySettings>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let service = Arc::clone(&service);
        let settings = Arc::clone(&settings);
        async move { handle_request(req, service, settings, client_addr, local_addr).await }
    });

    // HTTP/2 arrives as h2c; the tenant then comes from :authority
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Serve one proxied request.
///
/// Generic over the body so it can be driven without a socket.
pub async fn handle_request<B>(
    req: Request<B>,
    service: Arc<AppService>,
    settings: Arc<ProxySettings>,
    client_addr: SocketAddr,
    local_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (mut parts, body) = req.into_parts();

    if parts.headers.get(HOST).is_some_and(|h| h.to_str().is_err()) {
        return Ok(json_error_response(
            ProxyErrorCode::InvalidHost,
            "Host header is not valid text",
        ));
    }

    // A host that cannot name a tenant is just another unknown app
    let resolved = resolve_host(&parts.headers, &parts.uri, local_addr)
        .and_then(|host| {
            let app = tenant_from_host(&host)?.to_string();
            Some((app, host))
        });
    let Some((app_name, host)) = resolved else {
        debug!(request_id, "Host does not name a tenant");
        return Ok(json_error_response(
            ProxyErrorCode::UnknownApp,
            "Unknown or inactive app",
        ));
    };

    debug!(app = %app_name, method = %parts.method, uri = %parts.uri, request_id, "Incoming request");

    // Only ACTIVE apps are routable; everything else looks the same from outside
    let lookup = service.get_by_name(&app_name);
    let routable = lookup.status == ServiceStatus::Success
        && lookup.app.as_ref().map(|a| a.status) == Some(AppStatus::Active);
    if !routable {
        debug!(app = %app_name, status = ?lookup.status, "No active app for host");
        return Ok(json_error_response(
            ProxyErrorCode::UnknownApp,
            "Unknown or inactive app",
        ));
    }

    let declared_len = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > settings.max_body_bytes) {
        return Ok(payload_too_large(settings.max_body_bytes));
    }

    let body = match Limited::new(body, settings.max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Ok(payload_too_large(settings.max_body_bytes));
        }
        Err(e) => {
            debug!(app = %app_name, error = %e, "Failed to read request body");
            return Ok(json_error_response(
                ProxyErrorCode::InternalError,
                "Failed to read request body",
            ));
        }
    };

    // Overwrite rather than append: this proxy is the first trusted hop
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        parts.headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        parts.headers.insert(X_FORWARDED_FOR, value);
    }
    parts
        .headers
        .insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let event = build_event(&parts.method, &parts.uri, &parts.headers, &body, &request_id, &host);
    let payload = match serde_json::to_vec(&event) {
        Ok(payload) => Bytes::from(payload),
        Err(e) => {
            error!(app = %app_name, error = %e, "Failed to serialize invocation event");
            return Ok(json_error_response(
                ProxyErrorCode::InternalError,
                "Failed to build invocation event",
            ));
        }
    };

    let functions = service.functions();
    let result = tokio::time::timeout(settings.request_timeout, functions.invoke(&app_name, payload)).await;

    let mut response = match result {
        Ok(Ok(InvocationResult::Payload(payload))) => match parse_function_response(&payload) {
            Ok(parsed) => {
                let mut response = Response::new(Full::new(parsed.body).map_err(|never| match never {}).boxed());
                *response.status_mut() = parsed.status;
                *response.headers_mut() = parsed.headers;
                response
            }
            Err(e) => {
                warn!(app = %app_name, request_id, error = %e, "Invalid function response");
                json_error_response(
                    ProxyErrorCode::InvalidFunctionResponse,
                    "Function returned an invalid response",
                )
            }
        },
        Ok(Ok(InvocationResult::FunctionError { error, .. })) => {
            error!(app = %app_name, request_id, function_error = %error, "Function invocation failed");
            json_error_response(ProxyErrorCode::FunctionError, "Function invocation failed")
        }
        Ok(Err(e)) => {
            // Log detailed error internally, return generic message externally
            match e {
                BackendError::NotFound(_) => {
                    error!(app = %app_name, request_id, "App is active but its function is missing")
                }
                other => error!(app = %app_name, request_id, error = %other, "Failed to invoke function"),
            }
            json_error_response(ProxyErrorCode::InvocationFailed, "Failed to invoke function")
        }
        Err(_) => {
            warn!(
                app = %app_name,
                request_id,
                timeout_secs = settings.request_timeout.as_secs(),
                "Request timed out"
            );
            json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    settings.request_timeout.as_secs()
                ),
            )
        }
    };

    // A request id set by the function is passed through untouched
    if !response.headers().contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
    }
    Ok(response)
}

fn payload_too_large(limit: usize) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_error_response(
        ProxyErrorCode::PayloadTooLarge,
        format!("Request body exceeds {} bytes", limit),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{payload, MemoryProvider, Operation};
    use crate::backend::{ClientSettings, FunctionClient};
    use crate::registry::MemoryRegistry;
    use hyper::StatusCode;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        service: Arc<AppService>,
        provider: Arc<MemoryProvider>,
        settings: Arc<ProxySettings>,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(MemoryProvider::new());
        let client = FunctionClient::new(provider.clone(), ClientSettings::default());
        let service = AppService::new(Arc::new(MemoryRegistry::new()), Arc::new(client));
        Fixture {
            service: Arc::new(service),
            provider,
            settings: Arc::new(ProxySettings {
                request_timeout: Duration::from_millis(200),
                max_body_bytes: 64,
            }),
        }
    }

    async fn deploy(f: &Fixture, name: &str) {
        let response = f
            .service
            .deploy(name, Bytes::from_static(b"zip"), &CancellationToken::new())
            .await;
        assert!(response.is_success());
    }

    fn client() -> SocketAddr {
        "192.0.2.10:51000".parse().unwrap()
    }

    fn local() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    async fn send(f: &Fixture, req: Request<Full<Bytes>>) -> (StatusCode, hyper::HeaderMap, Bytes) {
        let response = handle_request(req, f.service.clone(), f.settings.clone(), client(), local())
            .await
            .unwrap();
        let (parts, body) = response.into_parts();
        (parts.status, parts.headers, body.collect().await.unwrap().to_bytes())
    }

    fn get(host: &str, path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(path)
            .header("host", host)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_active_app_is_invoked() {
        let f = fixture();
        deploy(&f, "alpha").await;
        f.provider.register_handler("alpha", |_| {
            payload(json!({"statusCode": 200, "body": "success"}))
        });

        let (status, headers, body) = send(&f, get("alpha.example.com", "/")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"success"));
        assert!(headers.get(X_REQUEST_ID).is_some());
    }

    #[tokio::test]
    async fn test_unknown_and_inactive_apps_are_404_without_invoke() {
        let f = fixture();
        deploy(&f, "alpha").await;
        f.service.deactivate("alpha");
        deploy(&f, "beta").await;
        f.service.remove("beta").await;

        for host in ["alpha.example.com", "beta.example.com", "ghost.example.com"] {
            let (status, headers, _) = send(&f, get(host, "/")).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "host {}", host);
            assert_eq!(headers.get("x-proxy-error").unwrap(), "UNKNOWN_APP");
        }
        assert_eq!(f.provider.calls(Operation::Invoke), 0);
    }

    #[tokio::test]
    async fn test_host_that_names_no_tenant_is_404() {
        let f = fixture();
        deploy(&f, "alpha").await;

        for host in ["my_app.example.com", ".example.com", "bad_host!", "[::1]:8080"] {
            let (status, headers, _) = send(&f, get(host, "/")).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "host {}", host);
            assert_eq!(headers.get("x-proxy-error").unwrap(), "UNKNOWN_APP");
        }
        assert_eq!(f.provider.calls(Operation::Invoke), 0);
    }

    #[tokio::test]
    async fn test_non_text_host_is_400() {
        let f = fixture();
        let req = Request::builder()
            .uri("/")
            .header("host", HeaderValue::from_bytes(b"caf\xe9.example.com").unwrap())
            .body(Full::new(Bytes::new()))
            .unwrap();

        let (status, headers, _) = send(&f, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(headers.get("x-proxy-error").unwrap(), "INVALID_HOST");
    }

    #[tokio::test]
    async fn test_function_request_id_is_not_overwritten() {
        let f = fixture();
        deploy(&f, "alpha").await;
        f.provider.register_handler("alpha", |_| {
            payload(json!({
                "statusCode": 200,
                "headers": {"x-request-id": "from-fn"},
                "body": "ok"
            }))
        });

        let (status, headers, _) = send(&f, get("alpha.example.com", "/")).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<_> = headers.get_all(X_REQUEST_ID).iter().collect();
        assert_eq!(ids, vec!["from-fn"]);
    }

    #[tokio::test]
    async fn test_function_error_is_400() {
        let f = fixture();
        deploy(&f, "alpha").await;
        f.provider.register_handler("alpha", |_| InvocationResult::FunctionError {
            error: "Unhandled".to_string(),
            payload: Bytes::from_static(br#"{"errorMessage":"boom"}"#),
        });

        let (status, headers, _) = send(&f, get("alpha.example.com", "/")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(headers.get("x-proxy-error").unwrap(), "FUNCTION_ERROR");
    }

    #[tokio::test]
    async fn test_event_contents() {
        let f = fixture();
        deploy(&f, "alpha").await;

        let req = Request::builder()
            .method("POST")
            .uri("/submit?text=abc&text=def")
            .header("host", "Alpha.Example.com:8080")
            .header("x-forwarded-for", "6.6.6.6")
            .header("x-request-id", "req-42")
            .body(Full::new(Bytes::from_static(br#"{"text":"xyz"}"#)))
            .unwrap();
        let (status, headers, _) = send(&f, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get(X_REQUEST_ID).unwrap(), "req-42");

        let event = f.provider.last_event("alpha").unwrap();
        assert_eq!(event["path"], "/submit");
        assert_eq!(event["httpMethod"], "POST");
        assert_eq!(event["queryStringParameters"]["text"], "abc");
        assert_eq!(event["body"], r#"{"text":"xyz"}"#);
        assert_eq!(event["headers"]["x-forwarded-for"], "192.0.2.10");
        assert_eq!(event["headers"]["x-forwarded-proto"], "http");
        assert_eq!(event["headers"]["x-request-id"], "req-42");
        assert_eq!(event["requestContext"]["domainName"], "alpha.example.com");
    }

    #[tokio::test]
    async fn test_function_headers_and_status_pass_through() {
        let f = fixture();
        deploy(&f, "alpha").await;
        f.provider.register_handler("alpha", |_| {
            payload(json!({
                "statusCode": 400,
                "headers": {"content-type": "text/plain"},
                "multiValueHeaders": {"set-cookie": ["a=1", "b=2"]},
                "body": "bad request text"
            }))
        });

        let (status, headers, body) = send(&f, get("alpha.example.com", "/notFound")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(headers.get("x-proxy-error").is_none());
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
        assert_eq!(body, Bytes::from_static(b"bad request text"));
    }

    #[tokio::test]
    async fn test_invalid_function_response_is_502() {
        let f = fixture();
        deploy(&f, "alpha").await;
        f.provider.register_handler("alpha", |_| payload(json!("just a string")));

        let (status, headers, _) = send(&f, get("alpha.example.com", "/")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(headers.get("x-proxy-error").unwrap(), "INVALID_FUNCTION_RESPONSE");
    }

    #[tokio::test]
    async fn test_provider_failure_is_502() {
        let f = fixture();
        deploy(&f, "alpha").await;
        f.provider.fail_next(Operation::Invoke, BackendError::Provider("connection reset".to_string()));

        let (status, headers, _) = send(&f, get("alpha.example.com", "/")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(headers.get("x-proxy-error").unwrap(), "INVOCATION_FAILED");
    }

    #[tokio::test]
    async fn test_slow_function_times_out() {
        let f = fixture();
        deploy(&f, "alpha").await;
        f.provider.set_delay(Operation::Invoke, Duration::from_secs(5));

        let (status, headers, _) = send(&f, get("alpha.example.com", "/")).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(headers.get("x-proxy-error").unwrap(), "REQUEST_TIMEOUT");
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let f = fixture();
        deploy(&f, "alpha").await;

        let req = Request::builder()
            .method("POST")
            .uri("/")
            .header("host", "alpha.example.com")
            .body(Full::new(Bytes::from(vec![b'x'; 65])))
            .unwrap();
        let (status, _, body) = send(&f, req).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        let error: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["code"], "PAYLOAD_TOO_LARGE");
        assert_eq!(f.provider.calls(Operation::Invoke), 0);
    }
}
