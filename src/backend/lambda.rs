//! Lambda-compatible REST provider
//!
//! Talks to the `2015-03-31` functions API (AWS Lambda or an emulator such as
//! LocalStack). Requests are unsigned; point `provider.endpoint` at an
//! emulator or at a signing sidecar.

use super::{BackendError, FunctionDescriptor, FunctionProvider, FunctionSpec, InvocationResult, ReadyState};
use crate::config::{ProviderConfig, ROLE_ENV_VAR};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::body::Bytes;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const FUNCTIONS_PATH: &str = "2015-03-31/functions";
const FUNCTION_ERROR_HEADER: &str = "x-amz-function-error";
const ERROR_TYPE_HEADER: &str = "x-amzn-errortype";

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateFunctionRequest<'a> {
    function_name: &'a str,
    runtime: &'a str,
    role: &'a str,
    handler: &'a str,
    code: FunctionCode,
    timeout: u64,
    architectures: [&'a str; 1],
    package_type: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct FunctionCode {
    zip_file: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UpdateCodeRequest<'a> {
    zip_file: String,
    architectures: [&'a str; 1],
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetFunctionResponse {
    configuration: FunctionConfiguration,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FunctionConfiguration {
    function_name: Option<String>,
    runtime: Option<String>,
    state: Option<String>,
    state_reason: Option<String>,
    last_update_status: Option<String>,
    last_update_status_reason: Option<String>,
}

impl FunctionConfiguration {
    /// Readiness from the `State` / `LastUpdateStatus` pair.
    /// A missing `State` predates the state machine and means active.
    fn ready_state(&self) -> (ReadyState, Option<String>) {
        match (self.state.as_deref(), self.last_update_status.as_deref()) {
            (Some("Failed"), _) => (ReadyState::Failed, self.state_reason.clone()),
            (_, Some("Failed")) => (ReadyState::Failed, self.last_update_status_reason.clone()),
            (Some("Pending"), _) | (_, Some("InProgress")) => (ReadyState::Pending, None),
            (Some("Inactive"), _) => (ReadyState::Inactive, self.state_reason.clone()),
            _ => (ReadyState::Ready, None),
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(alias = "Message")]
    message: Option<String>,
}

/// Provider backed by a Lambda-compatible HTTP API
pub struct LambdaProvider {
    http: reqwest::Client,
    endpoint: String,
    role: String,
    architecture: String,
    function_timeout_secs: u64,
}

impl LambdaProvider {
    pub fn new(config: &ProviderConfig) -> anyhow::Result<Self> {
        let role = config.resolve_role().ok_or_else(|| {
            anyhow!("No execution role configured: set provider.role or {}", ROLE_ENV_VAR)
        })?;

        // Invocations may legitimately run for the whole function timeout
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.function_timeout_secs + 30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            role,
            architecture: config.architecture.clone(),
            function_timeout_secs: config.function_timeout_secs,
        })
    }

    fn functions_url(&self) -> String {
        format!("{}/{}", self.endpoint, FUNCTIONS_PATH)
    }

    fn function_url(&self, name: &str) -> String {
        format!("{}/{}", self.functions_url(), urlencoding::encode(name))
    }
}

fn transport_error(action: &str, name: &str, err: reqwest::Error) -> BackendError {
    BackendError::Provider(format!("{} {} failed: {}", action, name, err))
}

/// Translate a non-success API response
async fn api_error(name: &str, response: reqwest::Response) -> BackendError {
    let status = response.status();
    match status {
        StatusCode::NOT_FOUND => return BackendError::NotFound(name.to_string()),
        StatusCode::CONFLICT => return BackendError::Conflict(name.to_string()),
        _ => {}
    }

    let error_type = response
        .headers()
        .get(ERROR_TYPE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(':').next().unwrap_or(s).to_string());
    let message = response
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|b| b.message);

    let detail = match (error_type, message) {
        (Some(t), Some(m)) => format!("{}: {}", t, m),
        (Some(t), None) => t,
        (None, Some(m)) => m,
        (None, None) => "no details".to_string(),
    };
    warn!(function = name, %status, %detail, "Function API request failed");
    BackendError::Provider(format!("HTTP {} for {}: {}", status.as_u16(), name, detail))
}

#[async_trait]
impl FunctionProvider for LambdaProvider {
    async fn create(&self, spec: &FunctionSpec) -> Result<(), BackendError> {
        let request = CreateFunctionRequest {
            function_name: &spec.name,
            runtime: &spec.runtime,
            role: &self.role,
            handler: &spec.handler,
            code: FunctionCode {
                zip_file: BASE64.encode(&spec.artifact),
            },
            timeout: self.function_timeout_secs,
            architectures: [self.architecture.as_str()],
            package_type: "Zip",
        };

        let response = self
            .http
            .post(self.functions_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("create", &spec.name, e))?;

        if !response.status().is_success() {
            return Err(api_error(&spec.name, response).await);
        }
        debug!(function = %spec.name, "CreateFunction accepted");
        Ok(())
    }

    async fn update(&self, name: &str, artifact: Bytes) -> Result<(), BackendError> {
        let request = UpdateCodeRequest {
            zip_file: BASE64.encode(&artifact),
            architectures: [self.architecture.as_str()],
        };

        let response = self
            .http
            .put(format!("{}/code", self.function_url(name)))
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("update", name, e))?;

        if !response.status().is_success() {
            return Err(api_error(name, response).await);
        }
        debug!(function = name, "UpdateFunctionCode accepted");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<FunctionDescriptor>, BackendError> {
        let response = self
            .http
            .get(self.function_url(name))
            .send()
            .await
            .map_err(|e| transport_error("get", name, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(api_error(name, response).await);
        }

        let body: GetFunctionResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Provider(format!("invalid GetFunction response for {}: {}", name, e)))?;
        let configuration = body.configuration;
        let (state, state_reason) = configuration.ready_state();

        Ok(Some(FunctionDescriptor {
            name: configuration
                .function_name
                .clone()
                .unwrap_or_else(|| name.to_string()),
            state,
            state_reason,
            runtime: configuration.runtime,
        }))
    }

    async fn remove(&self, name: &str) -> Result<(), BackendError> {
        let response = self
            .http
            .delete(self.function_url(name))
            .send()
            .await
            .map_err(|e| transport_error("remove", name, e))?;

        if !response.status().is_success() {
            return Err(api_error(name, response).await);
        }
        Ok(())
    }

    async fn invoke(&self, name: &str, payload: Bytes) -> Result<InvocationResult, BackendError> {
        let response = self
            .http
            .post(format!("{}/invocations", self.function_url(name)))
            .header("x-amz-invocation-type", "RequestResponse")
            .header("content-type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| transport_error("invoke", name, e))?;

        if !response.status().is_success() {
            return Err(api_error(name, response).await);
        }

        let function_error = response
            .headers()
            .get(FUNCTION_ERROR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error("read response of", name, e))?;

        Ok(match function_error {
            Some(error) => InvocationResult::FunctionError { error, payload: body },
            None => InvocationResult::Payload(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderType;
    use http_body_util::{BodyExt, Full};
    use hyper::service::service_fn;
    use hyper::{Method, Request, Response};
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto::Builder as AutoBuilder;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct MockState {
        functions: HashMap<String, Value>,
        requests: Vec<(Method, String, Value)>,
    }

    fn reply(status: u16, body: Value) -> Response<Full<Bytes>> {
        let mut builder = Response::builder().status(status);
        if status == 409 {
            builder = builder.header(ERROR_TYPE_HEADER, "ResourceConflictException:");
        }
        builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
    }

    async fn handle(req: Request<hyper::body::Incoming>, state: Arc<Mutex<MockState>>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let body = req.into_body().collect().await.unwrap().to_bytes();
        let json_body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

        let mut state = state.lock();
        state.requests.push((method.clone(), path.clone(), json_body.clone()));

        let rest = path.trim_start_matches("/2015-03-31/functions");
        let segments: Vec<&str> = rest.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect();

        match (method, segments.as_slice()) {
            (Method::POST, []) => {
                let name = json_body["FunctionName"].as_str().unwrap_or_default().to_string();
                if state.functions.contains_key(&name) {
                    return reply(409, json!({"Type": "User", "message": "Function already exist"}));
                }
                state.functions.insert(name, json_body);
                reply(201, json!({}))
            }
            (Method::GET, [name]) => match state.functions.get(*name) {
                Some(f) => {
                    let runtime = f["Runtime"].clone();
                    let function_state = if *name == "broken" { "Failed" } else { "Active" };
                    reply(200, json!({
                        "Configuration": {
                            "FunctionName": name,
                            "Runtime": runtime,
                            "State": function_state,
                            "StateReason": "handler not found",
                            "LastUpdateStatus": "Successful"
                        }
                    }))
                }
                None => reply(404, json!({"message": "not found"})),
            },
            (Method::PUT, [name, "code"]) => {
                if state.functions.contains_key(*name) {
                    reply(200, json!({}))
                } else {
                    reply(404, json!({"message": "not found"}))
                }
            }
            (Method::DELETE, [name]) => {
                if state.functions.remove(*name).is_some() {
                    reply(204, json!({}))
                } else {
                    reply(404, json!({"message": "not found"}))
                }
            }
            (Method::POST, [name, "invocations"]) => {
                if !state.functions.contains_key(*name) {
                    return reply(404, json!({"message": "not found"}));
                }
                if *name == "crash" {
                    let mut response = reply(200, json!({"errorMessage": "boom"}));
                    response
                        .headers_mut()
                        .insert(FUNCTION_ERROR_HEADER, "Unhandled".parse().unwrap());
                    return response;
                }
                reply(200, json!({"statusCode": 200, "body": json_body.to_string()}))
            }
            _ => reply(500, json!({"message": "unexpected request"})),
        }
    }

    async fn start_mock() -> (SocketAddr, Arc<Mutex<MockState>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(MockState::default()));
        let shared = Arc::clone(&state);

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, hyper::Error>(handle(req, state).await) }
                    });
                    let _ = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (addr, state)
    }

    fn provider_config(endpoint: String) -> ProviderConfig {
        let mut config: ProviderConfig = toml::from_str("").unwrap();
        config.provider_type = ProviderType::Lambda;
        config.endpoint = endpoint;
        config.role = Some("arn:aws:iam::000000000000:role/fn".to_string());
        config
    }

    fn spec(name: &str) -> FunctionSpec {
        FunctionSpec {
            name: name.to_string(),
            runtime: "nodejs20.x".to_string(),
            handler: "index.handler".to_string(),
            artifact: Bytes::from_static(b"PK\x03\x04"),
        }
    }

    #[test]
    fn test_ready_state_mapping() {
        let cfg = |state: Option<&str>, update: Option<&str>| FunctionConfiguration {
            state: state.map(str::to_string),
            state_reason: Some("state reason".to_string()),
            last_update_status: update.map(str::to_string),
            last_update_status_reason: Some("update reason".to_string()),
            ..FunctionConfiguration::default()
        };

        assert_eq!(cfg(Some("Active"), Some("Successful")).ready_state().0, ReadyState::Ready);
        assert_eq!(cfg(None, None).ready_state().0, ReadyState::Ready);
        assert_eq!(cfg(Some("Pending"), None).ready_state().0, ReadyState::Pending);
        assert_eq!(cfg(Some("Active"), Some("InProgress")).ready_state().0, ReadyState::Pending);
        assert_eq!(cfg(Some("Inactive"), None).ready_state().0, ReadyState::Inactive);
        assert_eq!(
            cfg(Some("Failed"), None).ready_state(),
            (ReadyState::Failed, Some("state reason".to_string()))
        );
        assert_eq!(
            cfg(Some("Active"), Some("Failed")).ready_state(),
            (ReadyState::Failed, Some("update reason".to_string()))
        );
    }

    #[test]
    fn test_new_requires_role() {
        let mut config = provider_config("http://127.0.0.1:1".to_string());
        config.role = None;
        std::env::remove_var(ROLE_ENV_VAR);
        assert!(LambdaProvider::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_create_sends_function_definition() {
        let (addr, state) = start_mock().await;
        let provider = LambdaProvider::new(&provider_config(format!("http://{}/", addr))).unwrap();

        provider.create(&spec("alpha")).await.unwrap();

        let state = state.lock();
        let (method, path, body) = &state.requests[0];
        assert_eq!(*method, Method::POST);
        assert_eq!(path, "/2015-03-31/functions");
        assert_eq!(body["FunctionName"], "alpha");
        assert_eq!(body["Runtime"], "nodejs20.x");
        assert_eq!(body["Handler"], "index.handler");
        assert_eq!(body["Role"], "arn:aws:iam::000000000000:role/fn");
        assert_eq!(body["Timeout"], 60);
        assert_eq!(body["Architectures"], json!(["arm64"]));
        assert_eq!(body["PackageType"], "Zip");
        assert_eq!(body["Code"]["ZipFile"], BASE64.encode(b"PK\x03\x04"));
    }

    #[tokio::test]
    async fn test_lifecycle_against_api() {
        let (addr, _state) = start_mock().await;
        let provider = LambdaProvider::new(&provider_config(format!("http://{}", addr))).unwrap();

        assert!(provider.get("alpha").await.unwrap().is_none());
        provider.create(&spec("alpha")).await.unwrap();
        assert_eq!(
            provider.create(&spec("alpha")).await.unwrap_err(),
            BackendError::Conflict("alpha".to_string())
        );

        let descriptor = provider.get("alpha").await.unwrap().unwrap();
        assert_eq!(descriptor.state, ReadyState::Ready);
        assert_eq!(descriptor.runtime.as_deref(), Some("nodejs20.x"));

        provider.update("alpha", Bytes::from_static(b"v2")).await.unwrap();
        assert_eq!(
            provider.update("ghost", Bytes::new()).await.unwrap_err(),
            BackendError::NotFound("ghost".to_string())
        );

        provider.remove("alpha").await.unwrap();
        assert_eq!(
            provider.remove("alpha").await.unwrap_err(),
            BackendError::NotFound("alpha".to_string())
        );
    }

    #[tokio::test]
    async fn test_failed_state_is_reported() {
        let (addr, _state) = start_mock().await;
        let provider = LambdaProvider::new(&provider_config(format!("http://{}", addr))).unwrap();
        provider.create(&spec("broken")).await.unwrap();

        let descriptor = provider.get("broken").await.unwrap().unwrap();
        assert_eq!(descriptor.state, ReadyState::Failed);
        assert_eq!(descriptor.state_reason.as_deref(), Some("handler not found"));
    }

    #[tokio::test]
    async fn test_invoke_payload_and_function_error() {
        let (addr, _state) = start_mock().await;
        let provider = LambdaProvider::new(&provider_config(format!("http://{}", addr))).unwrap();
        provider.create(&spec("alpha")).await.unwrap();
        provider.create(&spec("crash")).await.unwrap();

        let result = provider
            .invoke("alpha", Bytes::from_static(br#"{"path":"/"}"#))
            .await
            .unwrap();
        let InvocationResult::Payload(bytes) = result else {
            panic!("expected payload");
        };
        let response: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(response["statusCode"], 200);

        let result = provider.invoke("crash", Bytes::from_static(b"{}")).await.unwrap();
        assert!(matches!(result, InvocationResult::FunctionError { ref error, .. } if error == "Unhandled"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_provider_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = LambdaProvider::new(&provider_config(format!("http://{}", addr))).unwrap();
        let err = provider.get("alpha").await.unwrap_err();
        assert!(matches!(err, BackendError::Provider(_)));
    }
}
