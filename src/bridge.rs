//! Translation between HTTP and function invocations
//!
//! Pure functions used by the proxy: resolving the tenant from a request,
//! building the invocation event, and turning the function's proxy response
//! back into HTTP parts.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{HeaderMap, Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tracing::debug;

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Strip the port, validate and lowercase a host value.
/// IPv6 literals keep their brackets.
pub fn normalize_host(value: &str) -> Option<String> {
    if let Some(rest) = value.strip_prefix('[') {
        let (literal, _port) = rest.split_once(']')?;
        return literal
            .parse::<Ipv6Addr>()
            .ok()
            .map(|ip| format!("[{}]", ip));
    }

    let hostname = value.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen and dot only; keeps junk out of logs and lookups
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

/// Tenant name of a normalized host: its first label
pub fn tenant_from_host(host: &str) -> Option<&str> {
    host.split('.').next().filter(|label| !label.is_empty())
}

/// The host a request was addressed to.
///
/// A present `Host` header is authoritative, even when invalid. Without one
/// the URI authority (HTTP/2 `:authority`) is used, then the address the
/// connection was accepted on.
pub fn resolve_host(headers: &HeaderMap, uri: &Uri, local_addr: SocketAddr) -> Option<String> {
    if let Some(host) = headers.get(HOST) {
        return host.to_str().ok().and_then(normalize_host);
    }
    if let Some(authority) = uri.authority() {
        return normalize_host(authority.host());
    }
    match local_addr.ip() {
        IpAddr::V6(ip) => Some(format!("[{}]", ip)),
        ip => normalize_host(&ip.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub request_id: String,
    pub domain_name: String,
}

/// Event handed to the function, in the API-gateway proxy format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationEvent {
    pub path: String,
    pub http_method: String,
    /// `None` (JSON null) when the request has no query parameters
    pub query_string_parameters: Option<BTreeMap<String, String>>,
    pub headers: BTreeMap<String, String>,
    /// `None` (JSON null) when the request body is empty
    pub body: Option<String>,
    pub is_base64_encoded: bool,
    pub request_context: RequestContext,
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Decode a query string; the first occurrence of a key wins
pub fn parse_query(query: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(decode_component(key))
            .or_insert_with(|| decode_component(value));
    }
    params
}

pub fn build_event(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
    request_id: &str,
    domain_name: &str,
) -> InvocationEvent {
    let mut single_headers = BTreeMap::new();
    for (name, value) in headers {
        single_headers
            .entry(name.as_str().to_string())
            .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let query = uri.query().map(parse_query).filter(|q| !q.is_empty());

    let (body, is_base64_encoded) = if body.is_empty() {
        (None, false)
    } else {
        match std::str::from_utf8(body) {
            Ok(text) => (Some(text.to_string()), false),
            Err(_) => (Some(BASE64.encode(body)), true),
        }
    };

    InvocationEvent {
        path: uri.path().to_string(),
        http_method: method.as_str().to_string(),
        query_string_parameters: query,
        headers: single_headers,
        body,
        is_base64_encoded,
        request_context: RequestContext {
            request_id: request_id.to_string(),
            domain_name: domain_name.to_string(),
        },
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ResponseError {
    #[error("function payload is not a proxy response: {0}")]
    Malformed(String),
    #[error("function returned an invalid status code: {0}")]
    InvalidStatus(String),
    #[error("function body is not valid base64: {0}")]
    InvalidBase64(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionResponse {
    status_code: Value,
    #[serde(default)]
    headers: Option<Map<String, Value>>,
    #[serde(default)]
    multi_value_headers: Option<Map<String, Value>>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    is_base64_encoded: Option<bool>,
}

/// HTTP parts produced by a function
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

fn parse_status(value: &Value) -> Result<StatusCode, ResponseError> {
    let code = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    };
    code.filter(|c| (100..=599).contains(c))
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| ResponseError::InvalidStatus(value.to_string()))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn append_header(headers: &mut HeaderMap, name: &str, value: &Value) {
    let Some(value) = scalar_to_string(value) else {
        debug!(header = name, "Skipping non-scalar header value from function");
        return;
    };
    let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(&value),
    ) else {
        debug!(header = name, "Skipping invalid header from function");
        return;
    };
    // The server frames the body itself
    if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
        return;
    }
    headers.append(name, value);
}

/// Parse a function's `{statusCode, headers, body}` payload
pub fn parse_function_response(payload: &[u8]) -> Result<ProxyResponse, ResponseError> {
    let response: FunctionResponse =
        serde_json::from_slice(payload).map_err(|e| ResponseError::Malformed(e.to_string()))?;

    let status = parse_status(&response.status_code)?;

    let mut headers = HeaderMap::new();
    for (name, value) in response.headers.iter().flatten() {
        append_header(&mut headers, name, value);
    }
    for (name, values) in response.multi_value_headers.iter().flatten() {
        match values {
            Value::Array(values) => {
                for value in values {
                    append_header(&mut headers, name, value);
                }
            }
            other => append_header(&mut headers, name, other),
        }
    }

    let text = match response.body {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    };
    let body = if response.is_base64_encoded.unwrap_or(false) {
        BASE64
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(|e| ResponseError::InvalidBase64(e.to_string()))?
    } else {
        Bytes::from(text)
    };

    Ok(ProxyResponse { status, headers, body })
}
