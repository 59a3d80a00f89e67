//! The forwarding handler.
//!
//! Every request other than `GET /health` is sent upstream through the payments
//! middleware. The upstream is the `target` query parameter, else the target of
//! the client's MCP session, else the configured default. Request bodies are
//! buffered, since a paid retry has to send them twice; response bodies are
//! streamed.

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::json;
use std::sync::Arc;
use url::Url;
use x402_treasurer::PaymentReceipt;
use x402_treasurer_types::proto::PAYMENT_HEADERS;

use crate::error::ProxyError;
use crate::session::{MCP_SESSION_ID_HEADER, SessionRegistry, session_reset_body};

/// Path the proxy is mounted at for MCP clients; requests to it go to the target as is.
pub const MCP_MOUNT: &str = "/mcp";

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct AppState {
    http: ClientWithMiddleware,
    default_target: Option<Url>,
    sessions: Arc<SessionRegistry>,
    max_body_bytes: usize,
}

impl AppState {
    pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

    pub fn new(
        http: ClientWithMiddleware,
        default_target: Option<Url>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            http,
            default_target,
            sessions,
            max_body_bytes: Self::DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(get_health))
        .fallback(forward)
}

pub fn router(state: Arc<AppState>) -> Router {
    routes().with_state(state)
}

async fn get_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Where one request goes: `base` is the target as named by the client or
/// configuration, `url` adds the inbound path and query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub base: Url,
    pub url: Url,
}

/// Resolves the upstream URL of `uri`, removing its `target` query parameter.
pub fn resolve_target(uri: &Uri, fallback: Option<&Url>) -> Result<Target, ProxyError> {
    let mut explicit = None;
    let mut rest = Vec::new();
    if let Some(query) = uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "target" && explicit.is_none() {
                explicit = Some(value.into_owned());
            } else {
                rest.push((key.into_owned(), value.into_owned()));
            }
        }
    }
    let base = match explicit {
        Some(target) => Url::parse(&target)?,
        None => fallback.cloned().ok_or(ProxyError::MissingTarget)?,
    };

    let mut url = base.clone();
    let path = uri.path();
    let at_mount = path == "/" || path.trim_end_matches('/') == MCP_MOUNT;
    if !at_mount {
        let joined = format!("{}{}", base.path().trim_end_matches('/'), path);
        url.set_path(&joined);
    }
    if !rest.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &rest {
            pairs.append_pair(key, value);
        }
    }
    Ok(Target { base, url })
}

/// Whether `name` is hop-by-hop, named in `Connection`, or managed by the transport.
fn is_transport_header(name: &HeaderName, connection_tokens: &[String]) -> bool {
    let name = name.as_str();
    HOP_BY_HOP_HEADERS.contains(&name)
        || name == "host"
        || name == "content-length"
        || connection_tokens.iter().any(|token| token == name)
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

fn is_payment_header(name: &HeaderName) -> bool {
    PAYMENT_HEADERS
        .iter()
        .any(|header| name.as_str().eq_ignore_ascii_case(header))
}

/// Headers passed between client and upstream, in either direction.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let tokens = connection_tokens(headers);
    headers
        .iter()
        .filter(|(name, _)| !is_transport_header(name, &tokens) && !is_payment_header(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

#[tracing::instrument(name = "x402.proxy.forward", skip_all, fields(method = %method, path = %uri.path()))]
async fn forward(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ProxyError> {
    let client_session = header_str(&headers, MCP_SESSION_ID_HEADER);
    let bound = client_session
        .as_deref()
        .and_then(|id| state.sessions.touch(id));
    let fallback = bound
        .as_ref()
        .map(|session| &session.target)
        .or(state.default_target.as_ref());
    let target = resolve_target(&uri, fallback)?;

    let body = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(ProxyError::RequestBody)?;
    let mut outbound = forwardable_headers(&headers);
    if let Some(session) = &bound
        && let Ok(upstream_id) = HeaderValue::from_str(&session.upstream_session_id)
    {
        outbound.insert(MCP_SESSION_ID_HEADER, upstream_id);
    }

    tracing::debug!(upstream = %target.url, "Forwarding request");
    let response = state
        .http
        .request(method.clone(), target.url.clone())
        .headers(outbound)
        .body(body)
        .send()
        .await?;

    // The payments middleware hands back a 402 only when it could not read it.
    if response.status() == StatusCode::PAYMENT_REQUIRED {
        return Err(ProxyError::MalformedChallenge);
    }
    let paid = response.extensions().get::<PaymentReceipt>().is_some();
    let upstream_session = header_str(response.headers(), MCP_SESSION_ID_HEADER);

    match (&client_session, &bound, &upstream_session) {
        (Some(client_id), Some(session), Some(upstream_id))
            if upstream_id != &session.upstream_session_id =>
        {
            tracing::info!(
                session = %client_id,
                paid,
                "Upstream replaced the session, asking client to reinitialize"
            );
            state.sessions.remove(client_id);
            return Ok((StatusCode::NOT_FOUND, Json(session_reset_body())).into_response());
        }
        (Some(client_id), Some(_), _) if response.status() == StatusCode::NOT_FOUND => {
            state.sessions.remove(client_id);
        }
        (None, _, Some(upstream_id)) => {
            state
                .sessions
                .bind(upstream_id, target.base.clone(), upstream_id);
        }
        _ => {}
    }
    if method == Method::DELETE
        && let Some(client_id) = &client_session
    {
        state.sessions.remove(client_id);
    }

    let status = response.status();
    let headers = forwardable_headers(response.headers());
    let mut proxied = Response::new(Body::from_stream(response.bytes_stream()));
    *proxied.status_mut() = status;
    *proxied.headers_mut() = headers;
    Ok(proxied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_target() -> Url {
        Url::parse("http://upstream.local/base/").unwrap()
    }

    #[test]
    fn test_target_parameter_is_removed() {
        let uri: Uri = "/v1/items?target=http%3A%2F%2Fapi.local%2Froot&limit=5"
            .parse()
            .unwrap();
        let target = resolve_target(&uri, Some(&default_target())).unwrap();
        assert_eq!(target.base.as_str(), "http://api.local/root");
        assert_eq!(target.url.as_str(), "http://api.local/root/v1/items?limit=5");
    }

    #[test]
    fn test_mount_path_goes_to_target_unchanged() {
        let uri: Uri = "/mcp".parse().unwrap();
        let target = resolve_target(&uri, Some(&default_target())).unwrap();
        assert_eq!(target.url, default_target());
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(
            resolve_target(&uri, Some(&default_target())).unwrap().url,
            default_target()
        );
    }

    #[test]
    fn test_missing_and_invalid_target() {
        let uri: Uri = "/x".parse().unwrap();
        assert!(matches!(
            resolve_target(&uri, None),
            Err(ProxyError::MissingTarget)
        ));
        let uri: Uri = "/x?target=not%20a%20url".parse().unwrap();
        assert!(matches!(
            resolve_target(&uri, None),
            Err(ProxyError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_forwardable_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("proxy.local"));
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("x-payment", HeaderValue::from_static("forged"));
        headers.insert("payment-response", HeaderValue::from_static("receipt"));
        headers.insert("content-length", HeaderValue::from_static("12"));
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));
        headers.insert("mcp-session-id", HeaderValue::from_static("s1"));
        let forwarded = forwardable_headers(&headers);
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded.get("accept").unwrap(), "text/event-stream");
        assert_eq!(forwarded.get("mcp-session-id").unwrap(), "s1");
    }
}
