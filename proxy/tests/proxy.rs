use alloy_primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
use url::Url;
use wiremock::matchers::{header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use x402_treasurer::ledger::{LocalLedger, SpendLimit};
use x402_treasurer::treasurer::LimitTreasurer;
use x402_treasurer::wallet::{AccountWallet, Wallet};
use x402_treasurer::{Payments, ReqwestWithPayments, ReqwestWithPaymentsBuild};
use x402_treasurer_types::networks::Network;
use x402_treasurer_types::proto::{X_PAYMENT_HEADER, X_PAYMENT_RESPONSE_HEADER};
use x402_proxy::forward::{AppState, router};
use x402_proxy::session::SessionRegistry;

fn challenge_body(amount: u64) -> Value {
    json!({
        "x402Version": 1,
        "error": "X-PAYMENT header is required",
        "accepts": [{
            "scheme": "exact",
            "network": "base-sepolia",
            "maxAmountRequired": amount.to_string(),
            "asset": "USDC",
            "payTo": "0xA",
            "resource": "https://tools.example.com/mcp"
        }]
    })
}

struct Proxy {
    app: Router,
    sessions: Arc<SessionRegistry>,
    ledger: Arc<LocalLedger>,
    payer: Address,
}

fn proxy(default_target: Option<Url>, ceiling: u64) -> Proxy {
    let wallet = Arc::new(AccountWallet::new(PrivateKeySigner::random()));
    let payer = wallet.payer();
    let ledger = Arc::new(LocalLedger::new(SpendLimit::ceiling(ceiling)));
    let treasurer = LimitTreasurer::new(wallet.clone(), ledger.clone());
    let http = reqwest::Client::new()
        .with_payments(Payments::new(wallet, treasurer))
        .build();
    let sessions = Arc::new(SessionRegistry::default());
    let state = Arc::new(AppState::new(http, default_target, sessions.clone()));
    Proxy {
        app: router(state),
        sessions,
        ledger,
        payer,
    }
}

fn mcp_target(server: &MockServer) -> Url {
    Url::parse(&format!("{}/mcp", server.uri())).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn mount_paid_tool(server: &MockServer, amount: u64) {
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header_exists(X_PAYMENT_HEADER))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(X_PAYMENT_RESPONSE_HEADER, "settled")
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}})),
        )
        .with_priority(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(402).set_body_json(challenge_body(amount)))
        .mount(server)
        .await;
}

fn tool_call(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call"}).to_string(),
        ))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let response = proxy(None, 0)
        .app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_missing_target() {
    let response = proxy(None, 0).app.oneshot(tool_call("/mcp")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "missing_target");
}

#[tokio::test]
async fn test_paid_request_is_transparent() {
    let server = MockServer::start().await;
    mount_paid_tool(&server, 1_000).await;
    let proxy = proxy(Some(mcp_target(&server)), 10_000);

    let response = proxy.app.clone().oneshot(tool_call("/mcp")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(X_PAYMENT_RESPONSE_HEADER).is_none());
    let spent = proxy
        .ledger
        .snapshot(proxy.payer, &Network::new("base-sepolia"), "USDC");
    assert_eq!(spent.committed, 1_000u64.into());
    assert_eq!(json_body(response).await["result"]["ok"], true);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].headers.contains_key("x-payment"));
    assert_eq!(requests[0].body, requests[1].body);
}

#[tokio::test]
async fn test_over_limit_is_forbidden() {
    let server = MockServer::start().await;
    mount_paid_tool(&server, 1_000).await;
    let proxy = proxy(Some(mcp_target(&server)), 500);

    let response = proxy.app.clone().oneshot(tool_call("/mcp")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await;
    assert_eq!(body["error"], "payment_denied");
    assert_eq!(body["reason"], "amount_exceeds_limit");
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    let spent = proxy
        .ledger
        .snapshot(proxy.payer, &Network::new("base-sepolia"), "USDC");
    assert_eq!(spent.outstanding_reservations, 0);
}

#[tokio::test]
async fn test_malformed_challenge_is_bad_gateway() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({})))
        .mount(&server)
        .await;
    let proxy = proxy(Some(mcp_target(&server)), 10_000);

    let response = proxy.app.oneshot(tool_call("/mcp")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(json_body(response).await["error"], "malformed_challenge");
}

#[tokio::test]
async fn test_client_payment_header_is_stripped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/free"))
        .respond_with(ResponseTemplate::new(200).set_body_string("free"))
        .mount(&server)
        .await;
    let proxy = proxy(Some(Url::parse(&server.uri()).unwrap()), 0);

    let request = Request::get("/free")
        .header(X_PAYMENT_HEADER, "forged")
        .body(Body::empty())
        .unwrap();
    let response = proxy.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let requests = server.received_requests().await.unwrap();
    assert!(!requests[0].headers.contains_key("x-payment"));
}

#[tokio::test]
async fn test_target_query_and_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .and(query_param("limit", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["a"])))
        .expect(1)
        .mount(&server)
        .await;
    let proxy = proxy(None, 0);

    let target = format!("{}/api", server.uri());
    let uri = format!(
        "/items?target={}&limit=5",
        url::form_urlencoded::byte_serialize(target.as_bytes()).collect::<String>()
    );
    let response = proxy
        .app
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!(["a"]));
}

#[tokio::test]
async fn test_session_bound_then_reset_after_payment() {
    let server = MockServer::start().await;
    // Paid retry of an established session comes back under a new session id.
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", "up-1"))
        .and(header_exists(X_PAYMENT_HEADER))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("mcp-session-id", "up-2")
                .set_body_json(json!({"jsonrpc": "2.0", "id": 2, "result": {}})),
        )
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", "up-1"))
        .respond_with(ResponseTemplate::new(402).set_body_json(challenge_body(10)))
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("mcp-session-id", "up-1")
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
        )
        .with_priority(3)
        .mount(&server)
        .await;

    let proxy = proxy(None, 10_000);
    let target = url::form_urlencoded::byte_serialize(mcp_target(&server).as_str().as_bytes())
        .collect::<String>();

    let initialize = proxy
        .app
        .clone()
        .oneshot(tool_call(&format!("/mcp?target={target}")))
        .await
        .unwrap();
    assert_eq!(initialize.status(), StatusCode::OK);
    assert_eq!(initialize.headers().get("mcp-session-id").unwrap(), "up-1");
    let session = proxy.sessions.get("up-1").unwrap();
    assert_eq!(session.target, mcp_target(&server));

    // Later requests find the target through the session.
    let mut call = tool_call("/mcp");
    call.headers_mut()
        .insert("mcp-session-id", "up-1".parse().unwrap());
    let response = proxy.app.clone().oneshot(call).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["error"]["code"], -32001);
    assert!(proxy.sessions.get("up-1").is_none());
}

#[tokio::test]
async fn test_delete_ends_session() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", "up-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    let proxy = proxy(None, 0);
    proxy.sessions.bind("up-1", mcp_target(&server), "up-1");

    let request = Request::delete("/mcp")
        .header("mcp-session-id", "up-1")
        .body(Body::empty())
        .unwrap();
    let response = proxy.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(proxy.sessions.is_empty());
}

#[tokio::test]
async fn test_unreachable_upstream() {
    let target = Url::parse("http://127.0.0.1:9/mcp").unwrap();
    let response = proxy(Some(target), 0)
        .app
        .oneshot(tool_call("/mcp"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(json_body(response).await["error"], "upstream_unavailable");
}
