//! Auth gate and rate-limit behavior over the real router.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode, header};
use tower::ServiceExt;

use c3::api::{AppState, build_router};
use c3::auth::{ActivationRateLimiter, AuthState, JwtKeys};
use c3::pty::PtyMultiplexer;
use c3::sessions::{MockLauncher, SessionManager};
use c3::store::SqliteStore;
use c3::tunnel::TunnelManager;

struct TestApi {
    router: axum::Router,
    keys: JwtKeys,
    _dir: tempfile::TempDir,
}

async fn build_api(auth_required: bool) -> TestApi {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let store = Arc::new(
        SqliteStore::new(&dir.path().join("test.db"))
            .await
            .expect("store"),
    );
    store
        .set_auth_required(auth_required)
        .await
        .expect("set auth");

    let auth_config = store.get_auth_config().await.expect("auth config");
    let keys = JwtKeys::from_hex_secret(&auth_config.jwt_secret).expect("keys");

    let (lifecycle_tx, _lifecycle_rx) = tokio::sync::mpsc::channel(16);
    let notify = Arc::new(tokio::sync::Notify::new());
    let tunnel = Arc::new(TunnelManager::new(Arc::clone(&store)));
    let mux = Arc::new(PtyMultiplexer::new(dir.path().join("scrollback"), lifecycle_tx));
    let launcher = Arc::new(MockLauncher::new());
    launcher.set_mux(Arc::clone(&mux));
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&store),
        Arc::clone(&mux),
        Arc::clone(&tunnel),
        launcher as Arc<dyn c3::sessions::AgentLauncher>,
        Arc::clone(&notify),
        PathBuf::from("/tmp/.c3-hooks/settings.json"),
    ));

    let auth_state = AuthState {
        store: Arc::clone(&store),
        keys: keys.clone(),
        limiter: Arc::new(ActivationRateLimiter::new()),
        auth_required,
        tls_active: false,
    };
    let state = AppState {
        store,
        sessions,
        mux,
        tunnel,
        auth: auth_state,
        dispatch_notify: notify,
        http_client: AppState::proxy_client(),
    };

    TestApi {
        router: build_router(state),
        keys,
        _dir: dir,
    }
}

fn request(method: &str, uri: &str, peer: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let mut request = builder.body(body).expect("request");
    let addr: SocketAddr = peer.parse().expect("peer addr");
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

fn valid_cookie(keys: &JwtKeys) -> String {
    let now = chrono::Utc::now();
    let token = keys
        .mint(&c3::auth::LicensePayload {
            email: "dev@example.com".to_owned(),
            plan: "pro".to_owned(),
            max_sessions: 4,
            expires_at: now + chrono::Duration::days(30),
            issued_at: now,
        })
        .expect("mint");
    format!("agentide_session={token}")
}

#[tokio::test]
async fn protected_routes_reject_without_cookie() {
    let api = build_api(true).await;
    let response = api
        .router
        .oneshot(request("GET", "/api/sessions", "198.51.100.7:1000", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn protected_routes_pass_with_valid_cookie() {
    let api = build_api(true).await;
    let mut req = request("GET", "/api/sessions", "198.51.100.7:1000", None);
    req.headers_mut().insert(
        header::COOKIE,
        valid_cookie(&api.keys).parse().expect("header"),
    );
    let response = api.router.oneshot(req).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn auth_disabled_means_open_access() {
    let api = build_api(false).await;
    let response = api
        .router
        .oneshot(request("GET", "/api/sessions", "198.51.100.7:1000", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn auth_status_never_rejects() {
    for auth_required in [false, true] {
        let api = build_api(auth_required).await;
        let response = api
            .router
            .oneshot(request("GET", "/api/auth/status", "198.51.100.7:1000", None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
            .await
            .expect("body");
        let json: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(json["authRequired"], auth_required);
        assert!(json.get("authenticated").is_some(), "declared shape");
    }
}

#[tokio::test]
async fn invalid_activation_is_unauthorized() {
    let api = build_api(true).await;
    let response = api
        .router
        .oneshot(request(
            "POST",
            "/api/auth/activate",
            "198.51.100.7:1000",
            Some(serde_json::json!({ "licenseKey": "bogus.key" })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sixth_failed_activation_from_one_ip_is_rate_limited() {
    let api = build_api(true).await;

    for attempt in 0..5 {
        let response = api
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/api/auth/activate",
                "203.0.113.9:2000",
                Some(serde_json::json!({ "licenseKey": format!("bogus.{attempt}") })),
            ))
            .await
            .expect("response");
        assert_eq!(
            response.status(),
            StatusCode::UNAUTHORIZED,
            "attempt {attempt} is a plain rejection"
        );
    }

    let response = api
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/auth/activate",
            "203.0.113.9:2000",
            Some(serde_json::json!({ "licenseKey": "bogus.6" })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
        .await
        .expect("body");
    let json: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
    let retry_after = json["retryAfter"].as_u64().expect("retryAfter present");
    assert!(
        retry_after > 0 && retry_after <= 900,
        "retry hint within the window, got {retry_after}"
    );

    // A different address is unaffected.
    let response = api
        .router
        .oneshot(request(
            "POST",
            "/api/auth/activate",
            "203.0.113.10:2000",
            Some(serde_json::json!({ "licenseKey": "bogus.other" })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_clears_the_cookie() {
    let api = build_api(true).await;
    let response = api
        .router
        .oneshot(request("POST", "/api/auth/logout", "198.51.100.7:1000", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("Set-Cookie present")
        .to_str()
        .expect("ascii");
    assert!(set_cookie.contains("agentide_session="));
    assert!(set_cookie.contains("Max-Age=0"), "cookie is expired");
}

#[tokio::test]
async fn hooks_endpoint_rejects_non_loopback_when_auth_required() {
    let api = build_api(true).await;
    let body = serde_json::json!({
        "sessionId": uuid::Uuid::new_v4(),
        "claudeSessionId": "abc123",
    });

    let response = api
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/hooks/event",
            "198.51.100.7:1000",
            Some(body.clone()),
        ))
        .await
        .expect("response");
    assert_eq!(
        response.status(),
        StatusCode::FORBIDDEN,
        "remote callers have no business on the hook surface"
    );

    // Loopback passes the guard (and then 404s on the unknown session).
    let response = api
        .router
        .oneshot(request("POST", "/api/hooks/event", "127.0.0.1:5000", Some(body)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn security_headers_are_on_every_response() {
    let api = build_api(false).await;
    let response = api
        .router
        .oneshot(request("GET", "/api/auth/status", "127.0.0.1:1000", None))
        .await
        .expect("response");
    assert_eq!(
        response.headers().get("X-Content-Type-Options").expect("set"),
        "nosniff"
    );
    assert_eq!(response.headers().get("X-Frame-Options").expect("set"), "DENY");
}
