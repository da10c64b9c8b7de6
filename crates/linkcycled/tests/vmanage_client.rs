//! vManage Client Tests
//!
//! Runs `VManageClient` against a local axum server that speaks the subset
//! of the vManage API the client uses: form login with a session cookie,
//! XSRF token, device inventory and per-device BFD state.

use axum::extract::{Form, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use linkcycle_common::{MonitorError, SdwanCredentials, SiteId};
use linkcycled::vmanage::VManageClient;
use linkcycled::TelemetryClient;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Fake vManage
// ============================================================================

#[derive(Default)]
struct FakeVManage {
    session: Mutex<Option<String>>,
    logins: Mutex<u32>,
    devices: Mutex<Vec<Value>>,
    /// system-ip -> (status, sessions)
    bfd: Mutex<HashMap<String, (StatusCode, Vec<Value>)>>,
    /// system-ip -> time to sit on the BFD request
    delays: Mutex<HashMap<String, Duration>>,
    xsrf_seen: Mutex<Vec<String>>,
}

impl FakeVManage {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        if let Some(token) = headers.get("X-XSRF-TOKEN").and_then(|v| v.to_str().ok()) {
            self.xsrf_seen.lock().unwrap().push(token.to_string());
        }
        let session = match self.session.lock().unwrap().clone() {
            Some(s) => s,
            None => return false,
        };
        headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(|c| c.contains(&format!("JSESSIONID={}", session)))
            .unwrap_or(false)
    }

    fn expire_session(&self) {
        *self.session.lock().unwrap() = None;
    }

    fn delay_device(&self, device: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(device.to_string(), delay);
    }

    fn set_bfd(&self, device: &str, status: StatusCode, sessions: &[(&str, &str)]) {
        let sessions = sessions
            .iter()
            .map(|(color, state)| json!({"local-color": color, "state": state, "system-ip": device}))
            .collect();
        self.bfd
            .lock()
            .unwrap()
            .insert(device.to_string(), (status, sessions));
    }
}

async fn login(
    State(fake): State<Arc<FakeVManage>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let ok = form.get("j_username").map(String::as_str) == Some("admin")
        && form.get("j_password").map(String::as_str) == Some("pw");
    if !ok {
        return (StatusCode::OK, "<html>login failed</html>").into_response();
    }

    let mut logins = fake.logins.lock().unwrap();
    *logins += 1;
    let id = format!("sess-{}", *logins);
    *fake.session.lock().unwrap() = Some(id.clone());
    (
        [(header::SET_COOKIE, format!("JSESSIONID={}; Path=/", id))],
        "",
    )
        .into_response()
}

async fn token(State(fake): State<Arc<FakeVManage>>, headers: HeaderMap) -> Response {
    if !fake.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    "xsrf-123".into_response()
}

async fn devices(State(fake): State<Arc<FakeVManage>>, headers: HeaderMap) -> Response {
    if !fake.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let data = fake.devices.lock().unwrap().clone();
    Json(json!({ "data": data })).into_response()
}

async fn bfd_state(
    State(fake): State<Arc<FakeVManage>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !fake.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let device = query.get("deviceId").cloned().unwrap_or_default();
    let delay = fake.delays.lock().unwrap().get(&device).copied();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    match fake.bfd.lock().unwrap().get(&device).cloned() {
        Some((status, sessions)) if status == StatusCode::OK => {
            Json(json!({ "data": sessions })).into_response()
        }
        Some((status, _)) => status.into_response(),
        None => Json(json!({ "data": [] })).into_response(),
    }
}

async fn serve(fake: Arc<FakeVManage>) -> SocketAddr {
    let app = Router::new()
        .route("/j_security_check", post(login))
        .route("/dataservice/client/token", get(token))
        .route("/dataservice/device", get(devices))
        .route("/dataservice/device/bfd/state/device", get(bfd_state))
        .with_state(fake);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn device(site: &str, personality: &str, reachability: &str, ip: &str) -> Value {
    json!({
        "site-id": site,
        "personality": personality,
        "reachability": reachability,
        "system-ip": ip,
    })
}

async fn setup(password: &str) -> (Arc<FakeVManage>, VManageClient) {
    setup_with_timeout(password, Duration::from_secs(2)).await
}

async fn setup_with_timeout(
    password: &str,
    request_timeout: Duration,
) -> (Arc<FakeVManage>, VManageClient) {
    let fake = Arc::new(FakeVManage::default());
    *fake.devices.lock().unwrap() = vec![
        device("1", "vmanage", "reachable", "1.1.1.1"),
        device("100", "vedge", "reachable", "10.0.0.1"),
        device("100", "vedge", "reachable", "10.0.0.2"),
        device("200", "vedge", "unreachable", "10.0.1.1"),
    ];
    let addr = serve(Arc::clone(&fake)).await;

    let credentials = SdwanCredentials {
        url: format!("http://{}", addr),
        username: "admin".to_string(),
        password: password.to_string(),
    };
    let client = VManageClient::new(
        credentials,
        [SiteId(100), SiteId(200)],
        request_timeout,
        false,
    )
    .unwrap();
    (fake, client)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_login_and_inventory() {
    let (fake, client) = setup("pw").await;

    client.login().await.unwrap();
    let count = client.refresh_inventory().await.unwrap();

    assert_eq!(count, 2);
    assert_eq!(
        client.devices(SiteId(100)).await,
        vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]
    );
    assert!(client.devices(SiteId(200)).await.is_empty());
    assert!(fake.xsrf_seen.lock().unwrap().iter().all(|t| t == "xsrf-123"));
    assert!(!fake.xsrf_seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_bad_credentials_rejected() {
    let (_fake, client) = setup("wrong").await;
    let err = client.login().await.unwrap_err();
    assert!(err.to_string().contains("JSESSIONID"), "{:#}", err);
}

#[tokio::test]
async fn test_one_session_up_is_healthy() {
    let (fake, client) = setup("pw").await;
    fake.set_bfd("10.0.0.1", StatusCode::OK, &[("biz-internet", "down")]);
    fake.set_bfd(
        "10.0.0.2",
        StatusCode::OK,
        &[("biz-internet", "up"), ("mpls", "down")],
    );
    client.login().await.unwrap();
    client.refresh_inventory().await.unwrap();

    assert_eq!(client.get_link_health(SiteId(100), "biz-internet").await, Ok(true));
}

#[tokio::test]
async fn test_all_sessions_down_is_unhealthy() {
    let (fake, client) = setup("pw").await;
    fake.set_bfd("10.0.0.1", StatusCode::OK, &[("biz-internet", "down")]);
    fake.set_bfd(
        "10.0.0.2",
        StatusCode::OK,
        &[("biz-internet", "down"), ("mpls", "up")],
    );
    client.login().await.unwrap();
    client.refresh_inventory().await.unwrap();

    assert_eq!(client.get_link_health(SiteId(100), "biz-internet").await, Ok(false));
}

#[tokio::test]
async fn test_device_error_without_up_is_unavailable() {
    let (fake, client) = setup("pw").await;
    fake.set_bfd("10.0.0.1", StatusCode::OK, &[("biz-internet", "down")]);
    fake.set_bfd("10.0.0.2", StatusCode::INTERNAL_SERVER_ERROR, &[]);
    client.login().await.unwrap();
    client.refresh_inventory().await.unwrap();

    let err = client
        .get_link_health(SiteId(100), "biz-internet")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MonitorError::TelemetryUnavailable { site_id: SiteId(100), .. }
    ));
}

#[tokio::test]
async fn test_site_without_devices_is_unavailable() {
    let (_fake, client) = setup("pw").await;
    client.login().await.unwrap();
    client.refresh_inventory().await.unwrap();

    let err = client
        .get_link_health(SiteId(200), "biz-internet")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no reachable edge devices"));
}

#[tokio::test]
async fn test_expired_session_logs_in_again() {
    let (fake, client) = setup("pw").await;
    fake.set_bfd("10.0.0.1", StatusCode::OK, &[("biz-internet", "up")]);
    client.login().await.unwrap();
    client.refresh_inventory().await.unwrap();
    assert_eq!(*fake.logins.lock().unwrap(), 1);

    fake.expire_session();
    assert_eq!(client.get_link_health(SiteId(100), "biz-internet").await, Ok(true));
    assert_eq!(*fake.logins.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_inventory_loaded_on_first_query() {
    let (fake, client) = setup("pw").await;
    fake.set_bfd("10.0.0.2", StatusCode::OK, &[("biz-internet", "up")]);
    client.login().await.unwrap();

    // No explicit refresh_inventory: the first query discovers devices
    assert_eq!(client.get_link_health(SiteId(100), "biz-internet").await, Ok(true));
    assert_eq!(client.devices(SiteId(100)).await.len(), 2);
}

#[tokio::test]
async fn test_hung_device_does_not_hide_healthy_peer() {
    let (fake, client) = setup_with_timeout("pw", Duration::from_secs(1)).await;
    fake.set_bfd("10.0.0.1", StatusCode::OK, &[("biz-internet", "down")]);
    fake.delay_device("10.0.0.1", Duration::from_secs(5));
    fake.set_bfd("10.0.0.2", StatusCode::OK, &[("biz-internet", "up")]);
    client.login().await.unwrap();
    client.refresh_inventory().await.unwrap();

    // The monitor allows twice the per-request limit for one query
    let verdict = tokio::time::timeout(
        Duration::from_secs(2),
        client.get_link_health(SiteId(100), "biz-internet"),
    )
    .await
    .expect("query ran past the tick budget");
    assert_eq!(verdict, Ok(true));
}

#[tokio::test]
async fn test_hung_device_with_down_peer_is_unavailable() {
    let (fake, client) = setup_with_timeout("pw", Duration::from_secs(1)).await;
    fake.delay_device("10.0.0.1", Duration::from_secs(5));
    fake.set_bfd("10.0.0.2", StatusCode::OK, &[("biz-internet", "down")]);
    client.login().await.unwrap();
    client.refresh_inventory().await.unwrap();

    let verdict = tokio::time::timeout(
        Duration::from_secs(2),
        client.get_link_health(SiteId(100), "biz-internet"),
    )
    .await
    .expect("query ran past the tick budget");
    assert!(matches!(
        verdict,
        Err(MonitorError::TelemetryUnavailable { site_id: SiteId(100), .. })
    ));
}
