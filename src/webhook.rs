//! Inbound listener for the OAuth redirect and the SmartThings webhook
//!
//! One listener serves both endpoints:
//!
//! - `GET <redirect path>?code=...` completes the OAuth flow.
//! - `POST` on any path carries a lifecycle envelope. `CONFIRMATION` proves
//!   ownership of the endpoint, `EVENT` delivers device attribute changes,
//!   anything else is acknowledged and ignored.
//!
//! Every other request gets a 404.

use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::storage::InstallationIdentity;
use crate::types::DeviceEvent;
use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEVICE_EVENT: &str = "DEVICE_EVENT";

/// Receives every device event delivered through the webhook
pub trait DeviceEventObserver: Send + Sync {
    fn on_device_event(&self, event: &DeviceEvent);
}

impl<F> DeviceEventObserver for F
where
    F: Fn(&DeviceEvent) + Send + Sync,
{
    fn on_device_event(&self, event: &DeviceEvent) {
        self(event)
    }
}

/// Lifecycle envelope posted by the platform
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "lifecycle")]
pub enum Lifecycle {
    #[serde(rename = "CONFIRMATION", rename_all = "camelCase")]
    Confirmation { confirmation_data: ConfirmationData },
    #[serde(rename = "EVENT", rename_all = "camelCase")]
    Event { event_data: EventData },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationData {
    pub app_id: String,
    #[serde(default)]
    pub installed_app_id: Option<String>,
    pub confirmation_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub event_type: String,
    #[serde(default)]
    pub device_event: Option<DeviceEvent>,
}

/// Parse and validate a webhook body
///
/// A `DEVICE_EVENT` entry without its `deviceEvent` rejects the whole payload.
pub fn parse_lifecycle(body: &[u8]) -> Result<Lifecycle> {
    let lifecycle: Lifecycle = serde_json::from_slice(body)
        .map_err(|e| GatewayError::MalformedWebhookPayload(e.to_string()))?;

    if let Lifecycle::Event { event_data } = &lifecycle {
        for (index, event) in event_data.events.iter().enumerate() {
            if event.event_type == DEVICE_EVENT && event.device_event.is_none() {
                return Err(GatewayError::MalformedWebhookPayload(format!(
                    "events[{}] is a DEVICE_EVENT without deviceEvent",
                    index
                )));
            }
        }
    }

    Ok(lifecycle)
}

#[derive(Clone)]
struct WebhookState {
    gateway: Gateway,
    observer: Arc<dyn DeviceEventObserver>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Router serving the redirect path and the webhook
pub fn router(gateway: Gateway, observer: Arc<dyn DeviceEventObserver>) -> Result<Router> {
    let redirect_path = gateway.config().redirect_path()?;
    let http = reqwest::Client::builder()
        .timeout(gateway.config().request_timeout())
        .build()
        .map_err(|e| GatewayError::Config(format!("Failed to build HTTP client: {}", e)))?;

    let state = WebhookState {
        gateway,
        observer,
        http,
    };

    Ok(Router::new()
        .route(
            &redirect_path,
            get(oauth_callback).post(lifecycle).fallback(not_found),
        )
        .fallback(fallback)
        .with_state(state))
}

async fn fallback(method: Method, state: State<WebhookState>, body: Bytes) -> Response {
    if method == Method::POST {
        lifecycle(state, body).await
    } else {
        not_found().await
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

async fn oauth_callback(
    method: Method,
    State(state): State<WebhookState>,
    query: std::result::Result<Query<CallbackQuery>, QueryRejection>,
) -> Response {
    // GET routes also answer HEAD; only a GET completes the flow
    if method != Method::GET {
        return not_found().await;
    }
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            warn!(error = %rejection, "Unreadable OAuth redirect query");
            return failure_page("The redirect query could not be read.");
        }
    };

    if let Some(error) = query.error {
        warn!(error = %error, description = ?query.error_description, "Authorization was not granted");
        let detail = match query.error_description {
            Some(description) => format!("{}: {}", error, description),
            None => error,
        };
        return failure_page(&detail);
    }

    let Some(code) = query.code.filter(|code| !code.is_empty()) else {
        warn!("OAuth redirect without authorization code");
        return failure_page("The redirect did not contain an authorization code.");
    };

    let gateway = state.gateway.clone();
    tokio::spawn(async move {
        match gateway.get_initial_tokens(&code).await {
            Ok(_) => info!("Initial tokens issued; webhook listener keeps running"),
            Err(e) => error!(error = %e, "Authorization code exchange failed"),
        }
    });

    success_page()
}

async fn lifecycle(State(state): State<WebhookState>, body: Bytes) -> Response {
    match parse_lifecycle(&body) {
        Ok(Lifecycle::Confirmation { confirmation_data }) => {
            confirm(&state, confirmation_data).await
        }
        Ok(Lifecycle::Event { event_data }) => {
            dispatch_events(&state, event_data).await;
            StatusCode::OK.into_response()
        }
        Ok(Lifecycle::Unknown) => {
            debug!("Ignoring unsupported webhook lifecycle");
            StatusCode::OK.into_response()
        }
        Err(e) => {
            warn!(error = %e, "Rejected webhook request");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

async fn confirm(state: &WebhookState, data: ConfirmationData) -> Response {
    info!(app_id = %data.app_id, "Webhook CONFIRMATION received");

    match data.installed_app_id {
        Some(installed_app_id) => {
            let identity = InstallationIdentity {
                app_id: data.app_id,
                installed_app_id,
            };
            if let Err(e) = state.gateway.save_installation(identity).await {
                error!(error = %e, "Failed to persist app installation identity");
            }
        }
        None => warn!("CONFIRMATION carried no installedAppId; keeping the stored identity"),
    }

    let http = state.http.clone();
    let url = data.confirmation_url;
    tokio::spawn(async move {
        match http.get(&url).send().await {
            Ok(response) => info!(status = response.status().as_u16(), "Webhook confirmation acknowledged"),
            Err(e) => error!(error = %e, "Webhook confirmation request failed"),
        }
    });

    let target_url = state.gateway.config().redirect_uri.clone();
    (StatusCode::OK, Json(json!({ "targetUrl": target_url }))).into_response()
}

async fn dispatch_events(state: &WebhookState, data: EventData) {
    for event in data.events {
        if event.event_type != DEVICE_EVENT {
            debug!(event_type = %event.event_type, "Skipping non-device event");
            continue;
        }
        let Some(device_event) = event.device_event else {
            continue;
        };

        info!(
            device_id = %device_event.device_id,
            capability = %device_event.capability,
            attribute = %device_event.attribute,
            value = %device_event.value,
            "Device event received"
        );

        if device_event.is_main_component() {
            state
                .gateway
                .update_device_status_cache(
                    &device_event.device_id,
                    &device_event.capability,
                    &device_event.attribute,
                    device_event.value.clone(),
                )
                .await;
        }
        state.observer.on_device_event(&device_event);
    }
}

fn success_page() -> Response {
    let html = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>SmartThings Authorization</title>
    <style>
        body { font-family: -apple-system, "Segoe UI", Roboto, Arial, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #eef2f7; }
        .container { background: white; padding: 3rem; border-radius: 1rem; text-align: center; max-width: 420px; }
        .checkmark { font-size: 4rem; color: #15bf6a; }
    </style>
</head>
<body>
    <div class="container">
        <div class="checkmark">✓</div>
        <h1>Authorization Successful</h1>
        <p>SmartThings access was granted. You can close this window; the gateway keeps receiving webhooks.</p>
    </div>
</body>
</html>"#;

    (StatusCode::OK, Html(html)).into_response()
}

fn failure_page(detail: &str) -> Response {
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>SmartThings Authorization</title>
    <style>
        body {{ font-family: -apple-system, "Segoe UI", Roboto, Arial, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #f7eeee; }}
        .container {{ background: white; padding: 3rem; border-radius: 1rem; text-align: center; max-width: 420px; }}
        .error-icon {{ font-size: 4rem; color: #e5484d; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="error-icon">✗</div>
        <h1>Authorization Failed</h1>
        <p>{}</p>
    </div>
</body>
</html>"#,
        escape_html(detail)
    );

    (StatusCode::BAD_REQUEST, Html(html)).into_response()
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// The process-wide webhook listener
///
/// Starting an already running listener only logs a warning.
pub struct WebhookServer {
    gateway: Gateway,
    observer: Arc<dyn DeviceEventObserver>,
    running: Mutex<Option<RunningServer>>,
}

impl WebhookServer {
    pub fn new(gateway: Gateway, observer: Arc<dyn DeviceEventObserver>) -> Self {
        Self {
            gateway,
            observer,
            running: Mutex::new(None),
        }
    }

    /// Bind the configured address and serve in the background
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref() {
            warn!(addr = %server.local_addr, "Webhook listener is already running");
            return Ok(server.local_addr);
        }

        let config = self.gateway.config();
        let ip: IpAddr = config.bind_address.parse().map_err(|e| {
            GatewayError::Config(format!("Invalid bind address {}: {}", config.bind_address, e))
        })?;
        let addr = SocketAddr::new(ip, config.port);

        let app = router(self.gateway.clone(), Arc::clone(&self.observer))?;
        let listener = TcpListener::bind(addr).await.map_err(|source| {
            error!(%addr, error = %source, "Failed to bind webhook listener");
            GatewayError::Bind { addr, source }
        })?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "Webhook listener stopped with error");
            }
        });

        info!(addr = %local_addr, "Webhook and OAuth listener started");
        info!(url = %self.gateway.authorization_url(), "Open this URL in a browser to authorize SmartThings access");

        *running = Some(RunningServer {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|s| s.local_addr)
    }

    /// Stop the listener and wait for it to finish; no-op when not running
    pub async fn shutdown(&self) {
        let Some(server) = self.running.lock().await.take() else {
            return;
        };
        let _ = server.shutdown.send(());
        if let Err(e) = server.task.await {
            error!(error = %e, "Webhook listener task failed");
        }
        info!(addr = %server.local_addr, "Webhook listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::storage::{now_millis, Credential, MemoryStore};
    use axum::body::Body;
    use axum::http::Request;
    use parking_lot::Mutex as SyncMutex;
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REDIRECT_URI: &str = "https://example.com/oauth/callback";

    struct Harness {
        server: MockServer,
        store: MemoryStore,
        gateway: Gateway,
        events: Arc<SyncMutex<Vec<DeviceEvent>>>,
        app: Router,
    }

    async fn harness() -> Harness {
        let server = MockServer::start().await;
        let mut config = GatewayConfig::new("id", "secret", REDIRECT_URI);
        config.api_base = server.uri();
        config.token_endpoint = format!("{}/oauth/token", server.uri());
        config.bind_address = "127.0.0.1".to_string();
        config.port = 0;

        let store = MemoryStore::with_credential(Credential {
            access_token: "token".into(),
            refresh_token: Some("refresh".into()),
            token_type: None,
            scope: None,
            expires_in: None,
            expires_at: Some(now_millis() + 3_600_000),
        });
        let gateway = Gateway::with_store(config, Arc::new(store.clone())).unwrap();
        gateway.init().await;

        let events = Arc::new(SyncMutex::new(Vec::new()));
        let sink = events.clone();
        let observer: Arc<dyn DeviceEventObserver> =
            Arc::new(move |event: &DeviceEvent| sink.lock().push(event.clone()));
        let app = router(gateway.clone(), observer).unwrap();

        Harness {
            server,
            store,
            gateway,
            events,
            app,
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    /// Wait for fire-and-forget requests to reach the mock server
    async fn wait_for_requests(server: &MockServer, count: usize) -> Vec<wiremock::Request> {
        for _ in 0..100 {
            let requests = server.received_requests().await.unwrap();
            if requests.len() >= count {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        server.received_requests().await.unwrap()
    }

    fn device_event_payload(device_id: &str, value: &str) -> serde_json::Value {
        json!({
            "lifecycle": "EVENT",
            "executionId": "exec-1",
            "eventData": {
                "events": [{
                    "eventType": "DEVICE_EVENT",
                    "deviceEvent": {
                        "deviceId": device_id,
                        "componentId": "main",
                        "capability": "switch",
                        "attribute": "switch",
                        "value": value
                    }
                }]
            }
        })
    }

    #[test]
    fn test_parse_lifecycle_variants() {
        let confirmation = parse_lifecycle(
            br#"{"lifecycle":"CONFIRMATION","confirmationData":{"appId":"a","installedAppId":"i","confirmationUrl":"https://x/confirm"}}"#,
        )
        .unwrap();
        assert!(matches!(
            confirmation,
            Lifecycle::Confirmation { ref confirmation_data } if confirmation_data.confirmation_url == "https://x/confirm"
        ));

        let ping = parse_lifecycle(br#"{"lifecycle":"PING","pingData":{"challenge":"c"}}"#).unwrap();
        assert!(matches!(ping, Lifecycle::Unknown));

        assert!(parse_lifecycle(b"not json").is_err());
        assert!(parse_lifecycle(br#"{"confirmationData":{}}"#).is_err());
        assert!(parse_lifecycle(br#"{"lifecycle":"CONFIRMATION"}"#).is_err());
        assert!(matches!(
            parse_lifecycle(
                br#"{"lifecycle":"EVENT","eventData":{"events":[{"eventType":"DEVICE_EVENT"}]}}"#
            ),
            Err(GatewayError::MalformedWebhookPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_redirect_with_code_triggers_one_exchange() {
        let h = harness().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("code=XYZ"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "issued",
                "refresh_token": "r",
                "expires_in": 86400
            })))
            .expect(1)
            .mount(&h.server)
            .await;

        let response = h
            .app
            .clone()
            .oneshot(get("/oauth/callback?code=XYZ"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = body_bytes(response).await;
        assert!(String::from_utf8_lossy(&page).contains("Authorization Successful"));

        let requests = wait_for_requests(&h.server, 1).await;
        assert_eq!(requests.len(), 1);

        // The exchange lands in the store shortly after the response
        for _ in 0..100 {
            if h.store.credential().map(|c| c.access_token) == Some("issued".to_string()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(h.store.credential().unwrap().access_token, "issued");
    }

    #[tokio::test]
    async fn test_redirect_without_code_never_exchanges() {
        let h = harness().await;

        let response = h.app.clone().oneshot(get("/oauth/callback")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let denied = h
            .app
            .clone()
            .oneshot(get("/oauth/callback?error=access_denied"))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::BAD_REQUEST);
        assert!(String::from_utf8_lossy(&body_bytes(denied).await).contains("access_denied"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_confirmation_handshake() {
        let h = harness().await;
        Mock::given(method("GET"))
            .and(path("/confirm"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&h.server)
            .await;

        let payload = json!({
            "lifecycle": "CONFIRMATION",
            "confirmationData": {
                "appId": "app-1",
                "installedAppId": "inst-1",
                "confirmationUrl": format!("{}/confirm", h.server.uri())
            }
        });
        let response = h.app.clone().oneshot(post("/", payload)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body, json!({ "targetUrl": REDIRECT_URI }));

        let requests = wait_for_requests(&h.server, 1).await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url.path(), "/confirm");

        let identity = h.store.installation().unwrap();
        assert_eq!(identity.app_id, "app-1");
        assert_eq!(identity.installed_app_id, "inst-1");
        assert_eq!(h.gateway.tokens().installation(), Some(identity));
    }

    #[tokio::test]
    async fn test_device_event_patches_cache_and_notifies_observer() {
        let h = harness().await;
        Mock::given(method("GET"))
            .and(path("/devices/abc/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "components": { "main": { "switch": { "switch": { "value": "off" } } } }
            })))
            .expect(1)
            .mount(&h.server)
            .await;
        h.gateway.get_status("abc").await.unwrap();

        let response = h
            .app
            .clone()
            .oneshot(post("/", device_event_payload("abc", "on")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_bytes(response).await.is_empty());

        let events = h.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].device_id, "abc");
        assert_eq!(events[0].capability, "switch");
        assert_eq!(events[0].attribute, "switch");
        assert_eq!(events[0].value, json!("on"));

        let status = h.gateway.get_status("abc").await.unwrap();
        assert_eq!(status.value("switch", "switch"), Some(&json!("on")));
        h.server.verify().await;
    }

    #[tokio::test]
    async fn test_event_for_other_component_skips_cache() {
        let h = harness().await;
        let mut payload = device_event_payload("abc", "on");
        payload["eventData"]["events"][0]["deviceEvent"]["componentId"] = json!("sub");
        payload["eventData"]["events"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "eventType": "TIMER_EVENT", "timerEvent": {} }));

        let response = h.app.clone().oneshot(post("/hooks", payload)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.events.lock().len(), 1);
        assert!(h.gateway.cache().peek("abc").await.is_none());
    }

    #[tokio::test]
    async fn test_empty_and_unknown_lifecycles_acknowledged() {
        let h = harness().await;

        let empty = json!({ "lifecycle": "EVENT", "eventData": { "events": [] } });
        let response = h.app.clone().oneshot(post("/", empty)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let ping = json!({ "lifecycle": "PING", "pingData": { "challenge": "c" } });
        let response = h.app.clone().oneshot(post("/", ping)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_bytes(response).await.is_empty());

        assert!(h.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payloads_rejected() {
        let h = harness().await;

        let garbage = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from("{ nope"))
            .unwrap();
        let response = h.app.clone().oneshot(garbage).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let missing = json!({ "lifecycle": "CONFIRMATION", "confirmationData": { "appId": "a" } });
        let response = h.app.clone().oneshot(post("/", missing)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let no_device = json!({
            "lifecycle": "EVENT",
            "eventData": { "events": [{ "eventType": "DEVICE_EVENT" }] }
        });
        let response = h.app.clone().oneshot(post("/", no_device)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert!(h.events.lock().is_empty());
        assert!(h.store.installation().is_none());

        // The router keeps serving after bad input
        let response = h
            .app
            .clone()
            .oneshot(post("/", device_event_payload("abc", "on")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_other_methods_and_paths_not_found() {
        let h = harness().await;

        for (verb, uri) in [
            ("GET", "/"),
            ("GET", "/elsewhere?code=XYZ"),
            ("PUT", "/"),
            ("DELETE", "/oauth/callback"),
            ("HEAD", "/oauth/callback?code=XYZ"),
            ("HEAD", "/oauth/callback"),
        ] {
            let request = Request::builder()
                .method(verb)
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let response = h.app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{} {}", verb, uri);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.server.received_requests().await.unwrap().is_empty());
    }

    #[test]
    fn test_router_rejects_unroutable_redirect() {
        let config = GatewayConfig::new("id", "secret", "urn:callback");
        let gateway = Gateway::with_store(config, Arc::new(MemoryStore::new())).unwrap();

        let result = router(gateway, Arc::new(|_: &DeviceEvent| {}));
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[tokio::test]
    async fn test_server_binds_once() {
        let h = harness().await;
        let server = WebhookServer::new(h.gateway.clone(), Arc::new(|_: &DeviceEvent| {}));

        let addr = server.start().await.unwrap();
        assert_eq!(server.start().await.unwrap(), addr);
        assert_eq!(server.local_addr().await, Some(addr));

        let response = reqwest::get(format!("http://{}/missing", addr))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);

        server.shutdown().await;
        assert_eq!(server.local_addr().await, None);

        // A stopped listener can be started again
        let restarted = server.start().await.unwrap();
        assert_eq!(server.local_addr().await, Some(restarted));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_reported() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let mut config = GatewayConfig::new("id", "secret", REDIRECT_URI);
        config.bind_address = "127.0.0.1".to_string();
        config.port = port;
        let gateway = Gateway::with_store(config, Arc::new(MemoryStore::new())).unwrap();
        let server = WebhookServer::new(gateway, Arc::new(|_: &DeviceEvent| {}));

        match server.start().await {
            Err(GatewayError::Bind { addr, .. }) => assert_eq!(addr.port(), port),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(server.local_addr().await, None);
    }
}
