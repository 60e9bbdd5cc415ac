//! Control Plane API - Internal Management Interface
//!
//! Provides HTTP endpoints for runtime management of the listener group:
//! - Inspect which slots are occupied and still listening
//! - Clear a slot to force failover to the standby
//! - Dry-run the selection policy against the live registry
//! - Query admission metrics
//!
//! Runs on its own port, separate from the admission front.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{info, warn};

use standby_ebpf_common::{select, Verdict, IPPROTO_TCP};

use crate::admission::AdmissionMetrics;
use crate::member::MemberHandle;
use crate::registry::{ListenerHandle, SocketRegistry};

// ============================================================================
// Configuration
// ============================================================================

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Address to listen on (default: 127.0.0.1:8081)
    pub listen_addr: SocketAddr,

    /// API key for authentication (None = no auth)
    pub api_key: Option<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([127, 0, 0, 1], 8081).into(),
            api_key: None,
        }
    }
}

// ============================================================================
// Control Plane State
// ============================================================================

/// Shared state for the control plane.
pub struct ControlState {
    pub config: ControlConfig,

    /// Registry the admission front decides against
    pub registry: Arc<SocketRegistry<MemberHandle>>,

    pub metrics: Arc<AdmissionMetrics>,

    pub started_at: Instant,
}

impl ControlState {
    pub fn new(
        config: ControlConfig,
        registry: Arc<SocketRegistry<MemberHandle>>,
        metrics: Arc<AdmissionMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
            started_at: Instant::now(),
        }
    }
}

// ============================================================================
// Control Plane Server
// ============================================================================

/// Control plane HTTP server.
pub struct ControlServer {
    state: Arc<ControlState>,
}

impl ControlServer {
    pub fn new(state: ControlState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Handle management requests on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!(addr = %listener.local_addr()?, "Control plane listening");

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, hyper::Error>(handle_control_request(&state, &req)) }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(peer = %peer_addr, error = %e, "Control connection error");
                }
            });
        }
    }
}

/// Route a control plane request.
///
/// No endpoint needs the request body, so routing is synchronous.
fn handle_control_request(state: &ControlState, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    if let Some(ref expected_key) = state.config.api_key {
        let provided_key = req.headers().get("X-API-Key").and_then(|v| v.to_str().ok());
        if provided_key != Some(expected_key.as_str()) {
            return json_response(
                StatusCode::UNAUTHORIZED,
                &json!({ "error": "Invalid or missing API key" }),
            );
        }
    }

    route(state, req.method(), req.uri().path())
}

fn route(state: &ControlState, method: &Method, path: &str) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/v1/health") => {
            json_response(StatusCode::OK, &json!({ "status": "healthy" }))
        }
        (&Method::GET, "/v1/slots") => json_response(StatusCode::OK, &slots_json(&state.registry)),
        (&Method::GET, "/v1/select") => {
            json_response(StatusCode::OK, &dry_run_json(&state.registry))
        }
        (&Method::GET, "/v1/metrics") => {
            let mut body = serde_json::to_value(state.metrics.snapshot()).unwrap_or(Value::Null);
            if let Value::Object(ref mut map) = body {
                map.insert("uptime_secs".into(), json!(state.started_at.elapsed().as_secs()));
            }
            json_response(StatusCode::OK, &body)
        }
        (&Method::DELETE, p) if p.starts_with("/v1/slots/") => {
            handle_slot_delete(&state.registry, &p["/v1/slots/".len()..])
        }
        _ => json_response(StatusCode::NOT_FOUND, &json!({ "error": "Not found" })),
    }
}

/// Handle DELETE /v1/slots/{n} - clear a slot.
fn handle_slot_delete(
    registry: &SocketRegistry<MemberHandle>,
    raw_slot: &str,
) -> Response<Full<Bytes>> {
    let slot: u32 = match raw_slot.parse() {
        Ok(slot) => slot,
        Err(_) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &json!({ "error": format!("Invalid slot index: {:?}", raw_slot) }),
            );
        }
    };

    match registry.depopulate(slot) {
        Ok(Some(removed)) => {
            info!(
                registry = %registry.name(),
                slot = slot,
                role = %removed.role(),
                "Slot cleared via control plane"
            );
            json_response(
                StatusCode::OK,
                &json!({
                    "slot": slot,
                    "removed": removed.role().as_str(),
                    "generation": registry.generation(),
                }),
            )
        }
        Ok(None) => json_response(
            StatusCode::NOT_FOUND,
            &json!({ "error": format!("Slot {} is empty", slot) }),
        ),
        Err(e) => json_response(
            StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_REQUEST),
            &json!({ "error": e.to_string() }),
        ),
    }
}

fn slots_json(registry: &SocketRegistry<MemberHandle>) -> Value {
    let slots: Vec<Value> = registry
        .occupants()
        .into_iter()
        .map(|(slot, handle)| {
            json!({
                "slot": slot,
                "role": handle.role().as_str(),
                "listening": handle.is_listening(),
            })
        })
        .collect();

    json!({
        "registry": registry.name(),
        "capacity": registry.capacity(),
        "generation": registry.generation(),
        "slots": slots,
    })
}

/// What the policy would decide for a TCP connection right now.
fn dry_run_json(registry: &SocketRegistry<MemberHandle>) -> Value {
    let selection = select(IPPROTO_TCP, registry);
    match (selection.verdict(), selection.into_handle()) {
        (Verdict::Accept(slot), Some((_, handle))) => json!({
            "verdict": "accept",
            "slot": slot.index(),
            "role": handle.role().as_str(),
            "listening": handle.is_listening(),
        }),
        _ => json!({ "verdict": "drop" }),
    }
}

/// Create a JSON response.
fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    headers.insert("X-Standby-Control", http::HeaderValue::from_static("true"));
    response
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::{register_member, Role};
    use http_body_util::BodyExt;
    use std::sync::atomic::Ordering;

    fn state() -> ControlState {
        ControlState::new(
            ControlConfig::default(),
            Arc::new(SocketRegistry::new("tcp_balancing_targets")),
            Arc::new(AdmissionMetrics::default()),
        )
    }

    async fn body_json(response: Response<Full<Bytes>>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_control_config_defaults() {
        let config = ControlConfig::default();
        assert_eq!(config.listen_addr.port(), 8081);
        assert!(config.api_key.is_none());
    }

    #[tokio::test]
    async fn test_health() {
        let state = state();
        let response = route(&state, &Method::GET, "/v1/health");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["X-Standby-Control"], "true");
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_slots_listing() {
        let state = state();
        let _primary = register_member(&state.registry, Role::Primary, 4).unwrap();
        let mut standby = register_member(&state.registry, Role::Standby, 4).unwrap();
        standby.close();

        let body = body_json(route(&state, &Method::GET, "/v1/slots")).await;
        assert_eq!(body["registry"], "tcp_balancing_targets");
        assert_eq!(body["capacity"], 128);
        assert_eq!(body["slots"][0]["slot"], 0);
        assert_eq!(body["slots"][0]["role"], "primary");
        assert_eq!(body["slots"][0]["listening"], true);
        assert_eq!(body["slots"][1]["slot"], 1);
        assert_eq!(body["slots"][1]["listening"], false);
        assert_eq!(body["slots"][1]["role"], "standby");
    }

    #[tokio::test]
    async fn test_dry_run_follows_registry() {
        let state = state();
        assert_eq!(body_json(route(&state, &Method::GET, "/v1/select")).await["verdict"], "drop");

        let _standby = register_member(&state.registry, Role::Standby, 4).unwrap();
        let body = body_json(route(&state, &Method::GET, "/v1/select")).await;
        assert_eq!(body["verdict"], "accept");
        assert_eq!(body["slot"], 1);
        assert_eq!(body["role"], "standby");
    }

    #[tokio::test]
    async fn test_delete_slot_forces_failover() {
        let state = state();
        let _primary = register_member(&state.registry, Role::Primary, 4).unwrap();
        let _standby = register_member(&state.registry, Role::Standby, 4).unwrap();

        let response = route(&state, &Method::DELETE, "/v1/slots/0");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["removed"], "primary");

        let body = body_json(route(&state, &Method::GET, "/v1/select")).await;
        assert_eq!(body["slot"], 1);

        assert_eq!(route(&state, &Method::DELETE, "/v1/slots/0").status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_slot_rejects_bad_index() {
        let state = state();
        for path in ["/v1/slots/abc", "/v1/slots/128"] {
            assert_eq!(route(&state, &Method::DELETE, path).status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let state = state();
        state.metrics.connections_total.fetch_add(3, Ordering::Relaxed);
        state.metrics.accepted_fallback.fetch_add(2, Ordering::Relaxed);

        let body = body_json(route(&state, &Method::GET, "/v1/metrics")).await;
        assert_eq!(body["connections_total"], 3);
        assert_eq!(body["accepted_fallback"], 2);
        assert!(body["uptime_secs"].is_u64());
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let state = state();
        assert_eq!(route(&state, &Method::GET, "/v1/nope").status(), StatusCode::NOT_FOUND);
        assert_eq!(route(&state, &Method::POST, "/v1/slots").status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_api_key_enforced_over_http() {
        let mut state = state();
        state.config.api_key = Some("secret".into());
        let server = Arc::new(ControlServer::new(state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        let denied = raw_get(addr, "/v1/health", None).await;
        assert!(denied.starts_with("HTTP/1.1 401"));

        let allowed = raw_get(addr, "/v1/health", Some("secret")).await;
        assert!(allowed.starts_with("HTTP/1.1 200"));
        assert!(allowed.contains("healthy"));

        task.abort();
    }

    async fn raw_get(addr: SocketAddr, path: &str, key: Option<&str>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let key_header = key.map(|k| format!("X-API-Key: {}\r\n", k)).unwrap_or_default();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\n{}Connection: close\r\n\r\n",
            path, key_header
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }
}
