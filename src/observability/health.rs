//! Health check HTTP server
//!
//! Endpoints for operators and container orchestration: `/health`,
//! `/metrics`, `/ready`, `/live`, and an index at `/`.

use crate::observability::metrics::EngineMetrics;
use crate::state::StateStore;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::Filter;

/// Seconds without a hook heartbeat before the hook check turns stale
const HOOK_STALENESS_THRESHOLD_SECONDS: u64 = 300;

/// HTTP health check server
pub struct HealthServer {
    engine_id: String,
    port: u16,
    metrics: Arc<EngineMetrics>,
    state: Arc<StateStore>,
    control_required: bool,
}

impl HealthServer {
    pub fn new(
        engine_id: String,
        port: u16,
        metrics: Arc<EngineMetrics>,
        state: Arc<StateStore>,
        control_required: bool,
    ) -> Self {
        Self {
            engine_id,
            port,
            metrics,
            state,
            control_required,
        }
    }

    fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let metrics_server = self.clone();
        let ready_server = self.clone();

        // GET /health - overall status with individual checks
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.health_status();
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = metrics_server.clone();
                async move { Ok::<_, Infallible>(warp::reply::json(&server.metrics.snapshot())) }
            });

        // GET /ready - a live session is required to do any work
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = ready_server.clone();
                async move {
                    let ready = server.metrics.session_alive();
                    let response = ReadinessResponse {
                        ready,
                        timestamp: current_timestamp(),
                    };
                    let code = if ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
                }
            });

        // GET /live - the process is up
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET / - endpoint index
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints: HashMap<&str, &str> = [
                ("/health", "Overall health status with detailed checks"),
                ("/metrics", "Engine metrics and statistics"),
                ("/ready", "Readiness probe (live browser session)"),
                ("/live", "Liveness probe"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&endpoints)
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Serve until the task is dropped
    pub async fn start(self: Arc<Self>) {
        let routes = self.routes();
        tracing::info!(port = self.port, "Starting health server");
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
    }

    fn health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let snapshot = self.metrics.snapshot();

        let mut checks = HashMap::new();
        checks.insert(
            "session".to_string(),
            if snapshot.lifecycle.session_alive {
                HealthCheck::healthy("Browser session alive", now)
            } else {
                HealthCheck::unhealthy("No live browser session", now)
            },
        );
        checks.insert("slot".to_string(), self.check_slot(now));
        checks.insert(
            "page_hook".to_string(),
            check_hook(snapshot.detection.last_hook_heartbeat, now),
        );
        if self.control_required {
            checks.insert(
                "control".to_string(),
                if snapshot.control.connected {
                    HealthCheck::healthy("Control channel connected", now)
                } else {
                    HealthCheck::unhealthy("Control channel disconnected", now)
                },
            );
        }

        let healthy = checks.values().all(|c| c.status == "healthy");
        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            engine_id: self.engine_id.clone(),
            uptime_seconds: snapshot.lifecycle.uptime_seconds,
            checks,
        }
    }

    fn check_slot(&self, now: u64) -> HealthCheck {
        let state = self.state.snapshot();
        match (&state.active, state.enabled) {
            (Some(identifier), _) => HealthCheck::healthy(&format!("Slot held by {identifier}"), now),
            (None, true) => HealthCheck::healthy("Slot free", now),
            (None, false) => HealthCheck::healthy("Slot free, engine disabled", now),
        }
    }
}

fn check_hook(last_heartbeat: u64, now: u64) -> HealthCheck {
    if last_heartbeat == 0 {
        HealthCheck::healthy("No hook heartbeat yet", now)
    } else if now.saturating_sub(last_heartbeat) > HOOK_STALENESS_THRESHOLD_SECONDS {
        HealthCheck {
            status: "stale".to_string(),
            message: Some(format!(
                "No hook heartbeat for {} seconds",
                now - last_heartbeat
            )),
            last_check: now,
        }
    } else {
        HealthCheck::healthy("Hook heartbeat recent", now)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    fn healthy(message: &str, now: u64) -> Self {
        Self {
            status: "healthy".to_string(),
            message: Some(message.to_string()),
            last_check: now,
        }
    }

    fn unhealthy(message: &str, now: u64) -> Self {
        Self {
            status: "unhealthy".to_string(),
            message: Some(message.to_string()),
            last_check: now,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    engine_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn server(control_required: bool) -> (Arc<HealthServer>, Arc<EngineMetrics>, TempDir) {
        let dir = TempDir::new().unwrap();
        let metrics = Arc::new(EngineMetrics::new());
        let state = Arc::new(StateStore::load(dir.path().join("state.json")));
        let server = Arc::new(HealthServer::new(
            "test-engine".to_string(),
            8080,
            metrics.clone(),
            state,
            control_required,
        ));
        (server, metrics, dir)
    }

    #[test]
    fn test_health_tracks_session() {
        let (server, metrics, _dir) = server(false);

        let status = server.health_status();
        assert_eq!(status.status, "degraded");
        assert_eq!(status.engine_id, "test-engine");
        assert!(!status.checks.contains_key("control"));

        metrics.set_session_alive(true);
        assert_eq!(server.health_status().status, "healthy");
    }

    #[test]
    fn test_control_check_only_when_required() {
        let (server, metrics, _dir) = server(true);
        metrics.set_session_alive(true);

        let status = server.health_status();
        assert_eq!(status.checks["control"].status, "unhealthy");

        metrics.mqtt_connection_established();
        assert_eq!(server.health_status().status, "healthy");
    }

    #[test]
    fn test_hook_staleness() {
        assert_eq!(check_hook(0, 1_000).status, "healthy");
        assert_eq!(check_hook(900, 1_000).status, "healthy");
        assert_eq!(check_hook(100, 1_000).status, "stale");
    }

    #[tokio::test]
    async fn test_ready_endpoint() {
        let (server, metrics, _dir) = server(false);
        let routes = server.routes();

        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), 503);

        metrics.set_session_alive(true);
        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_metrics_and_live_endpoints() {
        let (server, metrics, _dir) = server(false);
        metrics.claim_won();
        let routes = server.routes();

        let response = warp::test::request().path("/metrics").reply(&routes).await;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["claims"]["won"], 1);

        let response = warp::test::request().path("/live").reply(&routes).await;
        assert_eq!(response.status(), 200);
    }
}
