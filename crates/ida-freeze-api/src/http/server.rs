/// HTTP server implementation
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use ida_freeze_config::HttpConfig;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::controller::ActionController;
use crate::http::handlers::{
    action_files, cancel, changes_since, clear, clear_all, count_actions, delete, file_by_node,
    file_by_pathname, freeze, frozen_pids, get_action, get_file, health_check, init_details,
    inventory, last_add, last_change, list_actions, list_changes, offline, online,
    record_change, retry, scope_ok, stream_changes, suspend, unfreeze, unsuspend, AppState,
};

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from(&HttpConfig::default())
    }
}

impl From<&HttpConfig> for ApiConfig {
    fn from(config: &HttpConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            enable_cors: config.enable_cors,
        }
    }
}

impl ApiConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiConfig, controller: ActionController) -> Self {
        Self {
            config,
            state: AppState::new(controller),
        }
    }

    /// Build the router with all routes
    pub fn router(&self) -> Router {
        let api = Router::new()
            // Actions
            .route("/freeze", post(freeze))
            .route("/unfreeze", post(unfreeze))
            .route("/delete", post(delete))
            .route("/retry/:pid", post(retry))
            .route("/clear/:pid", post(clear))
            .route("/clear_all", post(clear_all))
            .route("/cancel/:pid", post(cancel))
            .route("/actions", get(list_actions))
            .route("/actions/count", get(count_actions))
            .route("/actions/:pid", get(get_action))
            .route("/actions/:pid/files", get(action_files))
            .route("/files/:pid", get(get_file))
            .route("/file_by_node/:node", get(file_by_node))
            .route("/file_by_pathname", get(file_by_pathname))
            .route("/projects/:project/inventory", get(inventory))
            .route("/projects/:project/pids", get(frozen_pids))
            .route("/scope_ok", get(scope_ok))
            // Service state
            .route("/suspend/:project", post(suspend))
            .route("/unsuspend/:project", post(unsuspend))
            .route("/offline", post(offline))
            .route("/online", post(online))
            // Data changes
            .route("/changes", post(record_change))
            .route("/changes/:project", get(list_changes))
            .route("/changes/:project/last", get(last_change))
            .route("/changes/:project/init", get(init_details))
            .route("/changes/:project/since", get(changes_since))
            .route("/changes/:project/last_add", get(last_add))
            .route("/changes/:project/stream", get(stream_changes));

        let mut router = Router::new()
            .route("/health", get(health_check))
            .nest("/api", api)
            .with_state(self.state.clone());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        router.layer(TraceLayer::new_for_http())
    }

    /// Serve until ctrl-c
    pub async fn run(self) -> Result<()> {
        let app = self.router();
        let bind_addr: SocketAddr = self
            .config
            .bind_address()
            .parse()
            .context("Invalid bind address")?;

        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind {bind_addr}"))?;
        tracing::info!("Listening on http://{}", bind_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Failed to listen for shutdown signal: {}", e);
                }
            })
            .await
            .context("Server error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use ida_freeze_core::test_utils::TestHarness;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (TestHarness, Router) {
        let harness = TestHarness::new();
        let engine = Arc::new(harness.engine_for_worker("api", TestHarness::fast_settings()));
        let controller = ActionController::new(engine, harness.suspension.clone());
        let router = ApiServer::new(ApiConfig::default(), controller).router();
        (harness, router)
    }

    fn request(method: &str, uri: &str, user: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-ida-user", user)
            .header("x-ida-projects", "p1")
            .header("content-type", "application/json");
        match body {
            Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (_h, router) = app();
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let (_h, router) = app();
        let response = router
            .oneshot(Request::get("/api/actions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_freeze_and_query() {
        let (h, router) = app();
        h.fs.add_staged("p1", "/data/a", b"a");

        let body = serde_json::json!({ "project": "p1", "pathname": "/data" });
        let (status, action) = send(&router, request("POST", "/api/freeze", "alice", Some(body))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let pid = action["pid"].as_str().unwrap().to_string();
        assert_eq!(action["filecount"], 1);

        let mut completed = Value::Null;
        for _ in 0..200 {
            let (status, action) =
                send(&router, request("GET", &format!("/api/actions/{pid}"), "alice", None)).await;
            assert_eq!(status, StatusCode::OK);
            if !action["completed"].is_null() {
                completed = action;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(completed["pids"].as_array().unwrap().len(), 1);

        let (status, files) = send(
            &router,
            request("GET", &format!("/api/actions/{pid}/files"), "alice", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let file_pid = files[0]["pid"].as_str().unwrap();

        let (status, file) =
            send(&router, request("GET", &format!("/api/files/{file_pid}"), "alice", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(file["pathname"], "/data/a");

        let (status, list) =
            send(&router, request("GET", "/api/actions?status=completed", "alice", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_lookups_and_inventory() {
        let (h, router) = app();
        let node = h.fs.add_staged("p1", "/data/a", b"a");
        h.fs.add_staged("p1", "/data/b", b"b");
        let action = h
            .engine
            .start_action(ida_freeze_core::StartRequest {
                project: "p1".to_string(),
                pathname: "/data/a".to_string(),
                kind: ida_freeze_config::ActionKind::Freeze,
                user: "alice".to_string(),
                batch: false,
            })
            .await
            .unwrap();
        h.engine.run(&action.pid).await.unwrap();

        let (status, file) = send(
            &router,
            request("GET", &format!("/api/file_by_node/{node}"), "alice", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(file["pathname"], "/data/a");

        let (status, by_path) = send(
            &router,
            request("GET", "/api/file_by_pathname?project=p1&pathname=/data/a", "alice", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(by_path["pid"], file["pid"]);

        let (status, _) = send(
            &router,
            request("GET", "/api/file_by_pathname?project=p1&pathname=/data/b", "alice", None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, pids) =
            send(&router, request("GET", "/api/projects/p1/pids", "alice", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pids, serde_json::json!([file["pid"]]));

        let (status, all) =
            send(&router, request("GET", "/api/projects/p1/inventory", "alice", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(all["staging"].as_array().unwrap().len(), 1);
        assert_eq!(all["frozen"].as_array().unwrap().len(), 1);

        let (status, frozen) = send(
            &router,
            request("GET", "/api/projects/p1/inventory?area=frozen&scope=/data", "alice", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(frozen["staging"].as_array().unwrap().is_empty());
        assert_eq!(frozen["frozen"][0]["pathname"], "/data/a");

        let (status, _) =
            send(&router, request("GET", "/api/projects/p2/inventory", "alice", None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let (h, router) = app();
        h.fs.add_staged("p1", "/data/a", b"a");

        let body = serde_json::json!({ "project": "p1", "pathname": "/missing" });
        let (status, error) = send(&router, request("POST", "/api/freeze", "alice", Some(body))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error["error"], "not_found");

        let body = serde_json::json!({ "project": "p1", "pathname": "/" });
        let (status, _) = send(&router, request("POST", "/api/freeze", "alice", Some(body))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(&router, request("POST", "/api/suspend/p1", "admin", None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let body = serde_json::json!({ "project": "p1", "pathname": "/data" });
        let (status, error) =
            send(&router, request("POST", "/api/freeze", "alice", Some(body.clone()))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error["error"], "suspended");

        let (status, _) = send(&router, request("POST", "/api/offline", "admin", None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&router, request("POST", "/api/freeze", "alice", Some(body))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) =
            send(&router, request("GET", "/api/actions/missing", "alice", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_scope_ok_and_changes() {
        let (_h, router) = app();
        let (status, body) = send(
            &router,
            request("GET", "/api/scope_ok?project=p1&pathname=/data", "alice", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        let change = serde_json::json!({
            "project": "p1",
            "user": "alice",
            "change": "add",
            "pathname": "/p1+/a.txt",
        });
        let (status, _) =
            send(&router, request("POST", "/api/changes", "alice", Some(change.clone()))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, record) =
            send(&router, request("POST", "/api/changes", "PSO_p1", Some(change))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(record["mode"], "api");

        let (status, last) =
            send(&router, request("GET", "/api/changes/p1/last", "alice", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(last["change"], "add");

        let (status, added) = send(
            &router,
            request("GET", "/api/changes/p1/last_add?pathname=/a.txt", "alice", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(added["pathname"], "/p1+/a.txt");

        let (status, init) =
            send(&router, request("GET", "/api/changes/p1/init", "alice", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(init["change"], "init");

        let (status, since) = send(
            &router,
            request(
                "GET",
                "/api/changes/p1/since?since=2000-01-01T00:00:00Z",
                "alice",
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(since.as_array().unwrap().len(), 1);

        let (status, _) =
            send(&router, request("GET", "/api/changes/p1/since", "alice", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
