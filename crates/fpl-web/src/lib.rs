//! Axum HTTP surface: the admin import trigger and read-only JSON listings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fpl_storage::StoreResult;
use fpl_sync::{maybe_build_scheduler, Reconciler, SyncConfig, SyncError};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "fpl-web";

pub const IMPORT_SUCCESS_TEXT: &str = "FPL data imported successfully.";
pub const IMPORT_CONFLICT_TEXT: &str = "An FPL import is already running.";
pub const IMPORT_FAILURE_TEXT: &str = "Failed to import FPL data";

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    /// Upper bound on one import triggered over HTTP; the run is dropped when it elapses.
    pub run_timeout: Duration,
}

impl AppState {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            run_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/v1/admin/import-fpl", post(import_fpl_handler))
        .route("/v1/teams", get(teams_handler))
        .route("/v1/players", get(players_handler))
        .route("/v1/fixtures", get(fixtures_handler))
        .route("/v1/chips", get(chips_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("FPL_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let run_timeout = std::env::var("FPL_IMPORT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(300));

    let config = SyncConfig::from_env();
    let store = config.connect_store().await?;
    let feed = config.http_feed().context("building feed client")?;
    let reconciler = Arc::new(
        Reconciler::new(Arc::new(feed), store).with_tracked_fields(config.tracked_fields),
    );

    let scheduler = maybe_build_scheduler(&config, reconciler.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "sync scheduler started");
    }

    let state = AppState::new(reconciler).with_run_timeout(run_timeout);
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn import_fpl_handler(State(state): State<Arc<AppState>>) -> Response {
    match tokio::time::timeout(state.run_timeout, state.reconciler.run_sync()).await {
        Ok(Ok(summary)) => {
            info!(
                run_id = %summary.run_id,
                players_inserted = summary.players.inserted,
                players_updated = summary.players.updated,
                fixtures = summary.fixtures.upserted,
                "fpl import finished"
            );
            (StatusCode::OK, IMPORT_SUCCESS_TEXT).into_response()
        }
        Ok(Err(SyncError::AlreadyRunning)) => {
            warn!("fpl import rejected; a run is already in progress");
            (StatusCode::CONFLICT, IMPORT_CONFLICT_TEXT).into_response()
        }
        Ok(Err(err)) => {
            error!(error = %err, "fpl import failed");
            (StatusCode::INTERNAL_SERVER_ERROR, IMPORT_FAILURE_TEXT).into_response()
        }
        Err(_) => {
            error!(timeout_secs = state.run_timeout.as_secs(), "fpl import timed out");
            (StatusCode::INTERNAL_SERVER_ERROR, IMPORT_FAILURE_TEXT).into_response()
        }
    }
}

async fn teams_handler(State(state): State<Arc<AppState>>) -> Response {
    json_rows("teams", state.reconciler.store().list_teams().await)
}

async fn players_handler(State(state): State<Arc<AppState>>) -> Response {
    json_rows("players", state.reconciler.store().list_players().await)
}

async fn fixtures_handler(State(state): State<Arc<AppState>>) -> Response {
    json_rows("fixtures", state.reconciler.store().list_fixtures().await)
}

async fn chips_handler(State(state): State<Arc<AppState>>) -> Response {
    json_rows("chips", state.reconciler.store().list_chips().await)
}

fn json_rows<T: Serialize>(entity: &'static str, rows: StoreResult<Vec<T>>) -> Response {
    match rows {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => {
            error!(entity, error = %err, "listing failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to load {entity}")).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use fpl_feed::{FeedError, FeedFixture, FeedSnapshot, FeedSource, FileFeed, StaticFeed};
    use fpl_storage::MemoryStore;
    use http_body_util::BodyExt;
    use std::path::Path;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    fn sample_feed() -> FileFeed {
        FileFeed::new(Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/feed"))
    }

    fn app_with(feed: Arc<dyn FeedSource>) -> Router {
        let reconciler = Reconciler::new(feed, Arc::new(MemoryStore::new()));
        app(AppState::new(Arc::new(reconciler)))
    }

    fn import_request() -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/v1/admin/import-fpl")
            .body(Body::empty())
            .unwrap()
    }

    fn get_request(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn import_then_list_players() {
        let app = app_with(Arc::new(sample_feed()));

        let resp = app.clone().oneshot(import_request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, IMPORT_SUCCESS_TEXT);

        let resp = app.oneshot(get_request("/v1/players")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let players: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        let players = players.as_array().unwrap();
        assert_eq!(players.len(), 4);
        assert_eq!(players[0]["web_name"], "Raya");
        assert_eq!(players[0]["position"], "GK");
    }

    #[tokio::test]
    async fn listings_are_empty_before_any_import() {
        let app = app_with(Arc::new(StaticFeed::default()));
        for uri in ["/v1/teams", "/v1/fixtures", "/v1/chips"] {
            let resp = app.clone().oneshot(get_request(uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(body_text(resp).await, "[]");
        }
    }

    #[tokio::test]
    async fn frontend_paths_are_mounted_under_v1() {
        let app = app_with(Arc::new(sample_feed()));

        let resp = app.clone().oneshot(import_request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        for (uri, rows) in [("/v1/teams", 3), ("/v1/players", 4), ("/v1/fixtures", 3)] {
            let resp = app.clone().oneshot(get_request(uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "{uri}");
            let body: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
            assert_eq!(body.as_array().unwrap().len(), rows, "{uri}");
        }

        let resp = app.oneshot(get_request("/api/v1/teams")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn failed_import_hides_error_detail() {
        let feed = StaticFeed::default().failing_snapshot("upstream said secret-token-123");
        let app = app_with(Arc::new(feed));

        let resp = app.oneshot(import_request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_text(resp).await;
        assert_eq!(body, IMPORT_FAILURE_TEXT);
        assert!(!body.contains("secret-token-123"));
    }

    struct GatedFeed {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl FeedSource for GatedFeed {
        async fn fetch_snapshot(&self) -> Result<FeedSnapshot, FeedError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(FeedSnapshot::default())
        }

        async fn fetch_fixtures(&self) -> Result<Vec<FeedFixture>, FeedError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn overlapping_import_gets_conflict() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let app = app_with(Arc::new(GatedFeed {
            entered: entered.clone(),
            release: release.clone(),
        }));

        let first = tokio::spawn(app.clone().oneshot(import_request()));
        entered.notified().await;

        let resp = app.oneshot(import_request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        release.notify_one();
        let resp = first.await.unwrap().unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn import_exceeding_timeout_fails() {
        let feed = GatedFeed {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        let reconciler = Reconciler::new(Arc::new(feed), Arc::new(MemoryStore::new()));
        let app = app(
            AppState::new(Arc::new(reconciler)).with_run_timeout(Duration::from_millis(20)),
        );

        let resp = app.oneshot(import_request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
