//! Upstream feed contracts: wire records, feed sources, and record mappers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fpl_core::{Chip, Fixture, Player, Position, Team};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "fpl-feed";

pub const DEFAULT_BOOTSTRAP_URL: &str = "https://fantasy.premierleague.com/api/bootstrap-static/";
pub const DEFAULT_FIXTURES_URL: &str = "https://fantasy.premierleague.com/api/fixtures/?future=1";

pub const SNAPSHOT_FILE_NAME: &str = "bootstrap-static.json";
pub const FIXTURES_FILE_NAME: &str = "fixtures.json";

/// Bulk payload carrying teams, players and chips in one response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub teams: Vec<FeedTeam>,
    #[serde(rename = "elements")]
    pub players: Vec<FeedPlayer>,
    pub chips: Vec<FeedChip>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedTeam {
    pub id: i32,
    pub name: String,
    pub short_name: String,
    pub code: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedPlayer {
    pub id: i32,
    pub first_name: String,
    pub second_name: String,
    pub web_name: String,
    pub team: i32,
    pub element_type: i32,
    /// Price in tenths of a currency unit.
    pub now_cost: i64,
    pub total_points: i32,
    pub form: String,
    pub selected_by_percent: String,
    pub transfers_in: i64,
    pub transfers_in_event: i64,
    pub transfers_out: i64,
    pub transfers_out_event: i64,
    pub value_form: String,
    pub event_points: i32,
    pub ict_index: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedChip {
    pub id: i32,
    pub name: String,
    pub number: i32,
    pub start_event: i32,
    pub stop_event: i32,
    pub chip_type: String,
    #[serde(default)]
    pub overrides: JsonValue,
}

/// One row of the fixtures list. Absent and `null` fields both decode to `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedFixture {
    pub id: i32,
    #[serde(default)]
    pub event: Option<i32>,
    #[serde(default)]
    pub kickoff_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub started: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub finished: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub provisional_start_time: bool,
    pub team_h: i32,
    pub team_a: i32,
    #[serde(default)]
    pub team_h_score: Option<i32>,
    #[serde(default)]
    pub team_a_score: Option<i32>,
    pub team_h_difficulty: i32,
    pub team_a_difficulty: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub minutes: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub pulse_id: i64,
    pub code: i64,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("feed unavailable: {0}")]
    Unavailable(String),
}

/// A source of upstream payloads. Dropping a returned future cancels the fetch.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<FeedSnapshot, FeedError>;
    async fn fetch_fixtures(&self) -> Result<Vec<FeedFixture>, FeedError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEndpoints {
    pub bootstrap_url: String,
    pub fixtures_url: String,
}

impl Default for FeedEndpoints {
    fn default() -> Self {
        Self {
            bootstrap_url: DEFAULT_BOOTSTRAP_URL.to_string(),
            fixtures_url: DEFAULT_FIXTURES_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Feed client backed by `reqwest`. Every call is a single GET with no retries.
#[derive(Debug, Clone)]
pub struct HttpFeed {
    client: reqwest::Client,
    endpoints: FeedEndpoints,
}

impl HttpFeed {
    pub fn new(endpoints: FeedEndpoints, config: HttpClientConfig) -> Result<Self, FeedError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FeedError::Client)?;
        Ok(Self { client, endpoints })
    }

    pub fn endpoints(&self) -> &FeedEndpoints {
        &self.endpoints
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FeedError> {
        let span = info_span!("feed_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|source| FeedError::Request {
                    url: url.to_string(),
                    source,
                })?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await.map_err(|source| FeedError::Request {
                url: final_url.clone(),
                source,
            })?;

            if !status.is_success() {
                return Err(FeedError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }

            debug!(bytes = body.len(), "feed response received");
            serde_json::from_slice(&body).map_err(|source| FeedError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl FeedSource for HttpFeed {
    async fn fetch_snapshot(&self) -> Result<FeedSnapshot, FeedError> {
        self.get_json(&self.endpoints.bootstrap_url).await
    }

    async fn fetch_fixtures(&self) -> Result<Vec<FeedFixture>, FeedError> {
        self.get_json(&self.endpoints.fixtures_url).await
    }
}

/// Replays captured payloads from a directory holding
/// `bootstrap-static.json` and `fixtures.json`.
#[derive(Debug, Clone)]
pub struct FileFeed {
    dir: PathBuf,
}

impl FileFeed {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_json<T: DeserializeOwned>(&self, file_name: &str) -> Result<T, FeedError> {
        let path = self.dir.join(file_name);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| FeedError::Io {
                path: path.clone(),
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|source| FeedError::Decode {
            url: path.display().to_string(),
            source,
        })
    }
}

#[async_trait]
impl FeedSource for FileFeed {
    async fn fetch_snapshot(&self) -> Result<FeedSnapshot, FeedError> {
        self.read_json(SNAPSHOT_FILE_NAME).await
    }

    async fn fetch_fixtures(&self) -> Result<Vec<FeedFixture>, FeedError> {
        self.read_json(FIXTURES_FILE_NAME).await
    }
}

/// In-memory feed with optional scripted failures, for wiring tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticFeed {
    snapshot: FeedSnapshot,
    fixtures: Vec<FeedFixture>,
    snapshot_failure: Option<String>,
    fixtures_failure: Option<String>,
}

impl StaticFeed {
    pub fn new(snapshot: FeedSnapshot, fixtures: Vec<FeedFixture>) -> Self {
        Self {
            snapshot,
            fixtures,
            snapshot_failure: None,
            fixtures_failure: None,
        }
    }

    pub fn failing_snapshot(mut self, reason: impl Into<String>) -> Self {
        self.snapshot_failure = Some(reason.into());
        self
    }

    pub fn failing_fixtures(mut self, reason: impl Into<String>) -> Self {
        self.fixtures_failure = Some(reason.into());
        self
    }
}

#[async_trait]
impl FeedSource for StaticFeed {
    async fn fetch_snapshot(&self) -> Result<FeedSnapshot, FeedError> {
        match &self.snapshot_failure {
            Some(reason) => Err(FeedError::Unavailable(reason.clone())),
            None => Ok(self.snapshot.clone()),
        }
    }

    async fn fetch_fixtures(&self) -> Result<Vec<FeedFixture>, FeedError> {
        match &self.fixtures_failure {
            Some(reason) => Err(FeedError::Unavailable(reason.clone())),
            None => Ok(self.fixtures.clone()),
        }
    }
}

/// Converts an upstream tenths-of-a-unit price into currency units.
pub fn price_from_tenths(now_cost: i64) -> f64 {
    now_cost as f64 / 10.0
}

/// Parses a feed-native numeric string, yielding `0.0` for anything that is not a finite number.
pub fn parse_lenient_f64(raw: &str) -> f64 {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

pub fn map_team(team: &FeedTeam) -> Team {
    Team {
        id: team.id,
        name: team.name.clone(),
        short_name: team.short_name.clone(),
        code: team.code,
    }
}

/// Maps a feed player; `start_price` is seeded from the current price and only
/// survives if the row turns out to be new.
pub fn map_player(player: &FeedPlayer) -> Player {
    let current_price = price_from_tenths(player.now_cost);
    Player {
        id: player.id,
        first_name: player.first_name.clone(),
        second_name: player.second_name.clone(),
        web_name: player.web_name.clone(),
        team_id: player.team,
        position: Position::from_element_type(player.element_type),
        start_price: current_price,
        current_price,
        total_points: player.total_points,
        form: player.form.clone(),
        selected_by_percent: parse_lenient_f64(&player.selected_by_percent),
        transfers_in: player.transfers_in,
        transfers_in_event: player.transfers_in_event,
        transfers_out: player.transfers_out,
        transfers_out_event: player.transfers_out_event,
        value_form: parse_lenient_f64(&player.value_form),
        event_points: player.event_points,
        ict_index: player.ict_index.clone(),
    }
}

pub fn map_fixture(fixture: &FeedFixture) -> Fixture {
    Fixture {
        id: fixture.id,
        event: fixture.event,
        kickoff_time: fixture.kickoff_time,
        started: fixture.started,
        finished: fixture.finished,
        provisional_start_time: fixture.provisional_start_time,
        team_h_id: fixture.team_h,
        team_a_id: fixture.team_a,
        team_h_score: fixture.team_h_score,
        team_a_score: fixture.team_a_score,
        team_h_difficulty: fixture.team_h_difficulty,
        team_a_difficulty: fixture.team_a_difficulty,
        minutes: fixture.minutes,
        pulse_id: fixture.pulse_id,
        code: fixture.code,
    }
}

pub fn map_chip(chip: &FeedChip) -> Chip {
    Chip {
        id: chip.id,
        name: chip.name.clone(),
        number: chip.number,
        start_event: chip.start_event,
        stop_event: chip.stop_event,
        chip_type: chip.chip_type.clone(),
        overrides: chip.overrides.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};

    fn sample_feed_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/feed")
    }

    fn feed_player(now_cost: i64, selected_by_percent: &str) -> FeedPlayer {
        FeedPlayer {
            id: 7,
            first_name: "Bukayo".into(),
            second_name: "Saka".into(),
            web_name: "Saka".into(),
            team: 1,
            element_type: 3,
            now_cost,
            total_points: 180,
            form: "6.5".into(),
            selected_by_percent: selected_by_percent.into(),
            transfers_in: 1_200_000,
            transfers_in_event: 15_000,
            transfers_out: 800_000,
            transfers_out_event: 9_000,
            value_form: "0.6".into(),
            event_points: 9,
            ict_index: "210.4".into(),
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn price_is_divided_not_truncated() {
        assert_eq!(price_from_tenths(125), 12.5);
        assert_eq!(map_player(&feed_player(125, "10.1")).current_price, 12.5);
    }

    #[test]
    fn unparseable_percentages_degrade_to_zero() {
        assert_eq!(map_player(&feed_player(50, "")).selected_by_percent, 0.0);
        assert_eq!(map_player(&feed_player(50, "N/A")).selected_by_percent, 0.0);
        assert_eq!(parse_lenient_f64(" 34.7 "), 34.7);
        assert_eq!(parse_lenient_f64("NaN"), 0.0);
    }

    #[test]
    fn mapped_player_seeds_start_price_and_position() {
        let player = map_player(&feed_player(87, "41.2"));
        assert_eq!(player.start_price, 8.7);
        assert_eq!(player.current_price, 8.7);
        assert_eq!(player.position, Position::Midfielder);
        assert_eq!(player.selected_by_percent, 41.2);
        assert_eq!(player.value_form, 0.6);
        assert_eq!(player.team_id, 1);
    }

    #[test]
    fn null_and_absent_fixture_fields_collapse_to_none() {
        let with_nulls = r#"{"id":1,"event":null,"kickoff_time":null,"started":null,"finished":false,
            "provisional_start_time":false,"team_h":1,"team_a":2,"team_h_score":null,
            "team_a_score":null,"team_h_difficulty":3,"team_a_difficulty":4,"minutes":0,
            "pulse_id":10,"code":99}"#;
        let absent = r#"{"id":1,"team_h":1,"team_a":2,"team_h_difficulty":3,
            "team_a_difficulty":4,"code":99}"#;

        let a = map_fixture(&serde_json::from_str::<FeedFixture>(with_nulls).unwrap());
        let b = map_fixture(&serde_json::from_str::<FeedFixture>(absent).unwrap());

        assert_eq!(a.event, None);
        assert_eq!(a.kickoff_time, None);
        assert_eq!(a.team_h_score, None);
        assert!(!a.started);
        assert_eq!(a.event, b.event);
        assert_eq!(a.kickoff_time, b.kickoff_time);
        assert_eq!(a.team_h_score, b.team_h_score);
        assert_eq!(a.team_a_score, b.team_a_score);
    }

    #[test]
    fn chip_overrides_pass_through_untyped() {
        let chip: FeedChip = serde_json::from_str(
            r#"{"id":3,"name":"bboost","number":1,"start_event":1,"stop_event":19,
                "chip_type":"team","overrides":{"rules":{},"scoring":{},"element_types":[],"pick_multiplier":null}}"#,
        )
        .unwrap();
        let mapped = map_chip(&chip);
        assert_eq!(mapped.overrides["pick_multiplier"], JsonValue::Null);
        assert!(mapped.overrides["rules"].is_object());
    }

    #[tokio::test]
    async fn file_feed_replays_captured_payloads() {
        let feed = FileFeed::new(sample_feed_dir());
        let snapshot = feed.fetch_snapshot().await.expect("snapshot");
        let fixtures = feed.fetch_fixtures().await.expect("fixtures");

        assert_eq!(snapshot.teams.len(), 3);
        assert_eq!(snapshot.players.len(), 4);
        assert_eq!(snapshot.chips.len(), 2);
        assert_eq!(fixtures.len(), 3);
        assert!(fixtures.iter().any(|f| f.team_h_score.is_none()));
    }

    #[tokio::test]
    async fn file_feed_reports_missing_payloads() {
        let feed = FileFeed::new(sample_feed_dir().join("does-not-exist"));
        let err = feed.fetch_snapshot().await.unwrap_err();
        assert!(matches!(err, FeedError::Io { .. }));
    }

    #[tokio::test]
    async fn http_feed_decodes_successful_responses() {
        let snapshot = std::fs::read_to_string(sample_feed_dir().join(SNAPSHOT_FILE_NAME)).unwrap();
        let fixtures = std::fs::read_to_string(sample_feed_dir().join(FIXTURES_FILE_NAME)).unwrap();
        let base = serve(
            Router::new()
                .route(
                    "/bootstrap-static/",
                    get(move || {
                        let body = snapshot.clone();
                        async move { body }
                    }),
                )
                .route(
                    "/fixtures/",
                    get(move || {
                        let body = fixtures.clone();
                        async move { body }
                    }),
                ),
        )
        .await;

        let feed = HttpFeed::new(
            FeedEndpoints {
                bootstrap_url: format!("{base}/bootstrap-static/"),
                fixtures_url: format!("{base}/fixtures/"),
            },
            HttpClientConfig::default(),
        )
        .unwrap();

        assert_eq!(feed.fetch_snapshot().await.unwrap().players.len(), 4);
        assert_eq!(feed.fetch_fixtures().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn http_feed_fails_on_non_success_status_with_body() {
        let base = serve(Router::new().route(
            "/fixtures/",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "The game is being updated.") }),
        ))
        .await;

        let feed = HttpFeed::new(
            FeedEndpoints {
                bootstrap_url: format!("{base}/bootstrap-static/"),
                fixtures_url: format!("{base}/fixtures/"),
            },
            HttpClientConfig::default(),
        )
        .unwrap();

        match feed.fetch_fixtures().await.unwrap_err() {
            FeedError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 503);
                assert!(body.contains("being updated"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn http_feed_rejects_malformed_bodies() {
        let base = serve(Router::new().route(
            "/bootstrap-static/",
            get(|| async { r#"{"teams":[{"id":"one"}],"elements":[],"chips":[]}"# }),
        ))
        .await;

        let feed = HttpFeed::new(
            FeedEndpoints {
                bootstrap_url: format!("{base}/bootstrap-static/"),
                fixtures_url: format!("{base}/fixtures/"),
            },
            HttpClientConfig::default(),
        )
        .unwrap();

        assert!(matches!(
            feed.fetch_snapshot().await.unwrap_err(),
            FeedError::Decode { .. }
        ));
    }

    #[tokio::test]
    async fn static_feed_scripts_failures_per_endpoint() {
        let feed = StaticFeed::default().failing_fixtures("upstream down");
        assert!(feed.fetch_snapshot().await.is_ok());
        assert!(matches!(
            feed.fetch_fixtures().await.unwrap_err(),
            FeedError::Unavailable(_)
        ));
    }
}
