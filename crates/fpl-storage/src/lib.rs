//! Store gateway for synced FPL entities: the trait the reconciler writes through,
//! Postgres and SQLite implementations, and an in-memory implementation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fpl_core::{Chip, Fixture, Player, Position, Team};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod sqlite;

pub use sqlite::SqliteStore;

pub const CRATE_NAME: &str = "fpl-storage";

/// Natural key the fixture bulk upsert conflicts on.
pub const FIXTURE_CONFLICT_KEY: &str = "id";

/// Columns overwritten unconditionally when a fixture row already exists.
pub const FIXTURE_UPDATE_COLUMNS: &[&str] = &[
    "event",
    "kickoff_time",
    "started",
    "finished",
    "provisional_start_time",
    "team_h_id",
    "team_a_id",
    "team_h_score",
    "team_a_score",
    "team_h_difficulty",
    "team_a_difficulty",
    "minutes",
    "pulse_id",
    "code",
];

const FIXTURE_UPSERT_CHUNK: usize = 1000;

const PLAYER_UPDATE_COLUMNS: &[&str] = &[
    "first_name",
    "second_name",
    "web_name",
    "team_id",
    "position",
    "start_price",
    "current_price",
    "total_points",
    "form",
    "selected_by_percent",
    "transfers_in",
    "transfers_in_event",
    "transfers_out",
    "transfers_out_event",
    "value_form",
    "event_points",
    "ict_index",
];

const TEAM_COLUMNS: &str = "id, name, short_name, code";

const PLAYER_COLUMNS: &str = "id, first_name, second_name, web_name, team_id, position, \
    start_price, current_price, total_points, form, selected_by_percent, transfers_in, \
    transfers_in_event, transfers_out, transfers_out_event, value_form, event_points, ict_index";

const FIXTURE_COLUMNS: &str = "id, event, kickoff_time, started, finished, provisional_start_time, \
    team_h_id, team_a_id, team_h_score, team_a_score, team_h_difficulty, team_a_difficulty, \
    minutes, pulse_id, code";

const CHIP_COLUMNS: &str = "id, name, number, start_event, stop_event, chip_type, overrides";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} already exists")]
    Conflict { entity: &'static str, id: i32 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence operations the sync engine depends on.
///
/// Lookups return `Ok(None)` when no row has the id. `save_*` replaces any
/// existing row with the same id; `insert_player` fails with
/// [`StoreError::Conflict`] instead.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    async fn find_team(&self, id: i32) -> StoreResult<Option<Team>>;
    async fn find_player(&self, id: i32) -> StoreResult<Option<Player>>;
    async fn find_fixture(&self, id: i32) -> StoreResult<Option<Fixture>>;
    async fn find_chip(&self, id: i32) -> StoreResult<Option<Chip>>;

    async fn save_team(&self, team: &Team) -> StoreResult<()>;
    async fn insert_player(&self, player: &Player) -> StoreResult<()>;
    async fn save_player(&self, player: &Player) -> StoreResult<()>;
    async fn save_chip(&self, chip: &Chip) -> StoreResult<()>;

    /// Bulk insert keyed on fixture id; existing rows get every column in
    /// [`FIXTURE_UPDATE_COLUMNS`] overwritten.
    async fn upsert_fixtures(&self, fixtures: &[Fixture]) -> StoreResult<()>;

    async fn list_teams(&self) -> StoreResult<Vec<Team>>;
    async fn list_players(&self) -> StoreResult<Vec<Player>>;
    async fn list_fixtures(&self) -> StoreResult<Vec<Fixture>>;
    async fn list_chips(&self) -> StoreResult<Vec<Chip>>;
}

/// Relational backend behind the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    Postgres,
    Sqlite,
}

impl DatabaseKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            "sqlite" | "sqlite3" => Some(Self::Sqlite),
            _ => None,
        }
    }

    pub fn from_url(url: &str) -> Option<Self> {
        let url = url.trim();
        if url.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else {
            None
        }
    }

    /// An explicit type name wins over the url scheme; Postgres when neither says.
    pub fn resolve(explicit: Option<&str>, url: &str) -> Self {
        explicit
            .and_then(Self::parse)
            .or_else(|| Self::from_url(url))
            .unwrap_or(Self::Postgres)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens the configured backend and applies its migrations.
pub async fn connect_gateway(
    kind: DatabaseKind,
    database_url: &str,
    max_connections: u32,
) -> StoreResult<Arc<dyn StoreGateway>> {
    let store: Arc<dyn StoreGateway> = match kind {
        DatabaseKind::Postgres => {
            let store = PgStore::connect(database_url, max_connections).await?;
            store.migrate().await?;
            Arc::new(store)
        }
        DatabaseKind::Sqlite => {
            let store = SqliteStore::connect(database_url, max_connections).await?;
            store.migrate().await?;
            Arc::new(store)
        }
    };
    info!(backend = kind.as_str(), "store connected and migrated");
    Ok(store)
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        Ok(())
    }
}

/// `ON CONFLICT DO UPDATE` assignments; `now` is the backend's current-timestamp expression.
fn update_assignments(columns: &[&str], now: &str) -> String {
    columns
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .chain(std::iter::once(format!("updated_at = {now}")))
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

fn team_from_row(row: &PgRow) -> Result<Team, sqlx::Error> {
    Ok(Team {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        short_name: row.try_get("short_name")?,
        code: row.try_get("code")?,
    })
}

fn player_from_row(row: &PgRow) -> Result<Player, sqlx::Error> {
    let position: String = row.try_get("position")?;
    Ok(Player {
        id: row.try_get("id")?,
        first_name: row.try_get("first_name")?,
        second_name: row.try_get("second_name")?,
        web_name: row.try_get("web_name")?,
        team_id: row.try_get("team_id")?,
        position: Position::from_code(&position),
        start_price: row.try_get("start_price")?,
        current_price: row.try_get("current_price")?,
        total_points: row.try_get("total_points")?,
        form: row.try_get("form")?,
        selected_by_percent: row.try_get("selected_by_percent")?,
        transfers_in: row.try_get("transfers_in")?,
        transfers_in_event: row.try_get("transfers_in_event")?,
        transfers_out: row.try_get("transfers_out")?,
        transfers_out_event: row.try_get("transfers_out_event")?,
        value_form: row.try_get("value_form")?,
        event_points: row.try_get("event_points")?,
        ict_index: row.try_get("ict_index")?,
    })
}

fn fixture_from_row(row: &PgRow) -> Result<Fixture, sqlx::Error> {
    Ok(Fixture {
        id: row.try_get("id")?,
        event: row.try_get("event")?,
        kickoff_time: row.try_get("kickoff_time")?,
        started: row.try_get("started")?,
        finished: row.try_get("finished")?,
        provisional_start_time: row.try_get("provisional_start_time")?,
        team_h_id: row.try_get("team_h_id")?,
        team_a_id: row.try_get("team_a_id")?,
        team_h_score: row.try_get("team_h_score")?,
        team_a_score: row.try_get("team_a_score")?,
        team_h_difficulty: row.try_get("team_h_difficulty")?,
        team_a_difficulty: row.try_get("team_a_difficulty")?,
        minutes: row.try_get("minutes")?,
        pulse_id: row.try_get("pulse_id")?,
        code: row.try_get("code")?,
    })
}

fn chip_from_row(row: &PgRow) -> Result<Chip, sqlx::Error> {
    Ok(Chip {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        number: row.try_get("number")?,
        start_event: row.try_get("start_event")?,
        stop_event: row.try_get("stop_event")?,
        chip_type: row.try_get("chip_type")?,
        overrides: row.try_get("overrides")?,
    })
}

fn bind_player<'q>(
    query: Query<'q, Postgres, PgArguments>,
    player: &'q Player,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(player.id)
        .bind(&player.first_name)
        .bind(&player.second_name)
        .bind(&player.web_name)
        .bind(player.team_id)
        .bind(player.position.code())
        .bind(player.start_price)
        .bind(player.current_price)
        .bind(player.total_points)
        .bind(&player.form)
        .bind(player.selected_by_percent)
        .bind(player.transfers_in)
        .bind(player.transfers_in_event)
        .bind(player.transfers_out)
        .bind(player.transfers_out_event)
        .bind(player.value_form)
        .bind(player.event_points)
        .bind(&player.ict_index)
}

const PLAYER_VALUES: &str =
    "($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)";

#[async_trait]
impl StoreGateway for PgStore {
    async fn find_team(&self, id: i32) -> StoreResult<Option<Team>> {
        let row = sqlx::query(&format!("SELECT {TEAM_COLUMNS} FROM teams WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(team_from_row).transpose()?)
    }

    async fn find_player(&self, id: i32) -> StoreResult<Option<Player>> {
        let row = sqlx::query(&format!("SELECT {PLAYER_COLUMNS} FROM players WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(player_from_row).transpose()?)
    }

    async fn find_fixture(&self, id: i32) -> StoreResult<Option<Fixture>> {
        let row = sqlx::query(&format!("SELECT {FIXTURE_COLUMNS} FROM fixtures WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(fixture_from_row).transpose()?)
    }

    async fn find_chip(&self, id: i32) -> StoreResult<Option<Chip>> {
        let row = sqlx::query(&format!("SELECT {CHIP_COLUMNS} FROM chips WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(chip_from_row).transpose()?)
    }

    async fn save_team(&self, team: &Team) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO teams (id, name, short_name, code)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name,
                   short_name = EXCLUDED.short_name,
                   code = EXCLUDED.code,
                   updated_at = NOW()
            "#,
        )
        .bind(team.id)
        .bind(&team.name)
        .bind(&team.short_name)
        .bind(team.code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_player(&self, player: &Player) -> StoreResult<()> {
        let sql = format!("INSERT INTO players ({PLAYER_COLUMNS}) VALUES {PLAYER_VALUES}");
        match bind_player(sqlx::query(&sql), player).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict {
                entity: "player",
                id: player.id,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_player(&self, player: &Player) -> StoreResult<()> {
        let assignments = update_assignments(PLAYER_UPDATE_COLUMNS, "NOW()");
        let sql = format!(
            "INSERT INTO players ({PLAYER_COLUMNS}) VALUES {PLAYER_VALUES} \
             ON CONFLICT (id) DO UPDATE SET {assignments}"
        );
        bind_player(sqlx::query(&sql), player)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_chip(&self, chip: &Chip) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chips (id, name, number, start_event, stop_event, chip_type, overrides)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name,
                   number = EXCLUDED.number,
                   start_event = EXCLUDED.start_event,
                   stop_event = EXCLUDED.stop_event,
                   chip_type = EXCLUDED.chip_type,
                   overrides = EXCLUDED.overrides,
                   updated_at = NOW()
            "#,
        )
        .bind(chip.id)
        .bind(&chip.name)
        .bind(chip.number)
        .bind(chip.start_event)
        .bind(chip.stop_event)
        .bind(&chip.chip_type)
        .bind(&chip.overrides)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_fixtures(&self, fixtures: &[Fixture]) -> StoreResult<()> {
        if fixtures.is_empty() {
            return Ok(());
        }

        let assignments = update_assignments(FIXTURE_UPDATE_COLUMNS, "NOW()");
        let mut tx = self.pool.begin().await?;
        for chunk in fixtures.chunks(FIXTURE_UPSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new(format!("INSERT INTO fixtures ({FIXTURE_COLUMNS}) "));
            qb.push_values(chunk, |mut b, fixture| {
                b.push_bind(fixture.id)
                    .push_bind(fixture.event)
                    .push_bind(fixture.kickoff_time)
                    .push_bind(fixture.started)
                    .push_bind(fixture.finished)
                    .push_bind(fixture.provisional_start_time)
                    .push_bind(fixture.team_h_id)
                    .push_bind(fixture.team_a_id)
                    .push_bind(fixture.team_h_score)
                    .push_bind(fixture.team_a_score)
                    .push_bind(fixture.team_h_difficulty)
                    .push_bind(fixture.team_a_difficulty)
                    .push_bind(fixture.minutes)
                    .push_bind(fixture.pulse_id)
                    .push_bind(fixture.code);
            });
            qb.push(format!(
                " ON CONFLICT ({FIXTURE_CONFLICT_KEY}) DO UPDATE SET {assignments}"
            ));
            qb.build().execute(&mut *tx).await?;
            debug!(rows = chunk.len(), "fixture chunk upserted");
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_teams(&self) -> StoreResult<Vec<Team>> {
        let rows = sqlx::query(&format!("SELECT {TEAM_COLUMNS} FROM teams ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(team_from_row).collect::<Result<_, _>>()?)
    }

    async fn list_players(&self) -> StoreResult<Vec<Player>> {
        let rows = sqlx::query(&format!("SELECT {PLAYER_COLUMNS} FROM players ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(player_from_row).collect::<Result<_, _>>()?)
    }

    async fn list_fixtures(&self) -> StoreResult<Vec<Fixture>> {
        let rows = sqlx::query(&format!("SELECT {FIXTURE_COLUMNS} FROM fixtures ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(fixture_from_row).collect::<Result<_, _>>()?)
    }

    async fn list_chips(&self) -> StoreResult<Vec<Chip>> {
        let rows = sqlx::query(&format!("SELECT {CHIP_COLUMNS} FROM chips ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(chip_from_row).collect::<Result<_, _>>()?)
    }
}

/// Number of write calls a [`MemoryStore`] has accepted, per entity type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub teams: usize,
    pub players: usize,
    pub fixtures: usize,
    pub chips: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    teams: BTreeMap<i32, Team>,
    players: BTreeMap<i32, Player>,
    fixtures: BTreeMap<i32, Fixture>,
    chips: BTreeMap<i32, Chip>,
    writes: WriteCounts,
}

/// Process-local gateway with the same semantics as [`PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn writes(&self) -> WriteCounts {
        self.state.lock().await.writes
    }
}

#[async_trait]
impl StoreGateway for MemoryStore {
    async fn find_team(&self, id: i32) -> StoreResult<Option<Team>> {
        Ok(self.state.lock().await.teams.get(&id).cloned())
    }

    async fn find_player(&self, id: i32) -> StoreResult<Option<Player>> {
        Ok(self.state.lock().await.players.get(&id).cloned())
    }

    async fn find_fixture(&self, id: i32) -> StoreResult<Option<Fixture>> {
        Ok(self.state.lock().await.fixtures.get(&id).cloned())
    }

    async fn find_chip(&self, id: i32) -> StoreResult<Option<Chip>> {
        Ok(self.state.lock().await.chips.get(&id).cloned())
    }

    async fn save_team(&self, team: &Team) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.teams.insert(team.id, team.clone());
        state.writes.teams += 1;
        Ok(())
    }

    async fn insert_player(&self, player: &Player) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.players.contains_key(&player.id) {
            return Err(StoreError::Conflict {
                entity: "player",
                id: player.id,
            });
        }
        state.players.insert(player.id, player.clone());
        state.writes.players += 1;
        Ok(())
    }

    async fn save_player(&self, player: &Player) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.players.insert(player.id, player.clone());
        state.writes.players += 1;
        Ok(())
    }

    async fn save_chip(&self, chip: &Chip) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.chips.insert(chip.id, chip.clone());
        state.writes.chips += 1;
        Ok(())
    }

    async fn upsert_fixtures(&self, fixtures: &[Fixture]) -> StoreResult<()> {
        if fixtures.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        // Every non-key column is in FIXTURE_UPDATE_COLUMNS, so a conflict replaces the row.
        for fixture in fixtures {
            state.fixtures.insert(fixture.id, fixture.clone());
        }
        state.writes.fixtures += 1;
        Ok(())
    }

    async fn list_teams(&self) -> StoreResult<Vec<Team>> {
        Ok(self.state.lock().await.teams.values().cloned().collect())
    }

    async fn list_players(&self) -> StoreResult<Vec<Player>> {
        Ok(self.state.lock().await.players.values().cloned().collect())
    }

    async fn list_fixtures(&self) -> StoreResult<Vec<Fixture>> {
        Ok(self.state.lock().await.fixtures.values().cloned().collect())
    }

    async fn list_chips(&self) -> StoreResult<Vec<Chip>> {
        Ok(self.state.lock().await.chips.values().cloned().collect())
    }
}
