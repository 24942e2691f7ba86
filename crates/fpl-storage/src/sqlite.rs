//! SQLite gateway for single-file deployments.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use fpl_core::{Chip, Fixture, Player, Position, Team};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use super::{
    is_unique_violation, update_assignments, StoreError, StoreGateway, StoreResult, CHIP_COLUMNS,
    FIXTURE_COLUMNS, FIXTURE_CONFLICT_KEY, FIXTURE_UPDATE_COLUMNS, PLAYER_COLUMNS,
    PLAYER_UPDATE_COLUMNS, TEAM_COLUMNS,
};

/// 15 binds per row keeps a chunk well under SQLite's variable limit.
const FIXTURE_UPSERT_CHUNK: usize = 500;

const NOW: &str = "CURRENT_TIMESTAMP";

const PLAYER_VALUES: &str = "(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file named by a `sqlite:` url.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database. One connection that never idles out, so the data lives as
    /// long as the store.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        Ok(())
    }
}

fn team_from_row(row: &SqliteRow) -> Result<Team, sqlx::Error> {
    Ok(Team {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        short_name: row.try_get("short_name")?,
        code: row.try_get("code")?,
    })
}

fn player_from_row(row: &SqliteRow) -> Result<Player, sqlx::Error> {
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

fn fixture_from_row(row: &SqliteRow) -> Result<Fixture, sqlx::Error> {
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

fn chip_from_row(row: &SqliteRow) -> Result<Chip, sqlx::Error> {
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
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    player: &'q Player,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
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

#[async_trait]
impl StoreGateway for SqliteStore {
    async fn find_team(&self, id: i32) -> StoreResult<Option<Team>> {
        let row = sqlx::query(&format!("SELECT {TEAM_COLUMNS} FROM teams WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(team_from_row).transpose()?)
    }

    async fn find_player(&self, id: i32) -> StoreResult<Option<Player>> {
        let row = sqlx::query(&format!("SELECT {PLAYER_COLUMNS} FROM players WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(player_from_row).transpose()?)
    }

    async fn find_fixture(&self, id: i32) -> StoreResult<Option<Fixture>> {
        let row = sqlx::query(&format!("SELECT {FIXTURE_COLUMNS} FROM fixtures WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(fixture_from_row).transpose()?)
    }

    async fn find_chip(&self, id: i32) -> StoreResult<Option<Chip>> {
        let row = sqlx::query(&format!("SELECT {CHIP_COLUMNS} FROM chips WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(chip_from_row).transpose()?)
    }

    async fn save_team(&self, team: &Team) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO teams ({TEAM_COLUMNS}) VALUES (?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET {}",
            update_assignments(&["name", "short_name", "code"], NOW)
        );
        sqlx::query(&sql)
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
        let sql = format!(
            "INSERT INTO players ({PLAYER_COLUMNS}) VALUES {PLAYER_VALUES} \
             ON CONFLICT (id) DO UPDATE SET {}",
            update_assignments(PLAYER_UPDATE_COLUMNS, NOW)
        );
        bind_player(sqlx::query(&sql), player)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_chip(&self, chip: &Chip) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO chips ({CHIP_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET {}",
            update_assignments(
                &["name", "number", "start_event", "stop_event", "chip_type", "overrides"],
                NOW
            )
        );
        sqlx::query(&sql)
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

        let assignments = update_assignments(FIXTURE_UPDATE_COLUMNS, NOW);
        let mut tx = self.pool.begin().await?;
        for chunk in fixtures.chunks(FIXTURE_UPSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, Sqlite> =
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
