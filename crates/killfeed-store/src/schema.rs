use crate::db::Store;
use crate::error::StoreError;

const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS characters (
        id              BIGINT PRIMARY KEY,
        name            TEXT NOT NULL,
        security_status DOUBLE PRECISION NOT NULL DEFAULT 0,
        title           TEXT,
        race_id         INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS kills (
        killmail_id           BIGINT PRIMARY KEY,
        character_id          BIGINT NOT NULL,
        kill_time             TIMESTAMPTZ NOT NULL,
        solar_system_id       BIGINT NOT NULL,
        location_id           BIGINT NOT NULL DEFAULT 0,
        hash                  TEXT NOT NULL,
        fitted_value          DOUBLE PRECISION NOT NULL DEFAULT 0,
        dropped_value         DOUBLE PRECISION NOT NULL DEFAULT 0,
        destroyed_value       DOUBLE PRECISION NOT NULL DEFAULT 0,
        total_value           DOUBLE PRECISION NOT NULL DEFAULT 0,
        points                INTEGER NOT NULL DEFAULT 0,
        npc                   BOOLEAN NOT NULL DEFAULT FALSE,
        solo                  BOOLEAN NOT NULL DEFAULT FALSE,
        awox                  BOOLEAN NOT NULL DEFAULT FALSE,
        victim_alliance_id    BIGINT,
        victim_character_id   BIGINT,
        victim_corporation_id BIGINT,
        victim_faction_id     BIGINT,
        victim_damage_taken   BIGINT NOT NULL DEFAULT 0,
        victim_ship_type_id   BIGINT NOT NULL DEFAULT 0,
        victim_position_x     DOUBLE PRECISION,
        victim_position_y     DOUBLE PRECISION,
        victim_position_z     DOUBLE PRECISION,
        victim_items          JSONB NOT NULL DEFAULT '[]',
        attackers             JSONB NOT NULL DEFAULT '[]'
    )",
    "CREATE INDEX IF NOT EXISTS kills_character_id_idx ON kills (character_id)",
    "CREATE INDEX IF NOT EXISTS kills_kill_time_idx ON kills (kill_time)",
    // Hydrated by the external universe-catalog job; kills carry no FK to it.
    "CREATE TABLE IF NOT EXISTS systems (
        system_id        BIGINT PRIMARY KEY,
        name             TEXT NOT NULL DEFAULT '',
        constellation_id BIGINT NOT NULL DEFAULT 0,
        region_id        BIGINT NOT NULL DEFAULT 0,
        security_status  DOUBLE PRECISION NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS systems_region_id_idx ON systems (region_id)",
];

impl Store {
    /// Create the tables and indices if they do not exist yet.
    ///
    /// Called once at startup; a failure here is fatal to the process.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in DDL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("schema ready");
        Ok(())
    }
}
