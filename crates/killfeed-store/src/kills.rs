use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};

use crate::db::Store;
use crate::error::StoreError;
use crate::models::{CharacterStats, Kill};

/// Upsert chunk size: 25 bind parameters per row, well under the Postgres
/// prepared-statement limit.
const UPSERT_CHUNK: usize = 100;

const KILL_COLUMNS: &str = "killmail_id, character_id, kill_time, solar_system_id, location_id, hash, \
     fitted_value, dropped_value, destroyed_value, total_value, points, npc, solo, awox, \
     victim_alliance_id, victim_character_id, victim_corporation_id, victim_faction_id, \
     victim_damage_taken, victim_ship_type_id, victim_position_x, victim_position_y, \
     victim_position_z, victim_items, attackers";

/// Optional date-range filters for the read queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct KillFilters {
    /// Keep kills at or after this time.
    pub start: Option<DateTime<Utc>>,
    /// Keep kills at or before this time.
    pub end: Option<DateTime<Utc>>,
}

impl Store {
    /// Which of the given killmail ids are already stored. Single round trip.
    pub async fn exists_batch(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let known: Vec<i64> =
            sqlx::query_scalar("SELECT killmail_id FROM kills WHERE killmail_id = ANY($1)")
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(known.into_iter().collect())
    }

    /// Latest stored `kill_time` for a character, when any row exists.
    pub async fn last_kill_time(
        &self,
        character_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let max: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(kill_time) FROM kills WHERE character_id = $1")
                .bind(character_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(max)
    }

    /// Insert-or-update a batch of kill rows in one transaction.
    ///
    /// Conflicts on `killmail_id` overwrite every merged column; the latest
    /// fetch wins. Returns the number of rows accepted.
    pub async fn upsert_batch(&self, kills: &[Kill]) -> Result<usize, StoreError> {
        if kills.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for chunk in kills.chunks(UPSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO kills ({KILL_COLUMNS}) "));
            qb.push_values(chunk, |mut b, kill| {
                b.push_bind(kill.killmail_id)
                    .push_bind(kill.character_id)
                    .push_bind(kill.kill_time)
                    .push_bind(kill.solar_system_id)
                    .push_bind(kill.location_id)
                    .push_bind(&kill.hash)
                    .push_bind(kill.fitted_value)
                    .push_bind(kill.dropped_value)
                    .push_bind(kill.destroyed_value)
                    .push_bind(kill.total_value)
                    .push_bind(kill.points)
                    .push_bind(kill.npc)
                    .push_bind(kill.solo)
                    .push_bind(kill.awox)
                    .push_bind(kill.victim.alliance_id)
                    .push_bind(kill.victim.character_id)
                    .push_bind(kill.victim.corporation_id)
                    .push_bind(kill.victim.faction_id)
                    .push_bind(kill.victim.damage_taken)
                    .push_bind(kill.victim.ship_type_id)
                    .push_bind(kill.victim.position.map(|p| p.x))
                    .push_bind(kill.victim.position.map(|p| p.y))
                    .push_bind(kill.victim.position.map(|p| p.z))
                    .push_bind(Json(&kill.victim.items))
                    .push_bind(Json(&kill.attackers));
            });
            qb.push(
                " ON CONFLICT (killmail_id) DO UPDATE SET \
                 character_id = EXCLUDED.character_id, \
                 kill_time = EXCLUDED.kill_time, \
                 solar_system_id = EXCLUDED.solar_system_id, \
                 location_id = EXCLUDED.location_id, \
                 hash = EXCLUDED.hash, \
                 fitted_value = EXCLUDED.fitted_value, \
                 dropped_value = EXCLUDED.dropped_value, \
                 destroyed_value = EXCLUDED.destroyed_value, \
                 total_value = EXCLUDED.total_value, \
                 points = EXCLUDED.points, \
                 npc = EXCLUDED.npc, \
                 solo = EXCLUDED.solo, \
                 awox = EXCLUDED.awox, \
                 victim_alliance_id = EXCLUDED.victim_alliance_id, \
                 victim_character_id = EXCLUDED.victim_character_id, \
                 victim_corporation_id = EXCLUDED.victim_corporation_id, \
                 victim_faction_id = EXCLUDED.victim_faction_id, \
                 victim_damage_taken = EXCLUDED.victim_damage_taken, \
                 victim_ship_type_id = EXCLUDED.victim_ship_type_id, \
                 victim_position_x = EXCLUDED.victim_position_x, \
                 victim_position_y = EXCLUDED.victim_position_y, \
                 victim_position_z = EXCLUDED.victim_position_z, \
                 victim_items = EXCLUDED.victim_items, \
                 attackers = EXCLUDED.attackers",
            );
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        tracing::debug!(rows = kills.len(), "upserted kill batch");
        Ok(kills.len())
    }

    /// Paginated kills for one character, newest first.
    pub async fn kills_for_character(
        &self,
        character_id: i64,
        page: u32,
        page_size: u32,
        filters: KillFilters,
    ) -> Result<Vec<Kill>, StoreError> {
        let offset = page.saturating_sub(1) as i64 * page_size as i64;
        let rows = sqlx::query_as::<_, Kill>(
            "SELECT * FROM kills \
             WHERE character_id = $1 \
               AND ($2::timestamptz IS NULL OR kill_time >= $2) \
               AND ($3::timestamptz IS NULL OR kill_time <= $3) \
             ORDER BY kill_time DESC LIMIT $4 OFFSET $5",
        )
        .bind(character_id)
        .bind(filters.start)
        .bind(filters.end)
        .bind(page_size as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Paginated kills in a region, newest first. Region membership is
    /// resolved through the `systems` catalog table.
    pub async fn kills_for_region(
        &self,
        region_id: i64,
        page: u32,
        page_size: u32,
        filters: KillFilters,
    ) -> Result<Vec<Kill>, StoreError> {
        let offset = page.saturating_sub(1) as i64 * page_size as i64;
        let rows = sqlx::query_as::<_, Kill>(
            "SELECT k.* FROM kills k \
             JOIN systems s ON k.solar_system_id = s.system_id \
             WHERE s.region_id = $1 \
               AND ($2::timestamptz IS NULL OR k.kill_time >= $2) \
               AND ($3::timestamptz IS NULL OR k.kill_time <= $3) \
             ORDER BY k.kill_time DESC LIMIT $4 OFFSET $5",
        )
        .bind(region_id)
        .bind(filters.start)
        .bind(filters.end)
        .bind(page_size as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Kill count and total value per character over the filtered rows.
    pub async fn character_stats(
        &self,
        region_id: Option<i64>,
        filters: KillFilters,
    ) -> Result<Vec<CharacterStats>, StoreError> {
        let rows = match region_id {
            Some(region_id) => {
                sqlx::query_as::<_, CharacterStats>(
                    "SELECT k.character_id, COUNT(*) AS kill_count, \
                            COALESCE(SUM(k.total_value), 0) AS total_value \
                     FROM kills k \
                     JOIN systems s ON k.solar_system_id = s.system_id \
                     WHERE s.region_id = $1 \
                       AND ($2::timestamptz IS NULL OR k.kill_time >= $2) \
                       AND ($3::timestamptz IS NULL OR k.kill_time <= $3) \
                     GROUP BY k.character_id",
                )
                .bind(region_id)
                .bind(filters.start)
                .bind(filters.end)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, CharacterStats>(
                    "SELECT character_id, COUNT(*) AS kill_count, \
                            COALESCE(SUM(total_value), 0) AS total_value \
                     FROM kills \
                     WHERE ($1::timestamptz IS NULL OR kill_time >= $1) \
                       AND ($2::timestamptz IS NULL OR kill_time <= $2) \
                     GROUP BY character_id",
                )
                .bind(filters.start)
                .bind(filters.end)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }
}
