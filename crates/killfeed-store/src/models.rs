use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, Row};

/// A tracked player character. The pipeline only reads the roster; rows are
/// maintained by the external character CRUD.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct Character {
    /// Character identifier (unique).
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Security score.
    #[serde(default)]
    pub security_status: f64,
    /// Optional character title.
    #[serde(default)]
    pub title: Option<String>,
    /// Race identifier.
    #[serde(default)]
    pub race_id: i32,
}

/// Per-character aggregation over stored kills.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct CharacterStats {
    /// Character the aggregation is grouped by.
    pub character_id: i64,
    /// Number of kill rows.
    pub kill_count: i64,
    /// Sum of `total_value` over the rows.
    pub total_value: f64,
}

/// One killmail reference as listed by the summary source, with the economic
/// summary nested under `zkb`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryRef {
    /// Killmail identifier.
    pub killmail_id: i64,
    /// Economic summary block.
    pub zkb: ZkbSummary,
}

/// Economic summary fields attached to a [`SummaryRef`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ZkbSummary {
    /// Location identifier (celestial near the kill).
    #[serde(rename = "locationID", default)]
    pub location_id: i64,
    /// Opaque content hash; required to fetch the detail record.
    #[serde(default)]
    pub hash: String,
    /// Value of the fitted modules, in ISK.
    #[serde(rename = "fittedValue", default)]
    pub fitted_value: f64,
    /// Value of the dropped items, in ISK.
    #[serde(rename = "droppedValue", default)]
    pub dropped_value: f64,
    /// Value of the destroyed items, in ISK.
    #[serde(rename = "destroyedValue", default)]
    pub destroyed_value: f64,
    /// Total value of the loss, in ISK.
    #[serde(rename = "totalValue", default)]
    pub total_value: f64,
    /// Point score.
    #[serde(default)]
    pub points: i32,
    /// Kill was made by NPCs.
    #[serde(default)]
    pub npc: bool,
    /// Solo kill.
    #[serde(default)]
    pub solo: bool,
    /// Awox (friendly-fire) kill.
    #[serde(default)]
    pub awox: bool,
}

/// Position of the victim wreck in space.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z coordinate.
    pub z: f64,
}

/// One item destroyed or dropped with the victim ship.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VictimItem {
    /// Item type identifier.
    pub item_type_id: i64,
    /// Quantity destroyed, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_destroyed: Option<i64>,
    /// Quantity dropped, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_dropped: Option<i64>,
    /// Inventory flag (slot) the item occupied.
    #[serde(default)]
    pub flag: i32,
    /// Singleton marker (e.g. assembled/unpackaged).
    #[serde(default)]
    pub singleton: i32,
}

/// The victim block of a detail record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Victim {
    /// Alliance identifier, when the victim belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alliance_id: Option<i64>,
    /// Character identifier; absent for structures and NPC losses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<i64>,
    /// Corporation identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corporation_id: Option<i64>,
    /// Faction identifier, for faction-warfare losses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faction_id: Option<i64>,
    /// Total damage taken.
    #[serde(default)]
    pub damage_taken: i64,
    /// Ship type that was destroyed.
    #[serde(default)]
    pub ship_type_id: i64,
    /// Wreck position, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Items fitted to or carried by the ship.
    #[serde(default)]
    pub items: Vec<VictimItem>,
}

/// One attacker on a killmail.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Attacker {
    /// Alliance identifier, when the attacker belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alliance_id: Option<i64>,
    /// Character identifier; absent for NPC attackers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<i64>,
    /// Corporation identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corporation_id: Option<i64>,
    /// Faction identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faction_id: Option<i64>,
    /// Damage dealt by this attacker.
    #[serde(default)]
    pub damage_done: i64,
    /// Whether this attacker landed the final blow.
    #[serde(default)]
    pub final_blow: bool,
    /// Attacker security score.
    #[serde(default)]
    pub security_status: f64,
    /// Ship type the attacker flew, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ship_type_id: Option<i64>,
    /// Weapon type that dealt the damage, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weapon_type_id: Option<i64>,
}

/// The authoritative killmail record served by the detail source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetailRecord {
    /// Killmail identifier.
    pub killmail_id: i64,
    /// Event timestamp (UTC, second precision).
    pub killmail_time: DateTime<Utc>,
    /// Solar system the kill happened in.
    pub solar_system_id: i64,
    /// Victim block.
    pub victim: Victim,
    /// Ordered attacker list.
    #[serde(default)]
    pub attackers: Vec<Attacker>,
}

/// A merged, stored kill row: summary economics + authoritative detail.
///
/// Primary key is `killmail_id`; `character_id` is the tracked character that
/// caused ingestion, not necessarily the victim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Kill {
    /// Killmail identifier (primary key).
    pub killmail_id: i64,
    /// Tracked character this row was ingested for.
    pub character_id: i64,
    /// Event timestamp.
    pub kill_time: DateTime<Utc>,
    /// Solar system identifier.
    pub solar_system_id: i64,
    /// Location identifier from the summary source.
    pub location_id: i64,
    /// Content hash from the summary source.
    pub hash: String,
    /// Fitted value, in ISK.
    pub fitted_value: f64,
    /// Dropped value, in ISK.
    pub dropped_value: f64,
    /// Destroyed value, in ISK.
    pub destroyed_value: f64,
    /// Total value, in ISK.
    pub total_value: f64,
    /// Point score.
    pub points: i32,
    /// NPC kill flag.
    pub npc: bool,
    /// Solo kill flag.
    pub solo: bool,
    /// Awox kill flag.
    pub awox: bool,
    /// Embedded victim (flattened into `victim_*` columns).
    pub victim: Victim,
    /// Attacker list (stored as one JSON document column).
    pub attackers: Vec<Attacker>,
}

impl Kill {
    /// Merge a summary reference and a detail record into a storable row.
    pub fn merge(character_id: i64, summary: &SummaryRef, detail: DetailRecord) -> Self {
        Self {
            killmail_id: summary.killmail_id,
            character_id,
            kill_time: detail.killmail_time,
            solar_system_id: detail.solar_system_id,
            location_id: summary.zkb.location_id,
            hash: summary.zkb.hash.clone(),
            fitted_value: summary.zkb.fitted_value,
            dropped_value: summary.zkb.dropped_value,
            destroyed_value: summary.zkb.destroyed_value,
            total_value: summary.zkb.total_value,
            points: summary.zkb.points,
            npc: summary.zkb.npc,
            solo: summary.zkb.solo,
            awox: summary.zkb.awox,
            victim: detail.victim,
            attackers: detail.attackers,
        }
    }

    /// A row is complete iff both pipeline stages succeeded: non-zero event
    /// timestamp, solar system and victim ship type.
    pub fn is_complete(&self) -> bool {
        self.kill_time.timestamp() != 0 && self.solar_system_id != 0 && self.victim.ship_type_id != 0
    }
}

impl<'r> FromRow<'r, PgRow> for Kill {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let position = match (
            row.try_get::<Option<f64>, _>("victim_position_x")?,
            row.try_get::<Option<f64>, _>("victim_position_y")?,
            row.try_get::<Option<f64>, _>("victim_position_z")?,
        ) {
            (Some(x), Some(y), Some(z)) => Some(Position { x, y, z }),
            _ => None,
        };

        let Json(items): Json<Vec<VictimItem>> = row.try_get("victim_items")?;
        let Json(attackers): Json<Vec<Attacker>> = row.try_get("attackers")?;

        Ok(Self {
            killmail_id: row.try_get("killmail_id")?,
            character_id: row.try_get("character_id")?,
            kill_time: row.try_get("kill_time")?,
            solar_system_id: row.try_get("solar_system_id")?,
            location_id: row.try_get("location_id")?,
            hash: row.try_get("hash")?,
            fitted_value: row.try_get("fitted_value")?,
            dropped_value: row.try_get("dropped_value")?,
            destroyed_value: row.try_get("destroyed_value")?,
            total_value: row.try_get("total_value")?,
            points: row.try_get("points")?,
            npc: row.try_get("npc")?,
            solo: row.try_get("solo")?,
            awox: row.try_get("awox")?,
            victim: Victim {
                alliance_id: row.try_get("victim_alliance_id")?,
                character_id: row.try_get("victim_character_id")?,
                corporation_id: row.try_get("victim_corporation_id")?,
                faction_id: row.try_get("victim_faction_id")?,
                damage_taken: row.try_get("victim_damage_taken")?,
                ship_type_id: row.try_get("victim_ship_type_id")?,
                position,
                items,
            },
            attackers,
        })
    }
}
