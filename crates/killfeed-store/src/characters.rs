use crate::db::Store;
use crate::error::StoreError;
use crate::models::Character;

impl Store {
    /// The full tracked roster. The pipeline reads this on every scheduler
    /// tick; writes come from the external character CRUD.
    pub async fn all_characters(&self) -> Result<Vec<Character>, StoreError> {
        let rows = sqlx::query_as::<_, Character>("SELECT * FROM characters ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// One character by id, when tracked.
    pub async fn character(&self, id: i64) -> Result<Option<Character>, StoreError> {
        let row = sqlx::query_as::<_, Character>("SELECT * FROM characters WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Insert or update a roster entry.
    pub async fn upsert_character(&self, character: &Character) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO characters (id, name, security_status, title, race_id) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE SET \
             name = EXCLUDED.name, \
             security_status = EXCLUDED.security_status, \
             title = EXCLUDED.title, \
             race_id = EXCLUDED.race_id",
        )
        .bind(character.id)
        .bind(&character.name)
        .bind(character.security_status)
        .bind(&character.title)
        .bind(character.race_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a roster entry. Stored kills are not cascaded.
    pub async fn delete_character(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM characters WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
