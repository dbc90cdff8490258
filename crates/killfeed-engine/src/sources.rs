//! Seams between the pipeline and its collaborators: the two upstream
//! sources and the local store. The engine only talks to these traits, so
//! tests can substitute in-memory fakes.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use killfeed_store::models::{DetailRecord, Kill, SummaryRef};
use killfeed_store::{Store, StoreError};

use crate::detail::DetailError;
use crate::summary::SummaryError;

/// The paginated per-character killmail listing.
#[async_trait]
pub trait SummarySource: Send + Sync {
    /// One page (1-based) of summary references for a character, newest
    /// first. An empty page means the listing is exhausted.
    async fn kills_page(
        &self,
        character_id: i64,
        page: u32,
    ) -> Result<Vec<SummaryRef>, SummaryError>;
}

/// The authoritative killmail detail source.
#[async_trait]
pub trait DetailSource: Send + Sync {
    /// Fetch one killmail by `(id, hash)`.
    ///
    /// `cancel` interrupts every wait on the way to the wire — most notably
    /// the error-budget admission loop, which can otherwise block for a full
    /// budget window.
    async fn killmail(
        &self,
        killmail_id: i64,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<DetailRecord, DetailError>;
}

/// Store operations the pipeline needs.
#[async_trait]
pub trait KillRepo: Send + Sync {
    /// Which of the given ids are already stored.
    async fn exists_batch(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError>;

    /// Latest stored kill time for a character, when any.
    async fn last_kill_time(&self, character_id: i64)
    -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Insert-or-update a batch of rows; all-or-nothing.
    async fn upsert_batch(&self, kills: &[Kill]) -> Result<usize, StoreError>;
}

/// Read access to the tracked-character roster.
#[async_trait]
pub trait Roster: Send + Sync {
    /// Identifiers of every tracked character.
    async fn character_ids(&self) -> Result<Vec<i64>, StoreError>;
}

#[async_trait]
impl KillRepo for Store {
    async fn exists_batch(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        Store::exists_batch(self, ids).await
    }

    async fn last_kill_time(
        &self,
        character_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Store::last_kill_time(self, character_id).await
    }

    async fn upsert_batch(&self, kills: &[Kill]) -> Result<usize, StoreError> {
        Store::upsert_batch(self, kills).await
    }
}

#[async_trait]
impl Roster for Store {
    async fn character_ids(&self) -> Result<Vec<i64>, StoreError> {
        let characters = self.all_characters().await?;
        Ok(characters.into_iter().map(|c| c.id).collect())
    }
}
