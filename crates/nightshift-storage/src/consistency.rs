//! Two-phase listing writes: stamp the raw score before commit, derive the
//! quality metrics only once the listing's identity is durably visible.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nightshift_core::{raw_quality_score, Clock, JobListing, QualityMetrics, QualityPolicy};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listing {0} is not committed; refusing to write derived metrics")]
    PrimaryNotVisible(Uuid),
    #[error("listing has no source_url")]
    MissingIdentity,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// A listing after the pre-commit phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedListing {
    pub listing: JobListing,
    pub raw_score: u8,
}

/// Proof that a listing is durably committed under `id`.
///
/// Only a [`RecordStore`] hands these out, so derived metrics can only be
/// computed for identities that already exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedListing {
    id: Uuid,
    listing: JobListing,
    raw_score: u8,
    updated_at: DateTime<Utc>,
}

impl CommittedListing {
    pub(crate) fn new(
        id: Uuid,
        listing: JobListing,
        raw_score: u8,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            listing,
            raw_score,
            updated_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn listing(&self) -> &JobListing {
        &self.listing
    }

    pub fn raw_score(&self) -> u8 {
        self.raw_score
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or update by `source_url` and commit. Returns once the row is
    /// visible to every other reader.
    async fn commit_listing(&self, stamped: &StampedListing)
        -> Result<CommittedListing, StoreError>;

    /// Insert or replace the metrics row keyed by the committed identity,
    /// but only while the listing is still at `committed.updated_at()`.
    /// Returns `false` when a later commit superseded this one; that commit
    /// derives its own metrics.
    async fn upsert_metrics(
        &self,
        committed: &CommittedListing,
        metrics: &QualityMetrics,
    ) -> Result<bool, StoreError>;

    async fn load_listing(&self, id: Uuid) -> Result<Option<CommittedListing>, StoreError>;

    async fn load_metrics(&self, id: Uuid) -> Result<Option<QualityMetrics>, StoreError>;

    async fn listing_ids(&self) -> Result<Vec<Uuid>, StoreError>;
}

pub struct ConsistencyEngine<S> {
    store: Arc<S>,
    policy: QualityPolicy,
    clock: Arc<dyn Clock>,
}

impl<S: RecordStore> ConsistencyEngine<S> {
    pub fn new(store: Arc<S>, policy: QualityPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn policy(&self) -> &QualityPolicy {
        &self.policy
    }

    /// Phase 1. Pure: reads only the listing's own fields.
    pub fn stamp(&self, listing: JobListing) -> StampedListing {
        let raw_score = raw_quality_score(&listing, &self.policy);
        StampedListing { listing, raw_score }
    }

    /// Phase 2 computation for a committed listing.
    pub fn derive(&self, committed: &CommittedListing) -> QualityMetrics {
        QualityMetrics::derive(
            committed.id(),
            committed.listing(),
            &self.policy,
            self.clock.now(),
        )
    }

    /// Stamp, commit, then derive. A failure after the commit leaves the
    /// listing without metrics until the next write or [`Self::recompute`].
    pub async fn write(&self, listing: JobListing) -> Result<QualityMetrics, StoreError> {
        if listing.source_url.trim().is_empty() {
            return Err(StoreError::MissingIdentity);
        }

        let stamped = self.stamp(listing);
        let committed = self.store.commit_listing(&stamped).await?;
        let metrics = self.derive(&committed);
        match self.store.upsert_metrics(&committed, &metrics).await {
            Ok(true) => {
                debug!(listing = %committed.id(), raw_score = metrics.raw_score, "listing written")
            }
            Ok(false) => debug!(
                listing = %committed.id(),
                "listing superseded by a newer commit; its metrics stand"
            ),
            Err(err) => {
                warn!(listing = %committed.id(), error = %err, "listing committed without metrics");
                return Err(err);
            }
        }
        Ok(metrics)
    }

    pub async fn recompute(&self, id: Uuid) -> Result<Option<QualityMetrics>, StoreError> {
        let Some(committed) = self.store.load_listing(id).await? else {
            return Ok(None);
        };
        let metrics = self.derive(&committed);
        if !self.store.upsert_metrics(&committed, &metrics).await? {
            debug!(listing = %id, "listing changed during recompute");
        }
        Ok(Some(metrics))
    }

    pub async fn recompute_all(&self) -> Result<usize, StoreError> {
        let mut refreshed = 0usize;
        for id in self.store.listing_ids().await? {
            if self.recompute(id).await?.is_some() {
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    visible: HashMap<Uuid, CommittedListing>,
    by_url: HashMap<String, Uuid>,
    in_flight: HashMap<String, Uuid>,
    metrics: HashMap<Uuid, QualityMetrics>,
    last_commit: Option<DateTime<Utc>>,
}

impl MemoryState {
    /// Commit timestamps are strictly increasing so they identify a version.
    fn next_commit_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let at = match self.last_commit {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_commit = Some(at);
        at
    }
}

/// In-process store with explicit commit visibility.
///
/// A commit first reserves the identity, yields, then publishes the row.
/// Metrics for an identity that is not yet published are rejected the same
/// way a foreign key would reject them.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic view of (committed ids, ids with metrics).
    pub async fn snapshot(&self) -> (Vec<Uuid>, Vec<Uuid>) {
        let state = self.state.lock().await;
        (
            state.visible.keys().copied().collect(),
            state.metrics.keys().copied().collect(),
        )
    }

    pub async fn delete_listing(&self, id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let Some(removed) = state.visible.remove(&id) else {
            return false;
        };
        state.by_url.remove(&removed.listing.source_url);
        state.metrics.remove(&id);
        true
    }

    pub async fn metrics_count(&self) -> usize {
        self.state.lock().await.metrics.len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn commit_listing(
        &self,
        stamped: &StampedListing,
    ) -> Result<CommittedListing, StoreError> {
        let url = stamped.listing.source_url.clone();
        let id = {
            let mut state = self.state.lock().await;
            let existing = state
                .by_url
                .get(&url)
                .or_else(|| state.in_flight.get(&url))
                .copied();
            let id = existing.unwrap_or_else(Uuid::new_v4);
            state.in_flight.insert(url.clone(), id);
            id
        };

        // Window between write and visibility.
        tokio::task::yield_now().await;

        let mut state = self.state.lock().await;
        let committed = CommittedListing::new(
            id,
            stamped.listing.clone(),
            stamped.raw_score,
            state.next_commit_at(),
        );
        state.in_flight.remove(&url);
        state.by_url.insert(url, id);
        state.visible.insert(id, committed.clone());
        Ok(committed)
    }

    async fn upsert_metrics(
        &self,
        committed: &CommittedListing,
        metrics: &QualityMetrics,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(current) = state.visible.get(&committed.id()) else {
            return Err(StoreError::PrimaryNotVisible(committed.id()));
        };
        if current.updated_at() != committed.updated_at() {
            return Ok(false);
        }
        state.metrics.insert(committed.id(), metrics.clone());
        Ok(true)
    }

    async fn load_listing(&self, id: Uuid) -> Result<Option<CommittedListing>, StoreError> {
        Ok(self.state.lock().await.visible.get(&id).cloned())
    }

    async fn load_metrics(&self, id: Uuid) -> Result<Option<QualityMetrics>, StoreError> {
        Ok(self.state.lock().await.metrics.get(&id).cloned())
    }

    async fn listing_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.lock().await;
        let mut ids = state.visible.values().collect::<Vec<_>>();
        ids.sort_by_key(|c| c.updated_at());
        Ok(ids.into_iter().map(|c| c.id()).collect())
    }
}
