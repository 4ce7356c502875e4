//! Race metadata and result persistence
//!
//! The coordinator treats storage as a collaborator behind `RaceStore`.
//! `MemoryStore` backs local runs and tests, optionally seeded from a JSON
//! file holding an array of races.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{RaceId, RaceInfo, RaceResult};

#[async_trait]
pub trait RaceStore: Send + Sync {
    async fn load_race(&self, race_id: &str) -> Result<Option<RaceInfo>, StoreError>;

    /// Saved standings for a race that already finished
    async fn load_result(&self, race_id: &str) -> Result<Option<RaceResult>, StoreError>;

    /// Standings are final: a race that already has a result keeps it
    async fn save_result(&self, result: RaceResult) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    races: RwLock<HashMap<RaceId, RaceInfo>>,
    results: RwLock<Vec<RaceResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_races(races: impl IntoIterator<Item = RaceInfo>) -> Self {
        let races = races.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self {
            races: RwLock::new(races),
            results: RwLock::new(Vec::new()),
        }
    }

    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let races: Vec<RaceInfo> = serde_json::from_str(&raw)?;
        tracing::info!(
            "Loaded {} races from {}",
            races.len(),
            path.as_ref().display()
        );
        Ok(Self::with_races(races))
    }

    pub async fn results(&self) -> Vec<RaceResult> {
        self.results.read().await.clone()
    }
}

#[async_trait]
impl RaceStore for MemoryStore {
    async fn load_race(&self, race_id: &str) -> Result<Option<RaceInfo>, StoreError> {
        Ok(self.races.read().await.get(race_id).cloned())
    }

    async fn load_result(&self, race_id: &str) -> Result<Option<RaceResult>, StoreError> {
        Ok(self
            .results
            .read()
            .await
            .iter()
            .find(|r| r.race_id == race_id)
            .cloned())
    }

    async fn save_result(&self, result: RaceResult) -> Result<(), StoreError> {
        let mut results = self.results.write().await;
        if results.iter().any(|r| r.race_id == result.race_id) {
            tracing::warn!(race_id = %result.race_id, "Race already has a saved result, keeping the first");
            return Ok(());
        }
        results.push(result);
        Ok(())
    }
}
