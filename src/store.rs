// src/store.rs
//! Article store collaborator: durable persistence of admitted items plus
//! the fingerprint lookup used for cross-run dedup. The pipeline only sees
//! this trait; the in-memory implementation backs tests and local runs.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::pipeline::types::Candidate;
use crate::score::AdmissionVerdict;

/// A candidate plus its verdict, owned by the store once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmittedItem {
    pub candidate: Candidate,
    pub verdict: AdmissionVerdict,
    pub topic_id: String,
    pub fingerprint: String,
    pub admitted_at: u64,
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Persist one admitted item. Inserting a duplicate provider id/url must
    /// be idempotent rather than an error.
    async fn insert(&self, item: &AdmittedItem) -> Result<()>;

    /// Whether `fingerprint` was admitted for `topic_id` at or after `since`.
    async fn exists_fingerprint(&self, fingerprint: &str, topic_id: &str, since: u64)
        -> Result<bool>;
}

/// In-memory store: a vector of items plus a fingerprint index.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    items: Vec<AdmittedItem>,
    // (topic, fingerprint) -> latest admission timestamp
    fingerprints: HashMap<(String, String), u64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<AdmittedItem> {
        self.inner.lock().expect("store mutex poisoned").items.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("store mutex poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArticleStore for InMemoryStore {
    async fn insert(&self, item: &AdmittedItem) -> Result<()> {
        let mut g = self.inner.lock().expect("store mutex poisoned");
        let duplicate = g
            .items
            .iter()
            .any(|existing| existing.candidate.url == item.candidate.url);
        if !duplicate {
            g.items.push(item.clone());
        }
        let key = (item.topic_id.clone(), item.fingerprint.clone());
        let ts = g.fingerprints.get(&key).copied().unwrap_or(0);
        g.fingerprints.insert(key, ts.max(item.admitted_at));
        Ok(())
    }

    async fn exists_fingerprint(
        &self,
        fingerprint: &str,
        topic_id: &str,
        since: u64,
    ) -> Result<bool> {
        let g = self.inner.lock().expect("store mutex poisoned");
        Ok(g.fingerprints
            .get(&(topic_id.to_string(), fingerprint.to_string()))
            .map(|&ts| ts >= since)
            .unwrap_or(false))
    }
}
