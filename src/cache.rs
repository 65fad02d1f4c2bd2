// src/cache.rs
//! Analysis cache: memoizes expensive AI-derived analyses keyed by a
//! fingerprint of the requesting configuration. Live entries are served
//! without side effects; concurrent requests for the same key coalesce to a
//! single compute. Entries are independently evictable.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use metrics::counter;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;

/// Inputs that distinguish one analysis from another. The fingerprint of
/// this key is the cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisKey {
    pub topic_id: String,
    pub date_range: String,
    pub model: String,
    pub sample_mode: String,
    pub profile_id: String,
    pub view_id: String,
}

impl AnalysisKey {
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            &self.topic_id,
            &self.date_range,
            &self.model,
            &self.sample_mode,
            &self.profile_id,
            &self.view_id,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]); // field separator
        }
        let digest = hasher.finalize();
        let mut out = String::with_capacity(32);
        for b in digest.iter().take(16) {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }
}

#[derive(Debug, Clone)]
struct Entry {
    payload: Value,
    computed_at: u64,
}

#[derive(Default)]
pub struct AnalysisCache {
    entries: std::sync::Mutex<HashMap<String, Entry>>,
    /// Per-key compute locks; the map itself is only held long enough to
    /// fetch or insert a lock, never across a compute.
    inflight: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a live entry, or run `compute` and store its result. Returns
    /// the payload and whether it came from the cache. At most one compute
    /// per fingerprint is in flight at a time.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &str,
        ttl: Duration,
        force_refresh: bool,
        compute: F,
    ) -> Result<(Value, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if !force_refresh {
            if let Some(hit) = self.lookup_live(fingerprint, ttl) {
                counter!("analysis_cache_hits_total").increment(1);
                return Ok((hit, true));
            }
        }

        let key_lock = {
            let mut map = self.inflight.lock().await;
            Arc::clone(
                map.entry(fingerprint.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let _guard = key_lock.lock().await;

        // A coalesced caller may find the entry freshly computed.
        if !force_refresh {
            if let Some(hit) = self.lookup_live(fingerprint, ttl) {
                counter!("analysis_cache_hits_total").increment(1);
                return Ok((hit, true));
            }
        }

        counter!("analysis_cache_misses_total").increment(1);
        let payload = compute().await?;
        {
            let mut entries = self.entries.lock().expect("cache mutex poisoned");
            entries.insert(
                fingerprint.to_string(),
                Entry {
                    payload: payload.clone(),
                    computed_at: now_unix(),
                },
            );
        }
        Ok((payload, false))
    }

    pub fn invalidate(&self, fingerprint: &str) -> bool {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.remove(fingerprint).is_some()
    }

    pub fn invalidate_all(&self) -> usize {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Test support: install an entry with an explicit computed-at time.
    #[doc(hidden)]
    pub fn seed_entry(&self, fingerprint: &str, payload: Value, computed_at: u64) {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.insert(
            fingerprint.to_string(),
            Entry {
                payload,
                computed_at,
            },
        );
    }

    fn lookup_live(&self, fingerprint: &str, ttl: Duration) -> Option<Value> {
        let entries = self.entries.lock().expect("cache mutex poisoned");
        let entry = entries.get(fingerprint)?;
        let age = now_unix().saturating_sub(entry.computed_at);
        if age < ttl.as_secs() {
            Some(entry.payload.clone())
        } else {
            None
        }
    }
}

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
