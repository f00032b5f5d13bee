/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Thread-safe key/value store whose entries expire after a TTL.
//!
//! Expired entries are invisible to readers immediately and are removed by a
//! periodic sweep, which hands each evicted key to the registered eviction
//! handler. An entry is observably either present-and-unexpired or absent;
//! the only difference between "never inserted" and "expired" is the
//! eviction callback.

use crate::nanofence::observability::metrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Recommended ratio between the sweep interval and the entry TTL.
pub const SWEEP_TTL_FACTOR: u32 = 5;

pub type EvictionHandler<V> = Arc<dyn Fn(&str, V) + Send + Sync>;

struct CacheEntry<V> {
    value: V,
    deadline: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

struct CacheInner<V> {
    name: &'static str,
    ttl: Duration,
    sweep_interval: Duration,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    on_evict: RwLock<Option<EvictionHandler<V>>>,
}

#[derive(Clone)]
pub struct ExpiringCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> ExpiringCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache whose sweep runs every `SWEEP_TTL_FACTOR` TTLs.
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self::with_sweep_interval(name, ttl, ttl.saturating_mul(SWEEP_TTL_FACTOR))
    }

    pub fn with_sweep_interval(name: &'static str, ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                name,
                ttl,
                sweep_interval: sweep_interval.max(Duration::from_millis(1)),
                entries: Mutex::new(HashMap::new()),
                on_evict: RwLock::new(None),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn sweep_interval(&self) -> Duration {
        self.inner.sweep_interval
    }

    /// Registers the callback invoked once for every expired entry. Replaces
    /// any previously registered handler.
    pub fn set_eviction_handler<F>(&self, handler: F)
    where
        F: Fn(&str, V) + Send + Sync + 'static,
    {
        let mut guard = self
            .inner
            .on_evict
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(Arc::new(handler));
    }

    /// Inserts or overwrites `key`, resetting its deadline to now + TTL.
    pub fn put(&self, key: impl Into<String>, value: V) {
        let ttl = self.inner.ttl;
        self.put_with_ttl(key, value, ttl);
    }

    pub fn put_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            deadline: now + ttl,
        };

        let (replaced, live) = {
            let mut entries = self.lock_entries();
            let replaced = entries.insert(key.clone(), entry);
            (replaced, entries.len())
        };
        metrics::set_cache_entries(self.inner.name, live);

        // Overwriting an entry that already expired but was not swept yet is
        // still an expiry of that entry.
        if let Some(previous) = replaced {
            if previous.is_expired(now) {
                self.notify_evicted(&key, previous.value);
            }
        }
    }

    /// Returns the value if present and unexpired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let entries = self.lock_entries();
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Number of unexpired entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.lock_entries();
        entries.values().filter(|entry| !entry.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired entry and reports it to the eviction handler.
    ///
    /// The lock is taken once to collect candidates and then once per
    /// removal, so readers are never blocked for longer than a single entry.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let candidates: Vec<String> = {
            let entries = self.lock_entries();
            entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut evicted = 0;
        for key in candidates {
            let removed = {
                let mut entries = self.lock_entries();
                match entries.get(&key) {
                    Some(entry) if entry.is_expired(now) => entries.remove(&key),
                    _ => None,
                }
            };
            if let Some(entry) = removed {
                evicted += 1;
                self.notify_evicted(&key, entry.value);
            }
        }

        let live = self.lock_entries().len();
        metrics::set_cache_entries(self.inner.name, live);
        evicted
    }

    /// Runs `sweep` every sweep interval until `cancel` fires.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.inner.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                }
            }
        })
    }

    fn notify_evicted(&self, key: &str, value: V) {
        metrics::record_cache_eviction(self.inner.name);
        let handler = self
            .inner
            .on_evict
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(key, value);
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
