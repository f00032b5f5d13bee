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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nanofence::nanofence::util::ExpiringCache;
use tokio_util::sync::CancellationToken;

use crate::support::advance_secs;

fn recording_cache(
    ttl: Duration,
    sweep: Duration,
) -> (ExpiringCache<u32>, Arc<Mutex<HashMap<String, usize>>>) {
    let cache = ExpiringCache::with_sweep_interval("integration_cache", ttl, sweep);
    let evictions = Arc::new(Mutex::new(HashMap::new()));
    let sink = Arc::clone(&evictions);
    cache.set_eviction_handler(move |key: &str, _value: u32| {
        *sink
            .lock()
            .expect("eviction map lock")
            .entry(key.to_string())
            .or_insert(0) += 1;
    });
    (cache, evictions)
}

#[tokio::test(start_paused = true)]
async fn sweeper_evicts_each_expired_entry_exactly_once() {
    let (cache, evictions) = recording_cache(Duration::from_secs(2), Duration::from_secs(1));
    let cancel = CancellationToken::new();
    let sweeper = cache.spawn_sweeper(cancel.clone());

    for (index, key) in ["a", "b", "c"].into_iter().enumerate() {
        cache.put(key, index as u32);
    }
    advance_secs(1).await;
    assert_eq!(cache.len(), 3);

    advance_secs(10).await;
    assert!(cache.is_empty());
    let seen = evictions.lock().expect("eviction map lock").clone();
    assert_eq!(seen.len(), 3);
    assert!(seen.values().all(|count| *count == 1), "{seen:?}");

    cancel.cancel();
    sweeper.await.expect("sweeper task");
}

#[tokio::test(start_paused = true)]
async fn refreshed_entries_outlive_their_first_deadline() {
    let (cache, evictions) = recording_cache(Duration::from_secs(5), Duration::from_secs(1));
    let cancel = CancellationToken::new();
    let sweeper = cache.spawn_sweeper(cancel.clone());

    cache.put("kept", 1);
    cache.put("dropped", 2);
    for _ in 0..4 {
        advance_secs(3).await;
        cache.put("kept", 1);
    }

    assert_eq!(cache.get("kept"), Some(1));
    assert_eq!(cache.get("dropped"), None);
    let seen = evictions.lock().expect("eviction map lock").clone();
    assert_eq!(seen.get("dropped"), Some(&1));
    assert!(!seen.contains_key("kept"));

    cancel.cancel();
    sweeper.await.expect("sweeper task");
}

#[tokio::test(start_paused = true)]
async fn handler_may_reinsert_the_evicted_key() {
    let cache: ExpiringCache<u32> =
        ExpiringCache::with_sweep_interval("reinsert_cache", Duration::from_secs(2), Duration::from_secs(1));
    let reinserter = cache.clone();
    cache.set_eviction_handler(move |key: &str, value: u32| {
        if value == 0 {
            reinserter.put(key, value + 1);
        }
    });

    cache.put("key", 0);
    advance_secs(3).await;
    assert_eq!(cache.sweep(), 1);
    assert_eq!(cache.get("key"), Some(1));
}
