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

use std::error::Error;
use std::future::Future;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CONTROLLER_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static ACTION_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static NODE_POLLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static NODE_POLL_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static FENCING_PODS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static FENCING_ATTACHMENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CACHE_EVICTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CACHE_ENTRIES: OnceLock<IntGaugeVec> = OnceLock::new();
static BACKEND_RESETS_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("nanofence".to_string()), None)
            .expect("failed to initialise nanofence metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register nanofence metric collector");
    collector
}

fn controller_reconciles_total() -> &'static IntCounterVec {
    CONTROLLER_RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_reconciles_total",
            "Controller reconciliation attempts grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("failed to build controller reconcile counter");
        register_collector(counter)
    })
}

fn action_outcomes_total() -> &'static IntCounterVec {
    ACTION_OUTCOMES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "action_outcomes_total",
            "Terminal outcome of controller actions grouped by controller",
        );
        let counter = IntCounterVec::new(opts, &["controller", "outcome"])
            .expect("failed to build action outcome counter");
        register_collector(counter)
    })
}

fn node_polls_total() -> &'static IntCounterVec {
    NODE_POLLS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "node_polls_total",
            "Backend node list polls grouped by result",
        );
        let counter =
            IntCounterVec::new(opts, &["result"]).expect("failed to build node poll counter");
        register_collector(counter)
    })
}

fn node_poll_duration() -> &'static HistogramVec {
    NODE_POLL_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "node_poll_duration_seconds",
            "Latency distribution of backend node list polls",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]);
        let histogram = HistogramVec::new(opts, &["result"])
            .expect("failed to build node poll histogram");
        register_collector(histogram)
    })
}

fn fencing_pods_total() -> &'static IntCounterVec {
    FENCING_PODS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "fencing_pods_total",
            "Pods considered for fencing grouped by result",
        );
        let counter =
            IntCounterVec::new(opts, &["result"]).expect("failed to build fencing pod counter");
        register_collector(counter)
    })
}

fn fencing_attachments_total() -> &'static IntCounterVec {
    FENCING_ATTACHMENTS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "fencing_attachments_total",
            "Volume attachments handled while fencing grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("failed to build fencing attachment counter");
        register_collector(counter)
    })
}

fn cache_evictions_total() -> &'static IntCounterVec {
    CACHE_EVICTIONS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "expiring_cache_evictions_total",
            "Entries removed from expiring caches after their TTL elapsed",
        );
        let counter = IntCounterVec::new(opts, &["cache"])
            .expect("failed to build cache eviction counter");
        register_collector(counter)
    })
}

fn cache_entries() -> &'static IntGaugeVec {
    CACHE_ENTRIES.get_or_init(|| {
        let opts = Opts::new(
            "expiring_cache_entries",
            "Entries currently held by expiring caches, including expired but unswept ones",
        );
        let gauge =
            IntGaugeVec::new(opts, &["cache"]).expect("failed to build cache entries gauge");
        register_collector(gauge)
    })
}

fn backend_resets_total() -> &'static IntCounter {
    BACKEND_RESETS_TOTAL.get_or_init(|| {
        let counter = IntCounter::new(
            "backend_resets_total",
            "Backend client rebuilds requested after failed polls",
        )
        .expect("failed to build backend reset counter");
        register_collector(counter)
    })
}

#[derive(Copy, Clone, Debug)]
pub enum ControllerReconcileResult {
    Success,
    Error,
}

impl ControllerReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ControllerReconcileResult::Success => "success",
            ControllerReconcileResult::Error => "error",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PodFencingResult {
    Fenced,
    SkippedUnhealthy,
    Failed,
}

impl PodFencingResult {
    fn as_label(self) -> &'static str {
        match self {
            PodFencingResult::Fenced => "fenced",
            PodFencingResult::SkippedUnhealthy => "skipped_unhealthy",
            PodFencingResult::Failed => "failed",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AttachmentResult {
    Deleted,
    Missing,
    Foreign,
    Failed,
}

impl AttachmentResult {
    fn as_label(self) -> &'static str {
        match self {
            AttachmentResult::Deleted => "deleted",
            AttachmentResult::Missing => "missing",
            AttachmentResult::Foreign => "foreign",
            AttachmentResult::Failed => "failed",
        }
    }
}

pub fn record_controller_reconcile(controller: &str, result: ControllerReconcileResult) {
    controller_reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
}

pub fn record_action_outcome(controller: &str, outcome: &str) {
    action_outcomes_total()
        .with_label_values(&[controller, outcome])
        .inc();
}

/// Wraps a backend poll and records its outcome and latency.
pub async fn observe_node_poll<F, T, E>(future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let result = future.await;
    let label = if result.is_ok() { "success" } else { "error" };
    record_node_poll(label, start.elapsed());
    result
}

fn record_node_poll(result: &str, duration: Duration) {
    node_polls_total().with_label_values(&[result]).inc();
    node_poll_duration()
        .with_label_values(&[result])
        .observe(duration.as_secs_f64());
}

pub fn record_fencing_pod(result: PodFencingResult) {
    fencing_pods_total()
        .with_label_values(&[result.as_label()])
        .inc();
}

pub fn record_fencing_attachment(result: AttachmentResult) {
    fencing_attachments_total()
        .with_label_values(&[result.as_label()])
        .inc();
}

pub fn record_cache_eviction(cache: &str) {
    cache_evictions_total().with_label_values(&[cache]).inc();
}

pub fn set_cache_entries(cache: &str, entries: usize) {
    cache_entries()
        .with_label_values(&[cache])
        .set(entries as i64);
}

pub fn record_backend_reset() {
    backend_resets_total().inc();
}

/// Encodes all registered metrics using the Prometheus text exposition
/// format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn node_poll_records_success_and_failure() {
        observe_node_poll(async { Ok::<_, ()>(()) })
            .await
            .expect("poll ok");
        let _ = observe_node_poll(async { Err::<(), _>(()) }).await;

        let body = gather().expect("metrics encoded");
        let text = String::from_utf8(body).expect("utf8");
        assert!(text.contains("nanofence_node_polls_total"));
        assert!(text.contains("result=\"success\""));
        assert!(text.contains("result=\"error\""));
    }

    #[test]
    fn fencing_counters_increment() {
        let pods = fencing_pods_total().with_label_values(&["fenced"]);
        let before = pods.get();
        record_fencing_pod(PodFencingResult::Fenced);
        assert_eq!(pods.get(), before + 1);

        let attachments = fencing_attachments_total().with_label_values(&["foreign"]);
        let before = attachments.get();
        record_fencing_attachment(AttachmentResult::Foreign);
        assert_eq!(attachments.get(), before + 1);
    }

    #[test]
    fn cache_gauge_tracks_latest_value() {
        set_cache_entries("metrics-test", 7);
        set_cache_entries("metrics-test", 3);
        assert_eq!(cache_entries().with_label_values(&["metrics-test"]).get(), 3);
    }
}
