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

use std::time::Duration;

use nanofence::nanofence::backend::NodeHealth;
use nanofence::nanofence::controller::ActionPolicy;
use nanofence::nanofence::k8s::FailurePoint;
use nanofence::nanofence::test_support::{
    attachment, claim, fenced_pod, persistent_volume, pod, FencingFixture,
};

use crate::support::{advance_secs, Pipeline, PipelineTiming};

#[tokio::test(start_paused = true)]
async fn offline_node_fences_only_opted_in_pods() {
    let fixture = FencingFixture::new();
    fixture
        .node("n1", NodeHealth::Online)
        .backend_claim("default", "data-p1", "n1", true)
        .backend_claim("default", "data-p2", "n1", true)
        .pod(fenced_pod("default", "p1", "n1", &["data-p1"]))
        .pod(pod("default", "p2", "n1", None, &["data-p2"]));
    let pipeline = Pipeline::start(fixture.clone());

    advance_secs(2).await;
    assert!(fixture.cluster.deleted_pods().is_empty());

    fixture.backend.set_node("n1", NodeHealth::Offline);
    advance_secs(5).await;

    assert_eq!(fixture.cluster.deleted_pods(), vec!["default/p1".to_string()]);
    assert_eq!(
        fixture.cluster.deleted_attachments(),
        vec!["va-data-p1".to_string()]
    );
    assert!(fixture.cluster.pod("default", "p2").is_some());
    assert!(fixture.cluster.attachment("va-data-p2").is_some());

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_listings_defer_fencing_until_a_fresh_report() {
    let fixture = FencingFixture::new();
    fixture
        .node("n1", NodeHealth::Offline)
        .backend_claim("default", "data", "n1", true)
        .pod(fenced_pod("default", "p1", "n1", &["data"]));
    fixture.backend.fail_list_nodes(3);
    let pipeline = Pipeline::start(fixture.clone());

    // Polls at 0s, 5s and 10s fail.
    advance_secs(12).await;
    assert_eq!(fixture.backend.list_calls(), 3);
    assert_eq!(pipeline.health.consecutive_failures(), 3);
    assert!(!pipeline.health.readiness_report().is_ready());
    assert!(pipeline.cache.get("n1").is_none());
    assert!(fixture.cluster.deleted_pods().is_empty());

    advance_secs(5).await;
    assert_eq!(pipeline.health.consecutive_failures(), 0);
    assert!(pipeline.health.readiness_report().is_ready());
    assert_eq!(fixture.cluster.deleted_pods(), vec!["default/p1".to_string()]);
    assert_eq!(fixture.cluster.deleted_attachments(), vec!["va-data".to_string()]);

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unhealthy_claim_holds_pod_until_expiry_reevaluates() {
    let fixture = FencingFixture::new();
    fixture
        .node("n1", NodeHealth::Offline)
        .backend_claim("default", "c1", "n1", true)
        .backend_claim("default", "c2", "n1", false)
        .backend_claim("default", "c3", "n1", true)
        .pod(fenced_pod("default", "p1", "n1", &["c1", "c2", "c3"]));
    let timing = PipelineTiming {
        cache_ttl: Duration::from_secs(30),
        sweep_interval: Duration::from_secs(10),
        ..PipelineTiming::default()
    };
    let pipeline = Pipeline::start_with(fixture.clone(), timing);

    advance_secs(3).await;
    assert!(fixture.cluster.pod("default", "p1").is_some());
    for name in ["va-c1", "va-c2", "va-c3"] {
        assert!(fixture.cluster.attachment(name).is_some(), "{name} removed");
    }

    fixture.backend.set_volume_health("default", "pv-c2", true);
    // Unchanged node reports do not re-trigger evaluation before expiry.
    advance_secs(20).await;
    assert!(fixture.cluster.pod("default", "p1").is_some());
    assert!(fixture.cluster.deleted_attachments().is_empty());

    advance_secs(30).await;
    assert_eq!(fixture.cluster.deleted_pods(), vec!["default/p1".to_string()]);
    let mut removed = fixture.cluster.deleted_attachments();
    removed.sort();
    assert_eq!(removed, vec!["va-c1", "va-c2", "va-c3"]);

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn foreign_attachments_survive_fencing() {
    let fixture = FencingFixture::new();
    fixture
        .node("n1", NodeHealth::Offline)
        .backend_claim("default", "data", "n1", true)
        .pod(fenced_pod("default", "p1", "n1", &["data"]));
    fixture.cluster.upsert_attachment(attachment(
        "va-foreign",
        "n1",
        "pv-data",
        "ebs.csi.aws.com",
    ));
    let pipeline = Pipeline::start(fixture.clone());

    advance_secs(2).await;
    assert_eq!(fixture.cluster.deleted_pods(), vec!["default/p1".to_string()]);
    assert_eq!(fixture.cluster.deleted_attachments(), vec!["va-data".to_string()]);
    assert!(fixture.cluster.attachment("va-foreign").is_some());

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn opt_out_and_foreign_claims_are_left_alone() {
    let fixture = FencingFixture::new();
    fixture
        .node("n1", NodeHealth::Offline)
        .backend_claim("default", "a", "n1", true)
        .backend_claim("default", "b", "n1", true)
        .pod(pod("default", "opted-out", "n1", Some("false"), &["a"]))
        .pod(pod("default", "garbage-label", "n1", Some("maybe"), &["b"]));
    fixture
        .cluster
        .upsert_claim(claim("default", "other", "pv-other", Some("ebs.csi.aws.com")));
    fixture
        .cluster
        .upsert_volume(persistent_volume("pv-other", "ebs.csi.aws.com"));
    fixture
        .pod(fenced_pod("default", "no-backend-claims", "n1", &["other"]))
        .pod(fenced_pod("default", "elsewhere", "n2", &["a"]));
    let pipeline = Pipeline::start(fixture.clone());

    advance_secs(20).await;
    assert!(fixture.cluster.deleted_pods().is_empty());
    assert!(fixture.cluster.deleted_attachments().is_empty());

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_within_the_action() {
    let fixture = FencingFixture::new();
    fixture
        .node("n1", NodeHealth::Offline)
        .backend_claim("default", "data", "n1", true)
        .pod(fenced_pod("default", "p1", "n1", &["data"]));
    fixture.backend.set_volume_failing("default", "pv-data", true);
    fixture.cluster.fail(
        FailurePoint::DeletePod {
            namespace: "default".to_string(),
            name: "p1".to_string(),
        },
        1,
    );
    let timing = PipelineTiming {
        policy: ActionPolicy::new(Duration::from_secs(120), Duration::from_secs(2)),
        ..PipelineTiming::default()
    };
    let pipeline = Pipeline::start_with(fixture.clone(), timing);

    advance_secs(3).await;
    assert!(fixture.cluster.pod("default", "p1").is_some());

    fixture.backend.set_volume_failing("default", "pv-data", false);
    advance_secs(10).await;
    assert_eq!(fixture.cluster.deleted_pods(), vec!["default/p1".to_string()]);
    assert_eq!(fixture.cluster.deleted_attachments(), vec!["va-data".to_string()]);

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn node_missing_from_cluster_is_never_fenced() {
    let fixture = FencingFixture::new();
    fixture
        .node("n1", NodeHealth::Offline)
        .backend_claim("default", "data", "n1", true)
        .pod(fenced_pod("default", "p1", "n1", &["data"]));
    fixture.cluster.remove_node("n1");
    let pipeline = Pipeline::start(fixture.clone());

    advance_secs(10).await;
    assert!(fixture.cluster.deleted_pods().is_empty());
    assert_eq!(pipeline.cache.get("n1").map(|node| node.health), Some(NodeHealth::Offline));

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_every_task() {
    let fixture = FencingFixture::new();
    fixture.node("n1", NodeHealth::Online);
    let pipeline = Pipeline::start(fixture.clone());
    advance_secs(1).await;
    let calls = fixture.backend.list_calls();

    tokio::time::timeout(Duration::from_secs(5), pipeline.shutdown())
        .await
        .expect("pipeline stops promptly");
    advance_secs(30).await;
    assert_eq!(fixture.backend.list_calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn attachment_left_by_a_deleted_pod_is_removed_on_retry() {
    let fixture = FencingFixture::new();
    fixture
        .node("n1", NodeHealth::Offline)
        .backend_claim("default", "data", "n1", true)
        .pod(fenced_pod("default", "p1", "n1", &["data"]));
    fixture.cluster.fail(
        FailurePoint::DeleteAttachment {
            name: "va-data".to_string(),
        },
        1,
    );
    let pipeline = Pipeline::start(fixture.clone());

    advance_secs(5).await;
    assert_eq!(fixture.cluster.deleted_pods(), vec!["default/p1".to_string()]);
    assert_eq!(fixture.cluster.deleted_attachments(), vec!["va-data".to_string()]);
    assert!(fixture.cluster.attachment("va-data").is_none());

    pipeline.shutdown().await;
}
