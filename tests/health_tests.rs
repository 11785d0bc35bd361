//! Integration tests for worker health tracking and queue integrity.
//!
//! These tests validate that:
//! - A worker is declared dead only after the configured number of failed pings
//! - Work on a dead worker is requeued exactly once
//! - A worker that comes back is checked for jobs it lost
//! - The integrity check requeues jobs a worker no longer reports
//! - A job that moved to another worker mid-check is left where it is


use media_compressor::scheduler::{JobChange, JobStatus, NodeRef};
use media_compressor::store::JobStore;
use test_harness::{master_config, test_config, TestNode, MASTER_KEY, WORKER_A, WORKER_B};
use uuid::Uuid;

/// Master with a single idle worker A. One job placed on A.
async fn job_on_worker_a() -> (TestNode, Uuid) {
    let config = test_config()
        .with_master_key(MASTER_KEY)
        .with_worker(WORKER_A, 1.0);
    let node = TestNode::new(config).await;
    node.remote.set_status(WORKER_A, 0, 4);
    node.bring_up(&[WORKER_A]).await;

    let (id, _) = node.upload("a.mov", "owner@example.com", b"aaaa").await.unwrap();
    assert_eq!(node.job(id).await.node, NodeRef::Remote(WORKER_A.into()));
    (node, id)
}

#[tokio::test]
async fn dead_worker_work_is_reassigned_once() {
    let (node, id) = job_on_worker_a().await;
    node.remote.set_up(WORKER_A, false);

    for _ in 0..2 {
        let report = node.node.health.check_workers().await.unwrap();
        assert!(report.declared_dead.is_empty());
        assert_eq!(report.reassigned, 0);
    }
    assert_eq!(node.job(id).await.node, NodeRef::Remote(WORKER_A.into()));

    let report = node.node.health.check_workers().await.unwrap();
    assert_eq!(report.declared_dead, vec![WORKER_A.to_string()]);
    assert_eq!(report.reassigned, 1);

    let job = node.job(id).await;
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.node, NodeRef::Local);

    // already dead: nothing more happens
    let report = node.node.health.check_workers().await.unwrap();
    assert!(report.declared_dead.is_empty());
    assert_eq!(report.reassigned, 0);
    assert_eq!(node.transcoder.started(), vec![id]);
}

#[tokio::test]
async fn flapping_worker_keeps_its_work() {
    let (node, id) = job_on_worker_a().await;

    node.remote.set_up(WORKER_A, false);
    node.node.health.check_workers().await.unwrap();
    let record = node.store.get_or_create_worker(WORKER_A).await.unwrap();
    assert!(!record.is_up());
    assert_eq!(record.down_pings, 1);

    node.remote.set_up(WORKER_A, true);
    let report = node.node.health.check_workers().await.unwrap();
    assert_eq!(report.came_up, vec![WORKER_A.to_string()]);
    assert!(!report.queue_reset);
    assert_eq!(report.reassigned, 0);

    let record = node.store.get_or_create_worker(WORKER_A).await.unwrap();
    assert!(record.is_up());
    assert_eq!(record.down_pings, 0);
    assert_eq!(node.job(id).await.node, NodeRef::Remote(WORKER_A.into()));
}

#[tokio::test]
async fn returning_worker_is_integrity_checked() {
    let (node, id) = job_on_worker_a().await;
    // as if the last status query had reported an empty queue
    node.store.set_worker_queue_size(WORKER_A, 0).await.unwrap();

    node.remote.set_up(WORKER_A, false);
    for _ in 0..3 {
        let report = node.node.health.check_workers().await.unwrap();
        assert_eq!(report.reassigned, 0);
    }
    assert!(node
        .store
        .get_or_create_worker(WORKER_A)
        .await
        .unwrap()
        .is_dead(3));
    assert_eq!(node.job(id).await.node, NodeRef::Remote(WORKER_A.into()));

    // it restarted, lost the job and is busy with other work
    node.remote.forget(WORKER_A, id);
    node.remote.set_status(WORKER_A, 4, 4);
    node.remote.set_up(WORKER_A, true);
    let report = node.node.health.check_workers().await.unwrap();
    assert_eq!(report.came_up, vec![WORKER_A.to_string()]);
    assert_eq!(report.reassigned, 1);
    assert!(report.queue_reset);

    let job = node.job(id).await;
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.node, NodeRef::Local);
}

#[tokio::test]
async fn never_seen_worker_is_counted_down() {
    let node = TestNode::new(master_config()).await;
    let report = node.node.health.check_workers().await.unwrap();
    assert!(report.came_up.is_empty());

    let record = node.store.get_or_create_worker(WORKER_B).await.unwrap();
    assert!(!record.is_up());
    assert_eq!(record.down_pings, 1);
}

#[tokio::test]
async fn integrity_check_leaves_held_jobs_alone() {
    let (node, id) = job_on_worker_a().await;

    let reassigned = node.node.integrity.check_all().await.unwrap();
    assert_eq!(reassigned, 0);
    assert_eq!(node.job(id).await.node, NodeRef::Remote(WORKER_A.into()));
}

#[tokio::test]
async fn integrity_check_requeues_lost_jobs() {
    let (node, id) = job_on_worker_a().await;
    node.remote.forget(WORKER_A, id);
    // the worker is no longer a better candidate than this node
    node.remote.set_status(WORKER_A, 4, 4);

    let reassigned = node.node.integrity.check_all().await.unwrap();
    assert_eq!(reassigned, 1);

    let job = node.job(id).await;
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.node, NodeRef::Local);
}

#[tokio::test]
async fn failed_lookup_counts_as_lost() {
    let (node, id) = job_on_worker_a().await;
    node.remote.fail_lookups(WORKER_A);
    node.remote.set_status(WORKER_A, 4, 4);

    assert_eq!(node.node.integrity.check_all().await.unwrap(), 1);
    assert_eq!(node.job(id).await.node, NodeRef::Local);
}

#[tokio::test]
async fn integrity_check_skips_job_moved_during_lookup() {
    let (node, id) = job_on_worker_a().await;
    node.remote
        .relocate_on_lookup(node.store.clone(), id, WORKER_A, WORKER_B);

    let reassigned = node.node.integrity.check_all().await.unwrap();
    assert_eq!(reassigned, 0);

    let job = node.job(id).await;
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.node, NodeRef::Remote(WORKER_B.into()));
    assert!(node.transcoder.started().is_empty());
}

#[tokio::test]
async fn dead_node_reassignment_skips_job_already_moved() {
    let (node, id) = job_on_worker_a().await;
    node.store
        .apply(
            id,
            JobChange::Requeued {
                from: NodeRef::Remote(WORKER_A.into()),
            },
        )
        .await
        .unwrap();
    node.store
        .apply(
            id,
            JobChange::Processing {
                node: NodeRef::Remote(WORKER_B.into()),
            },
        )
        .await
        .unwrap();

    let requeued = node
        .node
        .queue
        .reinsert(id, &NodeRef::Remote(WORKER_A.into()), true)
        .await
        .unwrap();
    assert!(requeued.is_none());
    assert_eq!(node.job(id).await.node, NodeRef::Remote(WORKER_B.into()));
    assert_eq!(node.node.queue.pending_len().await, 0);
}
