//! Integration tests for the job lifecycle after dispatch.
//!
//! These tests validate that:
//! - Owners get one notification for all jobs that finished while others were queued
//! - Failed encodes are reported and still flush pending notifications
//! - Workers return results to the master and drop their copy
//! - The master only accepts results for jobs it is still waiting on from a worker


use std::sync::atomic::Ordering;

use media_compressor::error::CompressorError;
use media_compressor::scheduler::{JobStatus, NodeRef};
use media_compressor::store::JobStore;
use test_harness::{test_config, TestNode, MASTER_KEY, WORKER_A};

const OWNER: &str = "owner@example.com";

#[tokio::test]
async fn notification_waits_for_last_job_of_owner() {
    let mut node = TestNode::new(test_config()).await;
    let (first, _) = node.upload("a.mov", OWNER, b"aaaa").await.unwrap();
    let (second, _) = node.upload("b.mov", OWNER, b"bbbb").await.unwrap();

    node.transcoder.release(1);
    node.finalize_next().await;
    assert_eq!(node.status(first).await, JobStatus::EmailPending);
    assert!(node.notifier.ready_batches().is_empty());
    assert!(!node.node.files.queue_path(first).exists());

    node.transcoder.release(1);
    node.finalize_next().await;

    let batches = node.notifier.ready_batches();
    assert_eq!(batches.len(), 1);
    let (email, mut ids) = batches[0].clone();
    ids.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(email, OWNER);
    assert_eq!(ids, expected);

    for id in [first, second] {
        let job = node.job(id).await;
        assert_eq!(job.status, JobStatus::Ready);
        assert_eq!(job.progress, 100);
        assert_eq!(job.compressed_size, 3);
    }
}

#[tokio::test]
async fn encode_progress_is_recorded() {
    let node = TestNode::new(test_config()).await;
    let (id, _) = node.upload("a.mov", OWNER, b"aaaa").await.unwrap();

    let store = node.store.clone();
    test_harness::assert_eventually(
        || {
            let store = store.clone();
            async move { store.find_by_id(id).await.unwrap().unwrap().progress == 40 }
        },
        std::time::Duration::from_secs(5),
        "progress should be stored while encoding",
    )
    .await;
    assert_eq!(node.job(id).await.speed, 1.5);
}

#[tokio::test]
async fn failed_encode_notifies_owner() {
    let mut node = TestNode::new(test_config()).await;
    node.transcoder.fail_encodes();
    let (id, _) = node.upload("a.mov", OWNER, b"aaaa").await.unwrap();

    node.transcoder.release(1);
    node.finalize_next().await;

    assert_eq!(node.status(id).await, JobStatus::Error);
    assert_eq!(node.notifier.failures(), vec![(OWNER.to_string(), id)]);
}

#[tokio::test]
async fn failure_flushes_pending_notifications() {
    let mut node = TestNode::new(test_config()).await;
    let (first, _) = node.upload("a.mov", OWNER, b"aaaa").await.unwrap();
    let (second, _) = node.upload("b.mov", OWNER, b"bbbb").await.unwrap();

    node.transcoder.release(1);
    node.finalize_next().await;
    assert_eq!(node.status(first).await, JobStatus::EmailPending);

    node.transcoder.fail_encodes();
    node.transcoder.release(1);
    node.finalize_next().await;

    assert_eq!(node.status(second).await, JobStatus::Error);
    assert_eq!(node.status(first).await, JobStatus::Ready);
    assert_eq!(node.notifier.failures().len(), 1);
    assert_eq!(node.notifier.ready_batches()[0].1, vec![first]);
}

#[tokio::test]
async fn download_marks_job_downloaded() {
    let mut node = TestNode::new(test_config()).await;
    let (id, _) = node.upload("a.mov", OWNER, b"aaaa").await.unwrap();

    let early = node.node.service.download(id).await;
    assert!(matches!(early, Err(CompressorError::InvalidStatus { .. })));

    node.transcoder.release(1);
    node.finalize_next().await;

    let path = node.node.service.download(id).await.unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), b"enc");
    assert_eq!(node.status(id).await, JobStatus::Downloaded);

    // a second download is still allowed
    node.node.service.download(id).await.unwrap();
}

#[tokio::test]
async fn owner_listing_hides_finished_jobs() {
    let node = TestNode::new(test_config()).await;
    let (first, _) = node.upload("a.mov", OWNER, b"aaaa").await.unwrap();
    let (second, _) = node.upload("b.mov", OWNER, b"bbbb").await.unwrap();
    node.upload("c.mov", OWNER, b"cccc").await.unwrap_err();
    node.upload("d.mov", "someone@example.com", b"dddd").await.unwrap_err();

    let mut ids: Vec<_> = node
        .node
        .service
        .jobs_for_owner(OWNER)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    ids.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn worker_returns_result_and_cleans_up() {
    let mut node = TestNode::new(test_config()).await;
    let origin_id = uuid::Uuid::new_v4();
    let return_url = "http://master:8080/worker/accept";

    let mut body: &[u8] = b"pushed";
    let (id, _) = node
        .node
        .service
        .accept_remote_work(origin_id, "a.mov", 6, return_url, &mut body)
        .await
        .unwrap()
        .unwrap();
    assert!(node.node.service.is_remote_job_in_queue(origin_id).await.unwrap());

    node.transcoder.release(1);
    node.finalize_next().await;

    assert_eq!(
        node.remote.sent_results.lock().unwrap().clone(),
        vec![(origin_id, return_url.to_string())]
    );
    assert_eq!(node.status(id).await, JobStatus::Deleted);
    assert!(!node.node.files.queue_path(id).exists());
    assert!(!node.node.files.result_path(id).exists());
    assert!(!node.node.service.is_remote_job_in_queue(origin_id).await.unwrap());
    assert!(node.notifier.ready_batches().is_empty());
}

#[tokio::test]
async fn undeliverable_result_fails_job() {
    let mut node = TestNode::new(test_config()).await;
    node.remote.fail_results.store(true, Ordering::SeqCst);

    let mut body: &[u8] = b"pushed";
    let (id, _) = node
        .node
        .service
        .accept_remote_work(
            uuid::Uuid::new_v4(),
            "a.mov",
            6,
            "http://master:8080/worker/accept",
            &mut body,
        )
        .await
        .unwrap()
        .unwrap();

    node.transcoder.release(1);
    node.finalize_next().await;

    assert_eq!(node.status(id).await, JobStatus::Error);
    assert!(node.notifier.failures().is_empty());
}

#[tokio::test]
async fn master_accepts_result_from_worker() {
    let node = TestNode::new(
        test_config()
            .with_master_key(MASTER_KEY)
            .with_worker(WORKER_A, 1.0),
    )
    .await;
    node.remote.set_status(WORKER_A, 0, 4);
    node.bring_up(&[WORKER_A]).await;

    let (id, _) = node.upload("a.mov", OWNER, b"aaaa").await.unwrap();
    assert_eq!(node.job(id).await.node, NodeRef::Remote(WORKER_A.into()));

    let mut result: &[u8] = b"compressed";
    node.node
        .service
        .accept_remote_result(id, &mut result)
        .await
        .unwrap();

    let job = node.job(id).await;
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.compressed_size, 10);
    assert!(!node.node.files.queue_path(id).exists());
    assert_eq!(
        tokio::fs::read(node.node.files.result_path(id)).await.unwrap(),
        b"compressed"
    );
    assert_eq!(node.notifier.ready_batches().len(), 1);

    // a duplicate arrives late
    let mut again: &[u8] = b"compressed";
    let late = node.node.service.accept_remote_result(id, &mut again).await;
    assert!(matches!(
        late,
        Err(CompressorError::InvalidStatus {
            status: JobStatus::Ready,
            ..
        })
    ));
}

#[tokio::test]
async fn result_for_unknown_job_is_refused() {
    let node = TestNode::new(test_config()).await;
    let id = uuid::Uuid::new_v4();
    let mut result: &[u8] = b"compressed";
    let refused = node.node.service.accept_remote_result(id, &mut result).await;
    assert!(matches!(refused, Err(CompressorError::JobNotFound(missing)) if missing == id));
    assert!(node.store.find_by_id(id).await.unwrap().is_none());
}

#[tokio::test]
async fn result_for_locally_encoding_job_is_refused() {
    let node = TestNode::new(test_config()).await;
    let (id, _) = node.upload("a.mov", OWNER, b"aaaa").await.unwrap();
    assert_eq!(node.job(id).await.node, NodeRef::Local);

    let mut stray: &[u8] = b"forged";
    let refused = node.node.service.accept_remote_result(id, &mut stray).await;
    assert!(matches!(
        refused,
        Err(CompressorError::InvalidStatus {
            status: JobStatus::Processing,
            ..
        })
    ));
    assert_eq!(node.status(id).await, JobStatus::Processing);
    assert!(!node.node.files.result_path(id).exists());
}
