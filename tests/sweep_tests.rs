//! Integration tests for the periodic reclamation sweeps.
//!
//! These tests validate that:
//! - Space-gated sweeps only act when their volume runs low
//! - Jobs stuck in short-lived states are failed
//! - The stale sweep retries notifications once per owner and spares young queued jobs
//! - Uploads dropped into the recovery directory are resubmitted


use chrono::{Duration, Utc};
use uuid::Uuid;

use media_compressor::scheduler::{Job, JobStatus, NewJob};
use test_harness::{test_config, TestNode};

/// Inserts a job that has sat in `status` for `minutes`.
async fn aged_job(node: &TestNode, email: &str, status: JobStatus, minutes: i64) -> Uuid {
    let mut job = Job::new(NewJob::local("old.mov", email, 4));
    job.status = status;
    job.updated_at = Utc::now() - Duration::minutes(minutes);
    let id = job.id;
    node.store.insert(job).await;
    id
}

async fn write_files(node: &TestNode, id: Uuid) {
    let files = &node.node.files;
    tokio::fs::write(files.queue_path(id), b"raw").await.unwrap();
    tokio::fs::write(files.result_path(id), b"enc").await.unwrap();
}

#[tokio::test]
async fn claimed_results_removed_when_space_is_low() {
    let node = TestNode::new(test_config()).await;
    let old = aged_job(&node, "a@example.com", JobStatus::Downloaded, 30).await;
    let recent = aged_job(&node, "a@example.com", JobStatus::Downloaded, 5).await;
    write_files(&node, old).await;
    write_files(&node, recent).await;

    // plenty of space: nothing to do
    assert_eq!(node.node.sweeper.reap_claimed(Utc::now()).await, 0);
    assert_eq!(node.status(old).await, JobStatus::Downloaded);

    node.results_volume.set_free_mb(1000);
    assert_eq!(node.node.sweeper.reap_claimed(Utc::now()).await, 1);
    assert_eq!(node.status(old).await, JobStatus::Deleted);
    assert!(!node.node.files.result_path(old).exists());
    assert_eq!(node.status(recent).await, JobStatus::Downloaded);
    assert!(node.node.files.result_path(recent).exists());
}

#[tokio::test]
async fn unclaimed_results_removed_when_space_is_low() {
    let node = TestNode::new(test_config()).await;
    let old = aged_job(&node, "a@example.com", JobStatus::Ready, 120).await;
    write_files(&node, old).await;

    node.results_volume.set_free_mb(3000);
    assert_eq!(node.node.sweeper.reap_unclaimed(Utc::now()).await, 1);
    assert_eq!(node.status(old).await, JobStatus::DeletedWithoutDownloading);
    assert!(!node.node.files.result_path(old).exists());
}

#[tokio::test]
async fn error_zombie_files_removed_status_kept() {
    let node = TestNode::new(test_config()).await;
    let failed = aged_job(&node, "a@example.com", JobStatus::Error, 60).await;
    write_files(&node, failed).await;

    node.queue_volume.set_free_mb(5000);
    assert_eq!(node.node.sweeper.reap_error_zombies(Utc::now()).await, 1);
    assert_eq!(node.status(failed).await, JobStatus::Error);
    assert!(!node.node.files.queue_path(failed).exists());
    assert!(!node.node.files.result_path(failed).exists());
}

#[tokio::test]
async fn stuck_transitive_jobs_are_failed() {
    let node = TestNode::new(test_config()).await;
    let stuck = aged_job(&node, "a@example.com", JobStatus::Uploaded, 20).await;
    let fresh = aged_job(&node, "b@example.com", JobStatus::Processed, 1).await;

    assert_eq!(node.node.sweeper.reap_transitive(Utc::now()).await, 1);
    assert_eq!(node.status(stuck).await, JobStatus::Error);
    assert_eq!(node.status(fresh).await, JobStatus::Processed);
    assert_eq!(
        node.notifier.failures(),
        vec![("a@example.com".to_string(), stuck)]
    );
}

#[tokio::test]
async fn stale_sweep_notifies_each_owner_once() {
    let node = TestNode::new(test_config()).await;
    let first = aged_job(&node, "a@example.com", JobStatus::EmailPending, 800).await;
    let second = aged_job(&node, "a@example.com", JobStatus::EmailPending, 800).await;

    assert_eq!(node.node.sweeper.reap_stale(Utc::now()).await, 1);
    assert_eq!(node.status(first).await, JobStatus::Ready);
    assert_eq!(node.status(second).await, JobStatus::Ready);
    assert_eq!(node.notifier.ready_batches().len(), 1);
}

#[tokio::test]
async fn stale_sweep_gives_queued_jobs_longer() {
    let node = TestNode::new(test_config()).await;
    let young = aged_job(&node, "a@example.com", JobStatus::InQueue, 800).await;
    let ancient = aged_job(&node, "b@example.com", JobStatus::InQueue, 1500).await;
    let processing = aged_job(&node, "c@example.com", JobStatus::Processing, 800).await;
    let done = aged_job(&node, "d@example.com", JobStatus::Deleted, 5000).await;

    assert_eq!(node.node.sweeper.reap_stale(Utc::now()).await, 2);
    assert_eq!(node.status(young).await, JobStatus::InQueue);
    assert_eq!(node.status(ancient).await, JobStatus::Error);
    assert_eq!(node.status(processing).await, JobStatus::Error);
    assert_eq!(node.status(done).await, JobStatus::Deleted);
}

#[tokio::test]
async fn recovery_resubmits_failed_uploads() {
    let node = TestNode::new(test_config()).await;
    let failed = aged_job(&node, "a@example.com", JobStatus::Error, 10).await;
    let healthy = aged_job(&node, "b@example.com", JobStatus::Ready, 10).await;

    let recovery = node.recovery_dir();
    tokio::fs::create_dir_all(&recovery).await.unwrap();
    tokio::fs::write(recovery.join(failed.to_string()), b"original")
        .await
        .unwrap();
    tokio::fs::write(recovery.join(healthy.to_string()), b"original")
        .await
        .unwrap();
    tokio::fs::write(recovery.join("notes.txt"), b"?").await.unwrap();

    assert_eq!(node.node.sweeper.recover_failed().await, 1);
    assert!(!recovery.join(failed.to_string()).exists());
    assert!(recovery.join(healthy.to_string()).exists());
    assert!(recovery.join("notes.txt").exists());

    let resubmitted: Vec<Job> = node
        .store
        .all_jobs()
        .await
        .into_iter()
        .filter(|j| j.id != failed && j.email == "a@example.com")
        .collect();
    assert_eq!(resubmitted.len(), 1);
    assert_eq!(resubmitted[0].status, JobStatus::Processing);
    assert_eq!(resubmitted[0].original_size, 8);
    assert_eq!(node.status(failed).await, JobStatus::Error);
}
