use std::time::Duration;

use bytes::Bytes;
use cachefs::meta::CacheType;
use cachefs::{Error, MemoryBackend, Op, RetryPolicy};

mod common;
use common::{Harness, eventually, t0};

#[tokio::test]
async fn test_put_stages_then_flush_uploads() {
    let h = Harness::write_back(MemoryBackend::new("origin")).await;
    let obj = h
        .fs
        .put("/w/new.txt", Bytes::from_static(b"staged"), t0())
        .await
        .unwrap();

    assert!(obj.is_pending_upload().await.unwrap());
    assert_eq!(h.staging().contents("/w/new.txt").unwrap(), "staged");
    assert!(h.origin.contents("/w/new.txt").is_none());
    assert_eq!(h.origin.calls(Op::Write), 0);
    let rec = obj.record().unwrap();
    assert_eq!(rec.cache_type, CacheType::PendingUpload);

    // Reads of a staged file come from staging, not the chunk cache.
    let data = obj.open(&[]).await.unwrap().read_to_end().await.unwrap();
    assert_eq!(&data[..], b"staged");
    assert_eq!(h.fs.chunks().chunk_count("/w/new.txt"), 0);

    assert_eq!(h.fs.flush_uploads().await.unwrap(), 1);
    assert!(h.fs.pending_uploads().await.unwrap().is_empty());
    assert_eq!(h.origin.contents("/w/new.txt").unwrap(), "staged");
    assert!(h.staging().contents("/w/new.txt").is_none());
    let rec = h.fs.store().get_object("/w/new.txt").await.unwrap().unwrap();
    assert_eq!(rec.cache_type, CacheType::InCache);
    assert_eq!(rec.mod_time(), t0());
}

#[tokio::test]
async fn test_update_of_staged_file_stays_in_staging() {
    let h = Harness::write_back(MemoryBackend::new("origin")).await;
    let obj = h
        .fs
        .put("/a.txt", Bytes::from_static(b"one"), t0())
        .await
        .unwrap();
    obj.update(Bytes::from_static(b"two!"), t0()).await.unwrap();

    assert_eq!(h.staging().contents("/a.txt").unwrap(), "two!");
    assert_eq!(h.fs.pending_uploads().await.unwrap().len(), 1);
    assert_eq!(obj.size().await, 4);
    assert_eq!(h.origin.calls(Op::Write), 0);
}

#[tokio::test]
async fn test_busy_while_upload_in_flight() {
    let h = Harness::write_back(MemoryBackend::new("origin")).await;
    let obj = h
        .fs
        .put("/b.txt", Bytes::from_static(b"payload"), t0())
        .await
        .unwrap();

    let held = h.origin.hold_writes().await;
    let fs = h.fs.clone();
    let flush = tokio::spawn(async move { fs.flush_uploads().await });
    let fs = &h.fs;
    eventually(move || async move {
        fs.pending_upload("/b.txt")
            .await
            .unwrap()
            .is_some_and(|e| e.started)
    })
    .await;

    let err = obj
        .update(Bytes::from_static(b"other"), t0())
        .await
        .unwrap_err();
    assert!(err.is_busy());
    assert!(matches!(obj.remove().await, Err(Error::Busy(_))));
    assert!(matches!(
        h.fs.rename("/b.txt", "/c.txt").await,
        Err(Error::Busy(_))
    ));

    drop(held);
    assert_eq!(flush.await.unwrap().unwrap(), 1);
    assert_eq!(h.origin.contents("/b.txt").unwrap(), "payload");

    // The upload is done, so the path is free again and lives on the origin.
    obj.update(Bytes::from_static(b"other"), t0()).await.unwrap();
    assert_eq!(h.origin.contents("/b.txt").unwrap(), "other");
    assert!(h.fs.pending_uploads().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_waits_while_paused() {
    let h = Harness::build(
        MemoryBackend::new("origin"),
        Some(MemoryBackend::new("staging")),
        true,
        |_| {},
    )
    .await;

    let pause = h.fs.pause().await;
    h.fs.put("/p.txt", Bytes::from_static(b"later"), t0())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let pending = h.fs.pending_upload("/p.txt").await.unwrap().unwrap();
    assert!(!pending.started);
    assert!(h.origin.contents("/p.txt").is_none());

    drop(pause);
    tokio::time::timeout(Duration::from_secs(5), h.fs.wait_for_uploads())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.origin.contents("/p.txt").unwrap(), "later");
}

#[tokio::test]
async fn test_failed_upload_is_retried() {
    let h = Harness::write_back(MemoryBackend::new("origin")).await;
    h.fs.put("/r.txt", Bytes::from_static(b"retry"), t0())
        .await
        .unwrap();

    h.origin.fail_writes(1);
    assert_eq!(h.fs.flush_uploads().await.unwrap(), 0);
    let pending = h.fs.pending_upload("/r.txt").await.unwrap().unwrap();
    assert_eq!(pending.attempts, 1);
    assert!(!pending.started);
    assert_eq!(h.staging().contents("/r.txt").unwrap(), "retry");

    assert_eq!(h.fs.flush_uploads().await.unwrap(), 1);
    assert_eq!(h.origin.contents("/r.txt").unwrap(), "retry");
}

#[tokio::test]
async fn test_upload_abandoned_after_max_attempts() {
    let h = Harness::build(
        MemoryBackend::new("origin"),
        Some(MemoryBackend::new("staging")),
        false,
        |config| config.retry = RetryPolicy::MaxAttempts(2),
    )
    .await;
    h.fs.put("/x.txt", Bytes::from_static(b"doomed"), t0())
        .await
        .unwrap();

    h.origin.fail_writes(5);
    h.fs.flush_uploads().await.unwrap();
    assert!(h.fs.pending_upload("/x.txt").await.unwrap().is_some());
    h.fs.flush_uploads().await.unwrap();

    assert!(h.fs.pending_upload("/x.txt").await.unwrap().is_none());
    assert!(h.staging().contents("/x.txt").is_none());
    assert!(h.origin.contents("/x.txt").is_none());
    assert!(h.fs.store().get_object("/x.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn test_remove_staged_file() {
    let origin = MemoryBackend::new("origin");
    origin.insert_file("/s.txt", "old", t0());
    let h = Harness::write_back(origin).await;

    let obj = h
        .fs
        .put("/s.txt", Bytes::from_static(b"new"), t0())
        .await
        .unwrap();
    obj.remove().await.unwrap();

    assert!(h.staging().contents("/s.txt").is_none());
    assert!(h.origin.contents("/s.txt").is_none());
    assert!(h.fs.pending_uploads().await.unwrap().is_empty());
    assert!(h.fs.store().get_object("/s.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn test_rmdir_refuses_staged_children() {
    let h = Harness::write_back(MemoryBackend::new("origin")).await;
    h.fs.put("/dir/f.txt", Bytes::from_static(b"x"), t0())
        .await
        .unwrap();
    assert!(matches!(
        h.fs.rmdir("/dir").await,
        Err(Error::DirectoryNotEmpty(_))
    ));
}

#[tokio::test]
async fn test_restart_resumes_interrupted_upload() {
    let h = Harness::write_back(MemoryBackend::new("origin")).await;
    h.fs.put("/i.txt", Bytes::from_static(b"resume"), t0())
        .await
        .unwrap();
    sqlx::query("UPDATE pending_uploads SET started = 1")
        .execute(h.fs.store().pool())
        .await
        .unwrap();
    h.fs.shutdown().await;

    let config = common::test_config(&h.dir);
    let fs = common::open(&h.origin, h.staging.as_ref(), &h.clock, config, false).await;
    let pending = fs.pending_upload("/i.txt").await.unwrap().unwrap();
    assert!(!pending.started);
    assert_eq!(fs.flush_uploads().await.unwrap(), 1);
    assert_eq!(h.origin.contents("/i.txt").unwrap(), "resume");
}

#[tokio::test]
async fn test_reconcile_staging_recovers_orphans() {
    let staging = MemoryBackend::new("staging");
    staging.insert_file("/lost/orphan.txt", "orphan", t0());
    let h = Harness::build(MemoryBackend::new("origin"), Some(staging), false, |_| {}).await;

    assert_eq!(h.fs.reconcile_staging().await.unwrap(), 1);
    assert_eq!(h.fs.reconcile_staging().await.unwrap(), 0);
    let obj = h.fs.object("/lost/orphan.txt").await.unwrap();
    assert!(obj.is_pending_upload().await.unwrap());

    assert_eq!(h.fs.flush_uploads().await.unwrap(), 1);
    assert_eq!(h.origin.contents("/lost/orphan.txt").unwrap(), "orphan");
}
