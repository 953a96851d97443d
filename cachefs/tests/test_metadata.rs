use std::time::Duration;

use cachefs::{Backend, EntryKind, Error, HashKind, MemoryBackend, Op};

mod common;
use common::{Harness, t0};

fn origin_with(path: &str, data: &'static str) -> MemoryBackend {
    let origin = MemoryBackend::new("origin");
    origin.insert_file(path, data, t0());
    origin
}

#[tokio::test]
async fn test_record_served_until_info_age() {
    let h = Harness::write_through(origin_with("/a.txt", "hello")).await;
    let obj = h.fs.object("/a.txt").await.unwrap();
    assert_eq!(h.origin.calls(Op::Stat), 1);
    assert_eq!(obj.size().await, 5);

    h.advance(30);
    assert_eq!(obj.size().await, 5);
    assert_eq!(obj.mod_time().await, t0());
    assert_eq!(h.origin.calls(Op::Stat), 1);

    h.advance(31);
    assert_eq!(obj.size().await, 5);
    assert_eq!(h.origin.calls(Op::Stat), 2);

    // Fresh again right after the refresh.
    assert_eq!(obj.size().await, 5);
    assert_eq!(h.origin.calls(Op::Stat), 2);
}

#[tokio::test]
async fn test_lookup_after_restart_uses_stored_record() {
    let h = Harness::write_through(origin_with("/a.txt", "hello")).await;
    h.fs.object("/a.txt").await.unwrap();
    let again = h.fs.object("/a.txt").await.unwrap();
    assert_eq!(again.size().await, 5);
    assert_eq!(h.origin.calls(Op::Stat), 1);
}

#[tokio::test]
async fn test_notification_forces_refresh() {
    let h = Harness::write_through(origin_with("/a.txt", "hello")).await;
    let obj = h.fs.object("/a.txt").await.unwrap();

    h.advance(5);
    h.origin.insert_file("/a.txt", "hello world", t0() + chrono::Duration::seconds(5));
    assert_eq!(obj.size().await, 5);

    h.fs.invalidate("/a.txt", EntryKind::File).await;
    assert!(h.fs.is_notified("/a.txt"));
    assert_eq!(obj.size().await, 11);
    assert!(!h.fs.is_notified("/a.txt"));
    assert_eq!(h.origin.calls(Op::Stat), 2);

    assert_eq!(obj.size().await, 11);
    assert_eq!(h.origin.calls(Op::Stat), 2);
}

#[tokio::test]
async fn test_concurrent_refresh_hits_origin_once() {
    let h = Harness::write_through(origin_with("/a.txt", "hello")).await;
    let a = h.fs.object("/a.txt").await.unwrap();
    let b = h.fs.object("/a.txt").await.unwrap();
    h.origin.reset_calls();

    h.advance(61);
    h.origin.set_latency(Duration::from_millis(100));
    let (sa, sb) = tokio::join!(a.size(), b.size());
    assert_eq!((sa, sb), (5, 5));
    assert_eq!(h.origin.calls(Op::Stat), 1);
}

#[tokio::test]
async fn test_offline_origin_serves_cached_attributes() {
    let h = Harness::write_through(origin_with("/a.txt", "hello")).await;
    let obj = h.fs.object("/a.txt").await.unwrap();

    h.advance(61);
    h.origin.set_offline(true);
    assert_eq!(obj.size().await, 5);
    assert_eq!(obj.mod_time().await, t0());
    assert!(matches!(obj.refresh().await, Err(Error::Offline(_))));
    assert!(obj.open(&[]).await.is_err());

    h.origin.set_offline(false);
    obj.refresh().await.unwrap();
    assert_eq!(obj.size().await, 5);
}

#[tokio::test]
async fn test_missing_path() {
    let h = Harness::write_through(MemoryBackend::new("origin")).await;
    assert!(matches!(
        h.fs.object("/nope.txt").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(h.fs.object("/").await, Err(Error::InvalidPath(_))));
}

#[tokio::test]
async fn test_deleted_on_origin_purges_record() {
    let h = Harness::write_through(origin_with("/a.txt", "hello")).await;
    let obj = h.fs.object("/a.txt").await.unwrap();
    h.origin.remove("/a.txt").await.unwrap();

    h.fs.invalidate("/a.txt", EntryKind::File).await;
    assert!(matches!(obj.refresh().await, Err(Error::NotFound(_))));
    assert!(h.fs.store().get_object("/a.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn test_hash_cached_per_generation() {
    let h = Harness::write_through(origin_with("/a.txt", "hello")).await;
    let obj = h.fs.object("/a.txt").await.unwrap();

    let md5 = obj.hash(HashKind::Md5).await.unwrap();
    assert_eq!(md5, "5d41402abc4b2a76b9719d911017c592");
    assert_eq!(obj.hash(HashKind::Md5).await.unwrap(), md5);
    assert_eq!(h.origin.calls(Op::Hash), 1);

    let stored = h.fs.store().get_object("/a.txt").await.unwrap().unwrap();
    assert_eq!(stored.hashes.get(&HashKind::Md5), Some(&md5));

    h.origin
        .insert_file("/a.txt", "changed", t0() + chrono::Duration::seconds(1));
    h.fs.invalidate("/a.txt", EntryKind::File).await;
    let changed = obj.hash(HashKind::Md5).await.unwrap();
    assert_eq!(changed, HashKind::Md5.digest(b"changed"));
    assert_eq!(h.origin.calls(Op::Hash), 2);
}

#[tokio::test]
async fn test_set_mod_time() {
    let h = Harness::write_through(origin_with("/a.txt", "hello")).await;
    let obj = h.fs.object("/a.txt").await.unwrap();
    let later = t0() + chrono::Duration::seconds(3600);

    obj.set_mod_time(later).await.unwrap();
    assert_eq!(obj.mod_time().await, later);
    assert_eq!(h.origin.calls(Op::SetModTime), 1);
    assert_eq!(h.origin.stat("/a.txt").await.unwrap().mod_time, later);
}
