use std::time::Duration;

use bytes::Bytes;
use cachefs::meta::expired_ts;
use cachefs::{ChangeEvent, EntryKind, Error, MemoryBackend, Op, OpenOption};
use futures::TryStreamExt;

mod common;
use common::{Harness, t0};

const BODY: &str = "0123456789abcdefghijklmnopqrstuvwxyz";

fn origin() -> MemoryBackend {
    let origin = MemoryBackend::new("origin");
    origin.insert_file("/d/f.bin", BODY, t0());
    origin
}

#[tokio::test]
async fn test_reads_go_through_chunk_cache() {
    let h = Harness::write_through(origin()).await;
    let obj = h.fs.object("/d/f.bin").await.unwrap();

    let data = obj.open(&[]).await.unwrap().read_to_end().await.unwrap();
    assert_eq!(&data[..], BODY.as_bytes());
    assert_eq!(h.origin.calls(Op::Read), 4);
    assert_eq!(h.fs.chunks().chunk_count("/d/f.bin"), 4);

    let again = obj.open(&[]).await.unwrap().read_to_end().await.unwrap();
    assert_eq!(again, data);
    assert_eq!(h.origin.calls(Op::Read), 4);
}

#[tokio::test]
async fn test_range_and_seek() {
    let h = Harness::write_through(origin()).await;
    let obj = h.fs.object("/d/f.bin").await.unwrap();

    let mut reader = obj
        .open(&[OpenOption::Range {
            start: Some(8),
            end: Some(21),
        }])
        .await
        .unwrap();
    assert_eq!(&reader.read_to_end().await.unwrap()[..], &BODY.as_bytes()[8..=21]);
    // Only chunks 0, 1 and 2 were needed.
    assert_eq!(h.origin.calls(Op::Read), 3);

    let mut reader = obj.open(&[OpenOption::Seek(30)]).await.unwrap();
    let mut buf = [0u8; 4];
    let n = reader.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], &BODY.as_bytes()[30..30 + n]);

    let tail: Vec<Bytes> = obj
        .open(&[OpenOption::Range {
            start: None,
            end: Some(6),
        }])
        .await
        .unwrap()
        .into_stream()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(tail.concat(), BODY.as_bytes()[30..].to_vec());
}

#[tokio::test]
async fn test_concurrent_readers_share_fetches() {
    let h = Harness::write_through(origin()).await;
    let a = h.fs.object("/d/f.bin").await.unwrap();
    let b = h.fs.object("/d/f.bin").await.unwrap();
    h.origin.set_latency(Duration::from_millis(50));

    let mut ra = a.open(&[]).await.unwrap();
    let mut rb = b.open(&[]).await.unwrap();
    let (da, db) = tokio::join!(ra.read_to_end(), rb.read_to_end());
    assert_eq!(da.unwrap(), db.unwrap());
    assert_eq!(h.origin.calls(Op::Read), 4);
}

#[tokio::test]
async fn test_update_drops_cached_chunks() {
    let h = Harness::write_through(origin()).await;
    let obj = h.fs.object("/d/f.bin").await.unwrap();
    obj.open(&[]).await.unwrap().read_to_end().await.unwrap();
    assert_eq!(h.fs.chunks().chunk_count("/d/f.bin"), 4);

    let later = t0() + chrono::Duration::seconds(10);
    obj.update(Bytes::from_static(b"fresh contents!"), later)
        .await
        .unwrap();
    assert_eq!(h.fs.chunks().chunk_count("/d/f.bin"), 0);
    assert_eq!(obj.size().await, 15);
    assert_eq!(h.origin.contents("/d/f.bin").unwrap(), "fresh contents!");

    h.origin.reset_calls();
    let data = obj.open(&[]).await.unwrap().read_to_end().await.unwrap();
    assert_eq!(&data[..], b"fresh contents!");
    assert_eq!(h.origin.calls(Op::Read), 2);
}

#[tokio::test]
async fn test_changed_origin_is_not_served_stale() {
    let h = Harness::write_through(origin()).await;
    let obj = h.fs.object("/d/f.bin").await.unwrap();
    obj.open(&[]).await.unwrap().read_to_end().await.unwrap();

    h.origin
        .insert_file("/d/f.bin", "replaced", t0() + chrono::Duration::seconds(1));
    let data = obj.open(&[]).await.unwrap().read_to_end().await.unwrap();
    assert_eq!(&data[..], b"replaced");
}

#[tokio::test]
async fn test_remove_clears_every_trace() {
    let h = Harness::write_through(origin()).await;
    let mut events = h.fs.subscribe();
    let dir = h.fs.directory("/d").await.unwrap();
    assert_eq!(dir.read_dir_all().await.unwrap().len(), 1);

    let obj = h.fs.object("/d/f.bin").await.unwrap();
    obj.open(&[]).await.unwrap().read_to_end().await.unwrap();
    obj.remove().await.unwrap();

    assert!(h.origin.contents("/d/f.bin").is_none());
    assert!(h.fs.store().get_object("/d/f.bin").await.unwrap().is_none());
    assert_eq!(h.fs.chunks().chunk_count("/d/f.bin"), 0);
    let listing = h.fs.store().get_dir("/d").await.unwrap().unwrap();
    assert_eq!(listing.cache_ts, expired_ts());
    assert_eq!(
        events.try_recv().unwrap(),
        ChangeEvent {
            path: "/d".to_string(),
            kind: EntryKind::Directory,
        }
    );

    assert!(dir.read_dir_all().await.unwrap().is_empty());
    assert!(matches!(
        h.fs.object("/d/f.bin").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_chunks_survive_restart() {
    let h = Harness::write_through(origin()).await;
    let obj = h.fs.object("/d/f.bin").await.unwrap();
    obj.open(&[]).await.unwrap().read_to_end().await.unwrap();
    h.fs.shutdown().await;

    let config = common::test_config(&h.dir);
    let fs = common::open(&h.origin, None, &h.clock, config, false).await;
    h.origin.reset_calls();
    let obj = fs.object("/d/f.bin").await.unwrap();
    let data = obj.open(&[]).await.unwrap().read_to_end().await.unwrap();
    assert_eq!(&data[..], BODY.as_bytes());
    assert_eq!(h.origin.calls(Op::Read), 0);
}
