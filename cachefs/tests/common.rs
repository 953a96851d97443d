use std::sync::Arc;
use std::time::Duration;

use cachefs::{CacheConfig, CacheFs, ManualClock, MemoryBackend};
use chrono::{DateTime, Utc};
use tempfile::TempDir;

#[allow(dead_code)]
pub const INFO_AGE: Duration = Duration::from_secs(60);

pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub fn test_config(root: &TempDir) -> CacheConfig {
    let mut config = CacheConfig::with_root(root.path());
    config.info_age = INFO_AGE;
    config.chunk_size = 10;
    config.chunk_total_size = 1024 * 1024;
    config.upload_wait = Duration::ZERO;
    config.upload_poll_interval = Duration::from_millis(20);
    config
}

#[allow(dead_code)]
pub struct Harness {
    pub dir: TempDir,
    pub origin: Arc<MemoryBackend>,
    pub staging: Option<Arc<MemoryBackend>>,
    pub clock: Arc<ManualClock>,
    pub fs: Arc<CacheFs>,
}

#[allow(dead_code)]
impl Harness {
    /// Write-through cache over an in-memory origin.
    pub async fn write_through(origin: MemoryBackend) -> Self {
        Self::build(origin, None, false, |_| {}).await
    }

    /// Write-back cache; uploads only happen through `flush_uploads`.
    pub async fn write_back(origin: MemoryBackend) -> Self {
        Self::build(origin, Some(MemoryBackend::new("staging")), false, |_| {}).await
    }

    pub async fn build(
        origin: MemoryBackend,
        staging: Option<MemoryBackend>,
        worker: bool,
        tweak: impl FnOnce(&mut CacheConfig),
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        tweak(&mut config);
        let origin = Arc::new(origin);
        let staging = staging.map(Arc::new);
        let clock = Arc::new(ManualClock::new(t0()));
        let fs = open(&origin, staging.as_ref(), &clock, config, worker).await;
        Self {
            dir,
            origin,
            staging,
            clock,
            fs: Arc::new(fs),
        }
    }

    pub fn staging(&self) -> &Arc<MemoryBackend> {
        self.staging.as_ref().unwrap()
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }
}

pub async fn open(
    origin: &Arc<MemoryBackend>,
    staging: Option<&Arc<MemoryBackend>>,
    clock: &Arc<ManualClock>,
    config: CacheConfig,
    worker: bool,
) -> CacheFs {
    let mut builder = CacheFs::builder(origin.clone())
        .config(config)
        .clock(clock.clone());
    if let Some(staging) = staging {
        builder = builder.staging(staging.clone());
    }
    if !worker {
        builder = builder.without_worker();
    }
    builder.build().await.unwrap()
}

/// Poll `cond` until it holds or five seconds pass.
#[allow(dead_code)]
pub async fn eventually<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
