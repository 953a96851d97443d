use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use chrono::Utc;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use cachefs::{
    Backend, CacheConfig, CacheFs, EvictionPolicy, HashKind, LocalFsBackend, OpenOption,
    RetryPolicy,
};
use cli::{Cli, Commands};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let fs = open_cache(&cli).await?;
    let result = run(&fs, cli.command).await;
    fs.shutdown().await;
    result
}

async fn open_cache(cli: &Cli) -> anyhow::Result<CacheFs> {
    let mut config = match &cli.cache_dir {
        Some(dir) => CacheConfig::with_root(dir),
        None => CacheConfig::default(),
    };
    config.info_age = Duration::from_secs(cli.info_age);
    config.chunk_size = cli.chunk_size;
    config.chunk_total_size = cli.chunk_total_size;
    config.upload_wait = Duration::from_secs(cli.upload_wait);
    if cli.upload_max_attempts > 0 {
        config.retry = RetryPolicy::MaxAttempts(cli.upload_max_attempts);
    }
    if cli.tiny_lfu {
        config.eviction = EvictionPolicy::TinyLfu;
    }

    let origin: Arc<dyn Backend> = Arc::new(LocalFsBackend::new(&cli.origin));
    let mut builder = CacheFs::builder(origin).config(config).without_worker();
    if let Some(staging) = &cli.staging {
        builder = builder.staging(Arc::new(LocalFsBackend::new(staging)));
    }
    let fs = builder.build().await.context("failed to open cache")?;
    let recovered = fs.reconcile_staging().await?;
    if recovered > 0 {
        eprintln!("recovered {recovered} staged files");
    }
    Ok(fs)
}

async fn run(fs: &CacheFs, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Ls { path } => {
            let dir = fs.directory(&path).await?;
            for entry in dir.read_dir_all().await? {
                let kind = if entry.is_dir() { "d" } else { "-" };
                println!(
                    "{kind} {:>12} {} {}",
                    entry.size,
                    entry.mod_time.format("%Y-%m-%d %H:%M:%S"),
                    entry.name()
                );
            }
        }
        Commands::Stat { path, hash } => {
            let obj = fs.object(&path).await?;
            println!("path:     {}", obj.path());
            println!("size:     {}", obj.size().await);
            println!("modified: {}", obj.mod_time().await.to_rfc3339());
            println!("pending:  {}", obj.is_pending_upload().await?);
            if hash {
                println!("sha256:   {}", obj.hash(HashKind::Sha256).await?);
            }
        }
        Commands::Cat {
            path,
            offset,
            length,
        } => {
            let options = match (offset, length) {
                (_, Some(0)) => return Ok(()),
                (offset, Some(len)) => {
                    let start = offset.unwrap_or(0);
                    vec![OpenOption::Range {
                        start: Some(start),
                        end: Some(start.saturating_add(len - 1)),
                    }]
                }
                (Some(offset), None) => vec![OpenOption::Seek(offset)],
                (None, None) => Vec::new(),
            };
            let mut reader = fs.object(&path).await?.open(&options).await?;
            let mut out = tokio::io::stdout();
            while let Some(chunk) = reader.read_chunk().await? {
                out.write_all(&chunk).await?;
            }
            out.flush().await?;
        }
        Commands::Put { source, path } => {
            let data = tokio::fs::read(&source)
                .await
                .with_context(|| format!("failed to read {}", source.display()))?;
            let obj = fs.put(&path, Bytes::from(data), Utc::now()).await?;
            let staged = obj.is_pending_upload().await?;
            println!(
                "{} ({} bytes{})",
                obj.path(),
                obj.size().await,
                if staged { ", staged" } else { "" }
            );
        }
        Commands::Rm { path } => fs.object(&path).await?.remove().await?,
        Commands::Mv { from, to } => {
            let obj = fs.rename(&from, &to).await?;
            println!("{}", obj.path());
        }
        Commands::Mkdir { path } => {
            fs.mkdir(&path).await?;
        }
        Commands::Rmdir { path } => fs.rmdir(&path).await?,
        Commands::Pending => {
            for entry in fs.pending_uploads().await? {
                println!(
                    "{} staged={} attempts={}{}",
                    entry.path,
                    entry.staged_at.to_rfc3339(),
                    entry.attempts,
                    if entry.started { " uploading" } else { "" }
                );
            }
        }
        Commands::Sync => {
            let delivered = fs.flush_uploads().await?;
            let left = fs.pending_uploads().await?.len();
            println!("uploaded {delivered}, {left} still pending");
        }
    }
    Ok(())
}
