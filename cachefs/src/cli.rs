use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "cachefs", version, about = "Caching overlay over a local origin directory")]
pub struct Cli {
    /// Directory acting as the origin
    #[arg(long, env = "CACHEFS_ORIGIN")]
    pub origin: PathBuf,

    /// Staging directory; enables write-back when set
    #[arg(long, env = "CACHEFS_STAGING")]
    pub staging: Option<PathBuf>,

    /// Where the metadata database and chunk files live
    #[arg(long, env = "CACHEFS_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Seconds a cached record stays fresh
    #[arg(long, env = "CACHEFS_INFO_AGE", default_value_t = 6 * 60 * 60)]
    pub info_age: u64,

    /// Chunk size in bytes
    #[arg(long, env = "CACHEFS_CHUNK_SIZE", default_value_t = 5 * 1024 * 1024)]
    pub chunk_size: u64,

    /// Upper bound of the chunk cache in bytes
    #[arg(long, env = "CACHEFS_CHUNK_TOTAL_SIZE", default_value_t = 10 * 1024 * 1024 * 1024)]
    pub chunk_total_size: u64,

    /// Seconds a staged file waits before upload
    #[arg(long, env = "CACHEFS_UPLOAD_WAIT", default_value_t = 15)]
    pub upload_wait: u64,

    /// Give up on an upload after this many failures (0 retries forever)
    #[arg(long, env = "CACHEFS_UPLOAD_MAX_ATTEMPTS", default_value_t = 0)]
    pub upload_max_attempts: u32,

    /// Use TinyLFU instead of LRU for chunk eviction
    #[arg(long, env = "CACHEFS_TINY_LFU", default_value_t = false)]
    pub tiny_lfu: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Show a file's attributes
    Stat {
        path: String,
        /// Also print the sha256 of the contents
        #[arg(long)]
        hash: bool,
    },
    /// Print a file's contents, or a slice of them
    Cat {
        path: String,
        #[arg(long)]
        offset: Option<u64>,
        #[arg(long)]
        length: Option<u64>,
    },
    /// Copy a local file into the cache
    Put { source: PathBuf, path: String },
    /// Delete a file
    Rm { path: String },
    /// Move a file
    Mv { from: String, to: String },
    /// Create a directory
    Mkdir { path: String },
    /// Remove an empty directory
    Rmdir { path: String },
    /// Show staged files waiting for upload
    Pending,
    /// Upload every staged file now
    Sync,
}
