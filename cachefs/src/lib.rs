// Library crate for cachefs: a caching overlay over a slow origin backend.
// The binary in main.rs is a thin CLI over the same API.

pub mod backend;
pub mod chunk;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod fs;
pub mod locks;
pub mod meta;
pub mod notify;
pub mod object;
pub mod path;
pub mod upload;

pub use backend::{
    Backend, ChangeEvent, EntryInfo, EntryKind, HashKind, LocalFsBackend, MemoryBackend, Op,
    UNKNOWN_SIZE,
};
pub use chunk::{CachedReader, OpenOption};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, EvictionPolicy, RetryPolicy};
pub use directory::CachedDirectory;
pub use error::{Error, Result};
pub use fs::{CacheFs, CacheFsBuilder, Source};
pub use object::CachedObject;
pub use upload::{PauseGuard, PendingUpload};
