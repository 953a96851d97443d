use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is currently uploading, try again later")]
    Busy(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} is not a directory")]
    NotADirectory(String),

    #[error("{0} is a directory")]
    IsADirectory(String),

    #[error("directory {0} is not empty")]
    DirectoryNotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("backend {0} is offline")]
    Offline(String),

    // Anything an origin driver reports that has no better home above.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("upload of {path} abandoned after {attempts} attempts")]
    UploadAbandoned { path: String, attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }

    /// Map an IO error raised while touching `path` so that a missing file
    /// surfaces as [`Error::NotFound`] carrying the cache path rather than
    /// the on-disk one.
    pub fn from_io(path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_string()),
            _ => Self::Io(err),
        }
    }
}
