//! Sequential reader over a cached object. Whole chunks are pulled through
//! the [`ChunkCache`] (or straight from the backend for staged objects) and
//! sliced to the requested window.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};

use super::{ChunkCache, ChunkLayout, Generation};
use crate::backend::Backend;
use crate::error::{Error, Result};

/// Where to start reading and how much to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOption {
    /// Start at this byte offset.
    Seek(u64),
    /// Inclusive byte range. `start: None` with `end: Some(n)` means the
    /// last `n` bytes; `end: None` reads to the end.
    Range { start: Option<u64>, end: Option<u64> },
}

impl OpenOption {
    /// Resolve to `(offset, limit)` against an object of `size` bytes.
    pub fn decode(&self, size: i64) -> (u64, Option<u64>) {
        match *self {
            OpenOption::Seek(offset) => (offset, None),
            OpenOption::Range {
                start: Some(start),
                end: Some(end),
            } => (start, Some(end.saturating_add(1).saturating_sub(start))),
            OpenOption::Range {
                start: Some(start),
                end: None,
            } => (start, None),
            OpenOption::Range {
                start: None,
                end: Some(suffix),
            } => ((size.max(0) as u64).saturating_sub(suffix), None),
            OpenOption::Range {
                start: None,
                end: None,
            } => (0, None),
        }
    }
}

pub struct CachedReader {
    path: String,
    backend: Arc<dyn Backend>,
    chunks: Option<Arc<ChunkCache>>,
    layout: ChunkLayout,
    generation: Generation,
    size: i64,
    pos: u64,
    limit: Option<u64>,
    current: Option<(u64, Bytes)>,
}

impl std::fmt::Debug for CachedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedReader")
            .field("path", &self.path)
            .field("backend", &self.backend.name())
            .field("cached", &self.chunks.is_some())
            .field("size", &self.size)
            .field("pos", &self.pos)
            .field("limit", &self.limit)
            .finish()
    }
}

impl CachedReader {
    /// `chunks: None` reads straight from `backend` without caching.
    pub fn new(
        path: impl Into<String>,
        backend: Arc<dyn Backend>,
        chunks: Option<Arc<ChunkCache>>,
        layout: ChunkLayout,
        generation: Generation,
        size: i64,
    ) -> Self {
        Self {
            path: path.into(),
            backend,
            chunks,
            layout,
            generation,
            size,
            pos: 0,
            limit: None,
            current: None,
        }
    }

    /// Apply open options in order; later ones override earlier offsets.
    pub fn with_options(mut self, options: &[OpenOption]) -> Self {
        for opt in options {
            let (offset, limit) = opt.decode(self.size);
            self.pos = offset;
            if limit.is_some() || matches!(opt, OpenOption::Range { .. }) {
                self.limit = limit;
            }
        }
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Largest read allowed from the current position, capped at `max`.
    fn clamp(&self, max: u64) -> u64 {
        let mut n = max;
        if let Some(limit) = self.limit {
            n = n.min(limit);
        }
        if self.size >= 0 {
            n = n.min((self.size as u64).saturating_sub(self.pos));
        }
        n
    }

    fn advance(&mut self, n: usize) {
        self.pos += n as u64;
        if let Some(limit) = self.limit.as_mut() {
            *limit = limit.saturating_sub(n as u64);
        }
    }

    async fn load(&mut self, index: u64) -> Result<Bytes> {
        if let Some((cur, data)) = &self.current {
            if *cur == index {
                return Ok(data.clone());
            }
        }
        let start = self.layout.chunk_start(index);
        let expected = (self.size >= 0).then(|| self.layout.chunk_len(index, self.size as u64));
        let len = expected.unwrap_or(self.layout.chunk_size);
        let data = match &self.chunks {
            Some(cache) => {
                let backend = self.backend.clone();
                let path = self.path.clone();
                cache
                    .get_or_fetch(
                        &self.path,
                        self.generation,
                        self.layout.chunk_size,
                        index,
                        expected,
                        move || async move { backend.read(&path, start, len).await },
                    )
                    .await?
            }
            None => self.backend.read(&self.path, start, len).await?,
        };
        self.current = Some((index, data.clone()));
        Ok(data)
    }

    /// Fill `buf` as far as the object allows. Returns 0 at the end.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let want = self.clamp(buf.len() as u64) as usize;
        let mut filled = 0;
        for span in self.layout.spans(self.pos, want as u64, self.size) {
            let data = self.load(span.index).await?;
            let start = span.offset as usize;
            if start >= data.len() {
                break;
            }
            let n = span.len.min(data.len() - start);
            buf[filled..filled + n].copy_from_slice(&data[start..start + n]);
            filled += n;
            if n < span.len {
                break;
            }
        }
        self.advance(filled);
        Ok(filled)
    }

    /// Next piece of the object, never crossing a chunk boundary.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let want = self.clamp(self.layout.chunk_size - self.layout.within_chunk_offset(self.pos));
        if want == 0 {
            return Ok(None);
        }
        let data = self.load(self.layout.chunk_index_of(self.pos)).await?;
        let start = self.layout.within_chunk_offset(self.pos) as usize;
        if start >= data.len() {
            return Ok(None);
        }
        let n = (want as usize).min(data.len() - start);
        let out = data.slice(start..start + n);
        self.advance(n);
        Ok(Some(out))
    }

    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(piece) = self.read_chunk().await? {
            out.extend_from_slice(&piece);
        }
        Ok(out.freeze())
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes>> {
        stream::try_unfold(self, |mut reader| async move {
            let next = reader.read_chunk().await?;
            Ok::<_, Error>(next.map(|piece| (piece, reader)))
        })
        .boxed()
    }
}
