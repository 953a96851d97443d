//! Fixed-size chunking of file contents.
//!
//! A file is cut into chunks of `chunk_size` bytes; chunk `i` covers
//! `[i * chunk_size, (i + 1) * chunk_size)` clipped to the file size. Chunks
//! are identified by the file path, the file's [`Generation`] and the index,
//! so bytes of an older version are never served for a newer one.

pub mod cache;
pub mod reader;

pub use cache::ChunkCache;
pub use reader::{CachedReader, OpenOption};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub chunk_size: u64,
}

impl Default for ChunkLayout {
    fn default() -> Self {
        Self {
            chunk_size: 5 * 1024 * 1024,
        }
    }
}

impl ChunkLayout {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    #[inline]
    pub fn chunk_index_of(&self, file_offset: u64) -> u64 {
        file_offset / self.chunk_size
    }

    #[inline]
    pub fn within_chunk_offset(&self, file_offset: u64) -> u64 {
        file_offset % self.chunk_size
    }

    #[inline]
    pub fn chunk_start(&self, index: u64) -> u64 {
        index.saturating_mul(self.chunk_size)
    }

    /// Length of chunk `index` in a file of `file_size` bytes, 0 past the end.
    pub fn chunk_len(&self, index: u64, file_size: u64) -> u64 {
        let start = self.chunk_start(index);
        if start >= file_size {
            return 0;
        }
        (file_size - start).min(self.chunk_size)
    }

    pub fn chunk_count(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.chunk_size)
    }

    /// Pieces of `[offset, offset + len)` per chunk, stopping at `file_size`
    /// when it is known (non-negative).
    pub fn spans(&self, offset: u64, len: u64, file_size: i64) -> ChunkSpans {
        let end = offset.saturating_add(len);
        let end = if file_size >= 0 {
            end.min(file_size as u64)
        } else {
            end
        };
        ChunkSpans {
            layout: *self,
            pos: offset,
            end,
        }
    }
}

/// Part of a read that falls inside one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u64,
    pub offset: u64,
    pub len: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkSpans {
    layout: ChunkLayout,
    pos: u64,
    end: u64,
}

impl Iterator for ChunkSpans {
    type Item = ChunkSpan;

    fn next(&mut self) -> Option<ChunkSpan> {
        if self.pos >= self.end {
            return None;
        }
        let offset = self.layout.within_chunk_offset(self.pos);
        let take = (self.layout.chunk_size - offset).min(self.end - self.pos);
        let span = ChunkSpan {
            index: self.layout.chunk_index_of(self.pos),
            offset,
            len: take as usize,
        };
        self.pos += take;
        Some(span)
    }
}

/// Version of a file's contents as far as the cache can tell: modification
/// time and size. Any change to either invalidates every cached chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation {
    pub mod_time: i64,
    pub size: i64,
}

impl Generation {
    pub fn new(mod_time: i64, size: i64) -> Self {
        Self { mod_time, size }
    }

    /// Fixed width hex form used in chunk file names.
    pub fn token(&self) -> String {
        format!("{:016x}{:016x}", self.mod_time as u64, self.size as u64)
    }

    pub fn parse_token(token: &str) -> Option<Self> {
        if token.len() != 32 || !token.is_ascii() {
            return None;
        }
        let mod_time = u64::from_str_radix(&token[..16], 16).ok()? as i64;
        let size = u64::from_str_radix(&token[16..], 16).ok()? as i64;
        Some(Self { mod_time, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(layout: ChunkLayout, offset: u64, len: u64, size: i64) -> Vec<(u64, u64, usize)> {
        layout
            .spans(offset, len, size)
            .map(|s| (s.index, s.offset, s.len))
            .collect()
    }

    #[test]
    fn test_spans_follow_chunk_boundaries() {
        let layout = ChunkLayout::new(10);
        assert_eq!(collect(layout, 3, 4, 100), [(0, 3, 4)]);
        assert_eq!(
            collect(layout, 8, 15, 100),
            [(0, 8, 2), (1, 0, 10), (2, 0, 3)]
        );
        assert!(collect(layout, 5, 0, 100).is_empty());
    }

    #[test]
    fn test_spans_stop_at_file_size() {
        let layout = ChunkLayout::new(10);
        // The last chunk of a 25 byte file is 5 bytes long.
        assert_eq!(collect(layout, 18, 100, 25), [(1, 8, 2), (2, 0, 5)]);
        assert!(collect(layout, 30, 10, 25).is_empty());
        assert!(collect(layout, 0, 10, 0).is_empty());
        // Unknown size: the caller finds the end by reading.
        assert_eq!(collect(layout, 18, 4, -1), [(1, 8, 2), (2, 0, 2)]);
        assert_eq!(collect(layout, u64::MAX - 1, 10, -1).len(), 1);
    }

    #[test]
    fn test_chunk_len_clips_to_file_size() {
        let layout = ChunkLayout::new(10);
        assert_eq!(layout.chunk_count(25), 3);
        assert_eq!(layout.chunk_len(0, 25), 10);
        assert_eq!(layout.chunk_len(2, 25), 5);
        assert_eq!(layout.chunk_len(3, 25), 0);
        assert_eq!(layout.chunk_count(0), 0);
    }

    #[test]
    fn test_generation_token() {
        let g = Generation::new(1_700_000_000_000_000_000, 42);
        assert_eq!(Generation::parse_token(&g.token()), Some(g));
        let neg = Generation::new(-5, -1);
        assert_eq!(Generation::parse_token(&neg.token()), Some(neg));
        assert_eq!(Generation::parse_token("xyz"), None);
    }
}
