//! Sliding-window text chunker.
//!
//! Splits file content into [`Chunk`]s of at most `max_size` characters.
//! Each window after the first starts `max_size - overlap` characters after
//! the previous one, so consecutive chunks share exactly `overlap`
//! characters. The last window is clipped to the end of the content.
//!
//! Offsets are counted in characters, never bytes, so a multi-byte code
//! point is never split. Boundaries depend only on the content and the
//! parameters, which keeps cached results reproducible across restarts.

use crate::error::{PipelineError, Result};
use crate::models::Chunk;

/// Approximate chars-per-token ratio used when sizes are given in tokens.
pub const CHARS_PER_TOKEN: usize = 4;

/// Validated window parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    max_size: usize,
    overlap: usize,
}

impl ChunkParams {
    /// Fails with [`PipelineError::Configuration`] unless
    /// `0 <= overlap < max_size`.
    pub fn new(max_size: usize, overlap: usize) -> Result<Self> {
        if max_size == 0 {
            return Err(PipelineError::configuration("chunk size must be > 0"));
        }
        if overlap >= max_size {
            return Err(PipelineError::configuration(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                overlap, max_size
            )));
        }
        Ok(Self { max_size, overlap })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Distance between the starts of consecutive windows.
    pub fn step(&self) -> usize {
        self.max_size - self.overlap
    }

    /// Number of chunks produced for content of `len` characters.
    pub fn expected_count(&self, len: usize) -> usize {
        if len == 0 {
            0
        } else if len <= self.max_size {
            1
        } else {
            (len - self.overlap).div_ceil(self.step())
        }
    }
}

/// Lazy iterator over the chunks of one file.
///
/// Cloning the iterator (or calling [`chunks`] again) restarts it and yields
/// the same boundaries.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    file: &'a str,
    content: &'a str,
    params: ChunkParams,
    total_chars: usize,
    start_char: usize,
    start_byte: usize,
    index: usize,
    done: bool,
}

impl<'a> Chunks<'a> {
    fn new(file: &'a str, content: &'a str, params: ChunkParams) -> Self {
        let total_chars = content.chars().count();
        Self {
            file,
            content,
            params,
            total_chars,
            start_char: 0,
            start_byte: 0,
            index: 0,
            done: total_chars == 0,
        }
    }

    /// Byte offset `n` characters after `from`, clamped to the content end.
    fn advance(&self, from: usize, n: usize) -> usize {
        self.content[from..]
            .char_indices()
            .nth(n)
            .map(|(i, _)| from + i)
            .unwrap_or(self.content.len())
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done {
            return None;
        }

        let end_char = (self.start_char + self.params.max_size).min(self.total_chars);
        let end_byte = self.advance(self.start_byte, end_char - self.start_char);

        let chunk = Chunk {
            file: self.file.to_string(),
            index: self.index,
            start: self.start_char,
            end: end_char,
            overlap: if self.index == 0 { 0 } else { self.params.overlap },
            text: self.content[self.start_byte..end_byte].to_string(),
        };

        if end_char == self.total_chars {
            self.done = true;
        } else {
            let step = self.params.step();
            self.start_byte = self.advance(self.start_byte, step);
            self.start_char += step;
            self.index += 1;
        }

        Some(chunk)
    }
}

/// Iterate over the chunks of `content`. Empty content yields nothing.
pub fn chunks<'a>(file: &'a str, content: &'a str, params: ChunkParams) -> Chunks<'a> {
    Chunks::new(file, content, params)
}

/// Collect all chunks of `content` with dense indices starting at 0.
pub fn chunk_text(file: &str, content: &str, params: ChunkParams) -> Vec<Chunk> {
    chunks(file, content, params).collect()
}
