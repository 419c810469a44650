//! Splitting a run of word accesses into pages of frames that fit a fixed scratch buffer

use crate::{
    FRAME_SIZE,
    WORD_SIZE,
};
use std::ops::Range;

/// The page layout of a word transfer of some byte count through a buffer of some size
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Paging {
    /// Number of whole words in the transfer. Trailing bytes of a partial word are dropped.
    pub words: usize,
    /// Largest number of frames that fit in the buffer
    pub per_page: usize,
}

impl Paging {
    #[must_use]
    pub fn new(byte_count: usize, bufsiz: usize) -> Self {
        Self {
            words: byte_count / WORD_SIZE,
            per_page: bufsiz / FRAME_SIZE,
        }
    }

    /// Number of bus transactions needed. Zero if there is nothing to do or if not even one frame
    /// fits in the buffer.
    #[must_use]
    pub fn pages(&self) -> usize {
        if self.per_page == 0 {
            return 0;
        }
        self.words.div_ceil(self.per_page)
    }

    /// Number of bytes of caller data actually moved
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.words * WORD_SIZE
    }

    /// The word indices covered by page `page`
    #[must_use]
    pub fn page(&self, page: usize) -> Range<usize> {
        let start = (page * self.per_page).min(self.words);
        let end = (start + self.per_page).min(self.words);
        start..end
    }

    /// Iterate over the word ranges of every page, in order
    pub fn iter(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.pages()).map(|p| self.page(p))
    }
}
