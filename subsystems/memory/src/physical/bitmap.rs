//! # Frame Bitmap
//!
//! One bit per frame (1 = used, 0 = free). Callers provide the locking.

use alloc::vec;
use alloc::vec::Vec;

const BITS: usize = u64::BITS as usize;

/// Allocation bitmap over a contiguous run of frames
#[derive(Debug)]
pub struct FrameBitmap {
    words: Vec<u64>,
    frames: usize,
    /// Word to start the next search from
    hint: usize,
}

impl FrameBitmap {
    /// Create a bitmap with every frame free
    pub fn new(frames: usize) -> Self {
        let mut words = vec![0u64; frames.div_ceil(BITS)];
        // Bits past the last frame stay permanently used
        let tail = frames % BITS;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = !0u64 << tail;
            }
        }
        Self { words, frames, hint: 0 }
    }

    /// Number of frames tracked
    pub fn len(&self) -> usize {
        self.frames
    }

    /// Whether no frames are tracked
    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Find a free frame, searching forward from the last hit
    pub fn find_free(&mut self) -> Option<usize> {
        let count = self.words.len();
        for step in 0..count {
            let word_idx = (self.hint + step) % count;
            let word = self.words[word_idx];
            if word != u64::MAX {
                let bit = (!word).trailing_zeros() as usize;
                self.hint = word_idx;
                return Some(word_idx * BITS + bit);
            }
        }
        None
    }

    /// Find `count` contiguous free frames
    pub fn find_contiguous(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let mut start = 0;
        let mut found = 0;
        for idx in 0..self.frames {
            if self.is_used(idx) {
                found = 0;
                continue;
            }
            if found == 0 {
                start = idx;
            }
            found += 1;
            if found == count {
                return Some(start);
            }
        }
        None
    }

    /// Check whether a frame is marked used
    pub fn is_used(&self, idx: usize) -> bool {
        self.words[idx / BITS] & (1 << (idx % BITS)) != 0
    }

    /// Mark a frame used
    pub fn set_used(&mut self, idx: usize) {
        self.words[idx / BITS] |= 1 << (idx % BITS);
    }

    /// Mark a frame free
    pub fn set_free(&mut self, idx: usize) {
        self.words[idx / BITS] &= !(1 << (idx % BITS));
        self.hint = idx / BITS;
    }

    /// Count free frames
    pub fn count_free(&self) -> usize {
        self.words.iter().map(|w| w.count_zeros() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_bits_never_allocated() {
        let mut bm = FrameBitmap::new(3);
        assert_eq!(bm.count_free(), 3);
        for expected in 0..3 {
            let idx = bm.find_free().unwrap();
            assert_eq!(idx, expected);
            bm.set_used(idx);
        }
        assert_eq!(bm.find_free(), None);
    }

    #[test]
    fn test_contiguous_skips_holes() {
        let mut bm = FrameBitmap::new(130);
        bm.set_used(1);
        bm.set_used(65);
        assert_eq!(bm.find_contiguous(2), Some(2));
        assert_eq!(bm.find_contiguous(64), Some(66));
        assert_eq!(bm.find_contiguous(200), None);
    }

    #[test]
    fn test_free_resets_hint() {
        let mut bm = FrameBitmap::new(256);
        for i in 0..256 {
            bm.set_used(i);
        }
        bm.set_free(7);
        assert_eq!(bm.find_free(), Some(7));
    }
}
