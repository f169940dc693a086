use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free page set, safe to touch from a fault handler.
pub struct PageBitmap {
    words: Box<[AtomicU64]>,
    pages: usize,
}

impl PageBitmap {
    pub fn new(pages: usize) -> Self {
        let words = (0..pages.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self { words, pages }
    }

    pub fn len(&self) -> usize {
        self.pages
    }

    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    /// Returns the previous state of the bit.
    pub fn set(&self, page: usize) -> bool {
        if page >= self.pages {
            return false;
        }
        let bit = 1u64 << (page & 63);
        self.words[page >> 6].fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    /// Returns the previous state of the bit.
    pub fn clear(&self, page: usize) -> bool {
        if page >= self.pages {
            return false;
        }
        let bit = 1u64 << (page & 63);
        self.words[page >> 6].fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    pub fn test(&self, page: usize) -> bool {
        if page >= self.pages {
            return false;
        }
        self.words[page >> 6].load(Ordering::Acquire) & (1u64 << (page & 63)) != 0
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    /// Clears every bit and returns the pages that were set, in order.
    pub fn take_all(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for (i, word) in self.words.iter().enumerate() {
            let mut bits = word.swap(0, Ordering::AcqRel);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                out.push(i * 64 + bit);
                bits &= bits - 1;
            }
        }
        out
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_take() {
        let bits = PageBitmap::new(130);
        assert!(!bits.set(3));
        assert!(bits.set(3));
        assert!(!bits.set(129));
        assert!(!bits.set(500));
        assert_eq!(bits.count(), 2);
        assert!(bits.clear(3));
        assert!(!bits.test(3));
        bits.set(64);
        assert_eq!(bits.take_all(), vec![64, 129]);
        assert_eq!(bits.count(), 0);
    }
}
