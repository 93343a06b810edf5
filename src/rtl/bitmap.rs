//! Allocation Bitmap
//!
//! Used for TLS/FLS index allocation in the PEB. The NT original tracks the
//! bits in a caller-supplied buffer; here the bitmap owns its words.

/// Growable-capacity allocation bitmap.
pub struct RtlBitmap {
    words: Vec<u32>,
    bits: u32,
}

impl RtlBitmap {
    /// Create a bitmap with `bits` clear bits.
    pub fn new(bits: u32) -> Self {
        let words = vec![0u32; bits.div_ceil(32) as usize];
        Self { words, bits }
    }

    /// Number of bits tracked.
    #[inline]
    pub fn size(&self) -> u32 {
        self.bits
    }

    /// Test a single bit.
    pub fn test_bit(&self, index: u32) -> bool {
        if index >= self.bits {
            return false;
        }
        self.words[(index / 32) as usize] & (1 << (index % 32)) != 0
    }

    /// Set a single bit.
    pub fn set_bit(&mut self, index: u32) {
        if index < self.bits {
            self.words[(index / 32) as usize] |= 1 << (index % 32);
        }
    }

    /// Clear a single bit.
    pub fn clear_bit(&mut self, index: u32) {
        if index < self.bits {
            self.words[(index / 32) as usize] &= !(1 << (index % 32));
        }
    }

    /// Find the lowest clear bit and set it. Returns the bit index.
    pub fn find_clear_bit_and_set(&mut self) -> Option<u32> {
        for (wi, word) in self.words.iter_mut().enumerate() {
            if *word != u32::MAX {
                let bit = word.trailing_ones();
                let index = wi as u32 * 32 + bit;
                if index >= self.bits {
                    return None;
                }
                *word |= 1 << bit;
                return Some(index);
            }
        }
        None
    }

    /// Count set bits.
    pub fn number_of_set_bits(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_basic() {
        let mut bm = RtlBitmap::new(40);
        assert!(!bm.test_bit(7));
        bm.set_bit(7);
        assert!(bm.test_bit(7));
        bm.clear_bit(7);
        assert!(!bm.test_bit(7));
    }

    #[test]
    fn test_find_clear_allocates_lowest() {
        let mut bm = RtlBitmap::new(40);
        assert_eq!(bm.find_clear_bit_and_set(), Some(0));
        assert_eq!(bm.find_clear_bit_and_set(), Some(1));
        bm.clear_bit(0);
        assert_eq!(bm.find_clear_bit_and_set(), Some(0));
    }

    #[test]
    fn test_exhaustion() {
        let mut bm = RtlBitmap::new(2);
        assert_eq!(bm.find_clear_bit_and_set(), Some(0));
        assert_eq!(bm.find_clear_bit_and_set(), Some(1));
        assert_eq!(bm.find_clear_bit_and_set(), None);
        assert_eq!(bm.number_of_set_bits(), 2);
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let mut bm = RtlBitmap::new(8);
        bm.set_bit(31);
        assert!(!bm.test_bit(31));
        assert_eq!(bm.number_of_set_bits(), 0);
    }
}
