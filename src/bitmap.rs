use core::{alloc::Layout, mem};

/// A bitmap backed by caller-provided storage, one bit per page.
pub struct Bitmap {
    num_bits: usize,
    map: *mut u64,
}

impl Bitmap {
    /// Returns the layout of a region suitable to back a bitmap of
    /// `num_bits` bits.
    pub fn map_layout(num_bits: usize) -> Layout {
        Layout::array::<u64>(Self::num_words(num_bits)).expect("bitmap metadata layout error")
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`, with
    /// every bit cleared.
    ///
    /// A `Layout` describing a suitable region for `map` can be obtained with
    /// `Bitmap::map_layout(num_bits)`.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for
    ///   `map_layout(num_bits).size()` bytes, and it must be properly
    ///   aligned.
    /// - `map` must not be accessed through any other pointer while the
    ///   bitmap exists.
    pub unsafe fn new(num_bits: usize, map: *mut u64) -> Bitmap {
        assert!(num_bits > 0);
        assert!(!map.is_null());
        assert!(map.align_offset(mem::align_of::<u64>()) == 0);

        let num_words = Self::num_words(num_bits);

        for i in 0..(num_words as isize) {
            unsafe { map.offset(i).write(0) };
        }

        Bitmap { num_bits, map }
    }

    #[inline]
    pub fn num_words(num_bits: usize) -> usize {
        (num_bits.checked_add(u64::BITS as usize - 1).unwrap())
            .checked_div(u64::BITS as usize)
            .unwrap()
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit as u64 % u64::BITS as u64),
        )
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (word_idx, mask) = Self::index_and_mask(index);

        let word_idx: isize = word_idx.try_into().expect("get: index overflowed an isize");

        unsafe { self.map.offset(word_idx).read() & mask != 0 }
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (word_idx, mask) = Self::index_and_mask(index);

        let word_idx: isize = word_idx.try_into().expect("set: index overflowed an isize");

        unsafe {
            let word_ptr = self.map.offset(word_idx);
            let word = word_ptr.read();
            word_ptr.write(match value {
                true => word | mask,
                false => word & !mask,
            });
        }
    }
}
