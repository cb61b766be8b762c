use std::ffi::c_void;

/// Heap buffer with 8-byte alignment, so any fixed C struct or scalar can be
/// read through a typed pointer into it. The address is stable for the
/// buffer's whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AlignedBuffer {
    words: Box<[u64]>,
    len: usize,
}

impl AlignedBuffer {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        let mut words = vec![0u64; bytes.len().div_ceil(8).max(1)].into_boxed_slice();
        // SAFETY: `words` spans at least `bytes.len()` bytes and the two
        // allocations cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), words.as_mut_ptr().cast::<u8>(), bytes.len());
        }
        Self {
            words,
            len: bytes.len(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.words.as_ptr().cast()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut c_void {
        self.words.as_mut_ptr().cast()
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        // SAFETY: the first `len` bytes of `words` were initialized in `from_bytes`.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }
}
