//! Backing storage for a ring buffer.
//!
//! On Linux the region is an anonymous page-aligned mapping; elsewhere it is
//! a plain heap allocation. All readers and writers are threads of one
//! process and reach the region only through the ring buffer's
//! `std::sync::Mutex`, which does not synchronise across processes. Nothing
//! outside this module sees a raw pointer.

use super::BufferError;

pub(crate) struct SharedRegion {
    #[cfg(target_os = "linux")]
    ptr: std::ptr::NonNull<u8>,
    #[cfg(not(target_os = "linux"))]
    bytes: Box<[u8]>,
    len: usize,
}

// The mapping is exclusively owned by the region and only touched through
// `&self`/`&mut self`, which the owning mutex serialises.
#[cfg(target_os = "linux")]
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    #[cfg(target_os = "linux")]
    pub(crate) fn new(len: usize) -> Result<Self, BufferError> {
        if len == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        // SAFETY: anonymous mapping with no file descriptor; the kernel picks
        // the address and zero-fills the pages.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(BufferError::Region(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        let ptr = std::ptr::NonNull::new(raw.cast::<u8>())
            .ok_or_else(|| BufferError::Region("mmap returned null".to_string()))?;
        Ok(Self { ptr, len })
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn new(len: usize) -> Result<Self, BufferError> {
        if len == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        Ok(Self {
            bytes: vec![0u8; len].into_boxed_slice(),
            len,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(target_os = "linux")]
    fn bytes(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[cfg(target_os = "linux")]
    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    #[cfg(not(target_os = "linux"))]
    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[cfg(not(target_os = "linux"))]
    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Bytes of slot `index` when the region is divided into `item_size` slots.
    pub(crate) fn slot(&self, index: usize, item_size: usize) -> &[u8] {
        let start = index * item_size;
        &self.bytes()[start..start + item_size]
    }

    pub(crate) fn slot_mut(&mut self, index: usize, item_size: usize) -> &mut [u8] {
        let start = index * item_size;
        &mut self.bytes_mut()[start..start + item_size]
    }
}

#[cfg(target_os = "linux")]
impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the mapping created in `new`.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_disjoint() {
        let mut region = SharedRegion::new(12).unwrap();
        region.slot_mut(1, 4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(region.slot(0, 4), &[0, 0, 0, 0]);
        assert_eq!(region.slot(1, 4), &[1, 2, 3, 4]);
        assert_eq!(region.slot(2, 4), &[0, 0, 0, 0]);
        assert_eq!(region.len(), 12);
    }

    #[test]
    fn zero_length_is_rejected() {
        assert!(matches!(
            SharedRegion::new(0),
            Err(BufferError::ZeroCapacity)
        ));
    }
}
