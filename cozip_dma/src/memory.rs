use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{CozipDmaError, FRAGMENT_CAPACITY, FRAGMENT_PREFIX_LEN, lock, read_u32};

pub const PAGE_SIZE: usize = 4096;

pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub fn align_down(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Zero-initialized, page-aligned heap block.
///
/// The visible length is the requested length; the allocation itself is
/// rounded up to whole pages.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The buffer uniquely owns its allocation.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    pub fn zeroed(len: usize) -> Result<Self, CozipDmaError> {
        let alloc_len = align_up(len.max(1), PAGE_SIZE);
        let layout = Layout::from_size_align(alloc_len, PAGE_SIZE)
            .map_err(|_| CozipDmaError::OutOfMemory(len))?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(CozipDmaError::OutOfMemory(alloc_len))?;

        Ok(Self { ptr, len, layout })
    }

    /// Allocates `len` rounded up to `granularity`, exposing the whole rounded
    /// length.
    pub fn with_granularity(len: usize, granularity: usize) -> Result<Self, CozipDmaError> {
        if !granularity.is_power_of_two() {
            return Err(CozipDmaError::InvalidArgument(
                "allocation granularity must be a power of two",
            ));
        }
        Self::zeroed(align_up(len, granularity))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() >= len initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Buffer visible to both the CPU and the transfer engine.
#[derive(Clone)]
pub struct DmaBuffer {
    inner: Arc<Mutex<AlignedBuffer>>,
    len: usize,
}

impl DmaBuffer {
    pub fn allocate(len: usize) -> Result<Self, CozipDmaError> {
        Ok(Self::from_aligned(AlignedBuffer::zeroed(len)?))
    }

    pub fn from_aligned(buffer: AlignedBuffer) -> Self {
        let len = buffer.len();
        Self {
            inner: Arc::new(Mutex::new(buffer)),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, AlignedBuffer>, CozipDmaError> {
        lock(&self.inner)
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, CozipDmaError> {
        read_u32(&self.lock()?, offset)
    }

    pub fn to_vec(&self, len: usize) -> Result<Vec<u8>, CozipDmaError> {
        let guard = self.lock()?;
        guard
            .get(..len)
            .map(<[u8]>::to_vec)
            .ok_or(CozipDmaError::InvalidArgument("length exceeds buffer"))
    }

    /// Reclaims exclusive ownership, copying if the engine still holds a
    /// reference.
    pub fn into_aligned(self) -> Result<AlignedBuffer, CozipDmaError> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => mutex
                .into_inner()
                .map_err(|_| CozipDmaError::Internal("mutex poisoned")),
            Err(shared) => {
                let guard = lock(&shared)?;
                let mut copy = AlignedBuffer::zeroed(guard.len())?;
                copy.copy_from_slice(&guard);
                Ok(copy)
            }
        }
    }

    pub(crate) fn same_buffer(&self, other: &DmaBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer").field("len", &self.len).finish()
    }
}

/// Growable pool of fixed-capacity fragment buffers.
///
/// Buffers are allocated lazily by index and kept until [`FragmentPool::release`]
/// or drop, so repeated compress/decompress passes reuse them.
#[derive(Debug)]
pub struct FragmentPool {
    buffers: Vec<DmaBuffer>,
    original_sizes: Vec<u32>,
    capacity: usize,
}

impl Default for FragmentPool {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentPool {
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            original_sizes: Vec::new(),
            capacity: FRAGMENT_CAPACITY,
        }
    }

    pub fn with_capacity(fragment_capacity: usize) -> Result<Self, CozipDmaError> {
        if fragment_capacity < FRAGMENT_PREFIX_LEN * 2 || fragment_capacity % 4 != 0 {
            return Err(CozipDmaError::InvalidOptions(
                "fragment capacity must be a multiple of 4 and at least 8 bytes",
            ));
        }
        Ok(Self {
            buffers: Vec::new(),
            original_sizes: Vec::new(),
            capacity: fragment_capacity,
        })
    }

    pub fn fragment_capacity(&self) -> usize {
        self.capacity
    }

    /// Number of allocated buffers. Never shrinks except through `release`.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn ensure_capacity(&mut self, index: usize) -> Result<&DmaBuffer, CozipDmaError> {
        while self.buffers.len() <= index {
            self.buffers.push(DmaBuffer::allocate(self.capacity)?);
            self.original_sizes.push(0);
        }
        Ok(&self.buffers[index])
    }

    pub fn fragment(&self, index: usize) -> Option<&DmaBuffer> {
        self.buffers.get(index)
    }

    pub fn original_size(&self, index: usize) -> Option<u32> {
        self.original_sizes.get(index).copied()
    }

    pub(crate) fn set_original_size(
        &mut self,
        index: usize,
        size: u32,
    ) -> Result<(), CozipDmaError> {
        let slot = self
            .original_sizes
            .get_mut(index)
            .ok_or(CozipDmaError::Internal("fragment slot missing"))?;
        *slot = size;
        Ok(())
    }

    /// Reads the size prefix of a filled fragment.
    pub fn compressed_size(&self, index: usize) -> Result<u32, CozipDmaError> {
        let fragment = self
            .fragment(index)
            .ok_or(CozipDmaError::InvalidArgument("fragment index out of range"))?;
        let size = fragment.read_u32(0)?;
        if size as usize > self.capacity - FRAGMENT_PREFIX_LEN {
            return Err(CozipDmaError::InvalidFrame(
                "fragment size prefix exceeds capacity",
            ));
        }
        Ok(size)
    }

    /// Copies out the payload of a filled fragment, without its prefix.
    pub fn payload(&self, index: usize) -> Result<Vec<u8>, CozipDmaError> {
        let size = self.compressed_size(index)? as usize;
        let fragment = self
            .fragment(index)
            .ok_or(CozipDmaError::InvalidArgument("fragment index out of range"))?;
        let guard = fragment.lock()?;
        Ok(guard[FRAGMENT_PREFIX_LEN..FRAGMENT_PREFIX_LEN + size].to_vec())
    }

    pub fn release(&mut self) {
        self.buffers.clear();
        self.original_sizes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_buffer_is_page_aligned_and_zeroed() {
        let buffer = AlignedBuffer::zeroed(10_000).expect("allocation should succeed");
        assert_eq!(buffer.as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(buffer.len(), 10_000);
        assert!(buffer.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn granularity_rounds_visible_length() {
        let buffer = AlignedBuffer::with_granularity(70_000, 64 * 1024)
            .expect("allocation should succeed");
        assert_eq!(buffer.len(), 128 * 1024);
    }

    #[test]
    fn pool_grows_on_demand_and_never_shrinks() {
        let mut pool = FragmentPool::with_capacity(4096).expect("valid capacity");
        pool.ensure_capacity(2).expect("grow should succeed");
        assert_eq!(pool.len(), 3);
        pool.ensure_capacity(0).expect("existing index should succeed");
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.original_size(2), Some(0));

        pool.release();
        assert!(pool.is_empty());
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let mut pool = FragmentPool::with_capacity(64).expect("valid capacity");
        let fragment = pool.ensure_capacity(0).expect("grow should succeed").clone();
        fragment.lock().expect("lock")[..4].copy_from_slice(&100u32.to_le_bytes());

        let error = pool.compressed_size(0).expect_err("prefix past capacity should fail");
        assert!(matches!(error, CozipDmaError::InvalidFrame(_)));
    }

    #[test]
    fn into_aligned_copies_when_shared() {
        let buffer = DmaBuffer::allocate(16).expect("allocation should succeed");
        buffer.lock().expect("lock")[0] = 7;
        let other = buffer.clone();
        let owned = buffer.into_aligned().expect("reclaim should succeed");
        assert_eq!(owned[0], 7);
        assert_eq!(other.len(), 16);
    }
}
