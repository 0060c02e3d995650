//! Send/receive buffer pool (C3), keyed by `slab`'s integer ids — exactly
//! the "buffer id (small integer) as authoritative identity" §3 requires.
//! Registration against a protection domain is the memory-region manager's
//! job (`crate::device`); this module only tracks which registered chunks
//! are currently on loan.

use std::ptr::NonNull;

use slab::Slab;

use crate::device::MemoryRegion;
use crate::error::{Error, Result};

/// A view into a pooled buffer, valid for as long as the holder keeps the
/// handle. Not `Clone`: a buffer has exactly one holder between `acquire`
/// and `send`, or between receive-callback entry and return (§3).
pub struct BufferHandle {
    id: u32,
    ptr: NonNull<u8>,
    len: usize,
    lkey: u32,
}

unsafe impl Send for BufferHandle {}

impl BufferHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Local address for a work request's scatter/gather entry.
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Reconstructs the registration this handle was acquired from, so it
    /// can be handed back to `BufferPool::release`.
    pub(crate) fn region(&self) -> MemoryRegion {
        MemoryRegion::from_raw(self.ptr, self.len, self.lkey)
    }

    /// Read-only view of the buffer contents, sized to `len` (which may be
    /// smaller than the buffer's registered capacity).
    pub fn view(&self, len: usize) -> BufferView<'_> {
        debug_assert!(len <= self.len);
        BufferView {
            ptr: self.ptr,
            len,
            _buffer: self,
        }
    }

    /// Mutable slice over the full registered capacity, for filling a send
    /// buffer before handing it to `Connection::send`.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// A borrowed, read-only view of buffer contents handed to
/// `on_receive`/`on_send` callbacks.
pub struct BufferView<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _buffer: &'a BufferHandle,
}

impl<'a> BufferView<'a> {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

struct Slot {
    region: MemoryRegion,
}

/// Pool of pre-registered, fixed-size buffers. Accessed only from its
/// Event Processor thread (§5 "shared resources").
pub struct BufferPool {
    slots: Slab<Slot>,
    buffer_length: usize,
}

impl BufferPool {
    pub fn new(buffer_length: usize) -> BufferPool {
        BufferPool {
            slots: Slab::new(),
            buffer_length,
        }
    }

    /// Seeds the pool with `count` buffers registered through `region`.
    pub fn with_capacity(buffer_length: usize, regions: Vec<MemoryRegion>) -> BufferPool {
        let mut slots = Slab::with_capacity(regions.len());
        for region in regions {
            slots.insert(Slot { region });
        }
        BufferPool {
            slots,
            buffer_length,
        }
    }

    pub fn buffer_length(&self) -> usize {
        self.buffer_length
    }

    /// Acquires a buffer of at least `length` bytes, or `OutOfBuffers` if the
    /// pool is exhausted (§4.3).
    pub fn acquire(&mut self, length: usize) -> Result<BufferHandle> {
        if length > self.buffer_length {
            return Err(Error::InvalidArgument(format!(
                "requested buffer length {} exceeds pool buffer length {}",
                length, self.buffer_length
            )));
        }
        if self.slots.is_empty() {
            return Err(Error::OutOfBuffers);
        }
        let id = self
            .slots
            .iter()
            .map(|(id, _)| id)
            .next()
            .ok_or(Error::OutOfBuffers)?;
        let slot = self.slots.remove(id);
        Ok(BufferHandle {
            id: id as u32,
            ptr: slot.region.ptr(),
            len: self.buffer_length,
            lkey: slot.region.lkey(),
        })
    }

    /// Returns a buffer to the pool by id. Posted-receive buffers are
    /// re-posted by the caller after this call returns the registration.
    pub fn release(&mut self, id: u32, region: MemoryRegion) {
        self.slots.insert(Slot { region });
        let _ = id;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::MemoryRegion;

    fn fake_region() -> MemoryRegion {
        // 4096 bytes is enough for any test buffer length used here.
        let layout = std::alloc::Layout::from_size_align(4096, 8).unwrap();
        let ptr = unsafe { std::alloc::alloc(layout) };
        MemoryRegion::from_raw(NonNull::new(ptr).unwrap(), 4096, 0)
    }

    #[test]
    fn acquire_then_out_of_buffers() {
        let mut pool = BufferPool::with_capacity(4096, vec![fake_region()]);
        let handle = pool.acquire(128).unwrap();
        assert_eq!(pool.len(), 0);
        assert!(matches!(pool.acquire(128), Err(Error::OutOfBuffers)));
        let id = handle.id();
        // releasing doesn't leak: it's immediately reusable.
        let region = MemoryRegion::from_raw(
            NonNull::new(handle.ptr.as_ptr()).unwrap(),
            handle.len,
            handle.lkey,
        );
        drop(handle);
        pool.release(id, region);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn rejects_oversized_request() {
        let mut pool = BufferPool::with_capacity(4096, vec![fake_region()]);
        assert!(matches!(
            pool.acquire(8192),
            Err(Error::InvalidArgument(_))
        ));
    }
}
