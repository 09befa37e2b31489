//! `Buffer`: the single public contract shared by pooled and unpooled
//! allocations. A `Buffer`
//! is a cheap handle (one pointer) around a heap-allocated `Inner`; the
//! handle can be cloned freely -- exactly like assigning a second Java
//! reference to the same object -- and `retain`/`release` are the only
//! operations that change how many such handles are considered "live".
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::arena::Arena;
use crate::error::{BufError, Result};
use crate::handle::Handle;
use crate::refcount::RefCount;

pub(crate) enum Storage {
    Pooled {
        arena: &'static Arena,
        chunk_id: usize,
        handle: Handle,
        base_ptr: *mut u8,
        base_offset: usize,
        max_length: usize,
    },
    /// Owns its bytes outright: a true unpooled buffer, or a huge
    /// one-shot allocation served by the pooled factory (the huge
    /// path never joins the chunk list, so it behaves identically to an
    /// unpooled buffer from here on).
    Owned {
        ptr: *mut u8,
        cap: usize,
    },
}

struct MutableState {
    reader_index: usize,
    writer_index: usize,
    capacity: usize,
    max_capacity: usize,
}

struct Inner {
    refcount: RefCount,
    /// Counts live `Buffer` handles (Rust-level clones) aliasing this
    /// `Inner`, distinct from `refcount`'s logical/application-level
    /// count. `release` driving `refcount` to zero disposes the
    /// backing storage; `handles` driving to zero is what frees
    /// `Inner` itself, once every alias has been dropped. Without this
    /// split, the handle that happened to run the storage-disposing
    /// `release` would free `Inner` out from under every other clone
    /// still holding the same pointer.
    handles: AtomicUsize,
    state: UnsafeCell<MutableState>,
    storage: UnsafeCell<Storage>,
}

/// A byte buffer. Not internally synchronized: concurrent reads/writes
/// on the same `Buffer` from different threads require external
/// locking, which is why this type is deliberately not `Sync`.
pub struct Buffer {
    inner: NonNull<Inner>,
}

unsafe impl Send for Buffer {}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        self.inner().handles.fetch_add(1, Ordering::Relaxed);
        Buffer { inner: self.inner }
    }
}

impl Drop for Buffer {
    /// Frees `Inner` once the last aliasing handle drops. Never
    /// touches `storage` here -- that's `release`'s job, triggered by
    /// the *logical* refcount, not by how many `Buffer` values happen
    /// to exist in Rust. A `Buffer` dropped without a matching
    /// `release` simply leaks its backing storage, same as the
    /// allocator's own "no automatic Drop-triggered release" rule.
    fn drop(&mut self) {
        if self.inner().handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            unsafe { drop(Box::from_raw(self.inner.as_ptr())) };
        }
    }
}

impl Buffer {
    pub(crate) fn new_pooled(
        arena: &'static Arena,
        chunk_id: usize,
        handle: Handle,
        base_ptr: *mut u8,
        base_offset: usize,
        max_length: usize,
        capacity: usize,
        max_capacity: usize,
    ) -> Self {
        let inner = Box::new(Inner {
            refcount: RefCount::new(),
            handles: AtomicUsize::new(1),
            state: UnsafeCell::new(MutableState {
                reader_index: 0,
                writer_index: 0,
                capacity,
                max_capacity,
            }),
            storage: UnsafeCell::new(Storage::Pooled {
                arena,
                chunk_id,
                handle,
                base_ptr,
                base_offset,
                max_length,
            }),
        });

        Buffer {
            inner: NonNull::new(Box::into_raw(inner)).unwrap(),
        }
    }

    pub(crate) fn new_owned(data: Vec<u8>, capacity: usize, max_capacity: usize) -> Self {
        let mut data = data;
        let ptr = data.as_mut_ptr();
        let cap = data.capacity();
        std::mem::forget(data);

        let inner = Box::new(Inner {
            refcount: RefCount::new(),
            handles: AtomicUsize::new(1),
            state: UnsafeCell::new(MutableState {
                reader_index: 0,
                writer_index: 0,
                capacity,
                max_capacity,
            }),
            storage: UnsafeCell::new(Storage::Owned { ptr, cap }),
        });

        Buffer {
            inner: NonNull::new(Box::into_raw(inner)).unwrap(),
        }
    }

    fn inner(&self) -> &Inner {
        unsafe { self.inner.as_ref() }
    }

    #[allow(clippy::mut_from_ref)]
    fn state_mut(&self) -> &mut MutableState {
        unsafe { &mut *self.inner().state.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn storage_mut(&self) -> &mut Storage {
        unsafe { &mut *self.inner().storage.get() }
    }

    /// Every operation that touches indices, capacity, or bytes must
    /// go through this first: a refcount of zero means `release` has
    /// already disposed the backing storage, so reading `storage`
    /// beyond this point would be a use-after-free.
    fn check_live(&self) -> Result<()> {
        if self.inner().refcount.get() == 0 {
            return Err(BufError::access("operation on a disposed buffer"));
        }
        Ok(())
    }

    /// Bytes currently backing this buffer, bounded by `capacity` (not
    /// the underlying allocation's `max_length`/`cap`).
    fn region(&self) -> (*mut u8, usize) {
        match self.storage_mut() {
            Storage::Pooled { base_ptr, base_offset, .. } => {
                (unsafe { base_ptr.add(*base_offset) }, self.capacity())
            }
            Storage::Owned { ptr, .. } => (*ptr, self.capacity()),
        }
    }

    // --- capacity / indices --------------------------------------------------

    pub fn capacity(&self) -> usize {
        self.state_mut().capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.state_mut().max_capacity
    }

    pub fn reader_index(&self) -> usize {
        self.state_mut().reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.state_mut().writer_index
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index() - self.reader_index()
    }

    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.writer_index()
    }

    pub fn set_index(&self, reader_index: usize, writer_index: usize) -> Result<()> {
        self.check_live()?;
        if reader_index > writer_index || writer_index > self.capacity() {
            return Err(BufError::invalid(
                "reader_index <= writer_index <= capacity must hold",
            ));
        }
        let st = self.state_mut();
        st.reader_index = reader_index;
        st.writer_index = writer_index;
        Ok(())
    }

    pub fn set_reader_index(&self, idx: usize) -> Result<()> {
        self.set_index(idx, self.writer_index())
    }

    pub fn set_writer_index(&self, idx: usize) -> Result<()> {
        self.set_index(self.reader_index(), idx)
    }

    /// Grows or shrinks the buffer. Pooled buffers shrink in place when
    /// possible and otherwise reallocate through the arena; owned
    /// buffers (true-unpooled, and huge one-shot) grow by doubling,
    /// capped at `max_capacity`.
    pub fn set_capacity(&self, new_capacity: usize) -> Result<()> {
        self.check_live()?;
        if new_capacity > self.max_capacity() {
            return Err(BufError::invalid("capacity may not exceed max_capacity"));
        }

        let is_owned = matches!(self.storage_mut(), Storage::Owned { .. });

        if is_owned {
            return self.set_capacity_owned(new_capacity);
        }
        self.set_capacity_pooled(new_capacity)
    }

    fn set_capacity_owned(&self, new_capacity: usize) -> Result<()> {
        let old_capacity = self.capacity();
        if new_capacity <= old_capacity {
            // Shrinking an owned buffer is a no-op: the allocation is
            // simply addressed with a smaller visible capacity.
            self.state_mut().capacity = new_capacity;
            self.truncate_indices_to(new_capacity);
            return Ok(());
        }

        let grown = old_capacity.max(1).saturating_mul(2).max(new_capacity).min(self.max_capacity());

        let (ptr, cap) = match self.storage_mut() {
            Storage::Owned { ptr, cap } => (*ptr, *cap),
            Storage::Pooled { .. } => unreachable!(),
        };

        let mut v = unsafe { Vec::from_raw_parts(ptr, old_capacity, cap) };
        v.resize(grown, 0);
        let new_ptr = v.as_mut_ptr();
        let new_cap = v.capacity();
        std::mem::forget(v);

        *self.storage_mut() = Storage::Owned { ptr: new_ptr, cap: new_cap };
        self.state_mut().capacity = grown;
        Ok(())
    }

    fn set_capacity_pooled(&self, new_capacity: usize) -> Result<()> {
        let old_capacity = self.capacity();

        let max_length = match self.storage_mut() {
            Storage::Pooled { max_length, .. } => *max_length,
            Storage::Owned { .. } => unreachable!(),
        };

        if new_capacity > old_capacity && new_capacity <= max_length {
            // Growing within the region already bound to this handle:
            // no reallocation needed.
            self.state_mut().capacity = new_capacity;
            return Ok(());
        }

        if new_capacity < old_capacity {
            // Shrinking: keep the oversized region in place as long as
            // we aren't giving back more than about half of it (and,
            // for small regions, not within 16 bytes of the floor) --
            // otherwise a full reallocate right-sizes the backing
            // region instead of holding onto wasted space forever.
            let keeps_more_than_half = new_capacity > max_length / 2;
            let region_is_reasonable =
                max_length > 512 || new_capacity > max_length.saturating_sub(16);
            if keeps_more_than_half && region_is_reasonable {
                self.state_mut().capacity = new_capacity;
                self.truncate_indices_to(new_capacity);
                return Ok(());
            }
        }

        if new_capacity == old_capacity {
            return Ok(());
        }

        let (arena, chunk_id, handle, base_offset) = match self.storage_mut() {
            Storage::Pooled { arena, chunk_id, handle, base_offset, .. } => {
                (*arena, *chunk_id, *handle, *base_offset)
            }
            Storage::Owned { .. } => unreachable!(),
        };

        let (alloc, snapshot) =
            arena.reallocate(chunk_id, handle, base_offset, old_capacity, new_capacity)?;

        let new_base_ptr = arena.chunk_base_ptr(alloc.chunk_id);

        *self.storage_mut() = Storage::Pooled {
            arena,
            chunk_id: alloc.chunk_id,
            handle: alloc.handle,
            base_ptr: new_base_ptr,
            base_offset: alloc.base_offset,
            max_length: alloc.max_length,
        };
        self.state_mut().capacity = new_capacity;
        self.truncate_indices_to(new_capacity);

        let dst = unsafe { std::slice::from_raw_parts_mut(new_base_ptr.add(alloc.base_offset), snapshot.len()) };
        dst.copy_from_slice(&snapshot);

        Ok(())
    }

    fn truncate_indices_to(&self, capacity: usize) {
        let st = self.state_mut();
        st.writer_index = st.writer_index.min(capacity);
        st.reader_index = st.reader_index.min(st.writer_index);
    }

    // --- byte access -----------------------------------------------------

    pub fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<()> {
        self.check_live()?;
        let (base, cap) = self.region();
        if index.checked_add(dst.len()).map_or(true, |end| end > cap) {
            return Err(BufError::access("get_bytes out of bounds"));
        }
        let src = unsafe { std::slice::from_raw_parts(base.add(index), dst.len()) };
        dst.copy_from_slice(src);
        Ok(())
    }

    pub fn set_bytes(&self, index: usize, src: &[u8]) -> Result<()> {
        self.check_live()?;
        let (base, cap) = self.region();
        if index.checked_add(src.len()).map_or(true, |end| end > cap) {
            return Err(BufError::access("set_bytes out of bounds"));
        }
        let dst = unsafe { std::slice::from_raw_parts_mut(base.add(index), src.len()) };
        dst.copy_from_slice(src);
        Ok(())
    }

    pub fn read_bytes(&self, dst: &mut [u8]) -> Result<()> {
        let idx = self.reader_index();
        if idx + dst.len() > self.writer_index() {
            return Err(BufError::access("read past writer_index"));
        }
        self.get_bytes(idx, dst)?;
        self.state_mut().reader_index += dst.len();
        Ok(())
    }

    /// Writes `src`, growing the buffer (within `max_capacity`) if it
    /// doesn't currently fit.
    pub fn write_bytes(&self, src: &[u8]) -> Result<()> {
        let idx = self.writer_index();
        let needed = idx
            .checked_add(src.len())
            .ok_or_else(|| BufError::access("write_bytes length overflow"))?;
        if needed > self.capacity() {
            self.set_capacity(needed)?;
        }
        self.set_bytes(idx, src)?;
        self.state_mut().writer_index += src.len();
        Ok(())
    }

    // --- reference counting ------------------------------------------------

    pub fn ref_count(&self) -> u32 {
        self.inner().refcount.get()
    }

    pub fn retain(&self, n: u32) -> Result<()> {
        self.inner().refcount.retain(n)
    }

    pub fn release(&self, n: u32) -> Result<()> {
        if self.inner().refcount.release(n)? {
            unsafe { self.dispose_storage() };
        }
        Ok(())
    }

    /// Forcibly drives the reference count to zero and disposes the
    /// buffer's backing storage, whatever the current count is. Fails
    /// if the buffer is already disposed.
    pub fn dispose(&self) -> Result<()> {
        let current = self.inner().refcount.get();
        if current == 0 {
            return Err(BufError::access("operation on a disposed buffer"));
        }
        self.release(current)
    }

    /// Disposes the underlying storage. Must be called at most once,
    /// exactly when `release` reports the count reached zero. Leaves
    /// `Inner` itself alive -- it's freed separately, by `Drop`, once
    /// every `Buffer` handle aliasing it has gone away -- so this must
    /// never reach for `Box::from_raw` on `self.inner`.
    unsafe fn dispose_storage(&self) {
        let placeholder = Storage::Owned { ptr: std::ptr::null_mut(), cap: 0 };
        let old = unsafe { std::ptr::replace(self.inner().storage.get(), placeholder) };
        match old {
            Storage::Pooled { arena, chunk_id, handle, .. } => {
                arena.free(chunk_id, handle);
            }
            Storage::Owned { ptr, cap } => {
                drop(unsafe { Vec::from_raw_parts(ptr, cap, cap) });
            }
        }
    }
}

impl PartialEq for Buffer {
    /// Compares readable bytes only, word-sized (8 bytes) at a time
    /// with a trailing byte-wise tail for what doesn't divide evenly.
    fn eq(&self, other: &Self) -> bool {
        let a_len = self.readable_bytes();
        if a_len != other.readable_bytes() {
            return false;
        }

        let mut a = vec![0u8; a_len];
        let mut b = vec![0u8; a_len];
        if self.get_bytes(self.reader_index(), &mut a).is_err() {
            return false;
        }
        if other.get_bytes(other.reader_index(), &mut b).is_err() {
            return false;
        }

        let chunks = a_len / 8;
        for i in 0..chunks {
            let ai = u64::from_ne_bytes(a[i * 8..i * 8 + 8].try_into().unwrap());
            let bi = u64::from_ne_bytes(b[i * 8..i * 8 + 8].try_into().unwrap());
            if ai != bi {
                return false;
            }
        }
        a[chunks * 8..] == b[chunks * 8..]
    }
}

impl Eq for Buffer {}

impl std::hash::Hash for Buffer {
    /// Folds readable bytes 4 at a time with the classic `31*h + word`
    /// recurrence, matching `eq`'s readable-bytes scope.
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        let len = self.readable_bytes();
        let mut buf = vec![0u8; len];
        let _ = self.get_bytes(self.reader_index(), &mut buf);

        let mut h: i32 = 1;
        let chunks = len / 4;
        for i in 0..chunks {
            let word = i32::from_be_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
            h = h.wrapping_mul(31).wrapping_add(word);
        }
        for &b in &buf[chunks * 4..] {
            h = h.wrapping_mul(31).wrapping_add(b as i32);
        }
        state.write_i32(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(capacity: usize, max_capacity: usize) -> Buffer {
        Buffer::new_owned(vec![0u8; capacity], capacity, max_capacity)
    }

    fn leaked_arena() -> &'static crate::arena::Arena {
        Box::leak(Box::new(crate::arena::Arena::new(crate::config::PoolConfig {
            page_size: 4096,
            max_order: 11,
            arena_count: 1,
        })))
    }

    fn pooled(arena: &'static crate::arena::Arena, req_capacity: usize, max_capacity: usize) -> Buffer {
        let alloc = arena.allocate(req_capacity).unwrap();
        let base_ptr = arena.chunk_base_ptr(alloc.chunk_id);
        Buffer::new_pooled(
            arena,
            alloc.chunk_id,
            alloc.handle,
            base_ptr,
            alloc.base_offset,
            alloc.max_length,
            alloc.capacity,
            max_capacity,
        )
    }

    #[test]
    fn write_then_read_roundtrips() {
        let b = owned(16, 64);
        b.write_bytes(b"hello").unwrap();
        assert_eq!(b.writer_index(), 5);

        let mut dst = [0u8; 5];
        b.read_bytes(&mut dst).unwrap();
        assert_eq!(&dst, b"hello");
        assert_eq!(b.reader_index(), 5);
    }

    #[test]
    fn write_beyond_capacity_grows() {
        let b = owned(4, 64);
        b.write_bytes(b"0123456789").unwrap();
        assert!(b.capacity() >= 10);
    }

    #[test]
    fn write_beyond_max_capacity_fails() {
        let b = owned(4, 4);
        assert!(b.write_bytes(b"too long").is_err());
    }

    #[test]
    fn set_index_validates_ordering() {
        let b = owned(16, 16);
        assert!(b.set_index(4, 2).is_err());
        assert!(b.set_index(2, 4).is_ok());
    }

    #[test]
    fn retain_release_disposes_exactly_once() {
        let b = owned(8, 8);
        b.retain(1).unwrap();
        assert_eq!(b.ref_count(), 2);
        b.release(1).unwrap();
        b.release(1).unwrap();
        assert!(b.release(1).is_err());
    }

    #[test]
    fn disposed_buffer_rejects_further_access() {
        let b = owned(8, 8);
        b.release(1).unwrap();

        assert!(b.get_bytes(0, &mut [0u8; 1]).is_err());
        assert!(b.set_bytes(0, &[1u8]).is_err());
        assert!(b.set_index(0, 0).is_err());
        assert!(b.set_capacity(4).is_err());
        assert!(b.get_char(0).is_err());
    }

    #[test]
    fn dispose_forces_refcount_to_zero_and_is_idempotent_error() {
        let b = owned(8, 8);
        b.retain(2).unwrap();
        assert_eq!(b.ref_count(), 3);

        b.dispose().unwrap();
        assert_eq!(b.ref_count(), 0);
        assert!(b.dispose().is_err());
        assert!(b.get_bytes(0, &mut [0u8; 1]).is_err());
    }

    #[test]
    fn cloned_handle_survives_sibling_drop_and_release_frees_storage_once() {
        let b = owned(8, 8);
        let clone = b.clone();
        drop(clone);

        // Dropping the clone must not have freed `Inner`: `b` is still a
        // perfectly live handle sharing the same logical refcount.
        assert_eq!(b.ref_count(), 1);
        b.write_bytes(b"ok").unwrap();
        b.release(1).unwrap();
        assert!(b.release(1).is_err());
    }

    #[test]
    fn equality_compares_readable_bytes_only() {
        let a = owned(16, 16);
        a.write_bytes(b"abcdef").unwrap();
        let b = owned(16, 16);
        b.write_bytes(b"abcdef").unwrap();
        assert_eq!(a, b);

        a.set_reader_index(1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn pooled_grow_within_max_length_does_not_reallocate() {
        let arena = leaked_arena();
        // req=5000 normalizes to 8192: capacity starts at 5000, max_length
        // at 8192, so growing to 8000 should fit in the same region.
        let b = pooled(arena, 5000, 20_000);
        assert_eq!(b.capacity(), 5000);

        let (chunk_id_before, offset_before) = match b.storage_mut() {
            Storage::Pooled { chunk_id, base_offset, .. } => (*chunk_id, *base_offset),
            Storage::Owned { .. } => unreachable!(),
        };

        b.set_capacity(8000).unwrap();
        assert_eq!(b.capacity(), 8000);

        let (chunk_id_after, offset_after) = match b.storage_mut() {
            Storage::Pooled { chunk_id, base_offset, .. } => (*chunk_id, *base_offset),
            Storage::Owned { .. } => unreachable!(),
        };
        assert_eq!((chunk_id_before, offset_before), (chunk_id_after, offset_after));
    }

    #[test]
    fn pooled_small_shrink_keeps_region_in_place() {
        let arena = leaked_arena();
        let b = pooled(arena, 5000, 20_000);
        b.set_writer_index(5000).unwrap();

        let (chunk_id_before, offset_before) = match b.storage_mut() {
            Storage::Pooled { chunk_id, base_offset, .. } => (*chunk_id, *base_offset),
            Storage::Owned { .. } => unreachable!(),
        };

        // 4100 > max_length(8192)/2, so this stays in place per the
        // shrink policy.
        b.set_capacity(4100).unwrap();
        assert_eq!(b.capacity(), 4100);
        assert_eq!(b.writer_index(), 4100, "writer index clamps to the new capacity");

        let (chunk_id_after, offset_after) = match b.storage_mut() {
            Storage::Pooled { chunk_id, base_offset, .. } => (*chunk_id, *base_offset),
            Storage::Owned { .. } => unreachable!(),
        };
        assert_eq!((chunk_id_before, offset_before), (chunk_id_after, offset_after));
    }

    #[test]
    fn pooled_large_shrink_reallocates_and_preserves_bytes() {
        let arena = leaked_arena();
        let b = pooled(arena, 5000, 20_000);
        b.set_bytes(0, b"hello, arena").unwrap();
        b.set_writer_index(5000).unwrap();

        // 1000 <= max_length(8192)/2, so the shrink policy forces a
        // full reallocate instead of keeping the oversized region.
        b.set_capacity(1000).unwrap();
        assert_eq!(b.capacity(), 1000);
        assert_eq!(b.writer_index(), 1000);

        let mut out = [0u8; 12];
        b.get_bytes(0, &mut out).unwrap();
        assert_eq!(&out, b"hello, arena");
    }

    #[test]
    fn pooled_set_capacity_to_same_value_is_noop() {
        let arena = leaked_arena();
        let b = pooled(arena, 5000, 20_000);
        b.set_capacity(5000).unwrap();
        assert_eq!(b.capacity(), 5000);
    }
}
