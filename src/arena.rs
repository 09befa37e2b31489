//! An `Arena` multiplexes between subpage pools (indexed by size class)
//! and a list of pooled chunks; it's the entry point for `allocate`,
//! `free`, and `reallocate`.
#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
use contracts::*;
#[cfg(not(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts")))]
use disabled_contracts::*;

use std::sync::Mutex;

use crate::chunk::Chunk;
use crate::config::PoolConfig;
use crate::error::{BufError, Result};
use crate::handle::Handle;
use crate::size_class::{self, SizeClass};
use crate::subpage::SubpageId;

/// Which per-size-class pool a subpage belongs to. Mirrors
/// `SizeClass`'s tiny/small variants (normal/huge allocations never
/// join a subpage pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolClass {
    Tiny(usize),
    Small(usize),
}

/// What an `Arena::allocate` call binds a fresh buffer to.
pub struct AllocResult {
    pub chunk_id: usize,
    pub handle: Handle,
    pub base_offset: usize,
    pub capacity: usize,
    pub max_length: usize,
}

struct ArenaState {
    chunks: Vec<Chunk>,
    tiny_pools: Vec<Option<SubpageId>>,
    small_pools: Vec<Option<SubpageId>>,
}

pub struct Arena {
    cfg: PoolConfig,
    state: Mutex<ArenaState>,
}

impl Arena {
    pub fn new(cfg: PoolConfig) -> Self {
        let small_classes = size_class::small_size_classes(&cfg);

        Arena {
            cfg,
            state: Mutex::new(ArenaState {
                chunks: Vec::new(),
                tiny_pools: vec![None; size_class::TINY_SIZE_CLASSES],
                small_pools: vec![None; small_classes],
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.cfg
    }

    /// Returns a raw, stable pointer to chunk `chunk_id`'s backing
    /// bytes. Valid for the arena's entire lifetime: chunks are never
    /// reaped or moved once created, and
    /// growing `chunks` only relocates the `Chunk` descriptors, never
    /// the heap buffers they point to.
    pub fn chunk_base_ptr(&self, chunk_id: usize) -> *mut u8 {
        let mut guard = self.state.lock().unwrap();
        guard.chunks[chunk_id].buffer_mut().as_mut_ptr()
    }

    /// Normalizes `req_capacity` and dispatches to the tiny/small
    /// subpage path, the huge one-shot path, or the normal buddy path.
    ///
    /// The huge path never touches the arena's pooled-chunk list; the
    /// caller (the factory) is expected to treat its result as
    /// self-owned storage, exactly like an unpooled buffer.
    pub fn allocate(&'static self, req_capacity: usize) -> Result<AllocResult> {
        let (norm, class) = size_class::classify(req_capacity, &self.cfg)?;

        match class {
            SizeClass::Tiny(idx) => self.allocate_subpage(req_capacity, norm, PoolClass::Tiny(idx)),
            SizeClass::Small(idx) => {
                self.allocate_subpage(req_capacity, norm, PoolClass::Small(idx))
            }
            SizeClass::Huge => Err(BufError::invalid(
                "huge allocations are served as owned storage, not through Arena::allocate",
            )),
            SizeClass::Normal => self.allocate_normal(req_capacity, norm),
        }
    }

    fn allocate_subpage(
        &'static self,
        req_capacity: usize,
        norm: usize,
        class: PoolClass,
    ) -> Result<AllocResult> {
        let mut guard = self.state.lock().unwrap();

        if let Some(head) = Self::pool_head(&guard, class) {
            let elem_size = Self::subpage_mut(&mut guard, head).elem_size();
            let bit = Self::subpage_mut(&mut guard, head).allocate();

            if let Some(bit) = bit {
                let still_has_room = Self::subpage_mut(&mut guard, head).num_avail() > 0;
                if !still_has_room {
                    Self::unlink(&mut guard, class, head);
                }

                let handle = Handle::subpage(bit, head.leaf_idx);
                let base_offset = guard.chunks[head.chunk_id].run_offset(head.leaf_idx as usize)
                    + (bit as usize) * elem_size;

                return Ok(AllocResult {
                    chunk_id: head.chunk_id,
                    handle,
                    base_offset,
                    capacity: req_capacity,
                    max_length: elem_size,
                });
            }
        }

        // No pool head had room: carve a fresh leaf out of an existing
        // chunk, or out of a brand new one.
        let elem_size = norm;
        let (chunk_id, leaf_idx) = Self::find_or_create_chunk_for_leaf(&mut guard, &self.cfg, elem_size)?;

        let id = SubpageId { chunk_id, leaf_idx };
        Self::link_push_front(&mut guard, class, id);

        let bit = Self::subpage_mut(&mut guard, id)
            .allocate()
            .expect("freshly created subpage must have room");

        if Self::subpage_mut(&mut guard, id).num_avail() == 0 {
            Self::unlink(&mut guard, class, id);
        }

        let handle = Handle::subpage(bit, leaf_idx);
        let base_offset =
            guard.chunks[chunk_id].run_offset(leaf_idx as usize) + (bit as usize) * elem_size;

        Ok(AllocResult {
            chunk_id,
            handle,
            base_offset,
            capacity: req_capacity,
            max_length: elem_size,
        })
    }

    fn find_or_create_chunk_for_leaf(
        guard: &mut ArenaState,
        cfg: &PoolConfig,
        elem_size: usize,
    ) -> Result<(usize, u32)> {
        for (chunk_id, chunk) in guard.chunks.iter_mut().enumerate() {
            if let Some(leaf) = chunk.allocate_page_for_subpage(elem_size) {
                return Ok((chunk_id, leaf));
            }
        }

        let mut chunk = Chunk::new(cfg.page_size, cfg.max_order);
        let leaf = chunk
            .allocate_page_for_subpage(elem_size)
            .expect("a fresh chunk always has room for one leaf");
        let chunk_id = guard.chunks.len();
        log::debug!("arena: created pooled chunk #{} ({} bytes)", chunk_id, chunk.chunk_size());
        guard.chunks.push(chunk);
        Ok((chunk_id, leaf))
    }

    fn allocate_normal(&'static self, req_capacity: usize, norm: usize) -> Result<AllocResult> {
        let mut guard = self.state.lock().unwrap();

        for (chunk_id, chunk) in guard.chunks.iter_mut().enumerate() {
            if let Some(node) = chunk.allocate_run(norm) {
                let base_offset = chunk.run_offset(node);
                return Ok(AllocResult {
                    chunk_id,
                    handle: Handle::node(node as u32),
                    base_offset,
                    capacity: req_capacity,
                    max_length: norm,
                });
            }
        }

        let mut chunk = Chunk::new(self.cfg.page_size, self.cfg.max_order);
        let node = chunk
            .allocate_run(norm)
            .expect("a fresh chunk always satisfies a <= chunk_size request");
        let base_offset = chunk.run_offset(node);
        let chunk_id = guard.chunks.len();
        log::debug!("arena: created pooled chunk #{} ({} bytes)", chunk_id, chunk.chunk_size());
        guard.chunks.push(chunk);

        Ok(AllocResult {
            chunk_id,
            handle: Handle::node(node as u32),
            base_offset,
            capacity: req_capacity,
            max_length: norm,
        })
    }

    /// Returns the region to the arena. No-op for handles from an
    /// unpooled/huge allocation (those never reach this method — see
    /// `Storage::Owned`'s disposal path).
    pub fn free(&self, chunk_id: usize, handle: Handle) {
        let mut guard = self.state.lock().unwrap();

        if handle.is_subpage() {
            let id = SubpageId {
                chunk_id,
                leaf_idx: handle.memory_map_idx(),
            };
            let class = Self::class_for_elem_size(&guard, id, &self.cfg);
            let only_alone = Self::is_only_subpage_in_pool(&guard, class, id);

            // `free_subpage_slot` may drop the subpage (and null its
            // slot) as a side effect of this call, so grab its pool
            // neighbors now -- splicing it out afterward can't read
            // them off a subpage that no longer exists.
            let neighbors = {
                let sp = Self::subpage_mut(&mut guard, id);
                (sp.prev, sp.next)
            };

            let still_alive =
                guard.chunks[chunk_id].free_subpage_slot(id.leaf_idx, handle.bitmap_idx(), only_alone);

            if !still_alive {
                Self::splice_out(&mut guard, class, neighbors);
            } else {
                // A subpage that just gained room (freed from full) must
                // rejoin its pool if it isn't already linked there.
                let has_room = Self::subpage_mut(&mut guard, id).num_avail() > 0;
                if has_room && !Self::is_linked(&guard, class, id) {
                    Self::link_push_front(&mut guard, class, id);
                }
            }
        } else {
            guard.chunks[chunk_id].free_run(handle.memory_map_idx() as usize);
        }
    }

    /// Rebinds `old` to a fresh region sized `new_capacity`, block-
    /// copying `min(old_capacity, new_capacity)` bytes across. Copying
    /// the old capacity unconditionally would read past the end of a
    /// newly-shrunk region.
    pub fn reallocate(
        &'static self,
        old_chunk_id: usize,
        old_handle: Handle,
        old_base_offset: usize,
        old_capacity: usize,
        new_capacity: usize,
    ) -> Result<(AllocResult, Vec<u8>)> {
        let copy_len = old_capacity.min(new_capacity);
        let mut snapshot = vec![0u8; copy_len];
        {
            let mut guard = self.state.lock().unwrap();
            let src = guard.chunks[old_chunk_id].buffer_mut();
            snapshot.copy_from_slice(&src[old_base_offset..old_base_offset + copy_len]);
        }

        let new_alloc = self.allocate(new_capacity)?;
        self.free(old_chunk_id, old_handle);

        Ok((new_alloc, snapshot))
    }

    // --- pool-list bookkeeping -------------------------------------------------

    fn pool_head(guard: &ArenaState, class: PoolClass) -> Option<SubpageId> {
        match class {
            PoolClass::Tiny(i) => guard.tiny_pools[i],
            PoolClass::Small(i) => guard.small_pools[i],
        }
    }

    fn set_pool_head(guard: &mut ArenaState, class: PoolClass, id: Option<SubpageId>) {
        match class {
            PoolClass::Tiny(i) => guard.tiny_pools[i] = id,
            PoolClass::Small(i) => guard.small_pools[i] = id,
        }
    }

    fn subpage_mut(guard: &mut ArenaState, id: SubpageId) -> &mut crate::subpage::Subpage {
        guard.chunks[id.chunk_id]
            .subpage_at_mut(id.leaf_idx)
            .expect("subpage must exist for a live SubpageId")
    }

    fn link_push_front(guard: &mut ArenaState, class: PoolClass, id: SubpageId) {
        let old_head = Self::pool_head(guard, class);
        {
            let sp = Self::subpage_mut(guard, id);
            sp.prev = None;
            sp.next = old_head;
        }
        if let Some(old) = old_head {
            Self::subpage_mut(guard, old).prev = Some(id);
        }
        Self::set_pool_head(guard, class, Some(id));
    }

    fn unlink(guard: &mut ArenaState, class: PoolClass, id: SubpageId) {
        let (prev, next) = {
            let sp = Self::subpage_mut(guard, id);
            (sp.prev, sp.next)
        };
        Self::splice_out(guard, class, (prev, next));
    }

    /// Removes a node from `class`'s pool list given its already-known
    /// `(prev, next)` neighbors, without dereferencing the node itself.
    /// Lets a caller splice out a subpage whose slot in its chunk has
    /// already been torn down by the time the list needs updating.
    fn splice_out(guard: &mut ArenaState, class: PoolClass, (prev, next): (Option<SubpageId>, Option<SubpageId>)) {
        match prev {
            Some(p) => Self::subpage_mut(guard, p).next = next,
            None => Self::set_pool_head(guard, class, next),
        }
        if let Some(n) = next {
            Self::subpage_mut(guard, n).prev = prev;
        }
    }

    fn is_linked(guard: &ArenaState, class: PoolClass, id: SubpageId) -> bool {
        let mut cur = Self::pool_head(guard, class);
        while let Some(cur_id) = cur {
            if cur_id == id {
                return true;
            }
            cur = guard.chunks[cur_id.chunk_id]
                .subpage_at(cur_id.leaf_idx)
                .and_then(|sp| sp.next);
        }
        false
    }

    fn is_only_subpage_in_pool(guard: &ArenaState, class: PoolClass, id: SubpageId) -> bool {
        match Self::pool_head(guard, class) {
            Some(head) if head == id => {
                let sp = guard.chunks[id.chunk_id].subpage_at(id.leaf_idx).unwrap();
                sp.prev.is_none() && sp.next.is_none()
            }
            Some(_) => false,
            // Not linked (e.g. it was full and thus unlinked) -- it's
            // "alone" only if there is nothing else live in the pool.
            None => true,
        }
    }

    fn class_for_elem_size(guard: &ArenaState, id: SubpageId, cfg: &PoolConfig) -> PoolClass {
        let elem_size = guard.chunks[id.chunk_id]
            .subpage_at(id.leaf_idx)
            .expect("subpage must exist")
            .elem_size();

        if elem_size < size_class::TINY_THRESHOLD {
            PoolClass::Tiny(elem_size >> 4)
        } else {
            let idx = (elem_size.trailing_zeros() - size_class::TINY_THRESHOLD.trailing_zeros()) as usize;
            debug_assert!(idx < size_class::small_size_classes(cfg));
            PoolClass::Small(idx)
        }
    }

    #[cfg(test)]
    pub(crate) fn chunk_count(&self) -> usize {
        self.state.lock().unwrap().chunks.len()
    }
}
