//! A `Chunk` is a buddy allocator over `2^max_order` pages, stored as a
//! complete binary tree flattened into two parallel arrays
//! (`depth_map`/`memory_map`).
#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
use contracts::*;
#[cfg(not(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts")))]
use disabled_contracts::*;

use crate::subpage::Subpage;

pub struct Chunk {
    buffer: Vec<u8>,
    depth_map: Vec<u8>,
    memory_map: Vec<u8>,
    subpages: Vec<Option<Subpage>>,
    free_bytes: usize,
    page_size: usize,
    max_order: u32,
    page_shifts: u32,
    chunk_size: usize,
    unusable: u8,
}

impl Chunk {
    pub fn new(page_size: usize, max_order: u32) -> Self {
        let chunk_size = page_size << max_order;
        let tree_size = 1usize << (max_order + 1);
        let unusable = (max_order + 1) as u8;

        let mut depth_map = vec![0u8; tree_size];
        let mut d = 0u8;
        let mut first = 1usize;
        while first < tree_size {
            let last = (first << 1).min(tree_size);
            for slot in depth_map.iter_mut().take(last).skip(first) {
                *slot = d;
            }
            first <<= 1;
            d += 1;
        }

        Chunk {
            buffer: vec![0u8; chunk_size],
            memory_map: depth_map.clone(),
            depth_map,
            subpages: (0..(1usize << max_order)).map(|_| None).collect(),
            free_bytes: chunk_size,
            page_size,
            max_order,
            page_shifts: page_size.trailing_zeros(),
            chunk_size,
            unusable,
        }
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Returns the byte offset at which a run owned by node `id` begins.
    pub fn run_offset(&self, id: usize) -> usize {
        let d = self.depth_map[id];
        (id ^ (1usize << d)) * self.run_length(id)
    }

    /// Returns the number of bytes a node at `id`'s depth owns.
    pub fn run_length(&self, id: usize) -> usize {
        1usize << (self.log2_chunk_size() - self.depth_map[id] as u32)
    }

    fn log2_chunk_size(&self) -> u32 {
        self.chunk_size.trailing_zeros()
    }

    fn page_idx(&self, leaf_id: usize) -> usize {
        leaf_id ^ (1usize << self.max_order)
    }

    /// Whether this chunk can satisfy an allocation at depth `d`.
    pub fn can_allocate(&self, d: u8) -> bool {
        self.memory_map[1] <= d
    }

    /// Allocates a run (normal-size, non-subpage) at the depth matching
    /// `norm_capacity`. Returns the buddy-tree node index.
    #[ensures(ret.is_some() -> self.memory_map[ret.unwrap()] == self.unusable)]
    pub fn allocate_run(&mut self, norm_capacity: usize) -> Option<usize> {
        let d = self.max_order as i64
            - (norm_capacity.trailing_zeros() as i64 - self.page_shifts as i64);
        if d < 0 {
            return None;
        }

        self.allocate_node(d as u8)
    }

    /// Allocates one leaf (a full page) to back a fresh `Subpage` of
    /// `elem_size`. Returns the leaf's tree index.
    pub fn allocate_page_for_subpage(&mut self, elem_size: usize) -> Option<u32> {
        let id = self.allocate_node(self.max_order as u8)?;
        let page_idx = self.page_idx(id);
        self.subpages[page_idx] = Some(Subpage::new(elem_size, self.page_size, id as u32));
        Some(id as u32)
    }

    pub fn subpage_at(&self, leaf_idx: u32) -> Option<&Subpage> {
        self.subpages[self.page_idx(leaf_idx as usize)].as_ref()
    }

    pub fn subpage_at_mut(&mut self, leaf_idx: u32) -> Option<&mut Subpage> {
        self.subpages[self.page_idx(leaf_idx as usize)].as_mut()
    }

    /// Releases one element of the subpage bound to `leaf_idx`. Returns
    /// `true` if the subpage (and thus the leaf) is still in use.
    pub fn free_subpage_slot(&mut self, leaf_idx: u32, bit_idx: u32, only_subpage_in_pool: bool) -> bool {
        let page_idx = self.page_idx(leaf_idx as usize);
        let alive = self.subpages[page_idx]
            .as_mut()
            .expect("subpage must exist for an active handle")
            .free(bit_idx, only_subpage_in_pool);

        if !alive {
            self.subpages[page_idx] = None;
            self.free_node(leaf_idx as usize);
        }

        alive
    }

    /// Releases a whole buddy node (a normal-size allocation).
    pub fn free_run(&mut self, memory_map_idx: usize) {
        self.free_node(memory_map_idx);
    }

    fn allocate_node(&mut self, d: u8) -> Option<usize> {
        if !self.can_allocate(d) {
            return None;
        }

        let mut id = 1usize;
        for _ in 0..d {
            id <<= 1;
            if self.memory_map[id] > d {
                id ^= 1;
            }
        }

        debug_assert_eq!(self.memory_map[id], d);
        self.memory_map[id] = self.unusable;
        self.update_parents_alloc(id);
        self.free_bytes -= self.run_length(id);
        Some(id)
    }

    fn free_node(&mut self, id: usize) {
        self.free_bytes += self.run_length(id);
        self.memory_map[id] = self.depth_map[id];
        self.update_parents_free(id);
    }

    fn update_parents_alloc(&mut self, mut id: usize) {
        while id > 1 {
            let parent = id >> 1;
            let left = self.memory_map[parent << 1];
            let right = self.memory_map[(parent << 1) + 1];
            self.memory_map[parent] = left.min(right);
            id = parent;
        }
    }

    fn update_parents_free(&mut self, mut id: usize) {
        while id > 1 {
            let parent = id >> 1;
            let left_idx = parent << 1;
            let right_idx = left_idx + 1;
            let left = self.memory_map[left_idx];
            let right = self.memory_map[right_idx];

            if left == self.depth_map[left_idx] && right == self.depth_map[right_idx] {
                self.memory_map[parent] = self.depth_map[parent];
            } else {
                self.memory_map[parent] = left.min(right);
            }
            id = parent;
        }
    }

    /// Checks the buddy-tree invariants against live state: every
    /// `memory_map` entry stays within `[depth_map[i], unusable]`.
    /// Callable unconditionally (unlike the `#[requires]`/`#[ensures]`
    /// contract annotations elsewhere in this module, which compile to
    /// no-ops unless a `check_contracts*` feature is enabled), since
    /// property tests want to assert it after every op regardless of
    /// which features are active.
    pub fn check_rep(&self) -> Result<(), &'static str> {
        for i in 1..self.memory_map.len() {
            if self.memory_map[i] < self.depth_map[i] {
                return Err("memory_map below depth_map");
            }
            if self.memory_map[i] > self.unusable {
                return Err("memory_map above unusable sentinel");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn small_chunk() -> Chunk {
        // page_size=4096, max_order=3 => chunk_size = 32KiB, 8 pages.
        Chunk::new(4096, 3)
    }

    #[test]
    fn whole_chunk_allocates_then_marks_root_unusable() {
        let mut c = small_chunk();
        let id = c.allocate_run(c.chunk_size()).expect("should allocate whole chunk");
        assert_eq!(id, 1);
        assert_eq!(c.memory_map[1], c.unusable);
        assert_eq!(c.free_bytes(), 0);
    }

    #[test]
    fn buddy_reuse_after_free() {
        let mut c = small_chunk();
        let a = c.allocate_run(4096).expect("alloc A");
        let offset_a = c.run_offset(a);
        c.free_run(a);

        let b = c.allocate_run(4096).expect("alloc B");
        let offset_b = c.run_offset(b);
        assert_eq!(offset_a, offset_b);
    }

    #[test]
    fn two_pages_do_not_overlap() {
        let mut c = small_chunk();
        let a = c.allocate_run(4096).unwrap();
        let b = c.allocate_run(4096).unwrap();
        assert_ne!(c.run_offset(a), c.run_offset(b));
    }

    #[test]
    fn exhausting_chunk_returns_none() {
        let mut c = small_chunk();
        let mut allocated = Vec::new();
        for _ in 0..8 {
            allocated.push(c.allocate_run(4096).expect("should have room"));
        }
        assert!(c.allocate_run(4096).is_none());

        for id in allocated {
            c.free_run(id);
        }
        assert!(c.allocate_run(c.chunk_size()).is_some());
    }

    #[test]
    fn subpage_leaf_allocation_binds_one_page() {
        let mut c = small_chunk();
        let leaf = c.allocate_page_for_subpage(16).expect("should allocate leaf");
        assert!(c.subpage_at(leaf).is_some());

        let bit = c
            .subpage_at_mut(leaf)
            .unwrap()
            .allocate()
            .expect("subpage should allocate");
        assert!(!c.free_subpage_slot(leaf, bit, /*only_subpage_in_pool=*/ false));
        assert!(c.subpage_at(leaf).is_none(), "leaf should be reclaimed");
    }

    proptest! {
        /// For any order-5 chunk and any sequence of page-sized
        /// alloc/free ops, no two concurrently-live runs ever overlap
        /// and every offset stays within the chunk.
        #[test]
        fn page_runs_never_overlap(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
            let mut c = Chunk::new(4096, 5); // 32 pages
            let mut live: Vec<usize> = Vec::new();

            for alloc in ops {
                if alloc || live.is_empty() {
                    if let Some(id) = c.allocate_run(4096) {
                        let off = c.run_offset(id);
                        for &other in &live {
                            let other_off = c.run_offset(other);
                            prop_assert_ne!(off, other_off);
                        }
                        prop_assert!(off + 4096 <= c.chunk_size());
                        live.push(id);
                    }
                } else {
                    let id = live.pop().unwrap();
                    c.free_run(id);
                }
                prop_assert!(c.check_rep().is_ok());
            }
        }
    }
}
