//! `Factory`: the allocator's front door. Holds `arena_count` arenas
//! and dispenses buffers to callers round-robin, handing out long-lived
//! `'static` arena state via `Box::leak`.
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::arena::Arena;
use crate::buffer::Buffer;
use crate::config::PoolConfig;
use crate::error::{BufError, Result};
use crate::size_class::{self, SizeClass};
use crate::unpooled;

pub struct Factory {
    cfg: PoolConfig,
    arenas: Vec<&'static Arena>,
    next: AtomicUsize,
}

impl Factory {
    pub fn new(cfg: PoolConfig) -> Result<Self> {
        cfg.validate()?;

        let arenas = (0..cfg.arena_count)
            .map(|_| &*Box::leak(Box::new(Arena::new(cfg))))
            .collect();

        Ok(Factory {
            cfg,
            arenas,
            next: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.cfg
    }

    fn next_arena(&self) -> &'static Arena {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.arenas.len();
        self.arenas[i]
    }

    /// Allocates a buffer with `length` readable capacity (writer_index
    /// starts at 0: callers grow it by writing) and an upper bound of
    /// `max_capacity`.
    ///
    /// Huge requests (`length >= chunk_size`) never touch an arena: they
    /// get a one-shot, self-owned allocation, the same as the fully
    /// unpooled allocator's huge-size pass-through.
    pub fn new_buffer(&self, length: usize, max_capacity: usize) -> Result<Buffer> {
        if length > max_capacity {
            return Err(BufError::invalid("length may not exceed max_capacity"));
        }

        let (_, class) = size_class::classify(length, &self.cfg)?;

        if class == SizeClass::Huge {
            log::debug!("factory: serving huge one-shot allocation of {} bytes", length);
            return unpooled::new(length, max_capacity);
        }

        let arena = self.next_arena();
        let alloc = arena.allocate(length)?;
        let base_ptr = arena.chunk_base_ptr(alloc.chunk_id);

        Ok(Buffer::new_pooled(
            arena,
            alloc.chunk_id,
            alloc.handle,
            base_ptr,
            alloc.base_offset,
            alloc.max_length,
            alloc.capacity,
            max_capacity,
        ))
    }

    /// Allocates a buffer that never touches an arena at all, even for
    /// small requests, exactly like the fully unpooled allocator.
    pub fn new_unpooled_buffer(&self, length: usize, max_capacity: usize) -> Result<Buffer> {
        unpooled::new(length, max_capacity)
    }
}
