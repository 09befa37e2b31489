//! A pooled byte-buffer allocator: a buddy tree over page-granularity
//! chunks for normal-size allocations, bitmap subpages for sub-page
//! ones, multiplexed by a round-robin `Factory` of arenas.
//!
//! The design mirrors Netty's `PooledByteBufAllocator`: tiny
//! (<512B, 16B-aligned), small (power-of-two, sub-page), normal
//! (power-of-two, page-or-larger, buddy-tree-managed) and huge
//! (one-shot, unpooled) size classes, each dispensed behind a single
//! `Buffer` contract shared with the fully unpooled allocator.

mod accessors;
mod arena;
mod buffer;
mod chunk;
mod config;
mod error;
mod factory;
mod handle;
mod refcount;
mod size_class;
mod stream;
mod subpage;
mod unpooled;

pub use buffer::Buffer;
pub use config::{PoolConfig, DEFAULT_MAX_ORDER, DEFAULT_PAGE_SIZE, MAX_CHUNK_SIZE};
pub use error::{BufError, Result};
pub use factory::Factory;
pub use handle::Handle;
pub use size_class::SizeClass;
pub use stream::BufferStream;
