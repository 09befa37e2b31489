//! Maps a requested capacity to a normalized size and, for tiny/small
//! requests, a size-class index used to index the arena's subpage pools.
use crate::config::PoolConfig;
use crate::error::{BufError, Result};

pub const TINY_THRESHOLD: usize = 512;
pub const TINY_SIZE_CLASSES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Tiny(usize),   // index into 0..TINY_SIZE_CLASSES
    Small(usize),  // index into 0..(page_shifts - 9)
    Normal,
    Huge,
}

/// Normalizes `req` (a validated non-negative request) into the size the
/// allocator will actually carve out, and classifies it.
///
/// `req` must already have been checked non-negative by the caller (the
/// public API takes `i64` so that negative inputs can be rejected with
/// `InvalidArgument` before we ever get here).
pub fn classify(req: usize, cfg: &PoolConfig) -> Result<(usize, SizeClass)> {
    let chunk_size = cfg.chunk_size();

    if req >= chunk_size {
        return Ok((req, SizeClass::Huge));
    }

    if req < TINY_THRESHOLD {
        let normalized = normalize_tiny(req);

        // Rounding up can push a request right to the tiny/small
        // boundary (e.g. 511 -> 512): reclassify using the normalized
        // value, matching the allocator's actual pool-selection logic.
        if normalized < TINY_THRESHOLD {
            let idx = normalized >> 4;
            return Ok((normalized, SizeClass::Tiny(idx)));
        }

        return Ok((normalized, SizeClass::Small(0)));
    }

    let normalized = normalize_power_of_two(req)?;

    if normalized < cfg.page_size {
        let idx = small_size_class_index(normalized);
        Ok((normalized, SizeClass::Small(idx)))
    } else {
        Ok((normalized, SizeClass::Normal))
    }
}

/// Rounds `req` up to a multiple of 16; `req` itself if already aligned.
fn normalize_tiny(req: usize) -> usize {
    if req & 15 == 0 {
        req
    } else {
        (req & !15) + 16
    }
}

/// Rounds `req` up to the next power of two (classic bit-smear).
fn normalize_power_of_two(req: usize) -> Result<usize> {
    if req == 0 {
        return Ok(0);
    }

    if req.is_power_of_two() {
        return Ok(req);
    }

    req.checked_next_power_of_two()
        .ok_or_else(|| BufError::invalid(format!("capacity {} has no next power of two", req)))
}

/// `small` classes are the powers of two in `[512, page_size)`; index by
/// how many doublings above 512 (2^9) the normalized size sits.
fn small_size_class_index(normalized: usize) -> usize {
    debug_assert!(normalized.is_power_of_two());
    debug_assert!(normalized >= TINY_THRESHOLD);
    (normalized.trailing_zeros() - TINY_THRESHOLD.trailing_zeros()) as usize
}

pub fn small_size_classes(cfg: &PoolConfig) -> usize {
    (cfg.page_shifts() - 9) as usize
}
