//! Manual, atomic CAS-based reference counting. No
//! automatic `Drop`-triggered release: disposal happens exactly once,
//! the moment a `release` call drives the count to zero, matching the
//! manual-lifetime contract the external interface describes.
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::BufError;

#[derive(Debug)]
pub struct RefCount(AtomicU32);

impl RefCount {
    pub fn new() -> Self {
        RefCount(AtomicU32::new(1))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Bumps the count by `n`. Fails if the buffer is already disposed
    /// or if the bump would overflow `u32`.
    pub fn retain(&self, n: u32) -> Result<(), BufError> {
        loop {
            let cur = self.0.load(Ordering::Relaxed);
            if cur == 0 {
                return Err(BufError::refcount("retain on a disposed buffer"));
            }
            let new = cur
                .checked_add(n)
                .ok_or_else(|| BufError::refcount("retain count overflow"))?;
            if self
                .0
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Drops the count by `n`. Returns `true` if this call drove the
    /// count to zero -- the caller must dispose the buffer exactly once
    /// in that case. Fails if the buffer is already disposed or if `n`
    /// exceeds the current count.
    pub fn release(&self, n: u32) -> Result<bool, BufError> {
        loop {
            let cur = self.0.load(Ordering::Relaxed);
            if cur == 0 {
                return Err(BufError::refcount("release on a disposed buffer"));
            }
            if n > cur {
                return Err(BufError::refcount("release count exceeds current reference count"));
            }
            let new = cur - n;
            if self
                .0
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(new == 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one() {
        assert_eq!(RefCount::new().get(), 1);
    }

    #[test]
    fn retain_then_release_back_to_zero() {
        let rc = RefCount::new();
        rc.retain(2).unwrap();
        assert_eq!(rc.get(), 3);
        assert!(!rc.release(2).unwrap());
        assert!(rc.release(1).unwrap());
    }

    #[test]
    fn release_past_zero_is_rejected() {
        let rc = RefCount::new();
        assert!(rc.release(2).is_err());
    }

    #[test]
    fn operations_after_dispose_are_rejected() {
        let rc = RefCount::new();
        assert!(rc.release(1).unwrap());
        assert!(rc.retain(1).is_err());
        assert!(rc.release(1).is_err());
    }

    #[test]
    fn retain_overflow_is_rejected() {
        let rc = RefCount::new();
        assert!(rc.retain(u32::MAX).is_err());
    }
}
