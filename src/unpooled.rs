//! Construction of unpooled buffers: plain
//! heap-allocated storage with no arena involvement, growing by
//! doubling up to `max_capacity` and never shrinking the underlying
//! allocation.
use crate::buffer::Buffer;
use crate::error::{BufError, Result};

pub fn new(length: usize, max_capacity: usize) -> Result<Buffer> {
    if length > max_capacity {
        return Err(BufError::invalid("length may not exceed max_capacity"));
    }
    Ok(Buffer::new_owned(vec![0u8; length], length, max_capacity))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_length_over_max_capacity() {
        assert!(new(10, 4).is_err());
    }

    #[test]
    fn grows_by_doubling_up_to_max_capacity() {
        let b = new(4, 100).unwrap();
        b.write_bytes(&[0u8; 9]).unwrap();
        assert!(b.capacity() >= 9);
        assert!(b.capacity() <= 100);
    }

    #[test]
    fn grow_is_capped_at_max_capacity() {
        let b = new(4, 10).unwrap();
        assert!(b.write_bytes(&[0u8; 11]).is_err());
    }
}
