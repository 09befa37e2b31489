//! Typed, big-endian accessors layered over `Buffer`'s raw
//! `get_bytes`/`set_bytes`/`read_bytes`/`write_bytes`.
//! Each type gets an absolute (index-based) pair and a relative
//! (reader/writer-index-advancing) pair.
use crate::buffer::Buffer;
use crate::error::Result;

macro_rules! int_accessor {
    ($ty:ty, $get:ident, $set:ident, $read:ident, $write:ident) => {
        pub fn $get(&self, index: usize) -> Result<$ty> {
            let mut buf = [0u8; std::mem::size_of::<$ty>()];
            self.get_bytes(index, &mut buf)?;
            Ok(<$ty>::from_be_bytes(buf))
        }

        pub fn $set(&self, index: usize, value: $ty) -> Result<()> {
            self.set_bytes(index, &value.to_be_bytes())
        }

        pub fn $read(&self) -> Result<$ty> {
            let mut buf = [0u8; std::mem::size_of::<$ty>()];
            self.read_bytes(&mut buf)?;
            Ok(<$ty>::from_be_bytes(buf))
        }

        pub fn $write(&self, value: $ty) -> Result<()> {
            self.write_bytes(&value.to_be_bytes())
        }
    };
}

impl Buffer {
    int_accessor!(u16, get_u16, set_u16, read_u16, write_u16);
    int_accessor!(i16, get_i16, set_i16, read_i16, write_i16);
    int_accessor!(u32, get_u32, set_u32, read_u32, write_u32);
    int_accessor!(i32, get_i32, set_i32, read_i32, write_i32);
    int_accessor!(u64, get_u64, set_u64, read_u64, write_u64);
    int_accessor!(i64, get_i64, set_i64, read_i64, write_i64);
    int_accessor!(f32, get_f32, set_f32, read_f32, write_f32);
    int_accessor!(f64, get_f64, set_f64, read_f64, write_f64);

    pub fn get_u8(&self, index: usize) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.get_bytes(index, &mut buf)?;
        Ok(buf[0])
    }

    pub fn set_u8(&self, index: usize, value: u8) -> Result<()> {
        self.set_bytes(index, &[value])
    }

    pub fn read_u8(&self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    pub fn write_u8(&self, value: u8) -> Result<()> {
        self.write_bytes(&[value])
    }

    pub fn get_i8(&self, index: usize) -> Result<i8> {
        self.get_u8(index).map(|b| b as i8)
    }

    pub fn set_i8(&self, index: usize, value: i8) -> Result<()> {
        self.set_u8(index, value as u8)
    }

    pub fn read_i8(&self) -> Result<i8> {
        self.read_u8().map(|b| b as i8)
    }

    pub fn write_i8(&self, value: i8) -> Result<()> {
        self.write_u8(value as u8)
    }

    pub fn get_bool(&self, index: usize) -> Result<bool> {
        self.get_u8(index).map(|b| b != 0)
    }

    pub fn set_bool(&self, index: usize, value: bool) -> Result<()> {
        self.set_u8(index, value as u8)
    }

    pub fn read_bool(&self) -> Result<bool> {
        self.read_u8().map(|b| b != 0)
    }

    pub fn write_bool(&self, value: bool) -> Result<()> {
        self.write_u8(value as u8)
    }

    /// Stores a `char` as a 16-bit big-endian code unit, matching the
    /// 16-bit `char` width of the system this allocator is modeled
    /// after. Values outside the Basic Multilingual Plane (code point
    /// > 0xFFFF) are truncated to their low 16 bits on write, same as
    /// a narrowing cast to a 16-bit `char` would do.
    pub fn get_char(&self, index: usize) -> Result<char> {
        let v = self.get_u16(index)?;
        char::from_u32(v as u32).ok_or_else(|| crate::error::BufError::access("not a valid char scalar value"))
    }

    pub fn set_char(&self, index: usize, value: char) -> Result<()> {
        self.set_u16(index, value as u32 as u16)
    }

    pub fn read_char(&self) -> Result<char> {
        let v = self.read_u16()?;
        char::from_u32(v as u32).ok_or_else(|| crate::error::BufError::access("not a valid char scalar value"))
    }

    pub fn write_char(&self, value: char) -> Result<()> {
        self.write_u16(value as u32 as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf() -> Buffer {
        Buffer::new_owned(vec![0u8; 32], 32, 32)
    }

    #[test]
    fn integers_roundtrip_big_endian() {
        let b = buf();
        b.set_u32(0, 0x01020304).unwrap();
        let mut raw = [0u8; 4];
        b.get_bytes(0, &mut raw).unwrap();
        assert_eq!(raw, [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(b.get_u32(0).unwrap(), 0x01020304);
    }

    #[test]
    fn relative_accessors_advance_indices() {
        let b = buf();
        b.write_u16(0xABCD).unwrap();
        b.write_u8(1).unwrap();
        assert_eq!(b.writer_index(), 3);

        assert_eq!(b.read_u16().unwrap(), 0xABCD);
        assert_eq!(b.read_u8().unwrap(), 1);
        assert_eq!(b.reader_index(), 3);
    }

    #[test]
    fn floats_and_bool_and_char_roundtrip() {
        let b = buf();
        b.write_f64(std::f64::consts::PI).unwrap();
        assert_eq!(b.read_f64().unwrap(), std::f64::consts::PI);

        b.write_bool(true).unwrap();
        assert!(b.read_bool().unwrap());

        b.write_char('λ').unwrap();
        assert_eq!(b.read_char().unwrap(), 'λ');
    }

    #[test]
    fn signed_and_unsigned_share_byte_layout() {
        let b = buf();
        b.set_i16(0, -1).unwrap();
        assert_eq!(b.get_u16(0).unwrap(), 0xFFFF);
    }
}
