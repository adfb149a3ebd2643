use std::convert::TryInto;

/// Append an `i32` to a byte buffer in little-endian order.
///
pub fn put_i32(buffer: &mut Vec<u8>, value: i32) {
    buffer.extend_from_slice(&value.to_le_bytes())
}

/// Append a `u32` to a byte buffer in little-endian order.
///
pub fn put_u32(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_le_bytes())
}

/// Append a `u64` to a byte buffer in little-endian order.
///
pub fn put_u64(buffer: &mut Vec<u8>, value: u64) {
    buffer.extend_from_slice(&value.to_le_bytes())
}

/// A little-endian reader over a byte slice. Methods return `None` when the
/// slice is exhausted; callers translate that into a shape-mismatch error.
///
pub struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len()
    }

    pub fn get_i32(&mut self) -> Option<i32> {
        self.get_array().map(i32::from_le_bytes)
    }

    pub fn get_u32(&mut self) -> Option<u32> {
        self.get_array().map(u32::from_le_bytes)
    }

    pub fn get_u64(&mut self) -> Option<u64> {
        self.get_array().map(u64::from_le_bytes)
    }

    pub fn get_u8(&mut self) -> Option<u8> {
        self.get_array().map(|[b]: [u8; 1]| b)
    }

    pub fn get_slice(&mut self, len: usize) -> Option<&'a [u8]> {
        if len <= self.bytes.len() {
            let (head, tail) = self.bytes.split_at(len);
            self.bytes = tail;
            Some(head)
        } else {
            None
        }
    }

    fn get_array<const SIZE: usize>(&mut self) -> Option<[u8; SIZE]> {
        self.get_slice(SIZE).map(|s| s.try_into().unwrap())
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn round_trips_mixed_integers() {
        let mut buffer = Vec::new();
        put_i32(&mut buffer, -7);
        put_u32(&mut buffer, 42);
        put_u64(&mut buffer, u64::MAX);

        let mut reader = Reader::new(&buffer);
        assert_eq!(reader.get_i32(), Some(-7));
        assert_eq!(reader.get_u32(), Some(42));
        assert_eq!(reader.get_u64(), Some(u64::MAX));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn short_reads_return_none() {
        let mut reader = Reader::new(&[1, 2, 3]);
        assert_eq!(reader.get_u32(), None);
        assert_eq!(reader.get_slice(2), Some(&[1u8, 2][..]));
        assert_eq!(reader.get_i32(), None);
    }
}
