//! Bounds-checked little-endian cursor types used by every payload codec.
//!
//! [`Reader`] never panics on short input: every read checks the remaining length and reports
//! [`NatNetError::Malformed`] naming the field that ran past the end. Element counts read from
//! the wire are validated against the bytes that are actually left before anything is allocated.

use crate::{NatNetError, Result};

/// Capacity of variable-length names, terminator included.
pub const MAX_NAME_LEN: usize = 256;

/// Cursor over a received payload.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(NatNetError::malformed(
                field,
                format!(
                    "needs {} bytes at offset {}, only {} left",
                    len,
                    self.pos,
                    self.remaining()
                ),
            ));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Everything not consumed yet.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    fn read_array<const N: usize>(&mut self, field: &str) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N, field)?;
        <[u8; N]>::try_from(bytes).map_err(|e| NatNetError::malformed(field, e.to_string()))
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>("u8")?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.read_array("i16")?))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array("u16")?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array("i32")?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array("u32")?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array("u64")?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array("f32")?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array("f64")?))
    }

    /// Reads an `i32` element count and checks that `count * min_record_size` bytes remain.
    pub fn read_count(&mut self, min_record_size: usize, field: &str) -> Result<usize> {
        let raw = self.read_i32()?;
        let count = usize::try_from(raw)
            .map_err(|_| NatNetError::malformed(field, format!("negative count {raw}")))?;
        let needed = count.saturating_mul(min_record_size);
        if needed > self.remaining() {
            return Err(NatNetError::malformed(
                field,
                format!(
                    "count {} needs at least {} bytes, only {} left",
                    count,
                    needed,
                    self.remaining()
                ),
            ));
        }
        Ok(count)
    }

    /// Reads a count-prefixed list of records.
    pub fn read_list<T>(
        &mut self,
        min_record_size: usize,
        field: &str,
        mut read: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        let count = self.read_count(min_record_size, field)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(read(self)?);
        }
        Ok(items)
    }

    /// Reads a null-terminated name of at most `capacity` bytes.
    ///
    /// Decoding stops at the first null or at `capacity`, whichever comes first. A run that hits
    /// the end of the payload before either is malformed.
    pub fn read_cstring(&mut self, capacity: usize) -> Result<String> {
        let window = capacity.min(self.remaining());
        let slice = &self.data[self.pos..self.pos + window];
        match slice.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                Ok(String::from_utf8_lossy(&slice[..end]).into_owned())
            }
            None if window == capacity => {
                self.pos += capacity;
                Ok(String::from_utf8_lossy(slice).into_owned())
            }
            None => Err(NatNetError::malformed(
                "string",
                format!("unterminated string at offset {}", self.pos),
            )),
        }
    }

    /// Reads a fixed-capacity string field; always consumes exactly `capacity` bytes.
    pub fn read_fixed_string(&mut self, capacity: usize) -> Result<String> {
        let bytes = self.read_bytes(capacity, "fixed string")?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

/// Growable little-endian output buffer.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_i16(&mut self, value: i16) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Overwrites a previously written `u16` (used to back-patch the header length).
    pub fn set_u16(&mut self, offset: usize, value: u16) {
        if let Some(slot) = self.buf.get_mut(offset..offset + 2) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
    }

    pub fn write_count(&mut self, count: usize) {
        self.write_i32(i32::try_from(count).unwrap_or(i32::MAX));
    }

    pub fn write_list<T>(&mut self, items: &[T], mut write: impl FnMut(&mut Self, &T)) {
        self.write_count(items.len());
        for item in items {
            write(self, item);
        }
    }

    /// Writes a null-terminated name, truncated to fit `MAX_NAME_LEN`.
    pub fn write_cstring(&mut self, value: &str) {
        let bytes = truncated(value, MAX_NAME_LEN - 1);
        self.write_bytes(bytes);
        self.write_u8(0);
    }

    /// Writes a fixed-capacity string field: truncated, null-terminated and zero-padded.
    pub fn write_fixed_string(&mut self, value: &str, capacity: usize) {
        if capacity == 0 {
            return;
        }
        let bytes = truncated(value, capacity - 1);
        self.write_bytes(bytes);
        self.buf.resize(self.buf.len() + capacity - bytes.len(), 0);
    }
}

/// Longest prefix of `value` that fits in `max` bytes, cut at a char boundary and at any
/// interior null.
fn truncated(value: &str, max: usize) -> &[u8] {
    let value = value.split('\0').next().unwrap_or_default();
    if value.len() <= max {
        return value.as_bytes();
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value.as_bytes()[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn short_reads_name_the_field() {
        let mut reader = Reader::new(&[1, 2, 3]);
        let err = reader.read_i32().expect_err("three bytes is not an i32");
        assert!(matches!(err, NatNetError::Malformed { ref context, .. } if context == "i32"));
        // a failed read consumes nothing
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn counts_are_checked_against_remaining_bytes() {
        let mut writer = Writer::new();
        writer.write_i32(1_000_000);
        writer.write_bytes(&[0; 24]);
        let bytes = writer.into_inner();
        let mut reader = Reader::new(&bytes);
        assert!(reader.read_count(12, "markers").is_err());

        let mut negative = Writer::new();
        negative.write_i32(-1);
        let bytes = negative.into_inner();
        assert!(Reader::new(&bytes).read_count(0, "markers").is_err());
    }

    #[test]
    fn cstring_stops_at_null() {
        let mut reader = Reader::new(b"RB0\0tail");
        assert_eq!(reader.read_cstring(MAX_NAME_LEN).expect("name"), "RB0");
        assert_eq!(reader.remaining(), 4);
    }

    #[test]
    fn cstring_stops_at_capacity() {
        let mut reader = Reader::new(b"abcdefgh");
        assert_eq!(reader.read_cstring(4).expect("capped"), "abcd");
        assert_eq!(reader.position(), 4);
    }

    #[test]
    fn unterminated_cstring_at_end_is_malformed() {
        let mut reader = Reader::new(b"abc");
        assert!(reader.read_cstring(MAX_NAME_LEN).is_err());
    }

    #[test]
    fn fixed_string_is_padded_and_truncated() {
        let mut writer = Writer::new();
        writer.write_fixed_string("server", 16);
        writer.write_fixed_string(&"x".repeat(40), 8);
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..7], b"server\0");
        assert!(bytes[7..16].iter().all(|&b| b == 0));
        assert_eq!(&bytes[16..24], b"xxxxxxx\0");

        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_fixed_string(16).expect("first"), "server");
        assert_eq!(reader.read_fixed_string(8).expect("second"), "xxxxxxx");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let name = "é".repeat(200);
        let mut writer = Writer::new();
        writer.write_cstring(&name);
        let bytes = writer.into_inner();
        assert!(bytes.len() <= MAX_NAME_LEN);
        let decoded = Reader::new(&bytes).read_cstring(MAX_NAME_LEN).expect("name");
        assert!(name.starts_with(&decoded));
    }

    #[test]
    fn header_length_can_be_patched() {
        let mut writer = Writer::new();
        writer.write_u16(7);
        writer.write_u16(0);
        writer.write_bytes(&[9; 5]);
        writer.set_u16(2, 5);
        let bytes = writer.into_inner();
        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_u16().expect("id"), 7);
        assert_eq!(reader.read_u16().expect("len"), 5);
    }

    proptest! {
        #[test]
        fn scalar_fields_read_back(a in any::<i16>(), b in any::<i32>(), c in any::<u64>(), d in any::<f64>()) {
            let mut writer = Writer::new();
            writer.write_i16(a);
            writer.write_i32(b);
            writer.write_u64(c);
            writer.write_f64(d);
            let bytes = writer.into_inner();
            let mut reader = Reader::new(&bytes);
            prop_assert_eq!(reader.read_i16().expect("i16"), a);
            prop_assert_eq!(reader.read_i32().expect("i32"), b);
            prop_assert_eq!(reader.read_u64().expect("u64"), c);
            prop_assert_eq!(reader.read_f64().expect("f64").to_bits(), d.to_bits());
            prop_assert_eq!(reader.remaining(), 0);
        }

        #[test]
        fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let mut reader = Reader::new(&bytes);
            let _ = reader.read_cstring(MAX_NAME_LEN);
            let _ = reader.read_count(4, "fuzz");
            let _ = reader.read_f64();
        }
    }
}
