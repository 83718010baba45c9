//! Binary marshalling codec.
//!
//! All integers are fixed-width big-endian. 64-bit values go out as two
//! 32-bit halves, high half first. Strings and byte blobs carry a 32-bit
//! length, sequences and maps a 32-bit element count.
//!
//! Decoding never panics: an underrun flips the [`Unmarshaller`] into a failed
//! state after which every read returns a default value. Callers check
//! [`Unmarshaller::fully_consumed`] once, after decoding everything.

use std::collections::BTreeMap;
use std::mem;

use bytes::{BufMut, Bytes, BytesMut};

use super::framing::MAX_FRAME_SIZE;
use super::header::{
    HEADER_SIZE, LENGTH_PREFIX_SIZE, REPLY_HEADER_SIZE, ReplyHeader, RequestHeader,
};

/// Initial capacity of a fresh [`Marshaller`].
pub const DEFAULT_CAPACITY: usize = 1024;

/// A value that can be appended to a [`Marshaller`].
pub trait Marshal {
    /// Appends the encoded value.
    fn marshal(&self, m: &mut Marshaller);
}

/// A value that can be read back from an [`Unmarshaller`].
pub trait Unmarshal: Sized {
    /// Reads one value, returning a default if the input is exhausted or
    /// already failed.
    fn unmarshal(u: &mut Unmarshaller) -> Self;
}

/// Growable encode buffer with a reserved header region in front.
#[derive(Debug)]
pub struct Marshaller {
    buf: BytesMut,
}

impl Marshaller {
    /// Creates an empty marshaller with [`DEFAULT_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an empty marshaller able to hold `capacity` bytes before growing.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let mut buf = BytesMut::with_capacity(capacity.max(HEADER_SIZE));
        buf.put_bytes(0, HEADER_SIZE);
        Self { buf }
    }

    /// Appends a value.
    pub fn pack<T: Marshal + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.marshal(self);
        self
    }

    /// Appends one byte.
    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    /// Appends a big-endian 16-bit value.
    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    /// Appends a big-endian 32-bit value.
    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    /// Appends a 64-bit value as two 32-bit halves, high half first.
    #[allow(clippy::cast_possible_truncation)]
    pub fn put_u64(&mut self, value: u64) {
        self.put_u32((value >> 32) as u32);
        self.put_u32(value as u32);
    }

    /// Appends raw bytes without a length.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Appends a 32-bit length or element count.
    #[allow(clippy::cast_possible_truncation)]
    pub fn put_len(&mut self, len: usize) {
        // Frames are capped far below u32::MAX, a longer value can never be sent.
        self.put_u32(len as u32);
    }

    /// Total size including the reserved header region.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been packed after the header region.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.len() == HEADER_SIZE
    }

    /// Bytes packed so far, excluding the header region.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }

    /// Writes a request header into the reserved region.
    pub fn pack_request_header(&mut self, header: &RequestHeader) {
        let region = &mut self.buf[LENGTH_PREFIX_SIZE..HEADER_SIZE];
        region[0..4].copy_from_slice(&header.request_id.to_be_bytes());
        region[4..8].copy_from_slice(&header.proc_id.to_be_bytes());
        region[8..12].copy_from_slice(&header.client_id.to_be_bytes());
        region[12..16].copy_from_slice(&header.server_id.to_be_bytes());
    }

    /// Writes a reply header into the reserved region, zeroing the unused tail.
    pub fn pack_reply_header(&mut self, header: &ReplyHeader) {
        let region = &mut self.buf[LENGTH_PREFIX_SIZE..HEADER_SIZE];
        region[0..4].copy_from_slice(&header.request_id.to_be_bytes());
        region[4..8].copy_from_slice(&header.result_code.to_be_bytes());
        region[REPLY_HEADER_SIZE..].fill(0);
    }

    /// Hands over the buffer. The length prefix is still zero; the framing
    /// layer patches it when the frame is first written.
    #[must_use]
    pub fn into_frame(self) -> BytesMut {
        self.buf
    }
}

impl Default for Marshaller {
    fn default() -> Self {
        Self::new()
    }
}

/// Read cursor over a received frame.
#[derive(Debug, Clone)]
pub struct Unmarshaller {
    buf: Bytes,
    pos: usize,
    ok: bool,
}

impl Unmarshaller {
    /// Wraps a buffer with the cursor at its first byte.
    ///
    /// For a whole frame, call one of the `unpack_*_header` methods first to
    /// move the cursor past the header region.
    #[must_use]
    pub const fn new(buf: Bytes) -> Self {
        Self {
            buf,
            pos: 0,
            ok: true,
        }
    }

    /// Reads the request header and leaves the cursor at the payload.
    pub fn unpack_request_header(&mut self) -> RequestHeader {
        if !self.seek_header() {
            return RequestHeader::default();
        }

        let header = RequestHeader {
            request_id: self.get_i32(),
            proc_id: self.get_u32(),
            client_id: self.get_u32(),
            server_id: self.get_u32(),
        };
        self.pos = HEADER_SIZE;
        header
    }

    /// Reads the reply header and leaves the cursor at the payload.
    pub fn unpack_reply_header(&mut self) -> ReplyHeader {
        if !self.seek_header() {
            return ReplyHeader::default();
        }

        let header = ReplyHeader {
            request_id: self.get_i32(),
            result_code: self.get_i32(),
        };
        self.pos = HEADER_SIZE;
        header
    }

    fn seek_header(&mut self) -> bool {
        if self.buf.len() < HEADER_SIZE {
            self.ok = false;
            return false;
        }
        self.pos = LENGTH_PREFIX_SIZE;
        true
    }

    /// Whether no read has run past the end so far.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.ok
    }

    /// Whether every byte was consumed and no read failed.
    ///
    /// This is the only check that makes decoded values trustworthy.
    #[must_use]
    pub fn fully_consumed(&self) -> bool {
        self.ok && self.pos == self.buf.len()
    }

    /// Bytes left after the cursor.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Marks the decode as failed. Useful for `Unmarshal` impls that reject
    /// well-formed but invalid input.
    pub const fn invalidate(&mut self) {
        self.ok = false;
    }

    /// Reads a value.
    pub fn unpack<T: Unmarshal>(&mut self) -> T {
        T::unmarshal(self)
    }

    fn take(&mut self, n: usize) -> Option<&[u8]> {
        if !self.ok || self.remaining() < n {
            self.ok = false;
            return None;
        }
        let start = self.pos;
        self.pos += n;
        Some(&self.buf[start..self.pos])
    }

    /// Reads one byte.
    pub fn get_u8(&mut self) -> u8 {
        self.take(1).map_or(0, |b| b[0])
    }

    /// Reads a big-endian 16-bit value.
    pub fn get_u16(&mut self) -> u16 {
        self.take(2).map_or(0, |b| u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads a big-endian 32-bit value.
    pub fn get_u32(&mut self) -> u32 {
        self.take(4)
            .map_or(0, |b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian signed 32-bit value.
    pub fn get_i32(&mut self) -> i32 {
        i32::from_be_bytes(self.get_u32().to_be_bytes())
    }

    /// Reads a 64-bit value sent as two 32-bit halves.
    pub fn get_u64(&mut self) -> u64 {
        let high = u64::from(self.get_u32());
        let low = u64::from(self.get_u32());
        (high << 32) | low
    }

    /// Reads `n` raw bytes without copying.
    pub fn get_raw(&mut self, n: usize) -> Bytes {
        if !self.ok || self.remaining() < n {
            self.ok = false;
            return Bytes::new();
        }
        let out = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        out
    }

    /// Reads a 32-bit length or element count.
    pub fn get_len(&mut self) -> usize {
        self.get_u32() as usize
    }
}

impl<T: Marshal + ?Sized> Marshal for &T {
    fn marshal(&self, m: &mut Marshaller) {
        (**self).marshal(m);
    }
}

impl Marshal for bool {
    fn marshal(&self, m: &mut Marshaller) {
        m.put_u8(u8::from(*self));
    }
}

impl Unmarshal for bool {
    fn unmarshal(u: &mut Unmarshaller) -> Self {
        u.get_u8() != 0
    }
}

impl Marshal for u8 {
    fn marshal(&self, m: &mut Marshaller) {
        m.put_u8(*self);
    }
}

impl Unmarshal for u8 {
    fn unmarshal(u: &mut Unmarshaller) -> Self {
        u.get_u8()
    }
}

impl Marshal for u16 {
    fn marshal(&self, m: &mut Marshaller) {
        m.put_u16(*self);
    }
}

impl Unmarshal for u16 {
    fn unmarshal(u: &mut Unmarshaller) -> Self {
        u.get_u16()
    }
}

impl Marshal for u32 {
    fn marshal(&self, m: &mut Marshaller) {
        m.put_u32(*self);
    }
}

impl Unmarshal for u32 {
    fn unmarshal(u: &mut Unmarshaller) -> Self {
        u.get_u32()
    }
}

impl Marshal for u64 {
    fn marshal(&self, m: &mut Marshaller) {
        m.put_u64(*self);
    }
}

impl Unmarshal for u64 {
    fn unmarshal(u: &mut Unmarshaller) -> Self {
        u.get_u64()
    }
}

// Signed integers share the unsigned encoding of the same width.
macro_rules! impl_signed {
    ($($signed:ty => $unsigned:ty),* $(,)?) => {
        $(
            impl Marshal for $signed {
                fn marshal(&self, m: &mut Marshaller) {
                    <$unsigned>::from_be_bytes(self.to_be_bytes()).marshal(m);
                }
            }

            impl Unmarshal for $signed {
                fn unmarshal(u: &mut Unmarshaller) -> Self {
                    Self::from_be_bytes(<$unsigned>::unmarshal(u).to_be_bytes())
                }
            }
        )*
    };
}

impl_signed!(i8 => u8, i16 => u16, i32 => u32, i64 => u64);

impl Marshal for str {
    fn marshal(&self, m: &mut Marshaller) {
        m.put_len(self.len());
        m.put_raw(self.as_bytes());
    }
}

impl Marshal for String {
    fn marshal(&self, m: &mut Marshaller) {
        self.as_str().marshal(m);
    }
}

impl Unmarshal for String {
    fn unmarshal(u: &mut Unmarshaller) -> Self {
        let len = u.get_len();
        let raw = u.get_raw(len);
        if !u.is_ok() {
            return Self::new();
        }
        Self::from_utf8(raw.to_vec()).unwrap_or_else(|_| {
            u.invalidate();
            Self::new()
        })
    }
}

impl Marshal for Bytes {
    fn marshal(&self, m: &mut Marshaller) {
        m.put_len(self.len());
        m.put_raw(self);
    }
}

impl Unmarshal for Bytes {
    fn unmarshal(u: &mut Unmarshaller) -> Self {
        let len = u.get_len();
        u.get_raw(len)
    }
}

impl<T: Marshal> Marshal for [T] {
    fn marshal(&self, m: &mut Marshaller) {
        m.put_len(self.len());
        for item in self {
            item.marshal(m);
        }
    }
}

impl<T: Marshal> Marshal for Vec<T> {
    fn marshal(&self, m: &mut Marshaller) {
        self.as_slice().marshal(m);
    }
}

/// Reads an element count. Zero-sized elements consume no input, so their
/// count is bounded by the largest frame instead.
fn get_count<T>(u: &mut Unmarshaller) -> usize {
    let count = u.get_len();
    if mem::size_of::<T>() == 0 && count > MAX_FRAME_SIZE {
        u.invalidate();
        return 0;
    }
    count
}

impl<T: Unmarshal> Unmarshal for Vec<T> {
    fn unmarshal(u: &mut Unmarshaller) -> Self {
        let count = get_count::<T>(u);
        // Every element takes at least one byte, so a count beyond the
        // remaining input is bogus and must not drive the allocation.
        let mut items = Self::with_capacity(count.min(u.remaining()));
        for _ in 0..count {
            if !u.is_ok() {
                break;
            }
            items.push(T::unmarshal(u));
        }

        if u.is_ok() { items } else { Self::new() }
    }
}

impl<K: Marshal, V: Marshal> Marshal for BTreeMap<K, V> {
    fn marshal(&self, m: &mut Marshaller) {
        m.put_len(self.len());
        for (key, value) in self {
            key.marshal(m);
            value.marshal(m);
        }
    }
}

impl<K: Unmarshal + Ord, V: Unmarshal> Unmarshal for BTreeMap<K, V> {
    fn unmarshal(u: &mut Unmarshaller) -> Self {
        let count = get_count::<(K, V)>(u);
        let mut map = Self::new();
        for _ in 0..count {
            if !u.is_ok() {
                break;
            }
            let key = K::unmarshal(u);
            let value = V::unmarshal(u);
            map.insert(key, value);
        }

        if u.is_ok() { map } else { Self::new() }
    }
}

impl Marshal for () {
    fn marshal(&self, _m: &mut Marshaller) {}
}

impl Unmarshal for () {
    fn unmarshal(_u: &mut Unmarshaller) -> Self {}
}

// Tuples encode their fields back to back. They carry procedure argument
// lists, so `(a, b)` on the client decodes as `(A, B)` on the server.
macro_rules! impl_tuple {
    ($($name:ident),+) => {
        impl<$($name: Marshal),+> Marshal for ($($name,)+) {
            #[allow(non_snake_case)]
            fn marshal(&self, m: &mut Marshaller) {
                let ($($name,)+) = self;
                $($name.marshal(m);)+
            }
        }

        impl<$($name: Unmarshal),+> Unmarshal for ($($name,)+) {
            fn unmarshal(u: &mut Unmarshaller) -> Self {
                ($($name::unmarshal(u),)+)
            }
        }
    };
}

impl_tuple!(A1);
impl_tuple!(A1, A2);
impl_tuple!(A1, A2, A3);
impl_tuple!(A1, A2, A3, A4);
impl_tuple!(A1, A2, A3, A4, A5);
impl_tuple!(A1, A2, A3, A4, A5, A6);
impl_tuple!(A1, A2, A3, A4, A5, A6, A7);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn payload_of<T: Marshal + ?Sized>(value: &T) -> Vec<u8> {
        let mut m = Marshaller::new();
        m.pack(value);
        m.payload().to_vec()
    }

    fn reader(payload: &[u8]) -> Unmarshaller {
        Unmarshaller::new(Bytes::copy_from_slice(payload))
    }

    fn round_trip<T: Marshal + Unmarshal>(value: &T) -> (T, bool) {
        let mut u = reader(&payload_of(value));
        let decoded = T::unmarshal(&mut u);
        (decoded, u.fully_consumed())
    }

    #[test]
    fn test_fixed_width_big_endian_layout() {
        assert_eq!(payload_of(&true), [1]);
        assert_eq!(payload_of(&0xabu8), [0xab]);
        assert_eq!(payload_of(&0x1234u16), [0x12, 0x34]);
        assert_eq!(payload_of(&-2i16), [0xff, 0xfe]);
        assert_eq!(payload_of(&0x0102_0304u32), [1, 2, 3, 4]);
        assert_eq!(payload_of(&-1i32), [0xff; 4]);
    }

    #[test]
    fn test_u64_high_half_first() {
        assert_eq!(
            payload_of(&0x0102_0304_0506_0708u64),
            [1, 2, 3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn test_string_is_length_prefixed() {
        assert_eq!(payload_of("hi"), [0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_sequence_and_map_layout() {
        assert_eq!(payload_of(&vec![7u16, 8]), [0, 0, 0, 2, 0, 7, 0, 8]);

        let mut map = BTreeMap::new();
        map.insert(2u8, true);
        map.insert(1u8, false);
        // Ordered by key.
        assert_eq!(payload_of(&map), [0, 0, 0, 2, 1, 0, 2, 1]);
    }

    #[test]
    fn test_underrun_poisons_subsequent_reads() {
        let mut u = reader(&[0, 0, 0, 5, 0xff]);
        assert_eq!(u.get_u32(), 5);
        assert_eq!(u.get_u16(), 0);
        assert!(!u.is_ok());

        // Bytes are still there, but the cursor is failed.
        assert_eq!(u.get_u8(), 0);
        assert!(!u.fully_consumed());
    }

    #[test]
    fn test_trailing_bytes_are_not_fully_consumed() {
        let mut u = reader(&[0, 1, 9]);
        assert_eq!(u.get_u16(), 1);
        assert!(u.is_ok());
        assert!(!u.fully_consumed());
    }

    #[test]
    fn test_string_longer_than_input_fails() {
        let mut u = reader(&[0, 0, 0, 10, b'a']);
        assert_eq!(String::unmarshal(&mut u), "");
        assert!(!u.is_ok());
    }

    #[test]
    fn test_invalid_utf8_fails() {
        let mut u = reader(&[0, 0, 0, 2, 0xc3, 0x28]);
        assert_eq!(String::unmarshal(&mut u), "");
        assert!(!u.is_ok());
    }

    #[test]
    fn test_huge_count_does_not_allocate() {
        let mut u = reader(&[0xff, 0xff, 0xff, 0xff, 1]);
        let items: Vec<u64> = u.unpack();
        assert!(items.is_empty());
        assert!(!u.is_ok());
    }

    #[test]
    fn test_zero_sized_elements() {
        let (items, consumed) = round_trip(&vec![(); 3]);
        assert_eq!(items.len(), 3);
        assert!(consumed);

        let mut u = reader(&[0x10, 0, 0, 0]);
        let items: Vec<()> = u.unpack();
        assert!(items.is_empty());
        assert!(!u.is_ok());

        let mut u = reader(&[0xff, 0xff, 0xff, 0xff]);
        let map: BTreeMap<(), ()> = u.unpack();
        assert!(map.is_empty());
        assert!(!u.is_ok());
    }

    #[test]
    fn test_headers_written_after_payload() {
        let mut m = Marshaller::new();
        m.pack(&42u32);
        m.pack_request_header(&RequestHeader {
            request_id: 5,
            proc_id: 0x7001,
            client_id: 9,
            server_id: 3,
        });

        let frame = m.into_frame();
        assert_eq!(frame.len(), HEADER_SIZE + 4);
        assert_eq!(&frame[..4], [0; 4]);

        let mut u = Unmarshaller::new(frame.freeze());
        let header = u.unpack_request_header();
        assert_eq!(header.request_id, 5);
        assert_eq!(header.proc_id, 0x7001);
        assert_eq!(header.client_id, 9);
        assert_eq!(header.server_id, 3);
        assert_eq!(u.get_u32(), 42);
        assert!(u.fully_consumed());
    }

    #[test]
    fn test_reply_header_zeroes_unused_region() {
        let mut m = Marshaller::new();
        m.pack_request_header(&RequestHeader {
            request_id: -1,
            proc_id: u32::MAX,
            client_id: u32::MAX,
            server_id: u32::MAX,
        });
        m.pack_reply_header(&ReplyHeader {
            request_id: 7,
            result_code: -8,
        });

        let frame = m.into_frame();
        assert_eq!(&frame[4..8], 7i32.to_be_bytes());
        assert_eq!(&frame[8..12], (-8i32).to_be_bytes());
        assert_eq!(&frame[12..HEADER_SIZE], [0; 8]);
    }

    #[test]
    fn test_short_frame_fails_header() {
        let mut u = reader(&[0, 0, 0, 12, 0, 0, 0, 1]);
        let header = u.unpack_reply_header();
        assert_eq!(header, ReplyHeader::default());
        assert!(!u.is_ok());
    }

    #[test]
    fn test_tuple_arguments() {
        let mut m = Marshaller::new();
        m.pack(&(7u32, 1u64, "abc"));

        let mut u = reader(m.payload());
        let (a, b, c): (u32, u64, String) = u.unpack();
        assert_eq!((a, b, c.as_str()), (7, 1, "abc"));
        assert!(u.fully_consumed());
    }

    proptest! {
        #[test]
        fn prop_scalars_round_trip(a: bool, b: i8, c: u16, d: i32, e: u64, f: i64) {
            prop_assert_eq!(round_trip(&(a, b, c, d, e, f)), ((a, b, c, d, e, f), true));
        }

        #[test]
        fn prop_strings_round_trip(s in ".*") {
            prop_assert_eq!(round_trip(&s), (s.clone(), true));
        }

        #[test]
        fn prop_sequences_round_trip(v in proptest::collection::vec(any::<u32>(), 0..64)) {
            prop_assert_eq!(round_trip(&v), (v.clone(), true));
        }

        #[test]
        fn prop_maps_round_trip(
            map in proptest::collection::btree_map(any::<u64>(), ".{0,8}", 0..16)
        ) {
            prop_assert_eq!(round_trip(&map), (map.clone(), true));
        }
    }
}
