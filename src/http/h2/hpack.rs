//! HPACK glue (RFC 7541)
//!
//! Thin wrappers around the `hpack` crate that add what a client connection
//! needs on top of it: honoring the peer's SETTINGS_HEADER_TABLE_SIZE on the
//! encoding side and bounding dynamic table size updates on the decoding
//! side.
//!
//! The `hpack` encoder always assumes the default 4096-byte table. When the
//! table we may use is smaller, the encoder announces a zero-size table once
//! and switches to literals without indexing, which are valid at any size.

use bytes::{BufMut, BytesMut};
use std::borrow::Cow;

/// Default dynamic table size (RFC 7541 Section 4.2)
pub const DEFAULT_TABLE_SIZE: u32 = 4096;

/// Encode an HPACK integer with an N-bit prefix (RFC 7541 Section 5.1)
pub fn encode_integer(value: usize, prefix_bits: u8, first_byte: u8, dst: &mut BytesMut) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        dst.put_u8(first_byte | value as u8);
        return;
    }
    dst.put_u8(first_byte | max_prefix as u8);
    let mut rest = value - max_prefix;
    while rest >= 128 {
        dst.put_u8((rest % 128) as u8 | 0x80);
        rest /= 128;
    }
    dst.put_u8(rest as u8);
}

/// Decode an HPACK integer with an N-bit prefix
///
/// Returns the value and the number of bytes consumed.
pub fn decode_integer(buf: &[u8], prefix_bits: u8) -> Option<(usize, usize)> {
    let max_prefix = (1usize << prefix_bits) - 1;
    let first = *buf.first()? as usize & max_prefix;
    if first < max_prefix {
        return Some((first, 1));
    }
    let mut value = max_prefix;
    let mut shift = 0u32;
    for (i, &byte) in buf[1..].iter().enumerate() {
        if shift > 28 {
            return None;
        }
        value = value.checked_add(((byte & 0x7f) as usize) << shift)?;
        if byte & 0x80 == 0 {
            return Some((value, i + 2));
        }
        shift += 7;
    }
    None
}

/// Connection-wide HPACK encoder
pub struct HpackEncoder {
    inner: ::hpack::Encoder<'static>,
    max_table_size: u32,
    literal_only: bool,
    pending_size_update: bool,
}

impl HpackEncoder {
    /// Create an encoder that never uses more than `max_table_size` bytes
    /// of dynamic table
    pub fn new(max_table_size: u32) -> Self {
        let mut encoder = HpackEncoder {
            inner: ::hpack::Encoder::new(),
            max_table_size,
            literal_only: false,
            pending_size_update: false,
        };
        // Until the peer's SETTINGS arrive the table is the default size
        encoder.set_peer_table_size(DEFAULT_TABLE_SIZE);
        encoder
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE
    pub fn set_peer_table_size(&mut self, size: u32) {
        let allowed = size.min(self.max_table_size);
        if allowed < DEFAULT_TABLE_SIZE && !self.literal_only {
            self.literal_only = true;
            self.pending_size_update = true;
        }
    }

    /// Whether the encoder stopped using the dynamic table
    pub fn is_literal_only(&self) -> bool {
        self.literal_only
    }

    /// Encode one header block and append it to `dst`
    pub fn encode<'a, I>(&mut self, fields: I, dst: &mut BytesMut) -> std::io::Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        if self.literal_only {
            if self.pending_size_update {
                // Dynamic Table Size Update to 0
                encode_integer(0, 5, 0x20, dst);
                self.pending_size_update = false;
            }
            for (name, value) in fields {
                // Literal Header Field without Indexing, new name
                dst.put_u8(0x00);
                encode_integer(name.len(), 7, 0x00, dst);
                dst.put_slice(name.as_bytes());
                encode_integer(value.len(), 7, 0x00, dst);
                dst.put_slice(value.as_bytes());
            }
            return Ok(());
        }

        let pairs: Vec<(&[u8], &[u8])> = fields
            .into_iter()
            .map(|(name, value)| (name.as_bytes(), value.as_bytes()))
            .collect();
        let mut block = Vec::new();
        self.inner.encode_into(pairs, &mut block)?;
        dst.put_slice(&block);
        Ok(())
    }
}

/// Connection-wide HPACK decoder
pub struct HpackDecoder {
    inner: ::hpack::Decoder<'static>,
    max_table_size: u32,
}

impl HpackDecoder {
    /// Create a decoder accepting dynamic tables up to `max_table_size`
    /// (our SETTINGS_HEADER_TABLE_SIZE)
    pub fn new(max_table_size: u32) -> Self {
        HpackDecoder {
            inner: ::hpack::Decoder::new(),
            max_table_size,
        }
    }

    /// Decode a complete header block, calling `field` for each entry
    pub fn decode<F>(&mut self, block: &[u8], mut field: F) -> Result<(), String>
    where
        F: FnMut(Cow<'_, [u8]>, Cow<'_, [u8]>),
    {
        self.check_size_updates(block)?;
        self.inner
            .decode_with_cb(block, |name, value| field(name, value))
            .map_err(|e| format!("HPACK decode error: {:?}", e))
    }

    /// Size updates may only open a block and must not exceed our limit
    fn check_size_updates(&self, mut block: &[u8]) -> Result<(), String> {
        while let Some(&first) = block.first() {
            if first & 0xe0 != 0x20 {
                break;
            }
            let (size, used) = decode_integer(block, 5).ok_or("truncated table size update")?;
            if size > self.max_table_size as usize {
                return Err(format!(
                    "dynamic table size update {} exceeds limit {}",
                    size, self.max_table_size
                ));
            }
            block = &block[used..];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut HpackDecoder, block: &[u8]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        decoder
            .decode(block, |n, v| {
                out.push((
                    String::from_utf8_lossy(&n).into_owned(),
                    String::from_utf8_lossy(&v).into_owned(),
                ))
            })
            .unwrap();
        out
    }

    #[test]
    fn test_integer_coding() {
        // RFC 7541 C.1.2: 1337 with a 5-bit prefix
        let mut buf = BytesMut::new();
        encode_integer(1337, 5, 0, &mut buf);
        assert_eq!(&buf[..], &[0x1f, 0x9a, 0x0a]);
        assert_eq!(decode_integer(&buf, 5), Some((1337, 3)));

        let mut buf = BytesMut::new();
        encode_integer(10, 5, 0x20, &mut buf);
        assert_eq!(&buf[..], &[0x2a]);
        assert_eq!(decode_integer(&[0x1f], 5), None);
    }

    #[test]
    fn test_indexing_encoder_round_trips() {
        let mut encoder = HpackEncoder::new(4096);
        let mut decoder = HpackDecoder::new(4096);
        let fields = [(":method", "GET"), (":path", "/x"), ("x-custom", "abc")];

        for _ in 0..2 {
            let mut block = BytesMut::new();
            encoder.encode(fields.iter().copied(), &mut block).unwrap();
            let decoded = decode_all(&mut decoder, &block);
            assert_eq!(decoded.len(), 3);
            assert_eq!(decoded[2], ("x-custom".to_string(), "abc".to_string()));
        }
        assert!(!encoder.is_literal_only());
    }

    #[test]
    fn test_small_peer_table_switches_to_literals() {
        let mut encoder = HpackEncoder::new(4096);
        encoder.set_peer_table_size(0);
        assert!(encoder.is_literal_only());

        let mut block = BytesMut::new();
        encoder.encode([("x-a", "1")], &mut block).unwrap();
        // Size update to 0, then literal without indexing
        assert_eq!(&block[..], &[0x20, 0x00, 0x03, b'x', b'-', b'a', 0x01, b'1']);

        let mut decoder = HpackDecoder::new(4096);
        assert_eq!(decode_all(&mut decoder, &block), vec![("x-a".to_string(), "1".to_string())]);

        // The size update is only sent once
        let mut block = BytesMut::new();
        encoder.encode([("x-a", "1")], &mut block).unwrap();
        assert_eq!(block[0], 0x00);
    }

    #[test]
    fn test_local_max_below_default_switches_to_literals() {
        let encoder = HpackEncoder::new(1024);
        assert!(encoder.is_literal_only());
    }

    #[test]
    fn test_decoder_rejects_oversized_table_update() {
        let mut decoder = HpackDecoder::new(4096);
        let mut block = BytesMut::new();
        encode_integer(8192, 5, 0x20, &mut block);
        block.put_u8(0x82);
        assert!(decoder.decode(&block, |_, _| {}).is_err());
    }
}
