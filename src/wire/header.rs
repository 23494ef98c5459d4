//! The 11-byte framed header: `type: u16, sid: u16, length: u32, flags: u8,
//! csum: u16`, all little-endian (see DESIGN.md for why this crate resolves
//! on an 11-byte header with a 16-bit checksum rather than a 10-byte,
//! 8-bit-checksum layout).

use bytes::{Buf, BufMut, BytesMut};

use crate::config::{FLAG_RESERVED_MASK, FLAG_SCLOSE, FLAG_SOPEN, HEADER_LEN, MAX_BODY_LEN};
use crate::{Error, Result};

/// Number of leading header bytes folded into the checksum (everything
/// except the checksum field itself).
const N_CSUM_BYTES: usize = 8;
const CSUM_MASK: u32 = 0xffff;

/// A decoded (or about-to-be-encoded) message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub r#type: u16,
    pub sid: u16,
    pub length: u32,
    pub flags: u8,
}

impl Header {
    pub fn new(r#type: u16, sid: u16, length: u32, flags: u8) -> Self {
        Self {
            r#type,
            sid,
            length,
            flags: flags & !FLAG_RESERVED_MASK,
        }
    }

    pub fn sopen(&self) -> bool {
        self.flags & FLAG_SOPEN != 0
    }

    pub fn sclose(&self) -> bool {
        self.flags & FLAG_SCLOSE != 0
    }

    pub fn set_sopen(&mut self, on: bool) {
        set_flag(&mut self.flags, FLAG_SOPEN, on);
    }

    pub fn set_sclose(&mut self, on: bool) {
        set_flag(&mut self.flags, FLAG_SCLOSE, on);
    }

    /// Encodes this header into `HEADER_LEN` bytes. Zero-initializes the
    /// checksum field, sums the first `N_CSUM_BYTES` bytes, folds to 16
    /// bits, and XORs with `0xFFFF`.
    pub fn encode(&self) -> Result<BytesMut> {
        if self.length > MAX_BODY_LEN {
            return Err(Error::BodyTooLarge {
                len: self.length,
                max: MAX_BODY_LEN,
            });
        }
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_u16_le(self.r#type);
        buf.put_u16_le(self.sid);
        buf.put_u32_le(self.length);
        buf.put_u8(self.flags);
        buf.put_u16_le(0); // csum placeholder, zeroed during the fold below

        let csum = fold_checksum(&buf[..N_CSUM_BYTES]);
        let csum_bytes = csum.to_le_bytes();
        let csum_offset = HEADER_LEN - 2;
        buf[csum_offset] = csum_bytes[0];
        buf[csum_offset + 1] = csum_bytes[1];
        Ok(buf)
    }

    /// Decodes a header starting at `offset` in `bytes`. `bytes` must have
    /// at least `HEADER_LEN` bytes available from `offset`.
    pub fn decode(bytes: &[u8], offset: usize) -> Result<Self> {
        let mut buf = &bytes[offset..offset + HEADER_LEN];
        let r#type = buf.get_u16_le();
        let sid = buf.get_u16_le();
        let length = buf.get_u32_le();
        let flags = buf.get_u8();
        let csum = buf.get_u16_le();

        let expected = fold_checksum(&bytes[offset..offset + N_CSUM_BYTES]);
        if csum != expected {
            return Err(Error::CorruptHeader {
                got: csum,
                expected,
            });
        }
        if length > MAX_BODY_LEN {
            return Err(Error::BodyTooLarge {
                len: length,
                max: MAX_BODY_LEN,
            });
        }
        Ok(Self::new(r#type, sid, length, flags))
    }
}

fn set_flag(flags: &mut u8, bit: u8, on: bool) {
    if on {
        *flags |= bit;
    } else {
        *flags &= !bit;
    }
}

/// Sums the given bytes (treating the csum field, if present, as zero),
/// masks to 16 bits, then XORs with `0xFFFF`.
fn fold_checksum(bytes: &[u8]) -> u16 {
    let sum: u32 = bytes.iter().map(|&b| b as u32).sum();
    ((sum & CSUM_MASK) ^ CSUM_MASK) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_identity() {
        for (t, sid, len, flags) in [
            (3u16, 4u16, 5u32, 6u8),
            (0xffffu16, 0xffffu16, 0x3fffffu32, 0xffu8),
            (2011, 0, 203453, 7),
        ] {
            let h = Header::new(t, sid, len, flags);
            let encoded = h.encode().unwrap();
            let decoded = Header::decode(&encoded, 0).unwrap();
            assert_eq!(decoded.r#type, t);
            assert_eq!(decoded.sid, sid);
            assert_eq!(decoded.length, len);
            // reserved bits must read back as zero regardless of input
            assert_eq!(decoded.flags, flags & !FLAG_RESERVED_MASK);
        }
    }

    #[test]
    fn single_bit_flip_in_summed_bytes_is_detected() {
        let h = Header::new(3, 4, 5, 6);
        let encoded = h.encode().unwrap();
        for bit_idx in 0..(N_CSUM_BYTES * 8) {
            let byte_idx = bit_idx / 8;
            let bit = 1u8 << (bit_idx % 8);
            let mut corrupt = encoded.clone();
            corrupt[byte_idx] ^= bit;
            assert!(Header::decode(&corrupt, 0).is_err());
        }
    }

    #[test]
    fn body_too_large_is_rejected() {
        let h = Header::new(1, 0, MAX_BODY_LEN + 1, 0);
        assert!(matches!(h.encode(), Err(Error::BodyTooLarge { .. })));
    }

    #[test]
    fn reserved_flag_bits_are_masked_off_on_construction() {
        let h = Header::new(1, 0, 0, 0xff);
        assert_eq!(h.flags, FLAG_SOPEN | FLAG_SCLOSE);
    }

    #[test]
    fn decode_at_nonzero_offset() {
        let h = Header::new(3, 4, 5, 6);
        let encoded = h.encode().unwrap();
        let mut prefixed = Vec::from(b"hi!".as_slice());
        prefixed.extend_from_slice(&encoded);
        let decoded = Header::decode(&prefixed, 3).unwrap();
        assert_eq!(decoded, h);
    }
}
