use serde::{Deserialize, Serialize};

/// Two-round aggregate signature pair attesting to a block.
///
/// `b1`/`b2` are bitmaps over the committee that produced the block; bit `i`
/// set means member `i` contributed to the corresponding collective
/// signature.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoSignatures {
    pub cs1: String,
    pub b1: Vec<bool>,
    pub cs2: String,
    pub b2: Vec<bool>,
}

impl CoSignatures {
    pub fn new(cs1: String, b1: Vec<bool>, cs2: String, b2: Vec<bool>) -> Self {
        Self { cs1, b1, cs2, b2 }
    }
}

/// Packs a signer bitmap the way it is serialized into signed payloads:
/// a two-byte big-endian bit count followed by the packed bits.
pub fn bitmap_to_bytes(bitmap: &[bool]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + (bitmap.len() + 7) / 8);
    out.extend_from_slice(&(bitmap.len() as u16).to_be_bytes());
    let mut current = 0u8;
    for (i, bit) in bitmap.iter().enumerate() {
        if *bit {
            current |= 1 << (7 - (i % 8));
        }
        if i % 8 == 7 {
            out.push(current);
            current = 0;
        }
    }
    if bitmap.len() % 8 != 0 {
        out.push(current);
    }
    out
}
