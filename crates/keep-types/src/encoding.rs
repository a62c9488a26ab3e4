//! Deterministic binary encoding used for signature hashes.
//!
//! Both parties sign the BLAKE2b-256 digest of a revision's canonical
//! encoding, so the byte layout is part of the protocol: little-endian
//! integers, u64 length prefixes on lists, fixed-size arrays raw.

use crate::hash::Hash256;

/// Accumulates the canonical encoding of a value and produces its digest.
pub struct Encoder {
    state: blake2b_simd::State,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            state: blake2b_simd::Params::new().hash_length(32).to_state(),
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.state.update(bytes);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.state.update(&value.to_le_bytes());
    }

    pub fn write_u128(&mut self, value: u128) {
        self.state.update(&value.to_le_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.state.update(&[value as u8]);
    }

    /// Length prefix for a list; the caller encodes the elements.
    pub fn write_len(&mut self, len: usize) {
        self.write_u64(len as u64);
    }

    pub fn finalize(self) -> Hash256 {
        let digest = self.state.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_bytes());
        Hash256(out)
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// A value with a canonical binary encoding.
pub trait Encode {
    fn encode_to(&self, e: &mut Encoder);

    /// Digest of the canonical encoding.
    fn digest(&self) -> Hash256 {
        let mut e = Encoder::new();
        self.encode_to(&mut e);
        e.finalize()
    }
}
