// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Random 16-byte stream identifiers.
//!
//! An [`Identifier`] keys a logical stream in the [`crate::mux`]
//! multiplexer. Generation reads cryptographically-strong randomness and
//! stamps the standard RFC 4122 v4 version/variant bits, though no other
//! UUID semantics (clock sequence, node id) are implied or relied upon —
//! this crate only needs a 16-byte value collision-resistant enough to key
//! a map.

use rand::RngCore;
use std::fmt;

/// A 16-byte opaque stream identifier. Equality is byte-wise.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier([u8; 16]);

impl Identifier {
    /// Generate a new identifier from the system RNG, with version/variant
    /// bits set per RFC 4122 v4 (byte 6 top nibble = `0x4`, byte 8 top two
    /// bits = `0b10`).
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;
        Identifier(bytes)
    }

    /// Wrap a pre-existing 16-byte value without imposing version/variant
    /// bits. Used when decoding an identifier off the wire.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Identifier(bytes)
    }

    /// The raw 16 bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
