// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Checksummed, sequenced packet layer.
//!
//! Wraps each write in a fixed-size header (`hash[hash_size] · length[4]LE ·
//! sequence[2]LE`) followed by the body, so that corruption and packet
//! reordering are detectable independently of the block framer underneath.
//! The hash function is a [`Hasher`] trait object; [`Crc32`] (IEEE 802.3,
//! reflected, poly `0xEDB8_8320`) is the default, following the same
//! table-driven, const-evaluated style as this crate's ancestor's
//! `crc16_ccitt`, generalized from a single fixed algorithm to a pluggable
//! trait since the hash is a parameter of this layer.

use crate::config::Config;
use crate::error::{Error, Result};
use std::io::{Read, Write};

/// A resettable, streaming hash used to authenticate a checksum packet.
///
/// `write` may be called multiple times per packet (length+sequence, then
/// body); `finish_into` must write exactly `hash_size()` bytes.
pub trait Hasher {
    /// Number of bytes this hasher produces.
    fn hash_size(&self) -> usize;
    /// Reset internal state for a new packet.
    fn reset(&mut self);
    /// Feed more bytes into the running hash.
    fn write(&mut self, bytes: &[u8]);
    /// Write the finished hash into `out[..hash_size()]`.
    fn finish_into(&self, out: &mut [u8]);
}

/// CRC-32 (IEEE 802.3), reflected, polynomial `0xEDB8_8320`, the checksum
/// layer's default [`Hasher`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32 {
    state: u32,
}

const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

impl Crc32 {
    /// A freshly initialized CRC-32 state.
    #[must_use]
    pub fn new() -> Self {
        Crc32 { state: 0xFFFF_FFFF }
    }

    /// The one-shot CRC-32 of `data`.
    #[must_use]
    pub fn checksum(data: &[u8]) -> u32 {
        let mut hasher = Crc32::new();
        Hasher::write(&mut hasher, data);
        hasher.state ^ 0xFFFF_FFFF
    }
}

impl Hasher for Crc32 {
    fn hash_size(&self) -> usize {
        4
    }

    fn reset(&mut self) {
        self.state = 0xFFFF_FFFF;
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            let index = ((self.state ^ u32::from(byte)) & 0xFF) as usize;
            self.state = (self.state >> 8) ^ CRC32_TABLE[index];
        }
    }

    fn finish_into(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&(self.state ^ 0xFFFF_FFFF).to_le_bytes());
    }
}

/// Writes checksummed, sequenced packets to an inner [`Write`].
pub struct ChecksumWriter<W, H = Crc32> {
    inner: W,
    hasher: H,
    sequence: u16,
    header: Vec<u8>,
}

impl<W: Write> ChecksumWriter<W, Crc32> {
    /// Wrap `inner` in a checksum layer using the default CRC-32 hasher.
    pub fn new(inner: W) -> Self {
        Self::with_hasher(inner, Crc32::new())
    }
}

impl<W: Write, H: Hasher> ChecksumWriter<W, H> {
    /// Wrap `inner` in a checksum layer using a custom [`Hasher`].
    pub fn with_hasher(inner: W, hasher: H) -> Self {
        let header_len = hasher.hash_size() + 6;
        ChecksumWriter {
            inner,
            hasher,
            sequence: 0,
            header: vec![0u8; header_len],
        }
    }

    /// Write one checksummed packet. A zero-length body still emits a
    /// header (length 0) so the sequence counter advances, but no body
    /// bytes are transmitted.
    pub fn write_packet(&mut self, body: &[u8]) -> Result<()> {
        let hash_size = self.hasher.hash_size();
        let len = u32::try_from(body.len())
            .map_err(|_| Error::too_big("checksum write", body.len(), u32::MAX as usize))?;

        self.header[hash_size..hash_size + 4].copy_from_slice(&len.to_le_bytes());
        self.header[hash_size + 4..hash_size + 6].copy_from_slice(&self.sequence.to_le_bytes());
        self.sequence = self.sequence.wrapping_add(1);

        self.hasher.reset();
        self.hasher.write(&self.header[hash_size..]);
        self.hasher.write(body);
        let (hash_slot, _) = self.header.split_at_mut(hash_size);
        self.hasher.finish_into(hash_slot);

        self.inner
            .write_all(&self.header)
            .map_err(|e| Error::from_io("checksum write", e))?;
        if !body.is_empty() {
            self.inner
                .write_all(body)
                .map_err(|e| Error::from_io("checksum write", e))?;
        }
        Ok(())
    }

    /// Consume the writer, returning the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Presents the checksum layer as a plain byte sink: one [`Write::write`]
/// call becomes one checksummed packet, mirroring how [`crate::framer::FrameWriter`]
/// always issues exactly one inner write per frame. This is what lets a
/// block framer sit directly on top of a checksum layer (spec.md §2's
/// `Multiplexer -> Block framer -> Checksum layer -> transport` stack).
impl<W: Write, H: Hasher> Write for ChecksumWriter<W, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_packet(buf).map_err(Into::into)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Reads checksummed, sequenced packets from an inner [`Read`].
///
/// After any `malformed` error, sequence tracking restarts: the next
/// successfully-read packet is accepted regardless of its sequence number,
/// and becomes the new baseline (spec.md §4.4.2).
pub struct ChecksumReader<R, H = Crc32> {
    inner: R,
    hasher: H,
    config: Config,
    expected_seq: Option<u16>,
    header: Vec<u8>,
    /// Bytes from the most recently decoded packet not yet handed to the
    /// [`Read`] adapter's caller (see the `impl Read` below).
    leftover: Vec<u8>,
    leftover_pos: usize,
}

impl<R: Read> ChecksumReader<R, Crc32> {
    /// Wrap `inner` in a checksum layer using the default CRC-32 hasher and
    /// [`Config`].
    pub fn new(inner: R) -> Self {
        Self::with_hasher(inner, Crc32::new(), Config::default())
    }
}

impl<R: Read, H: Hasher> ChecksumReader<R, H> {
    /// Wrap `inner` in a checksum layer using a custom [`Hasher`] and
    /// [`Config`].
    pub fn with_hasher(inner: R, hasher: H, config: Config) -> Self {
        let header_len = hasher.hash_size() + 6;
        ChecksumReader {
            inner,
            hasher,
            config,
            expected_seq: None,
            header: vec![0u8; header_len],
            leftover: Vec::new(),
            leftover_pos: 0,
        }
    }

    /// Read and verify the next packet, or `None` at a clean end of stream.
    pub fn read_packet(&mut self) -> Result<Option<Vec<u8>>> {
        if !read_exact_or_eof(&mut self.inner, &mut self.header)? {
            return Ok(None);
        }

        let hash_size = self.hasher.hash_size();
        let len = u32::from_le_bytes(self.header[hash_size..hash_size + 4].try_into().unwrap());
        let seq = u16::from_le_bytes(self.header[hash_size + 4..hash_size + 6].try_into().unwrap());

        if len as usize > self.config.too_big {
            self.expected_seq = None;
            return Err(Error::too_big("checksum read", len as usize, self.config.too_big));
        }

        let mismatched_expected = match self.expected_seq {
            Some(expected) if expected != seq => Some(expected),
            _ => None,
        };

        let mut body = vec![0u8; len as usize];
        let filled = read_fully(&mut self.inner, &mut body)?;
        if !filled {
            self.expected_seq = None;
            return Err(Error::malformed("checksum read"));
        }

        if let Some(expected) = mismatched_expected {
            self.expected_seq = None;
            return Err(Error::malformed("checksum read")
                .with_detail(format!("sequence {seq} out of order (expected {expected})")));
        }

        self.hasher.reset();
        self.hasher.write(&self.header[hash_size..]);
        self.hasher.write(&body);
        let mut computed = vec![0u8; hash_size];
        self.hasher.finish_into(&mut computed);
        if computed != self.header[..hash_size] {
            self.expected_seq = None;
            return Err(Error::malformed("checksum read").with_detail("hash mismatch"));
        }

        self.expected_seq = Some(seq.wrapping_add(1));
        Ok(Some(body))
    }

    /// Consume the reader, returning the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Presents the checksum layer as a plain byte source: each underlying
/// packet is decoded in full and served to the caller a chunk at a time,
/// so a block framer (or anything else generic over [`Read`]) can sit
/// directly on top of a checksum layer without knowing about packet
/// boundaries.
impl<R: Read, H: Hasher> Read for ChecksumReader<R, H> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.leftover_pos < self.leftover.len() {
                let n = (self.leftover.len() - self.leftover_pos).min(buf.len());
                buf[..n].copy_from_slice(&self.leftover[self.leftover_pos..self.leftover_pos + n]);
                self.leftover_pos += n;
                return Ok(n);
            }
            match self.read_packet()? {
                Some(packet) => {
                    self.leftover = packet;
                    self.leftover_pos = 0;
                    if self.leftover.is_empty() {
                        continue;
                    }
                }
                None => return Ok(0),
            }
        }
    }
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the stream ended
/// cleanly before any byte was read (no packet in flight). A partial read
/// (stream ends mid-header or mid-body) is `malformed`, not `UnexpectedEof`
/// (spec.md §4.4.2 step 4).
fn read_exact_or_eof<R: Read>(inner: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = inner
            .read(&mut buf[filled..])
            .map_err(|e| Error::from_io("checksum read", e))?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::malformed("checksum read").with_detail("truncated header"));
        }
        filled += n;
    }
    Ok(true)
}

/// Like [`read_exact_or_eof`] but callable once a packet has already been
/// committed to (the header was read in full): any short read is malformed.
fn read_fully<R: Read>(inner: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = inner
            .read(&mut buf[filled..])
            .map_err(|e| Error::from_io("checksum read", e))?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}
