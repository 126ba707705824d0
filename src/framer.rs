// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Resynchronizable block framing.
//!
//! Wraps a payload as `ESC · varint_length · escaped_body` where `ESC = 23`.
//! Any occurrence of `ESC` inside the length or body region is doubled to
//! `ESC · 0` on the wire; `0` can never be a legitimate byte immediately
//! after a frame-start `ESC` (see [`crate::varint`]), so a reader can enter
//! the byte stream at an arbitrary position, discard bytes until it finds
//! `ESC` followed by something other than `0`, and recover complete,
//! correctly-bounded payloads from there on.
//!
//! [`FrameWriter`] emits exactly one inner `write_all` call per frame so
//! that independent framers interleaving writes onto a shared transport
//! never tear a frame in half. [`FrameReader`] is a record-oriented reader:
//! [`FrameReader::read_frame`] returns one payload (or `None` at a clean
//! end of stream).

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::varint;
use std::io::{Read, Write};

/// The escape byte marking the start of a frame.
pub const ESC: u8 = 23;

const READ_CHUNK: usize = 4096;

/// Writes length-framed, escape-delimited payloads to an inner [`Write`].
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    scratch: Vec<u8>,
    /// Frames written so far (zero-length writes don't count; they emit no frame).
    pub frames_written: u64,
    /// Bytes written to the inner writer so far, including framing overhead.
    pub bytes_written: u64,
}

impl<W: Write> FrameWriter<W> {
    /// Wrap `inner` in a block framer.
    pub fn new(inner: W) -> Self {
        FrameWriter {
            inner,
            scratch: Vec::with_capacity(256),
            frames_written: 0,
            bytes_written: 0,
        }
    }

    /// Frame and write one payload. A zero-length payload emits no frame at all.
    pub fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        if payload.len() as u64 > u64::from(varint::MAX_VALUE) {
            return Err(Error::too_big(
                "frame write",
                payload.len(),
                varint::MAX_VALUE as usize,
            ));
        }

        self.scratch.clear();
        self.scratch.push(ESC);

        let mut len_buf = [0u8; 4];
        let len_n = varint::encode(payload.len() as u32, &mut len_buf);
        escape_into(&mut self.scratch, &len_buf[..len_n]);
        escape_into(&mut self.scratch, payload);

        self.inner
            .write_all(&self.scratch)
            .map_err(|e| Error::from_io("frame write", e))?;

        self.frames_written += 1;
        self.bytes_written += self.scratch.len() as u64;
        Ok(())
    }

    /// Consume the framer, returning the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn escape_into(out: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        out.push(b);
        if b == ESC {
            out.push(0);
        }
    }
}

/// Reads length-framed, escape-delimited payloads from an inner [`Read`],
/// resynchronizing to the next frame boundary on first use or after entering
/// the stream mid-payload.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    config: Config,
    lookahead: Vec<u8>,
    lookahead_pos: usize,
    /// Frames successfully decoded so far.
    pub frames_read: u64,
    /// Payload bytes delivered to the caller so far (excludes framing overhead).
    pub bytes_read: u64,
}

impl<R: Read> FrameReader<R> {
    /// Wrap `inner` in a block reader using the default [`Config`] (128 MiB
    /// ceiling on 64-bit hosts, 32 MiB on 32-bit).
    pub fn new(inner: R) -> Self {
        Self::with_config(inner, Config::default())
    }

    /// Wrap `inner` in a block reader with an explicit [`Config`].
    pub fn with_config(inner: R, config: Config) -> Self {
        FrameReader {
            inner,
            config,
            lookahead: Vec::new(),
            lookahead_pos: 0,
            frames_read: 0,
            bytes_read: 0,
        }
    }

    /// Read and return the next payload, or `None` at a clean end of stream
    /// (no partial frame in flight).
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(first_header_byte) = self.resync()? else {
            return Ok(None);
        };

        let len = self.read_length(first_header_byte)?;
        if len as usize > self.config.too_big {
            return Err(Error::too_big("frame read", len as usize, self.config.too_big));
        }

        let mut body = Vec::with_capacity(len as usize);
        for _ in 0..len {
            body.push(self.read_logical_byte_committed()?);
        }

        self.frames_read += 1;
        self.bytes_read += body.len() as u64;
        Ok(Some(body))
    }

    /// Resync protocol (spec 4.3.2 steps 1-2): discard bytes until `ESC`
    /// followed by a non-`0` byte is found, returning the true (unescaped)
    /// first header byte. `Ok(None)` means the stream ended before any
    /// frame start was found — a clean end of stream, not an error.
    fn resync(&mut self) -> Result<Option<u8>> {
        let Some(mut byte0) = self.read_byte()? else {
            return Ok(None);
        };
        let byte1;
        loop {
            let Some(b) = self.read_byte()? else {
                return Ok(None);
            };
            if byte0 == ESC && b != 0 {
                byte1 = b;
                break;
            }
            byte0 = b;
        }

        if byte1 == ESC {
            // The true header byte is itself ESC, written as the escaped
            // pair `ESC . 0`; confirm the trailing 0 and report ESC.
            match self.read_byte()? {
                Some(0) => Ok(Some(ESC)),
                Some(_) => Err(Error::malformed("frame resync")),
                None => Err(Error::new(ErrorKind::UnexpectedEof, "frame resync")),
            }
        } else {
            Ok(Some(byte1))
        }
    }

    /// Decode the varint length header, given its already-unescaped first
    /// logical byte.
    fn read_length(&mut self, first_byte: u8) -> Result<u32> {
        let tag = first_byte & 0b11;
        if tag == 0 {
            return Ok(u32::from(first_byte >> 2));
        }
        let mut bytes = [first_byte, 0, 0, 0];
        for slot in bytes.iter_mut().take(tag as usize + 1).skip(1) {
            *slot = self.read_logical_byte_committed()?;
        }
        let tagged = u32::from_le_bytes(bytes);
        Ok(tagged >> 2)
    }

    /// Read one logical (post-unescaping) byte from the committed region
    /// (length tail or body). Any `ESC` byte here must be followed by a
    /// confirming `0`; running out of input here is `unexpected EOF`, since
    /// a frame start has already been committed to.
    fn read_logical_byte_committed(&mut self) -> Result<u8> {
        let b = self
            .read_byte()?
            .ok_or_else(|| Error::new(ErrorKind::UnexpectedEof, "frame read"))?;
        if b == ESC {
            match self.read_byte()? {
                Some(0) => Ok(ESC),
                Some(_) => Err(Error::malformed("frame read")),
                None => Err(Error::new(ErrorKind::UnexpectedEof, "frame read")),
            }
        } else {
            Ok(b)
        }
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        if self.lookahead_pos == self.lookahead.len() {
            self.lookahead.resize(READ_CHUNK, 0);
            let n = self
                .inner
                .read(&mut self.lookahead)
                .map_err(|e| Error::from_io("frame read", e))?;
            if n == 0 {
                self.lookahead.clear();
                self.lookahead_pos = 0;
                return Ok(None);
            }
            self.lookahead.truncate(n);
            self.lookahead_pos = 0;
        }
        let b = self.lookahead[self.lookahead_pos];
        self.lookahead_pos += 1;
        Ok(Some(b))
    }

    /// Consume the reader, returning the inner reader and any buffered
    /// lookahead bytes not yet consumed.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(payload: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        FrameWriter::new(&mut wire).write_frame(payload).unwrap();
        let mut reader = FrameReader::new(Cursor::new(wire));
        reader.read_frame().unwrap().unwrap()
    }

    #[test]
    fn single_frame_matches_spec_example() {
        let payload = [0x17, 0x00, 0x17, 0xFF, 0x17];
        let mut wire = Vec::new();
        FrameWriter::new(&mut wire).write_frame(&payload).unwrap();
        assert_eq!(
            wire,
            vec![0x17, 0x14, 0x17, 0x00, 0x00, 0x17, 0x00, 0xFF, 0x17, 0x00]
        );
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert_eq!(reader.read_frame().unwrap().unwrap(), payload);
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn round_trip_random_sizes() {
        for _ in 0..200 {
            let len = fastrand::usize(1..=100_000);
            let payload: Vec<u8> = (0..len).map(|_| fastrand::u8(..)).collect();
            assert_eq!(round_trip(&payload), payload);
        }
    }

    #[test]
    fn zero_length_write_emits_no_frame() {
        let mut wire = Vec::new();
        let mut writer = FrameWriter::new(&mut wire);
        writer.write_frame(&[]).unwrap();
        writer.write_frame(b"x").unwrap();
        assert_eq!(writer.frames_written, 1);
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert_eq!(reader.read_frame().unwrap().unwrap(), b"x");
    }

    #[test]
    fn mid_stream_join_recovers_second_frame() {
        let mut wire = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut wire);
            writer.write_frame(b"first-frame-payload").unwrap();
            writer.write_frame(b"second").unwrap();
        }
        let k = fastrand::usize(1..wire.len() - 1);
        let tail = wire[k..].to_vec();
        let mut reader = FrameReader::new(Cursor::new(tail));
        // The resync may or may not recover a truncated first frame,
        // but it must always recover the intact final frame.
        let mut last = None;
        loop {
            match reader.read_frame() {
                Ok(Some(payload)) => last = Some(payload),
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        assert_eq!(last.unwrap(), b"second");
    }

    #[test]
    fn multiple_framers_interleave_preserving_per_producer_order() {
        let mut a_wire = Vec::new();
        let mut b_wire = Vec::new();
        {
            let mut a = FrameWriter::new(&mut a_wire);
            let mut b = FrameWriter::new(&mut b_wire);
            for i in 0..20u32 {
                a.write_frame(format!("a{i}").as_bytes()).unwrap();
                b.write_frame(format!("b{i}").as_bytes()).unwrap();
            }
        }
        let mut combined = Vec::new();
        combined.extend_from_slice(&a_wire);
        combined.extend_from_slice(&b_wire);
        let mut reader = FrameReader::new(Cursor::new(combined));
        for i in 0..20u32 {
            assert_eq!(reader.read_frame().unwrap().unwrap(), format!("a{i}").as_bytes());
        }
        for i in 0..20u32 {
            assert_eq!(reader.read_frame().unwrap().unwrap(), format!("b{i}").as_bytes());
        }
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn too_big_length_is_rejected() {
        let mut wire = Vec::new();
        FrameWriter::new(&mut wire).write_frame(&vec![0u8; 2000]).unwrap();
        let mut reader = FrameReader::with_config(Cursor::new(wire), Config::with_too_big(1000));
        let err = reader.read_frame().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TooBig);
    }
}
