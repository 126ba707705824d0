// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # bytewire - composable byte-stream framing
//!
//! A small stack of transport-agnostic layers for turning an arbitrary
//! `Read + Write` byte stream into self-delimiting, corruption-detecting,
//! multiplexable messages.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bytewire::{Pipe, FrameReader, FrameWriter, Result};
//!
//! fn main() -> Result<()> {
//!     let pipe = Pipe::new(64 * 1024);
//!
//!     let mut framed = FrameWriter::new(pipe.writer());
//!     framed.write_frame(b"hello")?;
//!
//!     let mut reader = FrameReader::new(pipe.reader());
//!     let buf = reader.read_frame()?;
//!     assert_eq!(buf, b"hello");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        Multiplexer (mux)                           |
//! |   n logical streams, flag-tagged frames, serial/concurrent readers  |
//! +---------------------------------------------------------------------+
//! |                         Checksum layer                              |
//! |   hash | length | sequence | body  ->  corruption + reorder detect  |
//! +---------------------------------------------------------------------+
//! |                          Block framer                               |
//! |   ESC-escaped varint-length framing, resynchronizable mid-stream    |
//! +---------------------------------------------------------------------+
//! |                  Pipe (in-memory Read + Write)  /  any transport    |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Pipe`] | In-memory, single producer/consumer byte channel |
//! | [`FrameReader`] / [`FrameWriter`] | Resynchronizable block framing |
//! | [`checksum::ChecksumReader`] / [`checksum::ChecksumWriter`] | Corruption + reorder detection |
//! | [`mux::Multiplexer`] | Stream multiplexing over one framed transport |
//! | [`Identifier`] | 16-byte randomly generated stream identity |
//! | [`Error`] / [`Result`] | Crate-wide error envelope |
//!
//! ## Modules Overview
//!
//! - [`varint`] - 2-bit-size-tag variable-width integer codec
//! - [`pipe`] - in-memory buffered byte channel
//! - [`framer`] - resynchronizable block framing
//! - [`checksum`] - checksummed, sequenced packet layer
//! - [`mux`] - stream multiplexer
//! - [`id`] - random 16-byte identifiers
//! - [`error`] - error envelope
//! - [`config`] - shared safety-ceiling / warning-sink configuration

/// Shared safety-ceiling and warning-sink configuration.
pub mod config;
/// Crate-wide error envelope.
pub mod error;
/// Resynchronizable block framing over `Read`/`Write`.
pub mod framer;
/// Checksummed, sequenced packet layer.
pub mod checksum;
/// Random 16-byte stream identifiers.
pub mod id;
/// Stream multiplexer.
pub mod mux;
/// In-memory buffered byte channel.
pub mod pipe;
/// 2-bit-size-tag variable-width integer codec.
pub mod varint;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use framer::{FrameReader, FrameWriter};
pub use id::Identifier;
pub use mux::Multiplexer;
pub use pipe::Pipe;

/// bytewire version string.
pub const VERSION: &str = "0.1.0";
