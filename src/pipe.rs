// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory buffered byte channel.
//!
//! A [`Pipe`] connects one writer to one reader running concurrently in the
//! same process, guarded by a single [`parking_lot::Mutex`] +
//! [`parking_lot::Condvar`] pair covering both directions (the same idiom
//! this crate's wake-notification ancestor uses for a single flag, here
//! generalized to a byte buffer with sticky close-error state).
//!
//! `write` blocks while the buffer is at capacity; `read` blocks while the
//! buffer is empty and the pipe is open. `close` is idempotent and races
//! harmlessly with both.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

struct State {
    buffer: VecDeque<u8>,
    capacity: usize,
    /// Sticky: once set, stays set. `None` means still open.
    error: Option<Error>,
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
}

/// A synchronous, bounded, in-memory byte channel.
///
/// Obtain a [`PipeReader`]/[`PipeWriter`] pair with [`Pipe::reader`] and
/// [`Pipe::writer`]; both are cheaply `Clone`-able handles to the same
/// underlying channel.
pub struct Pipe {
    shared: Arc<Shared>,
}

impl Pipe {
    /// Create a new pipe with the given buffer capacity in bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Pipe {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffer: VecDeque::with_capacity(capacity.min(64 * 1024)),
                    capacity,
                    error: None,
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    /// A handle to the read side.
    #[must_use]
    pub fn reader(&self) -> PipeReader {
        PipeReader {
            shared: self.shared.clone(),
        }
    }

    /// A handle to the write side.
    #[must_use]
    pub fn writer(&self) -> PipeWriter {
        PipeWriter {
            shared: self.shared.clone(),
        }
    }

    /// Close the pipe with the default `closed` error. Idempotent.
    pub fn close(&self) {
        close_shared(&self.shared, Error::closed("pipe close"));
    }

    /// Close the pipe with a caller-supplied error (e.g. to propagate a
    /// transport failure from a writer thread to a blocked reader).
    pub fn close_with(&self, err: Error) {
        close_shared(&self.shared, err);
    }
}

fn close_shared(shared: &Shared, err: Error) {
    let mut state = shared.state.lock();
    if state.error.is_none() {
        state.error = Some(err);
    }
    drop(state);
    shared.condvar.notify_all();
}

/// The read half of a [`Pipe`].
#[derive(Clone)]
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Read up to `buf.len()` bytes, blocking until at least one byte is
    /// available, the pipe closes, or a prior error has not yet been
    /// surfaced. Returns `Ok(0)` only when `buf` is empty.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            if !state.buffer.is_empty() {
                let n = buf.len().min(state.buffer.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.buffer.pop_front().expect("checked non-empty above");
                }
                drop(state);
                self.shared.condvar.notify_all();
                return Ok(n);
            }
            if let Some(err) = &state.error {
                return Err(err.clone());
            }
            self.shared.condvar.wait(&mut state);
        }
    }

    /// Close the pipe from the reader side (e.g. the consumer gave up).
    pub fn close(&self) {
        close_shared(&self.shared, Error::closed("pipe read"));
    }
}

/// The write half of a [`Pipe`].
#[derive(Clone)]
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Write `buf` to the pipe, blocking while the buffer is at capacity.
    /// Fails with `closed` if the pipe has already been closed.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            if let Some(err) = &state.error {
                return Err(err.clone());
            }
            let capacity = state.capacity;
            if state.buffer.len() < capacity {
                let room = capacity - state.buffer.len();
                let n = buf.len().min(room);
                state.buffer.extend(buf[..n].iter().copied());
                drop(state);
                self.shared.condvar.notify_all();
                return Ok(n);
            }
            self.shared.condvar.wait(&mut state);
        }
    }

    /// Write all of `buf`, looping over partial writes caused by capacity
    /// pressure.
    pub fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Close the pipe with the default `closed` error. Idempotent.
    pub fn close(&self) {
        close_shared(&self.shared, Error::closed("pipe write"));
    }
}

impl io::Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match PipeReader::read(self, buf) {
            Ok(n) => Ok(n),
            Err(err) if err.is_closed() => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

impl io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        PipeWriter::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
