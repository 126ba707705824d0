// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-module scenarios from spec.md §8 that exercise more than one
//! layer at once: a real writer thread and reader thread sharing a
//! [`bytewire::Pipe`], stacking the checksum layer, the block framer, and
//! the multiplexer the way a real caller would rather than feeding each
//! layer a pre-built in-memory buffer.

use bytewire::checksum::{ChecksumReader, ChecksumWriter};
use bytewire::mux::MultiplexReader;
use bytewire::{Identifier, Multiplexer, Pipe};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

/// spec.md §8 scenario 6: a writer writes 100 checksum-framed payloads with
/// random delays up to 10ms, closing the pipe after the last write; a
/// concurrent reader drains packets until `closed`, and the total bytes
/// received must equal the total bytes written.
#[test]
fn pipe_shutdown_drains_all_checksummed_payloads() {
    let pipe = Pipe::new(4096);
    let writer_side = pipe.writer();
    let reader_side = pipe.reader();

    let payloads: Vec<Vec<u8>> = (0..100)
        .map(|_| {
            let len = fastrand::usize(1..=500);
            (0..len).map(|_| fastrand::u8(..)).collect()
        })
        .collect();
    let total_written: usize = payloads.iter().map(Vec::len).sum();

    let writer_payloads = payloads.clone();
    let writer = thread::spawn(move || {
        let mut checksum = ChecksumWriter::new(writer_side);
        for payload in &writer_payloads {
            checksum.write_packet(payload).unwrap();
            thread::sleep(Duration::from_millis(fastrand::u64(0..10)));
        }
        checksum.into_inner().close();
    });

    let mut checksum = ChecksumReader::new(reader_side);
    let mut received = Vec::new();
    let mut total_read = 0usize;
    loop {
        match checksum.read_packet() {
            Ok(Some(body)) => {
                total_read += body.len();
                received.push(body);
            }
            Ok(None) => break,
            Err(err) => {
                assert!(err.is_closed(), "unexpected error: {err}");
                break;
            }
        }
    }

    writer.join().unwrap();
    assert_eq!(total_read, total_written);
    assert_eq!(received, payloads);
}

/// spec.md §8 scenario 5, run over a real [`Pipe`] transport with the
/// checksum layer also in the stack (spec.md §2's full
/// `Multiplexer -> Block framer -> Checksum layer -> transport` column):
/// opening all of a producer's streams lets a consumer read each stream's
/// payloads in order with no cross-stream contamination.
#[test]
fn multiplex_over_checksum_over_pipe_isolates_streams() {
    let pipe = Pipe::new(16 * 1024);
    let mux = Multiplexer::new(ChecksumWriter::new(pipe.writer()));
    let demux = MultiplexReader::new(ChecksumReader::new(pipe.reader()));

    const STREAMS: usize = 12;
    const PAYLOADS_PER_STREAM: usize = 40;

    let ids: Vec<Identifier> = (0..STREAMS).map(|_| Identifier::generate()).collect();
    let expected: HashMap<Identifier, Vec<Vec<u8>>> = ids
        .iter()
        .map(|&id| {
            let payloads = (0..PAYLOADS_PER_STREAM)
                .map(|_| {
                    let len = fastrand::usize(1..=80);
                    (0..len).map(|_| fastrand::u8(..)).collect()
                })
                .collect();
            (id, payloads)
        })
        .collect();

    let writer_ids = ids.clone();
    let writer_expected = expected.clone();
    let writer = thread::spawn(move || {
        let writers: Vec<_> = writer_ids.iter().map(|&id| mux.open_stream(id)).collect();
        for (handle, id) in writers.iter().zip(&writer_ids) {
            for payload in &writer_expected[id] {
                handle.write(payload).unwrap();
            }
        }
    });

    let mut readers: Vec<_> = ids.iter().map(|&id| (id, demux.open(id).unwrap())).collect();
    for (id, reader) in &mut readers {
        for expected_payload in &expected[id] {
            let mut buf = vec![0u8; expected_payload.len()];
            let mut got = 0;
            while got < buf.len() {
                got += reader.read(&mut buf[got..]).unwrap();
            }
            assert_eq!(&buf, expected_payload, "stream {id} payload mismatch");
        }
    }

    writer.join().unwrap();
}
