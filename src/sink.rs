// src/sink.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! Streaming data sinks.
//!
//! Response payloads arrive as a sequence of chunks; each one is handed to a
//! [`DataSink`] together with its offset, strictly in order. Outgoing PUT
//! payloads are collected in a [`PendingWriteBuffer`] until the writer sees
//! its end-of-stream flush.

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::error::Result;

/// Receiver for streamed payload chunks.
pub trait DataSink: Send {
    fn handle_data(&mut self, data: &[u8], ofs: u64) -> Result<()>;
}

/// Accumulates every chunk into one contiguous buffer.
#[derive(Debug, Default)]
pub struct BufferSink {
    buf: BytesMut,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// Lossy UTF-8 view, for markup bodies.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

impl DataSink for BufferSink {
    fn handle_data(&mut self, data: &[u8], _ofs: u64) -> Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }
}

/// Counts bytes and drops them.
#[derive(Debug, Default)]
pub struct DiscardSink {
    pub bytes: u64,
}

impl DataSink for DiscardSink {
    fn handle_data(&mut self, data: &[u8], _ofs: u64) -> Result<()> {
        self.bytes += data.len() as u64;
        Ok(())
    }
}

impl DataSink for Vec<u8> {
    fn handle_data(&mut self, data: &[u8], _ofs: u64) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// Shifts offsets by `base` before forwarding, for ranged reads.
pub struct OffsetSink<'a> {
    inner: &'a mut dyn DataSink,
    base: u64,
}

impl<'a> OffsetSink<'a> {
    pub fn new(inner: &'a mut dyn DataSink, base: u64) -> Self {
        Self { inner, base }
    }
}

impl DataSink for OffsetSink<'_> {
    fn handle_data(&mut self, data: &[u8], ofs: u64) -> Result<()> {
        self.inner.handle_data(data, self.base + ofs)
    }
}

/// Outgoing chunks for one PUT, kept in arrival order.
///
/// Offsets are informational: a chunk whose offset does not match the
/// current length is still appended at the end.
#[derive(Debug, Default)]
pub struct PendingWriteBuffer {
    buf: BytesMut,
    chunks: usize,
    out_of_order: usize,
}

impl PendingWriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `offset` did not match the bytes buffered so far.
    pub fn append(&mut self, data: &[u8], offset: u64) -> bool {
        let in_order = offset == self.buf.len() as u64;
        if !in_order {
            self.out_of_order += 1;
            warn!(
                "chunk offset {} does not match buffered length {}; appending in arrival order",
                offset,
                self.buf.len()
            );
        }
        self.buf.extend_from_slice(data);
        self.chunks += 1;
        in_order
    }

    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn out_of_order(&self) -> usize {
        self.out_of_order
    }

    /// Hand the buffered bytes over, leaving the buffer empty.
    pub fn take(&mut self) -> Bytes {
        self.chunks = 0;
        self.buf.split().freeze()
    }
}
