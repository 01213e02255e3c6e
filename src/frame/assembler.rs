//! Incremental frame extraction over a growing receive buffer.
//!
//! Serial reads arrive in arbitrary slices. The assembler accumulates them, cuts
//! `089...980` candidates out of the buffer and hands each to the codec. It never blocks:
//! a frame whose end marker has not arrived yet simply stays in the buffer until the
//! next [`FrameAssembler::feed`].
//!
//! Resynchronisation rules:
//! - bytes before the first start marker are garbage and are dropped;
//! - the first end marker after the start marker closes the candidate, valid or not;
//! - the buffer is capped; on overflow only the tail from the last start marker survives.
use bytes::{Buf, BytesMut};
use log::{debug, warn};

use super::codec::{self, FrameFields, END_MARKER, START_MARKER};
use crate::logutil::escape_log;

/// Upper bound on buffered, not-yet-consumed bytes.
pub const MAX_BUFFER_BYTES: usize = 64 * 1024;

/// A successfully decoded frame together with its wire text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    pub raw: String,
    pub fields: FrameFields,
}

pub struct FrameAssembler {
    buf: BytesMut,
    limit: usize,
    // Offset at which the end-marker search resumes; avoids rescanning a long partial.
    end_scan_from: usize,
    accepted: u64,
    rejected: u64,
    overflows: u64,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_limit(MAX_BUFFER_BYTES)
    }

    /// Assembler with a custom buffer ceiling (never below one marker).
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            limit: limit.max(START_MARKER.len()),
            end_scan_from: START_MARKER.len(),
            accepted: 0,
            rejected: 0,
            overflows: 0,
        }
    }

    /// Append a chunk and return every frame that became complete, in stream order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<AssembledFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.buf, START_MARKER) else {
                self.keep_marker_prefix();
                break;
            };
            if start > 0 {
                self.buf.advance(start);
                self.end_scan_from = START_MARKER.len();
            }

            let search_from = self.end_scan_from.min(self.buf.len());
            let Some(rel) = find(&self.buf[search_from..], END_MARKER) else {
                // Partial frame: resume later just before the tail that may hold a split marker
                self.end_scan_from = self
                    .buf
                    .len()
                    .saturating_sub(END_MARKER.len() - 1)
                    .max(START_MARKER.len());
                break;
            };
            let end = search_from + rel + END_MARKER.len();
            let candidate = self.buf.split_to(end);
            let terminators = self
                .buf
                .iter()
                .take_while(|b| matches!(b, b'\r' | b'\n'))
                .count();
            self.buf.advance(terminators);
            self.end_scan_from = START_MARKER.len();

            let raw = String::from_utf8_lossy(&candidate).into_owned();
            match codec::try_decode(&raw) {
                Ok(fields) => {
                    self.accepted += 1;
                    frames.push(AssembledFrame { raw, fields });
                }
                Err(e) => {
                    self.rejected += 1;
                    debug!("Dropping candidate frame '{}': {}", escape_log(&raw), e);
                }
            }
        }

        self.enforce_limit();
        frames
    }

    /// Forget everything buffered (used when the underlying connection is replaced).
    pub fn clear(&mut self) {
        self.buf.clear();
        self.end_scan_from = START_MARKER.len();
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// No start marker anywhere: keep only a tail that could still grow into one.
    fn keep_marker_prefix(&mut self) {
        let keep = (1..START_MARKER.len())
            .rev()
            .find(|&n| self.buf.len() >= n && self.buf.ends_with(&START_MARKER[..n]))
            .unwrap_or(0);
        let drop = self.buf.len() - keep;
        self.buf.advance(drop);
        self.end_scan_from = START_MARKER.len();
    }

    fn enforce_limit(&mut self) {
        if self.buf.len() <= self.limit {
            return;
        }
        self.overflows += 1;
        let before = self.buf.len();
        match rfind(&self.buf, START_MARKER) {
            Some(pos) if before - pos <= self.limit => self.buf.advance(pos),
            _ => self.buf.clear(),
        }
        self.end_scan_from = START_MARKER.len();
        warn!(
            "Receive buffer overflow ({} bytes > {}), discarded {} bytes",
            before,
            self.limit,
            before - self.buf.len()
        );
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
