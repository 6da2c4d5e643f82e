//! Chunked byte queue used for per-channel read buffers and pending-write queues

use std::collections::VecDeque;

/// Append-only byte queue over discrete chunks.
///
/// Producers append whole chunks; consumers take bytes from the front without
/// the backlog ever being copied into one contiguous allocation. The head chunk
/// may be partially consumed, tracked by `head_offset`.
///
/// Invariant: `size == sum(chunk lengths) - head_offset`.
#[derive(Debug, Default, Clone)]
pub struct MemBuffer {
    chunks: VecDeque<Vec<u8>>,
    head_offset: usize,
    size: usize,
}

impl MemBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unconsumed bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Queue a chunk at the back. Empty chunks are ignored.
    pub fn append(&mut self, chunk: impl Into<Vec<u8>>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.size += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Unconsumed part of the head chunk
    pub fn front(&self) -> Option<&[u8]> {
        self.chunks.front().map(|c| &c[self.head_offset..])
    }

    /// Consume `n` bytes from the front, copying them into `sink` when given.
    ///
    /// Fails without touching the buffer if fewer than `n` bytes are queued.
    pub fn consume(&mut self, n: usize, mut sink: Option<&mut Vec<u8>>) -> bool {
        if n > self.size {
            return false;
        }

        let mut remaining = n;
        while remaining > 0 {
            let Some(head) = self.chunks.front() else {
                break;
            };
            let available = head.len() - self.head_offset;
            let take = available.min(remaining);

            if let Some(out) = sink.as_deref_mut() {
                out.extend_from_slice(&head[self.head_offset..self.head_offset + take]);
            }

            remaining -= take;
            if take == available {
                self.chunks.pop_front();
                self.head_offset = 0;
            } else {
                self.head_offset += take;
            }
        }

        self.size -= n;
        true
    }

    /// Remove and return `n` bytes, or `None` if fewer are queued
    pub fn take(&mut self, n: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        self.consume(n, Some(&mut out)).then_some(out)
    }

    /// Drop `n` bytes from the front
    pub fn discard(&mut self, n: usize) -> bool {
        self.consume(n, None)
    }

    /// Remove and return everything queued
    pub fn take_all(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        self.consume(self.size, Some(&mut out));
        out
    }

    /// Look for a complete line without consuming it.
    ///
    /// A line ends at `'\n'` or at an embedded NUL byte. On success `out` holds
    /// the line without its terminator; the caller consumes `out.len() + 1`
    /// bytes separately. On failure `out` is left empty.
    pub fn scan_line(&self, out: &mut Vec<u8>) -> bool {
        out.clear();

        let mut offset = self.head_offset;
        for chunk in &self.chunks {
            let slice = &chunk[offset..];
            offset = 0;

            match slice.iter().position(|&b| b == b'\n' || b == 0) {
                Some(end) => {
                    out.extend_from_slice(&slice[..end]);
                    return true;
                }
                None => out.extend_from_slice(slice),
            }
        }

        out.clear();
        false
    }

    /// Push a single byte back onto the front
    pub fn unconsume(&mut self, byte: u8) {
        if self.head_offset > 0 {
            self.head_offset -= 1;
            if let Some(head) = self.chunks.front_mut() {
                head[self.head_offset] = byte;
            }
        } else {
            self.chunks.push_front(vec![byte]);
        }
        self.size += 1;
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.head_offset = 0;
        self.size = 0;
    }
}
