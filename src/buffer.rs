// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-connection byte buffer with two-ended append and delimiter framing.

/// Default initial capacity of a [`Buffer`].
pub const INITIAL_BUFFER_CAPACITY: usize = 1024;

/// An ordered byte sequence with amortized O(1) tail append, O(n) head
/// append, and delimiter-bounded extraction.
///
/// Not safe for concurrent mutation; each connection's two buffers are only
/// touched by the reactor thread that owns the connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Buffer {
    buf: Vec<u8>,
}

impl Buffer {
    /// Creates an empty buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_BUFFER_CAPACITY)
    }

    /// Creates an empty buffer with at least `capacity` bytes reserved.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Appends bytes at the tail. Accepts byte slices and string data alike.
    pub fn append(&mut self, data: impl AsRef<[u8]>) {
        self.buf.extend_from_slice(data.as_ref());
    }

    /// Inserts bytes at the head, shifting existing contents back.
    pub fn append_head(&mut self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        self.buf.splice(0..0, data.iter().copied());
    }

    /// Pops and returns the prefix up to and including the first occurrence
    /// of `delim`, or `None` (leaving the buffer unchanged) when the
    /// delimiter is absent. Never returns a partial match; pipelined frames
    /// are popped one per call.
    pub fn find_and_pop_until(&mut self, delim: &[u8]) -> Option<Vec<u8>> {
        if delim.is_empty() {
            return None;
        }
        let pos = self.buf.windows(delim.len()).position(|w| w == delim)?;
        let mut rest = self.buf.split_off(pos + delim.len());
        std::mem::swap(&mut self.buf, &mut rest);
        Some(rest)
    }

    /// Borrows the full contents without copying. The borrow must not
    /// outlive the next mutation.
    pub fn view(&self) -> &[u8] {
        &self.buf
    }

    /// Number of bytes currently stored.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drops all contents. Capacity may be retained.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_prefix_including_delimiter() {
        let mut buffer = Buffer::new();
        buffer.append("header\r\nbody");
        let popped = buffer.find_and_pop_until(b"\r\n").unwrap();
        assert_eq!(popped, b"header\r\n");
        assert_eq!(buffer.view(), b"body");
    }

    #[test]
    fn absent_delimiter_leaves_buffer_unchanged() {
        let mut buffer = Buffer::new();
        buffer.append("no delimiter here");
        assert!(buffer.find_and_pop_until(b"\r\n").is_none());
        assert_eq!(buffer.view(), b"no delimiter here");
    }

    #[test]
    fn pipelined_frames_pop_in_order() {
        let mut buffer = Buffer::new();
        buffer.append("A\nB\nC\n");
        assert_eq!(buffer.find_and_pop_until(b"\n").unwrap(), b"A\n");
        assert_eq!(buffer.find_and_pop_until(b"\n").unwrap(), b"B\n");
        assert_eq!(buffer.find_and_pop_until(b"\n").unwrap(), b"C\n");
        assert!(buffer.find_and_pop_until(b"\n").is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn delimiter_at_the_very_end() {
        let mut buffer = Buffer::new();
        buffer.append(b"payload|".as_slice());
        assert_eq!(buffer.find_and_pop_until(b"|").unwrap(), b"payload|");
        assert!(buffer.is_empty());
    }

    #[test]
    fn head_append_orders_before_existing_bytes() {
        let mut buffer = Buffer::new();
        buffer.append("body");
        buffer.append_head("head ");
        assert_eq!(buffer.view(), b"head body");
    }

    #[test]
    fn clear_empties_contents() {
        let mut buffer = Buffer::new();
        buffer.append([1u8, 2, 3]);
        assert_eq!(buffer.len(), 3);
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn binary_data_round_trips() {
        let mut buffer = Buffer::new();
        buffer.append([0u8, 159, 146, 150]);
        buffer.append("text");
        assert_eq!(buffer.view(), &[0u8, 159, 146, 150, b't', b'e', b'x', b't']);
    }
}
