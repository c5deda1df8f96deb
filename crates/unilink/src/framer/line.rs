//! Delimiter-based line framer.
//!
//! Grounded on `original_source/unilink/framer/line_framer.cc`: the
//! `scanned_index` cursor lets repeated `push_bytes` calls stay amortized
//! O(N) even when a message straddles chunk boundaries, and messages are
//! only erased from the front of the buffer once per call rather than once
//! per delimiter found.

use super::Framer;

pub struct LineFramer {
    delimiter: Vec<u8>,
    include_delimiter: bool,
    max_length: usize,
    buffer: Vec<u8>,
    scanned_index: usize,
}

impl LineFramer {
    /// `delimiter` defaults to `b"\n"` when empty.
    pub fn new(delimiter: &[u8], include_delimiter: bool, max_length: usize) -> Self {
        let delimiter = if delimiter.is_empty() { b"\n".to_vec() } else { delimiter.to_vec() };
        Self { delimiter, include_delimiter, max_length, buffer: Vec::new(), scanned_index: 0 }
    }
}

impl Framer for LineFramer {
    fn push_bytes(&mut self, data: &[u8], on_message: &mut dyn FnMut(&[u8])) {
        if data.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(data);

        let delim_len = self.delimiter.len();
        let search_start = self.scanned_index.saturating_sub(delim_len - 1);

        let mut last_processed_end = 0usize;
        let mut cursor = search_start;

        loop {
            let Some(found_rel) = find_subslice(&self.buffer[cursor..], &self.delimiter) else {
                self.scanned_index = self.buffer.len();
                break;
            };
            let found_pos = cursor + found_rel;
            let msg_end = found_pos + delim_len;
            let msg_total_len = msg_end - last_processed_end;

            if msg_total_len > self.max_length {
                last_processed_end = msg_end;
            } else {
                let extract_len = if self.include_delimiter { msg_total_len } else { msg_total_len - delim_len };
                on_message(&self.buffer[last_processed_end..last_processed_end + extract_len]);
                last_processed_end = msg_end;
            }
            cursor = last_processed_end;
        }

        if last_processed_end > 0 {
            self.buffer.drain(0..last_processed_end);
            self.scanned_index = self.buffer.len();
        }

        if self.buffer.len() > self.max_length {
            self.buffer.clear();
            self.scanned_index = 0;
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.scanned_index = 0;
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(delim: &[u8], include: bool, max_len: usize, chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut framer = LineFramer::new(delim, include, max_len);
        let mut out = Vec::new();
        for chunk in chunks {
            framer.push_bytes(chunk, &mut |msg| out.push(msg.to_vec()));
        }
        out
    }

    #[test]
    fn single_chunk_two_lines() {
        let out = framed(b"\n", false, 1024, &[b"hello\nworld\n"]);
        assert_eq!(out, vec![b"hello".to_vec(), b"world".to_vec()]);
    }

    #[test]
    fn split_across_many_single_byte_chunks() {
        let msg = b"abc\ndef\n";
        let chunks: Vec<&[u8]> = msg.iter().map(std::slice::from_ref).collect();
        let out = framed(b"\n", false, 1024, &chunks);
        assert_eq!(out, vec![b"abc".to_vec(), b"def".to_vec()]);
    }

    #[test]
    fn delimiter_straddling_chunk_boundary_is_still_found() {
        let out = framed(b"\r\n", false, 1024, &[b"abc\r", b"\ndef\r\n"]);
        assert_eq!(out, vec![b"abc".to_vec(), b"def".to_vec()]);
    }

    #[test]
    fn include_delimiter_keeps_it_in_output() {
        let out = framed(b"\n", true, 1024, &[b"x\n"]);
        assert_eq!(out, vec![b"x\n".to_vec()]);
    }

    #[test]
    fn oversized_message_is_dropped_not_emitted() {
        let out = framed(b"\n", false, 3, &[b"toolong\nok\n"]);
        assert_eq!(out, vec![b"ok".to_vec()]);
    }

    #[test]
    fn partial_buffer_exceeding_max_length_resets() {
        let mut framer = LineFramer::new(b"\n", false, 4);
        let mut out: Vec<Vec<u8>> = Vec::new();
        framer.push_bytes(b"12345", &mut |m| out.push(m.to_vec()));
        assert!(out.is_empty());
        framer.push_bytes(b"ok\n", &mut |m| out.push(m.to_vec()));
        assert_eq!(out, vec![b"ok".to_vec()]);
    }

    #[test]
    fn reset_discards_partial_state() {
        let mut framer = LineFramer::new(b"\n", false, 1024);
        let mut out: Vec<Vec<u8>> = Vec::new();
        framer.push_bytes(b"partial", &mut |m| out.push(m.to_vec()));
        framer.reset();
        framer.push_bytes(b"line\n", &mut |m| out.push(m.to_vec()));
        assert_eq!(out, vec![b"line".to_vec()]);
    }

    #[test]
    fn empty_delimiter_defaults_to_newline() {
        let out = framed(b"", false, 1024, &[b"a\nb\n"]);
        assert_eq!(out, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
