//! Start/end-pattern packet framer.
//!
//! Grounded on `original_source/unilink/framer/packet_framer.cc`: a
//! Sync/Collect state machine, with a fast path for the common case of an
//! empty internal buffer and a non-empty start pattern that scans the
//! incoming span directly instead of copying into the buffer first.

use super::Framer;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Sync,
    Collect,
}

pub struct PacketFramer {
    start_pattern: Vec<u8>,
    end_pattern: Vec<u8>,
    max_length: usize,
    buffer: Vec<u8>,
    state: State,
    scanned_idx: usize,
}

impl PacketFramer {
    /// Panics if both patterns are empty (there would be nothing to frame on).
    pub fn new(start_pattern: &[u8], end_pattern: &[u8], max_length: usize) -> Self {
        assert!(
            !(start_pattern.is_empty() && end_pattern.is_empty()),
            "PacketFramer: start_pattern and end_pattern cannot both be empty"
        );
        Self {
            start_pattern: start_pattern.to_vec(),
            end_pattern: end_pattern.to_vec(),
            max_length,
            buffer: Vec::new(),
            state: State::Sync,
            scanned_idx: 0,
        }
    }

    fn push_bytes_fast_path(&mut self, data: &[u8], on_message: &mut dyn FnMut(&[u8])) -> bool {
        if !(self.buffer.is_empty() && self.state == State::Sync && !self.start_pattern.is_empty()) {
            return false;
        }

        let mut processed_idx = 0usize;
        while processed_idx < data.len() {
            let Some(start_rel) = find(&data[processed_idx..], &self.start_pattern) else {
                if self.start_pattern.len() > 1 {
                    let remaining = data.len() - processed_idx;
                    let keep_len = self.start_pattern.len() - 1;
                    if remaining > keep_len {
                        processed_idx += remaining - keep_len;
                    }
                    self.buffer.extend_from_slice(&data[processed_idx..]);
                }
                return true;
            };
            let start_idx = processed_idx + start_rel;

            if self.end_pattern.is_empty() {
                let packet_len = self.start_pattern.len();
                on_message(&data[start_idx..start_idx + packet_len]);
                processed_idx = start_idx + packet_len;
                continue;
            }

            let search_from = start_idx + self.start_pattern.len();
            let Some(end_rel) = find(&data[search_from..], &self.end_pattern) else {
                self.buffer.extend_from_slice(&data[start_idx..]);
                self.state = State::Collect;
                self.scanned_idx = self.buffer.len();
                if self.buffer.len() > self.max_length {
                    self.buffer.clear();
                    self.state = State::Sync;
                    self.scanned_idx = 0;
                }
                return true;
            };
            let end_idx = search_from + end_rel;
            let packet_len = (end_idx - start_idx) + self.end_pattern.len();

            if packet_len <= self.max_length {
                on_message(&data[start_idx..start_idx + packet_len]);
            }
            processed_idx = start_idx + packet_len;
        }
        true
    }
}

impl Framer for PacketFramer {
    fn push_bytes(&mut self, data: &[u8], on_message: &mut dyn FnMut(&[u8])) {
        if data.is_empty() {
            return;
        }

        if self.push_bytes_fast_path(data, on_message) {
            return;
        }

        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                State::Sync => {
                    if self.start_pattern.is_empty() {
                        self.state = State::Collect;
                        continue;
                    }
                    match find(&self.buffer, &self.start_pattern) {
                        Some(pos) => {
                            if pos > 0 {
                                self.buffer.drain(0..pos);
                            }
                            self.state = State::Collect;
                            self.scanned_idx = self.start_pattern.len();
                        }
                        None => {
                            if self.start_pattern.len() > 1 {
                                let keep_len = self.start_pattern.len() - 1;
                                if self.buffer.len() > keep_len {
                                    let drop_to = self.buffer.len() - keep_len;
                                    self.buffer.drain(0..drop_to);
                                }
                            } else {
                                self.buffer.clear();
                            }
                            break;
                        }
                    }
                }
                State::Collect => {
                    if self.end_pattern.is_empty() {
                        let packet_len = self.start_pattern.len();
                        on_message(&self.buffer[..packet_len]);
                        if self.buffer.is_empty() {
                            return;
                        }
                        self.buffer.drain(0..packet_len);
                        self.state = State::Sync;
                        continue;
                    }

                    let mut search_offset = self.start_pattern.len().max(self.scanned_idx);
                    if search_offset > self.start_pattern.len() {
                        let overlap = self.end_pattern.len().saturating_sub(1);
                        search_offset = search_offset.saturating_sub(overlap);
                    }
                    if search_offset < self.start_pattern.len() {
                        search_offset = self.start_pattern.len();
                    }
                    if self.buffer.len() < search_offset {
                        break;
                    }

                    match find(&self.buffer[search_offset..], &self.end_pattern) {
                        Some(rel) => {
                            let packet_len = search_offset + rel + self.end_pattern.len();
                            if packet_len <= self.max_length {
                                on_message(&self.buffer[..packet_len]);
                            }
                            if self.buffer.is_empty() {
                                return;
                            }
                            self.buffer.drain(0..packet_len);
                            self.state = State::Sync;
                            self.scanned_idx = 0;
                        }
                        None => {
                            self.scanned_idx = self.buffer.len();
                            if self.buffer.len() > self.max_length {
                                self.buffer.clear();
                                self.state = State::Sync;
                                self.scanned_idx = 0;
                            }
                            break;
                        }
                    }
                }
            }
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::Sync;
        self.scanned_idx = 0;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(start: &[u8], end: &[u8], max_len: usize, chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut framer = PacketFramer::new(start, end, max_len);
        let mut out = Vec::new();
        for chunk in chunks {
            framer.push_bytes(chunk, &mut |msg| out.push(msg.to_vec()));
        }
        out
    }

    #[test]
    fn single_packet_in_one_chunk() {
        let out = framed(b"\x02", b"\x03", 64, &[b"\x02hello\x03"]);
        assert_eq!(out, vec![b"\x02hello\x03".to_vec()]);
    }

    #[test]
    fn garbage_before_start_pattern_is_discarded() {
        let out = framed(b"\x02", b"\x03", 64, &[b"junk\x02hi\x03"]);
        assert_eq!(out, vec![b"\x02hi\x03".to_vec()]);
    }

    #[test]
    fn packet_split_across_chunks_reassembles() {
        let out = framed(b"\x02", b"\x03", 64, &[b"\x02he", b"llo\x03"]);
        assert_eq!(out, vec![b"\x02hello\x03".to_vec()]);
    }

    #[test]
    fn back_to_back_packets_in_one_chunk() {
        let out = framed(b"\x02", b"\x03", 64, &[b"\x02a\x03\x02b\x03"]);
        assert_eq!(out, vec![b"\x02a\x03".to_vec(), b"\x02b\x03".to_vec()]);
    }

    #[test]
    fn oversized_packet_is_discarded() {
        let out = framed(b"\x02", b"\x03", 3, &[b"\x02toolong\x03\x02ok\x03"]);
        assert_eq!(out, vec![b"\x02ok\x03".to_vec()]);
    }

    #[test]
    fn start_pattern_only_with_no_end_pattern() {
        let out = framed(b"\x02", b"", 64, &[b"\x02\x02\x02"]);
        assert_eq!(out, vec![vec![0x02], vec![0x02], vec![0x02]]);
    }

    #[test]
    fn reset_drops_partial_collect_state() {
        let mut framer = PacketFramer::new(b"\x02", b"\x03", 64);
        let mut out: Vec<Vec<u8>> = Vec::new();
        framer.push_bytes(b"\x02partial", &mut |m| out.push(m.to_vec()));
        assert!(out.is_empty());
        framer.reset();
        framer.push_bytes(b"\x02full\x03", &mut |m| out.push(m.to_vec()));
        assert_eq!(out, vec![b"\x02full\x03".to_vec()]);
    }

    #[test]
    fn fast_path_is_taken_when_buffer_empty_and_start_pattern_present() {
        let out = framed(b"AB", b"CD", 64, &[b"ABdataCDABmoreCD"]);
        assert_eq!(out, vec![b"ABdataCD".to_vec(), b"ABmoreCD".to_vec()]);
    }
}
