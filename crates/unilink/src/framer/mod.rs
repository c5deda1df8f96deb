//! Stream-to-message reassembly.
//!
//! Two framers, grounded on `original_source/unilink/framer/{line_framer,
//! packet_framer}.cc`: a delimiter-based [`line::LineFramer`] and a
//! start/end-pattern [`packet::PacketFramer`]. Both share the same shape —
//! feed bytes in, get complete messages out via callback — captured here as
//! the [`Framer`] trait so transport code can hold either behind one type.

pub mod line;
pub mod packet;

pub use line::LineFramer;
pub use packet::PacketFramer;

/// Incrementally reassembles a byte stream into discrete messages.
pub trait Framer {
    /// Feeds newly-received bytes in, invoking `on_message` once per
    /// complete message recognized (zero or more times per call).
    fn push_bytes(&mut self, data: &[u8], on_message: &mut dyn FnMut(&[u8]));

    /// Drops any partially-accumulated state and returns to the initial
    /// framing state.
    fn reset(&mut self);
}
