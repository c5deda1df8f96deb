//! Transport frontends: the public, polymorphic `Channel` surface.
//!
//! Grounded on `flux_network::tcp::connector`'s `mio::Poll`-driven reactor
//! loop for the event-detection shape; each transport owns its own
//! dedicated reactor thread rather than sharing one process-wide poller,
//! mirroring `ConnectionManager`'s per-`TcpConnector` `Poll` instance.

#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp_client;
pub mod tcp_server;
pub mod udp;

use crate::error::ErrorContext;

/// Context delivered to `on_connect`/`on_disconnect`.
#[derive(Clone, Debug, Default)]
pub struct ConnectionContext {
    pub peer: Option<String>,
    pub client_id: Option<u64>,
}

/// Callback set shared by every transport's public surface.
#[derive(Default)]
pub struct ChannelCallbacks {
    pub on_data: Option<Box<dyn Fn(String) + Send + Sync>>,
    pub on_bytes: Option<Box<dyn Fn(&[u8]) + Send + Sync>>,
    pub on_connect: Option<Box<dyn Fn(ConnectionContext) + Send + Sync>>,
    pub on_disconnect: Option<Box<dyn Fn(ConnectionContext) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(ErrorContext) + Send + Sync>>,
}

/// The contract every transport (TCP client, TCP server, UDP, serial)
/// implements identically at the public API boundary. Dynamic dispatch
/// lives here, not on the hot read/write path.
pub trait Channel: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn is_connected(&self) -> bool;
    fn send(&self, data: &str);
    fn send_line(&self, data: &str) {
        let mut line = String::with_capacity(data.len() + 1);
        line.push_str(data);
        line.push('\n');
        self.send(&line);
    }
}
