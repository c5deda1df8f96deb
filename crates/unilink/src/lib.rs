//! Unified byte-stream communication channels over TCP, UDP, and serial.
//!
//! Every transport implements the same [`transport::Channel`] contract —
//! `start`/`stop`/`send`/`send_line` plus connect/data/error callbacks — so
//! application code can hold one behind a `Box<dyn Channel>` and swap the
//! underlying transport without touching call sites. Each transport owns a
//! [`session::Session`], the shared state machine covering backpressure,
//! ordered writes, and close semantics.

pub mod config;
pub mod error;
pub mod framer;
pub mod logging;
pub mod pool;
pub mod reconnect;
pub mod runtime;
pub mod session;
pub mod sync;
pub mod transport;

pub use error::{ErrorCode, ErrorContext, UnilinkError};
pub use session::LinkState;
pub use transport::{Channel, ChannelCallbacks, ConnectionContext};
#[cfg(feature = "serial")]
pub use transport::serial::SerialPortChannel;
pub use transport::tcp_client::TcpClient;
pub use transport::tcp_server::{TcpServer, TcpServerCallbacks};
pub use transport::udp::UdpChannel;
