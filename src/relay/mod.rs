//! Relay layer
//!
//! Responsibilities:
//! - Move raw bytes between a client endpoint and one upstream target
//! - Attribute forwarded bytes to the proxy's counters
//! - NO content inspection, NO protocol parsing
//!
//! One relay owns one listen socket. A `both` proxy runs a `TcpRelay` and a
//! `UdpRelay` side by side, sharing a single counter.

mod buffer;
mod tcp;
mod udp;

pub use tcp::TcpRelay;
pub use udp::UdpRelay;

use async_trait::async_trait;

use crate::error::Result;

/// A forwarder bound to one listen port and attached to one counter
#[async_trait]
pub trait Relay: Send {
    /// Bind the listen socket and spawn the forwarding loops.
    ///
    /// A bind failure is fatal for the whole process; the supervisor does not
    /// run partial service.
    async fn start(&mut self) -> Result<()>;

    /// Close the listener, signal every loop, and wait for in-flight work to
    /// drain. Safe to call once; blocks until done.
    async fn stop(&mut self);

    /// Name of the proxy this relay accounts against
    fn name(&self) -> &str;
}
