//! relaymeter - a multi-proxy TCP/UDP forwarder with per-proxy traffic accounting
//!
//! # Architecture
//!
//! ```text
//! Config (YAML)
//!   → Runtime (supervisor)
//!       → TcpRelay / UdpRelay ── forwarded bytes ──▶ ProxyStats
//!       → Persistence (atomic JSON snapshots of the registry)
//!       → ApiServer (read-only HTTP: /health, /api/stats)
//! ```
//!
//! ## Core Principles
//!
//! - The data plane never takes a lock: counters are atomics, shared via `Arc`
//! - Every long-running task observes a shutdown signal; `stop` drains work
//! - Counters survive restarts through tmp-then-rename snapshots
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── config.rs    # YAML configuration
//! ├── error.rs     # Error type and Result alias
//! ├── stats/       # Counters, registry, byte formatting, persistence
//! ├── relay/       # TCP and UDP forwarders
//! └── app/         # Runtime supervisor and the stats API
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod relay;
pub mod stats;

// Re-exports for convenience
pub use app::Runtime;
pub use config::Config;
pub use error::{Error, Result};
pub use relay::{Relay, TcpRelay, UdpRelay};
pub use stats::{ProxyStats, StatsManager};
