//! Application layer: the runtime supervisor and the read-only stats API

mod api;
mod runtime;

pub use api::ApiServer;
pub use runtime::{Runtime, PERSIST_INTERVAL};
