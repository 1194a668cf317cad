//! HTTP reference remote
//!
//! Serves a `MemoryRemote` over the sync protocol so stores configured with
//! an `HttpRemote` can be exercised end to end.

pub mod handlers;
pub mod server;
pub mod state;

pub use server::{start_server, HarnessServer};
pub use state::AppState;
