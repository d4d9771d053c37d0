//! Client-side state synchronization core for a proxy management console.
//!
//! - [`session::SessionStore`]: login/logout and single-flight session restoration.
//! - [`config_cache::ConfigCache`]: server config cached with a freshness window and
//!   request coalescing guarded by a generation counter.
//! - [`usage`]: pure aggregation of usage records into per-account statistics.
//! - [`preload::PreloadOrchestrator`]: restore-then-preload route guard.

pub mod app;
pub mod client;
pub mod clock;
pub mod config;
pub mod config_cache;
pub mod error;
pub mod logging;
pub mod preload;
pub mod session;
pub mod storage;
pub mod transport;
pub mod usage;

pub use app::Console;
pub use error::{AuthError, FetchError, TransportError};

#[cfg(test)]
mod tests;
