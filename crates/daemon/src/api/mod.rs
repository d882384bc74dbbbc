/// REST API module for the tordht daemon
///
/// Provides HTTP endpoints to:
/// - Inspect the local peer (id, endpoint, connected peers)
/// - Announce identifiers and look up their providers

pub mod handlers;
pub mod responses;
pub mod server;

pub use server::ApiServer;
pub use responses::*;
