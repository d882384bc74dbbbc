/// tordht daemon library
///
/// HTTP API and command helpers around a [`tordht_core::DhtHost`].

pub mod api;

pub use api::ApiServer;
