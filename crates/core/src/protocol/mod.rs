/// Peer wire protocol messages
pub mod messages;

pub use messages::{Frame, PeerRecord, ProviderRecord, Request, Response};
