//! Command relay between duplex peers sharing one WebSocket endpoint.

pub mod hub;
pub mod peer;

pub use hub::{PeerLifecycle, RelayHub};
pub use peer::serve_peer;
