//! Peer connections: the per-peer state machine, the mesh manager that
//! owns one connection per remote participant, and the WebRTC
//! negotiation backend.

pub mod connection;
pub mod manager;
pub mod webrtc_link;

pub use connection::{PeerConnection, PeerLink, PeerLinkEvent, PeerLinkFactory, PeerState};
pub use manager::{PeerConnectionManager, PeerEvent};
pub use webrtc_link::WebRtcLinkFactory;
