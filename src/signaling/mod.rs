//! Client-side signaling: wire format and the per-session channel client.

pub mod client;
pub mod message;

pub use client::{SignalingClient, SignalingTransport, TransportEvent};
pub use message::SignalingMessage;
