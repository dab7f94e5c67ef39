//! meshcall - Multi-party mesh call core
//!
//! This crate provides the client-side core of a full-mesh group call:
//! local media capture management, per-peer WebRTC negotiation, presence
//! driven session membership, and audio activity detection. Platform
//! integration points (signaling transport, capture devices) are traits
//! the embedding application implements.

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

#[cfg(test)]
pub(crate) mod testkit;

pub use error::{MeshError, Result};
