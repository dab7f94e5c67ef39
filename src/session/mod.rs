//! Session orchestration: the controller that wires media, signaling,
//! and the peer mesh together, and the participant roster it maintains.

pub mod controller;
pub mod roster;

pub use controller::SessionController;
pub use roster::{Participant, Roster};
