//! Two-peer signaling relay: registry and hub.

pub mod hub;
pub mod registry;

pub use hub::{OverflowPolicy, RelayHub};
pub use registry::PeerId;
