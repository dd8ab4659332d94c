//! tandem-core: Shared protocol library for the tandem signaling relay.
//!
//! Provides the recognized signaling message types, the JSON frame codec,
//! and the error type shared by the server.

pub mod codec;
pub mod error;
pub mod signal;

// Re-export commonly used items at crate root.
pub use codec::{decode_frame, encode_message, Inbound, MAX_FRAME_SIZE};
pub use error::{RelayError, RelayResult};
pub use signal::{ServerMessage, SignalKind, SignalMessage};
