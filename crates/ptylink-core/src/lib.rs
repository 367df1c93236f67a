//! ptylink-core: Shared protocol library for ptylink.
//!
//! Provides the relay envelope and RPC result types, PTC1 binary framing,
//! base64 helpers, and the abstract relay transport contract consumed by
//! the terminal client.

pub mod codec;
pub mod error;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{decode_base64, encode_base64, frame_decode, frame_encode, PTC1_SENTINEL};
pub use error::{PtyError, PtyResult};
pub use messages::{RelayEnvelope, SessionMetadata, SessionStatus, StartResponse};
pub use transport::{BoxFuture, ConnectionState, EventHub, RelayEvent, RelayTransport};
