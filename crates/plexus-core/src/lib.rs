//! plexus-core: Shared protocol library for plexus.
//!
//! Provides the message envelope and client identity types, the JSON/CBOR
//! wire codec, the split transport traits used by the session pumps, and an
//! in-memory transport for embedding and tests.

pub mod codec;
pub mod error;
pub mod message;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{Frame, WireFormat, DEFAULT_MAX_MESSAGE_SIZE};
pub use error::{PlexusError, PlexusResult};
pub use message::{ClientId, Envelope};
pub use transport::{FrameReader, FrameWriter, MemoryPeer, MemoryTransport, Transport};
