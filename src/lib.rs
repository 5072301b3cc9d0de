//! Courier secure messaging client engine.
//! Host-driven: no I/O; the host's transport delivers events, the engine
//! answers through a synchronous poll API.

pub mod auth;
pub mod chunk;
pub mod crypto;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod wire;

pub use auth::{
    AuthError, AuthEvent, Credentials, HopAuth, PairInitiator, PairResponder, PairedDevice,
};
pub use crypto::{derive_key, open, seal, Key};
pub use error::{last_error, take_last_error, Error, ParamError};
pub use pool::{EventSink, SlotToken};
pub use protocol::{Actor, MessageKind, NetMessage, ProtocolError, PROTOCOL_VERSION};
pub use session::{Connection, Context, LocationFix, Server};
pub use transport::{ConnectionEvent, ConnectionHandle, StreamEvent, Transport, TransportError};
pub use wire::{decode, encode, DecodeError, EncodeError};
