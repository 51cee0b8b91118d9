//! Dialog messaging broker, server core.
//!
//! A central TCP broker that authenticates users, tracks who is online,
//! relays text messages between them, and mediates the signaling handshake
//! for voice/video calls. Every frame after the per-connection key exchange
//! is a Fernet-sealed JSON record terminated by the `<END>` sentinel; media
//! itself travels peer-to-peer and never crosses the broker.

pub mod calls;
pub mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
mod dispatcher;
pub mod e2e_common;
pub mod frame;
pub mod handshake;
pub mod presence;
pub mod records;
mod relay;
pub mod server;
pub mod store;

pub use calls::{Call, CallState, CallTable};
pub use codec::RecordCipher;
pub use config::ServerConfig;
pub use connection::{ChannelLink, ConnectionHandle, PeerLink};
pub use crypto::Fernet;
pub use frame::{SentinelCodec, SENTINEL};
pub use presence::{Presence, PresenceEntry};
pub use records::{CallKind, ClientRecord, ServerRecord};
pub use server::Server;
pub use store::{Journal, SqliteStore, UserStore};
