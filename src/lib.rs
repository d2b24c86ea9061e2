#![forbid(unsafe_code)]

//! Client for the Conclave real-time message channel.
//!
//! The crate keeps one authenticated, heartbeat-guarded connection to a
//! Conclave channel broker alive and republishes validated traffic as a
//! typed event stream. Layers, bottom up:
//!
//! - [`conclave::frame`]: newline-delimited JSON framing with an optional
//!   deflate stream filter.
//! - [`conclave::stream`]: reader/writer threads binding the codec to a
//!   duplex byte stream.
//! - [`conclave::message`]: the wire message union and its canonical JSON
//!   encoding.
//! - [`conclave::wire`]: one typed duplex message channel over a socket.
//! - [`conclave::session`]: the protocol state machine (handshake, sequence
//!   tracking, watchdog liveness).
//! - [`conclave::manager`]: the reconnecting façade applications consume.

pub mod auth;
pub mod conclave;
pub mod config;
pub mod error;
pub mod event;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the protocol surface at crate root for convenience
pub use crate::auth::{Authenticator, ConclaveAccess, ConclaveHost, ResolvedHost};
pub use crate::conclave::{
    ConclaveDataEvent, ConclaveMessage, ConclaveSessionClient, ConclaveWireConnection,
    ConnectionState, DeviceEventStreamManager, Identity, SessionConfig, SessionError,
    SessionEvent, SessionSnapshot, StreamEvent, TcpConnector, WireError, WireEvent,
};
pub use crate::config::Config;
pub use crate::event::{DeviceStreamEvent, InvalidationEvent};
