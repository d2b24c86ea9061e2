//! Conclave session protocol stack.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

pub mod frame;
pub mod manager;
pub mod message;
pub mod session;
pub mod stream;
pub mod wire;

pub use frame::{FrameDecoder, FrameEncoder, FrameError, FrameEvent};
pub use manager::{DeviceEventStreamManager, Identity, StreamEvent, backoff_delay};
pub use message::{ConclaveMessage, MessageDecodeError, PROTOCOL_VERSION};
pub use session::{
    ConclaveDataEvent, ConclaveSessionClient, SessionConfig, SessionError, SessionEvent,
    SessionSnapshot,
};
pub use wire::{ConclaveWireConnection, Connector, TcpConnector, WireError, WireEvent};

/// Lifecycle of one layer of the stack.
///
/// Each layer (byte stream, wire connection, session) owns its own state;
/// a lower layer's transition triggers, but is distinct from, the layer
/// above it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }
}

/// Lock-free connection-state cell shared between an owner and its loop
/// thread.
#[derive(Clone, Debug)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(
            ConnectionState::Disconnected.as_u8(),
        )))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}
