//! One logical duplex channel speaking `ConclaveMessage` over a socket.

use std::net::{TcpStream, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::frame::{FrameDecoder, FrameEncoder, FrameError, FrameEvent};
use super::message::{ConclaveMessage, MessageDecodeError};
use super::stream::{ReaderEvent, SessionStream, WriterCommand, spawn_reader, spawn_writer};
use super::{ConnectionState, StateCell};
use crate::auth::ResolvedHost;
use crate::error::Transience;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("wire connection already connected")]
    AlreadyConnected,
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("connector cannot satisfy host requirements: {0}")]
    Unsupported(&'static str),
    #[error("stream error: {0}")]
    Stream(#[from] FrameError),
    #[error("message encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("wire connection is closed")]
    Closed,
}

impl WireError {
    pub fn transience(&self) -> Transience {
        match self {
            WireError::AlreadyConnected | WireError::Unsupported(_) | WireError::Encode(_) => {
                Transience::Permanent
            }
            WireError::Connect { .. } | WireError::ConnectTimeout { .. } | WireError::Closed => {
                Transience::Retryable
            }
            WireError::Stream(err) => err.transience(),
        }
    }
}

/// Per-value failures that never tear the connection down.
#[derive(Debug, Error)]
pub enum TransientError {
    #[error("frame parse error: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("{0}")]
    Decode(#[from] MessageDecodeError),
}

/// Inbound union the owner consumes. Both directions' fatal failures
/// surface here, so one channel carries the whole story of a connection.
#[derive(Debug)]
pub enum WireEvent {
    State(ConnectionState),
    TransientError(TransientError),
    Message(ConclaveMessage),
    /// Terminal, emitted exactly once: end of stream (`None`) or the fatal
    /// error that ended it.
    Closed(Option<WireError>),
}

/// Produces the duplex stream for a resolved host.
///
/// TLS lives behind this seam: an encrypted connector wraps its platform
/// stream and still hands back a [`SessionStream`].
pub trait Connector: Send + Sync {
    type Stream: SessionStream;

    fn connect(&self, host: &ResolvedHost, timeout: Duration) -> Result<Self::Stream, WireError>;
}

/// Plain-TCP connector. Refuses hosts that require encryption.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, host: &ResolvedHost, timeout: Duration) -> Result<TcpStream, WireError> {
        if host.encrypted {
            return Err(WireError::Unsupported(
                "host requires an encrypted stream but TcpConnector is plaintext",
            ));
        }

        let addr = format!("{}:{}", host.host, host.port);
        let resolved = addr
            .to_socket_addrs()
            .map_err(|source| WireError::Connect {
                addr: addr.clone(),
                source,
            })?;

        let mut last_err: Option<std::io::Error> = None;
        for candidate in resolved {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(|source| WireError::Connect {
                        addr: addr.clone(),
                        source,
                    })?;
                    return Ok(stream);
                }
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(WireError::ConnectTimeout { addr, timeout });
                }
                Err(err) => last_err = Some(err),
            }
        }

        Err(WireError::Connect {
            addr,
            source: last_err.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
            }),
        })
    }
}

/// Composes a reader and writer over one socket into a bidirectional
/// `ConclaveMessage` channel.
pub struct ConclaveWireConnection<C: Connector> {
    connector: C,
    host: ResolvedHost,
    connect_timeout: Duration,
    max_frame_bytes: usize,
    state: StateCell,
    events_tx: Sender<WireEvent>,
    events_rx: Option<Receiver<WireEvent>>,
    writer_tx: Option<Sender<WriterCommand>>,
    stream: Option<C::Stream>,
    threads: Vec<JoinHandle<()>>,
}

impl<C: Connector> ConclaveWireConnection<C> {
    pub fn new(
        connector: C,
        host: ResolvedHost,
        connect_timeout: Duration,
        max_frame_bytes: usize,
    ) -> Self {
        let (events_tx, events_rx) = crossbeam::channel::unbounded();
        Self {
            connector,
            host,
            connect_timeout,
            max_frame_bytes,
            state: StateCell::new(),
            events_tx,
            events_rx: Some(events_rx),
            writer_tx: None,
            stream: None,
            threads: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Hand out the single inbound event consumer. Succeeds once.
    pub fn subscribe(&mut self) -> Option<Receiver<WireEvent>> {
        self.events_rx.take()
    }

    /// Dial the host and start the reader, writer, and decode bridge.
    pub fn connect(&mut self) -> Result<(), WireError> {
        if self.state.get() != ConnectionState::Disconnected {
            return Err(WireError::AlreadyConnected);
        }
        self.state.set(ConnectionState::Connecting);
        let _ = self.events_tx.send(WireEvent::State(ConnectionState::Connecting));

        let stream = match self.connector.connect(&self.host, self.connect_timeout) {
            Ok(stream) => stream,
            Err(err) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(err);
            }
        };
        let split = stream
            .split()
            .and_then(|reader| stream.split().map(|writer| (reader, writer)));
        let (reader_stream, writer_stream) = match split {
            Ok(pair) => pair,
            Err(source) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(WireError::Connect {
                    addr: format!("{}:{}", self.host.host, self.host.port),
                    source,
                });
            }
        };

        let decoder = FrameDecoder::new(self.host.compressed, self.max_frame_bytes);
        let encoder = FrameEncoder::new(self.host.compressed, self.max_frame_bytes);

        let (reader_tx, reader_rx) = crossbeam::channel::unbounded::<ReaderEvent>();
        let (writer_tx, writer_rx) = crossbeam::channel::unbounded::<WriterCommand>();
        let (write_err_tx, write_err_rx) = crossbeam::channel::unbounded::<FrameError>();

        self.threads
            .push(spawn_reader(reader_stream, decoder, reader_tx));
        self.threads
            .push(spawn_writer(writer_stream, encoder, writer_rx, write_err_tx));

        let bridge_tx = self.events_tx.clone();
        let bridge_state = self.state.clone();
        self.threads.push(thread::spawn(move || {
            run_bridge(reader_rx, write_err_rx, bridge_tx, bridge_state);
        }));

        self.stream = Some(stream);
        self.writer_tx = Some(writer_tx);
        debug!(
            host = %self.host.host,
            port = self.host.port,
            compressed = self.host.compressed,
            "wire connection dialing"
        );
        Ok(())
    }

    /// Serialize and queue one message for the writer thread.
    pub fn send(&self, message: &ConclaveMessage) -> Result<(), WireError> {
        let Some(writer_tx) = &self.writer_tx else {
            return Err(WireError::Closed);
        };
        let value = message.encode().map_err(WireError::Encode)?;
        trace!(kind = message.kind(), "wire send");
        writer_tx
            .send(WriterCommand::Send(value))
            .map_err(|_| WireError::Closed)
    }

    /// Tear down both directions. No-op when already disconnected;
    /// idempotent.
    pub fn disconnect(&mut self) {
        if self.state.get() == ConnectionState::Disconnected && self.stream.is_none() {
            return;
        }
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown();
        }
        if let Some(writer_tx) = self.writer_tx.take() {
            let _ = writer_tx.send(WriterCommand::Shutdown);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.state.set(ConnectionState::Disconnected);
    }
}

/// Translate raw reader frames into typed wire events and fold fatal
/// write-direction failures onto the same channel.
fn run_bridge(
    reader_rx: Receiver<ReaderEvent>,
    write_err_rx: Receiver<FrameError>,
    events_tx: Sender<WireEvent>,
    state: StateCell,
) {
    loop {
        crossbeam::select! {
            recv(reader_rx) -> event => {
                let event = match event {
                    Ok(event) => event,
                    Err(_) => {
                        state.set(ConnectionState::Disconnected);
                        let _ = events_tx.send(WireEvent::Closed(None));
                        return;
                    }
                };
                match event {
                    ReaderEvent::Open => {
                        state.set(ConnectionState::Connected);
                        if events_tx.send(WireEvent::State(ConnectionState::Connected)).is_err() {
                            return;
                        }
                    }
                    ReaderEvent::Frame(frame) => {
                        if forward_frame(frame, &events_tx).is_err() {
                            return;
                        }
                    }
                    ReaderEvent::Closed(err) => {
                        state.set(ConnectionState::Disconnected);
                        let _ = events_tx.send(WireEvent::Closed(err.map(WireError::Stream)));
                        return;
                    }
                }
            }
            recv(write_err_rx) -> err => {
                let Ok(err) = err else { continue };
                warn!("wire write direction failed: {err}");
                state.set(ConnectionState::Disconnected);
                let _ = events_tx.send(WireEvent::Closed(Some(WireError::Stream(err))));
                return;
            }
        }
    }
}

fn forward_frame(frame: FrameEvent, events_tx: &Sender<WireEvent>) -> Result<(), ()> {
    let event = match frame {
        FrameEvent::Heartbeat => WireEvent::Message(ConclaveMessage::Heartbeat),
        FrameEvent::Value(value) => match ConclaveMessage::decode(&value) {
            Ok(message) => WireEvent::Message(message),
            Err(err) => {
                debug!("dropping undecodable frame: {err}");
                WireEvent::TransientError(TransientError::Decode(err))
            }
        },
        FrameEvent::ParseError(err) => {
            debug!("dropping unparsable frame: {err}");
            WireEvent::TransientError(TransientError::Parse(err))
        }
    };
    events_tx.send(event).map_err(|_| ())
}
