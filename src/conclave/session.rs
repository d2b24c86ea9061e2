//! Conclave session protocol state machine.
//!
//! The pure protocol core (`Protocol`) turns inbound messages into actions;
//! the session loop thread owns it, the wire connection, the outbound
//! queue, and the watchdog, and is the only mutator of any of them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::message::{ConclaveMessage, Echo, Login, PROTOCOL_VERSION};
use super::wire::{ConclaveWireConnection, Connector, TransientError, WireError, WireEvent};
use super::{ConnectionState, StateCell};
use crate::error::Transience;

/// Sequence numbers are unsigned 31-bit and roll over.
const SEQ_MASK: u32 = 0x7fff_ffff;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session already connected")]
    AlreadyConnected,
    #[error("could not subscribe to the wire connection's event stream")]
    ObserverError,
    #[error("remote connection failed: {0}")]
    RemoteConnectionFailed(#[source] WireError),
    #[error("no server traffic for {waited:?} (heartbeat {interval:?} + slack {slack:?})")]
    TimeoutFatal {
        waited: Duration,
        interval: Duration,
        slack: Duration,
    },
    #[error("connection error: {0}")]
    UnderlyingConnection(#[source] WireError),
    #[error("transient wire error: {0}")]
    Wire(#[from] TransientError),
}

impl SessionError {
    pub fn transience(&self) -> Transience {
        match self {
            SessionError::AlreadyConnected | SessionError::ObserverError => Transience::Permanent,
            SessionError::RemoteConnectionFailed(_)
            | SessionError::TimeoutFatal { .. }
            | SessionError::UnderlyingConnection(_) => Transience::Retryable,
            SessionError::Wire(_) => Transience::Unknown,
        }
    }
}

/// Credentials and identity one session logs in with.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub channel_id: String,
    pub access_token: String,
    pub client_type: String,
    pub device_id: Option<String>,
    pub mobile_device_id: Option<String>,
    pub client_version: Option<String>,
    pub trace: bool,
    pub heartbeat_slack: Duration,
}

impl SessionConfig {
    fn login(&self) -> Login {
        Login {
            channel_id: self.channel_id.clone(),
            access_token: self.access_token.clone(),
            client_type: self.client_type.clone(),
            device_id: self.device_id.clone(),
            mobile_device_id: self.mobile_device_id.clone(),
            version: self.client_version.clone(),
            trace: self.trace.then_some(true),
            protocol_version: Some(PROTOCOL_VERSION),
        }
    }
}

/// Validated application data republished to the owner.
#[derive(Clone, Debug, PartialEq)]
pub struct ConclaveDataEvent {
    pub event: String,
    pub data: Value,
    pub seq: Option<u32>,
    pub target: Option<String>,
}

/// Owner-facing session traffic.
#[derive(Debug)]
pub enum SessionEvent {
    State(ConnectionState),
    Transient(SessionError),
    Data(ConclaveDataEvent),
}

/// Sequence state a returning client compares to decide on a resync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: Option<i64>,
    pub seq_num: u32,
    pub generation: i64,
}

enum SessionCommand {
    Send(ConclaveMessage),
    Disconnect { force: bool },
}

// =============================================================================
// Pure protocol core
// =============================================================================

#[derive(Debug, PartialEq)]
enum ProtocolAction {
    Send(ConclaveMessage),
    Emit(ConclaveDataEvent),
    /// Welcome accepted: the session is live.
    Connected,
    /// Heartbeat cadence learned; arm the watchdog at interval + slack.
    ArmWatchdog(Duration),
}

struct Protocol {
    config: SessionConfig,
    session_id: Option<i64>,
    seq_num: u32,
    generation: i64,
    buffer_size: Option<u32>,
    heartbeat_interval: Option<Duration>,
    login_sent: bool,
}

impl Protocol {
    fn new(config: SessionConfig) -> Self {
        Self {
            config,
            session_id: None,
            seq_num: 0,
            generation: 0,
            buffer_size: None,
            heartbeat_interval: None,
            login_sent: false,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            seq_num: self.seq_num,
            generation: self.generation,
        }
    }

    fn handle_message(&mut self, message: ConclaveMessage) -> Vec<ProtocolAction> {
        match message {
            ConclaveMessage::Heartbeat => {
                // Liveness ping-pong, answered in any state.
                vec![ProtocolAction::Send(ConclaveMessage::Heartbeat)]
            }
            ConclaveMessage::Hello(hello) => {
                if self.login_sent {
                    warn!("duplicate hello; login already sent, ignoring");
                    return Vec::new();
                }
                let interval = Duration::from_secs(u64::from(hello.heartbeat));
                self.heartbeat_interval = Some(interval);
                self.buffer_size = Some(hello.buffer_size);
                self.login_sent = true;
                debug!(
                    heartbeat_secs = hello.heartbeat,
                    buffer_size = hello.buffer_size,
                    "hello received; logging in"
                );
                vec![
                    ProtocolAction::ArmWatchdog(interval),
                    ProtocolAction::Send(ConclaveMessage::Login(self.config.login())),
                ]
            }
            ConclaveMessage::Welcome(welcome) => {
                self.session_id = Some(welcome.session_id);
                self.seq_num = welcome.seq & SEQ_MASK;
                self.generation = welcome.generation;
                info!(
                    session_id = welcome.session_id,
                    seq = welcome.seq,
                    generation = welcome.generation,
                    channel = %welcome.channel_id,
                    buffer_size = ?self.buffer_size,
                    "session welcomed"
                );
                vec![ProtocolAction::Connected]
            }
            ConclaveMessage::Public(public) => {
                self.advance_seq(Some(public.seq));
                vec![ProtocolAction::Emit(ConclaveDataEvent {
                    event: public.event,
                    data: public.data,
                    seq: Some(public.seq & SEQ_MASK),
                    target: None,
                })]
            }
            ConclaveMessage::Private(private) => {
                self.advance_seq(private.seq);
                vec![ProtocolAction::Emit(ConclaveDataEvent {
                    event: private.event,
                    data: private.data,
                    seq: private.seq.map(|seq| seq & SEQ_MASK),
                    target: private.target,
                })]
            }
            ConclaveMessage::Ping(ping) => {
                vec![ProtocolAction::Send(ConclaveMessage::Echo(Echo {
                    data: ping.data,
                }))]
            }
            ConclaveMessage::Join(_) | ConclaveMessage::Leave(_) => {
                // Accepted, not yet surfaced to the owner.
                debug!(kind = message.kind(), "presence acknowledged");
                Vec::new()
            }
            ConclaveMessage::Error(body) => {
                warn!(code = body.code, detail = %body.message, "server reported error");
                Vec::new()
            }
            other => {
                trace!(kind = other.kind(), "ignoring message");
                Vec::new()
            }
        }
    }

    fn advance_seq(&mut self, seq: Option<u32>) {
        if let Some(seq) = seq {
            self.seq_num = seq & SEQ_MASK;
        }
    }
}

// =============================================================================
// Watchdog
// =============================================================================

/// Single scheduled liveness deadline. Replacing the timer receiver drops
/// (cancels) its predecessor, so two deadlines never run concurrently.
struct Watchdog {
    total: Option<Duration>,
    deadline: Receiver<Instant>,
    armed_at: Option<Instant>,
}

impl Watchdog {
    fn new() -> Self {
        Self {
            total: None,
            deadline: crossbeam::channel::never(),
            armed_at: None,
        }
    }

    fn arm(&mut self, total: Duration) {
        self.total = Some(total);
        self.rearm();
    }

    /// Reset the deadline; a no-op until the interval is learned.
    fn rearm(&mut self) {
        if let Some(total) = self.total {
            self.deadline = crossbeam::channel::after(total);
            self.armed_at = Some(Instant::now());
        }
    }

    fn cancel(&mut self) {
        self.total = None;
        self.deadline = crossbeam::channel::never();
        self.armed_at = None;
    }

    fn channel(&self) -> &Receiver<Instant> {
        &self.deadline
    }

    fn waited(&self) -> Duration {
        self.armed_at.map(|at| at.elapsed()).unwrap_or_default()
    }
}

// =============================================================================
// Session loop
// =============================================================================

struct SessionLoop<C: Connector> {
    wire: ConclaveWireConnection<C>,
    events_tx: Sender<SessionEvent>,
    state: StateCell,
    snapshot: Arc<Mutex<SessionSnapshot>>,
    protocol: Protocol,
    outbound: VecDeque<ConclaveMessage>,
    watchdog: Watchdog,
    slack: Duration,
    bye_sent: bool,
}

impl<C: Connector + 'static> SessionLoop<C> {
    fn run(mut self, wire_events: Receiver<WireEvent>, commands: Receiver<SessionCommand>) {
        loop {
            let deadline = self.watchdog.channel().clone();
            crossbeam::select! {
                recv(wire_events) -> event => {
                    let done = match event {
                        Ok(event) => self.handle_wire_event(event),
                        Err(_) => true,
                    };
                    if done {
                        break;
                    }
                }
                recv(commands) -> command => {
                    match command {
                        Ok(SessionCommand::Send(message)) => {
                            self.outbound.push_back(message);
                            self.flush_outbound();
                        }
                        Ok(SessionCommand::Disconnect { force: false }) => {
                            // Graceful: say bye, then wait for the server to
                            // close the connection.
                            if !self.bye_sent {
                                self.bye_sent = true;
                                if let Err(err) = self.wire.send(&ConclaveMessage::Bye) {
                                    warn!("bye send failed: {err}");
                                    break;
                                }
                            }
                        }
                        Ok(SessionCommand::Disconnect { force: true }) | Err(_) => break,
                    }
                }
                recv(deadline) -> _ => {
                    let waited = self.watchdog.waited();
                    let interval = self.protocol.heartbeat_interval.unwrap_or_default();
                    warn!(?waited, "watchdog fired; no server traffic");
                    self.emit(SessionEvent::Transient(SessionError::TimeoutFatal {
                        waited,
                        interval,
                        slack: self.slack,
                    }));
                    break;
                }
            }
        }
        self.teardown();
    }

    /// Returns true when the session is over.
    fn handle_wire_event(&mut self, event: WireEvent) -> bool {
        match event {
            // The byte stream's own transitions; session state only moves
            // on Welcome and teardown.
            WireEvent::State(state) => {
                trace!(?state, "wire state");
                false
            }
            WireEvent::TransientError(err) => {
                self.emit(SessionEvent::Transient(SessionError::Wire(err)));
                false
            }
            WireEvent::Message(message) => {
                // Any traffic counts as liveness, before per-kind handling.
                self.watchdog.rearm();
                let actions = self.protocol.handle_message(message);
                for action in actions {
                    self.apply(action);
                }
                self.publish_snapshot();
                false
            }
            WireEvent::Closed(err) => {
                if let Some(err) = err {
                    self.emit(SessionEvent::Transient(SessionError::UnderlyingConnection(
                        err,
                    )));
                }
                true
            }
        }
    }

    fn apply(&mut self, action: ProtocolAction) {
        match action {
            ProtocolAction::Send(message) => {
                if let Err(err) = self.wire.send(&message) {
                    warn!(kind = message.kind(), "send failed: {err}");
                }
            }
            ProtocolAction::Emit(data) => self.emit(SessionEvent::Data(data)),
            ProtocolAction::Connected => {
                if self.state.get() != ConnectionState::Connected {
                    self.state.set(ConnectionState::Connected);
                    self.emit(SessionEvent::State(ConnectionState::Connected));
                    self.flush_outbound();
                }
            }
            ProtocolAction::ArmWatchdog(interval) => {
                self.watchdog.arm(interval + self.slack);
            }
        }
    }

    /// Drain queued messages in FIFO order; a no-op unless Connected.
    fn flush_outbound(&mut self) {
        if self.state.get() != ConnectionState::Connected {
            return;
        }
        while let Some(message) = self.outbound.front() {
            match self.wire.send(message) {
                Ok(()) => {
                    self.outbound.pop_front();
                }
                Err(err) => {
                    warn!("outbound flush stalled: {err}");
                    break;
                }
            }
        }
    }

    fn publish_snapshot(&self) {
        if let Ok(mut snapshot) = self.snapshot.lock() {
            *snapshot = self.protocol.snapshot();
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn teardown(&mut self) {
        self.watchdog.cancel();
        self.wire.disconnect();
        self.state.set(ConnectionState::Disconnected);
        self.emit(SessionEvent::State(ConnectionState::Disconnected));
    }
}

// =============================================================================
// Client handle
// =============================================================================

/// Owner-facing handle for one Conclave session.
///
/// Single-shot connect, no retry logic of its own; reconnection belongs to
/// the façade.
pub struct ConclaveSessionClient {
    config: SessionConfig,
    state: StateCell,
    snapshot: Arc<Mutex<SessionSnapshot>>,
    events_tx: Sender<SessionEvent>,
    events_rx: Option<Receiver<SessionEvent>>,
    command_tx: Sender<SessionCommand>,
    command_rx: Option<Receiver<SessionCommand>>,
    loop_handle: Option<JoinHandle<()>>,
}

impl ConclaveSessionClient {
    pub fn new(config: SessionConfig) -> Self {
        let (events_tx, events_rx) = crossbeam::channel::unbounded();
        let (command_tx, command_rx) = crossbeam::channel::unbounded();
        Self {
            config,
            state: StateCell::new(),
            snapshot: Arc::new(Mutex::new(SessionSnapshot::default())),
            events_tx,
            events_rx: Some(events_rx),
            command_tx,
            command_rx: Some(command_rx),
            loop_handle: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Session id / sequence / generation last observed. The resync policy
    /// comparing these across connections belongs to the caller.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot
            .lock()
            .map(|snapshot| *snapshot)
            .unwrap_or_default()
    }

    /// Hand out the single owner-facing event consumer. Succeeds once.
    pub fn subscribe(&mut self) -> Option<Receiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Bind to a wire connection and start the handshake.
    pub fn connect<C: Connector + 'static>(
        &mut self,
        mut wire: ConclaveWireConnection<C>,
    ) -> Result<(), SessionError> {
        if self.state.get() != ConnectionState::Disconnected {
            return Err(SessionError::AlreadyConnected);
        }
        let wire_events = wire.subscribe().ok_or(SessionError::ObserverError)?;

        self.state.set(ConnectionState::Connecting);
        self.emit(SessionEvent::State(ConnectionState::Connecting));

        if let Err(err) = wire.connect() {
            self.state.set(ConnectionState::Disconnected);
            self.emit(SessionEvent::State(ConnectionState::Disconnected));
            return Err(SessionError::RemoteConnectionFailed(err));
        }

        let commands = match self.command_rx.take() {
            Some(commands) => commands,
            None => {
                // A previous session consumed the command channel; start a
                // fresh one for this connection.
                let (command_tx, command_rx) = crossbeam::channel::unbounded();
                self.command_tx = command_tx;
                command_rx
            }
        };

        let session_loop = SessionLoop {
            wire,
            events_tx: self.events_tx.clone(),
            state: self.state.clone(),
            snapshot: Arc::clone(&self.snapshot),
            protocol: Protocol::new(self.config.clone()),
            outbound: VecDeque::new(),
            watchdog: Watchdog::new(),
            slack: self.config.heartbeat_slack,
            bye_sent: false,
        };
        self.loop_handle = Some(thread::spawn(move || {
            session_loop.run(wire_events, commands);
        }));
        Ok(())
    }

    /// Queue one message; flushed whenever the session is connected.
    pub fn send(&self, message: ConclaveMessage) {
        let _ = self.command_tx.send(SessionCommand::Send(message));
    }

    /// End the session. Graceful sends `bye` and waits for the server to
    /// close; force tears down immediately. No-op when already
    /// disconnected; idempotent.
    pub fn disconnect(&mut self, force: bool) {
        if self.state.get() != ConnectionState::Disconnected {
            let _ = self.command_tx.send(SessionCommand::Disconnect { force });
        }
        if force && let Some(handle) = self.loop_handle.take() {
            let _ = handle.join();
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ResolvedHost;
    use crate::conclave::message::{Hello, Ping, Private, Public, Welcome};
    use crate::conclave::wire::TcpConnector;
    use serde_json::{Value, json};
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    fn test_config(slack: Duration) -> SessionConfig {
        SessionConfig {
            channel_id: "acct1".to_string(),
            access_token: "tok".to_string(),
            client_type: "mobile".to_string(),
            device_id: None,
            mobile_device_id: Some("client-1".to_string()),
            client_version: Some("1.0.0".to_string()),
            trace: false,
            heartbeat_slack: slack,
        }
    }

    fn hello(heartbeat: u32) -> ConclaveMessage {
        ConclaveMessage::Hello(Hello {
            version: Some(2),
            buffer_size: 512,
            heartbeat,
        })
    }

    fn welcome(session_id: i64, seq: u32) -> ConclaveMessage {
        ConclaveMessage::Welcome(Welcome {
            session_id,
            seq,
            channel_id: "acct1".to_string(),
            generation: 1000,
        })
    }

    // ---- pure protocol core ----

    #[test]
    fn hello_triggers_exactly_one_login() {
        let mut protocol = Protocol::new(test_config(Duration::from_secs(1)));
        let actions = protocol.handle_message(hello(60));
        assert_eq!(actions.len(), 2);
        assert_eq!(
            actions[0],
            ProtocolAction::ArmWatchdog(Duration::from_secs(60))
        );
        match &actions[1] {
            ProtocolAction::Send(ConclaveMessage::Login(login)) => {
                assert_eq!(login.channel_id, "acct1");
                assert_eq!(login.access_token, "tok");
                assert_eq!(login.client_type, "mobile");
                assert_eq!(login.protocol_version, Some(PROTOCOL_VERSION));
            }
            other => panic!("expected login, got {other:?}"),
        }

        // A second hello is a protocol violation: logged and ignored.
        assert!(protocol.handle_message(hello(60)).is_empty());
    }

    #[test]
    fn welcome_establishes_session_state() {
        let mut protocol = Protocol::new(test_config(Duration::from_secs(1)));
        protocol.handle_message(hello(60));
        let actions = protocol.handle_message(welcome(7, 3));
        assert_eq!(actions, vec![ProtocolAction::Connected]);
        assert_eq!(
            protocol.snapshot(),
            SessionSnapshot {
                session_id: Some(7),
                seq_num: 3,
                generation: 1000,
            }
        );
    }

    #[test]
    fn seq_tracks_latest_observed_with_gaps() {
        let mut protocol = Protocol::new(test_config(Duration::from_secs(1)));
        protocol.handle_message(welcome(1, 0));
        for seq in [10u32, 12] {
            protocol.handle_message(ConclaveMessage::Public(Public {
                seq,
                session_id: 1,
                event: "status_change".to_string(),
                data: json!({}),
            }));
        }
        assert_eq!(protocol.snapshot().seq_num, 12);

        // Private without a seq leaves the counter alone.
        protocol.handle_message(ConclaveMessage::Private(Private {
            seq: None,
            session_id: 1,
            target: None,
            event: "probe".to_string(),
            data: json!({}),
        }));
        assert_eq!(protocol.snapshot().seq_num, 12);
    }

    #[test]
    fn seq_is_masked_to_31_bits() {
        let mut protocol = Protocol::new(test_config(Duration::from_secs(1)));
        protocol.handle_message(ConclaveMessage::Public(Public {
            seq: u32::MAX,
            session_id: 1,
            event: "status_change".to_string(),
            data: json!({}),
        }));
        assert_eq!(protocol.snapshot().seq_num, SEQ_MASK);
    }

    #[test]
    fn heartbeat_is_echoed_in_any_state() {
        let mut protocol = Protocol::new(test_config(Duration::from_secs(1)));
        let actions = protocol.handle_message(ConclaveMessage::Heartbeat);
        assert_eq!(
            actions,
            vec![ProtocolAction::Send(ConclaveMessage::Heartbeat)]
        );
    }

    #[test]
    fn ping_echoes_payload() {
        let mut protocol = Protocol::new(test_config(Duration::from_secs(1)));
        let actions = protocol.handle_message(ConclaveMessage::Ping(Ping {
            data: Some(json!({"nonce": 5})),
        }));
        assert_eq!(
            actions,
            vec![ProtocolAction::Send(ConclaveMessage::Echo(Echo {
                data: Some(json!({"nonce": 5})),
            }))]
        );
    }

    #[test]
    fn join_and_leave_produce_no_owner_events() {
        let mut protocol = Protocol::new(test_config(Duration::from_secs(1)));
        let value = json!({"join": {"sessionId": 2, "timestamp": 1, "type": "mobile"}});
        let message = ConclaveMessage::decode(&value).unwrap();
        assert!(protocol.handle_message(message).is_empty());
    }

    // ---- session loop over a scripted server ----

    struct Script {
        port: u16,
        lines: Receiver<String>,
    }

    /// Accept one connection; send `greeting` lines, then forward every
    /// client line out, closing when `close_after` lines were seen.
    fn scripted_server(greeting: Vec<Value>, close_after: usize) -> Script {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = crossbeam::channel::unbounded();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            for value in greeting {
                let mut line = serde_json::to_vec(&value).unwrap();
                line.push(b'\n');
                stream.write_all(&line).unwrap();
            }
            let reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut seen = 0usize;
            for line in reader.lines() {
                let Ok(line) = line else { break };
                seen += 1;
                let done = tx.send(line).is_err() || seen >= close_after;

                if seen == 1 {
                    // Respond to login with welcome, then a public event.
                    let welcome = json!({"welcome": {"sessionId": 7, "seq": 3, "channelId": "acct1", "generation": 1000}});
                    let public = json!({"public": {"seq": 10, "sessionId": 1, "event": "attr_change", "data": {"deviceId": "d-1"}}});
                    for value in [welcome, public] {
                        let mut bytes = serde_json::to_vec(&value).unwrap();
                        bytes.push(b'\n');
                        stream.write_all(&bytes).unwrap();
                    }
                }
                if done {
                    break;
                }
            }
        });

        Script { port, lines: rx }
    }

    fn wire_for(port: u16) -> ConclaveWireConnection<TcpConnector> {
        ConclaveWireConnection::new(
            TcpConnector,
            ResolvedHost {
                host: "127.0.0.1".to_string(),
                port,
                encrypted: false,
                compressed: false,
                channel_id: "acct1".to_string(),
                access_token: "tok".to_string(),
            },
            Duration::from_secs(1),
            1024 * 1024,
        )
    }

    fn recv_event(events: &Receiver<SessionEvent>) -> SessionEvent {
        events
            .recv_timeout(Duration::from_secs(2))
            .expect("session event")
    }

    #[test]
    fn handshake_logs_in_and_reaches_connected() {
        let script = scripted_server(
            vec![json!({"hello": {"bufferSize": 512, "heartbeat": 60}})],
            8,
        );
        let mut session = ConclaveSessionClient::new(test_config(Duration::from_secs(30)));
        let events = session.subscribe().expect("subscribe");
        session.connect(wire_for(script.port)).expect("connect");

        let login_line = script
            .lines
            .recv_timeout(Duration::from_secs(2))
            .expect("login");
        let login: Value = serde_json::from_str(&login_line).unwrap();
        assert_eq!(login["login"]["channelId"], "acct1");
        assert_eq!(login["login"]["accessToken"], "tok");
        assert_eq!(login["login"]["type"], "mobile");
        assert_eq!(login["login"]["protocol"], 2);

        assert!(matches!(
            recv_event(&events),
            SessionEvent::State(ConnectionState::Connecting)
        ));
        assert!(matches!(
            recv_event(&events),
            SessionEvent::State(ConnectionState::Connected)
        ));
        match recv_event(&events) {
            SessionEvent::Data(data) => {
                assert_eq!(data.event, "attr_change");
                assert_eq!(data.seq, Some(10));
            }
            other => panic!("expected data event, got {other:?}"),
        }

        let snapshot = session.snapshot();
        assert_eq!(snapshot.session_id, Some(7));
        assert_eq!(snapshot.seq_num, 10);
        assert_eq!(snapshot.generation, 1000);

        session.disconnect(true);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn queued_sends_flush_after_welcome_in_order() {
        let script = scripted_server(
            vec![json!({"hello": {"bufferSize": 512, "heartbeat": 60}})],
            8,
        );
        let mut session = ConclaveSessionClient::new(test_config(Duration::from_secs(30)));
        let _events = session.subscribe().expect("subscribe");

        // Queued before the session even connects.
        session.send(ConclaveMessage::Say(crate::conclave::message::Say {
            event: "snapshot_request".to_string(),
            data: None,
        }));
        session.send(ConclaveMessage::Who);

        session.connect(wire_for(script.port)).expect("connect");

        let mut lines = Vec::new();
        for _ in 0..3 {
            lines.push(
                script
                    .lines
                    .recv_timeout(Duration::from_secs(2))
                    .expect("line"),
            );
        }
        assert!(lines[0].contains("\"login\""));
        assert!(lines[1].contains("snapshot_request"));
        assert_eq!(lines[2], "{\"who\":{}}");

        session.disconnect(true);
    }

    #[test]
    fn watchdog_fires_once_and_disconnects() {
        // Heartbeat 0s + 150ms slack: the watchdog fires soon after hello.
        let script = scripted_server(
            vec![json!({"hello": {"bufferSize": 512, "heartbeat": 0}})],
            64,
        );
        let mut session = ConclaveSessionClient::new(test_config(Duration::from_millis(150)));
        let events = session.subscribe().expect("subscribe");
        session.connect(wire_for(script.port)).expect("connect");

        assert!(matches!(
            recv_event(&events),
            SessionEvent::State(ConnectionState::Connecting)
        ));

        let mut timeouts = 0;
        let mut disconnects = 0;
        loop {
            match events.recv_timeout(Duration::from_secs(2)) {
                Ok(SessionEvent::Transient(SessionError::TimeoutFatal { waited, .. })) => {
                    assert!(waited >= Duration::from_millis(150));
                    timeouts += 1;
                }
                Ok(SessionEvent::State(ConnectionState::Disconnected)) => {
                    disconnects += 1;
                    break;
                }
                Ok(_) => {}
                Err(_) => panic!("expected watchdog to fire"),
            }
        }
        assert_eq!(timeouts, 1);
        assert_eq!(disconnects, 1);

        // Idempotent teardown: nothing further arrives.
        session.disconnect(true);
        session.disconnect(true);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn second_connect_is_already_connected() {
        let script = scripted_server(
            vec![json!({"hello": {"bufferSize": 512, "heartbeat": 60}})],
            8,
        );
        let mut session = ConclaveSessionClient::new(test_config(Duration::from_secs(30)));
        let _events = session.subscribe().expect("subscribe");
        session.connect(wire_for(script.port)).expect("connect");

        let second = wire_for(script.port);
        assert!(matches!(
            session.connect(second),
            Err(SessionError::AlreadyConnected)
        ));
        session.disconnect(true);
    }

    #[test]
    fn failed_dial_reverts_to_disconnected() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().unwrap().port()
        };
        let mut session = ConclaveSessionClient::new(test_config(Duration::from_secs(30)));
        let events = session.subscribe().expect("subscribe");

        let err = session.connect(wire_for(port)).unwrap_err();
        assert!(matches!(err, SessionError::RemoteConnectionFailed(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);

        assert!(matches!(
            recv_event(&events),
            SessionEvent::State(ConnectionState::Connecting)
        ));
        assert!(matches!(
            recv_event(&events),
            SessionEvent::State(ConnectionState::Disconnected)
        ));
    }

    #[test]
    fn graceful_disconnect_says_bye_and_waits_for_close() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let (bye_tx, bye_rx) = crossbeam::channel::unbounded::<String>();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            stream
                .write_all(b"{\"hello\":{\"bufferSize\":512,\"heartbeat\":60}}\n")
                .unwrap();
            let reader = BufReader::new(stream.try_clone().expect("clone"));
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if line.contains("\"bye\"") {
                    let _ = bye_tx.send(line);
                    // Server closes the socket in response to bye.
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                    break;
                }
            }
        });

        let mut session = ConclaveSessionClient::new(test_config(Duration::from_secs(30)));
        let events = session.subscribe().expect("subscribe");
        session.connect(wire_for(port)).expect("connect");

        // Let the handshake begin, then leave politely.
        assert!(matches!(
            recv_event(&events),
            SessionEvent::State(ConnectionState::Connecting)
        ));
        session.disconnect(false);

        bye_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("bye reached server");

        // Server close lands the session in Disconnected.
        loop {
            match recv_event(&events) {
                SessionEvent::State(ConnectionState::Disconnected) => break,
                _ => {}
            }
        }
        assert_eq!(session.state(), ConnectionState::Disconnected);
        session.disconnect(true);
    }
}
