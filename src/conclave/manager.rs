//! Device event stream façade and reconnection policy.
//!
//! Owns identity and credentials, builds a fresh wire connection and
//! session client per attempt, and is the only layer that decides whether
//! and when to retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::{ConclaveMessage, Say};
use super::session::{
    ConclaveDataEvent, ConclaveSessionClient, SessionConfig, SessionError, SessionEvent,
};
use super::wire::{ConclaveWireConnection, Connector};
use super::{ConnectionState, StateCell};
use crate::auth::Authenticator;
use crate::config::Config;
use crate::event::{DeviceStreamEvent, INVALIDATE_EVENT, InvalidationEvent};

/// Broadcast event names the client publishes.
const DEVICE_LIST_REQUEST_EVENT: &str = "snapshot_request";
const VIEWING_EVENT: &str = "device_viewing";
const METRICS_EVENT: &str = "metrics";

/// Reconnect attempts under ten back off quadratically, then flatten.
pub fn backoff_delay(attempt: u32) -> Duration {
    if attempt < 10 {
        Duration::from_millis(u64::from(attempt) * u64::from(attempt) * 200)
    } else {
        Duration::from_secs(20)
    }
}

/// Who this stream belongs to.
#[derive(Clone, Debug)]
pub struct Identity {
    pub account_id: String,
    pub user_id: String,
    /// Stable client instance id, sent as `mobileDeviceId` at login.
    pub client_id: String,
    pub client_type: String,
    pub client_version: Option<String>,
}

/// The single merged stream applications observe.
#[derive(Debug)]
pub enum StreamEvent {
    State(ConnectionState),
    Transient(SessionError),
    Device(DeviceStreamEvent),
    AccountInvalidated(InvalidationEvent),
}

struct Supervisor {
    shutdown: Arc<AtomicBool>,
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

/// Reconnecting façade over one Conclave session at a time.
pub struct DeviceEventStreamManager<A, C>
where
    A: Authenticator + 'static,
    C: Connector + Clone + 'static,
{
    identity: Identity,
    authenticator: Arc<A>,
    connector: C,
    config: Config,
    state: StateCell,
    events_tx: Sender<StreamEvent>,
    events_rx: Option<Receiver<StreamEvent>>,
    publish_tx: Sender<ConclaveMessage>,
    publish_rx: Receiver<ConclaveMessage>,
    supervisor: Option<Supervisor>,
}

impl<A, C> DeviceEventStreamManager<A, C>
where
    A: Authenticator + 'static,
    C: Connector + Clone + 'static,
{
    pub fn new(identity: Identity, authenticator: Arc<A>, connector: C, config: Config) -> Self {
        let (events_tx, events_rx) = crossbeam::channel::unbounded();
        let (publish_tx, publish_rx) = crossbeam::channel::unbounded();
        Self {
            identity,
            authenticator,
            connector,
            config,
            state: StateCell::new(),
            events_tx,
            events_rx: Some(events_rx),
            publish_tx,
            publish_rx,
            supervisor: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Hand out the single merged event consumer. Succeeds once.
    pub fn subscribe(&mut self) -> Option<Receiver<StreamEvent>> {
        self.events_rx.take()
    }

    /// Begin the connect-attempt cycle and keep reconnecting until
    /// [`stop`](Self::stop).
    pub fn start(&mut self, trace: bool) {
        if self.supervisor.is_some() {
            debug!("device event stream already started");
            return;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(1);
        let ctx = SupervisorCtx {
            identity: self.identity.clone(),
            authenticator: Arc::clone(&self.authenticator),
            connector: self.connector.clone(),
            config: self.config.clone(),
            trace,
            state: self.state.clone(),
            events_tx: self.events_tx.clone(),
            publish_rx: self.publish_rx.clone(),
            stop_rx,
            shutdown: Arc::clone(&shutdown),
        };
        let join = thread::spawn(move || run_supervisor(ctx));
        self.supervisor = Some(Supervisor {
            shutdown,
            stop_tx,
            join,
        });
        info!(
            account = %self.identity.account_id,
            user = %self.identity.user_id,
            "device event stream started"
        );
    }

    /// Disable reconnection, cancel any pending retry, and tear the
    /// current session down. Idempotent.
    pub fn stop(&mut self) {
        let Some(supervisor) = self.supervisor.take() else {
            return;
        };
        supervisor.shutdown.store(true, Ordering::Relaxed);
        let _ = supervisor.stop_tx.try_send(());
        let _ = supervisor.join.join();
        self.state.set(ConnectionState::Disconnected);
        info!("device event stream stopped");
    }

    /// Ask the channel for a full peripheral snapshot.
    pub fn publish_device_list_request(&self) {
        self.publish(DEVICE_LIST_REQUEST_EVENT, None);
    }

    /// Tell the channel whether this client is actively viewing a device.
    pub fn publish_viewing_notification(&self, is_viewing: bool, device_id: &str) {
        self.publish(
            VIEWING_EVENT,
            Some(json!({"deviceId": device_id, "isViewing": is_viewing})),
        );
    }

    /// Publish client metrics onto the channel.
    pub fn publish_metrics(&self, metrics: Value) {
        self.publish(METRICS_EVENT, Some(metrics));
    }

    /// Queue one broadcast; safe in any state, flushed once connected.
    fn publish(&self, event: &str, data: Option<Value>) {
        let _ = self.publish_tx.send(ConclaveMessage::Say(Say {
            event: event.to_string(),
            data,
        }));
    }
}

struct SupervisorCtx<A, C>
where
    A: Authenticator,
    C: Connector + Clone,
{
    identity: Identity,
    authenticator: Arc<A>,
    connector: C,
    config: Config,
    trace: bool,
    state: StateCell,
    events_tx: Sender<StreamEvent>,
    publish_rx: Receiver<ConclaveMessage>,
    stop_rx: Receiver<()>,
    shutdown: Arc<AtomicBool>,
}

fn set_state<A, C>(ctx: &SupervisorCtx<A, C>, state: ConnectionState)
where
    A: Authenticator,
    C: Connector + Clone,
{
    if ctx.state.get() != state {
        ctx.state.set(state);
        let _ = ctx.events_tx.send(StreamEvent::State(state));
    }
}

fn run_supervisor<A, C>(ctx: SupervisorCtx<A, C>)
where
    A: Authenticator + 'static,
    C: Connector + Clone + 'static,
{
    let mut attempt: u32 = 0;

    while !ctx.shutdown.load(Ordering::Relaxed) {
        let delay = backoff_delay(attempt);
        if !delay.is_zero() {
            debug!(attempt, ?delay, "reconnect backoff");
            match ctx.stop_rx.recv_timeout(delay) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        if ctx.shutdown.load(Ordering::Relaxed) {
            break;
        }

        attempt = attempt.saturating_add(1);
        run_connect_cycle(&ctx, &mut attempt);
    }

    set_state(&ctx, ConnectionState::Disconnected);
}

/// One full attempt: authenticate, resolve, connect, and drive the session
/// until it lands in Disconnected.
fn run_connect_cycle<A, C>(ctx: &SupervisorCtx<A, C>, attempt: &mut u32)
where
    A: Authenticator + 'static,
    C: Connector + Clone + 'static,
{
    let cycle_id = Uuid::new_v4();
    set_state(ctx, ConnectionState::Connecting);

    let access = match ctx.authenticator.authenticate(&ctx.identity.account_id) {
        Ok(access) => access,
        Err(err) => {
            warn!(%cycle_id, "authentication failed: {err}");
            set_state(ctx, ConnectionState::Disconnected);
            return;
        }
    };
    if ctx.shutdown.load(Ordering::Relaxed) {
        set_state(ctx, ConnectionState::Disconnected);
        return;
    }
    let host = match crate::auth::resolve_socket_host(&access) {
        Ok(host) => host,
        Err(err) => {
            warn!(%cycle_id, "host resolution failed: {err}");
            set_state(ctx, ConnectionState::Disconnected);
            return;
        }
    };

    let session_config = SessionConfig {
        channel_id: host.channel_id.clone(),
        access_token: host.access_token.clone(),
        client_type: ctx.identity.client_type.clone(),
        device_id: None,
        mobile_device_id: Some(ctx.identity.client_id.clone()),
        client_version: ctx.identity.client_version.clone(),
        trace: ctx.trace,
        heartbeat_slack: ctx.config.heartbeat_slack(),
    };
    let wire = ConclaveWireConnection::new(
        ctx.connector.clone(),
        host,
        ctx.config.connect_timeout(),
        ctx.config.max_frame_bytes,
    );

    let mut session = ConclaveSessionClient::new(session_config);
    let Some(session_events) = session.subscribe() else {
        warn!(%cycle_id, "session event stream unobservable");
        set_state(ctx, ConnectionState::Disconnected);
        return;
    };
    if let Err(err) = session.connect(wire) {
        warn!(%cycle_id, "session connect failed: {err}");
        set_state(ctx, ConnectionState::Disconnected);
        return;
    }

    drive_session(ctx, &mut session, session_events, attempt);
    session.disconnect(true);
}

/// Translate session events until the session dies or stop is requested.
fn drive_session<A, C>(
    ctx: &SupervisorCtx<A, C>,
    session: &mut ConclaveSessionClient,
    session_events: Receiver<SessionEvent>,
    attempt: &mut u32,
) where
    A: Authenticator + 'static,
    C: Connector + Clone + 'static,
{
    loop {
        crossbeam::select! {
            recv(session_events) -> event => {
                match event {
                    Ok(SessionEvent::State(state)) => {
                        if state == ConnectionState::Connected {
                            *attempt = 0;
                        }
                        set_state(ctx, state);
                        if state == ConnectionState::Disconnected {
                            return;
                        }
                    }
                    Ok(SessionEvent::Transient(err)) => {
                        let _ = ctx.events_tx.send(StreamEvent::Transient(err));
                    }
                    Ok(SessionEvent::Data(data)) => translate_data_event(ctx, data),
                    Err(_) => {
                        set_state(ctx, ConnectionState::Disconnected);
                        return;
                    }
                }
            }
            recv(ctx.publish_rx) -> message => {
                if let Ok(message) = message {
                    session.send(message);
                }
            }
            recv(ctx.stop_rx) -> _ => {
                session.disconnect(true);
                set_state(ctx, ConnectionState::Disconnected);
                return;
            }
        }
    }
}

/// Route one validated data event: `invalidate` goes to the account
/// invalidation path, recognized names become device events, the rest are
/// logged and dropped.
fn translate_data_event<A, C>(ctx: &SupervisorCtx<A, C>, data: ConclaveDataEvent)
where
    A: Authenticator,
    C: Connector + Clone,
{
    if data.event == INVALIDATE_EVENT {
        let invalidation = InvalidationEvent::from_data(data.data);
        debug!(kind = ?invalidation.kind, "account invalidation");
        let _ = ctx
            .events_tx
            .send(StreamEvent::AccountInvalidated(invalidation));
        return;
    }

    match DeviceStreamEvent::decode(&data.event, data.seq, data.data) {
        Some(event) => {
            let _ = ctx.events_tx.send(StreamEvent::Device(event));
        }
        None => {
            warn!(event = %data.event, "unrecognized event name; dropping");
        }
    }
}
