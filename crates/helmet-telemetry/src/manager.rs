//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry link, frame decoding and fan-out."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The connection manager: one broker link per application.
//!
//! `connect()` resolves once the broker acknowledges the subscription to both
//! topics. Callers that arrive while an attempt is in flight join it and see
//! the same outcome. Every socket gets a fresh generation number; events
//! tagged with an older generation are discarded, so a `disconnect()` can
//! never be undone by a late handshake.
use std::sync::{Arc, Weak};

use helmet_logging::{helmet_info, helmet_warn, log_link_event, LinkEventOutcome, LogContext};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ConnectionError, LinkError, ObserverError};
use crate::metrics::IngestMetrics;
use crate::registry::{Listener, ListenerRegistry, Subscription};
use crate::state::{transition, LinkAction, LinkInput, LinkPhase, LinkStatus};
use crate::transport::{ConnectOptions, Link, MqttTransport, Transport, TransportEvent};
use crate::wire::{decode, Decoded, SosEvent, TelemetryRecord, SOS_TOPIC, TELEMETRY_TOPIC};

const EVENT_CAPACITY: usize = 32;

/// Lifecycle notification for composition roots that prefer push to polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LinkEvent {
    /// Subscriptions acknowledged, first time or after a redial.
    Connected,
    /// Session lost; the transport is redialling.
    Reconnecting {
        /// Consecutive redial number.
        attempt: u32,
    },
    /// Redials exhausted; the socket was closed.
    Exhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
    /// `disconnect()` tore the link down.
    Disconnected,
}

#[derive(Debug, Clone)]
enum AttemptOutcome {
    Pending,
    Established,
    Failed(ConnectionError),
}

struct LinkState {
    phase: LinkPhase,
    generation: u64,
    link: Option<Arc<dyn Link>>,
    pump: Option<JoinHandle<()>>,
    deadline: Option<JoinHandle<()>>,
    attempt: Option<watch::Sender<AttemptOutcome>>,
    /// Listeners may belong to a session that never came up; the next
    /// `disconnect()` still clears them.
    listeners_bound: bool,
    draining: Vec<JoinHandle<()>>,
}

impl LinkState {
    fn settle(&mut self, outcome: AttemptOutcome) {
        if let Some(attempt) = self.attempt.take() {
            attempt.send_replace(outcome);
        }
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }

    /// Close the socket and retire its generation.
    fn teardown(&mut self) {
        self.generation += 1;
        self.draining.retain(|drain| !drain.is_finished());
        if let Some(drain) = self.link.take().and_then(|link| link.close()) {
            self.draining.push(drain);
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

struct ManagerInner {
    config: ClientConfig,
    options: ConnectOptions,
    transport: Arc<dyn Transport>,
    telemetry: ListenerRegistry<TelemetryRecord>,
    sos: ListenerRegistry<SosEvent>,
    metrics: Arc<IngestMetrics>,
    events: broadcast::Sender<LinkEvent>,
    state: Mutex<LinkState>,
}

/// Owner of the single broker link.
///
/// Cheap to clone; every clone drives the same link. Construct one in the
/// composition root and hand clones to consumers.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Manager over an arbitrary transport.
    pub fn new(config: ClientConfig, transport: impl Transport + 'static) -> Result<Self, LinkError> {
        Self::with_metrics(config, Arc::new(transport), Arc::new(IngestMetrics::new()))
    }

    /// Manager over the MQTT transport.
    pub fn mqtt(config: ClientConfig) -> Result<Self, LinkError> {
        Self::new(config, MqttTransport::default())
    }

    /// Manager reporting into caller-supplied metrics.
    pub fn with_metrics(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        metrics: Arc<IngestMetrics>,
    ) -> Result<Self, LinkError> {
        config.validate()?;
        let suffix = Uuid::new_v4().simple().to_string();
        let client_id = format!("{}-{}", config.broker.client_id_prefix, &suffix[..8]);
        let options = ConnectOptions::from_config(&config, client_id)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                options,
                transport,
                telemetry: ListenerRegistry::new("telemetry"),
                sos: ListenerRegistry::new("sos"),
                metrics,
                events,
                state: Mutex::new(LinkState {
                    phase: LinkPhase::Disconnected,
                    generation: 0,
                    link: None,
                    pump: None,
                    deadline: None,
                    attempt: None,
                    listeners_bound: false,
                    draining: Vec::new(),
                }),
            }),
        })
    }

    /// Establish the link, or join the attempt already in flight.
    ///
    /// Returns immediately when the link is up or redialling. Fails when the
    /// transport errors before the subscriptions are acknowledged, when the
    /// connect timeout elapses, or when `disconnect()` interrupts the attempt.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut outcome = {
            let mut state = self.inner.state.lock();
            match state.phase {
                LinkPhase::Connected | LinkPhase::Backoff(_) => return Ok(()),
                LinkPhase::Connecting => match &state.attempt {
                    Some(attempt) => attempt.subscribe(),
                    None => return Ok(()),
                },
                LinkPhase::Disconnected | LinkPhase::Exhausted(_) => {
                    self.inner.open(&mut state)?
                }
            }
        };

        loop {
            let current = outcome.borrow_and_update().clone();
            match current {
                AttemptOutcome::Pending => {}
                AttemptOutcome::Established => return Ok(()),
                AttemptOutcome::Failed(err) => return Err(err),
            }
            if outcome.changed().await.is_err() {
                return Err(ConnectionError::Cancelled);
            }
        }
    }

    /// Tear the link down and clear both listener sets.
    ///
    /// Already disconnected, this only clears listeners left over from a
    /// failed or timed-out `connect()`; a second call is a no-op.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let (next, action) = transition(
            state.phase,
            LinkInput::DisconnectRequested,
            inner.config.session.max_reconnect_attempts,
        );
        let stale_listeners = std::mem::take(&mut state.listeners_bound);
        if action == LinkAction::None {
            drop(state);
            if stale_listeners {
                inner.telemetry.clear();
                inner.sos.clear();
                debug!("cleared listeners of a session that never came up");
            }
            return;
        }
        state.phase = next;
        state.teardown();
        state.settle(AttemptOutcome::Failed(ConnectionError::Cancelled));
        let generation = state.generation;
        drop(state);

        inner.telemetry.clear();
        inner.sos.clear();
        log_link_event(
            Some(&inner.log_context(generation)),
            "link.disconnect",
            "link closed on request",
            LinkEventOutcome::Success,
        );
        inner.notify(LinkEvent::Disconnected);
    }

    /// Disconnect, then wait until frames queued before the call have left
    /// the process. Use before the runtime shuts down.
    pub async fn shutdown(&self) {
        self.disconnect();
        let draining = std::mem::take(&mut self.inner.state.lock().draining);
        for drain in draining {
            if let Err(err) = drain.await {
                debug!(error = %err, "link drain task ended abnormally");
            }
        }
    }

    /// Current link state. Never blocks on I/O.
    pub fn status(&self) -> LinkStatus {
        self.inner.state.lock().phase.status()
    }

    /// Publish a frame. Fails with [`LinkError::NotConnected`] unless the link
    /// is up; nothing is queued.
    pub fn publish(&self, topic: &str, payload: impl AsRef<[u8]>) -> Result<(), LinkError> {
        let (link, generation) = {
            let state = self.inner.state.lock();
            match (&state.phase, &state.link) {
                (LinkPhase::Connected, Some(link)) => (Arc::clone(link), state.generation),
                _ => return Err(LinkError::NotConnected),
            }
        };
        let payload = payload.as_ref();
        link.publish(topic, payload)?;
        self.inner.metrics.record_published();
        helmet_info!(
            context = self.inner.log_context(generation).with_topic(topic),
            "published {} byte frame",
            payload.len()
        );
        Ok(())
    }

    /// Raise an SOS for one helmet, or for all with [`crate::SOS_BROADCAST`].
    pub fn publish_sos(&self, target: &str) -> Result<(), LinkError> {
        self.publish(SOS_TOPIC, target.as_bytes())
    }

    /// Register a telemetry listener.
    pub fn on_telemetry<L>(&self, listener: Arc<L>) -> Subscription
    where
        L: Listener<TelemetryRecord> + 'static,
    {
        self.inner.telemetry.register(listener)
    }

    /// Register a telemetry closure.
    pub fn on_telemetry_fn<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TelemetryRecord) -> Result<(), ObserverError> + Send + Sync + 'static,
    {
        self.inner.telemetry.register_fn(listener)
    }

    /// Register an SOS listener.
    pub fn on_sos<L>(&self, listener: Arc<L>) -> Subscription
    where
        L: Listener<SosEvent> + 'static,
    {
        self.inner.sos.register(listener)
    }

    /// Register an SOS closure.
    pub fn on_sos_fn<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SosEvent) -> Result<(), ObserverError> + Send + Sync + 'static,
    {
        self.inner.sos.register_fn(listener)
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events.subscribe()
    }

    /// Shared ingest counters.
    pub fn metrics(&self) -> Arc<IngestMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Configuration the manager was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Client identifier presented to the broker.
    pub fn client_id(&self) -> &str {
        &self.inner.options.client_id
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("transport", &self.inner.transport.name())
            .field("client_id", &self.inner.options.client_id)
            .field("status", &self.status())
            .finish()
    }
}

impl ManagerInner {
    fn max_attempts(&self) -> u32 {
        self.config.session.max_reconnect_attempts
    }

    fn log_context(&self, generation: u64) -> LogContext<'_> {
        LogContext::new()
            .with_broker(&self.options.endpoint.url)
            .with_session(generation)
    }

    fn notify(&self, event: LinkEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Open a socket for a new attempt. Called with the state lock held.
    fn open(
        self: &Arc<Self>,
        state: &mut LinkState,
    ) -> Result<watch::Receiver<AttemptOutcome>, ConnectionError> {
        let (next, action) = transition(state.phase, LinkInput::ConnectRequested, self.max_attempts());
        debug_assert_eq!(action, LinkAction::OpenSocket);

        let (link, events) = self
            .transport
            .open(&self.options)
            .map_err(|err| ConnectionError::Refused(err.to_string()))?;

        state.generation += 1;
        let generation = state.generation;
        state.phase = next;
        state.link = Some(link);
        state.listeners_bound = true;

        let (attempt, outcome) = watch::channel(AttemptOutcome::Pending);
        state.attempt = Some(attempt);
        state.pump = Some(tokio::spawn(pump(Arc::downgrade(self), generation, events)));
        state.deadline = Some(tokio::spawn(deadline(
            Arc::downgrade(self),
            generation,
            self.config.session.connect_timeout,
        )));

        log_link_event(
            Some(&self.log_context(generation)),
            "link.connect",
            &format!("dialling over {}", self.transport.name()),
            LinkEventOutcome::Success,
        );
        Ok(outcome)
    }

    /// Handle one transport event. Returns whether the pump should keep going.
    fn handle(&self, generation: u64, event: TransportEvent) -> bool {
        let (input, reason) = match event {
            TransportEvent::Message { topic, payload } => {
                if self.state.lock().generation != generation {
                    return false;
                }
                self.route(&topic, &payload);
                return true;
            }
            TransportEvent::Connected => (LinkInput::TransportConnected, String::new()),
            TransportEvent::Subscribed => (LinkInput::SubscriptionsAcknowledged, String::new()),
            TransportEvent::Disconnected(reason) => (LinkInput::TransportDropped, reason),
            TransportEvent::Error(reason) => (LinkInput::TransportFailed, reason),
        };
        self.apply(generation, input, reason)
    }

    fn apply(&self, generation: u64, input: LinkInput, reason: String) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        let (next, action) = transition(state.phase, input, self.max_attempts());
        state.phase = next;
        let ctx = self.log_context(generation);

        match action {
            LinkAction::None | LinkAction::OpenSocket | LinkAction::CloseSocket => {}
            LinkAction::Subscribe => {
                if let Some(link) = &state.link {
                    if let Err(err) = link.subscribe(&[TELEMETRY_TOPIC, SOS_TOPIC]) {
                        helmet_warn!(context = ctx, "subscribe request failed: {}", err);
                    }
                }
            }
            LinkAction::ResolveConnect => {
                state.settle(AttemptOutcome::Established);
                drop(state);
                log_link_event(
                    Some(&ctx),
                    "link.subscribed",
                    "subscriptions acknowledged",
                    LinkEventOutcome::Success,
                );
                self.notify(LinkEvent::Connected);
            }
            LinkAction::FailConnect => {
                let err = match input {
                    LinkInput::TransportFailed => ConnectionError::Refused(reason),
                    _ => ConnectionError::Closed(reason),
                };
                state.teardown();
                state.settle(AttemptOutcome::Failed(err.clone()));
                drop(state);
                log_link_event(Some(&ctx), "link.connect", &err.to_string(), LinkEventOutcome::Fault);
                return false;
            }
            LinkAction::Restored => {
                drop(state);
                log_link_event(
                    Some(&ctx),
                    "link.subscribed",
                    "session restored after redial",
                    LinkEventOutcome::Success,
                );
                self.notify(LinkEvent::Connected);
            }
            LinkAction::AwaitRedial(attempt) => {
                drop(state);
                self.metrics.record_reconnect();
                log_link_event(
                    Some(&ctx),
                    "link.reconnect",
                    &format!("session lost ({reason}); redial {attempt} of {}", self.max_attempts()),
                    LinkEventOutcome::Fault,
                );
                self.notify(LinkEvent::Reconnecting { attempt });
            }
            LinkAction::GiveUp => {
                let attempts = match next {
                    LinkPhase::Exhausted(attempts) => attempts,
                    _ => self.max_attempts().saturating_add(1),
                };
                state.teardown();
                drop(state);
                log_link_event(
                    Some(&ctx),
                    "link.exhausted",
                    &format!("giving up after {attempts} redials ({reason})"),
                    LinkEventOutcome::Fault,
                );
                self.notify(LinkEvent::Exhausted { attempts });
                return false;
            }
        }
        true
    }

    fn expire(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation || state.phase != LinkPhase::Connecting {
            return;
        }
        let timeout = self.config.session.connect_timeout;
        state.phase = LinkPhase::Disconnected;
        state.teardown();
        state.settle(AttemptOutcome::Failed(ConnectionError::Timeout(timeout)));
        drop(state);
        log_link_event(
            Some(&self.log_context(generation)),
            "link.connect",
            &format!("no subscription acknowledgement within {timeout:?}"),
            LinkEventOutcome::Fault,
        );
    }

    /// Decode a frame and fan it out. Runs without the state lock.
    fn route(&self, topic: &str, payload: &[u8]) {
        self.metrics.record_frame();
        match decode(topic, payload) {
            Decoded::Telemetry(record) => {
                self.metrics.record_telemetry();
                let report = self.telemetry.dispatch(&record);
                self.metrics.record_observer_failures(report.failed);
            }
            Decoded::Sos(event) => {
                self.metrics.record_sos();
                let report = self.sos.dispatch(&event);
                self.metrics.record_observer_failures(report.failed);
            }
            Decoded::Rejected(err) => {
                self.metrics.record_rejected();
                helmet_warn!(
                    context = LogContext::new().with_topic(topic),
                    "dropping frame {:?}: {}",
                    String::from_utf8_lossy(payload),
                    err
                );
            }
        }
    }
}

async fn pump(
    manager: Weak<ManagerInner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = manager.upgrade() else {
            return;
        };
        if !inner.handle(generation, event) {
            return;
        }
    }
    // The transport went away without being asked to.
    if let Some(inner) = manager.upgrade() {
        inner.apply(
            generation,
            LinkInput::TransportDropped,
            "transport event stream closed".to_owned(),
        );
    }
    debug!(generation, "event pump finished");
}

async fn deadline(manager: Weak<ManagerInner>, generation: u64, timeout: std::time::Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(inner) = manager.upgrade() {
        inner.expire(generation);
    }
}
