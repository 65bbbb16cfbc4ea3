//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry link, frame decoding and fan-out."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! In-process transport for tests and dry runs.
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ConnectOptions, Link, Transport, TransportEvent};
use crate::error::LinkError;

#[derive(Debug, Clone)]
enum Mode {
    /// Nothing happens until the test drives it.
    Manual,
    /// Handshake and subscriptions complete immediately; publishes echo back.
    Auto,
    /// Every socket reports an error straight away.
    Refusing(String),
}

struct Socket {
    id: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    subscriptions: Vec<String>,
}

struct Shared {
    mode: Mode,
    sockets_opened: u64,
    subscribe_requests: u64,
    current: Option<Socket>,
    published: Vec<(String, Bytes)>,
}

/// Transport that never leaves the process.
///
/// Cloning shares the underlying state, so a test keeps one clone to drive
/// and inspect the socket while the manager owns the other.
#[derive(Clone)]
pub struct LoopbackTransport {
    shared: Arc<Mutex<Shared>>,
}

impl LoopbackTransport {
    fn with_mode(mode: Mode) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                mode,
                sockets_opened: 0,
                subscribe_requests: 0,
                current: None,
                published: Vec::new(),
            })),
        }
    }

    /// Manually driven transport.
    pub fn new() -> Self {
        Self::with_mode(Mode::Manual)
    }

    /// Transport whose handshake and subscriptions succeed immediately and
    /// which echoes publishes on subscribed topics.
    pub fn auto() -> Self {
        Self::with_mode(Mode::Auto)
    }

    /// Transport whose every socket fails with `reason`.
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self::with_mode(Mode::Refusing(reason.into()))
    }

    /// Sockets opened so far.
    pub fn sockets_opened(&self) -> u64 {
        self.shared.lock().sockets_opened
    }

    /// Subscribe calls received so far.
    pub fn subscribe_requests(&self) -> u64 {
        self.shared.lock().subscribe_requests
    }

    /// Every frame published, in order.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.shared.lock().published.clone()
    }

    /// Topics subscribed on the open socket.
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared
            .lock()
            .current
            .as_ref()
            .map(|socket| socket.subscriptions.clone())
            .unwrap_or_default()
    }

    /// Whether a socket is open.
    pub fn is_open(&self) -> bool {
        self.shared.lock().current.is_some()
    }

    /// Push an event onto the open socket. Returns whether anyone received it.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.shared
            .lock()
            .current
            .as_ref()
            .map(|socket| socket.events.send(event).is_ok())
            .unwrap_or(false)
    }

    /// Report a completed handshake.
    pub fn accept_connection(&self) -> bool {
        self.emit(TransportEvent::Connected)
    }

    /// Acknowledge the outstanding subscription request.
    pub fn acknowledge_subscriptions(&self) -> bool {
        self.emit(TransportEvent::Subscribed)
    }

    /// Report a lost session; the socket stays open as a redialling transport would.
    pub fn drop_connection(&self, reason: &str) -> bool {
        self.emit(TransportEvent::Disconnected(reason.to_owned()))
    }

    /// Report a failed dial.
    pub fn fail(&self, reason: &str) -> bool {
        self.emit(TransportEvent::Error(reason.to_owned()))
    }

    /// Refuse the outstanding subscription request, as a broker ACL would.
    /// The requested topics are forgotten.
    pub fn reject_subscriptions(&self, reason: &str) -> bool {
        let mut shared = self.shared.lock();
        let Some(socket) = shared.current.as_mut() else {
            return false;
        };
        socket.subscriptions.clear();
        socket
            .events
            .send(TransportEvent::Error(format!("subscription rejected: {reason}")))
            .is_ok()
    }

    /// Deliver a frame as the broker would: only on subscribed topics.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let shared = self.shared.lock();
        let Some(socket) = shared.current.as_ref() else {
            return false;
        };
        if !socket.subscriptions.iter().any(|known| known == topic) {
            return false;
        }
        socket
            .events
            .send(TransportEvent::Message {
                topic: topic.to_owned(),
                payload: payload.into(),
            })
            .is_ok()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn open(
        &self,
        _options: &ConnectOptions,
    ) -> Result<(Arc<dyn Link>, mpsc::UnboundedReceiver<TransportEvent>), LinkError> {
        let (events, receiver) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock();
        shared.sockets_opened += 1;
        let id = shared.sockets_opened;

        // Sends cannot fail: the receiver is still in hand.
        match &shared.mode {
            Mode::Manual => {}
            Mode::Auto => {
                let _ = events.send(TransportEvent::Connected);
            }
            Mode::Refusing(reason) => {
                let _ = events.send(TransportEvent::Error(reason.clone()));
            }
        }
        shared.current = Some(Socket {
            id,
            events,
            subscriptions: Vec::new(),
        });
        drop(shared);

        let link: Arc<dyn Link> = Arc::new(LoopbackLink {
            id,
            shared: Arc::clone(&self.shared),
        });
        Ok((link, receiver))
    }
}

struct LoopbackLink {
    id: u64,
    shared: Arc<Mutex<Shared>>,
}

impl Link for LoopbackLink {
    fn subscribe(&self, topics: &[&str]) -> Result<(), LinkError> {
        let mut guard = self.shared.lock();
        let shared = &mut *guard;
        let socket = shared
            .current
            .as_mut()
            .filter(|socket| socket.id == self.id)
            .ok_or_else(|| LinkError::Transport("loopback socket closed".into()))?;
        shared.subscribe_requests += 1;
        for topic in topics {
            if !socket.subscriptions.iter().any(|known| known == topic) {
                socket.subscriptions.push((*topic).to_owned());
            }
        }
        if matches!(shared.mode, Mode::Auto) {
            let _ = socket.events.send(TransportEvent::Subscribed);
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        let mut guard = self.shared.lock();
        let shared = &mut *guard;
        let socket = shared
            .current
            .as_ref()
            .filter(|socket| socket.id == self.id)
            .ok_or_else(|| LinkError::Transport("loopback socket closed".into()))?;
        let payload = Bytes::copy_from_slice(payload);
        if matches!(shared.mode, Mode::Auto)
            && socket.subscriptions.iter().any(|known| known == topic)
        {
            let _ = socket.events.send(TransportEvent::Message {
                topic: topic.to_owned(),
                payload: payload.clone(),
            });
        }
        shared.published.push((topic.to_owned(), payload));
        Ok(())
    }

    fn close(&self) -> Option<JoinHandle<()>> {
        let mut shared = self.shared.lock();
        if shared.current.as_ref().is_some_and(|socket| socket.id == self.id) {
            shared.current = None;
        }
        None
    }
}
