//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry link, frame decoding and fan-out."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Transport abstraction beneath the connection manager.
//!
//! A transport opens one socket per [`Transport::open`] call and reports
//! everything that happens on it as [`TransportEvent`]s. It redials on its own
//! after a drop; the manager decides when to stop it.
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{BrokerEndpoint, ClientConfig};
use crate::error::LinkError;

mod loopback;
mod mqtt;

pub use loopback::LoopbackTransport;
pub use mqtt::MqttTransport;

/// Something that happened on an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Broker accepted the session (CONNACK).
    Connected,
    /// Broker acknowledged a subscription request (SUBACK).
    Subscribed,
    /// Frame received on a subscribed topic.
    Message {
        /// Topic the frame was published on.
        topic: String,
        /// Raw frame bytes.
        payload: Bytes,
    },
    /// An established session was lost; the transport will redial.
    Disconnected(String),
    /// Connecting failed; the transport will redial.
    Error(String),
}

/// Everything a transport needs to open a socket.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Parsed broker address.
    pub endpoint: BrokerEndpoint,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Broker username.
    pub username: String,
    /// Broker password.
    pub password: String,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// Upper bound for the first handshake.
    pub connect_timeout: Duration,
    /// Delay between redials.
    pub reconnect_period: Duration,
}

impl ConnectOptions {
    /// Derive options from validated configuration and a client id.
    pub fn from_config(config: &ClientConfig, client_id: String) -> Result<Self, LinkError> {
        Ok(Self {
            endpoint: config.broker.endpoint()?,
            client_id,
            username: config.broker.username.clone(),
            password: config.broker.password.clone(),
            keep_alive: config.session.keep_alive,
            connect_timeout: config.session.connect_timeout,
            reconnect_period: config.session.reconnect_period,
        })
    }
}

/// Handle to one open socket.
pub trait Link: Send + Sync {
    /// Request subscriptions; acknowledged later via [`TransportEvent::Subscribed`].
    fn subscribe(&self, topics: &[&str]) -> Result<(), LinkError>;
    /// Queue a frame for publication.
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LinkError>;
    /// Close the socket and stop redialling. Idempotent.
    ///
    /// Frames already queued may still be on their way out; the returned
    /// task, when there is one, finishes once they are flushed.
    fn close(&self) -> Option<JoinHandle<()>>;
}

/// Factory for broker sockets.
pub trait Transport: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &'static str;

    /// Open a socket. Events flow on the returned receiver until the link is
    /// closed, after which the sender side is dropped.
    fn open(
        &self,
        options: &ConnectOptions,
    ) -> Result<(Arc<dyn Link>, mpsc::UnboundedReceiver<TransportEvent>), LinkError>;
}
