//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry link, frame decoding and fan-out."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeFilter, SubscribeReasonCode, Transport as WireTransport,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{ConnectOptions, Link, Transport, TransportEvent};
use crate::config::BrokerScheme;
use crate::error::LinkError;

/// Upper bound on flushing queued frames when a link is closed.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Broker transport backed by `rumqttc`.
///
/// Frames are exchanged at QoS 0, matching what the helmets publish.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    capacity: usize,
}

impl MqttTransport {
    /// Request queue depth used when none is given.
    pub const DEFAULT_CAPACITY: usize = 64;

    /// Create a transport with the given client request queue depth.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }

    fn mqtt_options(options: &ConnectOptions) -> MqttOptions {
        let endpoint = &options.endpoint;
        let mut mqtt = match endpoint.scheme {
            BrokerScheme::Tcp => {
                MqttOptions::new(&options.client_id, endpoint.host.clone(), endpoint.port)
            }
            // The websocket transport dials the full URL; the port is informational.
            BrokerScheme::WebSocket => {
                let mut mqtt =
                    MqttOptions::new(&options.client_id, endpoint.url.clone(), endpoint.port);
                mqtt.set_transport(WireTransport::Ws);
                mqtt
            }
        };
        mqtt.set_credentials(options.username.clone(), options.password.clone());
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(true);
        mqtt
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl Transport for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn open(
        &self,
        options: &ConnectOptions,
    ) -> Result<(Arc<dyn Link>, mpsc::UnboundedReceiver<TransportEvent>), LinkError> {
        let runtime = Handle::try_current()
            .map_err(|err| LinkError::Transport(format!("no tokio runtime available: {err}")))?;

        let (client, eventloop) = AsyncClient::new(Self::mqtt_options(options), self.capacity);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));
        let driver = runtime.spawn(drive(
            eventloop,
            events_tx,
            options.reconnect_period,
            Arc::clone(&closing),
        ));
        debug!(broker = %options.endpoint.url, client_id = %options.client_id, "mqtt socket opened");

        let link: Arc<dyn Link> = Arc::new(MqttLink {
            client,
            closing,
            driver: Mutex::new(Some(driver)),
        });
        Ok((link, events_rx))
    }
}

/// A SUBACK only confirms the session when no filter was refused.
fn suback_event(ack: &SubAck) -> TransportEvent {
    let refused = ack
        .return_codes
        .iter()
        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
        .count();
    if refused == 0 {
        TransportEvent::Subscribed
    } else {
        TransportEvent::Error(format!(
            "subscription rejected: broker refused {refused} of {} topic filters",
            ack.return_codes.len()
        ))
    }
}

/// Poll the event loop until the receiver goes away. Polling again after an
/// error makes `rumqttc` redial, so a fixed pause between failures is the
/// reconnect period.
///
/// Once `closing` is set the loop keeps polling only to flush queued requests
/// and stops after the outgoing DISCONNECT or the first error.
async fn drive(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    reconnect_period: Duration,
    closing: Arc<AtomicBool>,
) {
    let mut session_up = false;
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                session_up = true;
                TransportEvent::Connected
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => suback_event(&ack),
            Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Message {
                topic: publish.topic,
                payload: publish.payload,
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("mqtt disconnect flushed");
                break;
            }
            Ok(other) => {
                trace!(?other, "mqtt event");
                continue;
            }
            Err(err) => {
                if closing.load(Ordering::Acquire) {
                    debug!(error = %err, "mqtt socket closed while draining");
                    break;
                }
                let reason = err.to_string();
                let event = if std::mem::take(&mut session_up) {
                    TransportEvent::Disconnected(reason)
                } else {
                    TransportEvent::Error(reason)
                };
                if events.send(event).is_err() {
                    break;
                }
                tokio::time::sleep(reconnect_period).await;
                continue;
            }
        };
        // The manager stops listening before the drain finishes.
        if events.send(event).is_err() && !closing.load(Ordering::Acquire) {
            break;
        }
    }
    debug!("mqtt driver stopped");
}

struct MqttLink {
    client: AsyncClient,
    closing: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Link for MqttLink {
    fn subscribe(&self, topics: &[&str]) -> Result<(), LinkError> {
        let filters = topics
            .iter()
            .map(|topic| SubscribeFilter::new((*topic).to_owned(), QoS::AtMostOnce));
        self.client
            .try_subscribe_many(filters)
            .map_err(|err| LinkError::Transport(err.to_string()))
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| LinkError::Transport(err.to_string()))
    }

    fn close(&self) -> Option<JoinHandle<()>> {
        let mut driver = self.driver.lock().take()?;
        self.closing.store(true, Ordering::Release);
        // DISCONNECT queues behind any pending PUBLISH, so the driver flushes
        // those first and then stops on its own.
        if let Err(err) = self.client.try_disconnect() {
            debug!(error = %err, "mqtt disconnect not queued; stopping driver");
            driver.abort();
            return None;
        }
        let Ok(runtime) = Handle::try_current() else {
            driver.abort();
            return None;
        };
        Some(runtime.spawn(async move {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut driver).await.is_err() {
                warn!(timeout = ?DRAIN_TIMEOUT, "mqtt driver did not drain in time");
                driver.abort();
            }
        }))
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        // Detached; the drain still runs to completion.
        let _ = self.close();
    }
}
