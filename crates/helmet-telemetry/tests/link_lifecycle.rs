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

use helmet_telemetry::{
    ClientConfig, ConnectOptions, ConnectionError, ConnectionManager, Link, LinkError, LinkEvent,
    LinkPhase, LoopbackTransport, Transport, TransportEvent, SOS_BROADCAST, SOS_TOPIC,
    TELEMETRY_TOPIC,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn config(max_reconnect_attempts: u32) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.session.max_reconnect_attempts = max_reconnect_attempts;
    config
}

/// Yield to the runtime until `condition` holds.
async fn until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

/// Let every spawned task run up to its next suspension point.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

async fn connected(max_reconnect_attempts: u32) -> (ConnectionManager, LoopbackTransport) {
    let transport = LoopbackTransport::new();
    let manager = ConnectionManager::new(config(max_reconnect_attempts), transport.clone()).unwrap();
    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    until(|| transport.is_open()).await;
    transport.accept_connection();
    transport.acknowledge_subscriptions();
    pending.await.unwrap().unwrap();
    (manager, transport)
}

#[tokio::test]
async fn concurrent_connects_share_one_socket() {
    let transport = LoopbackTransport::new();
    let manager = ConnectionManager::new(config(5), transport.clone()).unwrap();

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    let second = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    until(|| transport.is_open()).await;
    settle().await;
    assert!(manager.status().connecting);
    assert!(!manager.status().connected);

    transport.accept_connection();
    transport.acknowledge_subscriptions();
    assert_eq!(first.await.unwrap(), Ok(()));
    assert_eq!(second.await.unwrap(), Ok(()));

    assert_eq!(transport.sockets_opened(), 1);
    assert_eq!(transport.subscriptions(), vec![TELEMETRY_TOPIC, SOS_TOPIC]);
    let status = manager.status();
    assert!(status.connected);
    assert_eq!(status.reconnect_attempts, 0);

    // Already up: returns at once without touching the transport.
    manager.connect().await.unwrap();
    assert_eq!(transport.sockets_opened(), 1);
}

#[tokio::test]
async fn joined_callers_share_a_failure() {
    let transport = LoopbackTransport::new();
    let manager = ConnectionManager::new(config(5), transport.clone()).unwrap();

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    let second = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    until(|| transport.is_open()).await;
    settle().await;
    transport.fail("connection refused");

    let expected = Err(ConnectionError::Refused("connection refused".into()));
    assert_eq!(first.await.unwrap(), expected);
    assert_eq!(second.await.unwrap(), expected);
    assert_eq!(transport.sockets_opened(), 1);
    assert!(!transport.is_open());
    assert_eq!(manager.status().phase, LinkPhase::Disconnected);
}

#[tokio::test]
async fn refused_transport_fails_connect_and_allows_retry() {
    let transport = LoopbackTransport::refusing("bad credentials");
    let manager = ConnectionManager::new(config(5), transport.clone()).unwrap();

    let err = manager.connect().await.unwrap_err();
    assert_eq!(err, ConnectionError::Refused("bad credentials".into()));
    assert!(!manager.status().connecting);

    // A later connect dials again rather than reusing the failed attempt.
    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, ConnectionError::Refused(_)));
    assert_eq!(transport.sockets_opened(), 2);
}

#[tokio::test]
async fn close_before_subscription_ack_fails_connect() {
    let transport = LoopbackTransport::new();
    let manager = ConnectionManager::new(config(5), transport.clone()).unwrap();
    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    until(|| transport.is_open()).await;
    transport.accept_connection();
    transport.drop_connection("broker went away");

    assert_eq!(
        pending.await.unwrap(),
        Err(ConnectionError::Closed("broker went away".into()))
    );
    assert_eq!(manager.status().phase, LinkPhase::Disconnected);
}

#[tokio::test]
async fn refused_subscription_fails_connect() {
    let transport = LoopbackTransport::new();
    let manager = ConnectionManager::new(config(5), transport.clone()).unwrap();
    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    until(|| transport.is_open()).await;
    transport.accept_connection();
    until(|| transport.subscribe_requests() == 1).await;
    transport.reject_subscriptions("not authorised");

    assert_eq!(
        pending.await.unwrap(),
        Err(ConnectionError::Refused("subscription rejected: not authorised".into()))
    );
    let status = manager.status();
    assert!(!status.connected);
    assert_eq!(status.phase, LinkPhase::Disconnected);
    assert!(!transport.is_open());
}

#[tokio::test(start_paused = true)]
async fn missing_subscription_ack_times_out() {
    let transport = LoopbackTransport::new();
    let mut config = config(5);
    config.session.connect_timeout = Duration::from_secs(3);
    let manager = ConnectionManager::new(config, transport.clone()).unwrap();

    let err = manager.connect().await.unwrap_err();
    assert_eq!(err, ConnectionError::Timeout(Duration::from_secs(3)));
    assert!(!transport.is_open());
    assert!(!manager.status().connecting);
}

#[tokio::test]
async fn disconnect_cancels_an_in_flight_connect() {
    let transport = LoopbackTransport::new();
    let manager = ConnectionManager::new(config(5), transport.clone()).unwrap();
    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    until(|| transport.is_open()).await;

    manager.disconnect();
    assert_eq!(pending.await.unwrap(), Err(ConnectionError::Cancelled));

    // The late handshake has nowhere to land.
    assert!(!transport.accept_connection());
    assert!(!transport.acknowledge_subscriptions());
    settle().await;
    let status = manager.status();
    assert!(!status.connected);
    assert!(!status.connecting);
    assert_eq!(status.reconnect_attempts, 0);
}

#[tokio::test]
async fn disconnect_is_safe_to_repeat() {
    let manager = ConnectionManager::new(config(5), LoopbackTransport::new()).unwrap();
    manager.disconnect();

    let (manager, transport) = connected(5).await;
    manager.disconnect();
    manager.disconnect();
    assert!(!transport.is_open());
    assert_eq!(manager.status().phase, LinkPhase::Disconnected);
}

#[tokio::test]
async fn publish_without_link_fails_and_sends_nothing() {
    let transport = LoopbackTransport::new();
    let manager = ConnectionManager::new(config(5), transport.clone()).unwrap();

    assert!(matches!(manager.publish_sos("H-01"), Err(LinkError::NotConnected)));
    assert!(matches!(
        manager.publish(SOS_TOPIC, SOS_BROADCAST),
        Err(LinkError::NotConnected)
    ));
    assert!(transport.published().is_empty());
    assert_eq!(transport.sockets_opened(), 0);
    assert_eq!(manager.metrics().snapshot().published, 0);
}

#[tokio::test]
async fn publish_while_redialling_is_rejected() {
    let (manager, transport) = connected(5).await;
    manager.publish_sos(SOS_BROADCAST).unwrap();

    transport.drop_connection("keep-alive timeout");
    until(|| manager.status().reconnect_attempts == 1).await;
    assert!(matches!(manager.publish_sos("H-02"), Err(LinkError::NotConnected)));

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, SOS_TOPIC);
    assert_eq!(&published[0].1[..], SOS_BROADCAST.as_bytes());
}

#[tokio::test]
async fn redial_resubscribes_and_resets_the_counter() {
    let (manager, transport) = connected(5).await;
    let mut events = manager.subscribe_events();

    transport.drop_connection("network blip");
    transport.fail("dns failure");
    until(|| manager.status().reconnect_attempts == 2).await;
    let status = manager.status();
    assert!(!status.connected);
    assert!(status.connecting);

    // connect() while redialling is a no-op.
    manager.connect().await.unwrap();
    assert_eq!(transport.sockets_opened(), 1);

    transport.accept_connection();
    transport.acknowledge_subscriptions();
    until(|| manager.status().connected).await;
    assert_eq!(manager.status().reconnect_attempts, 0);
    assert_eq!(transport.subscribe_requests(), 2);

    assert_eq!(events.recv().await.unwrap(), LinkEvent::Reconnecting { attempt: 1 });
    assert_eq!(events.recv().await.unwrap(), LinkEvent::Reconnecting { attempt: 2 });
    assert_eq!(events.recv().await.unwrap(), LinkEvent::Connected);
    assert_eq!(manager.metrics().snapshot().reconnects, 2);
}

#[tokio::test]
async fn reconnect_ceiling_closes_the_link_for_good() {
    let max = 3;
    let (manager, transport) = connected(max).await;
    let mut events = manager.subscribe_events();

    transport.drop_connection("link lost");
    for _ in 0..max {
        until(|| transport.is_open()).await;
        transport.fail("still unreachable");
    }
    until(|| manager.status().exhausted).await;

    let status = manager.status();
    assert!(!status.connected);
    assert!(!status.connecting);
    assert_eq!(status.phase, LinkPhase::Exhausted(max + 1));
    assert!(!transport.is_open());
    assert_eq!(transport.sockets_opened(), 1);

    // Nothing the old socket might still say is honoured.
    assert!(!transport.accept_connection());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.last(), Some(&LinkEvent::Exhausted { attempts: max + 1 }));

    // An explicit connect starts over with a new socket.
    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    until(|| transport.is_open()).await;
    transport.accept_connection();
    transport.acknowledge_subscriptions();
    pending.await.unwrap().unwrap();
    assert_eq!(transport.sockets_opened(), 2);
    assert_eq!(manager.status().reconnect_attempts, 0);
}

/// Loopback whose closed links take a while to flush, like a socket with
/// frames still queued.
struct SlowFlush {
    inner: LoopbackTransport,
    flushed: Arc<AtomicBool>,
}

struct SlowFlushLink {
    inner: Arc<dyn Link>,
    flushed: Arc<AtomicBool>,
}

impl Transport for SlowFlush {
    fn name(&self) -> &'static str {
        "slow-flush"
    }

    fn open(
        &self,
        options: &ConnectOptions,
    ) -> Result<(Arc<dyn Link>, mpsc::UnboundedReceiver<TransportEvent>), LinkError> {
        let (inner, events) = self.inner.open(options)?;
        let link: Arc<dyn Link> = Arc::new(SlowFlushLink {
            inner,
            flushed: Arc::clone(&self.flushed),
        });
        Ok((link, events))
    }
}

impl Link for SlowFlushLink {
    fn subscribe(&self, topics: &[&str]) -> Result<(), LinkError> {
        self.inner.subscribe(topics)
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        self.inner.publish(topic, payload)
    }

    fn close(&self) -> Option<JoinHandle<()>> {
        self.inner.close();
        let flushed = Arc::clone(&self.flushed);
        Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flushed.store(true, Ordering::SeqCst);
        }))
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_queued_frames_to_flush() {
    let loopback = LoopbackTransport::auto();
    let flushed = Arc::new(AtomicBool::new(false));
    let manager = ConnectionManager::new(
        config(5),
        SlowFlush {
            inner: loopback.clone(),
            flushed: Arc::clone(&flushed),
        },
    )
    .unwrap();

    manager.connect().await.unwrap();
    manager.publish_sos("H-11").unwrap();
    manager.shutdown().await;

    assert!(flushed.load(Ordering::SeqCst));
    assert_eq!(loopback.published().len(), 1);
    assert_eq!(manager.status().phase, LinkPhase::Disconnected);

    // Nothing left to wait for.
    manager.shutdown().await;
}
