//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry link, frame decoding and fan-out."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use serde::Serialize;

/// Point-in-time copy of the ingest counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    /// Frames received on any topic.
    pub frames_received: u64,
    /// Telemetry frames decoded and dispatched.
    pub telemetry_decoded: u64,
    /// SOS frames dispatched.
    pub sos_received: u64,
    /// Frames dropped by the decoder.
    pub frames_rejected: u64,
    /// Listener invocations that errored or panicked.
    pub observer_failures: u64,
    /// Frames published by this client.
    pub published: u64,
    /// Redials after a lost session.
    pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
    frames_received: AtomicU64,
    telemetry_decoded: AtomicU64,
    sos_received: AtomicU64,
    frames_rejected: AtomicU64,
    observer_failures: AtomicU64,
    published: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Clone)]
struct Exporter {
    frames_total: IntCounterVec,
    rejected_total: IntCounter,
    observer_failures_total: IntCounter,
    published_total: IntCounter,
    reconnects_total: IntCounter,
}

impl Exporter {
    fn register(registry: &Registry) -> prometheus::Result<Self> {
        let frames_total = IntCounterVec::new(
            Opts::new("helmet_frames_total", "Frames dispatched to listeners by topic"),
            &["topic"],
        )?;
        registry.register(Box::new(frames_total.clone()))?;

        let rejected_total = IntCounter::new(
            "helmet_frames_rejected_total",
            "Frames dropped because they could not be decoded",
        )?;
        registry.register(Box::new(rejected_total.clone()))?;

        let observer_failures_total = IntCounter::new(
            "helmet_observer_failures_total",
            "Listener invocations that failed during fan-out",
        )?;
        registry.register(Box::new(observer_failures_total.clone()))?;

        let published_total =
            IntCounter::new("helmet_published_total", "Frames published to the broker")?;
        registry.register(Box::new(published_total.clone()))?;

        let reconnects_total = IntCounter::new(
            "helmet_reconnects_total",
            "Redial attempts after a lost broker session",
        )?;
        registry.register(Box::new(reconnects_total.clone()))?;

        Ok(Self {
            frames_total,
            rejected_total,
            observer_failures_total,
            published_total,
            reconnects_total,
        })
    }
}

/// Ingest counters shared between the manager and its observers.
#[derive(Default)]
pub struct IngestMetrics {
    counters: Counters,
    exporter: Option<Exporter>,
}

impl IngestMetrics {
    /// Counters without an exporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters that are also exported on `registry`.
    pub fn with_registry(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            counters: Counters::default(),
            exporter: Some(Exporter::register(registry)?),
        })
    }

    pub(crate) fn record_frame(&self) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_telemetry(&self) {
        self.counters.telemetry_decoded.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.frames_total.with_label_values(&["telemetry"]).inc();
        }
    }

    pub(crate) fn record_sos(&self) {
        self.counters.sos_received.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.frames_total.with_label_values(&["sos"]).inc();
        }
    }

    pub(crate) fn record_rejected(&self) {
        self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.rejected_total.inc();
        }
    }

    pub(crate) fn record_observer_failures(&self, failed: usize) {
        if failed == 0 {
            return;
        }
        let failed = failed as u64;
        self.counters
            .observer_failures
            .fetch_add(failed, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.observer_failures_total.inc_by(failed);
        }
    }

    pub(crate) fn record_published(&self) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.published_total.inc();
        }
    }

    pub(crate) fn record_reconnect(&self) {
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.reconnects_total.inc();
        }
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> IngestSnapshot {
        let c = &self.counters;
        IngestSnapshot {
            frames_received: c.frames_received.load(Ordering::Relaxed),
            telemetry_decoded: c.telemetry_decoded.load(Ordering::Relaxed),
            sos_received: c.sos_received.load(Ordering::Relaxed),
            frames_rejected: c.frames_rejected.load(Ordering::Relaxed),
            observer_failures: c.observer_failures.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for IngestMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestMetrics")
            .field("snapshot", &self.snapshot())
            .field("exported", &self.exporter.is_some())
            .finish()
    }
}
