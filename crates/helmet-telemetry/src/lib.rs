//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry link, frame decoding and fan-out."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Real-time telemetry ingestion for construction-site smart helmets.
//!
//! A single [`ConnectionManager`] owns the broker link for the whole
//! application. Frames arriving on the telemetry and SOS topics are decoded
//! once at the boundary and fanned out to every registered listener; screens
//! fold the stream into their own [`FleetState`].
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod fleet;
pub mod geo;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod state;
pub mod status;
pub mod transport;
pub mod wire;

/// Shared result type for link operations.
pub type Result<T> = std::result::Result<T, LinkError>;

pub use config::{BrokerConfig, BrokerEndpoint, BrokerScheme, ClientConfig, DistanceCacheConfig, SessionConfig};
pub use error::{ConnectionError, DecodeError, LinkError, ObserverError};
pub use fleet::{DeviceSnapshot, FleetState, FleetSummary};
pub use geo::{haversine_m, CacheStats, Coordinate, DistanceCache};
pub use manager::{ConnectionManager, LinkEvent};
pub use metrics::{IngestMetrics, IngestSnapshot};
pub use registry::{DispatchReport, Listener, ListenerId, ListenerRegistry, Subscription};
pub use state::{LinkAction, LinkInput, LinkPhase, LinkStatus};
pub use status::{format_helmet_status, HelmetStatus, StatusColor, StatusDisplay, StatusValue};
pub use transport::{ConnectOptions, Link, LoopbackTransport, MqttTransport, Transport, TransportEvent};
pub use wire::{decode, Decoded, SosEvent, TelemetryRecord, Topic, SOS_BROADCAST, SOS_TOPIC, TELEMETRY_TOPIC};
