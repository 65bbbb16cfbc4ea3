//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry link, frame decoding and fan-out."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::any::Any;
use std::time::Duration;

use thiserror::Error;

/// Failure to establish a broker session, surfaced to `connect()` callers.
///
/// `Clone` because every caller joined to the same in-flight attempt receives
/// the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The transport reported an error before the session came up.
    #[error("broker connection failed: {0}")]
    Refused(String),
    /// Subscriptions were not acknowledged within the connect timeout.
    #[error("no subscription acknowledgement within {0:?}")]
    Timeout(Duration),
    /// `disconnect()` was called while the attempt was in flight.
    #[error("connection attempt cancelled by disconnect")]
    Cancelled,
    /// The transport closed before subscriptions were acknowledged.
    #[error("connection closed before subscriptions were acknowledged: {0}")]
    Closed(String),
}

/// Public error type for link operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Session could not be established.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Publish attempted without a live session. Never queued.
    #[error("not connected to broker")]
    NotConnected,
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Transport-level failure outside the connect handshake.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Malformed frame. Logged and dropped, never delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Telemetry frame did not split into the fixed field count.
    #[error("expected {expected} comma separated fields, found {actual}")]
    FieldCount {
        /// Fields required by the frame layout.
        expected: usize,
        /// Fields present in the frame.
        actual: usize,
    },
    /// Frame arrived on a topic this client never subscribed to.
    #[error("frame on unexpected topic {0:?}")]
    UnknownTopic(String),
}

/// Failure raised by a listener. Isolated per listener during fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ObserverError(String);

impl ObserverError {
    /// Construct from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// Convert a caught panic payload into an error.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(text) = payload.downcast_ref::<&'static str>() {
            (*text).to_owned()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Self(format!("listener panicked: {detail}"))
    }

    /// Error message.
    pub fn message(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_described() {
        let from_str = ObserverError::from_panic(Box::new("boom"));
        assert_eq!(from_str.message(), "listener panicked: boom");

        let from_string = ObserverError::from_panic(Box::new(String::from("kaput")));
        assert_eq!(from_string.message(), "listener panicked: kaput");

        let opaque = ObserverError::from_panic(Box::new(42_u8));
        assert!(opaque.message().contains("non-string"));
    }

    #[test]
    fn connection_errors_lift_into_link_errors() {
        let err: LinkError = ConnectionError::Cancelled.into();
        assert!(matches!(err, LinkError::Connection(ConnectionError::Cancelled)));
        assert_eq!(err.to_string(), "connection attempt cancelled by disconnect");
    }
}
