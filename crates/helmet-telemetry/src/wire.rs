//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry link, frame decoding and fan-out."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Wire topics and the frame decoder.
//!
//! Telemetry frames are plain text, `deviceId,status,gForce,acceleration,latitude,longitude,heartRate`,
//! with no escaping. SOS frames are free text carried verbatim.
use serde::Serialize;

use crate::error::DecodeError;
use crate::geo::Coordinate;
use crate::status::{HelmetStatus, StatusValue};

/// Topic carrying helmet telemetry frames.
pub const TELEMETRY_TOPIC: &str = "data";
/// Topic carrying SOS alerts.
pub const SOS_TOPIC: &str = "soschannel";
/// SOS payload addressing every helmet rather than one device.
pub const SOS_BROADCAST: &str = "sos";
/// Field separator inside a telemetry frame.
pub const FIELD_DELIMITER: char = ',';
/// Number of fields in a telemetry frame.
pub const TELEMETRY_FIELDS: usize = 7;

/// Heart rate placeholder written when the device has no reading.
const HEART_RATE_UNAVAILABLE: &str = "N/A";

/// The two topics the client subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Helmet telemetry.
    Telemetry,
    /// Emergency alerts.
    Sos,
}

impl Topic {
    /// Every subscribed topic, in subscription order.
    pub const ALL: [Topic; 2] = [Topic::Telemetry, Topic::Sos];

    /// Wire name of the topic.
    pub fn name(&self) -> &'static str {
        match self {
            Topic::Telemetry => TELEMETRY_TOPIC,
            Topic::Sos => SOS_TOPIC,
        }
    }

    /// Resolve a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            TELEMETRY_TOPIC => Some(Topic::Telemetry),
            SOS_TOPIC => Some(Topic::Sos),
            _ => None,
        }
    }
}

/// One decoded helmet telemetry frame.
///
/// Numeric fields hold `NaN` when the device sent something non-numeric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    /// Helmet identifier; also the roster join key.
    pub device_id: String,
    /// Device-reported status token, untouched.
    pub status: String,
    /// Impact sensor reading.
    pub g_force: f64,
    /// Acceleration magnitude.
    pub acceleration: f64,
    /// WGS84 latitude in degrees.
    pub latitude: f64,
    /// WGS84 longitude in degrees.
    pub longitude: f64,
    /// Beats per minute; `None` when unavailable. Zero is a real reading.
    pub heart_rate: Option<i64>,
}

impl TelemetryRecord {
    /// GPS fix, if both coordinates are finite.
    pub fn position(&self) -> Option<Coordinate> {
        Coordinate::checked(self.latitude, self.longitude)
    }

    /// Status token as a classifier input. An empty token counts as absent.
    pub fn status_value(&self) -> StatusValue {
        if self.status.trim().is_empty() {
            StatusValue::Missing
        } else {
            StatusValue::Text(self.status.clone())
        }
    }

    /// Classified helmet status.
    pub fn helmet_status(&self) -> HelmetStatus {
        HelmetStatus::classify(&self.status_value())
    }

    /// Render back into the wire layout.
    pub fn encode(&self) -> String {
        let heart_rate = self
            .heart_rate
            .map(|bpm| bpm.to_string())
            .unwrap_or_else(|| HEART_RATE_UNAVAILABLE.to_owned());
        format!(
            "{},{},{},{},{},{},{}",
            self.device_id,
            self.status,
            self.g_force,
            self.acceleration,
            self.latitude,
            self.longitude,
            heart_rate
        )
    }
}

/// Raw SOS payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SosEvent {
    /// Frame text exactly as received.
    pub payload: String,
}

impl SosEvent {
    /// Wrap a payload.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Whether the alert addresses every helmet.
    pub fn is_broadcast(&self) -> bool {
        self.payload.trim().eq_ignore_ascii_case(SOS_BROADCAST)
    }

    /// Targeted helmet, when the alert is not a broadcast.
    pub fn target(&self) -> Option<&str> {
        let trimmed = self.payload.trim();
        if trimmed.is_empty() || self.is_broadcast() {
            None
        } else {
            Some(trimmed)
        }
    }
}

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Well-formed telemetry frame.
    Telemetry(TelemetryRecord),
    /// SOS frame.
    Sos(SosEvent),
    /// Frame that must be dropped.
    Rejected(DecodeError),
}

/// Decode a frame received on `topic`.
pub fn decode(topic: &str, payload: &[u8]) -> Decoded {
    let text = String::from_utf8_lossy(payload);
    match Topic::from_name(topic) {
        Some(Topic::Telemetry) => match decode_telemetry(&text) {
            Ok(record) => Decoded::Telemetry(record),
            Err(err) => Decoded::Rejected(err),
        },
        Some(Topic::Sos) => Decoded::Sos(SosEvent::new(text.into_owned())),
        None => Decoded::Rejected(DecodeError::UnknownTopic(topic.to_owned())),
    }
}

/// Decode a telemetry frame. Only a field-count mismatch fails; bad numbers
/// become `NaN` (or `None` for heart rate).
pub fn decode_telemetry(frame: &str) -> Result<TelemetryRecord, DecodeError> {
    let fields: Vec<&str> = frame.split(FIELD_DELIMITER).collect();
    let [device_id, status, g_force, acceleration, latitude, longitude, heart_rate] =
        fields.as_slice()
    else {
        return Err(DecodeError::FieldCount {
            expected: TELEMETRY_FIELDS,
            actual: fields.len(),
        });
    };

    Ok(TelemetryRecord {
        device_id: (*device_id).to_owned(),
        status: (*status).to_owned(),
        g_force: parse_decimal(g_force),
        acceleration: parse_decimal(acceleration),
        latitude: parse_decimal(latitude),
        longitude: parse_decimal(longitude),
        heart_rate: parse_integer(heart_rate),
    })
}

/// Lenient decimal parse: the longest numeric prefix wins, otherwise `NaN`.
fn parse_decimal(field: &str) -> f64 {
    let field = field.trim();
    if let Ok(value) = field.parse::<f64>() {
        return value;
    }
    decimal_prefix(field).parse().unwrap_or(f64::NAN)
}

/// Longest prefix shaped like `[+-]digits[.digits][e[+-]digits]`, found in
/// one pass. Empty when no mantissa digit leads the field.
fn decimal_prefix(field: &str) -> &str {
    let bytes = field.as_bytes();
    let digits_from = |start: usize| {
        start
            + bytes[start.min(bytes.len())..]
                .iter()
                .take_while(|byte| byte.is_ascii_digit())
                .count()
    };

    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let integer_end = digits_from(end);
    let mut mantissa_digits = integer_end - end;
    end = integer_end;
    if bytes.get(end) == Some(&b'.') {
        let fraction_end = digits_from(end + 1);
        mantissa_digits += fraction_end - (end + 1);
        if mantissa_digits > 0 {
            end = fraction_end;
        }
    }
    if mantissa_digits == 0 {
        return "";
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exponent = end + 1;
        if matches!(bytes.get(exponent), Some(b'+' | b'-')) {
            exponent += 1;
        }
        let exponent_end = digits_from(exponent);
        if exponent_end > exponent {
            end = exponent_end;
        }
    }
    &field[..end]
}

/// Lenient integer parse: optional sign followed by leading digits.
fn parse_integer(field: &str) -> Option<i64> {
    let field = field.trim();
    let unsigned = field.strip_prefix(['+', '-']).unwrap_or(field);
    let digits = unsigned
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(unsigned.len());
    if digits == 0 {
        return None;
    }
    let sign_len = field.len() - unsigned.len();
    field[..sign_len + digits].parse().ok()
}
