//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry link, frame decoding and fan-out."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::Serialize;

/// Status as reported by a device or typed by an operator.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusValue {
    /// Numeric status code.
    Number(f64),
    /// Textual status token.
    Text(String),
    /// No status reported.
    Missing,
}

impl From<i32> for StatusValue {
    fn from(value: i32) -> Self {
        StatusValue::Number(f64::from(value))
    }
}

impl From<i64> for StatusValue {
    fn from(value: i64) -> Self {
        StatusValue::Number(value as f64)
    }
}

impl From<f64> for StatusValue {
    fn from(value: f64) -> Self {
        StatusValue::Number(value)
    }
}

impl From<&str> for StatusValue {
    fn from(value: &str) -> Self {
        StatusValue::Text(value.to_owned())
    }
}

impl From<String> for StatusValue {
    fn from(value: String) -> Self {
        StatusValue::Text(value)
    }
}

impl<T: Into<StatusValue>> From<Option<T>> for StatusValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(StatusValue::Missing, Into::into)
    }
}

/// Three-way helmet classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HelmetStatus {
    /// Device reports `0`.
    Normal,
    /// Device reports `1`, `SOS` or `EMERGENCY`.
    Sos,
    /// Anything else, including no status at all.
    Offline,
}

impl HelmetStatus {
    /// Classify a status value. Total over every input.
    pub fn classify(value: &StatusValue) -> Self {
        match value {
            StatusValue::Number(code) if *code == 0.0 => HelmetStatus::Normal,
            StatusValue::Number(code) if *code == 1.0 => HelmetStatus::Sos,
            StatusValue::Text(token) => match token.trim() {
                "0" => HelmetStatus::Normal,
                "1" => HelmetStatus::Sos,
                other
                    if other.eq_ignore_ascii_case("sos")
                        || other.eq_ignore_ascii_case("emergency") =>
                {
                    HelmetStatus::Sos
                }
                _ => HelmetStatus::Offline,
            },
            _ => HelmetStatus::Offline,
        }
    }

    /// Display text.
    pub fn text(&self) -> &'static str {
        match self {
            HelmetStatus::Normal => "normal",
            HelmetStatus::Sos => "sos",
            HelmetStatus::Offline => "offline",
        }
    }

    /// Display color.
    pub fn color(&self) -> StatusColor {
        match self {
            HelmetStatus::Normal => StatusColor::Green,
            HelmetStatus::Sos => StatusColor::Red,
            HelmetStatus::Offline => StatusColor::Gray,
        }
    }
}

/// Marker color used by map and list screens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusColor {
    /// Normal.
    Green,
    /// SOS.
    Red,
    /// Offline or unknown.
    Gray,
}

impl StatusColor {
    /// Lowercase color name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusColor::Green => "green",
            StatusColor::Red => "red",
            StatusColor::Gray => "gray",
        }
    }
}

/// Text and color pair handed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusDisplay {
    /// Classification the pair was derived from.
    pub status: HelmetStatus,
    /// Display text.
    pub text: &'static str,
    /// Display color.
    pub color: StatusColor,
}

/// Classify a status and return its display pair.
pub fn format_helmet_status(value: impl Into<StatusValue>) -> StatusDisplay {
    let status = HelmetStatus::classify(&value.into());
    StatusDisplay {
        status,
        text: status.text(),
        color: status.color(),
    }
}
