//! Downlink bus messages and the known control topics.
//!
//! Every downlink frame is a `{topic, timestamp, data}` envelope.
//! Envelopes are validated once, at the router boundary, by
//! [`BusMessage::from_value`]. Known control topics get a typed
//! [`ControlCommand`]; anything else passes through untouched.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::EnvelopeError;

/// Topic used when an envelope carries none.
pub const UNKNOWN_TOPIC: &str = "unknown";

/// Wall-clock seconds since the Unix epoch, as a float.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ── BusMessage ───────────────────────────────────────────────────

/// One publish/subscribe message on the downlink channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Dispatch key.
    pub topic: String,
    /// Sender timestamp, float seconds.
    pub timestamp: f64,
    /// Payload; its shape is owned by the remote endpoint.
    pub data: Value,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            timestamp: unix_now(),
            data,
        }
    }

    /// Validate a decoded frame as a bus envelope.
    ///
    /// Missing fields are filled the way the remote endpoint expects:
    /// topic `"unknown"`, timestamp = now, data = `{}`. Fields of the
    /// wrong type reject the frame.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(mut map) = value else {
            return Err(EnvelopeError::Shape("frame is not a JSON object"));
        };

        let topic = match map.remove("topic") {
            None | Some(Value::Null) => UNKNOWN_TOPIC.to_string(),
            Some(Value::String(s)) => s,
            Some(_) => return Err(EnvelopeError::Shape("`topic` must be a string")),
        };

        let timestamp = match map.remove("timestamp") {
            None | Some(Value::Null) => unix_now(),
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or(EnvelopeError::Shape("`timestamp` is not representable"))?,
            Some(_) => return Err(EnvelopeError::Shape("`timestamp` must be a number")),
        };

        let data = map
            .remove("data")
            .unwrap_or_else(|| Value::Object(Map::new()));

        Ok(Self {
            topic,
            timestamp,
            data,
        })
    }
}

// ── Waypoint ─────────────────────────────────────────────────────

/// A navigation target. On the wire: `[latitude, longitude]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct Waypoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl Waypoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl From<(f64, f64)> for Waypoint {
    fn from((latitude, longitude): (f64, f64)) -> Self {
        Self::new(latitude, longitude)
    }
}

impl From<Waypoint> for (f64, f64) {
    fn from(w: Waypoint) -> Self {
        (w.latitude, w.longitude)
    }
}

impl std::str::FromStr for Waypoint {
    type Err = String;

    /// Parses `"lat,lon"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lat, lon) = s
            .split_once(',')
            .ok_or_else(|| format!("expected `lat,lon`, got `{s}`"))?;
        let lat: f64 = lat.trim().parse().map_err(|e| format!("latitude: {e}"))?;
        let lon: f64 = lon.trim().parse().map_err(|e| format!("longitude: {e}"))?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(format!("coordinates out of range: {lat},{lon}"));
        }
        Ok(Self::new(lat, lon))
    }
}

// ── ControlCommand ───────────────────────────────────────────────

/// The control topics this console produces, keyed by topic name.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Ask the endpoint to re-broadcast its full parameter state.
    RequestFullState,
    /// Take the current heading as zero.
    ZeroHeading,
    /// Replace the navigation route.
    NavSetWaypoints(Vec<Waypoint>),
    NavStart,
    NavStop,
    NavNext,
    NavPrevious,
    /// Any other topic, passed through as-is.
    Other { topic: String, data: Value },
}

impl ControlCommand {
    pub const REQUEST_FULL_STATE: &'static str = "request_broadcast_all_params";
    pub const ZERO_HEADING: &'static str = "set_current_yaw_as_zero";
    pub const NAV_SET_WAYPOINTS: &'static str = "gps_nav_set_waypoints";
    pub const NAV_START: &'static str = "gps_nav_start";
    pub const NAV_STOP: &'static str = "gps_nav_stop";
    pub const NAV_NEXT: &'static str = "gps_nav_next_waypoint";
    pub const NAV_PREVIOUS: &'static str = "gps_nav_prev_waypoint";

    /// Wire topic name.
    pub fn topic(&self) -> &str {
        match self {
            Self::RequestFullState => Self::REQUEST_FULL_STATE,
            Self::ZeroHeading => Self::ZERO_HEADING,
            Self::NavSetWaypoints(_) => Self::NAV_SET_WAYPOINTS,
            Self::NavStart => Self::NAV_START,
            Self::NavStop => Self::NAV_STOP,
            Self::NavNext => Self::NAV_NEXT,
            Self::NavPrevious => Self::NAV_PREVIOUS,
            Self::Other { topic, .. } => topic,
        }
    }

    /// Classify a bus message, validating payloads of known topics.
    ///
    /// Parameterless topics ignore their payload.
    pub fn parse(message: &BusMessage) -> Result<Self, EnvelopeError> {
        let cmd = match message.topic.as_str() {
            Self::REQUEST_FULL_STATE => Self::RequestFullState,
            Self::ZERO_HEADING => Self::ZeroHeading,
            Self::NAV_START => Self::NavStart,
            Self::NAV_STOP => Self::NavStop,
            Self::NAV_NEXT => Self::NavNext,
            Self::NAV_PREVIOUS => Self::NavPrevious,
            Self::NAV_SET_WAYPOINTS => {
                let raw = message.data.get("waypoints").cloned().ok_or_else(|| {
                    EnvelopeError::Payload {
                        topic: message.topic.clone(),
                        detail: "missing `waypoints`".into(),
                    }
                })?;
                let waypoints: Vec<Waypoint> =
                    serde_json::from_value(raw).map_err(|e| EnvelopeError::Payload {
                        topic: message.topic.clone(),
                        detail: e.to_string(),
                    })?;
                Self::NavSetWaypoints(waypoints)
            }
            other => Self::Other {
                topic: other.to_string(),
                data: message.data.clone(),
            },
        };
        Ok(cmd)
    }

    /// Build the outbound envelope, stamped with the current time.
    pub fn into_message(self) -> BusMessage {
        let topic = self.topic().to_string();
        let data = match self {
            Self::NavSetWaypoints(waypoints) => json!({ "waypoints": waypoints }),
            Self::Other { data, .. } => data,
            _ => Value::Object(Map::new()),
        };
        BusMessage::new(topic, data)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NavSetWaypoints(w) => write!(f, "{} ({} waypoints)", self.topic(), w.len()),
            _ => f.write_str(self.topic()),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
