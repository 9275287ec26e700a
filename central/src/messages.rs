//! Wire contract with the device fleet and the forecasting collaborator.
//!
//! Inbound payloads are decoded into a closed set of validated events; a
//! malformed message fails the decode step as a whole and is dropped by the
//! dispatcher instead of being partially applied.

use chrono::{Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Category;

/// Devices report state here.
pub const T_SENSOR_PUBLISH: &str = "sensor/publish";
/// Operators and automation submit control intents here.
pub const T_SENSOR_MAIN_CTRL: &str = "sensor/main/ctrl";
/// The forecasting collaborator publishes its raw forecast here.
pub const T_PREDICTIONS: &str = "home/automation/predictions";
/// Per-device command topics hang off this prefix.
pub const T_SENSOR_CTRL_PREFIX: &str = "sensor/update";

/// Reserved `data` value a device sends when it boots.
pub const ONLINE_MARKER: &str = "imOnline";

pub fn device_topic(client_id: &str) -> String {
    format!("{}/{}", T_SENSOR_CTRL_PREFIX, client_id)
}

#[derive(Debug)]
pub enum DecodeError {
    Json(serde_json::Error),
    Field(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Json(e) => write!(f, "JSON decode failed: {}", e),
            DecodeError::Field(msg) => write!(f, "invalid message field: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::Json(e)
    }
}

/// Telemetry envelope exactly as the firmware sends it.
#[derive(Deserialize, Debug)]
struct RawTelemetry {
    #[serde(rename = "type")]
    kind: String,
    time: String,
    client_id: String,
    data: Value,
    #[serde(default)]
    power: Option<Value>,
}

/// A validated inbound telemetry event.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// Bootstrap announcement; registers a placeholder if unknown.
    Online {
        client_id: String,
        category: Category,
    },
    /// A state report to be written to the time series. Door states arrive
    /// as "LOCK"/"UNLOCK" and are normalized to 1/0 here; lights carry the
    /// instantaneous power draw alongside the level.
    Reading {
        client_id: String,
        category: Category,
        timestamp: NaiveDateTime,
        value: String,
        power: Option<f64>,
    },
}

pub fn decode_telemetry(payload: &[u8]) -> Result<TelemetryEvent, DecodeError> {
    let raw: RawTelemetry = serde_json::from_slice(payload)?;
    let category: Category = raw
        .kind
        .parse()
        .map_err(|e: String| DecodeError::Field(e))?;

    if raw.data.as_str() == Some(ONLINE_MARKER) {
        return Ok(TelemetryEvent::Online {
            client_id: raw.client_id,
            category,
        });
    }

    let timestamp = to_local(&raw.time)?;
    let value = match category {
        // Firmware reports "LOCK"/"UNLOCK"; stored as 1/0.
        Category::Door => {
            let locked = raw.data.as_str() == Some("LOCK");
            (if locked { "1" } else { "0" }).to_string()
        }
        _ => scalar_to_string(&raw.data).ok_or_else(|| DecodeError::Field("data".to_string()))?,
    };
    let power = match category {
        Category::Light => raw.power.as_ref().and_then(scalar_to_f64),
        _ => None,
    };

    Ok(TelemetryEvent::Reading {
        client_id: raw.client_id,
        category,
        timestamp,
        value,
        power,
    })
}

/// Devices timestamp in UTC; everything stored and compared is local time.
pub fn to_local(utc: &str) -> Result<NaiveDateTime, DecodeError> {
    let parsed = NaiveDateTime::parse_from_str(utc, "%Y-%m-%d %H:%M:%S")
        .map_err(|e| DecodeError::Field(format!("time {:?}: {}", utc, e)))?;
    Ok(Utc
        .from_utc_datetime(&parsed)
        .with_timezone(&Local)
        .naive_local())
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        _ => None,
    }
}

fn scalar_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Control envelope as posted on the control topic. `id` is accepted as a
/// legacy alias for `name`.
#[derive(Deserialize, Debug)]
struct RawControl {
    name: Option<String>,
    id: Option<String>,
    state: Option<Value>,
    irgb: Option<String>,
    value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlTarget {
    /// One device, addressed by its assigned name.
    Single(String),
    /// Every named device of a category ("ALL-LIGHT" and friends).
    All(Category),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlIntent {
    pub target: ControlTarget,
    pub state: Option<String>,
    pub irgb: Option<String>,
    pub value: Option<String>,
}

pub fn decode_control(payload: &[u8]) -> Result<ControlIntent, DecodeError> {
    let raw: RawControl = serde_json::from_slice(payload)?;
    let name = raw
        .name
        .or(raw.id)
        .ok_or_else(|| DecodeError::Field("name".to_string()))?;
    let target = match batch_category(&name) {
        Some(category) => ControlTarget::All(category),
        None => ControlTarget::Single(name),
    };

    Ok(ControlIntent {
        target,
        state: raw.state.as_ref().and_then(scalar_to_string),
        irgb: raw.irgb,
        value: raw.value.as_ref().and_then(scalar_to_string),
    })
}

fn batch_category(name: &str) -> Option<Category> {
    if name.contains("ALL-SWITCH") {
        Some(Category::Switch)
    } else if name.contains("ALL-LIGHT") {
        Some(Category::Light)
    } else if name.contains("ALL-DOOR") {
        Some(Category::Door)
    } else {
        None
    }
}

/// Outbound command, published to `sensor/update/<client_id>`.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Command {
    State { state: String },
    Level { state: i64 },
    Color { irgb: String },
}

impl Command {
    /// The baseline command the dispatcher sends at startup to reach a known
    /// off state. Only lights and switches participate.
    pub fn off(category: Category) -> Option<Command> {
        match category {
            Category::Light => Some(Command::Level { state: 0 }),
            Category::Switch => Some(Command::State {
                state: "off".to_string(),
            }),
            _ => None,
        }
    }
}

/// Shape the wire command for one device category. `None` means the intent
/// carries nothing this category understands and is silently ignored.
pub fn shape_command(category: Category, intent: &ControlIntent) -> Option<Command> {
    match category {
        Category::Door | Category::Switch => intent
            .state
            .clone()
            .map(|state| Command::State { state }),
        Category::Light => {
            if let Some(irgb) = &intent.irgb {
                Some(Command::Color { irgb: irgb.clone() })
            } else {
                let state = intent.state.as_deref()?;
                let level = match state {
                    "on" => 1,
                    "off" => 0,
                    other => other.parse().ok()?,
                };
                Some(Command::Level { state: level })
            }
        }
        Category::Temp => intent
            .value
            .clone()
            .or_else(|| intent.state.clone())
            .map(|state| Command::State { state }),
        Category::Radar => None,
    }
}
