//! Device record data model and optimistic patches.
//!
//! A [DeviceRecord] is a point-in-time snapshot produced by the remote store;
//! the client never invents sensor data. Between polls, user commands are
//! layered on top of the last fetched record as [OptimisticPatch]es.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Reported device liveness. Anything the store does not explicitly mark
/// `"online"` renders as offline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    #[serde(other)]
    Offline,
}

impl Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A single sensor reading. `value` is `None` when the device has not
/// reported one yet.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub unit: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorMode {
    #[default]
    Manual,
    Auto,
}

impl Display for ActuatorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorMode::Manual => write!(f, "manual"),
            ActuatorMode::Auto => write!(f, "auto"),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown actuator mode '{0}', expected 'manual' or 'auto'")]
pub struct InvalidModeError(String);

impl FromStr for ActuatorMode {
    type Err = InvalidModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ActuatorMode::Manual),
            "auto" => Ok(ActuatorMode::Auto),
            other => Err(InvalidModeError(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Actuator {
    #[serde(default)]
    pub state: bool,
    #[serde(default)]
    pub mode: ActuatorMode,
}

/// A configuration value; the store carries numbers and booleans.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Number(f64),
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Bool(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Number(value)
    }
}

impl Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(b) => b.fmt(f),
            SettingValue::Number(n) => n.fmt(f),
        }
    }
}

/// Snapshot of a single device as stored at `devices/{deviceId}`.
///
/// Deserialization is lenient: records in the store are written by several
/// producers and may carry only some of the sections, so every field
/// defaults when absent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub sensors: BTreeMap<String, Sensor>,
    #[serde(default)]
    pub actuators: BTreeMap<String, Actuator>,
    #[serde(default)]
    pub settings: BTreeMap<String, SettingValue>,
}

impl DeviceRecord {
    /// Applies a pending patch on top of this record.
    ///
    /// Patches only override values the record already carries; a patch
    /// addressing an unknown actuator or setting leaves the record
    /// unchanged (the remote write still goes out, and the next poll shows
    /// the store's truth).
    pub fn apply(&mut self, patch: &OptimisticPatch) {
        match patch
            .path
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .as_slice()
        {
            ["actuators", key, field] => {
                if let Some(actuator) = self.actuators.get_mut(*key) {
                    match (*field, &patch.value) {
                        ("state", Value::Bool(on)) => actuator.state = *on,
                        ("mode", Value::String(mode)) => {
                            if let Ok(mode) = mode.parse() {
                                actuator.mode = mode;
                            }
                        }
                        _ => {}
                    }
                }
            }
            ["settings", key] => {
                if let Some(slot) = self.settings.get_mut(*key) {
                    if let Ok(value) = serde_json::from_value(patch.value.clone()) {
                        *slot = value;
                    }
                }
            }
            _ => {}
        }
    }

    /// The blended state: this record with pending patches layered on in
    /// issue order.
    pub fn with_patches(mut self, patches: &[OptimisticPatch]) -> Self {
        for patch in patches {
            self.apply(patch);
        }
        self
    }
}

/// A local override pending confirmation by the next poll.
///
/// `path` is relative to `devices/{deviceId}` and doubles as the remote
/// write sub-path for the command that created the patch.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimisticPatch {
    pub path: Vec<String>,
    pub value: Value,
}

impl OptimisticPatch {
    pub fn actuator_state(actuator: &str, on: bool) -> Self {
        Self {
            path: vec!["actuators".into(), actuator.into(), "state".into()],
            value: Value::Bool(on),
        }
    }

    pub fn actuator_mode(actuator: &str, mode: ActuatorMode) -> Self {
        Self {
            path: vec!["actuators".into(), actuator.into(), "mode".into()],
            value: Value::String(mode.to_string()),
        }
    }

    pub fn setting(key: &str, value: SettingValue) -> Self {
        Self {
            path: vec!["settings".into(), key.into()],
            value: match value {
                SettingValue::Bool(b) => Value::Bool(b),
                SettingValue::Number(n) => serde_json::json!(n),
            },
        }
    }
}
