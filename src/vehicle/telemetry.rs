//! Telemetry subgroups mirrored from the vehicle. Field names follow the REST
//! surface: each struct serializes as one `/drone/{id}/{resource}` payload.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Info {
    #[serde(rename = "Type")]
    pub kind: String,
    pub firmware: String,
    pub firmware_git: String,
    pub protocol: String,
    pub uid: u64,
    pub capabilities: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub last_online: Option<DateTime<Utc>>,
}

impl Default for Info {
    fn default() -> Self {
        Self {
            kind: "Generic Vehicle".to_string(),
            firmware: "Generic Autopilot".to_string(),
            firmware_git: String::new(),
            protocol: String::new(),
            uid: 0,
            capabilities: 0,
            last_update: None,
            last_online: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Status {
    pub online: bool,
    pub armed: bool,
    pub state: String,
    #[serde(rename = "VTOLMode")]
    pub vtol_mode: String,
    pub in_air: bool,
    pub power: u8,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            online: false,
            armed: false,
            state: "Unknown".to_string(),
            vtol_mode: "Not a VTOL vehicle".to_string(),
            in_air: false,
            power: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Gps {
    pub satellites: u8,
    pub latitude: f32,
    pub longitude: f32,
    pub altitude: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Attitude {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub latitude: f32,
    pub longitude: f32,
    pub altitude: f32,
    pub heading: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Input {
    pub channels: [u16; 18],
    pub signal: u8,
    pub source: String,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            channels: [0; 18],
            signal: 0,
            source: "Unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Rate {
    pub airspeed: f32,
    pub groundspeed: f32,
    pub throttle: u16,
    pub climb: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Target {
    pub attitude: [f32; 4],
    pub thrust: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub latitude: f32,
    pub longitude: f32,
    pub altitude: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Sensors {
    pub acc_x: f32,
    pub acc_y: f32,
    pub acc_z: f32,
    pub gyro_x: f32,
    pub gyro_y: f32,
    pub gyro_z: f32,
    pub mag_x: f32,
    pub mag_y: f32,
    pub mag_z: f32,
    pub baro: f32,
    pub temp: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Home {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub latitude: f32,
    pub longitude: f32,
    pub altitude: f32,
}

/// One STATUSTEXT entry in the bounded syslog ring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VehicleLog {
    pub msg: String,
    pub time: DateTime<Utc>,
    pub level: u8,
}

/// Deep copy of every subgroup, taken under one read lock so REST
/// serialization happens lock-free.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TelemetrySnapshot {
    pub info: Info,
    pub status: Status,
    pub mode: String,
    pub gps: Gps,
    pub attitude: Attitude,
    pub position: Position,
    pub motors: [u16; 8],
    pub input: Input,
    pub rates: Rate,
    pub target: Target,
    pub sensors: Sensors,
    pub home: Home,
}

impl TelemetrySnapshot {
    /// Looks up one subgroup by its REST resource key.
    pub fn subgroup(&self, kind: &str) -> Option<serde_json::Value> {
        let value = serde_json::to_value(self).ok()?;
        value.get(kind).cloned()
    }
}
