//! In-memory mirror of one vehicle's state. A single read-write lock guards
//! every mutable field; updaters take the write lock for the duration of the
//! update and accessors hand out defensive copies.

use anyhow::{anyhow, Result};
use chrono::Utc;
use mavlink::common::*;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::vehicle::telemetry::*;

/// Liveness groupings surfaced on operator dashboards. Not a MAVLink concept.
pub const SUBSYSTEMS: [&str; 8] = [
    "GPS",
    "Estimator",
    "Controller",
    "RadioControl",
    "Motors",
    "OpticalFlow",
    "RangeFinder",
    "IMU",
];

const ONLINE_TIMEOUT: Duration = Duration::from_secs(5);
const SUBSYSTEM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct SubsystemHealth {
    pub online: bool,
    last_seen: Option<Instant>,
}

#[derive(Debug, Default)]
struct ModelInner {
    system_id: u8,
    info: Info,
    status: Status,
    mode: String,
    gps: Gps,
    attitude: Attitude,
    position: Position,
    motors: [u16; 8],
    input: Input,
    rates: Rate,
    target: Target,
    sensors: Sensors,
    home: Home,
    subsystems: HashMap<&'static str, SubsystemHealth>,
    got_caps: bool,
    last_seen: Option<Instant>,
}

pub struct VehicleModel {
    inner: RwLock<ModelInner>,
}

impl VehicleModel {
    pub fn new() -> Self {
        let mut inner = ModelInner {
            mode: "Unknown Flight Mode".to_string(),
            ..Default::default()
        };
        for name in SUBSYSTEMS {
            inner.subsystems.insert(name, SubsystemHealth::default());
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, ModelInner>> {
        self.inner.write().map_err(|e| anyhow!("lock error: {}", e))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, ModelInner>> {
        self.inner.read().map_err(|e| anyhow!("lock error: {}", e))
    }

    pub fn system_id(&self) -> u8 {
        self.read().map(|g| g.system_id).unwrap_or(0)
    }

    pub fn set_system_id(&self, id: u8) {
        if let Ok(mut g) = self.write() {
            if g.system_id == 0 {
                g.system_id = id;
            }
        }
    }

    // --- updaters, one per inbound message kind ---

    pub fn update_from_heartbeat(&self, m: &HEARTBEAT_DATA) -> Result<()> {
        let mut g = self.write()?;
        if !g.status.online {
            g.info.last_online = Some(Utc::now());
        }
        g.status.online = true;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());

        g.info.kind = vehicle_type_name(m.mavtype).to_string();
        g.info.firmware = autopilot_name(m.autopilot).to_string();
        g.info.protocol = format!("MAVLink v{}", m.mavlink_version);
        g.status.state = system_state_name(m.system_status).to_string();
        // Armed tracks SystemStatus: anything but Active clears it.
        g.status.armed = g.status.state == "Active";
        g.mode = decode_flight_mode(m.custom_mode).to_string();
        Ok(())
    }

    pub fn update_from_sys_status(&self, m: &SYS_STATUS_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.status.power = m.battery_remaining.max(0) as u8;
        Ok(())
    }

    pub fn update_from_gps(&self, m: &GPS_RAW_INT_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.gps.satellites = m.satellites_visible;
        g.gps.latitude = m.lat as f32 / 1e7;
        g.gps.longitude = m.lon as f32 / 1e7;
        g.gps.altitude = m.alt as f32 / 1000.0;
        Ok(())
    }

    pub fn update_from_attitude(&self, m: &ATTITUDE_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.attitude.roll = m.roll.to_degrees();
        g.attitude.pitch = m.pitch.to_degrees();
        g.attitude.yaw = m.yaw.to_degrees();
        Ok(())
    }

    pub fn update_from_local_position(&self, m: &LOCAL_POSITION_NED_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.position.x = m.x;
        g.position.y = m.y;
        g.position.z = m.z;
        Ok(())
    }

    pub fn update_from_global_position(&self, m: &GLOBAL_POSITION_INT_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.position.latitude = m.lat as f32 / 1e7;
        g.position.longitude = m.lon as f32 / 1e7;
        g.position.altitude = m.relative_alt as f32 / 1000.0;
        g.position.heading = m.hdg as f32 / 100.0;
        Ok(())
    }

    pub fn update_from_motors(&self, m: &SERVO_OUTPUT_RAW_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.motors = [
            m.servo1_raw,
            m.servo2_raw,
            m.servo3_raw,
            m.servo4_raw,
            m.servo5_raw,
            m.servo6_raw,
            m.servo7_raw,
            m.servo8_raw,
        ];
        Ok(())
    }

    pub fn update_from_input(&self, m: &RC_CHANNELS_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.input.channels = [
            m.chan1_raw,
            m.chan2_raw,
            m.chan3_raw,
            m.chan4_raw,
            m.chan5_raw,
            m.chan6_raw,
            m.chan7_raw,
            m.chan8_raw,
            m.chan9_raw,
            m.chan10_raw,
            m.chan11_raw,
            m.chan12_raw,
            m.chan13_raw,
            m.chan14_raw,
            m.chan15_raw,
            m.chan16_raw,
            m.chan17_raw,
            m.chan18_raw,
        ];
        g.input.signal = m.rssi;
        g.input.source = "Radio".to_string();
        Ok(())
    }

    pub fn update_from_vfr(&self, m: &VFR_HUD_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.rates.airspeed = m.airspeed;
        g.rates.groundspeed = m.groundspeed;
        g.rates.throttle = m.throttle;
        g.rates.climb = m.climb;
        Ok(())
    }

    pub fn update_from_sensors(&self, m: &HIGHRES_IMU_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.sensors.acc_x = m.xacc;
        g.sensors.acc_y = m.yacc;
        g.sensors.acc_z = m.zacc;
        g.sensors.gyro_x = m.xgyro;
        g.sensors.gyro_y = m.ygyro;
        g.sensors.gyro_z = m.zgyro;
        g.sensors.mag_x = m.xmag;
        g.sensors.mag_y = m.ymag;
        g.sensors.mag_z = m.zmag;
        g.sensors.baro = m.pressure_alt;
        g.sensors.temp = m.temperature;
        Ok(())
    }

    pub fn update_from_attitude_target(&self, m: &ATTITUDE_TARGET_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.target.attitude = m.q;
        g.target.thrust = m.thrust;
        Ok(())
    }

    pub fn update_from_local_target(&self, m: &POSITION_TARGET_LOCAL_NED_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.target.x = m.x;
        g.target.y = m.y;
        g.target.z = m.z;
        Ok(())
    }

    pub fn update_from_global_target(&self, m: &POSITION_TARGET_GLOBAL_INT_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.target.latitude = m.lat_int as f32 / 1e7;
        g.target.longitude = m.lon_int as f32 / 1e7;
        g.target.altitude = m.alt;
        Ok(())
    }

    pub fn update_from_home(&self, m: &HOME_POSITION_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.home.x = m.x;
        g.home.y = m.y;
        g.home.z = m.z;
        g.home.latitude = m.latitude as f32 / 1e7;
        g.home.longitude = m.longitude as f32 / 1e7;
        g.home.altitude = m.altitude as f32 / 1000.0;
        Ok(())
    }

    pub fn update_from_extended_sys_state(&self, m: &EXTENDED_SYS_STATE_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.status.vtol_mode = vtol_state_name(m.vtol_state).to_string();
        g.status.in_air = matches!(m.landed_state, MavLandedState::MAV_LANDED_STATE_IN_AIR);
        Ok(())
    }

    pub fn update_from_autopilot_version(&self, m: &AUTOPILOT_VERSION_DATA) -> Result<()> {
        let mut g = self.write()?;
        g.last_seen = Some(Instant::now());
        g.info.last_update = Some(Utc::now());
        g.info.uid = m.uid;
        g.info.capabilities = m.capabilities.bits();
        g.info.firmware_git = String::from_utf8_lossy(&m.flight_custom_version)
            .trim_end_matches('\0')
            .to_string();
        g.got_caps = true;
        drop(g);
        self.log_capabilities(m.capabilities);
        Ok(())
    }

    /// One log line per advertised capability bit.
    pub fn log_capabilities(&self, caps: MavProtocolCapability) {
        for (bit, name) in CAPABILITY_NAMES {
            if caps.contains(*bit) {
                info!("vehicle capability: {}", name);
            }
        }
    }

    pub fn touch_subsystem(&self, name: &str) {
        if let Ok(mut g) = self.write() {
            if let Some(entry) = g.subsystems.get_mut(name) {
                entry.last_seen = Some(Instant::now());
                entry.online = true;
            }
        }
    }

    /// Marks the vehicle offline once nothing has been heard for 5 s.
    pub fn check_online(&self) {
        if let Ok(mut g) = self.write() {
            let expired = match g.last_seen {
                Some(t) => t.elapsed() > ONLINE_TIMEOUT,
                None => true,
            };
            if g.status.online && expired {
                warn!("vehicle went offline");
                g.status.online = false;
            }
        }
    }

    /// Sweeps subsystem liveness entries against the 5 s window.
    pub fn check_subsystems(&self) {
        if let Ok(mut g) = self.write() {
            for entry in g.subsystems.values_mut() {
                let expired = match entry.last_seen {
                    Some(t) => t.elapsed() > SUBSYSTEM_TIMEOUT,
                    None => true,
                };
                if expired {
                    entry.online = false;
                }
            }
        }
    }

    /// Drops volatile MAVLink bookkeeping while keeping the last-known
    /// telemetry so a reconnecting drone resumes with history intact.
    pub fn scrub(&self) {
        if let Ok(mut g) = self.write() {
            g.got_caps = false;
        }
    }

    // --- accessors (defensive copies) ---

    pub fn snapshot(&self) -> Result<TelemetrySnapshot> {
        let g = self.read()?;
        Ok(TelemetrySnapshot {
            info: g.info.clone(),
            status: g.status.clone(),
            mode: g.mode.clone(),
            gps: g.gps.clone(),
            attitude: g.attitude.clone(),
            position: g.position.clone(),
            motors: g.motors,
            input: g.input.clone(),
            rates: g.rates.clone(),
            target: g.target.clone(),
            sensors: g.sensors.clone(),
            home: g.home.clone(),
        })
    }

    pub fn online(&self) -> bool {
        self.read().map(|g| g.status.online).unwrap_or(false)
    }

    pub fn armed(&self) -> bool {
        self.read().map(|g| g.status.armed).unwrap_or(false)
    }

    pub fn mode(&self) -> String {
        self.read()
            .map(|g| g.mode.clone())
            .unwrap_or_else(|_| "Unknown Flight Mode".to_string())
    }

    pub fn state(&self) -> String {
        self.read()
            .map(|g| g.status.state.clone())
            .unwrap_or_else(|_| "Unknown".to_string())
    }

    pub fn got_caps(&self) -> bool {
        self.read().map(|g| g.got_caps).unwrap_or(false)
    }

    pub fn home(&self) -> Home {
        self.read().map(|g| g.home.clone()).unwrap_or_default()
    }

    pub fn global_position(&self) -> Position {
        self.read().map(|g| g.position.clone()).unwrap_or_default()
    }

    /// Metres above sea level, from the GPS fix.
    pub fn amsl_altitude(&self) -> f32 {
        self.read().map(|g| g.gps.altitude).unwrap_or(0.0)
    }

    pub fn subsystems(&self) -> HashMap<String, bool> {
        self.read()
            .map(|g| {
                g.subsystems
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.online))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for VehicleModel {
    fn default() -> Self {
        Self::new()
    }
}

// --- fixed mapping tables ---

fn vehicle_type_name(t: MavType) -> &'static str {
    match t {
        MavType::MAV_TYPE_FIXED_WING => "Fixed Wing",
        MavType::MAV_TYPE_QUADROTOR => "Quadrotor",
        MavType::MAV_TYPE_HEXAROTOR => "Hexarotor",
        MavType::MAV_TYPE_OCTOROTOR => "Octorotor",
        MavType::MAV_TYPE_VTOL_TILTROTOR => "VTOL Tiltrotor",
        // Tailsitter entries 19/20 go by different names across dialect
        // revisions, so they are matched numerically.
        t if t as u32 == 19 || t as u32 == 20 => "VTOL Tailsitter",
        _ => "Generic Vehicle",
    }
}

fn autopilot_name(a: MavAutopilot) -> &'static str {
    match a {
        MavAutopilot::MAV_AUTOPILOT_SLUGS => "SLUGS",
        MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA => "APM",
        MavAutopilot::MAV_AUTOPILOT_OPENPILOT => "OpenPilot",
        MavAutopilot::MAV_AUTOPILOT_PPZ => "Paparazzi UAV",
        MavAutopilot::MAV_AUTOPILOT_FP => "FlexiPilot",
        MavAutopilot::MAV_AUTOPILOT_PX4 => "PX4",
        MavAutopilot::MAV_AUTOPILOT_SMACCMPILOT => "SMACCMPilot",
        MavAutopilot::MAV_AUTOPILOT_AUTOQUAD => "AutoQuad",
        MavAutopilot::MAV_AUTOPILOT_ARMAZILA => "Armazila",
        MavAutopilot::MAV_AUTOPILOT_AEROB => "Aerob",
        MavAutopilot::MAV_AUTOPILOT_ASLUAV => "ASLUAV",
        _ => "Generic Autopilot",
    }
}

fn system_state_name(s: MavState) -> &'static str {
    match s {
        MavState::MAV_STATE_BOOT => "Initializing",
        MavState::MAV_STATE_CALIBRATING => "Calibrating",
        MavState::MAV_STATE_STANDBY => "Standby",
        MavState::MAV_STATE_ACTIVE => "Active",
        MavState::MAV_STATE_CRITICAL => "Failsafe",
        MavState::MAV_STATE_EMERGENCY => "Mayday",
        MavState::MAV_STATE_POWEROFF => "Powering Down",
        _ => "Unknown",
    }
}

fn vtol_state_name(s: MavVtolState) -> &'static str {
    match s {
        MavVtolState::MAV_VTOL_STATE_TRANSITION_TO_FW => "Transition to Fixed Wing",
        MavVtolState::MAV_VTOL_STATE_TRANSITION_TO_MC => "Transition to Multirotor",
        MavVtolState::MAV_VTOL_STATE_MC => "Multirotor",
        MavVtolState::MAV_VTOL_STATE_FW => "Fixed Wing",
        _ => "Not a VTOL vehicle",
    }
}

/// Decodes the PX4-style `custom_mode` byte lanes into a mode string.
/// Bits 24..31 select an auto sub-mode; otherwise bits 16..23 carry the
/// main mode. Anything else is reported as unknown.
pub fn decode_flight_mode(custom_mode: u32) -> &'static str {
    match (custom_mode >> 24) & 0xff {
        0x02 => return "Takeoff",
        0x03 => return "Hold",
        0x04 => return "Mission",
        0x05 => return "RTL",
        0x06 => return "Land",
        0x07 => return "RTGS",
        0x08 => return "Follow",
        0x00 => {}
        _ => return "Unknown Flight Mode",
    }
    match (custom_mode >> 16) & 0xff {
        0x01 => "Manual",
        0x02 => "Altitude",
        0x03 => "Position",
        0x05 => "Acro",
        0x06 => "Offboard",
        0x07 => "Stabilized",
        0x08 => "RAttitude",
        _ => "Unknown Flight Mode",
    }
}

const CAPABILITY_NAMES: &[(MavProtocolCapability, &str)] = &[
    (
        MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_MISSION_INT,
        "mission int",
    ),
    (
        MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_COMMAND_INT,
        "command int",
    ),
    (
        MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_FTP,
        "file transfer",
    ),
    (
        MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_SET_ATTITUDE_TARGET,
        "attitude target",
    ),
    (
        MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_SET_POSITION_TARGET_LOCAL_NED,
        "local position target",
    ),
    (
        MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_SET_POSITION_TARGET_GLOBAL_INT,
        "global position target",
    ),
    (
        MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_TERRAIN,
        "terrain data",
    ),
    (
        MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_SET_ACTUATOR_TARGET,
        "actuator target",
    ),
    (
        MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_FLIGHT_TERMINATION,
        "flight termination",
    ),
    (
        MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_COMPASS_CALIBRATION,
        "compass calibration",
    ),
    (
        MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_MAVLINK2,
        "MAVLink 2",
    ),
    (
        MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_MISSION_FENCE,
        "geofence missions",
    ),
    (
        MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_MISSION_RALLY,
        "rally points",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(custom_mode: u32, status: MavState) -> HEARTBEAT_DATA {
        HEARTBEAT_DATA {
            custom_mode,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_PX4,
            base_mode: MavModeFlag::empty(),
            system_status: status,
            mavlink_version: 3,
        }
    }

    #[test]
    fn flight_mode_decode_main_lanes() {
        assert_eq!(decode_flight_mode(0x0001_0000), "Manual");
        assert_eq!(decode_flight_mode(0x0002_0000), "Altitude");
        assert_eq!(decode_flight_mode(0x0003_0000), "Position");
        assert_eq!(decode_flight_mode(0x0005_0000), "Acro");
        assert_eq!(decode_flight_mode(0x0006_0000), "Offboard");
        assert_eq!(decode_flight_mode(0x0007_0000), "Stabilized");
        assert_eq!(decode_flight_mode(0x0008_0000), "RAttitude");
    }

    #[test]
    fn flight_mode_decode_auto_lanes() {
        assert_eq!(decode_flight_mode(0x0200_0000), "Takeoff");
        assert_eq!(decode_flight_mode(0x0300_0000), "Hold");
        assert_eq!(decode_flight_mode(0x0400_0000), "Mission");
        assert_eq!(decode_flight_mode(0x0500_0000), "RTL");
        assert_eq!(decode_flight_mode(0x0600_0000), "Land");
        assert_eq!(decode_flight_mode(0x0700_0000), "RTGS");
        assert_eq!(decode_flight_mode(0x0800_0000), "Follow");
        // auto lane wins over whatever sits in the main lane
        assert_eq!(decode_flight_mode(0x0404_0000), "Mission");
    }

    #[test]
    fn flight_mode_decode_unknown_patterns() {
        assert_eq!(decode_flight_mode(0), "Unknown Flight Mode");
        assert_eq!(decode_flight_mode(0x0009_0000), "Unknown Flight Mode");
        assert_eq!(decode_flight_mode(0x0900_0000), "Unknown Flight Mode");
        assert_eq!(decode_flight_mode(0x0000_00ff), "Unknown Flight Mode");
    }

    #[test]
    fn heartbeat_sets_armed_from_active_state() {
        let model = VehicleModel::new();
        model
            .update_from_heartbeat(&heartbeat(0x0003_0000, MavState::MAV_STATE_ACTIVE))
            .unwrap();
        assert!(model.armed());
        assert!(model.online());
        assert_eq!(model.mode(), "Position");

        // Transition away from Active clears armed.
        model
            .update_from_heartbeat(&heartbeat(0x0003_0000, MavState::MAV_STATE_STANDBY))
            .unwrap();
        assert!(!model.armed());
        assert_eq!(model.state(), "Standby");
    }

    #[test]
    fn gps_scaling_to_degrees_and_metres() {
        let model = VehicleModel::new();
        model
            .update_from_gps(&GPS_RAW_INT_DATA {
                lat: 364_205_000,
                lon: -1_151_712_000,
                alt: 12_500,
                satellites_visible: 11,
                ..Default::default()
            })
            .unwrap();
        let snap = model.snapshot().unwrap();
        assert!((snap.gps.latitude - 36.4205).abs() < 1e-4);
        assert!((snap.gps.longitude + 115.1712).abs() < 1e-4);
        assert!((snap.gps.altitude - 12.5).abs() < 1e-5);
        assert_eq!(snap.gps.satellites, 11);
    }

    #[test]
    fn attitude_radians_to_degrees() {
        let model = VehicleModel::new();
        model
            .update_from_attitude(&ATTITUDE_DATA {
                roll: std::f32::consts::PI,
                pitch: std::f32::consts::FRAC_PI_2,
                yaw: 0.0,
                ..Default::default()
            })
            .unwrap();
        let snap = model.snapshot().unwrap();
        assert!((snap.attitude.roll - 180.0).abs() < 1e-3);
        assert!((snap.attitude.pitch - 90.0).abs() < 1e-3);
    }

    #[test]
    fn heading_centidegrees_to_degrees() {
        let model = VehicleModel::new();
        model
            .update_from_global_position(&GLOBAL_POSITION_INT_DATA {
                hdg: 27_050,
                relative_alt: 3_000,
                ..Default::default()
            })
            .unwrap();
        let snap = model.snapshot().unwrap();
        assert!((snap.position.heading - 270.5).abs() < 1e-3);
        assert!((snap.position.altitude - 3.0).abs() < 1e-5);
    }

    #[tokio::test(start_paused = true)]
    async fn subsystem_goes_offline_after_five_seconds() {
        let model = VehicleModel::new();
        model.touch_subsystem("GPS");
        model.check_subsystems();
        assert_eq!(model.subsystems()["GPS"], true);

        tokio::time::advance(Duration::from_secs(6)).await;
        model.check_subsystems();
        assert_eq!(model.subsystems()["GPS"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn vehicle_goes_offline_after_five_seconds_idle() {
        let model = VehicleModel::new();
        model
            .update_from_heartbeat(&heartbeat(0, MavState::MAV_STATE_STANDBY))
            .unwrap();
        assert!(model.online());

        tokio::time::advance(Duration::from_secs(6)).await;
        model.check_online();
        assert!(!model.online());
    }

    #[test]
    fn snapshot_subgroup_lookup() {
        let model = VehicleModel::new();
        let snap = model.snapshot().unwrap();
        assert!(snap.subgroup("Gps").is_some());
        assert!(snap.subgroup("Status").is_some());
        assert!(snap.subgroup("NoSuchGroup").is_none());
    }
}
