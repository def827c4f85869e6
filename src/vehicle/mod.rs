//! One connected vehicle: MAVLink dispatch into the model, the periodic
//! state-machine driver, and the command/parameter pipelines.

pub mod commands;
pub mod model;
pub mod params;
pub mod telemetry;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use mavlink::common::*;
use mavlink::error::MessageReadError;
use mavlink::MavHeader;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{interval, sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::logbook::LogBook;
use commands::{pack_command_long, CommandQueue, LastCommand, QueueStep};
use model::VehicleModel;
use params::{ParamTable, FETCH_DEADLINE};
use telemetry::{TelemetrySnapshot, VehicleLog};

const DRIVER_PERIOD: Duration = Duration::from_millis(500);
const LIVENESS_PERIOD: Duration = Duration::from_secs(1);
const GAP_FILL_SPACING: Duration = Duration::from_millis(5);
const SYSLOG_CAP: usize = 200;

/// Write-half capability handed to the vehicle at construction: frames raw
/// MAVLink bytes and puts them on the session's link. Kept opaque so the
/// vehicle never reaches back into the session.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, bytes: &[u8]) -> Result<()>;
}

pub struct Vehicle {
    id: String,
    pub model: VehicleModel,
    pub params: ParamTable,
    queue: CommandQueue,
    syslog: Mutex<VecDeque<VehicleLog>>,
    last_command: Mutex<LastCommand>,
    sink: Arc<dyn FrameSink>,
    logbook: Option<Arc<LogBook>>,
    seq: AtomicU8,
    running: Arc<AtomicBool>,
}

impl Vehicle {
    pub fn new(id: &str, sink: Arc<dyn FrameSink>, logbook: Option<Arc<LogBook>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            model: VehicleModel::new(),
            params: ParamTable::new(),
            queue: CommandQueue::new(),
            syslog: Mutex::new(VecDeque::new()),
            last_command: Mutex::new(LastCommand::default()),
            sink,
            logbook,
            seq: AtomicU8::new(0),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Starts the 500 ms driver and the 1 s liveness checker.
    pub fn spawn_tasks(self: &Arc<Self>) {
        let driver = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(DRIVER_PERIOD);
            while driver.running.load(Ordering::SeqCst) {
                tick.tick().await;
                driver.driver_tick().await;
            }
            debug!("driver stopped for vehicle {}", driver.id);
        });

        let liveness = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(LIVENESS_PERIOD);
            while liveness.running.load(Ordering::SeqCst) {
                tick.tick().await;
                liveness.model.check_online();
                liveness.model.check_subsystems();
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    // --- inbound path ---

    /// Decodes a chunk of raw MAVLink bytes and fans each message into the
    /// model. The remote system id is latched from the first packet.
    pub fn process_bytes(&self, bytes: &[u8]) {
        let mut cursor = Cursor::new(bytes);
        loop {
            if cursor.position() as usize >= bytes.len() {
                break;
            }
            match mavlink::read_v1_msg::<MavMessage, _>(&mut cursor) {
                Ok((header, message)) => {
                    if self.model.system_id() == 0 {
                        self.model.set_system_id(header.system_id);
                    }
                    self.dispatch(&message);
                }
                Err(MessageReadError::Io(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => {
                    warn!("mavlink parse error: {}", e);
                    break;
                }
            }
        }
    }

    fn dispatch(&self, message: &MavMessage) {
        let result = match message {
            MavMessage::HEARTBEAT(m) => self.model.update_from_heartbeat(m),
            MavMessage::SYS_STATUS(m) => self.model.update_from_sys_status(m),
            MavMessage::GPS_RAW_INT(m) => {
                self.model.touch_subsystem("GPS");
                self.model.update_from_gps(m)
            }
            MavMessage::ATTITUDE(m) => {
                self.model.touch_subsystem("Estimator");
                self.model.update_from_attitude(m)
            }
            MavMessage::LOCAL_POSITION_NED(m) => {
                self.model.touch_subsystem("Estimator");
                self.model.update_from_local_position(m)
            }
            MavMessage::GLOBAL_POSITION_INT(m) => {
                self.model.touch_subsystem("Estimator");
                self.model.update_from_global_position(m)
            }
            MavMessage::SERVO_OUTPUT_RAW(m) => {
                self.model.touch_subsystem("Motors");
                self.model.update_from_motors(m)
            }
            MavMessage::RC_CHANNELS(m) => {
                self.model.touch_subsystem("RadioControl");
                self.model.update_from_input(m)
            }
            MavMessage::VFR_HUD(m) => self.model.update_from_vfr(m),
            MavMessage::HIGHRES_IMU(m) => {
                self.model.touch_subsystem("IMU");
                self.model.update_from_sensors(m)
            }
            MavMessage::ATTITUDE_TARGET(m) => {
                self.model.touch_subsystem("Controller");
                self.model.update_from_attitude_target(m)
            }
            MavMessage::POSITION_TARGET_LOCAL_NED(m) => {
                self.model.touch_subsystem("Controller");
                self.model.update_from_local_target(m)
            }
            MavMessage::POSITION_TARGET_GLOBAL_INT(m) => {
                self.model.touch_subsystem("Controller");
                self.model.update_from_global_target(m)
            }
            MavMessage::HOME_POSITION(m) => self.model.update_from_home(m),
            MavMessage::EXTENDED_SYS_STATE(m) => self.model.update_from_extended_sys_state(m),
            MavMessage::DISTANCE_SENSOR(_) => {
                self.model.touch_subsystem("RangeFinder");
                Ok(())
            }
            MavMessage::OPTICAL_FLOW_RAD(_) => {
                self.model.touch_subsystem("OpticalFlow");
                Ok(())
            }
            MavMessage::COMMAND_ACK(m) => {
                self.handle_ack(m);
                Ok(())
            }
            MavMessage::AUTOPILOT_VERSION(m) => self.model.update_from_autopilot_version(m),
            MavMessage::PARAM_VALUE(m) => {
                self.handle_param_value(m);
                Ok(())
            }
            MavMessage::STATUSTEXT(m) => {
                self.handle_statustext(m);
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!("model update failed: {}", e);
        }
    }

    fn handle_ack(&self, m: &COMMAND_ACK_DATA) {
        let command = m.command as u32;
        if self.queue.reconcile_ack(command, m.result) {
            if let Ok(mut last) = self.last_command.lock() {
                last.command = Some(command);
                last.result = Some(m.result);
            }
        } else {
            warn!(
                "dropping ack for {} ({:?}): not the queue head",
                command, m.result
            );
        }
    }

    fn handle_param_value(&self, m: &PARAM_VALUE_DATA) {
        let name = String::from_utf8_lossy(&m.param_id)
            .trim_end_matches('\0')
            .to_string();
        match self.params.observe(
            &name,
            m.param_index,
            m.param_value,
            m.param_type,
            m.param_count,
        ) {
            Ok(params::ObserveOutcome::Stored) => {}
            Ok(params::ObserveOutcome::TotalChanged) => {
                // Vehicle rebooted mid-session: resync the whole table.
                warn!("param total changed, refreshing param table");
                self.params.reset();
            }
            Err(e) => warn!("param table update failed: {}", e),
        }
    }

    fn handle_statustext(&self, m: &STATUSTEXT_DATA) {
        let text = String::from_utf8_lossy(&m.text)
            .trim_end_matches('\0')
            .to_string();
        info!(">>> {}", text);
        if let Some(book) = &self.logbook {
            book.log(&self.id, &text);
        }
        if let Ok(mut ring) = self.syslog.lock() {
            ring.push_back(VehicleLog {
                msg: text,
                time: Utc::now(),
                level: m.severity as u8,
            });
            while ring.len() > SYSLOG_CAP {
                ring.pop_front();
            }
        }
    }

    pub fn drain_syslog(&self) -> Vec<VehicleLog> {
        match self.syslog.lock() {
            Ok(mut ring) => ring.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    // --- outbound path ---

    async fn send_message(&self, message: &MavMessage) -> Result<()> {
        let header = MavHeader {
            system_id: 255,
            component_id: 0,
            sequence: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        let mut buf = Vec::with_capacity(64);
        mavlink::write_v1_msg(&mut buf, header, message).context("mavlink encode failed")?;
        self.sink.send(&buf).await
    }

    fn target_system(&self) -> u8 {
        match self.model.system_id() {
            0 => 1,
            id => id,
        }
    }

    // --- state-machine driver ---

    /// One 500 ms step: init pipeline first, then the command queue.
    pub async fn driver_tick(&self) {
        if !self.model.online() {
            self.scrub_volatile();
            return;
        }

        if !self.model.got_caps() {
            debug!("loading vehicle info...");
            let msg = MavMessage::COMMAND_LONG(pack_command_long(
                self.target_system(),
                MavCmd::MAV_CMD_REQUEST_AUTOPILOT_CAPABILITIES,
                [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            ));
            if let Err(e) = self.send_message(&msg).await {
                warn!("capability request failed: {}", e);
            }
            return;
        }

        if !self.params.initialized() {
            debug!("loading params...");
            let msg = MavMessage::PARAM_REQUEST_LIST(PARAM_REQUEST_LIST_DATA {
                target_system: self.target_system(),
                target_component: 1,
            });
            if let Err(e) = self.send_message(&msg).await {
                warn!("param list request failed: {}", e);
            }
            self.params.set_deadline(Instant::now() + FETCH_DEADLINE);
            return;
        }

        if !self.params.ready() {
            self.fill_param_gaps().await;
            return;
        }

        self.service_queue().await;
    }

    /// Drops command/parameter/capability state while the drone is away;
    /// telemetry is kept so the last live state survives the disconnect.
    fn scrub_volatile(&self) {
        self.queue.clear();
        self.params.reset();
        self.model.scrub();
    }

    async fn fill_param_gaps(&self) {
        let missing = self.params.missing_now();
        if missing.is_empty() {
            return;
        }

        if self.params.deadline_passed() {
            let (_, total, _) = self.params.all();
            warn!(
                "failed to fetch {} of {} params: {:?}",
                missing.len(),
                total,
                missing
            );
            self.params.force_ready(missing);
            return;
        }

        let (current, total, _) = self.params.all();
        for index in &missing {
            let msg = MavMessage::PARAM_REQUEST_READ(PARAM_REQUEST_READ_DATA {
                param_index: *index as i16,
                target_system: self.target_system(),
                target_component: 1,
                param_id: [0; 16],
            });
            if let Err(e) = self.send_message(&msg).await {
                warn!("param read request failed: {}", e);
            }
            // Give the firmware's radio link room to breathe.
            sleep(GAP_FILL_SPACING).await;
        }
        if total > 0 {
            debug!(
                "{}% of params loaded...",
                (current as f32 / total as f32 * 100.0) as u32
            );
        }
    }

    async fn service_queue(&self) {
        match self.queue.service() {
            QueueStep::Idle => {}
            QueueStep::Completed { status, .. } => {
                self.set_last_result(status);
            }
            QueueStep::Transmit { msg, status } => {
                self.set_last_result(status);
                if let Err(e) = self.send_message(&MavMessage::COMMAND_LONG(msg)).await {
                    warn!("command send failed: {}", e);
                }
            }
        }
    }

    fn set_last_result(&self, result: Option<MavResult>) {
        if let Ok(mut last) = self.last_command.lock() {
            last.result = result;
        }
    }

    // --- command operations ---

    pub fn last_completed(&self) -> LastCommand {
        self.last_command
            .lock()
            .map(|l| *l)
            .unwrap_or_default()
    }

    /// Resets the bridge slot so the next REST poll cannot observe a stale
    /// completion.
    pub fn null_last_completed(&self) {
        if let Ok(mut last) = self.last_command.lock() {
            *last = LastCommand::default();
        }
    }

    /// Queues a DO_SET_MODE composed from the requested mode/arm intent;
    /// absent intents fall back to the vehicle's current state.
    pub fn set_mode_and_arm(&self, do_mode: bool, do_arm: bool, mode: &str, arm: bool) {
        let armed = if do_arm { arm } else { self.model.armed() };
        let mode_str = if do_mode {
            mode.to_string()
        } else {
            self.model.mode()
        };
        let (flags, main_mode, auto_mode) = commands::compose_mode(&mode_str, armed);
        self.queue.push(pack_command_long(
            self.target_system(),
            MavCmd::MAV_CMD_DO_SET_MODE,
            [
                flags.bits() as f32,
                main_mode as f32,
                auto_mode as f32,
                0.0,
                0.0,
                0.0,
                0.0,
            ],
        ));
    }

    pub fn set_home(&self, lat: f32, lon: f32, alt: f32, relative: bool) {
        let rel = if relative { 1.0 } else { 0.0 };
        self.queue.push(pack_command_long(
            self.target_system(),
            MavCmd::MAV_CMD_DO_SET_HOME,
            [rel, 0.0, 0.0, 0.0, lat, lon, alt],
        ));
    }

    pub fn generic_command(&self, command: MavCmd, params: [f32; 7]) {
        self.queue
            .push(pack_command_long(self.target_system(), command, params));
    }

    /// Overrides up to eight RC channels. 65535 keeps a channel at its
    /// current value. With a timeout the override is re-sent at 250 ms until
    /// the window closes, then released back to the radio.
    pub async fn send_rc_override(
        self: &Arc<Self>,
        channels: [u16; 8],
        enabled: bool,
        timeout_secs: u64,
    ) -> Result<()> {
        if !enabled {
            return self.send_rc_channels([0; 8]).await;
        }

        self.send_rc_channels(channels).await?;
        if timeout_secs > 0 {
            let vehicle = Arc::clone(self);
            tokio::spawn(async move {
                let until = Instant::now() + Duration::from_secs(timeout_secs);
                while Instant::now() < until && vehicle.running.load(Ordering::SeqCst) {
                    sleep(Duration::from_millis(250)).await;
                    if let Err(e) = vehicle.send_rc_channels(channels).await {
                        warn!("rc override resend failed: {}", e);
                    }
                }
                if let Err(e) = vehicle.send_rc_channels([0; 8]).await {
                    warn!("rc override release failed: {}", e);
                }
            });
        }
        Ok(())
    }

    async fn send_rc_channels(&self, channels: [u16; 8]) -> Result<()> {
        let msg = MavMessage::RC_CHANNELS_OVERRIDE(RC_CHANNELS_OVERRIDE_DATA {
            chan1_raw: channels[0],
            chan2_raw: channels[1],
            chan3_raw: channels[2],
            chan4_raw: channels[3],
            chan5_raw: channels[4],
            chan6_raw: channels[5],
            chan7_raw: channels[6],
            chan8_raw: channels[7],
            target_system: self.target_system(),
            target_component: 1,
            ..Default::default()
        });
        self.send_message(&msg).await
    }

    /// Feeds an external motion-capture estimate straight to the autopilot.
    pub async fn send_mocap(&self, q: [f32; 4], x: f32, y: f32, z: f32) -> Result<()> {
        let msg = MavMessage::ATT_POS_MOCAP(ATT_POS_MOCAP_DATA {
            time_usec: Utc::now().timestamp_micros() as u64,
            q,
            x,
            y,
            z,
            ..Default::default()
        });
        self.send_message(&msg).await
    }

    // --- parameter operations ---

    pub fn get_param(&self, name: &str) -> Result<f32> {
        Ok(self.params.get(name)?.value)
    }

    /// Cached value if present, otherwise request-and-poll (10 × 30 ms).
    pub async fn get_param_by_index(&self, index: u16) -> Result<f32> {
        if let Ok(entry) = self.params.get_by_index(index) {
            return Ok(entry.value);
        }
        for _ in 0..10 {
            let msg = MavMessage::PARAM_REQUEST_READ(PARAM_REQUEST_READ_DATA {
                param_index: index as i16,
                target_system: self.target_system(),
                target_component: 1,
                param_id: [0; 16],
            });
            if let Err(e) = self.send_message(&msg).await {
                warn!("param read request failed: {}", e);
            }
            sleep(Duration::from_millis(30)).await;
            if let Ok(entry) = self.params.get_by_index(index) {
                return Ok(entry.value);
            }
        }
        bail!("could not retrieve param {}", index)
    }

    /// Sends PARAM_SET with the cached encoding, then verifies the readback.
    pub async fn set_param(&self, name: &str, value: f32) -> Result<()> {
        let entry = self.params.get(name)?;
        let msg = MavMessage::PARAM_SET(PARAM_SET_DATA {
            param_value: value,
            target_system: self.target_system(),
            target_component: 1,
            param_id: pack_param_id(name),
            param_type: entry.encoding,
        });
        self.send_message(&msg).await?;
        sleep(Duration::from_millis(250)).await;

        let after = self.params.get(name)?;
        if after.value != value {
            bail!("param found, but failed to update");
        }
        Ok(())
    }

    pub fn refresh_params(&self) {
        self.params.reset();
    }

    /// (loaded, total, name -> value) for the bulk REST endpoint.
    pub fn all_params(&self) -> (usize, u16, std::collections::HashMap<String, f32>) {
        self.params.all()
    }

    pub fn missing_params(&self) -> Vec<u16> {
        self.params.missing()
    }

    // --- telemetry passthrough ---

    pub fn telem(&self) -> Result<TelemetrySnapshot> {
        self.model.snapshot()
    }
}

fn pack_param_id(name: &str) -> [u8; 16] {
    let mut id = [0u8; 16];
    let bytes = name.as_bytes();
    let n = bytes.len().min(16);
    id[..n].copy_from_slice(&bytes[..n]);
    id
}
