//! Per-drone sessions and the registry that owns them.
//!
//! A session is an authenticated, timeouted UDP flow. The registry maps
//! session id to session behind a read-write lock and drives the reaper that
//! evicts anything silent for longer than the link timeout.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, warn};

use crate::analytics::{Analytics, SessionMeta};
use crate::link::codec::{self, Opcode, TerminalInfo};
use crate::logbook::LogBook;
use crate::vehicle::{FrameSink, Vehicle};

pub const SESSION_TIMEOUT: Duration = Duration::from_secs(5);
pub const REAP_PERIOD: Duration = Duration::from_secs(5);
pub const CLOUD_SYNC_PERIOD: Duration = Duration::from_secs(60);

/// Link credentials kept for the periodic identity refresh.
#[derive(Debug, Clone)]
pub struct SessionAuth {
    pub serial: String,
    pub sim_id: String,
    pub email: String,
    pub password: String,
}

/// What goes back to the drone in a STATUS reply. Deliberately excludes the
/// session's auth material.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub state: String,
    pub terminal: bool,
    pub drone: Value,
    pub user: String,
}

pub struct Session {
    pub id: u32,
    pub remote: SocketAddr,
    pub state: String,
    pub drone: Value,
    pub user: String,
    pub terminal_enabled: bool,
    pub terminal: Option<TerminalInfo>,
    pub vehicle: Arc<Vehicle>,
    auth: SessionAuth,
    last_update: Instant,
    last_cloud_sync: Instant,
}

impl Session {
    pub fn new(
        id: u32,
        remote: SocketAddr,
        drone: Value,
        user: String,
        auth: SessionAuth,
        vehicle: Arc<Vehicle>,
    ) -> Self {
        Self {
            id,
            remote,
            state: "online".to_string(),
            drone,
            user,
            terminal_enabled: false,
            terminal: None,
            vehicle,
            auth,
            last_update: Instant::now(),
            last_cloud_sync: Instant::now(),
        }
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            state: self.state.clone(),
            terminal: self.terminal_enabled,
            drone: self.drone.clone(),
            user: self.user.clone(),
        }
    }

    fn drone_id(&self) -> String {
        self.drone
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn drone_name(&self) -> String {
        self.drone
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

/// Write-half handed to each vehicle: frames raw MAVLink under the session id
/// and sends it back over the listener socket.
pub struct LinkWriter {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    session_id: u32,
}

impl LinkWriter {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, session_id: u32) -> Self {
        Self {
            socket,
            peer,
            session_id,
        }
    }
}

#[async_trait]
impl FrameSink for LinkWriter {
    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let frame = codec::encode(Opcode::MavlinkBin, self.session_id, bytes)?;
        self.socket.send_to(&frame, self.peer).await?;
        Ok(())
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<u32, Session>>,
    next_id: AtomicU32,
    analytics: Analytics,
    logbook: Arc<LogBook>,
}

impl SessionRegistry {
    pub fn new(analytics: Analytics, logbook: Arc<LogBook>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            analytics,
            logbook,
        })
    }

    /// Fresh non-zero session id; the counter wraps past u32::MAX without
    /// ever producing the reserved 0.
    pub fn next_session_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    #[cfg(test)]
    pub fn set_next_id(&self, id: u32) {
        self.next_id.store(id, Ordering::Relaxed);
    }

    pub async fn insert(&self, session: Session) -> SessionSummary {
        let summary = session.summary();
        let meta = SessionMeta {
            session: session.id,
            drone: session.drone_id(),
            user: session.user.clone(),
        };
        self.logbook
            .log(&session.drone_id(), &format!("session {} connected", session.id));
        self.sessions.write().await.insert(session.id, session);
        self.analytics.record("connect", Some(meta));
        summary
    }

    /// Heartbeat touch. Returns the session's auth when the 60 s identity
    /// refresh is due (the sync stamp is advanced here so concurrent
    /// heartbeats do not stampede the provider).
    pub async fn touch_status(&self, id: u32) -> Option<Option<SessionAuth>> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id)?;
        session.last_update = Instant::now();
        if session.last_cloud_sync.elapsed() > CLOUD_SYNC_PERIOD {
            session.last_cloud_sync = Instant::now();
            Some(Some(session.auth.clone()))
        } else {
            Some(None)
        }
    }

    pub async fn update_drone_metadata(&self, id: u32, drone: Value) {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.drone = drone;
        }
    }

    pub async fn summary(&self, id: u32) -> Option<SessionSummary> {
        self.sessions.read().await.get(&id).map(Session::summary)
    }

    pub async fn peer(&self, id: u32) -> Option<SocketAddr> {
        self.sessions.read().await.get(&id).map(|s| s.remote)
    }

    /// MAVLink touch: refreshes the heartbeat stamp and hands the vehicle
    /// back so the payload can be dispatched outside the lock.
    pub async fn touch_mavlink(&self, id: u32) -> Option<Arc<Vehicle>> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id)?;
        session.last_update = Instant::now();
        Some(Arc::clone(&session.vehicle))
    }

    pub async fn set_terminal_info(&self, id: u32, info: TerminalInfo) {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            debug!("terminal update on session {}", id);
            session.terminal = Some(info);
        }
    }

    /// Evicts every session idle past the link timeout. Returns the evicted
    /// (session id, drone id) pairs.
    pub async fn reap_idle(&self) -> Vec<(u32, String)> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<u32> = sessions
            .iter()
            .filter(|(_, s)| s.last_update.elapsed() > SESSION_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(session) = sessions.remove(&id) {
                let drone_id = session.drone_id();
                warn!("session {} timeout", id);
                warn!("vehicle <{}> offline", drone_id);
                session.vehicle.stop();
                self.logbook.log(&drone_id, "session timed out");
                self.logbook.close(&drone_id);
                self.analytics.record(
                    "disconnect",
                    Some(SessionMeta {
                        session: id,
                        drone: drone_id.clone(),
                        user: session.user.clone(),
                    }),
                );
                evicted.push((id, drone_id));
            }
        }
        evicted
    }

    /// Periodic reaper task.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(REAP_PERIOD);
            loop {
                tick.tick().await;
                registry.reap_idle().await;
            }
        });
    }

    // --- lookups for the REST facade (sequential scan) ---

    async fn search(&self, id_or_name: &str) -> Option<u32> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .find(|s| s.drone_name() == id_or_name || s.drone_id() == id_or_name)
            .map(|s| s.id)
    }

    pub async fn find_vehicle(&self, id_or_name: &str) -> Option<Arc<Vehicle>> {
        let key = self.search(id_or_name).await?;
        self.sessions
            .read()
            .await
            .get(&key)
            .map(|s| Arc::clone(&s.vehicle))
    }

    /// `{name-or-id: state}` for every live session.
    pub async fn online_vehicles(&self) -> HashMap<String, String> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .map(|s| {
                let name = s.drone_name();
                let key = if name.is_empty() { s.drone_id() } else { name };
                (key, s.state.clone())
            })
            .collect()
    }

    pub async fn get_terminal(&self, id_or_name: &str) -> Option<TerminalInfo> {
        let key = self.search(id_or_name).await?;
        let sessions = self.sessions.read().await;
        let session = sessions.get(&key)?;
        match &session.terminal {
            Some(info) if !info.url.is_empty() && info.port != 0 => Some(info.clone()),
            _ => None,
        }
    }

    /// Flags the session so the drone opens (or tears down) its SSH proxy on
    /// the next STATUS exchange. Returns false when no session matches.
    pub async fn update_terminal(&self, id_or_name: &str, enable: bool) -> bool {
        let Some(key) = self.search(id_or_name).await else {
            return false;
        };
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&key) {
            debug!("setting terminal to {} on session {}", enable, key);
            session.terminal_enabled = enable;
            if !enable {
                session.terminal = None;
            }
            true
        } else {
            false
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
