//! UDP listener and frame demultiplexer. One reader task pulls datagrams off
//! the socket and hands each one to a fresh task so a slow identity-provider
//! call can never block the link.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::cloud::CloudClient;
use crate::config::Config;
use crate::link::codec::{self, Frame, Opcode, StatusMsg, TerminalInfo};
use crate::link::session::{LinkWriter, Session, SessionAuth, SessionRegistry, SessionSummary};
use crate::logbook::LogBook;
use crate::vehicle::Vehicle;

const MAX_DATAGRAM: usize = 2048;

pub struct LinkServer {
    socket: Arc<UdpSocket>,
    registry: Arc<SessionRegistry>,
    cloud: Arc<CloudClient>,
    logbook: Arc<LogBook>,
}

impl LinkServer {
    /// Binds the listener socket. A bind failure here is fatal to the
    /// process, so the error propagates all the way up.
    pub async fn bind(
        config: &Config,
        registry: Arc<SessionRegistry>,
        cloud: Arc<CloudClient>,
        logbook: Arc<LogBook>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", config.link.host, config.link.port);
        let socket = UdpSocket::bind(&addr)
            .await
            .context(format!("failed to bind link socket on {}", addr))?;
        info!("listening for vehicles on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            registry,
            cloud,
            logbook,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Blocking read loop; runs until the socket dies.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.registry.spawn_reaper();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("link socket read error: {}", e);
                    continue;
                }
            };

            if n < codec::HEADER_LEN {
                warn!("received datagram too small ({} bytes)", n);
                continue;
            }

            let frame = match codec::decode(&buf[..n]) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("frame decode failed: {}", e);
                    continue;
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.handle_frame(frame, addr).await;
            });
        }
    }

    async fn handle_frame(&self, frame: Frame, addr: SocketAddr) {
        match frame.op {
            Opcode::Status => match serde_json::from_slice::<StatusMsg>(&frame.payload) {
                Ok(msg) => self.handle_status(msg, addr, frame.session).await,
                Err(e) => warn!("bad STATUS payload from {}: {}", addr, e),
            },
            Opcode::Terminal => match serde_json::from_slice::<TerminalInfo>(&frame.payload) {
                Ok(info) => self.registry.set_terminal_info(frame.session, info).await,
                Err(e) => warn!("bad TERMINAL payload from {}: {}", addr, e),
            },
            Opcode::MavlinkBin => self.handle_mavlink(frame.session, &frame.payload).await,
        }
    }

    async fn handle_status(&self, msg: StatusMsg, addr: SocketAddr, session: u32) {
        match msg.op.as_str() {
            "connect" => self.on_connect(msg, addr).await,
            "status" => self.on_heartbeat(session, addr).await,
            other => warn!("unknown STATUS op {:?} from {}", other, addr),
        }
    }

    /// Authentication handshake: identity provider first, then a fresh
    /// session bound to a vehicle whose write-half frames MAVLink under the
    /// new session id.
    async fn on_connect(&self, msg: StatusMsg, addr: SocketAddr) {
        let info = match self
            .cloud
            .request_drone_info(&msg.serial_id, &msg.sim_id, &msg.email, &msg.password)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                warn!("auth failed for {}: {}", addr, e);
                return;
            }
        };

        let user_id = info
            .user
            .get("_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let drone_id = match info.drone.get("_id").and_then(serde_json::Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                warn!("identity provider response missing drone id");
                return;
            }
        };

        let id = self.registry.next_session_id();
        let writer = LinkWriter::new(Arc::clone(&self.socket), addr, id);
        let vehicle = Vehicle::new(&drone_id, Arc::new(writer), Some(Arc::clone(&self.logbook)));
        vehicle.spawn_tasks();

        let auth = SessionAuth {
            serial: msg.serial_id,
            sim_id: msg.sim_id,
            email: msg.email,
            password: msg.password,
        };
        let session = Session::new(id, addr, info.drone, user_id, auth, vehicle);
        let summary = self.registry.insert(session).await;

        info!("new session: {}", id);
        self.reply_status(id, addr, &summary).await;
    }

    async fn on_heartbeat(&self, session: u32, addr: SocketAddr) {
        let Some(refresh) = self.registry.touch_status(session).await else {
            debug!("heartbeat for unknown session {}", session);
            return;
        };

        // Periodic identity refresh is best-effort: stale metadata beats a
        // dropped heartbeat.
        if let Some(auth) = refresh {
            match self
                .cloud
                .request_drone_info(&auth.serial, &auth.sim_id, &auth.email, &auth.password)
                .await
            {
                Ok(info) => {
                    self.registry
                        .update_drone_metadata(session, info.drone)
                        .await
                }
                Err(e) => warn!("failed to refresh drone metadata: {}", e),
            }
        }

        if let Some(summary) = self.registry.summary(session).await {
            self.reply_status(session, addr, &summary).await;
        }
    }

    async fn handle_mavlink(&self, session: u32, payload: &[u8]) {
        match self.registry.touch_mavlink(session).await {
            Some(vehicle) => vehicle.process_bytes(payload),
            None => debug!("mavlink for unknown session {}", session),
        }
    }

    async fn reply_status(&self, session: u32, addr: SocketAddr, summary: &SessionSummary) {
        let payload = match serde_json::to_vec(summary) {
            Ok(p) => p,
            Err(e) => {
                warn!("could not serialize session summary: {}", e);
                return;
            }
        };
        match codec::encode(Opcode::Status, session, &payload) {
            Ok(frame) => {
                if let Err(e) = self.socket.send_to(&frame, addr).await {
                    error!("network error replying to {}: {}", addr, e);
                }
            }
            Err(e) => warn!("could not build STATUS frame: {}", e),
        }
    }
}
