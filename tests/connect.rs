//! End-to-end exercise over real sockets: a fake drone authenticates through
//! a mock identity provider, streams enough MAVLink to reach Ready, and acks
//! an arm command issued through the REST facade.

use axum::body::Body;
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};
use tower::ServiceExt;

use mavlink::common::*;
use mavlink::MavHeader;

use fleetlink::analytics::Analytics;
use fleetlink::cloud::CloudClient;
use fleetlink::config::Config;
use fleetlink::link::codec::{self, Opcode};
use fleetlink::link::server::LinkServer;
use fleetlink::link::session::SessionRegistry;
use fleetlink::logbook::LogBook;
use fleetlink::web::routes::{router, AppState};

const DRONE_ID: &str = "d3adbeefd3adbeefd3adbeef";

/// Identity provider stub: accepts any credentials and returns fixed
/// drone/user metadata.
async fn spawn_mock_provider() -> String {
    let app = Router::new()
        .route(
            "/rt/droneinfo",
            post(|| async {
                Json(json!({
                    "status": "OK",
                    "user": {"_id": "U"},
                    "drone": {"_id": DRONE_ID, "name": "alpha"},
                }))
            }),
        )
        .route(
            "/api/drone/:id",
            get(|| async { Json(json!({"_id": DRONE_ID, "name": "alpha"})) }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn mavlink_frame(session: u32, sequence: u8, message: &MavMessage) -> Vec<u8> {
    let header = MavHeader {
        system_id: 1,
        component_id: 1,
        sequence,
    };
    let mut buf = Vec::new();
    mavlink::write_v1_msg(&mut buf, header, message).unwrap();
    codec::encode(Opcode::MavlinkBin, session, &buf).unwrap()
}

fn decode_mavlink(payload: &[u8]) -> Vec<MavMessage> {
    let mut cursor = Cursor::new(payload);
    let mut out = Vec::new();
    while (cursor.position() as usize) < payload.len() {
        match mavlink::read_v1_msg::<MavMessage, _>(&mut cursor) {
            Ok((_, msg)) => out.push(msg),
            Err(_) => break,
        }
    }
    out
}

fn heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0x0003_0000,
        mavtype: MavType::MAV_TYPE_QUADROTOR,
        autopilot: MavAutopilot::MAV_AUTOPILOT_PX4,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_STANDBY,
        mavlink_version: 3,
    })
}

fn param_value(name: &str, index: u16, value: f32, count: u16) -> MavMessage {
    let mut param_id = [0u8; 16];
    param_id[..name.len()].copy_from_slice(name.as_bytes());
    MavMessage::PARAM_VALUE(PARAM_VALUE_DATA {
        param_value: value,
        param_count: count,
        param_index: index,
        param_id,
        param_type: MavParamType::MAV_PARAM_TYPE_REAL32,
    })
}

/// Answers the gateway's init traffic the way a PX4-style autopilot would.
async fn drone_emulator(socket: Arc<UdpSocket>, session: u32) {
    let mut seq: u8 = 0;
    let mut buf = vec![0u8; 2048];
    loop {
        let Ok(n) = socket.recv(&mut buf).await else {
            return;
        };
        let Ok(frame) = codec::decode(&buf[..n]) else {
            continue;
        };
        if frame.op != Opcode::MavlinkBin {
            continue;
        }
        for message in decode_mavlink(&frame.payload) {
            seq = seq.wrapping_add(1);
            match message {
                MavMessage::COMMAND_LONG(cmd)
                    if cmd.command == MavCmd::MAV_CMD_REQUEST_AUTOPILOT_CAPABILITIES =>
                {
                    let reply = MavMessage::AUTOPILOT_VERSION(AUTOPILOT_VERSION_DATA {
                        capabilities: MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_MAVLINK2,
                        uid: 99,
                        ..Default::default()
                    });
                    let _ = socket.send(&mavlink_frame(session, seq, &reply)).await;
                }
                MavMessage::PARAM_REQUEST_LIST(_) => {
                    for (i, name) in ["BAT_CAPACITY", "SYS_AUTOSTART"].iter().enumerate() {
                        let msg = param_value(name, i as u16, 5200.0, 2);
                        let _ = socket.send(&mavlink_frame(session, seq, &msg)).await;
                    }
                }
                MavMessage::PARAM_SET(set) => {
                    let name = String::from_utf8_lossy(&set.param_id)
                        .trim_end_matches('\0')
                        .to_string();
                    let msg = param_value(&name, 0, set.param_value, 2);
                    let _ = socket.send(&mavlink_frame(session, seq, &msg)).await;
                }
                MavMessage::COMMAND_LONG(cmd) => {
                    let reply = MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
                        command: cmd.command,
                        result: MavResult::MAV_RESULT_ACCEPTED,
                        ..Default::default()
                    });
                    let _ = socket.send(&mavlink_frame(session, seq, &reply)).await;
                }
                _ => {}
            }
        }
    }
}

#[tokio::test]
async fn connect_heartbeat_and_arm_round_trip() {
    let provider_url = spawn_mock_provider().await;

    let mut config = Config::default_for_tests();
    config.cloud.base_url = provider_url;
    let config = Arc::new(config);

    let cloud = Arc::new(CloudClient::new(&config.cloud.base_url));
    let analytics = Analytics::start(Arc::new(config.analytics.clone()));
    let logbook = Arc::new(LogBook::new(&config.logbook.dir));
    let registry = SessionRegistry::new(analytics, Arc::clone(&logbook));

    let link = Arc::new(
        LinkServer::bind(&config, Arc::clone(&registry), Arc::clone(&cloud), logbook)
            .await
            .unwrap(),
    );
    let link_addr = link.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = link.run().await;
    });

    // S1: connect handshake with session id 0.
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    socket.connect(link_addr).await.unwrap();

    let connect_payload = json!({
        "op": "connect",
        "serialId": "X",
        "simId": "",
        "email": "a@b",
        "password": "p",
    });
    let frame = codec::encode(Opcode::Status, 0, connect_payload.to_string().as_bytes()).unwrap();
    socket.send(&frame).await.unwrap();

    let mut buf = vec![0u8; 2048];
    let n = timeout(Duration::from_secs(5), socket.recv(&mut buf))
        .await
        .expect("no STATUS reply")
        .unwrap();
    let reply = codec::decode(&buf[..n]).unwrap();
    assert_eq!(reply.op, Opcode::Status);
    assert!(reply.session > 0, "server must assign a non-zero session id");

    let summary: Value = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(summary["drone"]["_id"], DRONE_ID);
    assert_eq!(summary["state"], "online");
    assert!(
        !String::from_utf8_lossy(&reply.payload).contains("password"),
        "summary must not echo credentials"
    );

    let session = reply.session;

    // The facade sees the vehicle once it has spoken MAVLink.
    let hb = mavlink_frame(session, 0, &heartbeat());
    socket.send(&hb).await.unwrap();

    let app = router(AppState {
        registry: Arc::clone(&registry),
        cloud,
    });

    // Give the registry a beat to route the datagram.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/drones").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let online: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(online, json!({"alpha": "online"}));

    // S3: emulator walks the vehicle to Ready and acks commands; heartbeats
    // keep the session alive past the 5 s reaper window.
    let emulator_socket = Arc::clone(&socket);
    tokio::spawn(drone_emulator(emulator_socket, session));

    let keepalive = Arc::clone(&socket);
    tokio::spawn(async move {
        let status = codec::encode(Opcode::Status, session, b"{\"op\":\"status\"}").unwrap();
        loop {
            let hb = mavlink_frame(session, 0, &heartbeat());
            let _ = keepalive.send(&hb).await;
            let _ = keepalive.send(&status).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });

    // Wait for init (caps + params) to complete: two driver ticks plus slack.
    tokio::time::sleep(Duration::from_millis(1600)).await;

    let response = timeout(
        Duration::from_secs(5),
        app.clone().oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/drone/{}/arm", DRONE_ID))
                .header("User-Email", "a@b")
                .header("User-Key", "k")
                .body(Body::empty())
                .unwrap(),
        ),
    )
    .await
    .expect("arm request timed out")
    .unwrap();

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let ack: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(ack["Command"], 176);
    assert_eq!(ack["Status"], "Command accepted.");

    // S4: a parameter write round-trips through the drone's PARAM_VALUE echo.
    let response = timeout(
        Duration::from_secs(5),
        app.clone().oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/drone/{}/param/BAT_CAPACITY", DRONE_ID))
                .header("User-Email", "a@b")
                .header("User-Key", "k")
                .header("Content-Type", "application/json")
                .body(Body::from(r#"{"value":6000}"#))
                .unwrap(),
        ),
    )
    .await
    .expect("param set timed out")
    .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let result: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(result["Status"], "OK");

    // Parameter reads come straight from the table.
    let response = timeout(
        Duration::from_secs(5),
        app.oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/drone/{}/param/BAT_CAPACITY", DRONE_ID))
                .header("User-Email", "a@b")
                .header("User-Key", "k")
                .body(Body::empty())
                .unwrap(),
        ),
    )
    .await
    .expect("param request timed out")
    .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: f64 = serde_json::from_slice(&body).unwrap();
    assert_eq!(value, 6000.0);
}
