//! REST facade. Translates `/drone/...` requests into vehicle operations and
//! blocks on synchronous command completion; everything the facade does not
//! own is redirected to the identity provider.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use num_traits::FromPrimitive;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::info;

use crate::cloud::CloudClient;
use crate::link::session::SessionRegistry;
use crate::vehicle::Vehicle;
use mavlink::common::MavCmd;

static ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-f0-9]{24}$").unwrap());
static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new("^[A-Za-z0-9-]{5,24}$").unwrap());

const COMMAND_POLLS: u32 = 10;
const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(250);
const TERMINAL_POLLS: u32 = 5;
const TERMINAL_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REFRESH_POLLS: u32 = 20;
const REFRESH_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub cloud: Arc<CloudClient>,
}

pub enum ApiError {
    NotFound,
    Forbidden,
    Bad(String),
}

impl ApiError {
    fn bad(msg: impl Into<String>) -> Self {
        ApiError::Bad(msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ApiError::Forbidden => {
                (StatusCode::FORBIDDEN, StatusCode::FORBIDDEN.to_string()).into_response()
            }
            ApiError::Bad(msg) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": msg })),
            )
                .into_response(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/drones", get(list_online))
        .route("/drone", get(user_drones))
        .route("/drone/", get(user_drones))
        .route("/drone/:id", get(drone_meta))
        .route("/drone/:id/:resource", get(resource_get).post(resource_post))
        .route("/drone/:id/param/:name", get(param_get).post(param_set))
        .route("/drone/:id/params/refresh", get(params_refresh))
        .route("/drone/:id/ssh/:action", post(ssh_action))
        .fallback(redirect_to_cloud)
        .with_state(state)
}

pub fn valid_identifier(id: &str) -> bool {
    ID_PATTERN.is_match(id) || NAME_PATTERN.is_match(id)
}

fn credentials(headers: &HeaderMap) -> (String, String) {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    (get("User-Email"), get("User-Key"))
}

/// Identifier + credential gate shared by every `/drone/{id}` route. Returns
/// the provider's drone metadata on success.
async fn authorize(state: &AppState, headers: &HeaderMap, id: &str) -> Result<Value, ApiError> {
    if !valid_identifier(id) {
        return Err(ApiError::NotFound);
    }
    let (email, key) = credentials(headers);
    state
        .cloud
        .request_api_get(&format!("/api/drone/{}", id), &email, &key)
        .await
        .map_err(|_| ApiError::Forbidden)
}

// --- field extraction from dynamic JSON bodies ---

fn body_value(body: Option<Json<Value>>) -> Value {
    body.map(|Json(v)| v).unwrap_or(Value::Null)
}

fn opt_f32(body: &Value, key: &str) -> Result<Option<f32>, ApiError> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(|n| Some(n as f32))
            .ok_or_else(|| ApiError::bad(format!("field '{}' must be a number", key))),
    }
}

fn opt_bool(body: &Value, key: &str) -> Result<Option<bool>, ApiError> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| ApiError::bad(format!("field '{}' must be a boolean", key))),
    }
}

fn opt_str(body: &Value, key: &str) -> Result<Option<String>, ApiError> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| ApiError::bad(format!("field '{}' must be a string", key))),
    }
}

// --- handlers ---

async fn list_online(State(state): State<AppState>) -> Json<Value> {
    let online = state.registry.online_vehicles().await;
    Json(json!(online))
}

async fn user_drones(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let (email, key) = credentials(&headers);
    state
        .cloud
        .request_api_get("/api/drone/", &email, &key)
        .await
        .map(Json)
        .map_err(|e| ApiError::bad(e.to_string()))
}

async fn drone_meta(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    info!("REQUEST GET /drone/{}", id);
    let mut meta = authorize(&state, &headers, &id).await?;
    let online = state.registry.find_vehicle(&id).await.is_some();
    if let Some(map) = meta.as_object_mut() {
        map.insert("online".to_string(), json!(online));
    }
    Ok(Json(meta))
}

async fn resource_get(
    State(state): State<AppState>,
    Path((id, resource)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    info!("REQUEST GET /drone/{}/{}", id, resource);
    let mut meta = authorize(&state, &headers, &id).await?;

    let Some(vehicle) = state.registry.find_vehicle(&id).await else {
        // Offline vehicles only have their last provider metadata.
        if let Some(map) = meta.as_object_mut() {
            map.insert("online".to_string(), json!(false));
        }
        return Ok(Json(meta).into_response());
    };

    match resource.as_str() {
        "log" => {
            let entries = vehicle.drain_syslog();
            Ok(Json(json!(entries)).into_response())
        }
        "params" => {
            let (current, total, params) = vehicle.all_params();
            Ok(Json(json!({
                "total": total,
                "current": current,
                "missing": vehicle.missing_params(),
                "params": params,
            }))
            .into_response())
        }
        _ => {
            let kind = telemetry_key(&resource).ok_or(ApiError::NotFound)?;
            let snapshot = vehicle
                .telem()
                .map_err(|e| ApiError::bad(e.to_string()))?;
            let chunk = snapshot
                .subgroup(kind)
                .ok_or_else(|| ApiError::bad(format!("could not retrieve {} object", kind)))?;
            Ok(Json(chunk).into_response())
        }
    }
}

fn telemetry_key(resource: &str) -> Option<&'static str> {
    Some(match resource {
        "info" => "Info",
        "status" => "Status",
        "gps" => "Gps",
        "mode" => "Mode",
        "attitude" => "Attitude",
        "position" => "Position",
        "motors" => "Motors",
        "input" => "Input",
        "rates" => "Rates",
        "target" => "Target",
        "sensors" => "Sensors",
        "home" => "Home",
        _ => return None,
    })
}

async fn resource_post(
    State(state): State<AppState>,
    Path((id, resource)): Path<(String, String)>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Response, ApiError> {
    info!("REQUEST POST /drone/{}/{}", id, resource);
    authorize(&state, &headers, &id).await?;

    let Some(vehicle) = state.registry.find_vehicle(&id).await else {
        return Err(ApiError::bad("vehicle is offline"));
    };
    let body = body_value(body);

    match resource.as_str() {
        "arm" => {
            vehicle.set_mode_and_arm(false, true, "", true);
            Ok(command_block(&vehicle, MavCmd::MAV_CMD_DO_SET_MODE as u32).await)
        }
        "disarm" => {
            vehicle.set_mode_and_arm(false, true, "", false);
            Ok(command_block(&vehicle, MavCmd::MAV_CMD_DO_SET_MODE as u32).await)
        }
        "mode" => handle_mode(&vehicle, &body).await,
        "takeoff" => handle_takeoff(&vehicle, &body).await,
        "land" => handle_land(&vehicle, &body).await,
        "goto" => handle_goto(&vehicle, &body).await,
        "home" => handle_home(&vehicle, &body).await,
        "command" => handle_command(&vehicle, &body).await,
        "input" => handle_input(&vehicle, &body).await,
        _ => Err(ApiError::NotFound),
    }
}

async fn handle_mode(vehicle: &Arc<Vehicle>, body: &Value) -> Result<Response, ApiError> {
    let arm = opt_bool(body, "arm")?;
    let mode = opt_str(body, "mode")?;
    vehicle.set_mode_and_arm(
        mode.is_some(),
        arm.is_some(),
        mode.as_deref().unwrap_or(""),
        arm.unwrap_or(false),
    );
    Ok(command_block(vehicle, MavCmd::MAV_CMD_DO_SET_MODE as u32).await)
}

async fn handle_takeoff(vehicle: &Arc<Vehicle>, body: &Value) -> Result<Response, ApiError> {
    let home = vehicle.model.home();
    vehicle.set_mode_and_arm(true, true, "Takeoff", true);

    let mut params = [0.0f32; 7];
    params[3] = opt_f32(body, "heading")?.unwrap_or(0.0);
    // Default climb-out target is 10 m above home.
    params[6] = opt_f32(body, "altitude")?.unwrap_or(10.0) + home.altitude;
    params[4] = opt_f32(body, "lat")?.unwrap_or(home.latitude);
    params[5] = opt_f32(body, "long")?.unwrap_or(home.longitude);

    vehicle.generic_command(MavCmd::MAV_CMD_NAV_TAKEOFF, params);
    Ok(command_block(vehicle, MavCmd::MAV_CMD_NAV_TAKEOFF as u32).await)
}

async fn handle_land(vehicle: &Arc<Vehicle>, body: &Value) -> Result<Response, ApiError> {
    let mut params = [0.0f32; 7];
    params[3] = opt_f32(body, "heading")?.unwrap_or(0.0);
    params[4] = opt_f32(body, "lat")?.unwrap_or(0.0);
    params[5] = opt_f32(body, "long")?.unwrap_or(0.0);

    vehicle.generic_command(MavCmd::MAV_CMD_NAV_LAND, params);
    Ok(command_block(vehicle, MavCmd::MAV_CMD_NAV_LAND as u32).await)
}

async fn handle_goto(vehicle: &Arc<Vehicle>, body: &Value) -> Result<Response, ApiError> {
    let position = vehicle.model.global_position();
    vehicle.set_mode_and_arm(true, false, "Hold", true);

    // Body coordinates are offsets from the present fix.
    let mut params = [0.0f32; 7];
    params[0] = opt_f32(body, "speed")?.unwrap_or(-1.0);
    params[3] = opt_f32(body, "heading")?.unwrap_or(0.0);
    params[6] = opt_f32(body, "altitude")?.unwrap_or(0.0) + vehicle.model.amsl_altitude();
    params[4] = opt_f32(body, "lat")?.unwrap_or(0.0) + position.latitude;
    params[5] = opt_f32(body, "lon")?.unwrap_or(0.0) + position.longitude;

    vehicle.generic_command(MavCmd::MAV_CMD_DO_REPOSITION, params);
    Ok(command_block(vehicle, MavCmd::MAV_CMD_DO_REPOSITION as u32).await)
}

async fn handle_home(vehicle: &Arc<Vehicle>, body: &Value) -> Result<Response, ApiError> {
    let home = vehicle.model.home();
    let lat = opt_f32(body, "lat")?.unwrap_or(home.latitude);
    let lon = opt_f32(body, "lon")?.unwrap_or(home.longitude);
    let alt = opt_f32(body, "alt")?.unwrap_or(home.altitude);
    let relative = opt_bool(body, "relative")?.unwrap_or(false);

    vehicle.set_home(lat, lon, alt, relative);
    Ok(command_block(vehicle, MavCmd::MAV_CMD_DO_SET_HOME as u32).await)
}

async fn handle_command(vehicle: &Arc<Vehicle>, body: &Value) -> Result<Response, ApiError> {
    let number = opt_f32(body, "command")?.ok_or_else(|| ApiError::bad("command is required"))?;
    let command =
        MavCmd::from_u32(number as u32).ok_or_else(|| ApiError::bad("unknown command"))?;

    let mut params = [0.0f32; 7];
    if let Some(args) = body.get("args") {
        let args = args
            .as_array()
            .ok_or_else(|| ApiError::bad("field 'args' must be an array"))?;
        for (i, arg) in args.iter().take(7).enumerate() {
            params[i] = arg
                .as_f64()
                .ok_or_else(|| ApiError::bad("args must be numbers"))? as f32;
        }
    }

    vehicle.generic_command(command, params);
    Ok(command_block(vehicle, command as u32).await)
}

async fn handle_input(vehicle: &Arc<Vehicle>, body: &Value) -> Result<Response, ApiError> {
    let kind = opt_str(body, "type")?.ok_or_else(|| ApiError::bad("type is required"))?;

    match kind.as_str() {
        "radio" => {
            let enabled = opt_bool(body, "enabled")?.unwrap_or(true);
            let timeout = opt_f32(body, "timeout")?.unwrap_or(0.0).max(0.0) as u64;

            // 65535 leaves a channel untouched.
            let mut channels = [u16::MAX; 8];
            if let Some(values) = body.get("channels") {
                let values = values
                    .as_array()
                    .ok_or_else(|| ApiError::bad("field 'channels' must be an array"))?;
                for (i, v) in values.iter().take(8).enumerate() {
                    channels[i] = v
                        .as_u64()
                        .ok_or_else(|| ApiError::bad("channels must be numbers"))?
                        as u16;
                }
            }

            vehicle
                .send_rc_override(channels, enabled, timeout)
                .await
                .map_err(|e| ApiError::bad(e.to_string()))?;
            Ok(Json(json!({"Status": "OK"})).into_response())
        }
        "mocap" => {
            let mut q = [0.0f32; 4];
            if let Some(values) = body.get("attitude") {
                let values = values
                    .as_array()
                    .ok_or_else(|| ApiError::bad("field 'attitude' must be an array"))?;
                for (i, v) in values.iter().take(4).enumerate() {
                    q[i] = v
                        .as_f64()
                        .ok_or_else(|| ApiError::bad("attitude must be numbers"))?
                        as f32;
                }
            }
            let x = opt_f32(body, "x")?.unwrap_or(0.0);
            let y = opt_f32(body, "y")?.unwrap_or(0.0);
            let z = opt_f32(body, "z")?.unwrap_or(0.0);

            vehicle
                .send_mocap(q, x, y, z)
                .await
                .map_err(|e| ApiError::bad(e.to_string()))?;
            Ok(Json(json!({"Status": "OK"})).into_response())
        }
        other => Err(ApiError::bad(format!("invalid input type: {}", other))),
    }
}

/// Polls the vehicle's last-completed slot until the issued command acks or
/// the window closes; either way the last-observed status goes back to the
/// caller.
async fn command_block(vehicle: &Arc<Vehicle>, command: u32) -> Response {
    let mut status = "Command unknown.";
    for _ in 0..COMMAND_POLLS {
        sleep(COMMAND_POLL_INTERVAL).await;
        let last = vehicle.last_completed();
        status = last.result_text();
        if last.command == Some(command) {
            vehicle.null_last_completed();
            return Json(json!({"Status": status, "Command": command})).into_response();
        }
    }
    Json(json!({"Status": status, "Command": command})).into_response()
}

async fn param_get(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    info!("REQUEST GET /drone/{}/param/{}", id, name);
    authorize(&state, &headers, &id).await?;
    let vehicle = state
        .registry
        .find_vehicle(&id)
        .await
        .ok_or_else(|| ApiError::bad("vehicle is offline"))?;

    let value = match name.parse::<u16>() {
        Ok(index) => vehicle.get_param_by_index(index).await,
        Err(_) => vehicle.get_param(&name),
    }
    .map_err(|e| ApiError::bad(e.to_string()))?;
    Ok(Json(json!(value)))
}

async fn param_set(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    info!("REQUEST POST /drone/{}/param/{}", id, name);
    authorize(&state, &headers, &id).await?;
    let vehicle = state
        .registry
        .find_vehicle(&id)
        .await
        .ok_or_else(|| ApiError::bad("vehicle is offline"))?;

    let body = body_value(body);
    let value = opt_f32(&body, "value")?.ok_or_else(|| ApiError::bad("value is required"))?;
    vehicle
        .set_param(&name, value)
        .await
        .map_err(|e| ApiError::bad(e.to_string()))?;
    Ok(Json(json!({"Status": "OK"})))
}

async fn params_refresh(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    info!("REQUEST GET /drone/{}/params/refresh", id);
    authorize(&state, &headers, &id).await?;
    let vehicle = state
        .registry
        .find_vehicle(&id)
        .await
        .ok_or_else(|| ApiError::bad("vehicle is offline"))?;

    vehicle.refresh_params();
    for _ in 0..REFRESH_POLLS {
        sleep(REFRESH_POLL_INTERVAL).await;
        let (current, total, _) = vehicle.all_params();
        if total > 0 && current >= total as usize {
            return Ok(Json(json!({"Status": "OK", "total": total})));
        }
    }
    Err(ApiError::bad("failed to fetch all params"))
}

async fn ssh_action(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    info!("REQUEST POST /drone/{}/ssh/{}", id, action);
    authorize(&state, &headers, &id).await?;

    let enable = match action.as_str() {
        "open" => true,
        "close" => false,
        _ => return Err(ApiError::NotFound),
    };

    let current = state.registry.get_terminal(&id).await;
    if enable && current.is_some() {
        return Err(ApiError::bad("SSH proxy already open"));
    }
    if !enable && current.is_none() {
        return Err(ApiError::bad("SSH proxy already closed"));
    }

    if !state.registry.update_terminal(&id, enable).await {
        return Err(ApiError::bad("vehicle is offline"));
    }

    // The drone reacts to the flag on its next STATUS exchange; wait for the
    // proxy endpoint to appear (or vanish).
    for _ in 0..TERMINAL_POLLS {
        sleep(TERMINAL_POLL_INTERVAL).await;
        match state.registry.get_terminal(&id).await {
            Some(info) if enable => {
                return Ok(Json(json!({
                    "Status": "OK",
                    "Info": {"url": info.url, "port": info.port},
                })));
            }
            None if !enable => return Ok(Json(json!({"Status": "OK"}))),
            _ => {}
        }
    }

    if enable {
        Err(ApiError::bad("could not create SSH proxy"))
    } else {
        Err(ApiError::bad("could not close SSH proxy"))
    }
}

/// Everything the facade does not own belongs to the identity provider.
async fn redirect_to_cloud(State(state): State<AppState>, uri: Uri) -> Response {
    let location = format!("{}/api{}", state.cloud.base_url(), uri.path());
    (
        StatusCode::FOUND,
        [(header::LOCATION, location)],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::Analytics;
    use crate::config::Config;
    use crate::logbook::LogBook;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let config = Config::default_for_tests();
        let analytics = Analytics::start(Arc::new(config.analytics));
        let logbook = Arc::new(LogBook::new(&config.logbook.dir));
        let registry = SessionRegistry::new(analytics, logbook);
        let cloud = Arc::new(CloudClient::new("http://provider.local:4000"));
        router(AppState { registry, cloud })
    }

    #[test]
    fn identifier_patterns() {
        // 24-hex id
        assert!(valid_identifier("5a9b12cd34ef56ab78cd90ef"));
        // 5-24 char name
        assert!(valid_identifier("alpha"));
        assert!(valid_identifier("drone-12"));
        // too short, bad chars
        assert!(!valid_identifier("abc"));
        assert!(!valid_identifier("has space"));
        assert!(!valid_identifier("way-too-long-name-exceeding-24-chars"));
    }

    #[tokio::test]
    async fn bad_identifier_is_404() {
        let app = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/drone/ab!/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn drones_listing_needs_no_auth() {
        let app = test_app();
        let response = app
            .oneshot(Request::builder().uri("/drones").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({}));
    }

    #[tokio::test]
    async fn unowned_routes_redirect_to_provider() {
        let app = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/user/me")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://provider.local:4000/api/user/me"
        );
    }

    #[tokio::test]
    async fn mission_routes_redirect_too() {
        let app = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/mission/current")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://provider.local:4000/api/mission/current"
        );
    }
}
