/**
 * TABLEAU DE BORD - API HTTP en lecture seule
 *
 * RÔLE :
 * Expose l'état vivant de la passerelle : appareils vus sur les ports série,
 * dernières mesures, état des liens et du relais.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, routes : /health, /devices, /devices/{uid}, /system/health
 * - Lecture par instantané du StatusBoard, aucune écriture
 * - Appareil vu il y a plus de 30s = "Error", jamais vu = "Not detected"
 */

use crate::config::{DashboardConf, Topology};
use crate::health::{GatewayHealth, HealthTracker};
use crate::logging::LogContext;
use crate::serial::SerialPorts;
use crate::status::{DeviceStatus, StatusBoard, StatusEntry};
use crate::transport::{ConnectionSet, LinkClient};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use farm_protocol::{SystemCode, Uid};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, serde::Serialize)]
pub struct DeviceView {
    pub uid: Uid,
    pub system_code: SystemCode,
    pub status: DeviceStatus,
    pub port: Option<String>,
    pub last_check: Option<String>, // RFC3339
    pub stale_for_seconds: Option<i64>,
    pub last_data: BTreeMap<String, u32>,
}

fn to_view(uid: Uid, entry: &StatusEntry, board: &StatusBoard, now: OffsetDateTime) -> DeviceView {
    let age = now - entry.last_check;
    DeviceView {
        uid,
        system_code: entry.system_code.clone(),
        status: DeviceStatus::of(Some(entry), now),
        port: Some(entry.port.clone()),
        last_check: Some(entry.last_check.format(&Rfc3339).unwrap_or_default()),
        stale_for_seconds: Some(age.whole_seconds().max(0)),
        last_data: board.last_values(&entry.system_code),
    }
}

fn not_detected(uid: Uid, code: &SystemCode) -> DeviceView {
    DeviceView {
        uid,
        system_code: code.clone(),
        status: DeviceStatus::NotDetected,
        port: None,
        last_check: None,
        stale_for_seconds: None,
        last_data: BTreeMap::new(),
    }
}

#[derive(Clone)]
pub struct DashboardState {
    pub topology: Arc<Topology>,
    pub board: StatusBoard,
    pub health: HealthTracker,
    pub ports: SerialPorts,
    pub links: Vec<LinkClient>,
    pub inbound: ConnectionSet,
}

pub fn build_router(state: DashboardState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/devices", get(list_devices))
        .route("/devices/{uid}", get(get_device))
        .with_state(state)
}

// GET /devices (vus + configurés jamais vus)
async fn list_devices(State(app): State<DashboardState>) -> Json<Vec<DeviceView>> {
    let now = OffsetDateTime::now_utc();
    let mut seen = BTreeSet::new();
    let mut list: Vec<DeviceView> = app
        .board
        .seen_devices()
        .iter()
        .map(|(uid, entry)| {
            seen.insert(*uid);
            to_view(*uid, entry, &app.board, now)
        })
        .collect();

    for (code, uid) in app.topology.identities.all_devices() {
        if seen.insert(uid) {
            list.push(not_detected(uid, code));
        }
    }
    Json(list)
}

// GET /devices/{uid}
async fn get_device(
    State(app): State<DashboardState>,
    Path(raw): Path<String>,
) -> Result<Json<DeviceView>, StatusCode> {
    let uid: Uid = raw.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    if let Some(entry) = app.board.entry(uid) {
        return Ok(Json(to_view(uid, &entry, &app.board, OffsetDateTime::now_utc())));
    }
    app.topology
        .identities
        .all_devices()
        .find(|(_, known)| *known == uid)
        .map(|(code, _)| Json(not_detected(uid, code)))
        .ok_or(StatusCode::NOT_FOUND)
}

// GET /system/health
async fn get_system_health(State(app): State<DashboardState>) -> Json<GatewayHealth> {
    Json(app.health.get_health(app.topology.profile(), &app.ports, &app.links, &app.inbound))
}

/// Serves the dashboard until cancelled.
pub async fn serve(
    conf: &DashboardConf,
    state: DashboardState,
    cancel: CancellationToken,
    log: LogContext,
) -> std::io::Result<()> {
    let listener = TcpListener::bind((conf.host.as_str(), conf.port)).await?;
    info!(parent: log.span(), addr = %listener.local_addr()?, "dashboard listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
