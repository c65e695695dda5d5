use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::required;
use crate::error::AppError;
use crate::session::{ConnectResult, EnsureMode, EnsureOutcome};
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct PairQuery {
    pub number: Option<String>,
}

/// GET /?number=
pub async fn pair(
    State(state): State<SharedState>,
    Query(query): Query<PairQuery>,
) -> Result<Json<Value>, AppError> {
    let raw = required(&query.number, "number")?;
    let outcome = state.manager.ensure(raw, EnsureMode::Pair).await?;

    let body = match &outcome {
        EnsureOutcome::PairingCode { code, .. } => json!({ "code": code }),
        EnsureOutcome::AlreadyConnected(session) if session.is_open() => json!({
            "status": outcome.status(),
            "message": "This number is already connected",
        }),
        EnsureOutcome::AlreadyConnected(_) => json!({
            "status": outcome.status(),
            "message": "Pairing is already in progress for this number",
        }),
        EnsureOutcome::Connected(_) => json!({
            "status": outcome.status(),
            "message": "Session restored from stored credentials",
        }),
        EnsureOutcome::NotRegistered => json!({ "status": outcome.status() }),
    };
    Ok(Json(body))
}

#[derive(Serialize)]
pub struct ActiveResponse {
    pub count: usize,
    pub numbers: Vec<String>,
}

/// GET /active
pub async fn active(State(state): State<SharedState>) -> Json<ActiveResponse> {
    let numbers = state.manager.active_numbers();
    Json(ActiveResponse {
        count: numbers.len(),
        numbers,
    })
}

/// GET /ping
pub async fn ping(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "active",
        "message": "bot is running",
        "activesession": state.manager.active_numbers().len(),
    }))
}

#[derive(Serialize)]
pub struct ConnectResponse {
    pub status: &'static str,
    pub connections: Vec<ConnectResult>,
}

/// GET /connect-all: every number that completed pairing.
pub async fn connect_all(
    State(state): State<SharedState>,
) -> Result<Json<ConnectResponse>, AppError> {
    let numbers = state.store.known_numbers()?;
    if numbers.is_empty() {
        return Err(AppError::NotFound("no numbers found to connect".into()));
    }
    let connections = state.manager.connect_numbers(numbers).await;
    Ok(Json(ConnectResponse {
        status: "success",
        connections,
    }))
}

/// GET /reconnect: every persisted session record.
pub async fn reconnect(
    State(state): State<SharedState>,
) -> Result<Json<ConnectResponse>, AppError> {
    let numbers = state.store.numbers()?;
    if numbers.is_empty() {
        return Err(AppError::NotFound("no session files found".into()));
    }
    let connections = state.manager.connect_numbers(numbers).await;
    Ok(Json(ConnectResponse {
        status: "success",
        connections,
    }))
}
