use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::required;
use crate::error::{AppError, SessionError};
use crate::number;
use crate::settings::{self, ConfirmError};
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct UpdateConfigQuery {
    pub number: Option<String>,
    pub config: Option<String>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub message: String,
}

/// GET /update-config?number=&config=
pub async fn update_config(
    State(state): State<SharedState>,
    Query(query): Query<UpdateConfigQuery>,
) -> Result<Json<StatusResponse>, AppError> {
    let number = number::normalize(required(&query.number, "number")?)?;
    let raw = required(&query.config, "config")?;
    let pending = settings::parse_overrides(raw).map_err(AppError::BadRequest)?;

    let session = state
        .manager
        .get(&number)
        .filter(|s| s.is_open())
        .ok_or_else(|| SessionError::NotConnected(number.clone()))?;

    state
        .resolver
        .request_change(&number, &session.own_jid(), pending, session.connection.as_ref())
        .await
        .map_err(|e| {
            tracing::warn!("failed to deliver config OTP to {}: {:#}", number, e);
            AppError::Unavailable("failed to deliver OTP".into())
        })?;

    Ok(Json(StatusResponse {
        status: "otp_sent",
        message: "OTP sent to your number".into(),
    }))
}

#[derive(Deserialize)]
pub struct VerifyOtpQuery {
    pub number: Option<String>,
    pub otp: Option<String>,
}

/// GET /verify-otp?number=&otp=
pub async fn verify_otp(
    State(state): State<SharedState>,
    Query(query): Query<VerifyOtpQuery>,
) -> Result<Json<StatusResponse>, AppError> {
    let number = number::normalize(required(&query.number, "number")?)?;
    let otp = required(&query.otp, "otp")?;

    if !state.verify_limiter.check_and_record(&number) {
        tracing::warn!("OTP verification rate limited for {}", number);
        return Err(AppError::RateLimited);
    }

    match state.resolver.confirm_change(&number, otp) {
        Ok(_) => {}
        Err(ConfirmError::Otp(e)) => return Err(AppError::BadRequest(e.to_string())),
        Err(ConfirmError::Store(e)) => return Err(AppError::Internal(e)),
    }
    state.verify_limiter.reset(&number);

    if let Some(session) = state.manager.get(&number).filter(|s| s.is_open()) {
        let text = "✅ *CONFIG UPDATED*\n\nYour configuration has been updated successfully.";
        if let Err(e) = session.connection.send_text(&session.own_jid(), text).await {
            tracing::debug!("config confirmation not delivered to {}: {:#}", number, e);
        }
    }

    Ok(Json(StatusResponse {
        status: "success",
        message: "Config updated successfully".into(),
    }))
}
