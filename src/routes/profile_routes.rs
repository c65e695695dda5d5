use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::required;
use crate::error::{AppError, SessionError};
use crate::number;
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct AboutQuery {
    pub number: Option<String>,
    pub target: Option<String>,
}

#[derive(Serialize)]
pub struct AboutResponse {
    pub status: &'static str,
    pub number: String,
    pub about: String,
    #[serde(rename = "setAt")]
    pub set_at: Option<String>,
}

/// GET /getabout?number=&target=
pub async fn get_about(
    State(state): State<SharedState>,
    Query(query): Query<AboutQuery>,
) -> Result<Json<AboutResponse>, AppError> {
    let number = number::normalize(required(&query.number, "number")?)?;
    let target = number::normalize(required(&query.target, "target")?)?;

    let session = state
        .manager
        .get(&number)
        .filter(|s| s.is_open())
        .ok_or_else(|| SessionError::NotConnected(number.clone()))?;

    let about = session
        .connection
        .fetch_about(&number::jid(&target))
        .await
        .map_err(|e| {
            tracing::warn!("{}: about lookup for {} failed: {:#}", number, target, e);
            AppError::Unavailable("failed to fetch about".into())
        })?;

    let Some(about) = about.filter(|a| a.status.is_some()) else {
        return Err(AppError::NotFound(format!("about not found for {target}")));
    };

    Ok(Json(AboutResponse {
        status: "success",
        number: target,
        about: about.status.unwrap_or_default(),
        set_at: about
            .set_at
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.to_rfc3339()),
    }))
}
