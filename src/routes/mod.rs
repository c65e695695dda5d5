pub mod config_routes;
pub mod profile_routes;
pub mod session_routes;

use crate::error::AppError;
use crate::state::SharedState;
use axum::{
    http::{header, Method},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn app(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        // Sessions
        .route("/", get(session_routes::pair))
        .route("/active", get(session_routes::active))
        .route("/ping", get(session_routes::ping))
        .route("/connect-all", get(session_routes::connect_all))
        .route("/reconnect", get(session_routes::reconnect))
        // Config
        .route("/update-config", get(config_routes::update_config))
        .route("/verify-otp", get(config_routes::verify_otp))
        // Profile
        .route("/getabout", get(profile_routes::get_about))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// A query parameter that must be present and non-blank.
pub(crate) fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, AppError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("{name} parameter is required")))
}
