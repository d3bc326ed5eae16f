pub mod gateway;
pub mod middleware;
pub mod protocol;
pub mod rest;
pub mod state;
pub mod ws_handler;

pub use gateway::{SessionError, SessionGateway, SessionOutcome};
pub use middleware::require_auth;
pub use state::AppState;
pub use ws_handler::join_handler;

use axum::{
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderName, HeaderValue, Method,
    },
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// Builds the full HTTP surface under `/v1`.
pub fn router(app_state: Arc<AppState>) -> Router {
    let protected_routes = Router::new()
        .route("/interview/set-up", post(rest::set_up_handler))
        .route("/interview/abandon", post(rest::abandon_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_auth,
        ));

    let public_routes = Router::new()
        .route("/health", get(rest::health_handler))
        .route("/interview/join", get(join_handler))
        .route("/audio/{key}", get(rest::audio_handler));

    let api_router = Router::new().merge(public_routes).merge(protected_routes);

    Router::new()
        .nest("/v1", api_router)
        .layer(cors_layer(&app_state.config.trusted_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Any origin when none are trusted explicitly; credentials only for trusted ones.
fn cors_layer(trusted_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .expose_headers([rest::INTERVIEW_TOKEN_HEADER]);

    if trusted_origins.is_empty() {
        return cors.allow_origin(Any).allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = trusted_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid trusted origin");
                None
            }
        })
        .collect();
    cors.allow_origin(origins)
        .allow_credentials(true)
        .allow_headers([
            CONTENT_TYPE,
            ACCEPT,
            HeaderName::from_static(middleware::SESSION_TOKEN_HEADER),
        ])
}
