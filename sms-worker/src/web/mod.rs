//! HTTP surface for the pipeline.
//!
//! Every route except `/health` and the gateway callback is scoped to the
//! owner named in `X-Owner-Id`; authentication happens in front of this
//! server.

pub mod error;
pub mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use handlers::{AppState, HealthResponse, Owner, OWNER_HEADER};

/// Room for multipart framing on top of the file itself.
const UPLOAD_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let upload_limit = usize::try_from(
        state
            .config
            .import_max_file_bytes
            .saturating_add(UPLOAD_OVERHEAD_BYTES),
    )
    .unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/imports",
            post(handlers::upload_import).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/imports/:id", get(handlers::get_import))
        .route("/imports/:id/cancel", post(handlers::cancel_import))
        .route("/templates", post(handlers::create_template))
        .route("/templates/:id", get(handlers::get_template))
        .route("/templates/:id/deactivate", post(handlers::deactivate_template))
        .route("/campaigns", post(handlers::create_campaign))
        .route("/campaigns/:id", get(handlers::get_campaign))
        .route("/campaigns/:id/start", post(handlers::start_campaign))
        .route("/campaigns/:id/pause", post(handlers::pause_campaign))
        .route("/campaigns/:id/cancel", post(handlers::cancel_campaign))
        .route("/campaigns/:id/status", get(handlers::campaign_status))
        .route("/batches/:id", get(handlers::batch_progress))
        .route("/messages", post(handlers::send_message))
        .route(
            "/messages/:id",
            get(handlers::get_message).delete(handlers::delete_message),
        )
        .route("/messages/:id/retry", post(handlers::retry_message))
        .route(
            "/webhooks",
            post(handlers::create_webhook).get(handlers::list_webhooks),
        )
        .route("/webhooks/deliveries/failed", get(handlers::failed_deliveries))
        .route("/webhooks/:id/deactivate", post(handlers::deactivate_webhook))
        .route("/callbacks/gateway", post(handlers::gateway_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
