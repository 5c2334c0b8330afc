//! The HTTP surface: one axum router serving both the Unix-domain socket
//! and the loopback TCP listener. JSON in, JSON out, with the `{error}`
//! envelope on every failure, loopback-only CORS, per-caller rate
//! limiting, and SSE framing for subscriber streams.

pub mod error;
pub mod extract;
pub mod handlers;
pub mod rate_limit;
pub mod state;

use std::sync::Arc;

use axum::{
    http::HeaderValue,
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use state::{ApiState, CleanupRunner, NoopCleanup, ReaperStats};

use rate_limit::rate_limit_middleware;

/// Build the full router. Static dashboard assets are served from
/// `public/` next to the daemon when that directory exists.
pub fn api_router(state: Arc<ApiState>) -> Router {
    let mut router = Router::new()
        // Services
        .route("/claim", post(handlers::services::claim))
        .route("/release", delete(handlers::services::release))
        .route("/services", get(handlers::services::list))
        .route("/services/{id}", get(handlers::services::get))
        .route(
            "/services/{id}/endpoints",
            get(handlers::services::endpoints),
        )
        .route(
            "/services/{id}/endpoints/{env}",
            put(handlers::services::set_endpoint),
        )
        // Locks
        .route("/locks", get(handlers::locks::list))
        .route(
            "/locks/{name}",
            post(handlers::locks::acquire)
                .delete(handlers::locks::release)
                .put(handlers::locks::extend)
                .get(handlers::locks::check),
        )
        // Messages
        .route("/channels", get(handlers::messages::channels))
        .route(
            "/msg/{channel}",
            post(handlers::messages::publish)
                .get(handlers::messages::read)
                .delete(handlers::messages::clear),
        )
        .route("/msg/{channel}/poll", get(handlers::messages::poll))
        .route(
            "/msg/{channel}/subscribe",
            get(handlers::messages::subscribe),
        )
        // Agents
        .route(
            "/agents",
            post(handlers::agents::register).get(handlers::agents::list),
        )
        .route(
            "/agents/{id}",
            get(handlers::agents::get).delete(handlers::agents::unregister),
        )
        .route("/agents/{id}/heartbeat", put(handlers::agents::heartbeat))
        .route(
            "/agents/{id}/inbox",
            get(handlers::agents::inbox_list)
                .post(handlers::agents::inbox_post)
                .delete(handlers::agents::inbox_clear),
        )
        .route(
            "/agents/{id}/inbox/read-all",
            post(handlers::agents::inbox_read_all),
        )
        .route(
            "/agents/{id}/inbox/stats",
            get(handlers::agents::inbox_stats),
        )
        // Resurrection
        .route(
            "/resurrection/pending",
            get(handlers::agents::resurrection_pending),
        )
        .route(
            "/resurrection/claim/{old_id}",
            post(handlers::agents::resurrection_claim),
        )
        .route(
            "/resurrection/complete/{old_id}",
            post(handlers::agents::resurrection_complete),
        )
        .route(
            "/resurrection/abandon/{old_id}",
            post(handlers::agents::resurrection_abandon),
        )
        .route(
            "/resurrection/dismiss/{old_id}",
            post(handlers::agents::resurrection_dismiss),
        )
        // Sessions and notes
        .route(
            "/sessions",
            post(handlers::sessions::start).get(handlers::sessions::list),
        )
        .route(
            "/sessions/{id}",
            get(handlers::sessions::get)
                .put(handlers::sessions::update)
                .delete(handlers::sessions::delete),
        )
        .route(
            "/sessions/{id}/notes",
            post(handlers::sessions::add_note).get(handlers::sessions::notes),
        )
        .route(
            "/sessions/{id}/files",
            post(handlers::sessions::claim_files)
                .delete(handlers::sessions::release_files)
                .get(handlers::sessions::files),
        )
        .route(
            "/notes",
            post(handlers::sessions::quick_note).get(handlers::sessions::recent_notes),
        )
        // Webhooks
        .route(
            "/webhooks",
            post(handlers::webhooks::create).get(handlers::webhooks::list),
        )
        .route(
            "/webhooks/{id}",
            get(handlers::webhooks::get)
                .put(handlers::webhooks::update)
                .delete(handlers::webhooks::delete),
        )
        .route("/webhooks/{id}/test", post(handlers::webhooks::test))
        .route(
            "/webhooks/{id}/deliveries",
            get(handlers::webhooks::deliveries),
        )
        // Activity
        .route("/activity", get(handlers::activity::recent))
        .route("/activity/summary", get(handlers::activity::summary))
        .route("/activity/stats", get(handlers::activity::stats))
        .route("/activity/range", get(handlers::activity::range))
        // Ports and diagnostics
        .route("/ports/cleanup", post(handlers::misc::ports_cleanup))
        .route("/ports/active", get(handlers::misc::ports_active))
        .route("/ports/system", get(handlers::misc::ports_system))
        .route("/health", get(handlers::misc::health))
        .route("/version", get(handlers::misc::version))
        .route("/metrics", get(handlers::misc::metrics))
        .route("/config", get(handlers::misc::config));

    if std::path::Path::new("public").is_dir() {
        router = router.fallback_service(ServeDir::new("public"));
    }

    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(loopback_cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS restricted to loopback origins (the dashboard and local tools).
fn loopback_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|o| {
                    o.starts_with("http://localhost")
                        || o.starts_with("http://127.0.0.1")
                        || o.starts_with("https://localhost")
                        || o.starts_with("https://127.0.0.1")
                })
                .unwrap_or(false)
        }))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}
