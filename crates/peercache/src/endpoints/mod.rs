use axum::Router;
use axum::routing::get;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use crate::service::Service;

mod error;
mod groups;
mod metrics;

pub use error::ResponseError;
use metrics::MetricsLayer;

use groups::{get_empty_key, get_group_stats, get_peer_value, get_value};

pub async fn healthcheck() -> &'static str {
    peercache_service::metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: Service) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);
    Router::new()
        .route("/_peercache/:group/:key", get(get_peer_value))
        .route("/_peercache/:group/", get(get_empty_key))
        .route("/api/:group/:key", get(get_value))
        .route("/api/:group/", get(get_empty_key))
        .route("/api/:group", get(get_group_stats))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
