use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use peercache_service::group::{Group, StatsSnapshot};

use crate::service::Service;

use super::ResponseError;

fn find_group(service: &Service, name: &str) -> Result<Arc<Group>, ResponseError> {
    service.group(name).ok_or_else(|| {
        ResponseError::from((
            StatusCode::NOT_FOUND,
            anyhow::anyhow!("unknown group `{name}`"),
        ))
    })
}

async fn serve_value(
    service: &Service,
    group: &str,
    key: &str,
    from_peer: bool,
) -> Result<Response, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_tag("group", group);
    });

    let group = find_group(service, group)?;
    let value = if from_peer {
        group.get_as_owner(key).await?
    } else {
        group.get(key).await?
    };

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        value.to_bytes(),
    )
        .into_response())
}

/// Serves a single value to a client as raw bytes.
pub async fn get_value(
    State(service): State<Service>,
    Path((group, key)): Path<(String, String)>,
) -> Result<Response, ResponseError> {
    serve_value(&service, &group, &key, false).await
}

/// Serves a single value to a peer that routed the key here.
///
/// The value is loaded locally and never forwarded to another peer.
pub async fn get_peer_value(
    State(service): State<Service>,
    Path((group, key)): Path<(String, String)>,
) -> Result<Response, ResponseError> {
    serve_value(&service, &group, &key, true).await
}

/// Handles a request with an empty key, which the routes with a `:key` segment never match.
pub async fn get_empty_key(
    State(service): State<Service>,
    Path(group): Path<String>,
) -> Result<Response, ResponseError> {
    serve_value(&service, &group, "", false).await
}

/// Serves the counters of a group as JSON.
pub async fn get_group_stats(
    State(service): State<Service>,
    Path(group): Path<String>,
) -> Result<Json<StatsSnapshot>, ResponseError> {
    let group = find_group(&service, &group)?;
    Ok(Json(group.stats()))
}
