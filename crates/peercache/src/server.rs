use std::net::SocketAddr;

use anyhow::{Context, Result};
use peercache_service::config::Config;
use peercache_service::metric;

use crate::endpoints;
use crate::service::Service;

/// Builds all groups and serves them over HTTP based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("peercache-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let service = Service::create(&config).context("failed to create HTTP service state")?;
    let socket = config.bind.parse::<SocketAddr>()?;

    tracing::info!(
        self_url = %config.self_url(),
        peered = service.pool().is_some(),
        groups = config.groups.len(),
        "Starting HTTP server on {}",
        socket
    );
    web_pool.block_on(async move {
        axum_server::bind(socket)
            .serve(endpoints::create_app(service).into_make_service())
            .await
    })?;
    tracing::info!("System shutdown complete");

    Ok(())
}
