//! The state shared by all request handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use peercache_service::config::Config;
use peercache_service::group::Group;
use peercache_service::peers::{HttpPool, PeerPicker};
use peercache_service::registry::Registry;

/// All groups of this node, and the peer pool routing their keys.
#[derive(Clone, Debug)]
pub struct Service {
    registry: Arc<Registry>,
    pool: Option<Arc<HttpPool>>,
}

impl Service {
    /// Creates every configured group and, if peers are configured, connects them to the pool.
    pub fn create(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context("failed to build HTTP client")?;

        let registry = Arc::new(Registry::new());
        for group in &config.groups {
            let loader = group.source.clone().into_loader(client.clone());
            registry.create(&group.name, group.capacity, loader);
        }

        let pool = if config.peers.is_empty() {
            None
        } else {
            let self_url = config.self_url();
            let pool = HttpPool::new(&self_url, client, config.replicas, config.peer_timeout);
            pool.set_peers(&config.peers)
                .context("invalid peer URL in configuration")?;

            if !config
                .peers
                .iter()
                .any(|peer| peer.trim_end_matches('/') == pool.self_url())
            {
                tracing::warn!(%self_url, "This node is not part of its own peer list");
            }

            let pool = Arc::new(pool);
            for name in registry.names() {
                if let Some(group) = registry.get(&name) {
                    group.register_peers(Arc::clone(&pool) as Arc<dyn PeerPicker>);
                }
            }
            Some(pool)
        };

        Ok(Self { registry, pool })
    }

    /// Looks up a group by name.
    pub fn group(&self, name: &str) -> Option<Arc<Group>> {
        self.registry.get(name)
    }

    /// The peer pool, if this node runs with peers.
    pub fn pool(&self) -> Option<&HttpPool> {
        self.pool.as_deref()
    }
}
