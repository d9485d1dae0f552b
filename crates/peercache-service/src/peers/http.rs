//! Peer routing and transport over HTTP.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use url::Url;

use super::{HashRing, PeerError, PeerGetter, PeerPicker};

/// The first path segment of the peer protocol: `GET /_peercache/{group}/{key}`.
pub const PEER_BASE_PATH: &str = "_peercache";

/// Fetches values from a single peer over HTTP.
#[derive(Debug)]
pub struct HttpGetter {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpGetter {
    pub fn new(client: Client, base_url: Url, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            timeout,
        }
    }

    /// The URL of `key` in `group` on this peer. Both segments are percent-encoded.
    fn url_for(&self, group: &str, key: &str) -> Result<Url, PeerError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PeerError::Transport(format!("invalid peer URL `{}`", self.base_url)))?
            .pop_if_empty()
            .extend([PEER_BASE_PATH, group, key]);
        Ok(url)
    }

    fn map_error(&self, err: reqwest::Error) -> PeerError {
        if err.is_timeout() {
            PeerError::Timeout(self.timeout)
        } else {
            PeerError::Transport(err.to_string())
        }
    }
}

impl PeerGetter for HttpGetter {
    fn get<'a>(&'a self, group: &'a str, key: &'a str) -> BoxFuture<'a, Result<Bytes, PeerError>> {
        Box::pin(async move {
            let url = self.url_for(group, key)?;
            tracing::trace!(%url, "Fetching from peer");

            let response = self
                .client
                .get(url)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| self.map_error(e))?;

            match response.status() {
                StatusCode::OK => response.bytes().await.map_err(|e| self.map_error(e)),
                StatusCode::NOT_FOUND => Err(PeerError::NotFound),
                status => Err(PeerError::Status(status.as_u16())),
            }
        })
    }
}

#[derive(Debug)]
struct PoolState {
    ring: HashRing,
    getters: HashMap<String, Arc<HttpGetter>>,
}

/// A set of HTTP peers, one of which is the current node.
///
/// Keys are assigned to peers with a consistent [`HashRing`]. Keys owned by the current node are
/// not routed anywhere, so the group loads them locally.
#[derive(Debug)]
pub struct HttpPool {
    self_url: String,
    client: Client,
    replicas: usize,
    timeout: Duration,
    state: RwLock<PoolState>,
}

fn normalize(url: &str) -> &str {
    url.trim_end_matches('/')
}

impl HttpPool {
    /// Creates an empty pool for the node reachable at `self_url`.
    pub fn new(self_url: &str, client: Client, replicas: usize, timeout: Duration) -> Self {
        Self {
            self_url: normalize(self_url).to_owned(),
            client,
            replicas,
            timeout,
            state: RwLock::new(PoolState {
                ring: HashRing::new(replicas),
                getters: HashMap::new(),
            }),
        }
    }

    /// This node's own URL.
    pub fn self_url(&self) -> &str {
        &self.self_url
    }

    /// Replaces the set of peers. The list should include this node's own URL.
    pub fn set_peers<I, S>(&self, peers: I) -> Result<(), url::ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = HashRing::new(self.replicas);
        let mut getters = HashMap::new();

        for peer in peers {
            let peer = normalize(peer.as_ref());
            let base_url = Url::parse(peer)?;
            let getter = HttpGetter::new(self.client.clone(), base_url, self.timeout);
            getters.insert(peer.to_owned(), Arc::new(getter));
        }
        ring.add(getters.keys().cloned());

        tracing::info!(
            peers = getters.len(),
            self_url = %self.self_url,
            "Updated peer set"
        );

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = PoolState { ring, getters };
        Ok(())
    }
}

impl PeerPicker for HttpPool {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let peer = state.ring.get(key)?;
        if peer == self.self_url {
            return None;
        }

        tracing::trace!(peer, key, "Picked peer");
        let getter = state.getters.get(peer)?;
        Some(Arc::clone(getter) as Arc<dyn PeerGetter>)
    }
}
