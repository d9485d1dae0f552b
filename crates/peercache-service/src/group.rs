//! Named cache namespaces and their miss handling.
//!
//! A [`Group`] answers [`get`](Group::get) requests from its [`EvictionCache`]. On a miss, the
//! value is loaded once per key through the group's [`Coalescer`]:
//!
//! 1. If a [`PeerPicker`] is registered and names a remote owner for the key, the value is fetched
//!    from that peer. Values from peers are returned as-is and are *not* put into the local cache,
//!    as the owning peer already caches them.
//! 2. If there is no owning peer, or fetching from it fails for whatever reason, the group's
//!    [`Loader`] is asked. Its result is copied into a [`ByteView`] and cached.
//!
//! Loader errors are handed to every caller that waited for the same load, and nothing is cached
//! for them.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{EvictionCache, InMemoryCache};
use crate::coalesce::{CallFault, Coalesced, Coalescer};
use crate::peers::{PeerError, PeerGetter, PeerPicker};
use crate::value::ByteView;

/// The authoritative data source of a [`Group`].
///
/// The group guarantees that `load` is never called concurrently for the same key, but it may
/// well be called concurrently for different keys.
pub trait Loader: Send + Sync {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<u8>>>;
}

/// A [`Loader`] implemented by a closure, see [`loader_fn`].
#[derive(Clone)]
pub struct LoaderFn<F>(F);

/// Turns a closure into a [`Loader`].
///
/// ```
/// use peercache_service::group::loader_fn;
///
/// let loader = loader_fn(|key: String| async move { Ok(key.into_bytes()) });
/// ```
pub fn loader_fn<F, Fut>(f: F) -> LoaderFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
{
    LoaderFn(f)
}

impl<F, Fut> Loader for LoaderFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
{
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<u8>>> {
        Box::pin((self.0)(key.to_owned()))
    }
}

impl<F> fmt::Debug for LoaderFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderFn").finish_non_exhaustive()
    }
}

/// An error returned from [`Group::get`].
///
/// Errors are cheap to clone: all callers that shared one load receive clones of the very same
/// error.
#[derive(Debug, Clone, Error)]
pub enum GroupError {
    /// The requested key was empty.
    #[error("key is required")]
    EmptyKey,
    /// The group's loader failed. Contains the loader's error unchanged.
    #[error("failed to load value: {0:#}")]
    Load(Arc<anyhow::Error>),
    /// The load panicked.
    #[error(transparent)]
    Fault(#[from] CallFault),
}

impl GroupError {
    /// Returns the loader's error, if this is a [`Load`](Self::Load) error.
    pub fn load_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Load(err) => Some(err),
            _ => None,
        }
    }
}

/// Counters of a [`Group`]'s activity.
#[derive(Debug, Default)]
pub struct Stats {
    gets: AtomicU64,
    cache_hits: AtomicU64,
    loads: AtomicU64,
    loads_deduped: AtomicU64,
    peer_loads: AtomicU64,
    peer_errors: AtomicU64,
    local_loads: AtomicU64,
    local_load_errs: AtomicU64,
}

fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// A point-in-time copy of a group's [`Stats`] and cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// All `get` requests, including invalid ones.
    pub gets: u64,
    /// Requests served from the local cache.
    pub cache_hits: u64,
    /// Loads that actually ran, after coalescing.
    pub loads: u64,
    /// Requests that waited for a load started by another request.
    pub loads_deduped: u64,
    /// Values successfully fetched from a peer.
    pub peer_loads: u64,
    /// Failed fetches from a peer.
    pub peer_errors: u64,
    /// Values successfully produced by the local loader.
    pub local_loads: u64,
    /// Failed local loads.
    pub local_load_errs: u64,
    /// Bytes held by the local cache.
    pub cache_bytes: u64,
    /// Entries held by the local cache.
    pub cache_items: u64,
}

/// A named cache namespace.
pub struct Group {
    name: String,
    loader: Arc<dyn Loader>,
    cache: Arc<dyn EvictionCache>,
    peers: OnceLock<Arc<dyn PeerPicker>>,
    /// Coalesces whole misses, including the trip to the owning peer.
    coalescer: Coalescer<String, Result<ByteView, GroupError>>,
    /// Coalesces calls to the loader, no matter which kind of request caused them.
    local: Coalescer<String, Result<ByteView, GroupError>>,
    stats: Stats,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("cache", &self.cache)
            .field("peers", &self.peers.get())
            .field("coalescer", &self.coalescer)
            .finish_non_exhaustive()
    }
}

impl Group {
    /// Creates a group with an [`InMemoryCache`] of `capacity` bytes.
    ///
    /// Groups are usually created through a [`Registry`](crate::registry::Registry), which makes
    /// them available by name.
    pub fn new(name: &str, capacity: u64, loader: Arc<dyn Loader>) -> Self {
        let cache = Arc::new(InMemoryCache::new(name, capacity));
        Self::with_cache(name, cache, loader)
    }

    /// Creates a group that stores its values in `cache`.
    pub fn with_cache(name: &str, cache: Arc<dyn EvictionCache>, loader: Arc<dyn Loader>) -> Self {
        Self {
            name: name.to_owned(),
            loader,
            cache,
            peers: OnceLock::new(),
            coalescer: Coalescer::new(),
            local: Coalescer::new(),
            stats: Stats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers the peer picker used to route loads to remote owners.
    ///
    /// # Panics
    ///
    /// Panics when called more than once for the same group.
    pub fn register_peers(&self, peers: Arc<dyn PeerPicker>) {
        if self.peers.set(peers).is_err() {
            panic!("register_peers called more than once for group `{}`", self.name);
        }
    }

    /// Returns the value of `key`, from the cache or by loading it.
    pub async fn get(&self, key: &str) -> Result<ByteView, GroupError> {
        if let Some(cached) = self.lookup(key) {
            return cached;
        }
        self.load(key).await
    }

    /// Returns the value of `key` as its owner, from the cache or the local loader.
    ///
    /// Unlike [`get`](Self::get), this never asks a peer. It answers requests that other peers
    /// routed here: forwarding those again could bounce between nodes that disagree about who owns
    /// the key, while every hop waits on the one before it.
    pub async fn get_as_owner(&self, key: &str) -> Result<ByteView, GroupError> {
        if let Some(cached) = self.lookup(key) {
            return cached;
        }
        let coalesced = self
            .local
            .run(key.to_owned(), || async {
                self.count_load();
                self.get_locally(key).await
            })
            .await;
        self.settle(coalesced, key)
    }

    /// Validates `key` and looks it up in the cache.
    fn lookup(&self, key: &str) -> Option<Result<ByteView, GroupError>> {
        incr(&self.stats.gets);
        metric!(counter("groups.get") += 1, "group" => self.name.as_str());

        if key.is_empty() {
            return Some(Err(GroupError::EmptyKey));
        }

        let value = self.cache.get(key)?;
        incr(&self.stats.cache_hits);
        metric!(counter("groups.cache.hit") += 1, "group" => self.name.as_str());
        tracing::trace!(group = %self.name, key, "Cache hit");
        Some(Ok(value))
    }

    fn count_load(&self) {
        incr(&self.stats.loads);
        metric!(counter("groups.load") += 1, "group" => self.name.as_str());
    }

    /// Loads `key`, deduplicating concurrent loads of the same key.
    async fn load(&self, key: &str) -> Result<ByteView, GroupError> {
        let coalesced = self
            .coalescer
            .run(key.to_owned(), || async {
                self.count_load();
                self.fetch(key).await
            })
            .await;
        self.settle(coalesced, key)
    }

    fn settle(
        &self,
        coalesced: Coalesced<Result<ByteView, GroupError>>,
        key: &str,
    ) -> Result<ByteView, GroupError> {
        if coalesced.shared {
            incr(&self.stats.loads_deduped);
            metric!(counter("groups.load.coalesced") += 1, "group" => self.name.as_str());
            tracing::trace!(group = %self.name, key, "Shared an in-flight load");
        }

        match coalesced.result {
            Ok(result) => result,
            Err(fault) => {
                tracing::error!(
                    error = &fault as &dyn std::error::Error,
                    group = %self.name,
                    key,
                    "Load did not complete",
                );
                Err(fault.into())
            }
        }
    }

    /// Fetches from the owning peer, falling back to the local loader.
    async fn fetch(&self, key: &str) -> Result<ByteView, GroupError> {
        if let Some(peer) = self.peers.get().and_then(|peers| peers.pick_peer(key)) {
            match self.get_from_peer(peer.as_ref(), key).await {
                Ok(value) => {
                    incr(&self.stats.peer_loads);
                    return Ok(value);
                }
                Err(err) => {
                    incr(&self.stats.peer_errors);
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        group = %self.name,
                        key,
                        ?peer,
                        "Failed to get from peer",
                    );
                }
            }
        }

        let coalesced = self
            .local
            .run(key.to_owned(), || self.get_locally(key))
            .await;
        self.settle(coalesced, key)
    }

    async fn get_from_peer(&self, peer: &dyn PeerGetter, key: &str) -> Result<ByteView, PeerError> {
        let result = peer.get(&self.name, key).await;
        metric!(
            counter("groups.peer.fetch") += 1,
            "group" => self.name.as_str(),
            "status" => match &result {
                Ok(_) => "ok",
                Err(err) => err.as_tag(),
            },
        );
        result.map(ByteView::from)
    }

    async fn get_locally(&self, key: &str) -> Result<ByteView, GroupError> {
        let bytes = match self.loader.load(key).await {
            Ok(bytes) => bytes,
            Err(err) => {
                incr(&self.stats.local_load_errs);
                metric!(
                    counter("groups.local.load") += 1,
                    "group" => self.name.as_str(),
                    "status" => "error",
                );
                tracing::debug!(group = %self.name, key, "Loader failed: {err:#}");
                return Err(GroupError::Load(Arc::new(err)));
            }
        };

        incr(&self.stats.local_loads);
        metric!(
            counter("groups.local.load") += 1,
            "group" => self.name.as_str(),
            "status" => "ok",
        );

        let value = ByteView::copy_from_slice(&bytes);
        self.populate_cache(key, value.clone());
        Ok(value)
    }

    fn populate_cache(&self, key: &str, value: ByteView) {
        metric!(
            time_raw("groups.cache.size") = value.len() as u64,
            "group" => self.name.as_str(),
        );
        self.cache.add(key, value);
    }

    /// Returns the current counters and cache usage.
    pub fn stats(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            gets: load(&self.stats.gets),
            cache_hits: load(&self.stats.cache_hits),
            loads: load(&self.stats.loads),
            loads_deduped: load(&self.stats.loads_deduped),
            peer_loads: load(&self.stats.peer_loads),
            peer_errors: load(&self.stats.peer_errors),
            local_loads: load(&self.stats.local_loads),
            local_load_errs: load(&self.stats.local_load_errs),
            cache_bytes: self.cache.weighted_size(),
            cache_items: self.cache.entry_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use futures::future::join_all;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::test::{self, StaticPeer, StaticPicker};

    fn counting_loader(calls: Arc<AtomicUsize>) -> Arc<dyn Loader> {
        Arc::new(loader_fn(move |key: String| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(format!("value of {key}").into_bytes())
            }
        }))
    }

    /// A loader that blocks until the test adds a permit to `gate`.
    fn gated_loader(
        calls: Arc<AtomicUsize>,
        gate: Arc<Semaphore>,
        result: Result<&'static str, &'static str>,
    ) -> Arc<dyn Loader> {
        Arc::new(loader_fn(move |_key: String| {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let _permit = gate.acquire().await?;
                result
                    .map(|value| value.as_bytes().to_vec())
                    .map_err(|err| anyhow::anyhow!(err))
            }
        }))
    }

    #[tokio::test]
    async fn test_load_once_then_hit() {
        test::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let group = Group::new("users", 1 << 20, counting_loader(calls.clone()));

        let value = group.get("42").await.unwrap();
        assert_eq!(value.as_slice(), b"value of 42");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let value = group.get("42").await.unwrap();
        assert_eq!(value.as_slice(), b"value of 42");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = group.stats();
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.local_loads, 1);
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        test::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let group = Group::new("users", 1 << 20, counting_loader(calls.clone()));

        let result = group.get("").await;
        assert!(matches!(result, Err(GroupError::EmptyKey)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_misses_load_once() {
        test::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let group = Group::new(
            "users",
            1 << 20,
            gated_loader(calls.clone(), gate.clone(), Ok("Tom")),
        );

        let gets = (0..16).map(|_| group.get("42"));
        let (results, _) = tokio::join!(join_all(gets), async {
            tokio::task::yield_now().await;
            gate.add_permits(1);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap().as_slice(), b"Tom");
        }

        let stats = group.stats();
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.loads_deduped, 15);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_the_error() {
        test::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let group = Group::new(
            "users",
            1 << 20,
            gated_loader(calls.clone(), gate.clone(), Err("database is down")),
        );

        let gets = (0..4).map(|_| group.get("42"));
        let (results, _) = tokio::join!(join_all(gets), async {
            tokio::task::yield_now().await;
            gate.add_permits(1);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let errors: Vec<_> = results
            .into_iter()
            .map(|result| match result {
                Err(GroupError::Load(err)) => err,
                other => panic!("unexpected result: {other:?}"),
            })
            .collect();
        assert_eq!(errors[0].to_string(), "database is down");
        assert!(errors.iter().all(|err| Arc::ptr_eq(err, &errors[0])));
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        test::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = {
            let calls = calls.clone();
            loader_fn(move |_key: String| {
                let calls = Arc::clone(&calls);
                async move {
                    match calls.fetch_add(1, Ordering::SeqCst) {
                        0 => anyhow::bail!("not yet"),
                        _ => Ok(b"finally".to_vec()),
                    }
                }
            })
        };
        let cache = Arc::new(InMemoryCache::new("users", 1 << 20));
        let group = Group::with_cache("users", cache.clone(), Arc::new(loader));

        assert!(group.get("42").await.is_err());
        assert!(cache.get("42").is_none());

        assert_eq!(group.get("42").await.unwrap().as_slice(), b"finally");
        assert_eq!(cache.get("42").unwrap().as_slice(), b"finally");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(group.stats().local_load_errs, 1);
    }

    #[tokio::test]
    async fn test_peer_value_is_not_cached() {
        test::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(InMemoryCache::new("users", 1 << 20));
        let group = Group::with_cache("users", cache.clone(), counting_loader(calls.clone()));

        let peer = Arc::new(StaticPeer::new(Ok(Bytes::from_static(b"from peer"))));
        group.register_peers(Arc::new(StaticPicker::new(Some(peer.clone()))));

        assert_eq!(group.get("42").await.unwrap().as_slice(), b"from peer");
        assert!(cache.get("42").is_none());

        // Not cached locally, so the peer is asked again.
        assert_eq!(group.get("42").await.unwrap().as_slice(), b"from peer");
        assert_eq!(peer.calls(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(group.stats().peer_loads, 2);
    }

    #[tokio::test]
    async fn test_peer_failure_falls_back_to_loader() {
        test::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(InMemoryCache::new("users", 1 << 20));
        let group = Group::with_cache("users", cache.clone(), counting_loader(calls.clone()));

        let peer = Arc::new(StaticPeer::new(Err(PeerError::Transport(
            "connection refused".into(),
        ))));
        group.register_peers(Arc::new(StaticPicker::new(Some(peer.clone()))));

        assert_eq!(group.get("42").await.unwrap().as_slice(), b"value of 42");
        assert_eq!(peer.calls(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("42").unwrap().as_slice(), b"value of 42");

        // Served from the cache from now on, the peer is not consulted anymore.
        assert_eq!(group.get("42").await.unwrap().as_slice(), b"value of 42");
        assert_eq!(peer.calls(), 1);

        let stats = group.stats();
        assert_eq!(stats.peer_errors, 1);
        assert_eq!(stats.local_loads, 1);
    }

    #[tokio::test]
    async fn test_cancelled_request_hands_load_to_waiter() {
        test::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let group = Group::new(
            "users",
            1 << 20,
            gated_loader(calls.clone(), gate.clone(), Ok("Tom")),
        );

        let mut first = Box::pin(group.get("42"));
        assert!(futures::poll!(first.as_mut()).is_pending());
        let mut second = Box::pin(group.get("42"));
        assert!(futures::poll!(second.as_mut()).is_pending());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The first client goes away while its load is still running.
        drop(first);
        gate.add_permits(1);

        assert_eq!(second.await.unwrap().as_slice(), b"Tom");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert_eq!(group.get("42").await.unwrap().as_slice(), b"Tom");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_get_as_owner_never_asks_peers() {
        test::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let group = Group::new("users", 1 << 20, counting_loader(calls.clone()));
        let peer = Arc::new(StaticPeer::new(Ok(Bytes::from_static(b"from peer"))));
        group.register_peers(Arc::new(StaticPicker::new(Some(peer.clone()))));

        let value = group.get_as_owner("42").await.unwrap();
        assert_eq!(value.as_slice(), b"value of 42");
        assert_eq!(peer.calls(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The owner caches what it loaded, so regular gets are served locally as well.
        assert_eq!(group.get("42").await.unwrap().as_slice(), b"value of 42");
        assert_eq!(peer.calls(), 0);
        assert_eq!(group.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_get_and_get_as_owner_share_the_loader_call() {
        test::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let group = Group::new(
            "users",
            1 << 20,
            gated_loader(calls.clone(), gate.clone(), Ok("Tom")),
        );

        let (client, owner, _) = tokio::join!(group.get("42"), group.get_as_owner("42"), async {
            tokio::task::yield_now().await;
            gate.add_permits(1);
        });

        assert_eq!(client.unwrap().as_slice(), b"Tom");
        assert_eq!(owner.unwrap().as_slice(), b"Tom");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.stats().loads_deduped, 1);
    }

    #[tokio::test]
    async fn test_no_owning_peer_loads_locally() {
        test::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let group = Group::new("users", 1 << 20, counting_loader(calls.clone()));
        group.register_peers(Arc::new(StaticPicker::new(None)));

        assert_eq!(group.get("42").await.unwrap().as_slice(), b"value of 42");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.stats().peer_errors, 0);
    }

    #[tokio::test]
    async fn test_cached_value_is_detached_from_loader_buffer() {
        test::setup();
        let source = Arc::new(Mutex::new(b"original".to_vec()));
        let loader = {
            let source = source.clone();
            loader_fn(move |_key: String| {
                let bytes = source.lock().unwrap().clone();
                async move { Ok(bytes) }
            })
        };
        let group = Group::new("users", 1 << 20, Arc::new(loader));

        let first = group.get("42").await.unwrap();
        source.lock().unwrap().copy_from_slice(b"mutated!");

        let second = group.get("42").await.unwrap();
        assert_eq!(first.as_slice(), b"original");
        assert_eq!(second.as_slice(), b"original");
    }

    #[tokio::test]
    async fn test_panicking_loader_is_reported() {
        test::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = {
            let calls = calls.clone();
            loader_fn(move |_key: String| {
                let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        panic!("loader exploded");
                    }
                    Ok(b"recovered".to_vec())
                }
            })
        };
        let group = Group::new("users", 1 << 20, Arc::new(loader));

        let result = group.get("42").await;
        assert!(matches!(
            result,
            Err(GroupError::Fault(CallFault::Panicked(ref msg))) if msg == "loader exploded"
        ));

        assert_eq!(group.get("42").await.unwrap().as_slice(), b"recovered");
    }

    #[test]
    #[should_panic(expected = "register_peers called more than once")]
    fn test_register_peers_twice() {
        let group = Group::new(
            "users",
            1 << 20,
            counting_loader(Arc::new(AtomicUsize::new(0))),
        );
        group.register_peers(Arc::new(StaticPicker::new(None)));
        group.register_peers(Arc::new(StaticPicker::new(None)));
    }
}
