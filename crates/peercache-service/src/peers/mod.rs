//! Routing of keys to the peer that owns them.
//!
//! A [`PeerPicker`] decides which node is responsible for a key, and hands out a [`PeerGetter`]
//! that can fetch values from that node. [`HttpPool`] implements both on top of a consistent
//! [`HashRing`] and plain HTTP.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;

mod http;
mod ring;

pub use http::{HttpGetter, HttpPool, PEER_BASE_PATH};
pub use ring::{HashFn, HashRing};

/// An error fetching a value from a remote peer.
///
/// To a [`Group`](crate::group::Group) all variants mean the same thing: the peer could not
/// provide the value and the group falls back to its local loader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    /// The peer answered, but does not have the value either.
    #[error("not found on peer")]
    NotFound,
    /// The peer answered with an unexpected status code.
    #[error("peer responded with status {0}")]
    Status(u16),
    /// The peer did not answer in time.
    #[error("peer fetch timed out after {0:?}")]
    Timeout(Duration),
    /// Connection, DNS, or protocol level problems.
    #[error("peer transport failed: {0}")]
    Transport(String),
}

impl PeerError {
    /// A short name of the variant, used to tag metrics.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Status(_) => "status",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
        }
    }
}

/// Fetches values from one specific remote peer.
pub trait PeerGetter: Send + Sync + fmt::Debug {
    /// Fetches the value of `key` in the group named `group` from this peer.
    fn get<'a>(&'a self, group: &'a str, key: &'a str) -> BoxFuture<'a, Result<Bytes, PeerError>>;
}

/// Picks the peer that owns a key.
pub trait PeerPicker: Send + Sync + fmt::Debug {
    /// Returns the owning peer of `key`.
    ///
    /// Returns `None` if the current node owns the key itself, or no peers are known.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_tags() {
        let tags: Vec<_> = [
            PeerError::NotFound,
            PeerError::Status(502),
            PeerError::Timeout(Duration::from_secs(1)),
            PeerError::Transport("connection refused".into()),
        ]
        .iter()
        .map(PeerError::as_tag)
        .collect();

        assert_eq!(tags, ["not_found", "status", "timeout", "transport"]);
    }
}
