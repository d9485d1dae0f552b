//! Helpers for testing the web server.
//!
//! Every node in a test gets its own data directory. Values are written as files into it, so tests
//! can tell from the content which node loaded a value.

use std::path::Path;
use std::time::Duration;

use peercache_service::config::{Config, GroupConfig};
use peercache_service::sources::SourceConfig;

use crate::endpoints;
use crate::service::Service;

pub use peercache_test::*;

/// A config serving a single `scores` group from `data_dir`.
pub fn node_config(data_dir: &Path, self_url: &str, peers: &[&str]) -> Config {
    Config {
        self_url: Some(self_url.to_owned()),
        peers: peers.iter().map(|peer| peer.to_string()).collect(),
        peer_timeout: Duration::from_secs(1),
        groups: vec![GroupConfig {
            name: "scores".into(),
            capacity: 1024 * 1024,
            source: SourceConfig::Filesystem {
                path: data_dir.to_owned(),
            },
        }],
        ..Config::default()
    }
}

/// Starts a node with `config` on the given socket.
pub fn serve(socket: Socket, config: &Config) -> Server {
    let service = Service::create(config).unwrap();
    socket.serve(endpoints::create_app(service))
}

/// Writes `value` for `key` into a node's data directory.
pub fn write_value(data_dir: &Path, key: &str, value: &str) {
    std::fs::write(data_dir.join(key), value).unwrap();
}
