use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// A hash function placing keys and virtual nodes on the ring.
pub type HashFn = fn(&[u8]) -> u32;

/// The default ring hash: the leading four bytes of the input's SHA-256 digest.
///
/// This is stable across platforms and processes, so every node of a cluster places keys the same
/// way.
fn sha256_prefix(data: &[u8]) -> u32 {
    let digest = Sha256::digest(data);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// A consistent hash ring mapping keys to peers.
///
/// Every peer is placed on the ring `replicas` times. A key is owned by the first virtual node
/// at or after the key's hash, wrapping around at the end of the ring.
#[derive(Debug, Clone)]
pub struct HashRing {
    hash: HashFn,
    replicas: usize,
    /// Sorted hashes of all virtual nodes.
    keys: Vec<u32>,
    nodes: HashMap<u32, String>,
}

impl HashRing {
    pub fn new(replicas: usize) -> Self {
        Self::with_hasher(replicas, sha256_prefix)
    }

    pub fn with_hasher(replicas: usize, hash: HashFn) -> Self {
        Self {
            hash,
            replicas: replicas.max(1),
            keys: Vec::new(),
            nodes: HashMap::new(),
        }
    }

    /// Adds peers to the ring.
    pub fn add<I, S>(&mut self, peers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for peer in peers {
            let peer = peer.into();
            for i in 0..self.replicas {
                let hash = (self.hash)(format!("{i}{peer}").as_bytes());
                self.keys.push(hash);
                self.nodes.insert(hash, peer.clone());
            }
        }
        self.keys.sort_unstable();
        self.keys.dedup();
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns the peer owning `key`, or `None` if the ring is empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let hash = (self.hash)(key.as_bytes());
        let idx = self.keys.partition_point(|k| *k < hash);
        let node = self.keys[idx % self.keys.len()];
        self.nodes.get(&node).map(String::as_str)
    }
}
