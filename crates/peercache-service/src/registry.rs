//! A directory of [`Group`]s by name.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::cache::EvictionCache;
use crate::group::{Group, Loader};

/// Holds all groups of a process, keyed by name.
///
/// Lookups run concurrently. Creating a group takes the registry exclusively, and the group is
/// fully constructed before it becomes visible.
#[derive(Debug, Default)]
pub struct Registry {
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a group with an in-memory cache of `capacity` bytes and registers it as `name`.
    ///
    /// An existing group of the same name is replaced.
    pub fn create(&self, name: &str, capacity: u64, loader: Arc<dyn Loader>) -> Arc<Group> {
        self.insert(Group::new(name, capacity, loader))
    }

    /// Like [`create`](Self::create), but with a caller-provided cache.
    pub fn create_with_cache(
        &self,
        name: &str,
        cache: Arc<dyn EvictionCache>,
        loader: Arc<dyn Loader>,
    ) -> Arc<Group> {
        self.insert(Group::with_cache(name, cache, loader))
    }

    fn insert(&self, group: Group) -> Arc<Group> {
        let group = Arc::new(group);
        let previous = self
            .groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group.name().to_owned(), Arc::clone(&group));

        if previous.is_some() {
            tracing::warn!(group = group.name(), "Replaced an existing group");
        } else {
            tracing::debug!(group = group.name(), "Created group");
        }
        group
    }

    /// Looks up the group called `name`.
    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// The names of all groups, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::loader_fn;
    use crate::test;

    fn constant(value: &'static str) -> Arc<dyn Loader> {
        Arc::new(loader_fn(move |_key: String| async move {
            Ok(value.as_bytes().to_vec())
        }))
    }

    #[tokio::test]
    async fn test_create_and_get() {
        test::setup();
        let registry = Registry::new();
        assert!(registry.get("scores").is_none());

        let created = registry.create("scores", 1024, constant("630"));
        let found = registry.get("scores").unwrap();
        assert!(Arc::ptr_eq(&created, &found));
        assert_eq!(found.get("Tom").await.unwrap().as_slice(), b"630");
    }

    #[tokio::test]
    async fn test_last_creation_wins() {
        test::setup();
        let registry = Registry::new();
        registry.create("g1", 1024, constant("first"));
        registry.create("g1", 1024, constant("second"));

        let group = registry.get("g1").unwrap();
        assert_eq!(group.get("key").await.unwrap().as_slice(), b"second");
        assert_eq!(registry.names(), vec!["g1".to_owned()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_and_lookup() {
        test::setup();
        let registry = Arc::new(Registry::new());

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let name = format!("group{}", i % 4);
                    registry.create(&name, 1024, constant("value"));
                    let group = registry.get(&name).unwrap();
                    assert_eq!(group.name(), name);
                    group.get("key").await.unwrap()
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().as_slice(), b"value");
        }
        assert_eq!(registry.names().len(), 4);
    }
}
