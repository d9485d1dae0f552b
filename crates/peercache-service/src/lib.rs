//! The load-coordination engine of a peer-to-peer, read-through byte cache.
//!
//! A [`Group`] is a named cache namespace. Reads go through [`Group::get`], which serves from the
//! group's in-memory [`EvictionCache`] and on a miss loads the value exactly once per key, either
//! from the peer that owns the key or from the group's [`Loader`]. Concurrent misses for the same
//! key are collapsed by the [`Coalescer`].
//!
//! [`Group`]: group::Group
//! [`Group::get`]: group::Group::get
//! [`EvictionCache`]: cache::EvictionCache
//! [`Loader`]: group::Loader
//! [`Coalescer`]: coalesce::Coalescer

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod group;
pub mod logging;
pub mod peers;
pub mod registry;
pub mod sources;
pub mod value;
