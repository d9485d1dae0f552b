//! Peercache.
//!
//! Peercache is a distributed read-through cache. Every node serves a set of named groups, and the
//! key space of each group is split among all nodes with a consistent hash ring. A node that does
//! not own a key asks the owning peer for it, and only falls back to loading the value from the
//! group's source when that peer cannot answer.

#![warn(
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;
mod service;

#[cfg(test)]
mod test;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
