//! Helpers for testing the cache service and the web server.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the directory and all files in it are
//!    deleted while the test still reads from it.
//!
//!  - When using a [`Server`], make sure that it is held until all requests to it have been made.
//!    Dropping it stops serving, and all further connections to it will fail. To avoid this,
//!    assign it to a variable: `let _server = Server::with_router(router);`.

use std::net::SocketAddr;

use axum::Router;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the peercache crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("peercache=trace,peercache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A socket bound to `127.0.0.1` and a random port that does not accept connections yet.
///
/// Use this when the URL of a server has to be known before its app can be built, for example
/// when several nodes need to know each other. Call [`serve`](Self::serve) to start serving.
#[derive(Debug)]
pub struct Socket {
    listener: std::net::TcpListener,
    addr: SocketAddr,
}

impl Socket {
    pub fn bind() -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    /// Returns the base URL of this socket, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Serves the given router on this socket.
    ///
    /// This requires a `tokio` runtime.
    pub fn serve(self, router: Router) -> Server {
        let listener = tokio::net::TcpListener::from_std(self.listener).unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Server {
            handle,
            socket: self.addr,
        }
    }
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Serves the given router on `127.0.0.1` and a random port.
    pub fn with_router(router: Router) -> Self {
        Socket::bind().serve(router)
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns the base URL of this server, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port())
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url(), path).parse().unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
