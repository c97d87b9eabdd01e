//! Shared utilities for integration tests.

use std::net::SocketAddr;

use axum::Router;
use request_lifecycle::{HttpServer, LifecycleConfig, Shutdown};
use tokio::net::TcpListener;

/// Config with a small quota so tests can exhaust it quickly.
#[allow(dead_code)]
pub fn test_config(max_requests: u64) -> LifecycleConfig {
    let mut config = LifecycleConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.rate_limit.enabled = true;
    config.rate_limit.max_requests = max_requests;
    config.rate_limit.window_secs = 60;
    config
}

/// Start a server on an ephemeral port. Keep the returned `Shutdown` alive
/// for as long as the server should run.
#[allow(dead_code)]
pub async fn spawn_server(config: LifecycleConfig, routes: Router) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let server = HttpServer::with_routes(config, routes);
    let rx = shutdown.subscribe();

    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });

    (addr, shutdown)
}
