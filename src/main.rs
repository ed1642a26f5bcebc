//! Adaptive HTTP reverse proxy: CLI entry point and server bootstrap.
//!
//! Forwards every inbound request to one of a fixed set of backends,
//! chosen by a pluggable routing policy, and records per-backend latency so
//! the adaptive policies can route around slow backends. See `proxy.rs` for
//! the request lifecycle and `registry.rs`/`selector.rs` for the routing
//! core itself.

mod config;
mod error;
mod log_sink;
mod proxy;
mod registry;
mod selector;

use std::sync::Arc;

use clap::Parser;
use pingora::prelude::*;
use pingora::proxy::http_proxy_service;

use config::{AppConfig, Cli};
use log_sink::RequestLogSink;
use proxy::{AdaptiveProxy, RoutingState};

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli).unwrap_or_else(|e| {
        log::error!("startup failed: {e}");
        std::process::exit(1);
    });

    let log_sink = RequestLogSink::open(&config.log_file)
        .map_err(|source| error::StartupError::LogFile { path: config.log_file.clone(), source })
        .unwrap_or_else(|e| {
            log::error!("startup failed: {e}");
            std::process::exit(1);
        });

    log::info!("routing mode: {}", config.mode);
    log::info!("connection mode: {:?}", config.connection_mode);
    log::info!("backends: {}", config.backends.iter().map(|b| b.url.as_str()).collect::<Vec<_>>().join(", "));
    log::info!("request log: {}", log_sink.path().display());

    let state = Arc::new(RoutingState::new(config.backends, config.mode, config.connection_mode, log_sink));

    let mut server = Server::new(None).unwrap_or_else(|e| {
        log::error!("startup failed: {}", error::StartupError::Server(e.to_string()));
        std::process::exit(1);
    });
    server.bootstrap();

    let proxy = AdaptiveProxy::new(state);
    let mut proxy_service = http_proxy_service(&server.configuration, proxy);
    proxy_service.add_tcp(&config.bind);

    log::info!("listening on http://{}", config.bind);

    server.add_service(proxy_service);
    server.run_forever();
}
