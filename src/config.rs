//! Startup configuration: CLI arguments, backend list, and the
//! persistent/non-persistent connection-mode deployment knob.

use std::net::{SocketAddr, ToSocketAddrs};

use clap::{Parser, ValueEnum};

use crate::error::StartupError;
use crate::selector::RoutingMode;

/// Default backend set, matching the original deployment.
const DEFAULT_BACKENDS: &[&str] =
    &["http://localhost:8081", "http://localhost:8082", "http://localhost:8083"];

const DEFAULT_BIND: &str = "0.0.0.0:9090";
const DEFAULT_LOG_FILE: &str = "proxy_log.csv";

/// Deployment knob: whether outbound connections are pooled and reused, or
/// created and torn down per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConnectionMode {
    Persistent,
    NonPersistent,
}

#[derive(Debug, Parser)]
#[command(name = "adaptive-proxy", about = "Adaptive HTTP reverse proxy with pluggable routing")]
pub struct Cli {
    /// Routing policy used to pick a backend for each request.
    #[arg(value_enum, default_value_t = RoutingMode::RoundRobin)]
    pub mode: RoutingMode,

    /// Connection-management variant: pool and reuse upstream connections,
    /// or open/close a fresh one per request.
    #[arg(long, value_enum, default_value_t = ConnectionMode::Persistent)]
    pub connection_mode: ConnectionMode,

    /// Address to listen on.
    #[arg(long, default_value = DEFAULT_BIND)]
    pub bind: String,

    /// Path to the CSV request log.
    #[arg(long, default_value = DEFAULT_LOG_FILE)]
    pub log_file: String,
}

/// One resolved backend: the origin URL kept for identity/logging, and the
/// socket address pingora actually dials.
#[derive(Debug, Clone)]
pub struct Backend {
    pub url: String,
    pub addr: SocketAddr,
}

pub struct AppConfig {
    pub mode: RoutingMode,
    pub connection_mode: ConnectionMode,
    pub bind: String,
    pub log_file: String,
    pub backends: Vec<Backend>,
}

impl AppConfig {
    pub fn load(cli: Cli) -> Result<Self, StartupError> {
        let backend_urls: Vec<String> = std::env::var("BACKENDS")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.split(',').map(|p| p.trim().to_string()).collect())
            .unwrap_or_else(|| DEFAULT_BACKENDS.iter().map(|s| s.to_string()).collect());

        if backend_urls.is_empty() {
            return Err(StartupError::NoBackends);
        }

        let backends = backend_urls
            .into_iter()
            .map(|url| resolve_backend(url))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            mode: cli.mode,
            connection_mode: cli.connection_mode,
            bind: cli.bind,
            log_file: cli.log_file,
            backends,
        })
    }
}

fn resolve_backend(url: String) -> Result<Backend, StartupError> {
    let host_port = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");

    let addr = host_port
        .to_socket_addrs()
        .map_err(|source| StartupError::InvalidBackendUrl { url: url.clone(), source })?
        .next()
        .ok_or_else(|| StartupError::InvalidBackendUrl {
            url: url.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"),
        })?;

    Ok(Backend { url, addr })
}
