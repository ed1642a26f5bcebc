//! Process-fatal startup errors. Request-handling errors never reach here —
//! those are turned into 502/504 responses by the proxy handler instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("backend list is empty; at least one backend is required")]
    NoBackends,

    #[error("could not parse backend URL `{url}`: {source}")]
    InvalidBackendUrl { url: String, #[source] source: std::io::Error },

    #[error("could not open request log file `{path}`: {source}")]
    LogFile { path: String, #[source] source: std::io::Error },

    #[error("failed to bind/bootstrap the proxy server: {0}")]
    Server(String),
}
