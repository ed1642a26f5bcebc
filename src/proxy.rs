//! Proxy Handler: the pingora `ProxyHttp` implementation that ties the
//! Selector, Performance Registry and Request Log Sink together.
//!
//! Request lifecycle (pingora hook order, per the framework's own
//! guarantees): `new_ctx` -> `upstream_peer` -> `upstream_request_filter` ->
//! [upstream I/O] -> `response_filter` (success) or `fail_to_connect` /
//! `fail_to_proxy` (failure) -> `logging` (always last). The registry update
//! and log append both happen in `logging`, since it is the one hook pingora
//! calls exactly once no matter how the request ended.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use pingora::prelude::*;
use pingora::proxy::{FailToProxy, ProxyHttp, Session};
use rand::Rng;

use crate::config::{Backend, ConnectionMode};
use crate::log_sink::{LogRecord, RequestLogSink};
use crate::registry::PerformanceRegistry;
use crate::selector::{RoutingMode, Selector};

/// Upstream deadline applied to connect, read and write phases alike.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide routing state, shared read-only (beyond its own interior
/// mutability) across every request handler.
pub struct RoutingState {
    pub backends: Vec<Backend>,
    pub registry: PerformanceRegistry,
    pub selector: Selector,
    pub log_sink: RequestLogSink,
    pub connection_mode: ConnectionMode,
}

impl RoutingState {
    pub fn new(
        backends: Vec<Backend>,
        mode: RoutingMode,
        connection_mode: ConnectionMode,
        log_sink: RequestLogSink,
    ) -> Self {
        let registry = PerformanceRegistry::new(backends.len());
        let selector = Selector::new(mode, backends.len());
        Self { backends, registry, selector, log_sink, connection_mode }
    }
}

pub struct AdaptiveProxy {
    state: std::sync::Arc<RoutingState>,
}

impl AdaptiveProxy {
    pub fn new(state: std::sync::Arc<RoutingState>) -> Self {
        Self { state }
    }
}

/// Per-request scratch state. `latency_ms` starts at the `-1` sentinel
/// (timing never started) and is only ever overwritten once, by whichever
/// hook learns the outcome first.
pub struct RequestCtx {
    request_id: u32,
    backend_idx: Option<usize>,
    start: Instant,
    latency_ms: i64,
    status: Option<u16>,
}

impl RequestCtx {
    fn new() -> Self {
        Self {
            request_id: rand::thread_rng().gen(),
            backend_idx: None,
            start: Instant::now(),
            latency_ms: -1,
            status: None,
        }
    }

    fn elapsed_ms(&self) -> i64 {
        let micros = self.start.elapsed().as_micros();
        ((micros + 500) / 1000) as i64
    }
}

#[async_trait]
impl ProxyHttp for AdaptiveProxy {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx::new()
    }

    /// Ask the Selector for a backend and build the peer connection,
    /// applying the 10-second deadline and the connection-mode knob.
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let idx = self.state.selector.next(&self.state.registry);
        let backend = &self.state.backends[idx];

        ctx.backend_idx = Some(idx);
        ctx.start = Instant::now();

        log::debug!("[{}] routing to {} ({:?})", ctx.request_id, backend.url, self.state.selector.mode());

        let mut peer = HttpPeer::new(backend.addr, false, String::new());
        if let Some(opts) = peer.get_mut_peer_options() {
            opts.connection_timeout = Some(UPSTREAM_TIMEOUT);
            opts.total_connection_timeout = Some(UPSTREAM_TIMEOUT);
            opts.read_timeout = Some(UPSTREAM_TIMEOUT);
            opts.write_timeout = Some(UPSTREAM_TIMEOUT);
            if self.state.connection_mode == ConnectionMode::NonPersistent {
                opts.idle_timeout = Some(Duration::from_secs(0));
            }
        }

        Ok(Box::new(peer))
    }

    /// Non-persistent deployments ask the backend to close the connection
    /// after this response instead of returning it to pingora's pool.
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        _ctx: &mut Self::CTX,
    ) -> Result<()> {
        if self.state.connection_mode == ConnectionMode::NonPersistent {
            upstream_request.insert_header("Connection", "close")?;
        }
        Ok(())
    }

    /// Success path: capture the elapsed time and status for the log/
    /// registry update that happens in `logging`.
    async fn response_filter(
        &self,
        session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        ctx.latency_ms = ctx.elapsed_ms();
        ctx.status = Some(upstream_response.status.as_u16());

        if self.state.connection_mode == ConnectionMode::NonPersistent {
            upstream_response.insert_header("Connection", "close")?;
            // Downstream side of the non-persistent knob: tell pingora not to
            // keep this client connection alive for a next request, matching
            // the original's server-side `keepalive_timeout=0`.
            session.set_keepalive(None);
        }

        Ok(())
    }

    /// Connection to the backend never even succeeded. No retry: the spec
    /// forbids cross-backend retry within one client request.
    fn fail_to_connect(
        &self,
        _session: &mut Session,
        peer: &HttpPeer,
        ctx: &mut Self::CTX,
        mut e: Box<Error>,
    ) -> Box<Error> {
        log::warn!("[{}] failed to connect to {}: {}", ctx.request_id, peer.address(), e);
        e.set_retry(false);
        e
    }

    /// Terminal failure for this request (connect failure or a mid-stream
    /// error/timeout). Writes the synthetic response body the spec calls
    /// for directly, since pingora's generic error responses don't carry
    /// this crate's exact text.
    async fn fail_to_proxy(&self, session: &mut Session, e: &Error, ctx: &mut Self::CTX) -> FailToProxy
    where
        Self::CTX: Send + Sync,
    {
        ctx.latency_ms = ctx.elapsed_ms();

        let is_timeout = matches!(
            e.etype(),
            ErrorType::ConnectTimedout | ErrorType::ReadTimedout | ErrorType::WriteTimedout
        );
        let (status, body): (u16, &'static str) =
            if is_timeout { (504, "Backend timeout") } else { (502, "Backend error") };
        ctx.status = Some(status);

        log::warn!("[{}] proxy failure ({status}) after {}ms: {}", ctx.request_id, ctx.latency_ms, e);

        if self.state.connection_mode == ConnectionMode::NonPersistent {
            session.set_keepalive(None);
        }

        if let Ok(mut header) = ResponseHeader::build(status, Some(2)) {
            let _ = header.insert_header("Content-Length", body.len().to_string());
            let _ = header.insert_header("Content-Type", "text/plain");
            if self.state.connection_mode == ConnectionMode::NonPersistent {
                let _ = header.insert_header("Connection", "close");
            }
            let _ = session.write_response_header(Box::new(header), false).await;
            let _ = session.write_response_body(Some(Bytes::from_static(body.as_bytes())), true).await;
        }

        FailToProxy { error_code: status, can_reuse_downstream: false }
    }

    /// Always called last, success or failure. This is where the registry
    /// update and the audit-log append happen, unconditionally.
    async fn logging(&self, _session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX)
    where
        Self::CTX: Send + Sync,
    {
        let Some(idx) = ctx.backend_idx else {
            return;
        };
        let backend = &self.state.backends[idx];

        self.state.registry.record(idx, ctx.latency_ms);

        let record = LogRecord::now(
            backend.url.clone(),
            ctx.latency_ms,
            ctx.status,
            self.state.selector.mode(),
        );
        if let Err(e) = self.state.log_sink.append(&record) {
            log::warn!("[{}] request log write failed: {e}", ctx.request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use crate::log_sink::RequestLogSink;
    use crate::selector::RoutingMode;

    fn backends(n: usize) -> Vec<Backend> {
        (0..n)
            .map(|i| Backend {
                url: format!("http://localhost:{}", 8081 + i),
                addr: SocketAddr::from(([127, 0, 0, 1], 8081 + i as u16)),
            })
            .collect()
    }

    /// Drives the same select -> record -> log sequence the `upstream_peer`
    /// / `logging` hooks perform, without a live pingora server, to check
    /// the whole routing loop is wired together correctly end to end.
    fn drive_request(state: &RoutingState, latency_ms: i64, status: Option<u16>) -> usize {
        let idx = state.selector.next(&state.registry);
        let backend = &state.backends[idx];
        state.registry.record(idx, latency_ms);
        let record = LogRecord::now(backend.url.clone(), latency_ms, status, state.selector.mode());
        state.log_sink.append(&record).unwrap();
        idx
    }

    #[test]
    fn round_robin_end_to_end_sequence_s1() {
        let dir = tempfile::tempdir().unwrap();
        let log_sink = RequestLogSink::open(dir.path().join("proxy_log.csv")).unwrap();
        let state = RoutingState::new(backends(3), RoutingMode::RoundRobin, ConnectionMode::Persistent, log_sink);

        let chosen: Vec<usize> = (0..7).map(|_| drive_request(&state, 20, Some(200))).collect();
        assert_eq!(chosen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn timeout_latency_feeds_registry_and_log_s5_s6() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("proxy_log.csv");
        let log_sink = RequestLogSink::open(&log_path).unwrap();
        let state = RoutingState::new(backends(2), RoutingMode::AdaptiveEwma, ConnectionMode::Persistent, log_sink);

        // Probe both backends, then simulate backend 0 timing out.
        drive_request(&state, 10, Some(200));
        drive_request(&state, 10, Some(200));
        drive_request(&state, 10_000, Some(504));

        assert!(state.registry.ewma(0) > state.registry.ewma(1));
        // With backend 0's EWMA now far worse, the next pick avoids it.
        let next = state.selector.next(&state.registry);
        assert_eq!(next, 1);

        let contents = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "timestamp,backend_url,latency_ms,status_code,routing_mode");
        let last: Vec<&str> = lines.last().unwrap().split(',').collect();
        assert_eq!(last.len(), 5);
        assert_eq!(last[2], "10000");
        assert_eq!(last[3], "504");
    }

    #[test]
    fn elapsed_ms_rounds_to_nearest_millisecond() {
        let ctx = RequestCtx { request_id: 0, backend_idx: None, start: Instant::now(), latency_ms: -1, status: None };
        std::thread::sleep(Duration::from_millis(5));
        assert!(ctx.elapsed_ms() >= 5);
    }

    #[test]
    fn routing_state_registry_sized_to_backend_count() {
        let dir = tempfile::tempdir().unwrap();
        let log_sink = RequestLogSink::open(dir.path().join("proxy_log.csv")).unwrap();
        let state = RoutingState::new(backends(3), RoutingMode::RoundRobin, ConnectionMode::Persistent, log_sink);
        for i in 0..3 {
            assert!(!state.registry.has_samples(i));
        }
    }
}
