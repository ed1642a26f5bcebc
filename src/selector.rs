//! Selector: chooses which backend handles the next request.
//!
//! A single tagged enum rather than a trait hierarchy — the three routing
//! modes differ only in their selection function and all read the same
//! [`PerformanceRegistry`] and backend count.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use clap::ValueEnum;

use crate::registry::PerformanceRegistry;

/// Routing policy, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoutingMode {
    #[value(name = "round-robin")]
    RoundRobin,
    #[value(name = "adaptive_sma")]
    AdaptiveSma,
    #[value(name = "adaptive_ewma")]
    AdaptiveEwma,
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoutingMode::RoundRobin => "round-robin",
            RoutingMode::AdaptiveSma => "adaptive_sma",
            RoutingMode::AdaptiveEwma => "adaptive_ewma",
        };
        f.write_str(s)
    }
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(RoutingMode::RoundRobin),
            "adaptive_sma" => Ok(RoutingMode::AdaptiveSma),
            "adaptive_ewma" => Ok(RoutingMode::AdaptiveEwma),
            other => Err(format!("unknown routing mode: {other}")),
        }
    }
}

/// Picks the next backend index to route a request to.
///
/// Selection never fails: the backend list is guaranteed non-empty at
/// construction time (enforced by config loading, not here).
pub struct Selector {
    mode: RoutingMode,
    backend_count: usize,
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new(mode: RoutingMode, backend_count: usize) -> Self {
        assert!(backend_count > 0, "selector requires at least one backend");
        Self { mode, backend_count, cursor: AtomicUsize::new(0) }
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    /// Choose the next backend index.
    pub fn next(&self, registry: &PerformanceRegistry) -> usize {
        match self.mode {
            RoutingMode::RoundRobin => self.next_round_robin(),
            RoutingMode::AdaptiveSma => self.next_adaptive(registry, |i| registry.sma(i)),
            RoutingMode::AdaptiveEwma => self.next_adaptive(registry, |i| registry.ewma(i)),
        }
    }

    fn next_round_robin(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.backend_count
    }

    /// Shared probing + argmin logic for the two adaptive modes. `score`
    /// returns `f64::INFINITY` for an unmeasured backend in both modes, so
    /// probing is just "does this backend currently score as infinite".
    fn next_adaptive(&self, registry: &PerformanceRegistry, score: impl Fn(usize) -> f64) -> usize {
        for i in 0..self.backend_count {
            if !registry.has_samples(i) {
                return i;
            }
        }

        let mut best = 0;
        let mut best_score = score(0);
        for i in 1..self.backend_count {
            let s = score(i);
            if s < best_score {
                best = i;
                best_score = s;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_fairness_s1() {
        let selector = Selector::new(RoutingMode::RoundRobin, 3);
        let registry = PerformanceRegistry::new(3);
        let chosen: Vec<usize> = (0..7).map(|_| selector.next(&registry)).collect();
        assert_eq!(chosen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn adaptive_sma_probes_before_exploiting_s2() {
        let selector = Selector::new(RoutingMode::AdaptiveSma, 3);
        let registry = PerformanceRegistry::new(3);

        // Probing phase: every backend gets exactly one sample, declaration order.
        for expected in 0..3 {
            let chosen = selector.next(&registry);
            assert_eq!(chosen, expected);
            let latency = [10, 200, 250][chosen];
            registry.record(chosen, latency);
        }

        // Exploitation: backend 0 (sma=10) wins, repeatedly, since no new samples arrive.
        for _ in 0..6 {
            assert_eq!(selector.next(&registry), 0);
        }
    }

    #[test]
    fn adaptive_sma_window_rotation_s3() {
        let selector = Selector::new(RoutingMode::AdaptiveSma, 3);
        let registry = PerformanceRegistry::new(3);
        registry.record(0, 10);
        registry.record(1, 200);
        registry.record(2, 250);

        // Direct three more requests to backend 0, all at 400ms.
        for _ in 0..3 {
            registry.record(0, 400);
        }
        assert_eq!(registry.sma(0), 400.0);
        assert_eq!(selector.next(&registry), 1);
    }

    #[test]
    fn adaptive_ewma_probes_in_declaration_order() {
        let selector = Selector::new(RoutingMode::AdaptiveEwma, 3);
        let registry = PerformanceRegistry::new(3);
        for expected in 0..3 {
            let chosen = selector.next(&registry);
            assert_eq!(chosen, expected);
            registry.record(chosen, 100);
        }
    }

    #[test]
    fn adaptive_argmin_breaks_ties_by_declaration_order() {
        let selector = Selector::new(RoutingMode::AdaptiveEwma, 2);
        let registry = PerformanceRegistry::new(2);
        registry.record(0, 100);
        registry.record(1, 100);
        assert_eq!(selector.next(&registry), 0);
    }

    #[test]
    fn round_robin_mode_display_and_parse_roundtrip() {
        for mode in [RoutingMode::RoundRobin, RoutingMode::AdaptiveSma, RoutingMode::AdaptiveEwma] {
            let s = mode.to_string();
            assert_eq!(RoutingMode::from_str(&s).unwrap(), mode);
        }
    }
}
