//! Node probe logic.
//!
//! Turns a stream of probe results for one node into a readiness verdict
//! using consecutive-result thresholds.

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, warn};

use nodeshift_state::{Node, NodeHealth};

/// Result of a single node probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The node reports Ready.
    Ready,
    /// The node is still booting or joining the cluster.
    NotReady,
    /// The node reports a failure (or the probe itself failed).
    Unhealthy,
}

/// Boxed future returned by [`NodeProbe::probe`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeResult> + Send + 'a>>;

/// Health-checks a node. Injected so tests can script node behavior.
pub trait NodeProbe: Send + Sync {
    fn probe<'a>(&'a self, node: &'a Node) -> ProbeFuture<'a>;
}

/// Tracks consecutive probe results for a single node.
#[derive(Debug)]
pub struct HealthTracker {
    /// Current verdict: Pending, Ready or Unhealthy.
    status: NodeHealth,
    consecutive_failures: u32,
    consecutive_ready: u32,
    /// Failures before marking unhealthy.
    unhealthy_threshold: u32,
    /// Ready probes needed before the node counts as Ready.
    ready_threshold: u32,
}

impl HealthTracker {
    /// Tracker for a freshly created node.
    pub fn new(unhealthy_threshold: u32, ready_threshold: u32) -> Self {
        Self {
            status: NodeHealth::Pending,
            consecutive_failures: 0,
            consecutive_ready: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            ready_threshold: ready_threshold.max(1),
        }
    }

    /// Tracker for a node already known to be Ready (soak observation).
    pub fn ready(unhealthy_threshold: u32) -> Self {
        Self {
            status: NodeHealth::Ready,
            ..Self::new(unhealthy_threshold, 1)
        }
    }

    /// Record a probe result and return the new status.
    pub fn record(&mut self, result: ProbeResult) -> NodeHealth {
        match result {
            ProbeResult::Ready => {
                self.consecutive_failures = 0;
                self.consecutive_ready += 1;
                if self.status != NodeHealth::Unhealthy
                    && self.consecutive_ready >= self.ready_threshold
                {
                    if self.status != NodeHealth::Ready {
                        debug!(probes = self.consecutive_ready, "node became ready");
                    }
                    self.status = NodeHealth::Ready;
                }
            }
            // Still booting: neither progress nor failure, unless the node
            // had already been Ready, in which case it regressed.
            ProbeResult::NotReady if self.status == NodeHealth::Pending => {
                self.consecutive_ready = 0;
            }
            ProbeResult::NotReady | ProbeResult::Unhealthy => {
                self.consecutive_ready = 0;
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.unhealthy_threshold
                    && self.status != NodeHealth::Unhealthy
                {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        "node marked unhealthy"
                    );
                    self.status = NodeHealth::Unhealthy;
                }
            }
        }
        self.status
    }

    pub fn status(&self) -> NodeHealth {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_starts_pending() {
        let tracker = HealthTracker::new(3, 1);
        assert_eq!(tracker.status(), NodeHealth::Pending);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn ready_on_first_success() {
        let mut tracker = HealthTracker::new(3, 1);
        assert_eq!(tracker.record(ProbeResult::Ready), NodeHealth::Ready);
    }

    #[test]
    fn not_ready_while_booting_is_not_a_failure() {
        let mut tracker = HealthTracker::new(2, 1);
        for _ in 0..10 {
            tracker.record(ProbeResult::NotReady);
        }
        assert_eq!(tracker.status(), NodeHealth::Pending);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn ready_threshold_requires_consecutive_successes() {
        let mut tracker = HealthTracker::new(3, 2);
        tracker.record(ProbeResult::Ready);
        assert_eq!(tracker.status(), NodeHealth::Pending);
        tracker.record(ProbeResult::NotReady);
        tracker.record(ProbeResult::Ready);
        assert_eq!(tracker.status(), NodeHealth::Pending);
        tracker.record(ProbeResult::Ready);
        assert_eq!(tracker.status(), NodeHealth::Ready);
    }

    #[test]
    fn unhealthy_at_threshold() {
        let mut tracker = HealthTracker::new(3, 1);
        tracker.record(ProbeResult::Unhealthy);
        tracker.record(ProbeResult::Unhealthy);
        assert_eq!(tracker.status(), NodeHealth::Pending);
        assert_eq!(tracker.record(ProbeResult::Unhealthy), NodeHealth::Unhealthy);
    }

    #[test]
    fn unhealthy_is_sticky() {
        let mut tracker = HealthTracker::new(1, 1);
        tracker.record(ProbeResult::Unhealthy);
        assert_eq!(tracker.record(ProbeResult::Ready), NodeHealth::Unhealthy);
    }

    #[test]
    fn ready_node_regressing_counts_failures() {
        let mut tracker = HealthTracker::ready(2);
        tracker.record(ProbeResult::NotReady);
        assert_eq!(tracker.status(), NodeHealth::Ready);
        tracker.record(ProbeResult::Ready);
        tracker.record(ProbeResult::NotReady);
        assert_eq!(tracker.status(), NodeHealth::Ready);
        assert_eq!(tracker.record(ProbeResult::Unhealthy), NodeHealth::Unhealthy);
    }
}
