//! Readiness and soak monitoring.
//!
//! [`await_ready`] polls one new node until it is Ready, Unhealthy, or the
//! health timeout elapses. [`watch_soak`] keeps probing a Ready batch for
//! the soak window and reports the first node that fails.

use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use nodeshift_core::{Clock, OrchestratorSettings};
use nodeshift_state::{Node, NodeHealth, NodeId};

use crate::checker::{HealthTracker, NodeProbe};

/// Thresholds and timings used while waiting on nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub interval: Duration,
    pub unhealthy_threshold: u32,
    pub ready_threshold: u32,
}

impl From<&OrchestratorSettings> for ReadinessPolicy {
    fn from(s: &OrchestratorSettings) -> Self {
        Self {
            timeout: s.health_timeout,
            interval: s.poll_interval,
            unhealthy_threshold: s.unhealthy_threshold,
            ready_threshold: s.ready_threshold,
        }
    }
}

/// Verdict for a node waiting to become Ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Unhealthy,
    TimedOut,
}

/// Outcome of a soak window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoakOutcome {
    /// The full window passed with every node healthy.
    Elapsed,
    /// A node crossed the unhealthy threshold.
    NodeFailed(NodeId),
    /// An abort was requested during the window.
    Aborted,
}

/// Poll a node until it becomes Ready or Unhealthy, or `policy.timeout` passes.
pub async fn await_ready<P: NodeProbe + ?Sized>(
    probe: &P,
    clock: &dyn Clock,
    node: &Node,
    policy: &ReadinessPolicy,
) -> Readiness {
    let mut deadline = clock.sleep(policy.timeout);
    let mut tracker = HealthTracker::new(policy.unhealthy_threshold, policy.ready_threshold);

    loop {
        let result = tokio::select! {
            r = probe.probe(node) => r,
            _ = &mut deadline => break,
        };
        match tracker.record(result) {
            NodeHealth::Ready => {
                debug!(node = %node.id, "node ready");
                return Readiness::Ready;
            }
            NodeHealth::Unhealthy => return Readiness::Unhealthy,
            _ => {}
        }
        tokio::select! {
            _ = clock.sleep(policy.interval) => {}
            _ = &mut deadline => break,
        }
    }

    warn!(node = %node.id, timeout = ?policy.timeout, "node did not become ready in time");
    Readiness::TimedOut
}

/// Resolve once `true` has been published on the abort channel.
///
/// Never resolves if the sender is dropped without requesting an abort.
pub async fn abort_requested(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow_and_update() {
            return;
        }
        if abort.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Observe Ready nodes for `duration`, probing every `policy.interval`.
pub async fn watch_soak<P: NodeProbe + ?Sized>(
    probe: &P,
    clock: &dyn Clock,
    nodes: &[Node],
    duration: Duration,
    policy: &ReadinessPolicy,
    abort: &mut watch::Receiver<bool>,
) -> SoakOutcome {
    let mut trackers: Vec<HealthTracker> = nodes
        .iter()
        .map(|_| HealthTracker::ready(policy.unhealthy_threshold))
        .collect();
    let mut window = clock.sleep(duration);
    info!(nodes = nodes.len(), ?duration, "soak started");

    loop {
        tokio::select! {
            biased;
            _ = abort_requested(abort) => {
                info!("soak interrupted by abort");
                return SoakOutcome::Aborted;
            }
            _ = &mut window => {
                info!("soak window elapsed");
                return SoakOutcome::Elapsed;
            }
            _ = clock.sleep(policy.interval) => {
                let results = join_all(nodes.iter().map(|n| probe.probe(n))).await;
                for ((node, tracker), result) in nodes.iter().zip(&mut trackers).zip(results) {
                    if tracker.record(result) == NodeHealth::Unhealthy {
                        warn!(node = %node.id, "node failed during soak");
                        return SoakOutcome::NodeFailed(node.id.clone());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use nodeshift_core::TokioClock;

    use super::*;
    use crate::checker::{ProbeFuture, ProbeResult};

    /// Replays a scripted sequence of results per node, then repeats the last.
    struct ScriptedProbe {
        scripts: Mutex<HashMap<String, Vec<ProbeResult>>>,
    }

    impl ScriptedProbe {
        fn new(scripts: Vec<(&str, Vec<ProbeResult>)>) -> Self {
            Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|(id, s)| (id.to_string(), s))
                        .collect(),
                ),
            }
        }
    }

    impl NodeProbe for ScriptedProbe {
        fn probe<'a>(&'a self, node: &'a Node) -> ProbeFuture<'a> {
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts.get_mut(&node.id).expect("unscripted node");
            let result = if script.len() > 1 {
                script.remove(0)
            } else {
                script[0]
            };
            Box::pin(async move { result })
        }
    }

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            pool_id: "p".to_string(),
            version: "v2".to_string(),
            health: NodeHealth::Pending,
            color: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn policy() -> ReadinessPolicy {
        ReadinessPolicy {
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(5),
            unhealthy_threshold: 2,
            ready_threshold: 1,
        }
    }

    use ProbeResult::{NotReady, Ready, Unhealthy};

    #[tokio::test(start_paused = true)]
    async fn ready_after_boot() {
        let probe = ScriptedProbe::new(vec![("n1", vec![NotReady, NotReady, Ready])]);
        let verdict = await_ready(&probe, &TokioClock, &node("n1"), &policy()).await;
        assert_eq!(verdict, Readiness::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_ready() {
        let probe = ScriptedProbe::new(vec![("n1", vec![NotReady])]);
        let start = tokio::time::Instant::now();
        let verdict = await_ready(&probe, &TokioClock, &node("n1"), &policy()).await;
        assert_eq!(verdict, Readiness::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_before_timeout() {
        let probe = ScriptedProbe::new(vec![("n1", vec![Unhealthy])]);
        let verdict = await_ready(&probe, &TokioClock, &node("n1"), &policy()).await;
        assert_eq!(verdict, Readiness::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn soak_elapses_when_healthy() {
        let probe = ScriptedProbe::new(vec![("n1", vec![Ready]), ("n2", vec![Ready])]);
        let (_tx, mut rx) = watch::channel(false);
        let nodes = vec![node("n1"), node("n2")];
        let outcome = watch_soak(
            &probe,
            &TokioClock,
            &nodes,
            Duration::from_secs(300),
            &policy(),
            &mut rx,
        )
        .await;
        assert_eq!(outcome, SoakOutcome::Elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn soak_reports_failing_node() {
        let probe = ScriptedProbe::new(vec![
            ("n1", vec![Ready]),
            ("n2", vec![Ready, Ready, Unhealthy, Unhealthy]),
        ]);
        let (_tx, mut rx) = watch::channel(false);
        let nodes = vec![node("n1"), node("n2")];
        let outcome = watch_soak(
            &probe,
            &TokioClock,
            &nodes,
            Duration::from_secs(300),
            &policy(),
            &mut rx,
        )
        .await;
        assert_eq!(outcome, SoakOutcome::NodeFailed("n2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn soak_stops_on_abort() {
        let probe = ScriptedProbe::new(vec![("n1", vec![Ready])]);
        let (tx, mut rx) = watch::channel(false);
        let nodes = vec![node("n1")];

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            tx.send(true).unwrap();
        });

        let outcome = watch_soak(
            &probe,
            &TokioClock,
            &nodes,
            Duration::from_secs(3600),
            &policy(),
            &mut rx,
        )
        .await;
        assert_eq!(outcome, SoakOutcome::Aborted);
    }
}
