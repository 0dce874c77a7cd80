//! Keel executor: walks a [`DependencyGraph`] layer by layer.
//!
//! Converge runs layers in ascending order, `ensure` then `ready_check` for
//! every operand of a layer. Teardown runs layers in descending order calling
//! `delete`, with no readiness gating. Operands of one layer run concurrently
//! or one at a time in declaration order, per [`ExecutionStrategy`]. A layer
//! always finishes (success or failure) before the next one is considered; an
//! error or a not-ready operand stops progression. Per-operand outcomes and
//! requeue strategies fold into one requeue decision for the whole invocation.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use keel_core::prelude::*;
use keel_graph::{DependencyGraph, Node};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// How the operands of one layer are driven.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    /// One at a time, in declaration order.
    Serial,
    /// All at once.
    #[default]
    Parallel,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStrategy::Serial => f.write_str("serial"),
            ExecutionStrategy::Parallel => f.write_str("parallel"),
        }
    }
}

impl FromStr for ExecutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(ExecutionStrategy::Serial),
            "parallel" => Ok(ExecutionStrategy::Parallel),
            other => Err(format!("unknown execution strategy {:?}; expected serial or parallel", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Interval used when an operand's requeue strategy asks for another cycle.
    pub requeue_after: Duration,
    /// Interval used while a dependency is converged but not yet ready.
    pub not_ready_requeue_after: Duration,
    pub strategy: ExecutionStrategy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            requeue_after: Duration::from_secs(30),
            not_ready_requeue_after: Duration::from_secs(5),
            strategy: ExecutionStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Requeue {
    No,
    After(Duration),
}

impl Requeue {
    /// Combine two decisions; the sooner requeue wins.
    pub fn merge(self, other: Requeue) -> Requeue {
        match (self, other) {
            (Requeue::No, r) | (r, Requeue::No) => r,
            (Requeue::After(a), Requeue::After(b)) => Requeue::After(a.min(b)),
        }
    }
}

/// Terminal state of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunState {
    /// Every layer processed without errors; every operand ready.
    Completed,
    /// A converged operand reported not ready; later layers were held.
    Blocked { operand: String },
    /// One or more operands of `layer` failed; later layers were not started.
    Failed { layer: usize },
    Cancelled,
}

#[derive(Debug)]
pub struct OperandOutcome {
    pub name: String,
    pub layer: usize,
    pub strategy: RequeueStrategy,
    pub error: Option<OperandError>,
    /// Readiness as reported after a successful ensure; `None` for teardown
    /// and for operands whose ensure failed.
    pub ready: Option<bool>,
    pub event: Option<Event>,
}

impl OperandOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
pub struct RunResult {
    pub direction: Direction,
    pub state: RunState,
    /// In execution order (layer by layer, declaration order within a layer).
    pub outcomes: Vec<OperandOutcome>,
    pub events: Vec<Event>,
    pub requeue: Requeue,
}

impl RunResult {
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn outcome(&self, name: &str) -> Option<&OperandOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    pub fn failures(&self) -> impl Iterator<Item = &OperandOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }
}

/// Stateless apart from its configuration; one instance serves every invocation.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    cfg: ExecutorConfig,
}

impl Executor {
    pub fn new(cfg: ExecutorConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.cfg
    }

    pub async fn converge<R: Sync + ?Sized>(
        &self,
        graph: &DependencyGraph<R>,
        resource: &R,
        owner: &OwnerReference,
        cancel: &CancellationToken,
    ) -> RunResult {
        self.run(graph, resource, owner, Direction::Converge, cancel).await
    }

    pub async fn teardown<R: Sync + ?Sized>(
        &self,
        graph: &DependencyGraph<R>,
        resource: &R,
        owner: &OwnerReference,
        cancel: &CancellationToken,
    ) -> RunResult {
        self.run(graph, resource, owner, Direction::Teardown, cancel).await
    }

    pub async fn run<R: Sync + ?Sized>(
        &self,
        graph: &DependencyGraph<R>,
        resource: &R,
        owner: &OwnerReference,
        direction: Direction,
        cancel: &CancellationToken,
    ) -> RunResult {
        let t0 = Instant::now();
        counter!("executor_runs_total", 1u64, "direction" => direction.to_string());
        let order: Vec<usize> = match direction {
            Direction::Converge => (0..graph.layer_count()).collect(),
            Direction::Teardown => (0..graph.layer_count()).rev().collect(),
        };

        let mut outcomes: Vec<OperandOutcome> = Vec::with_capacity(graph.len());
        let mut state = RunState::Completed;
        for layer in order {
            if cancel.is_cancelled() {
                state = RunState::Cancelled;
                break;
            }
            let nodes = graph.layer(layer).unwrap_or_default();
            debug!(%direction, layer, operands = ?nodes.iter().map(|n| n.name()).collect::<Vec<_>>(), "layer started");

            let slots = self.run_layer(nodes, resource, owner, direction, cancel).await;
            let interrupted = slots.iter().any(Option::is_none);
            let done: Vec<OperandOutcome> = nodes
                .iter()
                .zip(slots)
                .map(|(node, slot)| slot.unwrap_or_else(|| cancelled(node)))
                .collect();
            if interrupted {
                warn!(%direction, layer, "cancelled; in-flight operand calls dropped");
                outcomes.extend(done);
                state = RunState::Cancelled;
                break;
            }

            let failed = done.iter().any(|o| !o.succeeded());
            let blocked = done.iter().find(|o| o.ready == Some(false)).map(|o| o.name.clone());
            outcomes.extend(done);
            if failed {
                state = RunState::Failed { layer };
                break;
            }
            if let Some(operand) = blocked {
                info!(%direction, layer, %operand, "operand not ready; holding dependents");
                state = RunState::Blocked { operand };
                break;
            }
        }

        let requeue = self.requeue_decision(&outcomes, &state);
        let events = collect_events(&outcomes, direction);
        histogram!("executor_run_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(%direction, state = ?state, requeue = ?requeue, operands = outcomes.len(), "run finished");
        RunResult { direction, state, outcomes, events, requeue }
    }

    /// Drive one layer per the configured strategy. A `None` slot was still in
    /// flight (or never started) when `cancel` fired; slots follow `nodes`.
    async fn run_layer<R: Sync + ?Sized>(
        &self,
        nodes: &[Node<R>],
        resource: &R,
        owner: &OwnerReference,
        direction: Direction,
        cancel: &CancellationToken,
    ) -> Vec<Option<OperandOutcome>> {
        let mut slots: Vec<Option<OperandOutcome>> = nodes.iter().map(|_| None).collect();
        match self.cfg.strategy {
            ExecutionStrategy::Parallel => {
                let mut pending: FuturesUnordered<_> = nodes
                    .iter()
                    .enumerate()
                    .map(|(i, node)| async move { (i, run_one(node, resource, owner, direction).await) })
                    .collect();
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        next = pending.next() => match next {
                            Some((i, out)) => slots[i] = Some(out),
                            None => break,
                        },
                    }
                }
            }
            ExecutionStrategy::Serial => {
                // An error does not stop the layer; later siblings still run.
                for (slot, node) in slots.iter_mut().zip(nodes) {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        out = run_one(node, resource, owner, direction) => *slot = Some(out),
                    }
                }
            }
        }
        slots
    }

    fn requeue_decision(&self, outcomes: &[OperandOutcome], state: &RunState) -> Requeue {
        let mut requeue = Requeue::No;
        for o in outcomes {
            if o.strategy.wants_requeue(!o.succeeded()) {
                requeue = requeue.merge(Requeue::After(self.cfg.requeue_after));
            }
        }
        // A not-ready operand always comes back, whatever the run state.
        if outcomes.iter().any(|o| o.ready == Some(false)) {
            requeue = requeue.merge(Requeue::After(self.cfg.not_ready_requeue_after));
        }
        match state {
            RunState::Cancelled => requeue.merge(Requeue::After(self.cfg.requeue_after)),
            RunState::Completed | RunState::Blocked { .. } | RunState::Failed { .. } => requeue,
        }
    }
}

fn cancelled<R: Sync + ?Sized>(node: &Node<R>) -> OperandOutcome {
    OperandOutcome {
        name: node.name().to_string(),
        layer: node.layer(),
        strategy: node.operand().requeue_strategy(),
        error: Some(OperandError::Cancelled),
        ready: None,
        event: None,
    }
}

async fn run_one<R: Sync + ?Sized>(
    node: &Node<R>,
    resource: &R,
    owner: &OwnerReference,
    direction: Direction,
) -> OperandOutcome {
    let op = node.operand();
    let name = op.name().to_string();
    let span = info_span!("operand", operand = %name, %direction, layer = node.layer());
    async move {
        let mut out = OperandOutcome {
            name,
            layer: node.layer(),
            strategy: op.requeue_strategy(),
            error: None,
            ready: None,
            event: None,
        };
        match direction {
            Direction::Converge => {
                counter!("operand_ensure_total", 1u64);
                match op.ensure(resource, owner).await {
                    Ok(event) => {
                        out.event = event;
                        match op.ready_check(resource).await {
                            Ok(ready) => out.ready = Some(ready),
                            Err(e) => out.error = Some(e),
                        }
                    }
                    Err(e) => out.error = Some(e),
                }
            }
            Direction::Teardown => {
                counter!("operand_delete_total", 1u64);
                match op.delete(resource).await {
                    Ok(event) => out.event = event,
                    Err(e) => out.error = Some(e),
                }
            }
        }
        match &out.error {
            Some(e) => {
                counter!("operand_errors_total", 1u64, "operand" => out.name.clone());
                warn!(error = %e, "operand failed");
            }
            None => debug!(ready = ?out.ready, "operand done"),
        }
        out
    }
    .instrument(span)
    .await
}

fn collect_events(outcomes: &[OperandOutcome], direction: Direction) -> Vec<Event> {
    let mut events = Vec::new();
    for o in outcomes {
        if let Some(ev) = &o.event {
            events.push(ev.clone());
        }
        let Some(err) = &o.error else {
            if o.ready == Some(false) {
                events.push(Event::normal("Waiting", format!("{} is not ready yet; dependents held", o.name)));
            }
            continue;
        };
        if matches!(err, OperandError::Cancelled) {
            continue;
        }
        let hint = match (err.class(), o.strategy.wants_requeue(true)) {
            (ErrorClass::Configuration, _) => "configuration problem, needs operator intervention",
            (ErrorClass::Retryable, true) => "will retry",
            (ErrorClass::Retryable, false) => "will not retry automatically",
        };
        let reason = match direction {
            Direction::Converge => "EnsureFailed",
            Direction::Teardown => "DeleteFailed",
        };
        events.push(Event::warning(reason, format!("{}: {} ({})", o.name, err, hint)));
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sooner_requeue_wins() {
        let a = Requeue::After(Duration::from_secs(30));
        let b = Requeue::After(Duration::from_secs(5));
        assert_eq!(a.merge(b), b);
        assert_eq!(Requeue::No.merge(a), a);
        assert_eq!(a.merge(Requeue::No), a);
        assert_eq!(Requeue::No.merge(Requeue::No), Requeue::No);
    }
}
