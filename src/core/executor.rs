//! GT-030: Orchestration engine. Drives an execution plan to a run report.
//!
//! Steps are dispatched in plan order once every step they wait on has
//! finished, with at most `max_parallel` invocations in flight; with the
//! default of 1 execution follows the plan exactly. Deploy and destroy stop
//! dispatching at the first failure (the run is `Aborted`); plan, test and
//! any what-if run record failures and keep going. Cancellation stops dispatch, kills what
//! is in flight and records everything else as skipped.

use super::resolver;
use super::types::*;
use crate::backends::{self, InvocationRequest};
use crate::transport::{CancelToken, Invoker};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Knobs for one run.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Bound on invocations in flight at once, across depths (at least 1)
    pub max_parallel: usize,
    /// Force plan semantics on every module
    pub what_if: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            what_if: false,
        }
    }
}

/// Why dispatch stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Aborted,
    Cancelled,
}

impl Halt {
    fn skip_reason(self) -> SkipReason {
        match self {
            Self::Aborted => SkipReason::Aborted,
            Self::Cancelled => SkipReason::Cancelled,
        }
    }

    fn run_state(self) -> RunState {
        match self {
            Self::Aborted => RunState::Aborted,
            Self::Cancelled => RunState::Cancelled,
        }
    }
}

/// Runs plans for one environment against one invoker.
pub struct Orchestrator {
    modules: Vec<Arc<Module>>,
    environment: Arc<Environment>,
    namespace: Arc<str>,
    invoker: Arc<dyn Invoker>,
    cancel: CancelToken,
    options: RunOptions,
}

impl Orchestrator {
    pub fn new(
        modules: Vec<Module>,
        environment: Environment,
        namespace: &str,
        invoker: Arc<dyn Invoker>,
        cancel: CancelToken,
        options: RunOptions,
    ) -> Self {
        Self {
            modules: modules.into_iter().map(Arc::new).collect(),
            environment: Arc::new(environment),
            namespace: Arc::from(namespace),
            invoker,
            cancel,
            options,
        }
    }

    /// What-if runs ask every backend for its plan instead.
    fn invoked_action(&self, plan: &ExecutionPlan) -> Action {
        if self.options.what_if {
            Action::Plan
        } else {
            plan.action
        }
    }

    fn request(&self, module: &Arc<Module>, plan: &ExecutionPlan) -> InvocationRequest {
        InvocationRequest {
            action: self.invoked_action(plan),
            direction: plan.direction,
            module: Arc::clone(module),
            environment: Arc::clone(&self.environment),
            namespace: Arc::clone(&self.namespace),
        }
    }

    /// Requests for every module whose outputs `module` references.
    fn output_sources(&self, module: &Module, plan: &ExecutionPlan) -> Vec<InvocationRequest> {
        let mut ids: Vec<String> = Vec::new();
        for output in resolver::module_output_refs(module) {
            if !ids.contains(&output.module) {
                ids.push(output.module);
            }
        }
        ids.iter()
            .filter_map(|id| self.modules.iter().find(|m| &m.id == id))
            .map(|source| self.request(source, plan))
            .collect()
    }

    /// Execute `plan`, filling in `report`. Always returns the report, even
    /// when the run aborts or is cancelled.
    pub async fn run(&self, plan: &ExecutionPlan, mut report: RunReport) -> RunReport {
        let strict = plan.action.aborts_on_failure() && !self.options.what_if;
        let max_parallel = self.options.max_parallel.max(1);
        let mut slots: Vec<Option<InvocationResult>> = vec![None; plan.steps.len()];
        let mut dispatched = vec![false; plan.steps.len()];
        let mut halt: Option<Halt> = None;

        report.state = RunState::Running;
        info!(
            run = %report.run_id,
            action = %plan.action,
            environment = %self.environment.name(),
            modules = plan.steps.len(),
            what_if = self.options.what_if,
            "run started"
        );

        let mut pending: Vec<usize> = (0..plan.steps.len()).collect();
        let mut in_flight: JoinSet<(usize, InvocationResult)> = JoinSet::new();

        loop {
            if halt != Some(Halt::Cancelled) && self.cancel.is_cancelled() {
                halt = Some(Halt::Cancelled);
            }
            if halt.is_none() {
                let mut i = 0;
                while i < pending.len() && in_flight.len() < max_parallel {
                    let pos = pending[i];
                    let step = &plan.steps[pos];
                    if !step.waits_on.iter().all(|w| slots[*w].is_some()) {
                        i += 1;
                        continue;
                    }
                    pending.remove(i);
                    dispatched[pos] = true;

                    let module = &self.modules[step.index];
                    let req = self.request(module, plan);
                    let sources = self.output_sources(module, plan);
                    let invoker = Arc::clone(&self.invoker);
                    let cancel = self.cancel.clone();
                    let backend = backends::for_kind(module.backend);
                    info!(module = %module.id, backend = %module.backend, depth = step.depth, "dispatching");
                    in_flight.spawn(async move {
                        let result = match backends::resolve_outputs(&req, &sources, invoker.as_ref(), &cancel).await {
                            Ok(req) => backends::invoke(backend, invoker.as_ref(), &req, &cancel).await,
                            Err(e) => InvocationResult::failed(&req.module, req.action, e.to_string()),
                        };
                        (pos, result)
                    });
                }
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    match joined {
                        Some(Ok((pos, result))) => {
                            log_result(&result);
                            if strict && result.status == InvocationStatus::Failure && halt.is_none() {
                                warn!(module = %result.module, "failure aborts the run");
                                halt = Some(Halt::Aborted);
                            }
                            slots[pos] = Some(result);
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "invocation task did not complete");
                            if strict && halt.is_none() {
                                halt = Some(Halt::Aborted);
                            }
                        }
                        None => break,
                    }
                }
                _ = self.cancel.cancelled(), if halt != Some(Halt::Cancelled) => {
                    warn!("cancellation requested, stopping dispatch");
                    halt = Some(Halt::Cancelled);
                }
            }
        }

        report.results = self.collect(plan, slots, &dispatched, halt);
        report.state = halt.map_or(RunState::Completed, Halt::run_state);
        report.finished_at = Some(Utc::now());
        info!(
            run = %report.run_id,
            state = %report.state,
            succeeded = report.count(InvocationStatus::Success),
            failed = report.count(InvocationStatus::Failure),
            skipped = report.count(InvocationStatus::Skipped),
            "run finished"
        );
        report
    }

    /// Fill every empty slot: lost tasks fail, never-started steps are skipped.
    fn collect(
        &self,
        plan: &ExecutionPlan,
        slots: Vec<Option<InvocationResult>>,
        dispatched: &[bool],
        halt: Option<Halt>,
    ) -> Vec<InvocationResult> {
        let reason = halt.map_or(SkipReason::Aborted, Halt::skip_reason);
        let action = self.invoked_action(plan);
        slots
            .into_iter()
            .zip(&plan.steps)
            .zip(dispatched)
            .map(|((slot, step), &started)| {
                let module = &self.modules[step.index];
                slot.unwrap_or_else(|| {
                    let mut result = InvocationResult::skipped(module, action, reason);
                    if started {
                        result.status = InvocationStatus::Failure;
                        result.skip_reason = None;
                        result.error = Some("invocation task did not complete".to_string());
                    }
                    result
                })
            })
            .collect()
    }
}

fn log_result(result: &InvocationResult) {
    match result.status {
        InvocationStatus::Success => {
            info!(module = %result.module, duration = result.duration_seconds, "succeeded")
        }
        InvocationStatus::Skipped => info!(module = %result.module, "nothing to do"),
        InvocationStatus::Failure => warn!(
            module = %result.module,
            error = result.error.as_deref().unwrap_or(""),
            "failed"
        ),
    }
}
