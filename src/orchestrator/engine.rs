//! The control loop.
//!
//! ```text
//! Selecting ──▶ Executing(i) ──▶ Recording ──▶ Selecting ...
//!                  │  ▲              │
//!                  │  └── retry ─────┤
//!                  │                 ├──▶ AwaitingReboot(i) ──▶ Finished
//!                  └── satisfied ──▶ Selecting
//! ```
//!
//! Every transition that matters for resumption is persisted before the next
//! one starts, so the process can die at any point and the next invocation
//! picks up from the state file alone.

use super::outcome::{FatalReason, RunOutcome, RunReport};
use crate::checkpoint::{Checkpoint, CheckpointStore, ResumeMarker};
use crate::errors::OrchestratorError;
use crate::reboot::{Invocation, RebootCoordinator};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::step::{Step, StepOutcome, describe};
use crate::transcript::Transcript;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Loop settings that don't belong to any single step.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub max_cycles: u32,
    pub retry: RetryPolicy,
    /// Issue a host restart after scheduling the resume.
    pub restart: bool,
    /// Where attempt headers are written; `None` disables transcripts.
    pub log_dir: Option<PathBuf>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_cycles: 5,
            retry: RetryPolicy::default(),
            restart: true,
            log_dir: None,
        }
    }
}

enum Phase {
    Selecting,
    Executing(usize),
    Recording {
        index: usize,
        attempt: u32,
        outcome: StepOutcome,
        elapsed: Duration,
    },
    AwaitingReboot(usize),
    Finished(RunOutcome),
}

pub struct Orchestrator {
    steps: Vec<Box<dyn Step>>,
    store: CheckpointStore,
    coordinator: Box<dyn RebootCoordinator>,
    invocation: Invocation,
    options: OrchestratorOptions,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        steps: Vec<Box<dyn Step>>,
        store: CheckpointStore,
        coordinator: Box<dyn RebootCoordinator>,
        invocation: Invocation,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            steps,
            store,
            coordinator,
            invocation,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the run at the next step boundary when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run until Done, Fatal, AwaitingReboot or Cancelled.
    ///
    /// Infrastructure failures (corrupt store, resume scheduling) are returned
    /// as errors; step failures are part of the outcome.
    pub async fn run(&self) -> Result<RunReport, OrchestratorError> {
        let started = Instant::now();
        let cycle = match self.begin_cycle().await? {
            Ok(cycle) => cycle,
            Err(fatal) => {
                return self.report(RunOutcome::fatal(fatal), started);
            }
        };
        tracing::info!(
            cycle,
            max_cycles = self.options.max_cycles,
            steps = self.steps.len(),
            "orchestration cycle started"
        );

        let mut phase = Phase::Selecting;
        let outcome = loop {
            phase = match phase {
                Phase::Selecting => self.select()?,
                Phase::Executing(index) => self.execute(index, cycle).await?,
                Phase::Recording {
                    index,
                    attempt,
                    outcome,
                    elapsed,
                } => self.record(index, attempt, outcome, elapsed).await?,
                Phase::AwaitingReboot(index) => self.await_reboot(index, cycle).await?,
                Phase::Finished(outcome) => break outcome,
            };
        };

        tracing::info!(outcome = %outcome, "orchestration finished");
        self.report(outcome, started)
    }

    /// Work out which cycle this invocation is, closing out whatever the
    /// previous process left behind.
    async fn begin_cycle(&self) -> Result<Result<u32, FatalReason>, OrchestratorError> {
        let state = self.store.load_state()?;

        for step_id in self.store.recover_interrupted()? {
            tracing::warn!(
                step = %step_id,
                "previous attempt was interrupted; counting it as a retryable failure"
            );
        }

        let Some(marker) = state.resume else {
            self.store.mark_cycle(state.cycle.cycle_number)?;
            return Ok(Ok(state.cycle.cycle_number));
        };

        let cycle = marker.cycle_number + 1;
        tracing::info!(
            cycle,
            after_step = %marker.after_step,
            scheduled_at = %marker.scheduled_at,
            "resuming after reboot"
        );
        if let Err(e) = self.coordinator.clear_resume().await {
            tracing::warn!("failed to clear resume trigger: {}", e);
        }
        self.store.clear_resume()?;

        if cycle > self.options.max_cycles {
            return Ok(Err(FatalReason::CycleBudgetExhausted {
                step_id: marker.after_step,
                cycles: cycle,
                max_cycles: self.options.max_cycles,
            }));
        }
        self.store.mark_cycle(cycle)?;
        Ok(Ok(cycle))
    }

    fn select(&self) -> Result<Phase, OrchestratorError> {
        if self.cancel.load(Ordering::SeqCst) {
            tracing::warn!("cancellation requested; stopping before the next step");
            return Ok(Phase::Finished(RunOutcome::Cancelled));
        }
        let checkpoints = self.store.load()?;
        let next = self.steps.iter().position(|step| {
            !checkpoints
                .get(step.id())
                .is_some_and(Checkpoint::is_complete)
        });
        Ok(match next {
            Some(index) => Phase::Executing(index),
            None => Phase::Finished(RunOutcome::Done),
        })
    }

    async fn execute(&self, index: usize, cycle: u32) -> Result<Phase, OrchestratorError> {
        let step = self.steps[index].as_ref();
        let id = step.id();

        if self.check(step).await {
            tracing::info!(step = %describe(step), "already satisfied, not executing");
            self.store.record_satisfied(id)?;
            return Ok(Phase::Selecting);
        }

        // Budget carried over from a previous invocation.
        let previous = self.store.load_state()?.checkpoint(id).cloned();
        if let Some(ref cp) = previous
            && let Some(ref last) = cp.last_outcome
            && last.is_failure()
            && self
                .options
                .retry
                .decide(cp.consecutive_failures, step.max_attempts(), last)
                == RetryDecision::GiveUp
        {
            return self.give_up(index, last, cp.attempts_made);
        }

        let attempt = self.store.begin_attempt(id, cycle)?;
        tracing::info!(
            step = %describe(step),
            attempt,
            max_attempts = step.max_attempts(),
            cycle,
            "executing"
        );
        if let Some(ref log_dir) = self.options.log_dir {
            Transcript::for_step(log_dir, id).attempt_header(id, attempt, cycle);
        }

        let started = Instant::now();
        let outcome = match AssertUnwindSafe(step.execute()).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => e.into(),
            Err(panic) => StepOutcome::failed(
                format!("step panicked: {}", panic_message(panic.as_ref())),
                false,
            ),
        };

        Ok(Phase::Recording {
            index,
            attempt,
            outcome,
            elapsed: started.elapsed(),
        })
    }

    /// Run the idempotent check. Errors and panics count as "not satisfied".
    async fn check(&self, step: &dyn Step) -> bool {
        match AssertUnwindSafe(step.idempotent_check()).catch_unwind().await {
            Ok(Ok(satisfied)) => satisfied,
            Ok(Err(e)) => {
                tracing::warn!(
                    step = %step.id(),
                    "idempotent check failed, executing: {}",
                    e
                );
                false
            }
            Err(panic) => {
                tracing::warn!(
                    step = %step.id(),
                    "idempotent check panicked, executing: {}",
                    panic_message(panic.as_ref())
                );
                false
            }
        }
    }

    async fn record(
        &self,
        index: usize,
        attempt: u32,
        outcome: StepOutcome,
        elapsed: Duration,
    ) -> Result<Phase, OrchestratorError> {
        let step = self.steps[index].as_ref();
        let cp = self.store.record(step.id(), &outcome, attempt, elapsed)?;
        tracing::info!(
            step = %step.id(),
            attempt,
            outcome = %outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "recorded"
        );

        match outcome {
            StepOutcome::Success if step.requires_reboot_after() => {
                Ok(Phase::AwaitingReboot(index))
            }
            StepOutcome::Success | StepOutcome::Skipped { .. } => Ok(Phase::Selecting),
            StepOutcome::RebootRequired => Ok(Phase::AwaitingReboot(index)),
            StepOutcome::Failed { .. } => {
                match self.options.retry.decide(
                    cp.consecutive_failures,
                    step.max_attempts(),
                    &outcome,
                ) {
                    RetryDecision::Retry(delay) => {
                        tracing::warn!(
                            step = %step.id(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retryable failure, retrying"
                        );
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        Ok(Phase::Executing(index))
                    }
                    RetryDecision::GiveUp => self.give_up(index, &outcome, cp.attempts_made),
                }
            }
        }
    }

    fn give_up(
        &self,
        index: usize,
        outcome: &StepOutcome,
        attempts: u32,
    ) -> Result<Phase, OrchestratorError> {
        let step = self.steps[index].as_ref();
        let reason = outcome.reason().unwrap_or("failed").to_string();

        if step.optional() {
            tracing::warn!(
                step = %step.id(),
                attempts,
                "optional step failed, skipping: {}",
                reason
            );
            let skipped = StepOutcome::skipped(format!("optional step failed: {}", reason));
            self.store
                .record(step.id(), &skipped, attempts, Duration::ZERO)?;
            return Ok(Phase::Selecting);
        }

        tracing::error!(step = %step.id(), attempts, "step failed: {}", reason);
        Ok(Phase::Finished(RunOutcome::fatal(FatalReason::StepFailed {
            step_id: step.id().to_string(),
            reason,
            attempts,
        })))
    }

    async fn await_reboot(&self, index: usize, cycle: u32) -> Result<Phase, OrchestratorError> {
        let step_id = self.steps[index].id();
        if cycle >= self.options.max_cycles {
            tracing::error!(
                step = %step_id,
                cycle,
                max_cycles = self.options.max_cycles,
                "reboot requested but the cycle budget is exhausted"
            );
            return Ok(Phase::Finished(RunOutcome::fatal(
                FatalReason::CycleBudgetExhausted {
                    step_id: step_id.to_string(),
                    cycles: cycle,
                    max_cycles: self.options.max_cycles,
                },
            )));
        }

        self.request_reboot(step_id, cycle).await?;
        Ok(Phase::Finished(RunOutcome::AwaitingReboot {
            step_id: step_id.to_string(),
            next_cycle: cycle + 1,
        }))
    }

    /// Persist the resume marker, register the resume trigger and restart.
    ///
    /// A marker already present for `cycle` means the resume is scheduled, so
    /// a repeated call registers nothing new.
    pub async fn request_reboot(&self, step_id: &str, cycle: u32) -> Result<(), OrchestratorError> {
        if let Some(existing) = self.store.load_state()?.resume
            && existing.cycle_number == cycle
        {
            tracing::info!(
                cycle,
                after_step = %existing.after_step,
                "resume already scheduled for this cycle"
            );
            return Ok(());
        }

        let mut marker = ResumeMarker {
            cycle_number: cycle,
            after_step: step_id.to_string(),
            scheduled_at: Utc::now(),
            trigger_registered: false,
            restart_requested: self.options.restart,
        };
        self.store.mark_awaiting_reboot(marker.clone())?;

        let registered = match self.coordinator.schedule_resume(&self.invocation).await {
            Ok(registered) => registered,
            Err(e) => {
                // Without a trigger the marker would make the next run skip scheduling.
                self.store.clear_resume()?;
                return Err(e);
            }
        };
        marker.trigger_registered = registered;
        self.store.mark_awaiting_reboot(marker)?;
        tracing::info!(
            coordinator = self.coordinator.name(),
            registered,
            after_step = %step_id,
            "resume scheduled"
        );

        if self.options.restart {
            self.coordinator
                .restart(&format!("orchestrate: reboot requested by {}", step_id))
                .await?;
        }
        Ok(())
    }

    fn report(
        &self,
        outcome: RunOutcome,
        started: Instant,
    ) -> Result<RunReport, OrchestratorError> {
        Ok(RunReport {
            outcome,
            state: self.store.load_state()?,
            elapsed: started.elapsed(),
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StepError;
    use crate::step::StepKind;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;
    use tempfile::{TempDir, tempdir};

    /// Step whose `execute` plays back a script of outcomes. Success and
    /// RebootRequired make the idempotent check hold from then on.
    struct ScriptedStep {
        id: String,
        kind: StepKind,
        satisfied: Arc<AtomicBool>,
        script: Mutex<VecDeque<StepOutcome>>,
        repeat: Option<StepOutcome>,
        executions: Arc<AtomicU32>,
        max_attempts: u32,
        optional: bool,
        reboot_after: bool,
        panics: bool,
        /// Set to true when this step starts executing; used for ordering checks.
        started_flag: Option<Arc<AtomicBool>>,
        /// Must already be true when this step executes.
        requires: Option<Arc<AtomicBool>>,
    }

    impl ScriptedStep {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                kind: StepKind::Install,
                satisfied: Arc::new(AtomicBool::new(false)),
                script: Mutex::new(VecDeque::new()),
                repeat: None,
                executions: Arc::new(AtomicU32::new(0)),
                max_attempts: 3,
                optional: false,
                reboot_after: false,
                panics: false,
                started_flag: None,
                requires: None,
            }
        }

        fn kind(mut self, kind: StepKind) -> Self {
            self.kind = kind;
            self
        }

        fn already_satisfied(self) -> Self {
            self.satisfied.store(true, Ordering::SeqCst);
            self
        }

        fn then(self, outcome: StepOutcome) -> Self {
            self.script.lock().unwrap().push_back(outcome);
            self
        }

        fn always(mut self, outcome: StepOutcome) -> Self {
            self.repeat = Some(outcome);
            self
        }

        fn max_attempts(mut self, n: u32) -> Self {
            self.max_attempts = n;
            self
        }

        fn optional(mut self) -> Self {
            self.optional = true;
            self
        }

        fn reboot_after(mut self) -> Self {
            self.reboot_after = true;
            self
        }

        fn panics(mut self) -> Self {
            self.panics = true;
            self
        }

        fn counter(&self) -> Arc<AtomicU32> {
            Arc::clone(&self.executions)
        }

        fn satisfied_flag(&self) -> Arc<AtomicBool> {
            Arc::clone(&self.satisfied)
        }
    }

    #[async_trait]
    impl Step for ScriptedStep {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> StepKind {
            self.kind
        }

        fn max_attempts(&self) -> u32 {
            self.max_attempts
        }

        fn requires_reboot_after(&self) -> bool {
            self.reboot_after
        }

        fn optional(&self) -> bool {
            self.optional
        }

        async fn idempotent_check(&self) -> Result<bool, StepError> {
            Ok(self.satisfied.load(Ordering::SeqCst))
        }

        async fn execute(&self) -> Result<StepOutcome, StepError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            if let Some(ref flag) = self.started_flag {
                flag.store(true, Ordering::SeqCst);
            }
            if let Some(ref required) = self.requires {
                assert!(required.load(Ordering::SeqCst), "dependency not satisfied");
            }
            if self.panics {
                panic!("installer blew up");
            }
            let outcome = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .or_else(|| self.repeat.clone())
                .unwrap_or(StepOutcome::Success);
            if matches!(outcome, StepOutcome::Success | StepOutcome::RebootRequired) {
                self.satisfied.store(true, Ordering::SeqCst);
            }
            Ok(outcome)
        }
    }

    /// Coordinator that records calls instead of touching the OS.
    #[derive(Default, Clone)]
    struct RecordingCoordinator {
        scheduled: Arc<AtomicU32>,
        cleared: Arc<AtomicU32>,
        restarts: Arc<AtomicU32>,
        fail_schedule: bool,
    }

    #[async_trait]
    impl RebootCoordinator for RecordingCoordinator {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn schedule_resume(&self, _inv: &Invocation) -> Result<bool, OrchestratorError> {
            if self.fail_schedule {
                return Err(OrchestratorError::Reboot("access denied".into()));
            }
            self.scheduled.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn clear_resume(&self) -> Result<(), OrchestratorError> {
            self.cleared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn restart(&self, _reason: &str) -> Result<(), OrchestratorError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn options(max_cycles: u32) -> OrchestratorOptions {
        OrchestratorOptions {
            max_cycles,
            retry: RetryPolicy::linear(Duration::ZERO, Duration::ZERO),
            restart: true,
            log_dir: None,
        }
    }

    fn store(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::with_host(dir.path().join("state.json"), "build-01")
    }

    fn orchestrator(
        dir: &TempDir,
        steps: Vec<Box<dyn Step>>,
        coordinator: RecordingCoordinator,
        max_cycles: u32,
    ) -> Orchestrator {
        Orchestrator::new(
            steps,
            store(dir),
            Box::new(coordinator),
            Invocation::new("orchestrate", vec!["run".into()]),
            options(max_cycles),
        )
    }

    #[tokio::test]
    async fn test_four_step_scenario_completes() {
        let dir = tempdir().unwrap();
        let detect = ScriptedStep::new("detect-os")
            .kind(StepKind::Detect)
            .already_satisfied();
        let install = ScriptedStep::new("install-agent");
        let configure = ScriptedStep::new("configure-agent")
            .kind(StepKind::Configure)
            .then(StepOutcome::failed("config file locked", true))
            .then(StepOutcome::Success);
        let verify = ScriptedStep::new("verify-agent").kind(StepKind::Verify);
        let counters = [
            detect.counter(),
            install.counter(),
            configure.counter(),
            verify.counter(),
        ];

        let orch = orchestrator(
            &dir,
            vec![
                Box::new(detect),
                Box::new(install),
                Box::new(configure),
                Box::new(verify),
            ],
            RecordingCoordinator::default(),
            3,
        );
        let report = orch.run().await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(report.outcome.exit_code(), 0);
        let executions: Vec<u32> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(executions, vec![0, 1, 2, 1]);

        let cps = &report.state.checkpoints;
        assert!(cps["detect-os"].satisfied_by_check);
        assert_eq!(cps["detect-os"].attempts_made, 0);
        assert_eq!(cps["install-agent"].attempts_made, 1);
        assert_eq!(cps["configure-agent"].attempts_made, 2);
        assert_eq!(cps["verify-agent"].attempts_made, 1);
        assert!(cps.values().all(Checkpoint::is_complete));
    }

    #[tokio::test]
    async fn test_retry_bound_then_fatal() {
        let dir = tempdir().unwrap();
        let flaky = ScriptedStep::new("flaky")
            .max_attempts(3)
            .always(StepOutcome::failed("service still starting", true));
        let after = ScriptedStep::new("after");
        let (flaky_runs, after_runs) = (flaky.counter(), after.counter());

        let orch = orchestrator(
            &dir,
            vec![Box::new(flaky), Box::new(after)],
            RecordingCoordinator::default(),
            3,
        );
        let report = orch.run().await.unwrap();

        assert_eq!(flaky_runs.load(Ordering::SeqCst), 3);
        assert_eq!(after_runs.load(Ordering::SeqCst), 0);
        match report.outcome {
            RunOutcome::Fatal {
                reason: FatalReason::StepFailed {
                    ref step_id,
                    attempts,
                    ..
                },
            } => {
                assert_eq!(step_id, "flaky");
                assert_eq!(attempts, 3);
            }
            ref other => panic!("Expected StepFailed, got {:?}", other),
        }
        // Later steps stay pending rather than skipped.
        assert!(report.state.checkpoint("after").is_none());

        // Re-invoking does not grant a fresh budget.
        let again = orchestrator(
            &dir,
            vec![
                Box::new(
                    ScriptedStep::new("flaky").always(StepOutcome::failed("still starting", true)),
                ),
                Box::new(ScriptedStep::new("after")),
            ],
            RecordingCoordinator::default(),
            3,
        );
        assert_eq!(again.run().await.unwrap().outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let dir = tempdir().unwrap();
        let step = ScriptedStep::new("needs-dotnet")
            .always(StepOutcome::failed(".NET 4.8 missing", false));
        let runs = step.counter();
        let orch = orchestrator(&dir, vec![Box::new(step)], RecordingCoordinator::default(), 3);
        let report = orch.run().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(matches!(report.outcome, RunOutcome::Fatal { .. }));
    }

    #[tokio::test]
    async fn test_cycle_bound_is_exactly_max_cycles_resumes() {
        let dir = tempdir().unwrap();
        let coordinator = RecordingCoordinator::default();
        let max_cycles = 2;
        let mut exits = Vec::new();

        // A step that never becomes satisfied and always wants a reboot.
        for _ in 0..5 {
            let step = ScriptedStep::new("stubborn").always(StepOutcome::RebootRequired);
            let step = Stubborn(step);
            let orch = orchestrator(&dir, vec![Box::new(step)], coordinator.clone(), max_cycles);
            let outcome = orch.run().await.unwrap().outcome;
            exits.push(outcome.exit_code());
            if outcome.exit_code() != 2 {
                assert!(matches!(
                    outcome,
                    RunOutcome::Fatal {
                        reason: FatalReason::CycleBudgetExhausted { cycles: 2, max_cycles: 2, .. }
                    }
                ));
                break;
            }
        }
        assert_eq!(exits, vec![2, 2, 1]);
        assert_eq!(coordinator.scheduled.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.cleared.load(Ordering::SeqCst), 2);
    }

    /// Wraps a step so its check never holds.
    struct Stubborn(ScriptedStep);

    #[async_trait]
    impl Step for Stubborn {
        fn id(&self) -> &str {
            self.0.id()
        }
        fn kind(&self) -> StepKind {
            self.0.kind
        }
        fn max_attempts(&self) -> u32 {
            self.0.max_attempts
        }
        async fn idempotent_check(&self) -> Result<bool, StepError> {
            Ok(false)
        }
        async fn execute(&self) -> Result<StepOutcome, StepError> {
            self.0.execute().await
        }
    }

    #[tokio::test]
    async fn test_ordering_dependency_respected() {
        let dir = tempdir().unwrap();
        let a_done = Arc::new(AtomicBool::new(false));
        let mut a = ScriptedStep::new("install-runtime")
            .then(StepOutcome::failed("msiexec busy", true))
            .then(StepOutcome::Success);
        a.satisfied = Arc::clone(&a_done);
        let mut b = ScriptedStep::new("configure-runtime");
        b.requires = Some(Arc::clone(&a_done));
        let b_started = Arc::new(AtomicBool::new(false));
        b.started_flag = Some(Arc::clone(&b_started));

        let orch = orchestrator(
            &dir,
            vec![Box::new(a), Box::new(b)],
            RecordingCoordinator::default(),
            3,
        );
        assert_eq!(orch.run().await.unwrap().outcome, RunOutcome::Done);
        assert!(b_started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reboot_then_resume_does_not_rerun_step() {
        let dir = tempdir().unwrap();
        let coordinator = RecordingCoordinator::default();

        let runtime = ScriptedStep::new("install-runtime").then(StepOutcome::RebootRequired);
        let runtime_runs = runtime.counter();
        let runtime_done = runtime.satisfied_flag();
        let configure = ScriptedStep::new("configure-runtime");
        let configure_runs = configure.counter();

        let first = orchestrator(
            &dir,
            vec![Box::new(runtime), Box::new(configure)],
            coordinator.clone(),
            3,
        );
        let report = first.run().await.unwrap();
        assert_eq!(
            report.outcome,
            RunOutcome::AwaitingReboot {
                step_id: "install-runtime".into(),
                next_cycle: 1
            }
        );
        assert_eq!(report.outcome.exit_code(), 2);
        assert_eq!(configure_runs.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.scheduled.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.restarts.load(Ordering::SeqCst), 1);
        let marker = report.state.resume.clone().unwrap();
        assert!(marker.trigger_registered);
        assert_eq!(marker.after_step, "install-runtime");

        // Fresh process after the reboot: new step objects, same state path.
        let mut runtime = ScriptedStep::new("install-runtime");
        runtime.satisfied = runtime_done;
        let runtime_runs_2 = runtime.counter();
        let second = orchestrator(
            &dir,
            vec![Box::new(runtime), Box::new(ScriptedStep::new("configure-runtime"))],
            coordinator.clone(),
            3,
        );
        let report = second.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(runtime_runs.load(Ordering::SeqCst), 1);
        assert_eq!(runtime_runs_2.load(Ordering::SeqCst), 0);
        assert_eq!(report.state.cycle.cycle_number, 1);
        assert_eq!(report.state.cycle_history.len(), 1);
        assert!(report.state.resume.is_none());
        assert_eq!(coordinator.cleared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_requires_reboot_after_success() {
        let dir = tempdir().unwrap();
        let step = ScriptedStep::new("rename-computer").reboot_after();
        let orch = orchestrator(
            &dir,
            vec![Box::new(step), Box::new(ScriptedStep::new("next"))],
            RecordingCoordinator::default(),
            3,
        );
        let report = orch.run().await.unwrap();
        assert_eq!(report.outcome.exit_code(), 2);
        assert!(report.state.checkpoints["rename-computer"].is_complete());
        assert!(report.state.checkpoint("next").is_none());
    }

    #[tokio::test]
    async fn test_rename_then_reboot_resumes_on_new_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let coordinator = RecordingCoordinator::default();

        let rename = ScriptedStep::new("rename-computer")
            .kind(StepKind::Configure)
            .reboot_after();
        let renamed = rename.satisfied_flag();
        let first = Orchestrator::new(
            vec![Box::new(rename)],
            CheckpointStore::with_host(path.clone(), "WIN-TEMPLATE"),
            Box::new(coordinator.clone()),
            Invocation::new("orchestrate", vec!["run".into()]),
            options(3),
        );
        assert_eq!(first.run().await.unwrap().outcome.exit_code(), 2);

        let mut rename = ScriptedStep::new("rename-computer").kind(StepKind::Configure);
        rename.satisfied = renamed;
        let rename_runs = rename.counter();
        let second = Orchestrator::new(
            vec![Box::new(rename), Box::new(ScriptedStep::new("install-agent"))],
            CheckpointStore::with_host(path, "BUILD-01"),
            Box::new(coordinator.clone()),
            Invocation::new("orchestrate", vec!["run".into()]),
            options(3),
        );
        let report = second.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(report.state.cycle.cycle_number, 1);
        assert_eq!(report.state.host, "BUILD-01");
        assert_eq!(rename_runs.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.scheduled.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.cleared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_optional_step_failure_becomes_skipped() {
        let dir = tempdir().unwrap();
        let cloudwatch = ScriptedStep::new("install-cloudwatch")
            .optional()
            .max_attempts(2)
            .always(StepOutcome::failed("CloudWatch Agent not found", true));
        let runs = cloudwatch.counter();
        let orch = orchestrator(
            &dir,
            vec![Box::new(cloudwatch), Box::new(ScriptedStep::new("verify"))],
            RecordingCoordinator::default(),
            3,
        );
        let report = orch.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let cp = &report.state.checkpoints["install-cloudwatch"];
        assert!(matches!(cp.last_outcome, Some(StepOutcome::Skipped { .. })));
        assert_eq!(cp.attempts_made, 2);
    }

    #[tokio::test]
    async fn test_interrupted_attempt_counts_against_budget() {
        let dir = tempdir().unwrap();
        // Simulate a crash mid-execute: attempt begun, never recorded.
        store(&dir).begin_attempt("install-agent", 0).unwrap();

        let step = ScriptedStep::new("install-agent").max_attempts(3);
        let runs = step.counter();
        let orch = orchestrator(&dir, vec![Box::new(step)], RecordingCoordinator::default(), 3);
        let report = orch.run().await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let cp = &report.state.checkpoints["install-agent"];
        assert_eq!(cp.attempts_made, 2);
        assert!(!cp.in_flight);
    }

    #[tokio::test]
    async fn test_cancel_stops_between_steps() {
        let dir = tempdir().unwrap();
        let first = ScriptedStep::new("first");
        let second = ScriptedStep::new("second");
        let second_runs = second.counter();
        let orch = orchestrator(
            &dir,
            vec![Box::new(first), Box::new(second)],
            RecordingCoordinator::default(),
            3,
        );
        orch.cancel_handle().store(true, Ordering::SeqCst);
        let report = orch.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.outcome.exit_code(), 4);
        assert_eq!(second_runs.load(Ordering::SeqCst), 0);

        // A later run picks up normally.
        let orch = orchestrator(
            &dir,
            vec![Box::new(ScriptedStep::new("first")), Box::new(ScriptedStep::new("second"))],
            RecordingCoordinator::default(),
            3,
        );
        assert_eq!(orch.run().await.unwrap().outcome, RunOutcome::Done);
    }

    #[tokio::test]
    async fn test_panicking_step_is_classified_not_propagated() {
        let dir = tempdir().unwrap();
        let step = ScriptedStep::new("explodes").panics();
        let orch = orchestrator(&dir, vec![Box::new(step)], RecordingCoordinator::default(), 3);
        let report = orch.run().await.unwrap();
        match report.outcome {
            RunOutcome::Fatal {
                reason: FatalReason::StepFailed { ref reason, attempts, .. },
            } => {
                assert!(reason.contains("installer blew up"));
                assert_eq!(attempts, 1);
            }
            ref other => panic!("Expected StepFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_reboot_twice_schedules_once() {
        let dir = tempdir().unwrap();
        let coordinator = RecordingCoordinator::default();
        let orch = orchestrator(&dir, vec![], coordinator.clone(), 3);
        orch.request_reboot("install-runtime", 0).await.unwrap();
        orch.request_reboot("install-runtime", 0).await.unwrap();
        assert_eq!(coordinator.scheduled.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_scheduling_leaves_no_marker() {
        let dir = tempdir().unwrap();
        let coordinator = RecordingCoordinator {
            fail_schedule: true,
            ..Default::default()
        };
        let step = ScriptedStep::new("install-runtime").then(StepOutcome::RebootRequired);
        let orch = orchestrator(&dir, vec![Box::new(step)], coordinator, 3);
        let err = orch.run().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Reboot(_)));
        assert!(store(&dir).load_state().unwrap().resume.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_store_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("state.json"), "not json at all").unwrap();
        let orch = orchestrator(
            &dir,
            vec![Box::new(ScriptedStep::new("a"))],
            RecordingCoordinator::default(),
            3,
        );
        let err = orch.run().await.unwrap_err();
        assert!(err.is_store_corrupt());
    }
}
