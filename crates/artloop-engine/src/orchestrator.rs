use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use artloop_contracts::error::{ConfigurationError, LoopError, ServiceError, StorageError};
use artloop_contracts::events::{EventPayload, EventWriter, SessionEvent};
use artloop_contracts::session::{
    write_unique, GeneratedArtifact, IterationRecord, SessionOutcome, SessionStatus,
    SessionTrace, TraceOrderError,
};
use artloop_contracts::state::{LoopPhase, LoopState};
use serde_json::{json, Value};
use thiserror::Error;

use crate::persona::Persona;
use crate::stability::StylePreset;
use crate::Collaborators;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cooperative cancellation flag shared between a caller and a running session.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Pollable view of the orchestrator's [`LoopState`].
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<Mutex<LoopState>>,
}

impl StatusHandle {
    pub fn snapshot(&self) -> LoopState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<T>(&self, apply: impl FnOnce(&mut LoopState) -> T) -> T {
        apply(&mut self.lock())
    }
}

/// Why an iteration produced no record.
#[derive(Debug, Error)]
pub enum IterationFailure {
    #[error("{} failed: {source}", .phase.as_str())]
    Service {
        phase: LoopPhase,
        #[source]
        source: ServiceError,
    },
    #[error("saving artifact failed: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Trace(#[from] TraceOrderError),
}

impl IterationFailure {
    fn service(phase: LoopPhase, source: ServiceError) -> Self {
        Self::Service { phase, source }
    }

    fn phase(&self) -> LoopPhase {
        match self {
            Self::Service { phase, .. } => *phase,
            Self::Storage(_) => LoopPhase::Generating,
            Self::Trace(_) => LoopPhase::Idle,
        }
    }

    fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Service { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Progress callbacks, invoked on the thread running the session.
pub trait LoopObserver: Send + Sync {
    fn on_phase(&self, _state: &LoopState) {}
    /// Fires as soon as the image exists, before any analysis of it.
    fn on_artifact_ready(&self, _iteration: u32, _artifact: &GeneratedArtifact) {}
    fn on_iteration_completed(&self, _record: &IterationRecord) {}
    fn on_iteration_failed(&self, _iteration: u32, _failure: &IterationFailure) {}
}

enum StepError {
    Failed(IterationFailure),
    Cancelled,
}

impl From<IterationFailure> for StepError {
    fn from(failure: IterationFailure) -> Self {
        Self::Failed(failure)
    }
}

pub struct LoopOrchestrator {
    collaborators: Collaborators,
    delay: Duration,
    style: Option<StylePreset>,
    artifact_dir: Option<PathBuf>,
    events: Option<EventWriter>,
    observer: Option<Box<dyn LoopObserver>>,
    status: StatusHandle,
    trace: Mutex<Option<SessionTrace>>,
    active: AtomicBool,
}

impl LoopOrchestrator {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            delay: Duration::ZERO,
            style: None,
            artifact_dir: None,
            events: None,
            observer: None,
            status: StatusHandle::default(),
            trace: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Pause between successful iterations.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_style(mut self, style: Option<StylePreset>) -> Self {
        self.style = style;
        self
    }

    /// Write every generated image to `dir/<artifact id>`.
    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(dir.into());
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_observer(mut self, observer: impl LoopObserver + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Consistent copy of the current (or last) session's trace.
    pub fn trace_snapshot(&self) -> Option<SessionTrace> {
        self.lock_trace().clone()
    }

    /// Runs exactly `iteration_count` attempts unless cancelled. A failed
    /// iteration is reported and skipped; the working prompt then carries over
    /// unchanged to the next attempt.
    pub fn run_session(
        &self,
        initial_prompt: &str,
        iteration_count: u32,
        cancel: &CancelToken,
    ) -> Result<SessionOutcome, LoopError> {
        if iteration_count == 0 {
            let err = ConfigurationError("iteration count must be at least 1".to_string());
            return Err(err.into());
        }
        let _guard = ActiveGuard::acquire(&self.active)?;

        let trace = SessionTrace::new(iteration_count);
        self.emit(
            SessionEvent::SessionStarted,
            json!({
                "timestamp": trace.started_at(),
                "total_generations": iteration_count,
                "prompt": initial_prompt,
                "style": self.style.map(StylePreset::as_str),
                "collaborators": self.collaborators.names(),
            }),
        );
        *self.lock_trace() = Some(trace);
        self.status
            .update(|state| *state = LoopState::started(iteration_count, initial_prompt));

        let mut working_prompt = initial_prompt.to_string();
        let mut status = SessionStatus::Completed;
        for index in 1..=iteration_count {
            if cancel.is_cancelled() {
                status = SessionStatus::Cancelled;
                break;
            }
            self.status.update(|state| {
                state.iteration = index;
                state.working_prompt = working_prompt.clone();
            });
            self.emit(
                SessionEvent::IterationStarted,
                json!({"generation": index, "prompt": working_prompt}),
            );

            match self.run_iteration(index, &working_prompt, cancel) {
                Ok(record) => {
                    self.enter_phase(LoopPhase::Idle);
                    working_prompt = record.output_prompt.clone();
                    self.status.update(|state| {
                        state.completed += 1;
                        state.working_prompt = working_prompt.clone();
                    });
                    self.emit(
                        SessionEvent::IterationCompleted,
                        json!({
                            "generation": record.index,
                            "image_filename": record.artifact_id,
                            "new_prompt": record.output_prompt,
                        }),
                    );
                    if let Some(observer) = &self.observer {
                        observer.on_iteration_completed(&record);
                    }
                }
                Err(StepError::Failed(failure)) => {
                    self.enter_phase(LoopPhase::Idle);
                    self.report_failure(index, &failure);
                    continue;
                }
                Err(StepError::Cancelled) => {
                    self.enter_phase(LoopPhase::Idle);
                    status = SessionStatus::Cancelled;
                    break;
                }
            }

            if index < iteration_count && !self.pause(cancel) {
                status = SessionStatus::Cancelled;
                break;
            }
        }

        let trace = self.trace_snapshot().unwrap_or_else(|| SessionTrace::new(iteration_count));
        let final_state = self.status.update(|state| {
            state.active = false;
            state.phase = LoopPhase::Idle;
            state.clone()
        });
        if status == SessionStatus::Cancelled {
            self.emit(
                SessionEvent::SessionCancelled,
                json!({"generation": final_state.iteration}),
            );
        }
        self.emit(
            SessionEvent::SessionFinished,
            json!({
                "status": status.as_str(),
                "recorded": trace.len(),
                "completed": final_state.completed,
                "failed": final_state.failed,
            }),
        );
        Ok(SessionOutcome { trace, status })
    }

    fn run_iteration(
        &self,
        index: u32,
        prompt: &str,
        cancel: &CancelToken,
    ) -> Result<IterationRecord, StepError> {
        let collaborators = &self.collaborators;

        checkpoint(cancel)?;
        self.enter_phase(LoopPhase::Generating);
        let mut artifact = collaborators
            .generation
            .generate(prompt, self.style)
            .map_err(|err| IterationFailure::service(LoopPhase::Generating, err))?;
        self.save_artifact(&mut artifact)?;
        self.emit(
            SessionEvent::ArtifactReady,
            json!({
                "generation": index,
                "image_filename": artifact.id,
                "content_type": artifact.content_type,
                "bytes": artifact.bytes.len(),
            }),
        );
        if let Some(observer) = &self.observer {
            observer.on_artifact_ready(index, &artifact);
        }

        checkpoint(cancel)?;
        self.enter_phase(LoopPhase::Describing);
        let description = collaborators
            .vision
            .analyze(&artifact, Persona::Descriptive)
            .map_err(|err| IterationFailure::service(LoopPhase::Describing, err))?;

        checkpoint(cancel)?;
        self.enter_phase(LoopPhase::Critiquing);
        let critique = collaborators
            .vision
            .analyze(&artifact, Persona::Critical)
            .map_err(|err| IterationFailure::service(LoopPhase::Critiquing, err))?;

        checkpoint(cancel)?;
        self.enter_phase(LoopPhase::Mutating);
        let output_prompt = collaborators
            .mutator
            .synthesize(&description, &critique)
            .map_err(|err| IterationFailure::service(LoopPhase::Mutating, err))?;

        // A cancel that lands during the last call still discards the iteration.
        checkpoint(cancel)?;
        let record = IterationRecord {
            index,
            input_prompt: prompt.to_string(),
            artifact_id: artifact.id,
            description,
            critique,
            output_prompt,
        };
        self.append_record(record.clone())?;
        Ok(record)
    }

    fn append_record(&self, record: IterationRecord) -> Result<(), IterationFailure> {
        let mut trace = self.lock_trace();
        match trace.as_mut() {
            Some(trace) => trace.append(record).map_err(IterationFailure::from),
            None => Ok(()),
        }
    }

    /// Never overwrites an earlier image: a clashing id gets a `-2`, `-3`, ...
    /// suffix before the extension.
    fn save_artifact(&self, artifact: &mut GeneratedArtifact) -> Result<(), IterationFailure> {
        let Some(dir) = &self.artifact_dir else {
            return Ok(());
        };
        let (stem, extension) = match artifact.id.rsplit_once('.') {
            Some((stem, extension)) => (stem.to_string(), format!(".{extension}")),
            None => (artifact.id.clone(), String::new()),
        };
        let path = write_unique(dir, &artifact.bytes, |attempt| match attempt {
            1 => format!("{stem}{extension}"),
            n => format!("{stem}-{n}{extension}"),
        })?;
        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            artifact.id = name.to_string();
        }
        Ok(())
    }

    fn report_failure(&self, index: u32, failure: &IterationFailure) {
        let message = failure.to_string();
        self.status.update(|state| {
            state.failed += 1;
            state.last_error = Some(format!("generation {index}: {message}"));
        });
        let service_error = failure.service_error();
        self.emit(
            SessionEvent::IterationFailed,
            json!({
                "generation": index,
                "phase": failure.phase().as_str(),
                "error": message,
                "error_kind": service_error.map(|err| err.kind.as_str()),
                "status_code": service_error.and_then(|err| err.status),
                "reachable": service_error.map(ServiceError::is_reachable),
            }),
        );
        if let Some(observer) = &self.observer {
            observer.on_iteration_failed(index, failure);
        }
    }

    /// Returns false when cancelled during the pause.
    fn pause(&self, cancel: &CancelToken) -> bool {
        if self.delay.is_zero() {
            return !cancel.is_cancelled();
        }
        self.enter_phase(LoopPhase::Waiting);
        let deadline = Instant::now() + self.delay;
        let mut cancelled = false;
        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
        }
        self.enter_phase(LoopPhase::Idle);
        !cancelled
    }

    fn enter_phase(&self, phase: LoopPhase) {
        let snapshot = self.status.update(|state| {
            debug_assert!(
                state.phase.can_transition_to(phase),
                "phase {:?} -> {:?}",
                state.phase,
                phase
            );
            if state.phase == phase {
                return None;
            }
            state.phase = phase;
            Some(state.clone())
        });
        if let (Some(snapshot), Some(observer)) = (snapshot, &self.observer) {
            observer.on_phase(&snapshot);
        }
    }

    fn emit(&self, event: SessionEvent, payload: Value) {
        let Some(events) = &self.events else {
            return;
        };
        let payload: EventPayload = payload.as_object().cloned().unwrap_or_default();
        if let Err(err) = events.emit(event, payload) {
            eprintln!("artloop: failed to record {} event: {err:#}", event.as_str());
        }
    }

    fn lock_trace(&self) -> MutexGuard<'_, Option<SessionTrace>> {
        self.trace.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn checkpoint(cancel: &CancelToken) -> Result<(), StepError> {
    if cancel.is_cancelled() {
        return Err(StepError::Cancelled);
    }
    Ok(())
}

struct ActiveGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ActiveGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, LoopError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| LoopError::AlreadyRunning)?;
        Ok(Self { flag })
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use artloop_contracts::error::{LoopError, ServiceError, ServiceErrorKind};
    use artloop_contracts::events::EventWriter;
    use artloop_contracts::session::{GeneratedArtifact, IterationRecord, SessionStatus};
    use artloop_contracts::state::{LoopPhase, LoopState};
    use serde_json::Value;

    use super::{CancelToken, IterationFailure, LoopObserver, LoopOrchestrator};
    use crate::persona::Persona;
    use crate::stability::StylePreset;
    use crate::{Collaborators, GenerationClient, PromptMutator, VisionAnalysisClient};

    /// Shared script for the fake collaborators. Each generate call opens the
    /// next iteration, so fakes know which iteration they are serving.
    #[derive(Default)]
    struct Script {
        iteration: AtomicU32,
        calls: Mutex<Vec<String>>,
        fail_generate: Vec<u32>,
        fail_describe: Vec<u32>,
        fail_critique: Vec<u32>,
        fail_mutate: Vec<u32>,
    }

    impl Script {
        fn log(&self, entry: String) {
            self.calls.lock().map(|mut calls| calls.push(entry)).ok();
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }

        fn current(&self) -> u32 {
            self.iteration.load(Ordering::SeqCst)
        }
    }

    struct FakeGeneration(Arc<Script>);

    impl GenerationClient for FakeGeneration {
        fn name(&self) -> &str {
            "fake-generation"
        }

        fn generate(
            &self,
            prompt: &str,
            _style: Option<StylePreset>,
        ) -> Result<GeneratedArtifact, ServiceError> {
            let n = self.0.iteration.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.log(format!("generate:{n}:{prompt}"));
            if self.0.fail_generate.contains(&n) {
                return Err(ServiceError::from_status("fake-generation", 503, "busy"));
            }
            Ok(GeneratedArtifact {
                id: format!("painting-{n}.png"),
                content_type: "image/png".to_string(),
                bytes: vec![1, 2, 3],
            })
        }
    }

    struct FakeVision(Arc<Script>);

    impl VisionAnalysisClient for FakeVision {
        fn name(&self) -> &str {
            "fake-vision"
        }

        fn analyze(
            &self,
            _artifact: &GeneratedArtifact,
            persona: Persona,
        ) -> Result<String, ServiceError> {
            let n = self.0.current();
            let (label, failures) = match persona {
                Persona::Descriptive => ("desc", &self.0.fail_describe),
                Persona::Critical => ("crit", &self.0.fail_critique),
            };
            self.0.log(format!("{label}:{n}"));
            if failures.contains(&n) {
                return Err(ServiceError::unreachable("fake-vision", "connection reset"));
            }
            Ok(format!("{label}-{n}"))
        }
    }

    struct FakeMutator(Arc<Script>);

    impl PromptMutator for FakeMutator {
        fn name(&self) -> &str {
            "fake-mutator"
        }

        fn synthesize(&self, description: &str, critique: &str) -> Result<String, ServiceError> {
            let n = self.0.current();
            self.0.log(format!("mutate:{n}"));
            if self.0.fail_mutate.contains(&n) {
                return Err(ServiceError::from_status("fake-mutator", 429, "slow down"));
            }
            Ok(format!("{description} + {critique}"))
        }
    }

    fn collaborators(script: &Arc<Script>) -> Collaborators {
        Collaborators {
            generation: Box::new(FakeGeneration(script.clone())),
            vision: Box::new(FakeVision(script.clone())),
            mutator: Box::new(FakeMutator(script.clone())),
        }
    }

    fn orchestrator(script: &Arc<Script>) -> LoopOrchestrator {
        LoopOrchestrator::new(collaborators(script))
    }

    /// Records observer callbacks into the script's call log.
    struct LoggingObserver {
        script: Arc<Script>,
        phases: Arc<Mutex<Vec<LoopPhase>>>,
        cancel_after: Option<(u32, CancelToken)>,
    }

    impl LoopObserver for LoggingObserver {
        fn on_phase(&self, state: &LoopState) {
            self.phases.lock().map(|mut phases| phases.push(state.phase)).ok();
        }

        fn on_artifact_ready(&self, iteration: u32, artifact: &GeneratedArtifact) {
            self.script
                .log(format!("artifact_ready:{iteration}:{}", artifact.id));
        }

        fn on_iteration_completed(&self, record: &IterationRecord) {
            self.script.log(format!("completed:{}", record.index));
            if let Some((after, cancel)) = &self.cancel_after {
                if record.index == *after {
                    cancel.cancel();
                }
            }
        }

        fn on_iteration_failed(&self, iteration: u32, failure: &IterationFailure) {
            self.script.log(format!("failed:{iteration}:{}", failure));
        }
    }

    fn logging_observer(script: &Arc<Script>) -> (LoggingObserver, Arc<Mutex<Vec<LoopPhase>>>) {
        let phases = Arc::new(Mutex::new(Vec::new()));
        (
            LoggingObserver {
                script: script.clone(),
                phases: phases.clone(),
                cancel_after: None,
            },
            phases,
        )
    }

    #[test]
    fn red_balloon_session_threads_prompts_forward() -> anyhow::Result<()> {
        let script = Arc::new(Script::default());
        let outcome =
            orchestrator(&script).run_session("a red balloon", 2, &CancelToken::new())?;

        assert_eq!(outcome.status, SessionStatus::Completed);
        let loops = serde_json::to_value(&outcome.trace)?["loops"].clone();
        assert_eq!(
            loops,
            serde_json::json!([
                {
                    "generation": 1,
                    "prompt": "a red balloon",
                    "imageFilename": "painting-1.png",
                    "artistStatement": "desc-1",
                    "criticOpinion": "crit-1",
                    "newPrompt": "desc-1 + crit-1",
                },
                {
                    "generation": 2,
                    "prompt": "desc-1 + crit-1",
                    "imageFilename": "painting-2.png",
                    "artistStatement": "desc-2",
                    "criticOpinion": "crit-2",
                    "newPrompt": "desc-2 + crit-2",
                },
            ])
        );
        assert_eq!(outcome.trace.requested(), 2);
        Ok(())
    }

    #[test]
    fn successful_sessions_have_contiguous_chained_records() -> anyhow::Result<()> {
        for n in 1..=6u32 {
            let script = Arc::new(Script::default());
            let outcome = orchestrator(&script).run_session("seed", n, &CancelToken::new())?;
            let records = outcome.trace.records();
            assert_eq!(records.len(), n as usize);
            for (position, record) in records.iter().enumerate() {
                assert_eq!(record.index, position as u32 + 1);
            }
            for pair in records.windows(2) {
                assert_eq!(pair[1].input_prompt, pair[0].output_prompt);
            }
        }
        Ok(())
    }

    #[test]
    fn failed_first_generation_is_skipped_and_prompt_reused() -> anyhow::Result<()> {
        let script = Arc::new(Script {
            fail_generate: vec![1],
            ..Script::default()
        });
        let orchestrator = orchestrator(&script);
        let outcome = orchestrator.run_session("x", 3, &CancelToken::new())?;

        assert_eq!(outcome.status, SessionStatus::Completed);
        let records = outcome.trace.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].index, 2);
        assert_eq!(records[0].input_prompt, "x");
        assert_eq!(records[1].index, 3);
        assert_eq!(records[1].input_prompt, "desc-2 + crit-2");

        let state = orchestrator.status().snapshot();
        assert_eq!(state.completed, 2);
        assert_eq!(state.failed, 1);
        assert!(!state.active);
        assert_eq!(state.phase, LoopPhase::Idle);
        let last_error = state.last_error.unwrap_or_default();
        assert!(last_error.starts_with("generation 1: generating failed"), "{last_error}");
        Ok(())
    }

    #[test]
    fn any_failing_sub_call_skips_only_that_iteration() -> anyhow::Result<()> {
        let scripts = [
            Script {
                fail_describe: vec![2],
                ..Script::default()
            },
            Script {
                fail_critique: vec![2],
                ..Script::default()
            },
            Script {
                fail_mutate: vec![2],
                ..Script::default()
            },
        ];
        for script in scripts {
            let script = Arc::new(script);
            let outcome = orchestrator(&script).run_session("x", 3, &CancelToken::new())?;
            let records = outcome.trace.records();
            assert_eq!(
                records.iter().map(|record| record.index).collect::<Vec<_>>(),
                vec![1, 3]
            );
            assert_eq!(records[1].input_prompt, records[0].output_prompt);
            assert_eq!(records[1].input_prompt, "desc-1 + crit-1");

            let generates = script
                .calls()
                .iter()
                .filter(|call| call.starts_with("generate:"))
                .count();
            assert_eq!(generates, 3, "failures still count as attempts");
        }
        Ok(())
    }

    #[test]
    fn every_iteration_failing_yields_empty_trace() -> anyhow::Result<()> {
        let script = Arc::new(Script {
            fail_generate: vec![1, 2, 3, 4, 5],
            ..Script::default()
        });
        let outcome = orchestrator(&script).run_session("x", 5, &CancelToken::new())?;
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert!(outcome.trace.is_empty());
        assert_eq!(
            script.calls(),
            (1..=5).map(|n| format!("generate:{n}:x")).collect::<Vec<_>>()
        );
        Ok(())
    }

    #[test]
    fn calls_are_strictly_ordered_and_image_is_visible_before_analysis() -> anyhow::Result<()> {
        let script = Arc::new(Script::default());
        let (observer, phases) = logging_observer(&script);
        let orchestrator = orchestrator(&script).with_observer(observer);
        orchestrator.run_session("p", 1, &CancelToken::new())?;

        assert_eq!(
            script.calls(),
            vec![
                "generate:1:p".to_string(),
                "artifact_ready:1:painting-1.png".to_string(),
                "desc:1".to_string(),
                "crit:1".to_string(),
                "mutate:1".to_string(),
                "completed:1".to_string(),
            ]
        );
        let phases = phases.lock().map(|phases| phases.clone()).unwrap_or_default();
        assert_eq!(
            phases,
            vec![
                LoopPhase::Generating,
                LoopPhase::Describing,
                LoopPhase::Critiquing,
                LoopPhase::Mutating,
                LoopPhase::Idle,
            ]
        );
        Ok(())
    }

    #[test]
    fn failure_reaches_observer_with_phase() -> anyhow::Result<()> {
        let script = Arc::new(Script {
            fail_critique: vec![1],
            ..Script::default()
        });
        let (observer, _) = logging_observer(&script);
        let orchestrator = orchestrator(&script).with_observer(observer);
        orchestrator.run_session("p", 1, &CancelToken::new())?;

        let calls = script.calls();
        let failure = calls
            .iter()
            .find(|call| call.starts_with("failed:1:"))
            .cloned()
            .unwrap_or_default();
        assert!(failure.contains("critiquing failed"), "{failure}");
        assert!(failure.contains("fake-vision is unreachable"), "{failure}");
        assert!(!calls.iter().any(|call| call.starts_with("mutate:")));
        Ok(())
    }

    #[test]
    fn cancellation_between_iterations_stops_further_calls() -> anyhow::Result<()> {
        let script = Arc::new(Script::default());
        let cancel = CancelToken::new();
        let (mut observer, _) = logging_observer(&script);
        observer.cancel_after = Some((2, cancel.clone()));
        let orchestrator = orchestrator(&script).with_observer(observer);

        let outcome = orchestrator.run_session("p", 5, &cancel)?;
        assert_eq!(outcome.status, SessionStatus::Cancelled);
        assert_eq!(outcome.trace.len(), 2);
        assert!(!script
            .calls()
            .iter()
            .any(|call| call.starts_with("generate:3")));
        Ok(())
    }

    #[test]
    fn cancellation_interrupts_pacing_delay() -> anyhow::Result<()> {
        let script = Arc::new(Script::default());
        let cancel = CancelToken::new();
        let (mut observer, _) = logging_observer(&script);
        observer.cancel_after = Some((1, cancel.clone()));
        let orchestrator = orchestrator(&script)
            .with_delay(Duration::from_secs(30))
            .with_observer(observer);

        let started = Instant::now();
        let outcome = orchestrator.run_session("p", 3, &cancel)?;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.status, SessionStatus::Cancelled);
        assert_eq!(outcome.trace.len(), 1);
        Ok(())
    }

    #[test]
    fn pacing_delay_only_runs_between_iterations() -> anyhow::Result<()> {
        let script = Arc::new(Script::default());
        let (observer, phases) = logging_observer(&script);
        let orchestrator = orchestrator(&script)
            .with_delay(Duration::from_millis(20))
            .with_observer(observer);
        orchestrator.run_session("p", 2, &CancelToken::new())?;

        let phases = phases.lock().map(|phases| phases.clone()).unwrap_or_default();
        let waits = phases
            .iter()
            .filter(|phase| **phase == LoopPhase::Waiting)
            .count();
        assert_eq!(waits, 1);
        for pair in phases.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
        Ok(())
    }

    #[test]
    fn zero_iterations_is_rejected_before_any_call() {
        let script = Arc::new(Script::default());
        let result = orchestrator(&script).run_session("p", 0, &CancelToken::new());
        assert!(matches!(result, Err(LoopError::Configuration(_))));
        assert!(script.calls().is_empty());
    }

    struct GatedGeneration {
        entered: Arc<AtomicBool>,
        release: Arc<AtomicBool>,
    }

    impl GenerationClient for GatedGeneration {
        fn name(&self) -> &str {
            "gated"
        }

        fn generate(
            &self,
            _prompt: &str,
            _style: Option<StylePreset>,
        ) -> Result<GeneratedArtifact, ServiceError> {
            self.entered.store(true, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(GeneratedArtifact::new(vec![0], "image/png"))
        }
    }

    fn wait_for(flag: &AtomicBool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    type Gated = (Arc<LoopOrchestrator>, Arc<AtomicBool>, Arc<AtomicBool>, Arc<Script>);

    /// Generation blocks until `release` is set; `entered` flips once it is called.
    fn gated_orchestrator() -> Gated {
        let script = Arc::new(Script::default());
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let collaborators = Collaborators {
            generation: Box::new(GatedGeneration {
                entered: entered.clone(),
                release: release.clone(),
            }),
            vision: Box::new(FakeVision(script.clone())),
            mutator: Box::new(FakeMutator(script.clone())),
        };
        (
            Arc::new(LoopOrchestrator::new(collaborators)),
            entered,
            release,
            script,
        )
    }

    #[test]
    fn second_session_cannot_start_while_one_is_in_flight() -> anyhow::Result<()> {
        let (orchestrator, entered, release, _) = gated_orchestrator();
        let worker = {
            let orchestrator = orchestrator.clone();
            thread::spawn(move || orchestrator.run_session("p", 1, &CancelToken::new()))
        };
        wait_for(&entered);

        let state = orchestrator.status().snapshot();
        assert!(state.active);
        assert_eq!(state.phase, LoopPhase::Generating);
        assert_eq!(state.iteration, 1);
        assert!(matches!(
            orchestrator.run_session("q", 1, &CancelToken::new()),
            Err(LoopError::AlreadyRunning)
        ));

        release.store(true, Ordering::SeqCst);
        let outcome = worker
            .join()
            .map_err(|_| anyhow::anyhow!("session thread panicked"))??;
        assert_eq!(outcome.status, SessionStatus::Completed);

        let again = orchestrator.run_session("q", 1, &CancelToken::new())?;
        assert_eq!(again.trace.len(), 1);
        Ok(())
    }

    #[test]
    fn cancel_during_a_call_discards_the_partial_iteration() -> anyhow::Result<()> {
        let (orchestrator, entered, release, script) = gated_orchestrator();
        let cancel = CancelToken::new();
        let worker = {
            let orchestrator = orchestrator.clone();
            let cancel = cancel.clone();
            thread::spawn(move || orchestrator.run_session("p", 3, &cancel))
        };
        wait_for(&entered);
        cancel.cancel();
        release.store(true, Ordering::SeqCst);

        let outcome = worker
            .join()
            .map_err(|_| anyhow::anyhow!("session thread panicked"))??;
        assert_eq!(outcome.status, SessionStatus::Cancelled);
        assert!(outcome.trace.is_empty());
        assert!(script.calls().is_empty(), "no analysis after cancel");
        assert_eq!(orchestrator.trace_snapshot().map(|trace| trace.len()), Some(0));
        Ok(())
    }

    #[test]
    fn artifacts_and_events_are_written_alongside_the_run() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let script = Arc::new(Script {
            fail_mutate: vec![2],
            ..Script::default()
        });
        let orchestrator = orchestrator(&script)
            .with_artifact_dir(temp.path().join("paintings"))
            .with_events(EventWriter::with_session_id(&events_path, "session-test"));
        let outcome = orchestrator.run_session("p", 2, &CancelToken::new())?;

        assert_eq!(
            std::fs::read(temp.path().join("paintings").join("painting-1.png"))?,
            vec![1, 2, 3]
        );
        assert!(temp.path().join("paintings").join("painting-2.png").exists());
        assert_eq!(outcome.trace.len(), 1);

        let rows: Vec<Value> = std::fs::read_to_string(&events_path)?
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let types: Vec<&str> = rows
            .iter()
            .filter_map(|row| row.get("type").and_then(Value::as_str))
            .collect();
        assert_eq!(
            types,
            vec![
                "session_started",
                "iteration_started",
                "artifact_ready",
                "iteration_completed",
                "iteration_started",
                "artifact_ready",
                "iteration_failed",
                "session_finished",
            ]
        );
        let failed = &rows[6];
        assert_eq!(failed["phase"], "mutating");
        assert_eq!(failed["error_kind"], ServiceErrorKind::RateLimited.as_str());
        assert_eq!(failed["status_code"], 429);
        assert_eq!(failed["reachable"], true);
        assert_eq!(rows[7]["status"], "completed");
        assert_eq!(rows[7]["recorded"], 1);
        Ok(())
    }

    struct SameIdGeneration;

    impl GenerationClient for SameIdGeneration {
        fn name(&self) -> &str {
            "same-id"
        }

        fn generate(
            &self,
            prompt: &str,
            _style: Option<StylePreset>,
        ) -> Result<GeneratedArtifact, ServiceError> {
            Ok(GeneratedArtifact {
                id: "painting.png".to_string(),
                content_type: "image/png".to_string(),
                bytes: prompt.as_bytes().to_vec(),
            })
        }
    }

    #[test]
    fn clashing_artifact_ids_are_suffixed_not_overwritten() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let script = Arc::new(Script::default());
        let collaborators = Collaborators {
            generation: Box::new(SameIdGeneration),
            vision: Box::new(FakeVision(script.clone())),
            mutator: Box::new(FakeMutator(script.clone())),
        };
        let orchestrator = LoopOrchestrator::new(collaborators).with_artifact_dir(temp.path());
        let outcome = orchestrator.run_session("first", 2, &CancelToken::new())?;

        let ids: Vec<&str> = outcome
            .trace
            .records()
            .iter()
            .map(|record| record.artifact_id.as_str())
            .collect();
        assert_eq!(ids, vec!["painting.png", "painting-2.png"]);
        let mut on_disk: Vec<String> = std::fs::read_dir(temp.path())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        on_disk.sort();
        assert_eq!(on_disk, vec!["painting-2.png", "painting.png"]);
        assert_eq!(std::fs::read(temp.path().join("painting.png"))?, b"first");
        assert_eq!(
            std::fs::read(temp.path().join("painting-2.png"))?,
            outcome.trace.records()[0].output_prompt.as_bytes()
        );
        Ok(())
    }

    #[test]
    fn unwritable_artifact_dir_fails_iterations_without_aborting() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let blocker = temp.path().join("paintings");
        std::fs::write(&blocker, b"file")?;
        let script = Arc::new(Script::default());
        let orchestrator = orchestrator(&script).with_artifact_dir(&blocker);

        let outcome = orchestrator.run_session("p", 2, &CancelToken::new())?;
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert!(outcome.trace.is_empty());
        let state = orchestrator.status().snapshot();
        assert_eq!(state.failed, 2);
        assert!(state
            .last_error
            .unwrap_or_default()
            .contains("saving artifact failed"));
        Ok(())
    }
}
