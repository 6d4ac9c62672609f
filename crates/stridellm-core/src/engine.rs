//! StrideLLM serving engine
//!
//! The engine drives one scheduler through plan, compute and ingest. It owns
//! the external compute step, drains the intake channel at each tick
//! boundary and emits a [`TickSummary`] per applied tick without ever
//! waiting on the consumer.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::execution::{ComputeStep, DraftProposer, ExecutionStats, SpeculativeEngine, SpeculativeStats};
use crate::grammar::GrammarEngine;
use crate::memory::{replica_channel, CacheStats, CapacitySnapshot, ReplicaLink};
use crate::registry::Registry;
use crate::scheduler::{
    intake_channel, Intake, IntakeHandle, IntakeMessage, Scheduler, SchedulerStats, TickSummary,
};
use crate::types::{Location, SequenceId, SequenceStatus, SubmitRequest, WorkerId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

/// Wait between polls when there is nothing to schedule
const IDLE_POLL: Duration = Duration::from_millis(5);

fn is_settled(status: &SequenceStatus) -> bool {
    status.state.is_terminal() || matches!(status.location, Location::Migrated { .. })
}

/// The serving engine for one replica
pub struct Engine<C: ComputeStep> {
    /// Engine configuration
    config: EngineConfig,

    /// Single writer of sequence and cache state
    scheduler: Mutex<Scheduler>,

    /// Consumer side of the intake channel
    intake: Mutex<Intake>,

    /// Producer handle given out to clients
    handle: IntakeHandle,

    /// Sender half of this replica's migration inbox
    replica_link: ReplicaLink,

    /// External compute step
    compute: C,

    /// Tick summary consumer, if any
    telemetry: Option<mpsc::Sender<TickSummary>>,

    /// Summaries dropped because the consumer fell behind
    dropped_summaries: AtomicU64,

    /// Running flag
    running: AtomicBool,

    /// Applied ticks
    step_counter: AtomicU64,

    /// Execution statistics
    exec_stats: Mutex<ExecutionStats>,

    /// Shutdown notification
    shutdown: Arc<Notify>,

    /// Signalled by the intake handle on every message
    wake: Arc<Notify>,
}

impl<C: ComputeStep> Engine<C> {
    /// Create a new engine over `registry`'s vocabulary
    pub fn new(config: EngineConfig, registry: Arc<Registry>, compute: C) -> Result<Self> {
        let grammar = Arc::new(GrammarEngine::new(registry));
        let mut scheduler = Scheduler::new(&config, grammar)?;

        let (replica_link, inbox) =
            replica_channel(config.worker_id, config.intake.migration_inbox_capacity);
        scheduler.attach_inbox(inbox);

        let wake = Arc::new(Notify::new());
        let (handle, intake) = intake_channel(
            config.intake.channel_capacity,
            scheduler.board().clone(),
            scheduler.capacity_view(),
            wake.clone(),
        );

        tracing::info!(
            "Engine {} ready: {} blocks of {} tokens, speculation {}",
            config.worker_id,
            config.cache.num_blocks,
            config.cache.block_size,
            if config.speculative.enabled { "on" } else { "off" }
        );

        Ok(Self {
            config,
            scheduler: Mutex::new(scheduler),
            intake: Mutex::new(intake),
            handle,
            replica_link,
            compute,
            telemetry: None,
            dropped_summaries: AtomicU64::new(0),
            running: AtomicBool::new(false),
            step_counter: AtomicU64::new(0),
            exec_stats: Mutex::new(ExecutionStats::default()),
            shutdown: Arc::new(Notify::new()),
            wake,
        })
    }

    /// Draft with `proposer` instead of the n-gram lookup
    pub fn with_proposer(mut self, proposer: Arc<dyn DraftProposer>) -> Self {
        let speculative = SpeculativeEngine::with_proposer(self.config.speculative.clone(), proposer);
        self.scheduler = Mutex::new(self.scheduler.into_inner().with_speculative_engine(speculative));
        self
    }

    /// Receive a [`TickSummary`] for every applied tick. Summaries that do
    /// not fit in the channel are dropped and counted.
    pub fn subscribe(&mut self) -> mpsc::Receiver<TickSummary> {
        let (tx, rx) = mpsc::channel(self.config.intake.telemetry_capacity.max(1));
        self.telemetry = Some(tx);
        rx
    }

    /// Producer handle for submissions, cancellations and migrations
    pub fn handle(&self) -> IntakeHandle {
        self.handle.clone()
    }

    /// External compute step
    pub fn compute(&self) -> &C {
        &self.compute
    }

    /// Migration target for sending sequences to this replica
    pub fn replica_link(&self) -> ReplicaLink {
        self.replica_link.clone()
    }

    /// This replica
    pub fn worker_id(&self) -> WorkerId {
        self.config.worker_id
    }

    /// Submit a request directly, bypassing the intake channel
    pub fn submit(&self, request: SubmitRequest) -> Result<SequenceId> {
        self.scheduler.lock().submit(request, Instant::now())
    }

    /// Latest status of a sequence
    pub fn status(&self, id: SequenceId) -> Option<SequenceStatus> {
        self.scheduler.lock().status(id)
    }

    fn drain_intake(&self, scheduler: &mut Scheduler, now: Instant) {
        for message in self.intake.lock().drain() {
            match message {
                IntakeMessage::Submit {
                    sequence_id,
                    request,
                } => {
                    // Rejections are published on the status board.
                    let _ = scheduler.submit_as(sequence_id, request, now);
                }
                IntakeMessage::Cancel(id) => {
                    if let Err(e) = scheduler.cancel(id) {
                        tracing::debug!("Ignoring cancellation of {}: {}", id, e);
                    }
                }
                IntakeMessage::Migrate {
                    sequence_id,
                    target,
                } => {
                    if let Err(e) = scheduler.migrate(sequence_id, target, now) {
                        tracing::warn!("Cannot migrate sequence {}: {}", sequence_id, e);
                    }
                }
            }
        }
    }

    /// Invariant violations mean block accounting is corrupt and no further
    /// tick can be trusted
    fn escalate(&self, error: Error) -> Error {
        if error.is_fatal() {
            tracing::error!("Fatal cache fault on {}: {}", self.config.worker_id, error);
            panic!("fatal cache fault on {}: {error}", self.config.worker_id);
        }
        error
    }

    fn emit(&self, summary: &TickSummary) {
        if let Some(tx) = &self.telemetry {
            if tx.try_send(summary.clone()).is_err() {
                self.dropped_summaries.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Run one tick: drain intake, plan, compute, ingest.
    ///
    /// Returns `None` when there was nothing to run. A failed compute step
    /// or ingest rolls the tick back and returns the error; the next call
    /// retries from the restored state.
    pub fn step(&self) -> Result<Option<TickSummary>> {
        let mut scheduler = self.scheduler.lock();
        let now = Instant::now();
        self.drain_intake(&mut scheduler, now);

        let plan = scheduler.schedule(now).map_err(|e| self.escalate(e))?;
        if plan.is_empty() {
            return Ok(None);
        }

        let started = Instant::now();
        let result = match self.compute.compute(&plan) {
            Ok(result) => result,
            Err(e) => {
                scheduler.abort_tick();
                tracing::warn!("Compute step failed for tick {}: {}", plan.tick, e);
                return Err(e);
            }
        };
        self.exec_stats
            .lock()
            .update(&plan, started.elapsed().as_secs_f64());

        let summary = scheduler.ingest(result).map_err(|e| self.escalate(e))?;
        drop(scheduler);

        self.step_counter.fetch_add(1, Ordering::Relaxed);
        self.emit(&summary);
        Ok(Some(summary))
    }

    /// Run the engine loop until [`Engine::stop`] is called
    pub async fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Starting engine {}", self.config.worker_id);

        while self.running.load(Ordering::SeqCst) {
            let busy = match self.step() {
                Ok(summary) => summary.is_some(),
                Err(e) => {
                    tracing::error!("Engine step error: {}", e);
                    true
                }
            };
            if busy {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Engine {} stopped", self.config.worker_id);
        Ok(())
    }

    /// Stop the engine
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Check if the engine loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Submit a request and step until it settles (blocking)
    pub fn generate_sync(&self, request: SubmitRequest) -> Result<SequenceStatus> {
        let id = self.submit(request)?;
        loop {
            if let Some(status) = self.status(id).filter(is_settled) {
                return Ok(status);
            }
            if self.step()?.is_none() && !self.scheduler.lock().has_work() {
                return Err(Error::internal(format!(
                    "sequence {id} vanished without a final status"
                )));
            }
        }
    }

    /// Wait for a sequence to settle while [`Engine::run`] drives it
    pub async fn wait_for(&self, id: SequenceId, timeout: Duration) -> Result<SequenceStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.handle.status(id).filter(is_settled) {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(Error::internal(format!(
                    "sequence {id} did not settle within {timeout:?}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        let scheduler = self.scheduler.lock();
        EngineStats {
            worker_id: self.config.worker_id,
            scheduler: scheduler.stats(),
            execution: self.exec_stats.lock().clone(),
            cache: scheduler.cache().stats().clone(),
            capacity: scheduler.cache().capacity(scheduler.tick()),
            speculative: scheduler.speculative_stats().clone(),
            step_count: self.step_counter.load(Ordering::Relaxed),
            dropped_summaries: self.dropped_summaries.load(Ordering::Relaxed),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get waiting sequence count
    pub fn pending_requests(&self) -> usize {
        self.scheduler.lock().num_waiting()
    }

    /// Get running sequence count
    pub fn running_requests(&self) -> usize {
        self.scheduler.lock().num_running()
    }
}

/// Combined engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Replica
    pub worker_id: WorkerId,

    /// Scheduler statistics
    pub scheduler: SchedulerStats,

    /// Execution statistics
    pub execution: ExecutionStats,

    /// Cache counters
    pub cache: CacheStats,

    /// Current capacity
    pub capacity: CapacitySnapshot,

    /// Speculation counters
    pub speculative: SpeculativeStats,

    /// Applied ticks
    pub step_count: u64,

    /// Tick summaries the telemetry consumer missed
    pub dropped_summaries: u64,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Engine {} Statistics:", self.worker_id)?;
        writeln!(
            f,
            "  Steps: {}, Running: {}, Waiting: {} prefill / {} decode",
            self.step_count,
            self.scheduler.running,
            self.scheduler.waiting_prefill,
            self.scheduler.waiting_decode
        )?;
        writeln!(
            f,
            "  Finished: {} completed, {} failed, {} cancelled, {} timed out",
            self.scheduler.completed,
            self.scheduler.failed,
            self.scheduler.cancelled,
            self.scheduler.timed_out
        )?;
        writeln!(
            f,
            "  Throughput: {:.2} tokens/s",
            self.execution.tokens_per_second()
        )?;
        writeln!(
            f,
            "  Blocks: {}/{} used ({:.1}%), {} snapshots ({} bytes)",
            self.capacity.used_blocks,
            self.capacity.total_blocks,
            self.capacity.utilization() * 100.0,
            self.capacity.num_snapshots,
            self.capacity.snapshot_bytes
        )?;
        writeln!(
            f,
            "  Speculation: {:.1}% accepted, depth {}",
            self.speculative.lifetime_acceptance() * 100.0,
            self.speculative.current_depth
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DeterministicCompute, LedgerCompute};
    use crate::types::{FinishReason, SequenceState};

    const VOCAB: usize = 129;
    const EOS: u32 = 128;

    fn engine(config: EngineConfig) -> Engine<DeterministicCompute> {
        Engine::new(
            config,
            Arc::new(Registry::ascii()),
            DeterministicCompute::new(VOCAB, EOS),
        )
        .unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig::new(VOCAB, 32).with_block_size(4)
    }

    /// Fails the first call, then delegates
    struct FlakyCompute {
        failed: AtomicBool,
        inner: DeterministicCompute,
    }

    impl ComputeStep for FlakyCompute {
        fn compute(&self, plan: &crate::execution::StepPlan) -> Result<crate::execution::StepResult> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(Error::Compute("device lost".into()));
            }
            self.inner.compute(plan)
        }
    }

    #[test]
    fn test_engine_creation() {
        let engine = engine(config());
        assert!(!engine.is_running());
        assert_eq!(engine.pending_requests(), 0);
        assert!(engine.step().unwrap().is_none());

        let mismatched = EngineConfig::new(1000, 32);
        assert!(Engine::new(
            mismatched,
            Arc::new(Registry::ascii()),
            DeterministicCompute::new(VOCAB, EOS)
        )
        .is_err());
    }

    #[test]
    fn test_generate_sync() {
        let engine = engine(config());
        let status = engine
            .generate_sync(SubmitRequest::new(vec![10, 20, 30]).with_max_new_tokens(5))
            .unwrap();
        assert_eq!(status.state, SequenceState::Completed);
        assert_eq!(status.finish_reason, Some(FinishReason::Length));
        assert_eq!(status.generated.len(), 5);

        let stats = engine.stats();
        assert_eq!(stats.step_count, 5);
        assert_eq!(stats.scheduler.completed, 1);
        assert_eq!(stats.capacity.used_blocks, 0);
        assert!(stats.to_string().contains("Steps: 5"));
    }

    #[test]
    fn test_compute_failure_rolls_back() {
        let engine = Engine::new(
            config(),
            Arc::new(Registry::ascii()),
            FlakyCompute {
                failed: AtomicBool::new(false),
                inner: DeterministicCompute::new(VOCAB, EOS),
            },
        )
        .unwrap();
        let id = engine.submit(SubmitRequest::new(vec![1, 2, 3])).unwrap();

        assert!(matches!(engine.step(), Err(Error::Compute(_))));
        let status = engine.status(id).unwrap();
        assert_eq!(status.state, SequenceState::Pending);
        assert_eq!(engine.stats().scheduler.aborted_ticks, 1);

        engine.step().unwrap().unwrap();
        assert_eq!(engine.status(id).unwrap().generated.len(), 1);
    }

    #[test]
    fn test_telemetry_never_blocks() {
        let mut config = config();
        config.intake.telemetry_capacity = 1;
        let mut engine = engine(config);
        let mut summaries = engine.subscribe();

        engine
            .submit(SubmitRequest::new(vec![5, 6]).with_max_new_tokens(3))
            .unwrap();
        for _ in 0..3 {
            engine.step().unwrap();
        }
        let first = summaries.try_recv().unwrap();
        assert_eq!(first.tick, 1);
        assert_eq!(first.admitted, 1);
        assert_eq!(first.tokens_committed, 1);
        assert!(summaries.try_recv().is_err());
        assert_eq!(engine.stats().dropped_summaries, 2);
    }

    #[test]
    fn test_intake_messages_apply_at_tick_boundary() {
        let engine = engine(config());
        let handle = engine.handle();
        let id = handle.try_submit(SubmitRequest::new(vec![1, 2])).unwrap();
        assert!(handle.status(id).is_none());

        engine.step().unwrap();
        assert_eq!(handle.status(id).unwrap().state, SequenceState::Running);
        assert!(handle.capacity().used_blocks > 0);
    }

    #[test]
    fn test_rejection_reaches_board() {
        let engine = engine(config());
        let handle = engine.handle();
        let id = handle
            .try_submit(SubmitRequest::new(vec![1; 200]))
            .unwrap();
        assert!(engine.step().unwrap().is_none());
        let status = handle.status(id).unwrap();
        assert_eq!(status.state, SequenceState::Failed);
        assert_eq!(
            status.failure,
            Some(crate::types::FailureReason::OutOfCapacity)
        );
    }

    #[tokio::test]
    async fn test_run_loop() {
        let engine = Arc::new(engine(config()));
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };

        let handle = engine.handle();
        let id = handle
            .submit(SubmitRequest::new(vec![7, 8, 9]).with_max_new_tokens(4))
            .await
            .unwrap();
        let status = engine.wait_for(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(status.state, SequenceState::Completed);
        assert_eq!(status.generated.len(), 4);

        engine.stop();
        runner.await.unwrap().unwrap();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_cancel_through_handle() {
        let engine = engine(config());
        let handle = engine.handle();
        let id = handle
            .submit(SubmitRequest::new(vec![1, 2, 3]))
            .await
            .unwrap();
        engine.step().unwrap();
        handle.cancel(id).await.unwrap();
        engine.step().unwrap();
        assert_eq!(handle.status(id).unwrap().state, SequenceState::Cancelled);
        assert_eq!(engine.stats().capacity.used_blocks, 0);
    }

    #[test]
    fn test_migration_between_engines() {
        let a = engine(config());
        let b = Engine::new(
            config().with_worker_id(WorkerId(1)),
            Arc::new(Registry::ascii()),
            LedgerCompute::new(DeterministicCompute::new(VOCAB, EOS), 4),
        )
        .unwrap();
        let id = a.submit(SubmitRequest::new(vec![3, 4, 5]).with_max_new_tokens(6)).unwrap();
        a.step().unwrap();
        a.step().unwrap();

        a.handle()
            .migrate(id, Arc::new(b.replica_link()))
            .unwrap();
        a.step().unwrap();
        assert!(matches!(
            a.status(id).unwrap().location,
            Location::Migrated { to: WorkerId(1) }
        ));

        while !b.status(id).is_some_and(|s| is_settled(&s)) {
            b.step().unwrap();
        }
        let status = b.status(id).unwrap();
        assert_eq!(status.state, SequenceState::Completed);
        assert_eq!(status.generated.len(), 6);
        // B rebuilt the 4 cached positions from the migrated snapshot.
        assert_eq!(b.compute().restored_positions(), 4);

        // Same tokens as an uninterrupted run.
        let reference = engine(config())
            .generate_sync(SubmitRequest::new(vec![3, 4, 5]).with_max_new_tokens(6))
            .unwrap();
        assert_eq!(status.generated, reference.generated);
    }
}
