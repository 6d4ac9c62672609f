//! Scheduler for StrideLLM
//!
//! The scheduler is the single writer of all sequence and cache state. Each
//! tick it:
//!
//! 1. adopts inbound migrations, applies cancellations and attempts due
//!    outbound migrations (none of which can be undone, so they happen
//!    before the checkpoint)
//! 2. checkpoints its state
//! 3. times out waiting sequences whose admission deadline passed
//! 4. grows running sequences, preempting lower-priority work if needed
//! 5. admits from the decode queue, then from the prefill queue
//! 6. emits a [`StepPlan`]
//!
//! [`Scheduler::ingest`] applies the compute result. Any integration error
//! while ingesting restores the checkpoint, so a tick is never partially
//! applied.

pub mod intake;
pub mod rate_limit;
pub mod request_queue;

pub use intake::{intake_channel, Intake, IntakeHandle, IntakeMessage, StatusBoard};
pub use rate_limit::RateLimiter;
pub use request_queue::{QueueKey, RequestQueue, RequestQueueConfig};

use crate::config::{EngineConfig, SchedulerConfig};
use crate::error::{Error, MigrationError, Result};
use crate::execution::{
    verify, PlanEntry, SpeculationTree, SpeculativeEngine, SpeculativeStats, StepPlan, StepResult,
};
use crate::grammar::{GrammarEngine, GrammarState, TokenMask};
use crate::memory::{
    select_victims, CacheCheckpoint, CacheManager, CapacityView, EvictionCandidate,
    MigrationInbox, MigrationTarget, PendingMigration,
};
use crate::types::{
    FailureReason, FinishReason, Location, Phase, Priority, RequestId, Sequence, SequenceId,
    SequenceState, SequenceStatus, SubmitRequest, TokenId, WorkerId,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Scheduler statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Requests accepted into the waiting queue
    pub submitted: u64,

    /// Requests rejected at submission
    pub rejected: u64,

    /// Admissions (including resumes)
    pub admitted: u64,

    /// Running sequences preempted
    pub preemptions: u64,

    /// Sequences completed
    pub completed: u64,

    /// Sequences failed
    pub failed: u64,

    /// Sequences cancelled
    pub cancelled: u64,

    /// Sequences timed out before admission
    pub timed_out: u64,

    /// Sequences handed to other workers
    pub migrated_out: u64,

    /// Sequences adopted from other workers
    pub migrated_in: u64,

    /// Failed migration attempts that were rescheduled
    pub migration_retries: u64,

    /// Ticks fully applied
    pub ticks: u64,

    /// Ticks rolled back
    pub aborted_ticks: u64,

    /// Tokens committed to sequences
    pub tokens_committed: u64,

    /// Number of running sequences
    pub running: usize,

    /// Sequences waiting for prefill
    pub waiting_prefill: usize,

    /// Sequences waiting to resume decoding
    pub waiting_decode: usize,
}

/// Immutable summary of one applied tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    /// Tick number
    pub tick: u64,

    /// Worker that ran the tick
    pub worker_id: WorkerId,

    /// Sequences in the plan
    pub planned: usize,

    /// Sequences admitted or resumed
    pub admitted: usize,

    /// Sequences preempted to make room
    pub evicted: usize,

    /// Waiting sequences that hit their deadline
    pub timed_out: usize,

    /// Tokens committed
    pub tokens_committed: usize,

    /// Drafted tokens verified
    pub drafted: usize,

    /// Drafted tokens accepted
    pub accepted: usize,

    /// Sequences that completed
    pub finished: usize,

    /// Free blocks after the tick
    pub free_blocks: usize,
}

impl TickSummary {
    /// Fraction of drafted tokens accepted, if anything was drafted
    pub fn acceptance_rate(&self) -> Option<f32> {
        (self.drafted > 0).then(|| self.accepted as f32 / self.drafted as f32)
    }
}

/// Everything a rollback restores
#[derive(Debug, Clone)]
struct TickState {
    sequences: HashMap<SequenceId, Sequence>,
    queue: RequestQueue,
    running: Vec<SequenceId>,
    speculative: SpeculativeEngine,
    migrations: HashMap<SequenceId, PendingMigration>,
    /// Final statuses not yet published
    retired: Vec<SequenceStatus>,
    stats: SchedulerStats,
}

#[derive(Debug, Clone, Copy, Default)]
struct Activity {
    admitted: usize,
    evicted: usize,
    timed_out: usize,
}

/// Everything a published status is derived from, minus the token content
/// (which only grows, so its length stands in for it)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatusStamp {
    state: SequenceState,
    phase: Phase,
    generated: usize,
    num_blocks: usize,
    has_snapshot: bool,
    preemptions: usize,
    location: Location,
}

struct Checkpoint {
    state: TickState,
    cache: CacheCheckpoint,
}

struct InFlight {
    plan: StepPlan,
    checkpoint: Checkpoint,
    activity: Activity,
}

fn queue_key(sequence: &Sequence) -> QueueKey {
    QueueKey {
        priority: sequence.priority,
        arrival: sequence.arrival_time,
        sequence_id: sequence.id,
    }
}

fn failure_for(error: &Error) -> FailureReason {
    match error.root() {
        Error::RateLimitExceeded { .. } => FailureReason::RateLimited,
        Error::OutOfCapacity { .. } => FailureReason::OutOfCapacity,
        Error::InvalidGrammar(message) => FailureReason::InvalidGrammar {
            message: message.clone(),
        },
        Error::GrammarViolation { token, .. } => FailureReason::GrammarViolation { token: *token },
        other => FailureReason::ServerFault {
            message: other.to_string(),
        },
    }
}

fn rejection_status(id: SequenceId, request_id: RequestId, error: &Error) -> SequenceStatus {
    SequenceStatus {
        sequence_id: id,
        request_id,
        state: SequenceState::Failed,
        phase: Phase::Prefill,
        generated: Vec::new(),
        num_blocks: 0,
        has_snapshot: false,
        preemptions: 0,
        location: Location::Local,
        finish_reason: None,
        failure: Some(failure_for(error)),
    }
}

fn empty_grammar() -> FailureReason {
    FailureReason::InvalidGrammar {
        message: "grammar admits no token".to_string(),
    }
}

/// Single-writer tick scheduler
pub struct Scheduler {
    /// Configuration
    config: SchedulerConfig,

    /// This replica
    worker_id: WorkerId,

    /// Mask and advance queries
    grammar: Arc<GrammarEngine>,

    /// Block accounting
    cache: CacheManager,

    /// Per-tenant admission budget
    rate_limiter: Option<RateLimiter>,

    /// Inbound migrations
    inbox: Option<MigrationInbox>,

    /// Sequences, queues and counters
    state: TickState,

    /// Cancellations applied at the next tick boundary
    cancellations: Vec<SequenceId>,

    /// Plan awaiting its result
    in_flight: Option<InFlight>,

    /// Last issued tick number
    tick: u64,

    /// Published statuses
    board: StatusBoard,

    /// What the board last received for each live sequence
    published: HashMap<SequenceId, StatusStamp>,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(config: &EngineConfig, grammar: Arc<GrammarEngine>) -> Result<Self> {
        config.validate()?;
        if grammar.vocab_size() != config.vocab_size {
            return Err(Error::InvalidConfig(format!(
                "registry has {} tokens but vocab_size is {}",
                grammar.vocab_size(),
                config.vocab_size
            )));
        }
        Ok(Self {
            config: config.scheduler.clone(),
            worker_id: config.worker_id,
            grammar,
            cache: CacheManager::new(&config.cache, config.worker_id),
            rate_limiter: config.rate_limit.as_ref().map(RateLimiter::new),
            inbox: None,
            state: TickState {
                sequences: HashMap::new(),
                queue: RequestQueue::new(RequestQueueConfig {
                    max_size: config.scheduler.max_waiting,
                }),
                running: Vec::new(),
                speculative: SpeculativeEngine::new(config.speculative.clone()),
                migrations: HashMap::new(),
                retired: Vec::new(),
                stats: SchedulerStats::default(),
            },
            cancellations: Vec::new(),
            in_flight: None,
            tick: 0,
            board: StatusBoard::new(),
            published: HashMap::new(),
        })
    }

    /// Replace the speculation engine (e.g. to plug in a draft model)
    pub fn with_speculative_engine(mut self, engine: SpeculativeEngine) -> Self {
        self.state.speculative = engine;
        self
    }

    /// Receive migrations through `inbox`
    pub fn attach_inbox(&mut self, inbox: MigrationInbox) {
        self.inbox = Some(inbox);
    }

    fn ensure_idle(&self) -> Result<()> {
        match &self.in_flight {
            Some(in_flight) => Err(Error::TickInProgress(in_flight.plan.tick)),
            None => Ok(()),
        }
    }

    // ----------------------------------------------------------------------
    // Intake
    // ----------------------------------------------------------------------

    /// Submit a request
    pub fn submit(&mut self, request: SubmitRequest, now: Instant) -> Result<SequenceId> {
        self.submit_as(SequenceId::new(), request, now)
    }

    /// Submit a request under a pre-assigned sequence ID.
    ///
    /// A rejected request gets a `Failed` status on the board as well as the
    /// returned error, so asynchronous submitters learn about it too.
    pub fn submit_as(
        &mut self,
        id: SequenceId,
        request: SubmitRequest,
        now: Instant,
    ) -> Result<SequenceId> {
        self.ensure_idle()?;
        if self.state.sequences.contains_key(&id) || self.board.get(id).is_some() {
            return Err(Error::InvalidRequest(format!("sequence {id} already exists")));
        }
        let request_id = request.request_id;
        match self.enqueue(id, request, now) {
            Ok(()) => {
                self.state.stats.submitted += 1;
                if let Some(sequence) = self.state.sequences.get(&id) {
                    self.board.publish_all([sequence.status(0, false)]);
                }
                Ok(id)
            }
            Err(e) => {
                self.state.stats.rejected += 1;
                tracing::warn!("Rejected request {}: {}", request_id, e);
                self.board
                    .publish_all([rejection_status(id, request_id, &e)]);
                Err(e)
            }
        }
    }

    fn enqueue(&mut self, id: SequenceId, request: SubmitRequest, now: Instant) -> Result<()> {
        request.validate()?;
        if !self.state.queue.has_room() {
            return Err(Error::QueueFull);
        }
        // Prompts are admitted through the prefill pool, which never sees
        // the decode reserve.
        let needed = self.cache.blocks_for(request.prompt.len());
        let num_blocks = self.cache.num_blocks();
        let prefill_pool = num_blocks - self.config.placement.decode_reserve(num_blocks);
        if needed > prefill_pool {
            return Err(Error::OutOfCapacity {
                requested: needed,
                available: prefill_pool,
            });
        }
        let grammar = request
            .grammar
            .as_ref()
            .map(|spec| self.grammar.compile(spec))
            .transpose()?;
        if let Some(limiter) = &mut self.rate_limiter {
            limiter.charge(request.tenant.as_deref(), request.token_cost(), now)?;
        }

        let sequence = Sequence::from_request(id, request, grammar, now);
        self.state
            .queue
            .enqueue(queue_key(&sequence), Phase::Prefill)?;
        tracing::debug!(
            "Queued sequence {} ({:?}, {} prompt tokens)",
            id,
            sequence.priority,
            sequence.prompt.len()
        );
        self.state.sequences.insert(id, sequence);
        Ok(())
    }

    /// Cancel a sequence. Blocks are released at the next tick boundary;
    /// cancelling a finished sequence is a no-op.
    pub fn cancel(&mut self, id: SequenceId) -> Result<()> {
        if self.state.sequences.contains_key(&id) {
            if !self.cancellations.contains(&id) {
                self.cancellations.push(id);
            }
            return Ok(());
        }
        if self.board.get(id).is_some() {
            return Ok(());
        }
        Err(Error::SequenceNotFound(id))
    }

    /// Hand a sequence to another worker at the next tick boundary.
    ///
    /// Until the transfer resolves the sequence reports `Pending` with
    /// location `Migrating`. Failed attempts are retried with backoff while
    /// the sequence stays usable here.
    pub fn migrate(
        &mut self,
        id: SequenceId,
        target: Arc<dyn MigrationTarget>,
        now: Instant,
    ) -> Result<()> {
        self.ensure_idle()?;
        if target.worker_id() == self.worker_id {
            return Err(MigrationError::SameWorker(self.worker_id).into());
        }
        let sequence = self
            .state
            .sequences
            .get_mut(&id)
            .ok_or(Error::SequenceNotFound(id))?;
        sequence.location = Location::Migrating {
            to: target.worker_id(),
        };
        let status = sequence.status(self.cache.num_blocks_of(id), self.cache.has_snapshot(id));
        self.state.migrations.insert(
            id,
            PendingMigration {
                target,
                attempts: 0,
                next_attempt: now,
            },
        );
        self.board.publish_all([status]);
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Tick
    // ----------------------------------------------------------------------

    /// Plan the next tick.
    ///
    /// Returns an empty plan when there is nothing to run; otherwise the
    /// plan stays in flight until [`Scheduler::ingest`] or
    /// [`Scheduler::abort_tick`].
    pub fn schedule(&mut self, now: Instant) -> Result<StepPlan> {
        self.ensure_idle()?;
        self.tick += 1;
        let tick = self.tick;

        self.adopt_migrations();
        self.apply_cancellations()?;
        self.run_migrations(now)?;

        let checkpoint = self.checkpoint();
        match self.plan(tick, now) {
            Ok((plan, activity)) => {
                self.cache.publish(tick);
                self.publish();
                if !plan.is_empty() {
                    tracing::debug!(
                        "Tick {}: {} sequences, {} tokens, {} admitted, {} evicted",
                        tick,
                        plan.len(),
                        plan.num_tokens(),
                        activity.admitted,
                        activity.evicted
                    );
                    self.in_flight = Some(InFlight {
                        plan: plan.clone(),
                        checkpoint,
                        activity,
                    });
                }
                Ok(plan)
            }
            Err(e) => {
                tracing::warn!("Planning tick {} failed, rolling back: {}", tick, e);
                self.restore(checkpoint);
                self.state.stats.aborted_ticks += 1;
                self.publish();
                Err(e)
            }
        }
    }

    /// Apply the compute result of the in-flight tick.
    ///
    /// On an integration error the tick is rolled back to the state before
    /// it was planned. A sequence whose output broke its grammar is then
    /// failed; everything else is retried next tick.
    pub fn ingest(&mut self, result: StepResult) -> Result<TickSummary> {
        let Some(in_flight) = self.in_flight.take() else {
            return Err(Error::internal("no tick in flight"));
        };
        if result.tick != in_flight.plan.tick {
            let expected = in_flight.plan.tick;
            self.in_flight = Some(in_flight);
            return Err(Error::StaleTick {
                expected,
                actual: result.tick,
            });
        }

        let InFlight {
            plan,
            checkpoint,
            activity,
        } = in_flight;
        match self.apply(&plan, &result) {
            Ok(mut summary) => {
                summary.admitted = activity.admitted;
                summary.evicted = activity.evicted;
                summary.timed_out = activity.timed_out;
                summary.free_blocks = self.cache.num_free_blocks();
                self.state.stats.ticks += 1;
                self.state.stats.tokens_committed += summary.tokens_committed as u64;
                self.cache.publish(plan.tick);
                self.publish();
                Ok(summary)
            }
            Err(e) => {
                tracing::warn!("Tick {} aborted, rolling back: {}", plan.tick, e);
                self.restore(checkpoint);
                self.state.stats.aborted_ticks += 1;
                if let Error::GrammarViolation {
                    sequence: Some(id),
                    token,
                } = e.root()
                {
                    self.fail(*id, FailureReason::GrammarViolation { token: *token })?;
                }
                self.cache.publish(plan.tick);
                self.publish();
                Err(e)
            }
        }
    }

    /// Roll back the in-flight tick (e.g. after the compute step failed).
    /// Returns the aborted tick number.
    pub fn abort_tick(&mut self) -> Option<u64> {
        let in_flight = self.in_flight.take()?;
        let tick = in_flight.plan.tick;
        self.restore(in_flight.checkpoint);
        self.state.stats.aborted_ticks += 1;
        self.cache.publish(tick);
        self.publish();
        tracing::warn!("Tick {} aborted", tick);
        Some(tick)
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            state: self.state.clone(),
            cache: self.cache.checkpoint(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.state = checkpoint.state;
        self.cache.rollback(checkpoint.cache);
    }

    /// Write retired statuses and the live statuses that changed since the
    /// last publish
    fn publish(&mut self) {
        let retired = std::mem::take(&mut self.state.retired);
        let cache = &self.cache;
        let sequences = &self.state.sequences;
        let published = &mut self.published;
        published.retain(|id, _| sequences.contains_key(id));

        let changed: Vec<SequenceStatus> = sequences
            .values()
            .filter_map(|s| {
                let num_blocks = cache.num_blocks_of(s.id);
                let has_snapshot = cache.has_snapshot(s.id);
                let stamp = StatusStamp {
                    state: s.state(),
                    phase: s.phase,
                    generated: s.generated().len(),
                    num_blocks,
                    has_snapshot,
                    preemptions: s.preemptions,
                    location: s.location,
                };
                (published.insert(s.id, stamp) != Some(stamp))
                    .then(|| s.status(num_blocks, has_snapshot))
            })
            .collect();
        self.board.publish_all(retired.into_iter().chain(changed));
    }

    // ----------------------------------------------------------------------
    // Tick boundary
    // ----------------------------------------------------------------------

    fn adopt_migrations(&mut self) {
        let Some(inbox) = self.inbox.as_mut() else {
            return;
        };
        for payload in inbox.drain() {
            let id = payload.sequence_id;
            let source = payload.source;
            if self.state.sequences.contains_key(&id) {
                tracing::warn!(
                    "Dropping duplicate migration of sequence {} from {}",
                    id,
                    source
                );
                continue;
            }
            let (mut sequence, snapshot) = payload.into_sequence();
            sequence.num_computed = 0;
            let phase = if snapshot.num_tokens > 0 {
                self.cache.adopt_snapshot(snapshot);
                Phase::Decode
            } else {
                Phase::Prefill
            };
            sequence.phase = phase;
            self.state.queue.requeue(queue_key(&sequence), phase);
            self.state.sequences.insert(id, sequence);
            self.state.stats.migrated_in += 1;
            tracing::info!("Adopted sequence {} from {}", id, source);
        }
    }

    fn apply_cancellations(&mut self) -> Result<()> {
        for id in std::mem::take(&mut self.cancellations) {
            let Some(sequence) = self.state.sequences.get_mut(&id) else {
                continue;
            };
            if sequence.state().is_terminal() {
                continue;
            }
            sequence.transition(SequenceState::Cancelled)?;
            tracing::debug!("Cancelled sequence {}", id);
            self.retire(id)?;
        }
        Ok(())
    }

    fn run_migrations(&mut self, now: Instant) -> Result<()> {
        let due: Vec<SequenceId> = self
            .state
            .migrations
            .iter()
            .filter(|(_, m)| m.next_attempt <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in due {
            let Some(mut pending) = self.state.migrations.remove(&id) else {
                continue;
            };
            let Some(sequence) = self.state.sequences.get_mut(&id) else {
                continue;
            };
            let to = pending.target.worker_id();
            sequence.location = Location::Migrating { to };
            match self.cache.migrate(sequence, pending.target.as_ref()) {
                Ok(()) => {
                    sequence.location = Location::Migrated { to };
                    let status = sequence.status(0, false);
                    self.state.sequences.remove(&id);
                    self.state.running.retain(|r| *r != id);
                    self.state.queue.remove(id);
                    self.state.retired.push(status);
                    self.state.stats.migrated_out += 1;
                }
                Err(e) if e.is_transient() => {
                    sequence.location = Location::Local;
                    pending.attempts += 1;
                    let backoff = &self.config.migration_backoff;
                    if pending.attempts >= backoff.max_attempts {
                        tracing::warn!(
                            "Giving up migrating sequence {} to {} after {} attempts: {}",
                            id,
                            to,
                            pending.attempts,
                            e
                        );
                    } else {
                        pending.next_attempt = now + backoff.delay(pending.attempts);
                        tracing::warn!(
                            "Migration of sequence {} to {} failed (attempt {}), retrying: {}",
                            id,
                            to,
                            pending.attempts,
                            e
                        );
                        self.state.stats.migration_retries += 1;
                        self.state.migrations.insert(id, pending);
                    }
                }
                Err(e) => {
                    sequence.location = Location::Local;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Planning
    // ----------------------------------------------------------------------

    fn plan(&mut self, tick: u64, now: Instant) -> Result<(StepPlan, Activity)> {
        let mut activity = Activity {
            timed_out: self.expire(now)?,
            ..Default::default()
        };
        let mut touched = HashSet::new();
        let mut entries = Vec::new();

        self.plan_running(tick, &mut touched, &mut entries, &mut activity)?;
        self.admit(Phase::Decode, tick, &mut touched, &mut entries, &mut activity)?;
        self.admit(Phase::Prefill, tick, &mut touched, &mut entries, &mut activity)?;

        let plan = StepPlan { tick, entries };
        self.check_plan(&plan)?;
        Ok((plan, activity))
    }

    fn expire(&mut self, now: Instant) -> Result<usize> {
        let expired: Vec<SequenceId> = self
            .state
            .queue
            .ids()
            .into_iter()
            .filter(|id| {
                self.state
                    .sequences
                    .get(id)
                    .is_some_and(|s| s.is_expired(now))
            })
            .collect();
        for id in &expired {
            if let Some(sequence) = self.state.sequences.get_mut(id) {
                sequence.transition(SequenceState::Timeout)?;
            }
            tracing::info!("Sequence {} timed out waiting for admission", id);
            self.retire(*id)?;
        }
        Ok(expired.len())
    }

    /// Masks for every output position of a step: the root state's, then one
    /// per drafted node reached by advancing along its path
    fn masks_for(
        &self,
        state: &GrammarState,
        draft: Option<&SpeculationTree>,
    ) -> Result<Vec<Arc<TokenMask>>> {
        let Some(tree) = draft else {
            return Ok(vec![self.grammar.mask(state)]);
        };
        let mut states = Vec::with_capacity(tree.len());
        states.push(state.clone());
        for node in &tree.nodes()[1..] {
            let next = self.grammar.advance(&states[node.parent], node.token)?;
            states.push(next);
        }
        Ok(states.iter().map(|s| self.grammar.mask(s)).collect())
    }

    fn plan_running(
        &mut self,
        tick: u64,
        touched: &mut HashSet<SequenceId>,
        entries: &mut Vec<PlanEntry>,
        activity: &mut Activity,
    ) -> Result<()> {
        let mut order = self.state.running.clone();
        order.sort_by_key(|id| {
            self.state
                .sequences
                .get(id)
                .map(|s| (s.priority, s.arrival_time, s.id))
        });

        for id in order {
            let (priority, context, grammar, budget, num_computed, phase) =
                match self.state.sequences.get(&id) {
                    Some(s) if s.state() == SequenceState::Running => (
                        s.priority,
                        s.context(),
                        s.grammar.clone(),
                        s.speculation_budget,
                        s.num_computed,
                        s.phase,
                    ),
                    _ => continue,
                };
            let len = context.len();
            if self.cache.blocks_for(len) > self.cache.num_blocks() {
                self.fail(id, FailureReason::OutOfCapacity)?;
                continue;
            }

            let mut draft = if budget > 0 {
                let constraint = grammar.as_ref().map(|g| (self.grammar.as_ref(), g));
                self.state.speculative.draft(&context, budget, constraint)
            } else {
                None
            };
            let mut masks = match &grammar {
                Some(state) => match self.masks_for(state, draft.as_ref()) {
                    Ok(masks) => masks,
                    Err(_) => {
                        draft = None;
                        self.masks_for(state, None)?
                    }
                },
                None => Vec::new(),
            };
            if masks.first().is_some_and(|m| m.is_empty()) {
                self.fail(id, empty_grammar())?;
                continue;
            }

            let held = self.cache.num_blocks_of(id);
            let drafts = draft.as_ref().map_or(0, SpeculationTree::num_drafts);
            let mut need = self.cache.blocks_for(len + drafts).saturating_sub(held);
            if need > self.cache.num_free_blocks() && draft.is_some() {
                draft = None;
                masks.truncate(1);
                need = self.cache.blocks_for(len).saturating_sub(held);
            }
            if need > self.cache.num_free_blocks() {
                let shortfall = need - self.cache.num_free_blocks();
                // Equal-priority peers that arrived later may be displaced so
                // a full pool of one band still makes progress.
                match self.make_room(id, shortfall, touched, |p| !p.outranks(priority))? {
                    Some(victims) => {
                        activity.evicted += victims.len();
                        touched.extend(victims);
                    }
                    None => {
                        tracing::debug!(
                            "Sequence {} stalls this tick: {} blocks short",
                            id,
                            shortfall
                        );
                        continue;
                    }
                }
            }
            self.cache.acquire(id, need)?;

            let start = num_computed.min(len - 1);
            if let Some(sequence) = self.state.sequences.get_mut(&id) {
                sequence.last_scheduled_tick = Some(tick);
            }
            entries.push(PlanEntry {
                sequence_id: id,
                phase,
                input_tokens: context[start..].to_vec(),
                start_position: start,
                block_table: self.cache.blocks_of(id).to_vec(),
                restore: None,
                draft,
                masks,
                newly_admitted: false,
            });
            touched.insert(id);
        }
        Ok(())
    }

    /// Fresh blocks and input tokens needed to (re)admit a sequence
    fn admission_cost(
        &self,
        context: &[TokenId],
        total_blocks: usize,
        restore: Option<usize>,
    ) -> (usize, usize) {
        let len = context.len();
        match restore {
            Some(materialized) => (total_blocks, len - materialized.min(len - 1)),
            None => {
                let fresh = self.cache.prompt_cost(&context[..len - 1], total_blocks);
                let shared = (total_blocks - fresh) * self.cache.block_size();
                (fresh, len - shared.min(len - 1))
            }
        }
    }

    /// Free blocks available to admissions of a phase
    fn admission_limit(&self, phase: Phase) -> usize {
        let free = self.cache.num_free_blocks();
        match phase {
            Phase::Prefill => {
                let reserve = self.config.placement.decode_reserve(self.cache.num_blocks());
                free.saturating_sub(reserve)
            }
            Phase::Decode => free,
        }
    }

    fn admit(
        &mut self,
        queue: Phase,
        tick: u64,
        touched: &mut HashSet<SequenceId>,
        entries: &mut Vec<PlanEntry>,
        activity: &mut Activity,
    ) -> Result<()> {
        let keys: Vec<QueueKey> = self.state.queue.iter(queue).copied().collect();
        let mut prefill_tokens: usize = entries
            .iter()
            .filter(|e| e.phase == Phase::Prefill)
            .map(PlanEntry::token_budget)
            .sum();

        for key in keys {
            let id = key.sequence_id;
            if touched.contains(&id) {
                continue;
            }
            if self.state.running.len() >= self.config.max_num_seqs {
                break;
            }
            let Some((context, grammar, priority)) = self
                .state
                .sequences
                .get(&id)
                .map(|s| (s.context(), s.grammar.clone(), s.priority))
            else {
                self.state.queue.remove(id);
                continue;
            };

            let mask = match &grammar {
                Some(state) => {
                    let mask = self.grammar.mask(state);
                    if mask.is_empty() {
                        self.fail(id, empty_grammar())?;
                        continue;
                    }
                    Some(mask)
                }
                None => None,
            };

            let len = context.len();
            let total = self.cache.blocks_for(len);
            let restore = self.cache.snapshot_tokens(id).filter(|n| *n > 0);
            let phase = if restore.is_some() {
                Phase::Decode
            } else {
                Phase::Prefill
            };
            let (mut fresh, feed) = self.admission_cost(&context, total, restore);
            if phase == Phase::Prefill
                && prefill_tokens > 0
                && prefill_tokens + feed > self.config.placement.max_prefill_tokens_per_tick
            {
                break;
            }
            if fresh > self.admission_limit(phase) {
                let shortfall = fresh - self.admission_limit(phase);
                // Running work planned earlier this tick may still be displaced
                // by a strictly more urgent arrival; admissions may not.
                let protected: HashSet<SequenceId> = entries
                    .iter()
                    .filter(|e| e.newly_admitted)
                    .map(|e| e.sequence_id)
                    .collect();
                match self.make_room(id, shortfall, &protected, |p| priority.outranks(p))? {
                    Some(victims) => {
                        activity.evicted += victims.len();
                        entries.retain(|e| !victims.contains(&e.sequence_id));
                        touched.extend(victims);
                    }
                    None => {
                        tracing::debug!(
                            "Sequence {} not admitted this tick: {} blocks short",
                            id,
                            shortfall
                        );
                        break;
                    }
                }
                fresh = self.admission_cost(&context, total, restore).0;
                if fresh > self.admission_limit(phase) {
                    break;
                }
            }

            self.state.queue.remove(id);
            let (num_computed, restore_tokens) = match restore {
                Some(_) => {
                    self.cache.acquire(id, total)?;
                    let tokens = self.cache.take_snapshot(id)?.unwrap_or_default();
                    if tokens.len() >= len || tokens[..] != context[..tokens.len()] {
                        return Err(Error::invariant(format!(
                            "snapshot of sequence {id} does not match its context"
                        )));
                    }
                    (tokens.len(), Some(tokens))
                }
                None => {
                    self.cache.discard_snapshot(id);
                    let shared = self.cache.acquire_for_prompt(id, &context[..len - 1], total)?;
                    (shared, None)
                }
            };

            let Some(sequence) = self.state.sequences.get_mut(&id) else {
                continue;
            };
            sequence.transition(SequenceState::Running)?;
            sequence.num_computed = num_computed;
            sequence.phase = phase;
            sequence.last_scheduled_tick = Some(tick);
            if sequence.preemptions > 0 || phase == Phase::Decode {
                tracing::debug!(
                    "Resumed sequence {} with {} of {} tokens materialized",
                    id,
                    num_computed,
                    len
                );
            }
            self.state.running.push(id);
            self.state.stats.admitted += 1;
            activity.admitted += 1;

            let input_tokens = context[num_computed..].to_vec();
            if phase == Phase::Prefill {
                prefill_tokens += input_tokens.len();
            }
            entries.push(PlanEntry {
                sequence_id: id,
                phase,
                input_tokens,
                start_position: num_computed,
                block_table: self.cache.blocks_of(id).to_vec(),
                restore: restore_tokens,
                draft: None,
                masks: mask.into_iter().collect(),
                newly_admitted: true,
            });
            touched.insert(id);
        }
        Ok(())
    }

    /// Preempt running sequences allowed by `eligible` until `shortfall`
    /// blocks are free. Returns the victims, or `None` (and preempts
    /// nothing) when even all eligible sequences would not free enough.
    fn make_room(
        &mut self,
        requester: SequenceId,
        shortfall: usize,
        protected: &HashSet<SequenceId>,
        eligible: impl Fn(Priority) -> bool,
    ) -> Result<Option<Vec<SequenceId>>> {
        if !self.config.enable_preemption {
            return Ok(None);
        }
        let candidates: Vec<EvictionCandidate> = self
            .state
            .running
            .iter()
            .filter(|id| **id != requester && !protected.contains(id))
            .filter_map(|id| self.state.sequences.get(id))
            .filter(|s| eligible(s.priority))
            .map(|s| EvictionCandidate {
                sequence_id: s.id,
                priority: s.priority,
                last_scheduled_tick: s.last_scheduled_tick,
                footprint: self.cache.footprint(s.id),
            })
            .collect();
        let Some(victims) = select_victims(candidates, shortfall) else {
            return Ok(None);
        };
        for victim in &victims {
            self.preempt(*victim)?;
        }
        Ok(Some(victims))
    }

    /// RUNNING -> PENDING, keeping a snapshot of the materialized content
    fn preempt(&mut self, id: SequenceId) -> Result<()> {
        let sequence = self
            .state
            .sequences
            .get_mut(&id)
            .ok_or(Error::SequenceNotFound(id))?;
        let context = sequence.context();
        let materialized = &context[..sequence.num_computed.min(context.len())];
        self.cache.evict(id, materialized)?;
        sequence.transition(SequenceState::Pending)?;
        sequence.num_computed = 0;
        tracing::info!(
            "Preempted sequence {} ({:?}, {} tokens materialized)",
            id,
            sequence.priority,
            materialized.len()
        );
        let key = queue_key(sequence);
        self.state.running.retain(|r| *r != id);
        self.state.queue.requeue(key, Phase::Decode);
        self.state.stats.preemptions += 1;
        Ok(())
    }

    fn check_plan(&self, plan: &StepPlan) -> Result<()> {
        plan.validate(|block| self.cache.pool().ref_count(block))?;
        let block_size = self.cache.block_size();
        for entry in &plan.entries {
            let slots = entry.block_table.len() * block_size;
            if entry.start_position + entry.token_budget() > slots {
                return Err(Error::invariant(format!(
                    "sequence {} plans {} positions over {} slots",
                    entry.sequence_id,
                    entry.start_position + entry.token_budget(),
                    slots
                )));
            }
        }
        self.cache.verify()
    }

    // ----------------------------------------------------------------------
    // Ingest
    // ----------------------------------------------------------------------

    fn apply(&mut self, plan: &StepPlan, result: &StepResult) -> Result<TickSummary> {
        let mut summary = TickSummary {
            tick: plan.tick,
            worker_id: self.worker_id,
            planned: plan.len(),
            ..Default::default()
        };
        for entry in &plan.entries {
            let id = entry.sequence_id;
            let output = result.outputs.get(&id).ok_or(Error::MissingOutput(id))?;
            let targets = output.resolve(entry)?;
            for (position, token) in targets.iter().enumerate() {
                if entry.mask(position).is_some_and(|m| !m.contains(*token)) {
                    return Err(Error::GrammarViolation {
                        sequence: Some(id),
                        token: *token,
                    });
                }
            }

            let committed = match &entry.draft {
                Some(tree) => {
                    let verification = verify(tree, &targets)?;
                    self.state.speculative.record(tree.depth(), &verification);
                    summary.drafted += verification.num_drafted;
                    summary.accepted += verification.num_accepted();
                    verification.committed
                }
                None => targets
                    .first()
                    .map(|t| vec![*t])
                    .ok_or(Error::MissingOutput(id))?,
            };
            let fed = entry.start_position + entry.input_tokens.len();
            if self.commit(id, &committed, fed, &mut summary)? {
                summary.finished += 1;
            }
        }
        Ok(summary)
    }

    /// Append committed tokens; returns true if the sequence finished.
    ///
    /// Only the `fed` positions that were model input count as materialized.
    /// Accepted drafts were computed along a tree branch and are fed again
    /// on the next step.
    fn commit(
        &mut self,
        id: SequenceId,
        tokens: &[TokenId],
        fed: usize,
        summary: &mut TickSummary,
    ) -> Result<bool> {
        let eos = self.grammar.registry().eos_token_id();
        let sequence = self
            .state
            .sequences
            .get_mut(&id)
            .ok_or(Error::SequenceNotFound(id))?;
        if sequence.state() != SequenceState::Running {
            return Err(Error::invariant(format!(
                "output for sequence {id} which is not running"
            )));
        }

        let mut finish = None;
        for &token in tokens {
            if let Some(state) = &sequence.grammar {
                let next = self.grammar.advance(state, token).map_err(|e| match e {
                    Error::GrammarViolation { token, .. } => Error::GrammarViolation {
                        sequence: Some(id),
                        token,
                    },
                    other => other,
                })?;
                sequence.grammar = Some(next);
            }
            if token == eos {
                finish = Some(FinishReason::Stop);
                break;
            }
            sequence.append_tokens(&[token]);
            summary.tokens_committed += 1;
            if sequence.generated().len() >= sequence.max_new_tokens {
                finish = Some(FinishReason::Length);
                break;
            }
            if sequence
                .grammar
                .as_ref()
                .is_some_and(GrammarState::is_complete)
            {
                finish = Some(FinishReason::GrammarComplete);
                break;
            }
        }
        sequence.phase = Phase::Decode;
        sequence.num_computed = fed.min(sequence.len() - 1);

        match finish {
            Some(reason) => {
                sequence.finish_reason = Some(reason);
                sequence.transition(SequenceState::Completed)?;
                tracing::debug!(
                    "Sequence {} completed ({:?}) with {} tokens",
                    id,
                    reason,
                    sequence.generated().len()
                );
                self.retire(id)?;
                Ok(true)
            }
            None => {
                let context = sequence.context();
                let computed = sequence.num_computed;
                self.cache.seal_computed(id, &context, computed)?;
                self.cache.trim(id, self.cache.blocks_for(context.len()))?;
                Ok(false)
            }
        }
    }

    /// Fail a live sequence and release everything it holds
    fn fail(&mut self, id: SequenceId, reason: FailureReason) -> Result<()> {
        if let Some(sequence) = self.state.sequences.get_mut(&id) {
            tracing::warn!("Sequence {} failed: {:?}", id, reason);
            sequence.failure = Some(reason);
            sequence.transition(SequenceState::Failed)?;
        }
        self.retire(id)
    }

    /// Drop a terminal sequence from the live set, keeping its final status
    fn retire(&mut self, id: SequenceId) -> Result<()> {
        self.cache.release(id)?;
        self.cache.discard_snapshot(id);
        self.state.queue.remove(id);
        self.state.running.retain(|r| *r != id);
        self.state.migrations.remove(&id);
        if let Some(sequence) = self.state.sequences.remove(&id) {
            let stats = &mut self.state.stats;
            match sequence.state() {
                SequenceState::Completed => stats.completed += 1,
                SequenceState::Failed => stats.failed += 1,
                SequenceState::Cancelled => stats.cancelled += 1,
                SequenceState::Timeout => stats.timed_out += 1,
                SequenceState::Pending | SequenceState::Running => {}
            }
            self.state.retired.push(sequence.status(0, false));
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Queries
    // ----------------------------------------------------------------------

    /// Last issued tick number
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// This replica
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Tick awaiting its result, if any
    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|f| f.plan.tick)
    }

    /// Live sequence
    pub fn sequence(&self, id: SequenceId) -> Option<&Sequence> {
        self.state.sequences.get(&id)
    }

    /// Current status of a live or finished sequence
    pub fn status(&self, id: SequenceId) -> Option<SequenceStatus> {
        match self.state.sequences.get(&id) {
            Some(s) => Some(s.status(
                self.cache.num_blocks_of(id),
                self.cache.has_snapshot(id),
            )),
            None => self.board.get(id),
        }
    }

    /// Number of running sequences
    pub fn num_running(&self) -> usize {
        self.state.running.len()
    }

    /// Number of waiting sequences
    pub fn num_waiting(&self) -> usize {
        self.state.queue.len()
    }

    /// Whether anything is left to schedule
    pub fn has_work(&self) -> bool {
        !self.state.sequences.is_empty() || !self.cancellations.is_empty()
    }

    /// Cache manager (read-only)
    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Handle for concurrent capacity readers
    pub fn capacity_view(&self) -> CapacityView {
        self.cache.view()
    }

    /// Published statuses
    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    /// Grammar engine
    pub fn grammar(&self) -> &Arc<GrammarEngine> {
        &self.grammar
    }

    /// Speculation counters
    pub fn speculative_stats(&self) -> &SpeculativeStats {
        self.state.speculative.stats()
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self.state.stats.clone();
        stats.running = self.state.running.len();
        stats.waiting_prefill = self.state.queue.len_of(Phase::Prefill);
        stats.waiting_decode = self.state.queue.len_of(Phase::Decode);
        stats
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_id", &self.worker_id)
            .field("tick", &self.tick)
            .field("running", &self.state.running.len())
            .field("waiting", &self.state.queue.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
