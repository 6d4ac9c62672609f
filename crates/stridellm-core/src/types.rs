//! Core types for the StrideLLM serving core

use crate::error::{Error, Result};
use crate::grammar::{GrammarSpec, GrammarState};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Token ID type
pub type TokenId = u32;

/// Index of a block in the cache pool arena
pub type BlockId = usize;

/// Unique identifier for a client request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new random request ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceId(u64);

impl SequenceId {
    /// Allocate a new process-unique sequence ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw ID (for IDs minted by another worker)
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SequenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SequenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an engine replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Request priority. Lower variants are more urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Must run before anything else
    Critical = 0,
    /// Latency-sensitive traffic
    High = 1,
    /// Default priority
    #[default]
    Normal = 2,
    /// Background traffic
    Low = 3,
    /// Only runs on otherwise idle capacity
    Idle = 4,
}

impl Priority {
    /// All priorities from most to least urgent
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Idle,
    ];

    /// True if `self` strictly outranks `other`
    pub fn outranks(&self, other: Priority) -> bool {
        *self < other
    }
}

/// Lifecycle state of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceState {
    /// Waiting for admission (new, preempted or migrating)
    Pending,
    /// Holds cache blocks and is part of the batch
    Running,
    /// Finished normally
    Completed,
    /// Aborted by a server-side fault
    Failed,
    /// Cancelled by the client
    Cancelled,
    /// Admission deadline expired
    Timeout,
}

impl SequenceState {
    /// Check if the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SequenceState::Completed
                | SequenceState::Failed
                | SequenceState::Cancelled
                | SequenceState::Timeout
        )
    }

    /// Whether `self -> to` is a legal transition
    pub fn can_transition_to(&self, to: SequenceState) -> bool {
        use SequenceState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Timeout)
                | (Pending, Failed)
                | (Running, Pending)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Timeout)
        )
    }
}

/// Placement tag for disaggregated scheduling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Prompt not yet materialized in the cache (compute-bound)
    Prefill,
    /// Generating token by token (memory-bound)
    Decode,
}

/// Why a sequence ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Tenant budget exhausted at submission
    RateLimited,
    /// Sequence can never fit in the cache pool
    OutOfCapacity,
    /// Compute output disagreed with the grammar mask
    GrammarViolation {
        /// Token the compute step produced
        token: TokenId,
    },
    /// Grammar could not be compiled
    InvalidGrammar {
        /// Compiler diagnostic
        message: String,
    },
    /// Any other server fault
    ServerFault {
        /// Description of the fault
        message: String,
    },
}

/// Why a sequence completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// End-of-sequence token produced
    Stop,
    /// Reached `max_new_tokens`
    Length,
    /// Grammar admits no further tokens
    GrammarComplete,
}

/// Where a sequence currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    /// Owned by this worker
    Local,
    /// Transfer to another worker in progress
    Migrating {
        /// Receiving worker
        to: WorkerId,
    },
    /// Ownership moved to another worker
    Migrated {
        /// Worker that now owns the sequence
        to: WorkerId,
    },
}

/// Submission message accepted from the wire layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Client-visible request ID
    #[serde(default)]
    pub request_id: RequestId,

    /// Tenant for rate limiting
    #[serde(default)]
    pub tenant: Option<String>,

    /// Prompt token IDs
    pub prompt: Vec<TokenId>,

    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,

    /// Output constraint
    #[serde(default)]
    pub grammar: Option<GrammarSpec>,

    /// Maximum drafted tokens per step (0 disables speculation)
    #[serde(default)]
    pub speculation_budget: usize,

    /// Admission deadline relative to submission
    #[serde(default)]
    pub deadline: Option<Duration>,

    /// Generation length limit
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
}

fn default_max_new_tokens() -> usize {
    256
}

impl SubmitRequest {
    /// Create a new request from tokenized input
    pub fn new(prompt: Vec<TokenId>) -> Self {
        Self {
            request_id: RequestId::new(),
            tenant: None,
            prompt,
            priority: Priority::Normal,
            grammar: None,
            speculation_budget: 0,
            deadline: None,
            max_new_tokens: default_max_new_tokens(),
        }
    }

    /// Set priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set tenant
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Constrain output with a grammar
    pub fn with_grammar(mut self, grammar: GrammarSpec) -> Self {
        self.grammar = Some(grammar);
        self
    }

    /// Set the speculation budget
    pub fn with_speculation_budget(mut self, budget: usize) -> Self {
        self.speculation_budget = budget;
        self
    }

    /// Set the admission deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the generation length limit
    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Tokens charged against a tenant budget
    pub fn token_cost(&self) -> usize {
        self.prompt.len() + self.max_new_tokens
    }

    /// Basic shape validation
    pub fn validate(&self) -> Result<()> {
        if self.prompt.is_empty() {
            return Err(Error::InvalidRequest("prompt is empty".to_string()));
        }
        if self.max_new_tokens == 0 {
            return Err(Error::InvalidRequest(
                "max_new_tokens must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Status message polled or streamed by the wire layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStatus {
    /// Sequence ID
    pub sequence_id: SequenceId,

    /// Client request ID
    pub request_id: RequestId,

    /// Lifecycle state
    pub state: SequenceState,

    /// Placement tag
    pub phase: Phase,

    /// Generated tokens so far (empty on timeout)
    pub generated: Vec<TokenId>,

    /// Number of cache blocks held
    pub num_blocks: usize,

    /// Whether an eviction snapshot is held for resumption
    pub has_snapshot: bool,

    /// Number of preemptions so far
    pub preemptions: usize,

    /// Where the sequence lives
    pub location: Location,

    /// Set when finished
    pub finish_reason: Option<FinishReason>,

    /// Set when failed
    pub failure: Option<FailureReason>,
}

/// A generation sequence owned by the scheduler
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Unique sequence ID
    pub id: SequenceId,

    /// Client request ID
    pub request_id: RequestId,

    /// Tenant for rate limiting
    pub tenant: Option<String>,

    /// Scheduling priority
    pub priority: Priority,

    /// Lifecycle state
    state: SequenceState,

    /// Placement tag
    pub phase: Phase,

    /// Prompt token IDs, shared with checkpoints
    pub prompt: Arc<[TokenId]>,

    /// Generated token IDs (append-only). Checkpoints share the buffer until
    /// the next append.
    generated: Arc<Vec<TokenId>>,

    /// Arrival time
    pub arrival_time: Instant,

    /// Admission deadline
    pub deadline: Option<Instant>,

    /// Grammar automaton position
    pub grammar: Option<GrammarState>,

    /// Maximum drafted tokens per step
    pub speculation_budget: usize,

    /// Generation length limit
    pub max_new_tokens: usize,

    /// Tokens whose cache state is materialized
    pub num_computed: usize,

    /// Tick at which the sequence was last part of a plan
    pub last_scheduled_tick: Option<u64>,

    /// Number of RUNNING -> PENDING preemptions
    pub preemptions: usize,

    /// Where the sequence lives
    pub location: Location,

    /// Set when finished
    pub finish_reason: Option<FinishReason>,

    /// Set when failed
    pub failure: Option<FailureReason>,
}

impl Sequence {
    /// Create a pending sequence from a submission
    pub fn from_request(
        id: SequenceId,
        request: SubmitRequest,
        grammar: Option<GrammarState>,
        arrival_time: Instant,
    ) -> Self {
        Self {
            id,
            request_id: request.request_id,
            tenant: request.tenant,
            priority: request.priority,
            state: SequenceState::Pending,
            phase: Phase::Prefill,
            prompt: request.prompt.into(),
            generated: Arc::default(),
            arrival_time,
            deadline: request.deadline.map(|d| arrival_time + d),
            grammar,
            speculation_budget: request.speculation_budget,
            max_new_tokens: request.max_new_tokens,
            num_computed: 0,
            last_scheduled_tick: None,
            preemptions: 0,
            location: Location::Local,
            finish_reason: None,
            failure: None,
        }
    }

    /// Current state
    pub fn state(&self) -> SequenceState {
        self.state
    }

    /// Move to a new state, rejecting illegal transitions
    pub fn transition(&mut self, to: SequenceState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                sequence: self.id,
                from: self.state,
                to,
            });
        }
        if self.state == SequenceState::Running && to == SequenceState::Pending {
            self.preemptions += 1;
        }
        self.state = to;
        Ok(())
    }

    /// Generated tokens
    pub fn generated(&self) -> &[TokenId] {
        &self.generated
    }

    /// Append committed tokens
    pub fn append_tokens(&mut self, tokens: &[TokenId]) {
        if !tokens.is_empty() {
            Arc::make_mut(&mut self.generated).extend_from_slice(tokens);
        }
    }

    /// Total length (prompt + generated)
    pub fn len(&self) -> usize {
        self.prompt.len() + self.generated.len()
    }

    /// Check if the sequence has no tokens
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full token context (prompt followed by generated tokens)
    pub fn context(&self) -> Vec<TokenId> {
        let mut tokens = Vec::with_capacity(self.len());
        tokens.extend_from_slice(&self.prompt);
        tokens.extend_from_slice(&self.generated);
        tokens
    }

    /// Last token of the context
    pub fn last_token(&self) -> Option<TokenId> {
        self.generated.last().or_else(|| self.prompt.last()).copied()
    }

    /// Tokens that still need to be fed to the model
    pub fn uncomputed(&self) -> usize {
        self.len().saturating_sub(self.num_computed)
    }

    /// Whether the admission deadline has passed
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Build the externally visible status
    pub fn status(&self, num_blocks: usize, has_snapshot: bool) -> SequenceStatus {
        let state = match self.location {
            Location::Migrating { .. } | Location::Migrated { .. } => SequenceState::Pending,
            _ => self.state,
        };
        let generated = if self.state == SequenceState::Timeout {
            Vec::new()
        } else {
            self.generated.to_vec()
        };
        SequenceStatus {
            sequence_id: self.id,
            request_id: self.request_id,
            state,
            phase: self.phase,
            generated,
            num_blocks,
            has_snapshot,
            preemptions: self.preemptions,
            location: self.location,
            finish_reason: self.finish_reason,
            failure: self.failure.clone(),
        }
    }
}
