//! Waiting Queues
//!
//! Pending sequences wait in one of two queues keyed by their placement tag:
//! new prompts in the prefill queue, preempted and migrated-in sequences in
//! the decode queue. Within a queue, order is (priority, arrival, id): a
//! lower priority value wins, FCFS within a band.

use crate::error::{Error, Result};
use crate::types::{Phase, Priority, SequenceId};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

/// Ordering key of a waiting sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueKey {
    /// Scheduling priority
    pub priority: Priority,

    /// Original arrival time
    pub arrival: Instant,

    /// Tie breaker
    pub sequence_id: SequenceId,
}

/// Configuration for the waiting queues
#[derive(Debug, Clone, Copy)]
pub struct RequestQueueConfig {
    /// Maximum number of new submissions waiting (0 = unlimited)
    pub max_size: usize,
}

/// Priority-ordered waiting queues for both phases
#[derive(Debug, Clone)]
pub struct RequestQueue {
    /// Configuration
    config: RequestQueueConfig,

    /// Prompts that still need prefill
    prefill: BTreeSet<QueueKey>,

    /// Sequences resuming generation
    decode: BTreeSet<QueueKey>,

    /// Lookup (ID -> key and queue)
    index: HashMap<SequenceId, (QueueKey, Phase)>,
}

impl RequestQueue {
    /// Create empty queues
    pub fn new(config: RequestQueueConfig) -> Self {
        Self {
            config,
            prefill: BTreeSet::new(),
            decode: BTreeSet::new(),
            index: HashMap::new(),
        }
    }

    fn queue_mut(&mut self, phase: Phase) -> &mut BTreeSet<QueueKey> {
        match phase {
            Phase::Prefill => &mut self.prefill,
            Phase::Decode => &mut self.decode,
        }
    }

    fn queue(&self, phase: Phase) -> &BTreeSet<QueueKey> {
        match phase {
            Phase::Prefill => &self.prefill,
            Phase::Decode => &self.decode,
        }
    }

    /// Whether a new submission may be queued
    pub fn has_room(&self) -> bool {
        self.config.max_size == 0 || self.len() < self.config.max_size
    }

    /// Queue a new submission, enforcing the size bound
    pub fn enqueue(&mut self, key: QueueKey, phase: Phase) -> Result<()> {
        if !self.has_room() {
            return Err(Error::QueueFull);
        }
        self.requeue(key, phase);
        Ok(())
    }

    /// Queue a sequence that was already admitted once. Never rejected: a
    /// preempted sequence must always have somewhere to go.
    pub fn requeue(&mut self, key: QueueKey, phase: Phase) {
        self.remove(key.sequence_id);
        self.queue_mut(phase).insert(key);
        self.index.insert(key.sequence_id, (key, phase));
    }

    /// Remove a sequence from whichever queue holds it
    pub fn remove(&mut self, id: SequenceId) -> bool {
        match self.index.remove(&id) {
            Some((key, phase)) => self.queue_mut(phase).remove(&key),
            None => false,
        }
    }

    /// Head of a queue
    pub fn peek(&self, phase: Phase) -> Option<QueueKey> {
        self.queue(phase).first().copied()
    }

    /// Queued sequences of a phase in admission order
    pub fn iter(&self, phase: Phase) -> impl Iterator<Item = &QueueKey> {
        self.queue(phase).iter()
    }

    /// All queued sequence IDs
    pub fn ids(&self) -> Vec<SequenceId> {
        self.index.keys().copied().collect()
    }

    /// Check whether a sequence is queued
    pub fn contains(&self, id: SequenceId) -> bool {
        self.index.contains_key(&id)
    }

    /// Phase queue holding a sequence
    pub fn phase_of(&self, id: SequenceId) -> Option<Phase> {
        self.index.get(&id).map(|(_, phase)| *phase)
    }

    /// Total number of waiting sequences
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Number of waiting sequences in one phase
    pub fn len_of(&self, phase: Phase) -> usize {
        self.queue(phase).len()
    }

    /// Check if both queues are empty
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
