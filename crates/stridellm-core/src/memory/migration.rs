//! Cross-worker sequence migration
//!
//! A migrating sequence travels as a [`MigrationPayload`]: its metadata,
//! committed tokens, grammar position and a snapshot of its materialized
//! cache content. Replicas exchange payloads through [`MigrationTarget`]
//! implementations; [`ReplicaLink`] is the in-process one, backed by a
//! bounded channel drained by the receiving scheduler at its next tick.

use super::snapshot::CompressedSnapshot;
use crate::error::MigrationError;
use crate::grammar::GrammarState;
use crate::types::{
    Phase, Priority, RequestId, Sequence, SequenceId, SubmitRequest, TokenId, WorkerId,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Everything a replica needs to continue a sequence
#[derive(Debug, Clone)]
pub struct MigrationPayload {
    /// Sending worker
    pub source: WorkerId,

    /// Sequence ID (kept across workers)
    pub sequence_id: SequenceId,

    /// Client request ID
    pub request_id: RequestId,

    /// Tenant for rate limiting
    pub tenant: Option<String>,

    /// Scheduling priority
    pub priority: Priority,

    /// Prompt token IDs
    pub prompt: Arc<[TokenId]>,

    /// Tokens generated so far
    pub generated: Vec<TokenId>,

    /// Grammar position after the last committed token
    pub grammar: Option<GrammarState>,

    /// Maximum drafted tokens per step
    pub speculation_budget: usize,

    /// Generation length limit
    pub max_new_tokens: usize,

    /// Preemptions suffered so far
    pub preemptions: usize,

    /// Original arrival, so FCFS order survives the move
    pub arrival_time: Instant,

    /// Admission deadline, unchanged by the move
    pub deadline: Option<Instant>,

    /// Materialized cache content
    pub snapshot: CompressedSnapshot,
}

impl MigrationPayload {
    /// Capture a sequence for transfer
    pub fn capture(source: WorkerId, sequence: &Sequence, snapshot: CompressedSnapshot) -> Self {
        Self {
            source,
            sequence_id: sequence.id,
            request_id: sequence.request_id,
            tenant: sequence.tenant.clone(),
            priority: sequence.priority,
            prompt: sequence.prompt.clone(),
            generated: sequence.generated().to_vec(),
            grammar: sequence.grammar.clone(),
            speculation_budget: sequence.speculation_budget,
            max_new_tokens: sequence.max_new_tokens,
            preemptions: sequence.preemptions,
            arrival_time: sequence.arrival_time,
            deadline: sequence.deadline,
            snapshot,
        }
    }

    /// Rebuild the sequence on the receiving side as a pending decode
    /// sequence. Time spent in transit counts against the deadline.
    pub fn into_sequence(self) -> (Sequence, CompressedSnapshot) {
        let request = SubmitRequest {
            request_id: self.request_id,
            tenant: self.tenant,
            prompt: Vec::new(),
            priority: self.priority,
            grammar: None,
            speculation_budget: self.speculation_budget,
            deadline: None,
            max_new_tokens: self.max_new_tokens,
        };
        let mut sequence =
            Sequence::from_request(self.sequence_id, request, self.grammar, self.arrival_time);
        sequence.prompt = self.prompt;
        sequence.deadline = self.deadline;
        sequence.append_tokens(&self.generated);
        sequence.phase = Phase::Decode;
        sequence.preemptions = self.preemptions;
        (sequence, self.snapshot)
    }
}

/// Destination of a migration
pub trait MigrationTarget: Send + Sync {
    /// Worker behind this target
    fn worker_id(&self) -> WorkerId;

    /// Hand the payload over. Must not block; a full target reports
    /// [`MigrationError::TargetBusy`].
    fn send(&self, payload: MigrationPayload) -> Result<(), MigrationError>;
}

/// In-process link to another replica's migration inbox
#[derive(Debug, Clone)]
pub struct ReplicaLink {
    worker_id: WorkerId,
    sender: mpsc::Sender<MigrationPayload>,
}

impl MigrationTarget for ReplicaLink {
    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn send(&self, payload: MigrationPayload) -> Result<(), MigrationError> {
        self.sender.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MigrationError::TargetBusy(self.worker_id),
            mpsc::error::TrySendError::Closed(_) => MigrationError::Unreachable(self.worker_id),
        })
    }
}

/// Receiving end of a replica link
#[derive(Debug)]
pub struct MigrationInbox {
    receiver: mpsc::Receiver<MigrationPayload>,
}

impl MigrationInbox {
    /// Take every payload that has arrived
    pub fn drain(&mut self) -> Vec<MigrationPayload> {
        let mut payloads = Vec::new();
        while let Ok(payload) = self.receiver.try_recv() {
            payloads.push(payload);
        }
        payloads
    }
}

/// Create the link/inbox pair for a replica
pub fn replica_channel(worker_id: WorkerId, capacity: usize) -> (ReplicaLink, MigrationInbox) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        ReplicaLink { worker_id, sender },
        MigrationInbox { receiver },
    )
}

/// A migration waiting for its next attempt
#[derive(Clone)]
pub struct PendingMigration {
    /// Destination
    pub target: Arc<dyn MigrationTarget>,

    /// Attempts made so far
    pub attempts: u32,

    /// Earliest time of the next attempt
    pub next_attempt: Instant,
}

impl std::fmt::Debug for PendingMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMigration")
            .field("target", &self.target.worker_id())
            .field("attempts", &self.attempts)
            .field("next_attempt", &self.next_attempt)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Compression;
    use crate::memory::snapshot::SnapshotCodec;
    use std::time::Duration;

    fn payload(source: WorkerId) -> MigrationPayload {
        let request = SubmitRequest::new(vec![1, 2, 3]).with_priority(Priority::High);
        let mut sequence =
            Sequence::from_request(SequenceId::new(), request, None, Instant::now());
        sequence.append_tokens(&[4]);
        let snapshot = SnapshotCodec::new(Compression::None)
            .encode(sequence.id, &[1, 2, 3])
            .unwrap();
        MigrationPayload::capture(source, &sequence, snapshot)
    }

    #[test]
    fn test_payload_round_trip() {
        let payload = payload(WorkerId(1));
        let id = payload.sequence_id;
        let (sequence, snapshot) = payload.into_sequence();
        assert_eq!(sequence.id, id);
        assert_eq!(sequence.context(), vec![1, 2, 3, 4]);
        assert_eq!(sequence.phase, Phase::Decode);
        assert_eq!(sequence.priority, Priority::High);
        assert_eq!(snapshot.num_tokens, 3);
    }

    #[test]
    fn test_payload_keeps_arrival_and_deadline() {
        let start = Instant::now();
        let request = SubmitRequest::new(vec![1, 2]).with_deadline(Duration::from_millis(100));
        let sequence = Sequence::from_request(SequenceId::new(), request, None, start);
        let snapshot = SnapshotCodec::new(Compression::None)
            .encode(sequence.id, &[])
            .unwrap();

        let (adopted, _) = MigrationPayload::capture(WorkerId(1), &sequence, snapshot)
            .into_sequence();
        assert_eq!(adopted.arrival_time, start);
        assert_eq!(adopted.deadline, Some(start + Duration::from_millis(100)));
        assert!(!adopted.is_expired(start + Duration::from_millis(99)));
        assert!(adopted.is_expired(start + Duration::from_secs(5)));
    }

    #[test]
    fn test_replica_link_backpressure() {
        let (link, mut inbox) = replica_channel(WorkerId(2), 1);
        assert_eq!(link.worker_id(), WorkerId(2));
        link.send(payload(WorkerId(1))).unwrap();
        assert_eq!(
            link.send(payload(WorkerId(1))).unwrap_err(),
            MigrationError::TargetBusy(WorkerId(2))
        );
        assert_eq!(inbox.drain().len(), 1);
        assert!(link.send(payload(WorkerId(1))).is_ok());
    }

    #[test]
    fn test_closed_inbox_is_unreachable() {
        let (link, inbox) = replica_channel(WorkerId(5), 4);
        drop(inbox);
        assert_eq!(
            link.send(payload(WorkerId(1))).unwrap_err(),
            MigrationError::Unreachable(WorkerId(5))
        );
    }
}
