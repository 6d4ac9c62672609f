//! Request intake
//!
//! Producers on any thread talk to the engine through an [`IntakeHandle`]:
//! submissions, cancellations and migration requests travel over a bounded
//! MPSC channel drained by the scheduling loop at the start of each tick.
//! Results flow back through the [`StatusBoard`]; after every schedule and
//! ingest the loop rewrites the statuses that changed.

use crate::error::{Error, Result};
use crate::memory::{CapacitySnapshot, CapacityView, MigrationTarget};
use crate::types::{RequestId, SequenceId, SequenceStatus, SubmitRequest};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Message from a producer to the scheduling loop
pub enum IntakeMessage {
    /// New request under a pre-assigned sequence ID
    Submit {
        /// ID the caller was given
        sequence_id: SequenceId,
        /// The request
        request: SubmitRequest,
    },

    /// Cancel a sequence
    Cancel(SequenceId),

    /// Move a sequence to another replica
    Migrate {
        /// Sequence to move
        sequence_id: SequenceId,
        /// Destination
        target: Arc<dyn MigrationTarget>,
    },
}

impl std::fmt::Debug for IntakeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntakeMessage::Submit {
                sequence_id,
                request,
            } => f
                .debug_struct("Submit")
                .field("sequence_id", sequence_id)
                .field("request_id", &request.request_id)
                .finish(),
            IntakeMessage::Cancel(id) => f.debug_tuple("Cancel").field(id).finish(),
            IntakeMessage::Migrate {
                sequence_id,
                target,
            } => f
                .debug_struct("Migrate")
                .field("sequence_id", sequence_id)
                .field("target", &target.worker_id())
                .finish(),
        }
    }
}

/// Latest status of every sequence this worker has seen
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<HashMap<SequenceId, SequenceStatus>>>,
    version: Arc<AtomicU64>,
}

impl StatusBoard {
    /// Create an empty board
    pub fn new() -> Self {
        Self::default()
    }

    /// Status of a sequence
    pub fn get(&self, id: SequenceId) -> Option<SequenceStatus> {
        self.inner.read().get(&id).cloned()
    }

    /// Status by client request ID
    pub fn find(&self, request_id: RequestId) -> Option<SequenceStatus> {
        self.inner
            .read()
            .values()
            .find(|s| s.request_id == request_id)
            .cloned()
    }

    /// Copy of every status
    pub fn snapshot(&self) -> Vec<SequenceStatus> {
        self.inner.read().values().cloned().collect()
    }

    /// Drop a status once the client has consumed it
    pub fn remove(&self, id: SequenceId) -> Option<SequenceStatus> {
        self.inner.write().remove(&id)
    }

    /// Number of tracked sequences
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if the board is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Number of status writes so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn publish_all(&self, statuses: impl IntoIterator<Item = SequenceStatus>) {
        let mut inner = self.inner.write();
        let mut written = 0;
        for status in statuses {
            inner.insert(status.sequence_id, status);
            written += 1;
        }
        self.version.fetch_add(written, Ordering::Release);
    }
}

/// Producer side of the intake channel
#[derive(Debug, Clone)]
pub struct IntakeHandle {
    sender: mpsc::Sender<IntakeMessage>,
    board: StatusBoard,
    capacity: CapacityView,
    wake: Arc<Notify>,
}

impl IntakeHandle {
    fn closed() -> Error {
        Error::internal("engine intake is closed")
    }

    /// Submit a request, waiting for channel space
    pub async fn submit(&self, request: SubmitRequest) -> Result<SequenceId> {
        request.validate()?;
        let sequence_id = SequenceId::new();
        self.sender
            .send(IntakeMessage::Submit {
                sequence_id,
                request,
            })
            .await
            .map_err(|_| Self::closed())?;
        self.wake.notify_one();
        Ok(sequence_id)
    }

    /// Submit a request without waiting; a full channel is `QueueFull`
    pub fn try_submit(&self, request: SubmitRequest) -> Result<SequenceId> {
        request.validate()?;
        let sequence_id = SequenceId::new();
        self.try_send(IntakeMessage::Submit {
            sequence_id,
            request,
        })?;
        Ok(sequence_id)
    }

    /// Request cancellation; applied at the next tick boundary
    pub async fn cancel(&self, sequence_id: SequenceId) -> Result<()> {
        self.sender
            .send(IntakeMessage::Cancel(sequence_id))
            .await
            .map_err(|_| Self::closed())?;
        self.wake.notify_one();
        Ok(())
    }

    /// Request a migration; attempted at the next tick boundary
    pub fn migrate(&self, sequence_id: SequenceId, target: Arc<dyn MigrationTarget>) -> Result<()> {
        self.try_send(IntakeMessage::Migrate {
            sequence_id,
            target,
        })
    }

    fn try_send(&self, message: IntakeMessage) -> Result<()> {
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Self::closed(),
        })?;
        self.wake.notify_one();
        Ok(())
    }

    /// Latest status of a sequence (`None` until the engine has seen it)
    pub fn status(&self, sequence_id: SequenceId) -> Option<SequenceStatus> {
        self.board.get(sequence_id)
    }

    /// Status board shared with the engine
    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    /// Latest published cache capacity
    pub fn capacity(&self) -> CapacitySnapshot {
        self.capacity.get()
    }
}

/// Consumer side of the intake channel
#[derive(Debug)]
pub struct Intake {
    receiver: mpsc::Receiver<IntakeMessage>,
}

impl Intake {
    /// Take every waiting message
    pub fn drain(&mut self) -> Vec<IntakeMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.receiver.try_recv() {
            messages.push(message);
        }
        messages
    }
}

/// Create a bounded intake channel
pub fn intake_channel(
    capacity: usize,
    board: StatusBoard,
    view: CapacityView,
    wake: Arc<Notify>,
) -> (IntakeHandle, Intake) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        IntakeHandle {
            sender,
            board,
            capacity: view,
            wake,
        },
        Intake { receiver },
    )
}
