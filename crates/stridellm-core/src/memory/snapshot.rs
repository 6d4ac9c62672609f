//! Eviction snapshots
//!
//! A snapshot holds the token content a preempted sequence had materialized
//! in the cache, so it can resume without recomputing its prefix. Payloads
//! are optionally zstd-compressed; decoding is exact. The store keeps
//! snapshots within a byte budget and drops the oldest first.

use crate::config::{Compression, SnapshotConfig};
use crate::error::{Error, Result};
use crate::types::{SequenceId, TokenId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Encoded token content of an evicted sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedSnapshot {
    /// Owner
    pub sequence_id: SequenceId,

    /// Number of tokens encoded
    pub num_tokens: usize,

    /// Codec used for `payload`
    pub compression: Compression,

    /// Encoded bytes
    pub payload: Vec<u8>,
}

impl CompressedSnapshot {
    /// Bytes held by the payload
    pub fn stored_bytes(&self) -> usize {
        self.payload.len()
    }

    /// Bytes the tokens occupy uncompressed
    pub fn raw_bytes(&self) -> usize {
        self.num_tokens * std::mem::size_of::<TokenId>()
    }
}

/// Encodes and decodes snapshot payloads
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCodec {
    compression: Compression,
}

impl SnapshotCodec {
    /// Create a codec
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    /// Encode tokens
    pub fn encode(&self, sequence_id: SequenceId, tokens: &[TokenId]) -> Result<CompressedSnapshot> {
        let raw: Vec<u8> = tokens.iter().flat_map(|t| t.to_le_bytes()).collect();
        let payload = match self.compression {
            Compression::None => raw,
            Compression::Zstd { level } => zstd::encode_all(raw.as_slice(), level)
                .map_err(|e| Error::internal(format!("snapshot compression failed: {e}")))?,
        };
        Ok(CompressedSnapshot {
            sequence_id,
            num_tokens: tokens.len(),
            compression: self.compression,
            payload,
        })
    }

    /// Decode tokens; the codec is taken from the snapshot itself
    pub fn decode(snapshot: &CompressedSnapshot) -> Result<Vec<TokenId>> {
        let raw = match snapshot.compression {
            Compression::None => snapshot.payload.clone(),
            Compression::Zstd { .. } => zstd::decode_all(snapshot.payload.as_slice())
                .map_err(|e| Error::internal(format!("snapshot decompression failed: {e}")))?,
        };
        if raw.len() != snapshot.raw_bytes() {
            return Err(Error::internal(format!(
                "snapshot for sequence {} decoded to {} bytes, expected {}",
                snapshot.sequence_id,
                raw.len(),
                snapshot.raw_bytes()
            )));
        }
        Ok(raw
            .chunks_exact(4)
            .map(|c| TokenId::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Snapshots held for preempted sequences
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    capacity_bytes: usize,
    used_bytes: usize,
    entries: HashMap<SequenceId, Arc<CompressedSnapshot>>,
    /// Insertion order, oldest first
    order: VecDeque<SequenceId>,
    dropped: u64,
}

impl SnapshotStore {
    /// Create a store with the configured budget
    pub fn new(config: &SnapshotConfig) -> Self {
        Self {
            capacity_bytes: config.capacity_bytes,
            used_bytes: 0,
            entries: HashMap::new(),
            order: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Insert a snapshot, dropping the oldest ones until it fits.
    ///
    /// Returns the sequences whose snapshots were dropped. A snapshot larger
    /// than the whole budget is not kept and its own ID is returned.
    pub fn insert(&mut self, snapshot: Arc<CompressedSnapshot>) -> Vec<SequenceId> {
        let id = snapshot.sequence_id;
        self.remove(id);

        let size = snapshot.stored_bytes();
        if size > self.capacity_bytes {
            self.dropped += 1;
            return vec![id];
        }

        let mut dropped = Vec::new();
        while self.used_bytes + size > self.capacity_bytes {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(old) = self.entries.remove(&oldest) {
                self.used_bytes -= old.stored_bytes();
                self.dropped += 1;
                dropped.push(oldest);
            }
        }

        self.used_bytes += size;
        self.entries.insert(id, snapshot);
        self.order.push_back(id);
        dropped
    }

    /// Remove and return a snapshot
    pub fn remove(&mut self, id: SequenceId) -> Option<Arc<CompressedSnapshot>> {
        let snapshot = self.entries.remove(&id)?;
        self.used_bytes -= snapshot.stored_bytes();
        self.order.retain(|s| *s != id);
        Some(snapshot)
    }

    /// Look up a snapshot
    pub fn get(&self, id: SequenceId) -> Option<&Arc<CompressedSnapshot>> {
        self.entries.get(&id)
    }

    /// Whether a snapshot is held
    pub fn contains(&self, id: SequenceId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Bytes currently held
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Byte budget
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Number of snapshots held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshots dropped under memory pressure so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
