//! Execution interface
//!
//! The scheduler emits a [`StepPlan`] each tick, an external [`ComputeStep`]
//! runs the model over it, and the returned [`StepResult`] is ingested at
//! the start of the next tick. Nothing in this crate does tensor math.

pub mod speculative;

pub use speculative::{
    verify, DraftNode, DraftProposer, NgramProposer, SpeculationTree, SpeculativeEngine,
    SpeculativeStats, Verification,
};

use crate::error::{Error, Result};
use crate::grammar::TokenMask;
use crate::types::{BlockId, Phase, SequenceId, TokenId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Model execution interface
pub trait ComputeStep: Send + Sync {
    /// Run one forward pass over the plan.
    ///
    /// Must return an output for every planned sequence. Token IDs produced
    /// for a constrained position must lie inside that position's mask.
    fn compute(&self, plan: &StepPlan) -> Result<StepResult>;
}

/// Work for one sequence in one tick
#[derive(Debug, Clone)]
pub struct PlanEntry {
    /// Sequence ID
    pub sequence_id: SequenceId,

    /// Placement tag
    pub phase: Phase,

    /// Tokens to feed; the last one is the speculation root
    pub input_tokens: Vec<TokenId>,

    /// Position of the first input token
    pub start_position: usize,

    /// Cache blocks backing the sequence, in token order
    pub block_table: Vec<BlockId>,

    /// Snapshot content to write back into positions `0..start_position`
    /// of `block_table` before the forward pass. Set when a preempted or
    /// migrated sequence resumes from a snapshot.
    pub restore: Option<Vec<TokenId>>,

    /// Drafted continuations to verify, if any
    pub draft: Option<SpeculationTree>,

    /// Allowed tokens per output position (empty when unconstrained)
    pub masks: Vec<Arc<TokenMask>>,

    /// First tick of this sequence since admission or resume
    pub newly_admitted: bool,
}

impl PlanEntry {
    /// Tokens this entry charges against the tick budget
    pub fn token_budget(&self) -> usize {
        self.input_tokens.len() + self.draft.as_ref().map_or(0, SpeculationTree::num_drafts)
    }

    /// Number of positions the compute step must produce a token for:
    /// one per tree node, or one for a plain step
    pub fn num_outputs(&self) -> usize {
        self.draft.as_ref().map_or(1, SpeculationTree::len)
    }

    /// Mask for an output position
    pub fn mask(&self, position: usize) -> Option<&TokenMask> {
        self.masks.get(position).map(|m| m.as_ref())
    }

    /// Whether the entry is grammar constrained
    pub fn is_constrained(&self) -> bool {
        !self.masks.is_empty()
    }
}

/// Everything the compute step runs in one tick
#[derive(Debug, Clone, Default)]
pub struct StepPlan {
    /// Tick number
    pub tick: u64,

    /// Per-sequence work
    pub entries: Vec<PlanEntry>,
}

impl StepPlan {
    /// Check if the plan has no work
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of sequences
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Total tokens charged by all entries
    pub fn num_tokens(&self) -> usize {
        self.entries.iter().map(PlanEntry::token_budget).sum()
    }

    /// Entries of one phase
    pub fn entries_in(&self, phase: Phase) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(move |e| e.phase == phase)
    }

    /// Entry for a sequence
    pub fn entry(&self, id: SequenceId) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.sequence_id == id)
    }

    /// Check structural consistency: unique sequences, masks sized to the
    /// output positions, and no block listed by two sequences unless the
    /// pool says it is shared
    pub fn validate(&self, ref_count: impl Fn(BlockId) -> usize) -> Result<()> {
        let mut seen = HashSet::new();
        let mut owners: HashMap<BlockId, usize> = HashMap::new();
        for entry in &self.entries {
            if !seen.insert(entry.sequence_id) {
                return Err(Error::invariant(format!(
                    "sequence {} planned twice in tick {}",
                    entry.sequence_id, self.tick
                )));
            }
            if entry.input_tokens.is_empty() {
                return Err(Error::invariant(format!(
                    "sequence {} planned without input",
                    entry.sequence_id
                )));
            }
            if let Some(restore) = &entry.restore {
                if restore.len() != entry.start_position {
                    return Err(Error::invariant(format!(
                        "sequence {} restores {} positions but starts at {}",
                        entry.sequence_id,
                        restore.len(),
                        entry.start_position
                    )));
                }
            }
            if entry.is_constrained() && entry.masks.len() != entry.num_outputs() {
                return Err(Error::invariant(format!(
                    "sequence {} has {} masks for {} outputs",
                    entry.sequence_id,
                    entry.masks.len(),
                    entry.num_outputs()
                )));
            }
            for block in &entry.block_table {
                *owners.entry(*block).or_default() += 1;
            }
        }
        for (block, count) in owners {
            if count > ref_count(block) {
                return Err(Error::invariant(format!(
                    "block {block} listed by {count} sequences but has {} references",
                    ref_count(block)
                )));
            }
        }
        Ok(())
    }
}

/// Output of the compute step for one sequence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceOutput {
    /// Target token per output position
    pub tokens: Vec<TokenId>,

    /// Logits per output position, used when `tokens` is empty
    pub logits: Vec<Vec<f32>>,
}

impl SequenceOutput {
    /// Output carrying chosen tokens
    pub fn from_tokens(tokens: Vec<TokenId>) -> Self {
        Self {
            tokens,
            logits: Vec::new(),
        }
    }

    /// Output carrying raw logits
    pub fn from_logits(logits: Vec<Vec<f32>>) -> Self {
        Self {
            tokens: Vec::new(),
            logits,
        }
    }

    /// Target token per output position of `entry`.
    ///
    /// Logits are reduced with a greedy argmax restricted to the position's
    /// mask. Chosen tokens are returned as given; checking them against the
    /// mask is the caller's job.
    pub fn resolve(&self, entry: &PlanEntry) -> Result<Vec<TokenId>> {
        let expected = entry.num_outputs();
        if !self.tokens.is_empty() {
            if self.tokens.len() != expected {
                return Err(Error::MissingOutput(entry.sequence_id).with_context(format!(
                    "expected {} tokens, got {}",
                    expected,
                    self.tokens.len()
                )));
            }
            return Ok(self.tokens.clone());
        }
        if self.logits.len() != expected {
            return Err(Error::MissingOutput(entry.sequence_id).with_context(format!(
                "expected {} logit rows, got {}",
                expected,
                self.logits.len()
            )));
        }
        self.logits
            .iter()
            .enumerate()
            .map(|(position, row)| {
                let chosen = match entry.mask(position) {
                    Some(mask) => mask.argmax(row),
                    None => argmax(row),
                };
                chosen.ok_or(Error::MissingOutput(entry.sequence_id))
            })
            .collect()
    }
}

fn argmax(logits: &[f32]) -> Option<TokenId> {
    logits
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as TokenId)
}

/// Compute step output for one tick
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    /// Tick the plan was issued for
    pub tick: u64,

    /// Output per planned sequence
    pub outputs: HashMap<SequenceId, SequenceOutput>,
}

impl StepResult {
    /// Create an empty result for a tick
    pub fn new(tick: u64) -> Self {
        Self {
            tick,
            outputs: HashMap::new(),
        }
    }

    /// Add an output
    pub fn with_output(mut self, id: SequenceId, output: SequenceOutput) -> Self {
        self.outputs.insert(id, output);
        self
    }
}

/// Execution statistics
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    /// Compute steps run
    pub total_steps: u64,

    /// Total prefill tokens
    pub prefill_tokens: u64,

    /// Total decode tokens (including drafts)
    pub decode_tokens: u64,

    /// Total compute time (seconds)
    pub total_time_secs: f64,
}

impl ExecutionStats {
    /// Update statistics after a compute step
    pub fn update(&mut self, plan: &StepPlan, elapsed_secs: f64) {
        self.total_steps += 1;
        self.total_time_secs += elapsed_secs;
        for entry in &plan.entries {
            match entry.phase {
                Phase::Prefill => self.prefill_tokens += entry.token_budget() as u64,
                Phase::Decode => self.decode_tokens += entry.token_budget() as u64,
            }
        }
    }

    /// Tokens per second over all steps
    pub fn tokens_per_second(&self) -> f64 {
        if self.total_time_secs > 0.0 {
            (self.prefill_tokens + self.decode_tokens) as f64 / self.total_time_secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: SequenceId, blocks: Vec<BlockId>) -> PlanEntry {
        PlanEntry {
            sequence_id: id,
            phase: Phase::Decode,
            input_tokens: vec![7],
            start_position: 4,
            block_table: blocks,
            restore: None,
            draft: None,
            masks: Vec::new(),
            newly_admitted: false,
        }
    }

    #[test]
    fn test_token_budget_counts_drafts() {
        let mut e = entry(SequenceId::new(), vec![0]);
        assert_eq!(e.token_budget(), 1);
        assert_eq!(e.num_outputs(), 1);

        let mut tree = SpeculationTree::new(7);
        let child = tree.add_child(0, 8, 1.0).unwrap();
        tree.add_child(child, 9, 1.0).unwrap();
        e.draft = Some(tree);
        assert_eq!(e.token_budget(), 3);
        assert_eq!(e.num_outputs(), 3);
    }

    #[test]
    fn test_validate_rejects_unshared_duplicate_blocks() {
        let plan = StepPlan {
            tick: 1,
            entries: vec![
                entry(SequenceId::new(), vec![0, 1]),
                entry(SequenceId::new(), vec![1, 2]),
            ],
        };
        assert!(plan.validate(|_| 1).is_err());
        assert!(plan.validate(|b| if b == 1 { 2 } else { 1 }).is_ok());
    }

    #[test]
    fn test_validate_mask_count() {
        let mut e = entry(SequenceId::new(), vec![0]);
        e.masks = vec![Arc::new(TokenMask::full(4)), Arc::new(TokenMask::full(4))];
        let plan = StepPlan {
            tick: 1,
            entries: vec![e],
        };
        assert!(matches!(
            plan.validate(|_| 1),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_validate_restore_covers_start() {
        let mut e = entry(SequenceId::new(), vec![0, 1]);
        e.restore = Some(vec![1, 2, 3]);
        let mut plan = StepPlan {
            tick: 1,
            entries: vec![e],
        };
        assert!(matches!(
            plan.validate(|_| 1),
            Err(Error::InvariantViolation(_))
        ));
        plan.entries[0].restore = Some(vec![1, 2, 3, 4]);
        assert!(plan.validate(|_| 1).is_ok());
    }

    #[test]
    fn test_resolve_logits_under_mask() {
        let mut e = entry(SequenceId::new(), vec![0]);
        let output = SequenceOutput::from_logits(vec![vec![0.1, 0.9, 0.5, 0.0]]);
        assert_eq!(output.resolve(&e).unwrap(), vec![1]);

        e.masks = vec![Arc::new(TokenMask::from_tokens(4, [0, 2]))];
        assert_eq!(output.resolve(&e).unwrap(), vec![2]);
    }

    #[test]
    fn test_resolve_length_mismatch() {
        let e = entry(SequenceId::new(), vec![0]);
        let err = SequenceOutput::from_tokens(vec![1, 2])
            .resolve(&e)
            .unwrap_err();
        assert!(err.is_integration());
        assert!(SequenceOutput::default().resolve(&e).is_err());
    }

    #[test]
    fn test_execution_stats() {
        let mut stats = ExecutionStats::default();
        let mut prefill = entry(SequenceId::new(), vec![0]);
        prefill.phase = Phase::Prefill;
        prefill.input_tokens = vec![1, 2, 3];
        let plan = StepPlan {
            tick: 1,
            entries: vec![prefill, entry(SequenceId::new(), vec![1])],
        };
        stats.update(&plan, 0.5);
        assert_eq!(stats.prefill_tokens, 3);
        assert_eq!(stats.decode_tokens, 1);
        assert!((stats.tokens_per_second() - 8.0).abs() < 1e-9);
    }
}
