//! Deterministic compute steps for tests and demos.
//!
//! [`DeterministicCompute`] picks the next token as a pure function of the
//! previous token, so the same sequence produces the same output no matter
//! how it was batched, preempted, restored or migrated. [`ScriptedCompute`]
//! layers one-shot overrides on top of it to inject specific target tokens.
//! [`LedgerCompute`] tracks what every cache slot holds and rejects a plan
//! that reads a position nobody wrote.

use crate::error::{Error, Result};
use crate::execution::{ComputeStep, PlanEntry, SequenceOutput, StepPlan, StepResult};
use crate::grammar::TokenMask;
use crate::types::{BlockId, SequenceId, TokenId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Compute step whose target token depends only on the preceding token
#[derive(Debug, Clone)]
pub struct DeterministicCompute {
    vocab_size: usize,
    eos_token_id: TokenId,
    seed: u32,
    emit_logits: bool,
}

impl DeterministicCompute {
    /// Create a compute step over `vocab_size` tokens that never chooses
    /// `eos_token_id` unless a mask leaves nothing else
    pub fn new(vocab_size: usize, eos_token_id: TokenId) -> Self {
        Self {
            vocab_size,
            eos_token_id,
            seed: 7,
            emit_logits: false,
        }
    }

    /// Change the successor function
    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    /// Return logit rows instead of token IDs
    pub fn with_logits(mut self) -> Self {
        self.emit_logits = true;
        self
    }

    /// Unconstrained successor of `token`
    pub fn successor(&self, token: TokenId) -> TokenId {
        let vocab = self.vocab_size as u64;
        let mut next = ((token as u64 * 31 + self.seed as u64) % vocab) as TokenId;
        if next == self.eos_token_id {
            next = ((next as u64 + 1) % vocab) as TokenId;
        }
        next
    }

    /// Successor of `token` restricted to `mask`: the first allowed token at
    /// or after the unconstrained choice, preferring anything over EOS
    pub fn choose(&self, token: TokenId, mask: Option<&TokenMask>) -> TokenId {
        let preferred = self.successor(token);
        let Some(mask) = mask else {
            return preferred;
        };
        let vocab = self.vocab_size as TokenId;
        (0..vocab)
            .map(|offset| (preferred + offset) % vocab)
            .find(|t| *t != self.eos_token_id && mask.contains(*t))
            .unwrap_or(self.eos_token_id)
    }

    /// Target tokens for every output position of an entry
    pub fn targets(&self, entry: &PlanEntry) -> Vec<TokenId> {
        let root = entry.input_tokens.last().copied().unwrap_or_default();
        match &entry.draft {
            None => vec![self.choose(root, entry.mask(0))],
            Some(tree) => tree
                .nodes()
                .iter()
                .enumerate()
                .map(|(i, node)| self.choose(node.token, entry.mask(i)))
                .collect(),
        }
    }

    fn output(&self, tokens: Vec<TokenId>) -> SequenceOutput {
        if !self.emit_logits {
            return SequenceOutput::from_tokens(tokens);
        }
        let rows = tokens
            .into_iter()
            .map(|t| {
                let mut row = vec![0.0; self.vocab_size];
                if let Some(slot) = row.get_mut(t as usize) {
                    *slot = 1.0;
                }
                row
            })
            .collect();
        SequenceOutput::from_logits(rows)
    }
}

impl ComputeStep for DeterministicCompute {
    fn compute(&self, plan: &StepPlan) -> Result<StepResult> {
        let mut result = StepResult::new(plan.tick);
        for entry in &plan.entries {
            result
                .outputs
                .insert(entry.sequence_id, self.output(self.targets(entry)));
        }
        Ok(result)
    }
}

/// [`DeterministicCompute`] with queued per-sequence overrides
#[derive(Debug)]
pub struct ScriptedCompute {
    inner: DeterministicCompute,
    scripts: Mutex<HashMap<SequenceId, VecDeque<Vec<TokenId>>>>,
}

impl ScriptedCompute {
    /// Wrap a deterministic compute step
    pub fn new(inner: DeterministicCompute) -> Self {
        Self {
            inner,
            scripts: Mutex::new(HashMap::new()),
        }
    }

    /// Use `tokens` as the targets of the sequence's next planned step.
    /// Shorter scripts are padded with the deterministic choice.
    pub fn push(&self, id: SequenceId, tokens: Vec<TokenId>) {
        self.scripts.lock().entry(id).or_default().push_back(tokens);
    }

    /// Deterministic fallback
    pub fn inner(&self) -> &DeterministicCompute {
        &self.inner
    }
}

impl ComputeStep for ScriptedCompute {
    fn compute(&self, plan: &StepPlan) -> Result<StepResult> {
        let mut result = StepResult::new(plan.tick);
        let mut scripts = self.scripts.lock();
        for entry in &plan.entries {
            let mut targets = self.inner.targets(entry);
            if let Some(script) = scripts
                .get_mut(&entry.sequence_id)
                .and_then(VecDeque::pop_front)
            {
                for (slot, token) in targets.iter_mut().zip(script) {
                    *slot = token;
                }
            }
            result
                .outputs
                .insert(entry.sequence_id, SequenceOutput::from_tokens(targets));
        }
        Ok(result)
    }
}

/// Cache content as written by earlier steps
#[derive(Debug, Default)]
struct Ledger {
    /// Token held by each (block, slot)
    slots: HashMap<(BlockId, usize), TokenId>,
    /// Tokens each sequence has fed or restored, by position
    history: HashMap<SequenceId, Vec<Option<TokenId>>>,
    restored_positions: usize,
    cached_reads: usize,
}

impl Ledger {
    fn record(&mut self, id: SequenceId, position: usize, token: TokenId) {
        let history = self.history.entry(id).or_default();
        if history.len() <= position {
            history.resize(position + 1, None);
        }
        history[position] = Some(token);
    }

    fn known(&self, id: SequenceId, position: usize) -> Option<TokenId> {
        self.history.get(&id)?.get(position).copied().flatten()
    }
}

/// Wraps a compute step with a model of the paged cache.
///
/// Each step writes its restored and input tokens into the slots of the
/// entry's block table. Every position below `start_position` must already
/// hold a token, and where the sequence has fed that position before it
/// must hold the same token. Shared prefix blocks pass because their first
/// owner wrote them.
#[derive(Debug)]
pub struct LedgerCompute<C> {
    inner: C,
    block_size: usize,
    ledger: Mutex<Ledger>,
}

impl<C: ComputeStep> LedgerCompute<C> {
    /// Wrap `inner` for a cache with `block_size` tokens per block
    pub fn new(inner: C, block_size: usize) -> Self {
        Self {
            inner,
            block_size,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Wrapped compute step
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Positions written back from snapshots so far
    pub fn restored_positions(&self) -> usize {
        self.ledger.lock().restored_positions
    }

    /// Cached positions read by forward passes so far
    pub fn cached_reads(&self) -> usize {
        self.ledger.lock().cached_reads
    }

    fn slot(&self, entry: &PlanEntry, position: usize) -> Result<(BlockId, usize)> {
        let block = entry
            .block_table
            .get(position / self.block_size)
            .copied()
            .ok_or_else(|| {
                Error::Compute(format!(
                    "sequence {} position {} is past its block table",
                    entry.sequence_id, position
                ))
            })?;
        Ok((block, position % self.block_size))
    }

    fn check(&self, ledger: &mut Ledger, tick: u64, entry: &PlanEntry) -> Result<()> {
        let id = entry.sequence_id;
        if let Some(restore) = &entry.restore {
            for (position, token) in restore.iter().enumerate() {
                let slot = self.slot(entry, position)?;
                ledger.slots.insert(slot, *token);
                ledger.record(id, position, *token);
            }
            ledger.restored_positions += restore.len();
        }
        for position in 0..entry.start_position {
            let slot = self.slot(entry, position)?;
            let Some(held) = ledger.slots.get(&slot).copied() else {
                return Err(Error::Compute(format!(
                    "tick {tick}: sequence {id} reads position {position} which is not in cache"
                )));
            };
            if let Some(expected) = ledger.known(id, position) {
                if held != expected {
                    return Err(Error::Compute(format!(
                        "tick {tick}: sequence {id} position {position} holds {held}, expected {expected}"
                    )));
                }
            }
            ledger.cached_reads += 1;
        }
        for (offset, token) in entry.input_tokens.iter().enumerate() {
            let position = entry.start_position + offset;
            let slot = self.slot(entry, position)?;
            ledger.slots.insert(slot, *token);
            ledger.record(id, position, *token);
        }
        Ok(())
    }
}

impl<C: ComputeStep> ComputeStep for LedgerCompute<C> {
    fn compute(&self, plan: &StepPlan) -> Result<StepResult> {
        {
            let mut ledger = self.ledger.lock();
            for entry in &plan.entries {
                self.check(&mut ledger, plan.tick, entry)?;
            }
        }
        self.inner.compute(plan)
    }
}
