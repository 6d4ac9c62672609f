//! Speculative Decoding
//!
//! Draft tokens are proposed as a tree rooted at the last accepted token and
//! verified against the target model's own choices in one compute step.
//! Acceptance is pure token identity: a node is accepted iff the target's
//! token at its parent's position equals the drafted token. Draft
//! probabilities only rank siblings.

use crate::config::SpeculativeConfig;
use crate::error::{Error, Result};
use crate::grammar::{GrammarEngine, GrammarState};
use crate::types::TokenId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Node of a speculation tree
#[derive(Debug, Clone, PartialEq)]
pub struct DraftNode {
    /// Token at this node
    pub token: TokenId,

    /// Parent node index (the root is its own parent)
    pub parent: usize,

    /// Distance from the root
    pub depth: usize,

    /// Draft probability, used for ranking only
    pub probability: f32,

    /// Child node indices, best ranked first
    pub children: Vec<usize>,
}

/// Tree of drafted continuations. Node 0 is the root: the last accepted
/// token, which the compute step feeds like any other input.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeculationTree {
    nodes: Vec<DraftNode>,
}

impl SpeculationTree {
    /// Tree holding only the root
    pub fn new(root: TokenId) -> Self {
        Self {
            nodes: vec![DraftNode {
                token: root,
                parent: 0,
                depth: 0,
                probability: 1.0,
                children: Vec::new(),
            }],
        }
    }

    /// Add a drafted token under `parent`; returns the new node index
    pub fn add_child(&mut self, parent: usize, token: TokenId, probability: f32) -> Result<usize> {
        let depth = self
            .nodes
            .get(parent)
            .map(|p| p.depth + 1)
            .ok_or_else(|| Error::internal(format!("draft parent {parent} does not exist")))?;
        if self.nodes[parent]
            .children
            .iter()
            .any(|c| self.nodes[*c].token == token)
        {
            return Err(Error::internal(format!(
                "token {token} drafted twice under node {parent}"
            )));
        }
        let index = self.nodes.len();
        self.nodes.push(DraftNode {
            token,
            parent,
            depth,
            probability,
            children: Vec::new(),
        });
        self.nodes[parent].children.push(index);
        Ok(index)
    }

    /// Number of nodes including the root
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds nothing but the root
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Number of drafted tokens
    pub fn num_drafts(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Node by index
    pub fn node(&self, index: usize) -> Option<&DraftNode> {
        self.nodes.get(index)
    }

    /// All nodes in index order
    pub fn nodes(&self) -> &[DraftNode] {
        &self.nodes
    }

    /// Deepest node depth
    pub fn depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// Largest number of children of any node
    pub fn width(&self) -> usize {
        self.nodes.iter().map(|n| n.children.len()).max().unwrap_or(0)
    }

    /// Drafted tokens from the root (exclusive) to `index` (inclusive)
    pub fn path(&self, index: usize) -> Vec<TokenId> {
        let mut path = Vec::new();
        let mut cur = index;
        while cur != 0 && cur < self.nodes.len() {
            path.push(self.nodes[cur].token);
            cur = self.nodes[cur].parent;
        }
        path.reverse();
        path
    }
}

/// Outcome of verifying one tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// Accepted node indices, root to leaf
    pub accepted_nodes: Vec<usize>,

    /// Tokens to commit
    pub committed: Vec<TokenId>,

    /// Drafted tokens that were checked
    pub num_drafted: usize,
}

impl Verification {
    /// Number of accepted drafted tokens
    pub fn num_accepted(&self) -> usize {
        self.accepted_nodes.len()
    }
}

/// Verify a tree against the target's token at every node position.
///
/// Walks from the root, accepting the child whose token equals the target's
/// choice at the current node. The first mismatch ends the walk. Only
/// accepted drafts are committed; when none is accepted the target's choice
/// at the root is committed instead.
pub fn verify(tree: &SpeculationTree, targets: &[TokenId]) -> Result<Verification> {
    if targets.len() != tree.len() {
        return Err(Error::internal(format!(
            "expected {} target tokens, got {}",
            tree.len(),
            targets.len()
        )));
    }
    let mut accepted_nodes = Vec::new();
    let mut cur = 0;
    loop {
        let target = targets[cur];
        let next = tree.nodes[cur]
            .children
            .iter()
            .copied()
            .find(|c| tree.nodes[*c].token == target);
        match next {
            Some(child) => {
                accepted_nodes.push(child);
                cur = child;
            }
            None => break,
        }
    }
    let committed = if accepted_nodes.is_empty() {
        vec![targets[0]]
    } else {
        accepted_nodes.iter().map(|n| tree.nodes[*n].token).collect()
    };
    Ok(Verification {
        accepted_nodes,
        committed,
        num_drafted: tree.num_drafts(),
    })
}

/// Source of draft candidates
pub trait DraftProposer: Send + Sync {
    /// Ranked `(token, probability)` candidates to follow `context`
    fn propose(&self, context: &[TokenId], max_candidates: usize) -> Vec<(TokenId, f32)>;
}

/// Prompt-lookup proposer: predicts continuations of the longest recent
/// n-gram that already occurred earlier in the sequence's own context.
#[derive(Debug, Clone)]
pub struct NgramProposer {
    /// Maximum ngram size
    max_ngram_size: usize,
}

impl NgramProposer {
    /// Create a new ngram proposer
    pub fn new(max_ngram_size: usize) -> Self {
        Self {
            max_ngram_size: max_ngram_size.max(1),
        }
    }
}

impl DraftProposer for NgramProposer {
    fn propose(&self, context: &[TokenId], max_candidates: usize) -> Vec<(TokenId, f32)> {
        if max_candidates == 0 || context.len() < 2 {
            return Vec::new();
        }
        // Try ngrams from largest to smallest
        for n in (1..=self.max_ngram_size.min(context.len() - 1)).rev() {
            let suffix = &context[context.len() - n..];
            let mut counts: HashMap<TokenId, usize> = HashMap::new();
            let mut last_seen: HashMap<TokenId, usize> = HashMap::new();
            for start in 0..context.len() - n {
                if &context[start..start + n] == suffix {
                    let next = context[start + n];
                    *counts.entry(next).or_default() += 1;
                    last_seen.insert(next, start);
                }
            }
            if counts.is_empty() {
                continue;
            }
            let total: usize = counts.values().sum();
            let mut ranked: Vec<(TokenId, usize)> = counts.into_iter().collect();
            // Most frequent first; the most recent occurrence breaks ties.
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then(last_seen[&b.0].cmp(&last_seen[&a.0])));
            return ranked
                .into_iter()
                .take(max_candidates)
                .map(|(token, count)| (token, count as f32 / total as f32))
                .collect();
        }
        Vec::new()
    }
}

/// Statistics for speculative decoding
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeculativeStats {
    /// Total drafted tokens sent for verification
    pub total_proposed: u64,

    /// Total drafted tokens accepted
    pub total_accepted: u64,

    /// Trees verified
    pub trees_verified: u64,

    /// Rolling acceptance rate used for depth adaptation
    pub acceptance_rate: f32,

    /// Current draft depth
    pub current_depth: usize,
}

impl SpeculativeStats {
    /// Lifetime fraction of drafted tokens that were accepted
    pub fn lifetime_acceptance(&self) -> f32 {
        if self.total_proposed == 0 {
            return 0.0;
        }
        self.total_accepted as f32 / self.total_proposed as f32
    }
}

const ROLLING_WEIGHT: f32 = 0.1;
const ADAPT_MIN_TREES: u64 = 16;

/// Draft tree builder with adaptive depth
#[derive(Clone)]
pub struct SpeculativeEngine {
    /// Configuration
    config: SpeculativeConfig,

    /// Candidate source
    proposer: Arc<dyn DraftProposer>,

    /// Current depth limit
    current_depth: usize,

    /// Counters
    stats: SpeculativeStats,
}

impl std::fmt::Debug for SpeculativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeculativeEngine")
            .field("config", &self.config)
            .field("current_depth", &self.current_depth)
            .field("stats", &self.stats)
            .finish()
    }
}

impl SpeculativeEngine {
    /// Create an engine using the n-gram proposer
    pub fn new(config: SpeculativeConfig) -> Self {
        let proposer = Arc::new(NgramProposer::new(config.ngram_max));
        Self::with_proposer(config, proposer)
    }

    /// Create an engine with a custom proposer (e.g. a draft model)
    pub fn with_proposer(config: SpeculativeConfig, proposer: Arc<dyn DraftProposer>) -> Self {
        let current_depth = config.max_draft_depth;
        Self {
            stats: SpeculativeStats {
                acceptance_rate: 1.0,
                current_depth,
                ..Default::default()
            },
            config,
            proposer,
            current_depth,
        }
    }

    /// Whether speculation is enabled at all
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Current depth limit
    pub fn current_depth(&self) -> usize {
        self.current_depth
    }

    /// Build a draft tree of at most `budget` drafted tokens.
    ///
    /// With a grammar, a candidate is only expanded if the grammar state
    /// reached along its path allows it. Returns `None` when nothing could
    /// be drafted.
    pub fn draft(
        &self,
        context: &[TokenId],
        budget: usize,
        grammar: Option<(&GrammarEngine, &GrammarState)>,
    ) -> Option<SpeculationTree> {
        if !self.config.enabled || budget == 0 || context.is_empty() {
            return None;
        }
        if grammar.is_some_and(|(_, state)| !state.supports_lookahead()) {
            return None;
        }
        let root = *context.last()?;
        let mut tree = SpeculationTree::new(root);
        let mut remaining = budget;
        let mut queue: VecDeque<(usize, Vec<TokenId>, Option<GrammarState>)> = VecDeque::new();
        queue.push_back((0, context.to_vec(), grammar.map(|(_, s)| s.clone())));

        while let Some((node, ctx, state)) = queue.pop_front() {
            if remaining == 0 {
                break;
            }
            let depth = tree.nodes[node].depth;
            if depth >= self.current_depth {
                continue;
            }
            let mask = match (grammar, &state) {
                (Some((engine, _)), Some(state)) => Some(engine.mask(state)),
                _ => None,
            };
            let width = self.config.max_draft_width.min(remaining);
            let candidates = self.proposer.propose(&ctx, self.config.max_draft_width);
            let mut added = 0;
            for (token, probability) in candidates {
                if added == width {
                    break;
                }
                if mask.as_ref().is_some_and(|m| !m.contains(token)) {
                    continue;
                }
                let next_state = match (grammar, &state) {
                    (Some((engine, _)), Some(state)) => match engine.advance(state, token) {
                        Ok(next) => Some(next),
                        Err(_) => continue,
                    },
                    _ => None,
                };
                let Ok(child) = tree.add_child(node, token, probability) else {
                    continue;
                };
                added += 1;
                remaining -= 1;
                let expandable = next_state.as_ref().map_or(true, |s| s.supports_lookahead());
                if expandable {
                    let mut child_ctx = ctx.clone();
                    child_ctx.push(token);
                    queue.push_back((child, child_ctx, next_state));
                }
            }
        }

        (!tree.is_empty()).then_some(tree)
    }

    /// Record a verification outcome and adapt the depth
    pub fn record(&mut self, tree_depth: usize, verification: &Verification) {
        self.stats.total_proposed += verification.num_drafted as u64;
        self.stats.total_accepted += verification.num_accepted() as u64;
        self.stats.trees_verified += 1;

        if tree_depth > 0 {
            let rate = verification.num_accepted() as f32 / tree_depth as f32;
            self.stats.acceptance_rate =
                (1.0 - ROLLING_WEIGHT) * self.stats.acceptance_rate + ROLLING_WEIGHT * rate;
        }

        if self.config.adaptive && self.stats.trees_verified >= ADAPT_MIN_TREES {
            let target = self.config.target_acceptance_rate;
            if self.stats.acceptance_rate > target + 0.1 {
                self.current_depth = (self.current_depth + 1).min(self.config.max_draft_depth);
            } else if self.stats.acceptance_rate < target - 0.1 {
                self.current_depth = self
                    .current_depth
                    .saturating_sub(1)
                    .max(self.config.min_draft_depth);
            }
        }
        self.stats.current_depth = self.current_depth;
    }

    /// Get statistics
    pub fn stats(&self) -> &SpeculativeStats {
        &self.stats
    }
}
