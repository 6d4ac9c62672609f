//! End-to-end scheduling scenarios over a deterministic compute step.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Instant;
use stridellm_core::config::{Compression, EngineConfig, SpeculativeConfig};
use stridellm_core::error::{Error, Result};
use stridellm_core::execution::{ComputeStep, DraftProposer, SpeculativeEngine};
use stridellm_core::grammar::{GrammarEngine, GrammarSpec};
use stridellm_core::registry::Registry;
use stridellm_core::scheduler::{Scheduler, TickSummary};
use stridellm_core::testing::{DeterministicCompute, LedgerCompute, ScriptedCompute};
use stridellm_core::types::{
    FailureReason, Priority, SequenceId, SequenceState, SubmitRequest, TokenId,
};

const VOCAB: usize = 129;
const EOS: TokenId = 128;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn grammar() -> Arc<GrammarEngine> {
    Arc::new(GrammarEngine::new(Arc::new(Registry::ascii())))
}

fn scheduler(config: &EngineConfig) -> Scheduler {
    Scheduler::new(config, grammar()).unwrap()
}

fn compute() -> DeterministicCompute {
    DeterministicCompute::new(VOCAB, EOS)
}

/// Compute step that also checks cache content; keep one per scheduler
fn cached_compute(config: &EngineConfig) -> LedgerCompute<DeterministicCompute> {
    LedgerCompute::new(compute(), config.cache.block_size)
}

fn step(scheduler: &mut Scheduler, compute: &dyn ComputeStep) -> Result<TickSummary> {
    let plan = scheduler.schedule(Instant::now())?;
    let result = compute.compute(&plan)?;
    scheduler.ingest(result)
}

/// Prompt of `len` tokens starting at `first`
fn prompt(first: TokenId, len: usize) -> Vec<TokenId> {
    (0..len as TokenId).map(|i| (first + i) % 100).collect()
}

fn assert_capacity(scheduler: &Scheduler) {
    let cache = scheduler.cache();
    cache.verify().unwrap();
    let capacity = cache.capacity(scheduler.tick());
    assert!(capacity.used_blocks <= capacity.total_blocks);
    assert_eq!(capacity.used_blocks + capacity.free_blocks, capacity.total_blocks);
    assert!(capacity.snapshot_bytes <= capacity.snapshot_capacity_bytes);
}

fn run_until_settled(scheduler: &mut Scheduler, compute: &dyn ComputeStep, id: SequenceId) {
    for _ in 0..1000 {
        if scheduler.status(id).is_some_and(|s| s.state.is_terminal()) {
            return;
        }
        step(scheduler, compute).unwrap();
        assert_capacity(scheduler);
    }
    panic!("sequence {id} did not finish");
}

#[test]
fn higher_priority_arrival_preempts_running_sequence() {
    init_tracing();
    let config = EngineConfig::new(VOCAB, 12).with_block_size(4);
    let mut s = scheduler(&config);

    // B arrives first and fits.
    let b = s
        .submit(
            SubmitRequest::new(prompt(0, 40)).with_priority(Priority::Low),
            Instant::now(),
        )
        .unwrap();
    step(&mut s, &compute()).unwrap();
    assert_eq!(s.status(b).unwrap().state, SequenceState::Running);

    // A needs 10 blocks too; both cannot fit in 12.
    let a = s
        .submit(
            SubmitRequest::new(prompt(50, 40)).with_priority(Priority::High),
            Instant::now(),
        )
        .unwrap();
    let summary = step(&mut s, &compute()).unwrap();
    assert_eq!(summary.admitted, 1);
    assert_eq!(summary.evicted, 1);
    assert_capacity(&s);

    let a_status = s.status(a).unwrap();
    let b_status = s.status(b).unwrap();
    assert_eq!(a_status.state, SequenceState::Running);
    assert_eq!(b_status.state, SequenceState::Pending);
    assert!(b_status.has_snapshot);
    assert_eq!(b_status.num_blocks, 0);
}

/// Drafts a fixed continuation, resuming where the context leaves off
struct FixedDraft(Vec<TokenId>);

impl DraftProposer for FixedDraft {
    fn propose(&self, context: &[TokenId], _max: usize) -> Vec<(TokenId, f32)> {
        let matched = (0..=self.0.len())
            .rev()
            .find(|n| context.ends_with(&self.0[..*n]))
            .unwrap_or(0);
        self.0.get(matched).map(|t| vec![(*t, 0.9)]).unwrap_or_default()
    }
}

#[test]
fn partially_accepted_tree_commits_agreeing_prefix() {
    let mut config = EngineConfig::new(VOCAB, 16).with_block_size(4);
    config.speculative = SpeculativeConfig {
        enabled: true,
        max_draft_width: 1,
        max_draft_depth: 3,
        adaptive: false,
        ..Default::default()
    };
    let engine = SpeculativeEngine::with_proposer(
        config.speculative.clone(),
        Arc::new(FixedDraft(vec![11, 12, 13])),
    );
    let mut s = scheduler(&config).with_speculative_engine(engine);
    let id = s
        .submit(
            SubmitRequest::new(vec![1, 2, 3]).with_speculation_budget(3),
            Instant::now(),
        )
        .unwrap();
    let compute = ScriptedCompute::new(compute());
    step(&mut s, &compute).unwrap();
    let before = s.status(id).unwrap().generated;

    // Root predicts 11, node 1 predicts 12, node 2 predicts 99 instead of 13.
    compute.push(id, vec![11, 12, 99, 77]);
    let summary = step(&mut s, &compute).unwrap();
    assert_eq!(summary.drafted, 3);
    assert_eq!(summary.accepted, 2);
    assert_eq!(summary.acceptance_rate(), Some(2.0 / 3.0));

    let after = s.status(id).unwrap().generated;
    assert_eq!(after.len(), before.len() + 2);
    assert_eq!(&after[before.len()..], &[11, 12]);
    assert_eq!(s.speculative_stats().total_accepted, 2);
}

#[test]
fn mask_violation_aborts_tick_and_preserves_state() {
    let config = EngineConfig::new(VOCAB, 16).with_block_size(4);
    let mut s = scheduler(&config);
    let constrained = s
        .submit(
            SubmitRequest::new(prompt(0, 5)).with_grammar(GrammarSpec::Regex {
                pattern: "[0-9]+".into(),
            }),
            Instant::now(),
        )
        .unwrap();
    let bystander = s
        .submit(SubmitRequest::new(prompt(20, 5)), Instant::now())
        .unwrap();
    let compute = ScriptedCompute::new(compute());
    step(&mut s, &compute).unwrap();

    let tick = s.tick();
    let capacity = s.cache().capacity(tick);
    let bystander_before = s.status(bystander).unwrap();
    let generated_before = s.status(constrained).unwrap().generated;

    // 42 is '*', outside [0-9].
    compute.push(constrained, vec![42]);
    let err = step(&mut s, &compute).unwrap_err();
    assert!(matches!(
        err,
        Error::GrammarViolation { token: 42, sequence: Some(id) } if id == constrained
    ));
    assert!(err.is_integration());

    // Nothing from the aborted tick was applied.
    assert_eq!(s.status(bystander).unwrap(), bystander_before);
    let failed = s.status(constrained).unwrap();
    assert_eq!(failed.generated, generated_before);
    assert_eq!(failed.state, SequenceState::Failed);
    assert_eq!(failed.failure, Some(FailureReason::GrammarViolation { token: 42 }));
    let after = s.cache().capacity(tick);
    assert_eq!(
        after.free_blocks,
        capacity.free_blocks + failed_blocks(&generated_before, 5, 4)
    );
    assert_capacity(&s);

    // The bystander keeps going.
    step(&mut s, &compute).unwrap();
    assert_eq!(
        s.status(bystander).unwrap().generated.len(),
        bystander_before.generated.len() + 1
    );
}

/// Blocks held by a failed sequence of `prompt_len` + generated tokens
fn failed_blocks(generated: &[TokenId], prompt_len: usize, block_size: usize) -> usize {
    (prompt_len + generated.len()).div_ceil(block_size)
}

/// Run `victim` to completion while a high-priority sequence interrupts it.
/// Returns the victim's output, its preemptions and the positions restored
/// from snapshots.
fn run_with_interruption(config: &EngineConfig) -> (Vec<TokenId>, usize, usize) {
    let mut s = scheduler(config);
    let compute = cached_compute(config);
    let victim = s
        .submit(
            SubmitRequest::new(prompt(0, 8))
                .with_priority(Priority::Low)
                .with_max_new_tokens(12),
            Instant::now(),
        )
        .unwrap();
    for _ in 0..4 {
        step(&mut s, &compute).unwrap();
    }
    // The victim holds 3 of 5 blocks; the intruder needs 3.
    let intruder = s
        .submit(
            SubmitRequest::new(prompt(40, 12))
                .with_priority(Priority::Critical)
                .with_max_new_tokens(4),
            Instant::now(),
        )
        .unwrap();
    step(&mut s, &compute).unwrap();
    assert_eq!(s.status(victim).unwrap().state, SequenceState::Pending);

    run_until_settled(&mut s, &compute, intruder);
    run_until_settled(&mut s, &compute, victim);
    let status = s.status(victim).unwrap();
    assert_eq!(status.state, SequenceState::Completed);
    (status.generated, status.preemptions, compute.restored_positions())
}

#[test]
fn eviction_round_trip_reproduces_output() {
    let config = EngineConfig::new(VOCAB, 5).with_block_size(4);

    let mut reference = scheduler(&config);
    let id = reference
        .submit(
            SubmitRequest::new(prompt(0, 8)).with_max_new_tokens(12),
            Instant::now(),
        )
        .unwrap();
    run_until_settled(&mut reference, &cached_compute(&config), id);
    let expected = reference.status(id).unwrap().generated;
    assert_eq!(expected.len(), 12);

    // The victim had fed its prompt and 3 generated tokens when evicted;
    // all 11 positions come back from the snapshot.
    let (generated, preemptions, restored) = run_with_interruption(&config);
    assert_eq!(preemptions, 1);
    assert_eq!(restored, 11);
    assert_eq!(generated, expected);

    // Without room for snapshots the victim recomputes from its context.
    let mut tight = config.clone();
    tight.cache.snapshot.capacity_bytes = 0;
    let (generated, _, restored) = run_with_interruption(&tight);
    assert_eq!(restored, 0);
    assert_eq!(generated, expected);
}

#[test]
fn resumed_sequence_reads_restored_cache() {
    // A plan that resumes from a snapshot must carry the snapshot content
    // for every position it claims is cached.
    let config = EngineConfig::new(VOCAB, 5).with_block_size(4);
    let mut s = scheduler(&config);
    let compute = cached_compute(&config);
    let victim = s
        .submit(
            SubmitRequest::new(prompt(0, 8))
                .with_priority(Priority::Low)
                .with_max_new_tokens(12),
            Instant::now(),
        )
        .unwrap();
    for _ in 0..4 {
        step(&mut s, &compute).unwrap();
    }
    let intruder = s
        .submit(
            SubmitRequest::new(prompt(40, 12))
                .with_priority(Priority::Critical)
                .with_max_new_tokens(4),
            Instant::now(),
        )
        .unwrap();
    step(&mut s, &compute).unwrap();
    run_until_settled(&mut s, &compute, intruder);

    let plan = s.schedule(Instant::now()).unwrap();
    let entry = plan.entry(victim).unwrap();
    assert!(entry.newly_admitted);
    let restore = entry.restore.clone().unwrap();
    assert_eq!(restore.len(), entry.start_position);
    let context: Vec<TokenId> = prompt(0, 8)
        .into_iter()
        .chain(s.status(victim).unwrap().generated)
        .collect();
    assert_eq!(&restore[..], &context[..restore.len()]);

    let reads_before = compute.cached_reads();
    s.ingest(compute.compute(&plan).unwrap()).unwrap();
    assert_eq!(compute.cached_reads(), reads_before + restore.len());
}

#[test]
fn shared_prefix_blocks_survive_partner_release() {
    let config = EngineConfig::new(VOCAB, 8).with_block_size(4);
    let mut s = scheduler(&config);
    let compute = cached_compute(&config);
    let first = s
        .submit(
            SubmitRequest::new(prompt(0, 9)).with_max_new_tokens(3),
            Instant::now(),
        )
        .unwrap();
    step(&mut s, &compute).unwrap();

    let second = s
        .submit(
            SubmitRequest::new(prompt(0, 9)).with_max_new_tokens(4),
            Instant::now(),
        )
        .unwrap();
    step(&mut s, &compute).unwrap();
    assert_eq!(s.cache().stats().prefix_hit_blocks, 2);
    let shared = s.cache().blocks_of(first)[..2].to_vec();
    assert_eq!(&s.cache().blocks_of(second)[..2], &shared[..]);
    assert_capacity(&s);

    run_until_settled(&mut s, &compute, first);
    for block in &shared {
        assert_eq!(s.cache().pool().ref_count(*block), 1);
    }
    run_until_settled(&mut s, &compute, second);
    assert_eq!(s.cache().num_free_blocks(), 8);
}

#[test]
fn json_schema_output_is_valid_json() {
    let config = EngineConfig::new(VOCAB, 64).with_block_size(4);
    let mut s = scheduler(&config);
    let schema = serde_json::json!({
        "type": "object",
        "properties": {"ok": {"type": "boolean"}},
        "required": ["ok"]
    });
    let id = s
        .submit(
            SubmitRequest::new(prompt(0, 4))
                .with_grammar(GrammarSpec::JsonSchema { schema })
                .with_max_new_tokens(64),
            Instant::now(),
        )
        .unwrap();
    run_until_settled(&mut s, &compute(), id);

    let status = s.status(id).unwrap();
    assert_eq!(status.state, SequenceState::Completed);
    let text: String = status.generated.iter().map(|t| *t as u8 as char).collect();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert!(value["ok"].is_boolean());
}

/// Output the deterministic compute step produces for a sequence run alone
fn reference_output(compute: &DeterministicCompute, prompt: &[TokenId], max_new: usize) -> Vec<TokenId> {
    let mut last = prompt.last().copied().unwrap_or_default();
    (0..max_new)
        .map(|_| {
            last = compute.successor(last);
            last
        })
        .collect()
}

#[test]
fn mixed_workload_matches_isolated_runs() {
    init_tracing();
    let config = EngineConfig::new(VOCAB, 12)
        .with_block_size(4)
        .with_speculation(2, 3)
        .with_compression(Compression::Zstd { level: 3 });
    let mut s = scheduler(&config);
    let compute = cached_compute(&config);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut submitted = Vec::new();
    let mut cancelled = Vec::new();

    for round in 0..40 {
        if rng.gen_bool(0.6) {
            let tokens = prompt(rng.gen_range(0..100), rng.gen_range(1..16));
            let max_new = rng.gen_range(1..12);
            let request = SubmitRequest::new(tokens.clone())
                .with_priority(Priority::ALL[rng.gen_range(0..Priority::ALL.len())])
                .with_max_new_tokens(max_new)
                .with_speculation_budget(rng.gen_range(0..4));
            if let Ok(id) = s.submit(request, Instant::now()) {
                submitted.push((id, tokens, max_new));
            }
        }
        if round % 7 == 6 && !submitted.is_empty() {
            let (id, _, _) = &submitted[rng.gen_range(0..submitted.len())];
            s.cancel(*id).unwrap();
            cancelled.push(*id);
        }
        step(&mut s, &compute).unwrap();
        assert_capacity(&s);
    }
    for _ in 0..2000 {
        if !s.has_work() {
            break;
        }
        step(&mut s, &compute).unwrap();
        assert_capacity(&s);
    }
    assert!(!s.has_work());
    assert_eq!(s.cache().num_free_blocks(), 12);

    for (id, tokens, max_new) in &submitted {
        let status = s.status(*id).unwrap();
        if status.state == SequenceState::Completed {
            assert_eq!(status.generated, reference_output(compute.inner(), tokens, *max_new));
        } else {
            assert_eq!(status.state, SequenceState::Cancelled);
            assert!(cancelled.contains(id));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn admissions_follow_priority(priorities in prop::collection::vec(0usize..5, 1..8)) {
        // Room for exactly one sequence at a time.
        let config = EngineConfig::new(VOCAB, 1).with_block_size(4);
        let mut s = scheduler(&config);
        let now = Instant::now();
        let ids: Vec<(SequenceId, Priority)> = priorities
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let priority = Priority::ALL[*p];
                let request = SubmitRequest::new(prompt(i as TokenId, 3))
                    .with_priority(priority)
                    .with_max_new_tokens(1);
                (s.submit(request, now).unwrap(), priority)
            })
            .collect();

        let mut order = Vec::new();
        for _ in 0..ids.len() {
            step(&mut s, &compute()).unwrap();
            for (id, priority) in &ids {
                let done = s.status(*id).is_some_and(|st| st.state == SequenceState::Completed);
                if done && !order.iter().any(|(o, _)| o == id) {
                    order.push((*id, *priority));
                }
            }
        }
        prop_assert_eq!(order.len(), ids.len());
        for pair in order.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn capacity_holds_under_random_load(
        ops in prop::collection::vec((0usize..5, 1usize..20, 1usize..10, any::<bool>()), 1..24),
    ) {
        let config = EngineConfig::new(VOCAB, 10).with_block_size(4);
        let mut s = scheduler(&config);
        let compute = cached_compute(&config);
        let mut live = Vec::new();
        for (priority, prompt_len, max_new, cancel) in ops {
            let request = SubmitRequest::new(prompt(prompt_len as TokenId, prompt_len))
                .with_priority(Priority::ALL[priority])
                .with_max_new_tokens(max_new);
            if let Ok(id) = s.submit(request, Instant::now()) {
                live.push(id);
            }
            if cancel {
                if let Some(id) = live.first().copied() {
                    s.cancel(id).unwrap();
                }
            }
            step(&mut s, &compute).unwrap();
            assert_capacity(&s);
        }
        for _ in 0..400 {
            if !s.has_work() {
                break;
            }
            step(&mut s, &compute).unwrap();
            assert_capacity(&s);
        }
        prop_assert!(!s.has_work());
        prop_assert_eq!(s.cache().num_free_blocks(), 10);
    }

    #[test]
    fn committed_tokens_conform_to_grammar(seed in 0u32..500, choice in 0usize..3) {
        let pattern = ["[a-c]{2,5}", "(yes|no)!", "-?[1-9][0-9]{0,3}"][choice];
        let config = EngineConfig::new(VOCAB, 16).with_block_size(4);
        let engine = grammar();
        let mut s = Scheduler::new(&config, engine.clone()).unwrap();
        let id = s
            .submit(
                SubmitRequest::new(vec![1, 2, 3])
                    .with_grammar(GrammarSpec::Regex { pattern: pattern.into() })
                    .with_max_new_tokens(16),
                Instant::now(),
            )
            .unwrap();
        let compute = DeterministicCompute::new(VOCAB, EOS).with_seed(seed);
        run_until_settled(&mut s, &compute, id);

        let status = s.status(id).unwrap();
        prop_assert_eq!(status.state, SequenceState::Completed);
        let compiled = engine
            .compile(&GrammarSpec::Regex { pattern: pattern.into() })
            .unwrap();
        let end = engine.advance_all(&compiled, &status.generated).unwrap();
        prop_assert!(end.is_accepting());
    }
}
