//! Structured decoding
//!
//! Grammars are compiled once into a [`Grammar`] and shared through `Arc`.
//! Each sequence carries a [`GrammarState`], an immutable automaton position
//! that is replaced (never mutated) when a token is accepted. Rejected
//! speculative branches therefore never touch the committed state.
//!
//! Every grammar kind answers the same two questions through
//! [`GrammarEngine`]: which tokens may come next ([`GrammarEngine::mask`])
//! and where the automaton goes after a token ([`GrammarEngine::advance`]).

mod json_schema;
mod mask;
mod regex;
mod token_trie;

pub use json_schema::schema_to_pattern;
pub use mask::TokenMask;
pub use regex::CharDfa;
pub use token_trie::TokenTrie;

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::types::TokenId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const DEFAULT_MASK_CACHE_ENTRIES: usize = 16_384;
const DEFAULT_COMPILED_CACHE_ENTRIES: usize = 256;

/// Output constraint attached to a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GrammarSpec {
    /// Output text must match the pattern
    Regex {
        /// Pattern in the supported regex subset
        pattern: String,
    },

    /// Output text must match one of the patterns
    Choice {
        /// One pattern per alternative
        alternatives: Vec<String>,
    },

    /// Output text must be compact JSON valid under the schema
    JsonSchema {
        /// Schema document
        schema: serde_json::Value,
    },

    /// Output tokens must equal one of the sequences
    TokenSequences {
        /// Permitted token sequences
        sequences: Vec<Vec<TokenId>>,
    },

    /// A grammar registered under this name
    Named {
        /// Registry key
        name: String,
    },
}

/// Compiled automaton, one variant per grammar kind
#[derive(Debug, Clone)]
pub enum CompiledGrammar {
    /// Character automaton from a pattern
    Regex(CharDfa),

    /// Alternatives tracked in parallel
    Choice(Vec<CharDfa>),

    /// Character automaton derived from a JSON schema
    JsonSchema(CharDfa),

    /// Token-level prefix tree
    TokenSequences(TokenTrie),
}

/// A compiled grammar with a process-unique identity
#[derive(Debug)]
pub struct Grammar {
    id: u64,
    compiled: CompiledGrammar,
}

impl Grammar {
    fn new(compiled: CompiledGrammar) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            compiled,
        }
    }

    /// Compiled automaton
    pub fn compiled(&self) -> &CompiledGrammar {
        &self.compiled
    }

    fn initial_position(&self) -> Position {
        match &self.compiled {
            CompiledGrammar::Regex(dfa) | CompiledGrammar::JsonSchema(dfa) => {
                Position::Chars(dfa.start())
            }
            CompiledGrammar::Choice(dfas) => {
                Position::Choice(dfas.iter().map(|d| Some(d.start())).collect())
            }
            CompiledGrammar::TokenSequences(trie) => Position::Tokens(trie.root()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Position {
    Chars(u32),
    Choice(Vec<Option<u32>>),
    Tokens(u32),
}

/// Automaton position of one sequence
#[derive(Debug, Clone)]
pub struct GrammarState {
    grammar: Arc<Grammar>,
    position: Position,
}

impl PartialEq for GrammarState {
    fn eq(&self, other: &Self) -> bool {
        self.grammar.id == other.grammar.id && self.position == other.position
    }
}

impl Eq for GrammarState {}

impl GrammarState {
    /// Start state of a compiled grammar
    pub fn new(grammar: Arc<Grammar>) -> Self {
        let position = grammar.initial_position();
        Self { grammar, position }
    }

    /// The grammar this state belongs to
    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.grammar
    }

    /// Whether the output may end here
    pub fn is_accepting(&self) -> bool {
        match (&self.grammar.compiled, &self.position) {
            (CompiledGrammar::Regex(dfa), Position::Chars(s))
            | (CompiledGrammar::JsonSchema(dfa), Position::Chars(s)) => dfa.is_accepting(*s),
            (CompiledGrammar::Choice(dfas), Position::Choice(positions)) => dfas
                .iter()
                .zip(positions)
                .any(|(dfa, p)| p.is_some_and(|p| dfa.is_accepting(p))),
            (CompiledGrammar::TokenSequences(trie), Position::Tokens(n)) => trie.is_terminal(*n),
            _ => false,
        }
    }

    /// Whether the grammar admits nothing but end-of-sequence
    pub fn is_complete(&self) -> bool {
        match (&self.grammar.compiled, &self.position) {
            (CompiledGrammar::Regex(dfa), Position::Chars(s))
            | (CompiledGrammar::JsonSchema(dfa), Position::Chars(s)) => dfa.is_exhausted(*s),
            (CompiledGrammar::Choice(dfas), Position::Choice(positions)) => dfas
                .iter()
                .zip(positions)
                .all(|(dfa, p)| p.map_or(true, |p| dfa.is_exhausted(p))),
            (CompiledGrammar::TokenSequences(trie), Position::Tokens(n)) => trie.is_leaf(*n),
            _ => true,
        }
    }

    /// Whether multi-token drafts may be proposed from here
    pub fn supports_lookahead(&self) -> bool {
        !self.is_complete()
    }

    fn walk_text(&self, text: &str) -> Option<Position> {
        match (&self.grammar.compiled, &self.position) {
            (CompiledGrammar::Regex(dfa), Position::Chars(s))
            | (CompiledGrammar::JsonSchema(dfa), Position::Chars(s)) => {
                dfa.walk(*s, text).map(Position::Chars)
            }
            (CompiledGrammar::Choice(dfas), Position::Choice(positions)) => {
                let next: Vec<Option<u32>> = dfas
                    .iter()
                    .zip(positions)
                    .map(|(dfa, p)| p.and_then(|p| dfa.walk(p, text)))
                    .collect();
                next.iter().any(Option::is_some).then_some(Position::Choice(next))
            }
            _ => None,
        }
    }
}

/// Compiles grammars and answers mask/advance queries
pub struct GrammarEngine {
    registry: Arc<Registry>,

    /// Compiled grammars keyed by their serialized definition
    compiled: Mutex<HashMap<String, Arc<Grammar>>>,

    /// Masks keyed by grammar identity and position
    masks: Mutex<HashMap<(u64, Position), Arc<TokenMask>>>,

    max_cached_masks: usize,

    max_compiled: usize,
}

impl GrammarEngine {
    /// Create an engine over a vocabulary
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            compiled: Mutex::new(HashMap::new()),
            masks: Mutex::new(HashMap::new()),
            max_cached_masks: DEFAULT_MASK_CACHE_ENTRIES,
            max_compiled: DEFAULT_COMPILED_CACHE_ENTRIES,
        }
    }

    /// Bound the number of cached compiled grammars
    pub fn with_compiled_cache_entries(mut self, entries: usize) -> Self {
        self.max_compiled = entries;
        self
    }

    /// Bound the number of cached masks
    pub fn with_mask_cache_entries(mut self, entries: usize) -> Self {
        self.max_cached_masks = entries;
        self
    }

    /// Shared registry
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Vocabulary size masks are built for
    pub fn vocab_size(&self) -> usize {
        self.registry.vocab_size()
    }

    /// Compile a grammar definition (cached) and return its start state
    pub fn compile(&self, spec: &GrammarSpec) -> Result<GrammarState> {
        let spec = match spec {
            GrammarSpec::Named { name } => self
                .registry
                .grammar(name)
                .ok_or_else(|| Error::InvalidGrammar(format!("unknown grammar '{name}'")))?,
            other => other,
        };
        let key = serde_json::to_string(spec)?;
        if let Some(grammar) = self.compiled.lock().get(&key) {
            return Ok(GrammarState::new(grammar.clone()));
        }

        let compiled = match spec {
            GrammarSpec::Regex { pattern } => CompiledGrammar::Regex(CharDfa::compile(pattern)?),
            GrammarSpec::Choice { alternatives } => {
                if alternatives.is_empty() {
                    return Err(Error::InvalidGrammar("choice has no alternatives".into()));
                }
                CompiledGrammar::Choice(
                    alternatives
                        .iter()
                        .map(|p| CharDfa::compile(p))
                        .collect::<Result<_>>()?,
                )
            }
            GrammarSpec::JsonSchema { schema } => {
                CompiledGrammar::JsonSchema(CharDfa::compile(&schema_to_pattern(schema)?)?)
            }
            GrammarSpec::TokenSequences { sequences } => {
                if let Some(bad) = sequences
                    .iter()
                    .flatten()
                    .find(|t| **t as usize >= self.registry.vocab_size())
                {
                    return Err(Error::InvalidGrammar(format!(
                        "token {bad} outside vocabulary"
                    )));
                }
                CompiledGrammar::TokenSequences(TokenTrie::new(sequences)?)
            }
            GrammarSpec::Named { name } => {
                return Err(Error::InvalidGrammar(format!(
                    "grammar '{name}' resolves to another named grammar"
                )))
            }
        };

        let grammar = Arc::new(Grammar::new(compiled));
        tracing::debug!("Compiled grammar {} ({} bytes of spec)", grammar.id, key.len());
        self.remember(key, grammar.clone());
        Ok(GrammarState::new(grammar))
    }

    /// Cache a compiled grammar. When full, grammars no live state holds are
    /// dropped first along with their masks; if every entry is still in use
    /// the new grammar is served uncached.
    fn remember(&self, key: String, grammar: Arc<Grammar>) {
        let mut compiled = self.compiled.lock();
        if compiled.len() >= self.max_compiled {
            let mut dropped = Vec::new();
            compiled.retain(|_, g| {
                let held = Arc::strong_count(g) > 1;
                if !held {
                    dropped.push(g.id);
                }
                held
            });
            if !dropped.is_empty() {
                tracing::debug!("Dropped {} unused compiled grammars", dropped.len());
                self.masks
                    .lock()
                    .retain(|(id, _), _| !dropped.contains(id));
            }
        }
        if compiled.len() < self.max_compiled {
            compiled.insert(key, grammar);
        }
    }

    /// Number of cached compiled grammars
    pub fn cached_grammars(&self) -> usize {
        self.compiled.lock().len()
    }

    /// Allowed next tokens for a state
    pub fn mask(&self, state: &GrammarState) -> Arc<TokenMask> {
        let key = (state.grammar.id, state.position.clone());
        if let Some(mask) = self.masks.lock().get(&key) {
            return mask.clone();
        }

        let mask = Arc::new(self.compute_mask(state));
        let mut masks = self.masks.lock();
        if masks.len() >= self.max_cached_masks {
            masks.clear();
        }
        masks.insert(key, mask.clone());
        mask
    }

    fn compute_mask(&self, state: &GrammarState) -> TokenMask {
        let mut mask = TokenMask::empty(self.registry.vocab_size());
        match (&state.grammar.compiled, &state.position) {
            (CompiledGrammar::TokenSequences(trie), Position::Tokens(n)) => {
                for token in trie.next_tokens(*n) {
                    mask.insert(token);
                }
            }
            _ => {
                for (token, text) in self.registry.text_tokens() {
                    if state.walk_text(text).is_some() {
                        mask.insert(token);
                    }
                }
            }
        }
        let eos = self.registry.eos_token_id();
        if state.is_accepting() {
            mask.insert(eos);
        } else {
            mask.remove(eos);
        }
        mask
    }

    /// State after accepting `token`; the input state is left untouched
    pub fn advance(&self, state: &GrammarState, token: TokenId) -> Result<GrammarState> {
        let violation = || Error::GrammarViolation {
            sequence: None,
            token,
        };
        if token == self.registry.eos_token_id() {
            return if state.is_accepting() {
                Ok(state.clone())
            } else {
                Err(violation())
            };
        }

        let position = match (&state.grammar.compiled, &state.position) {
            (CompiledGrammar::TokenSequences(trie), Position::Tokens(n)) => {
                Position::Tokens(trie.step(*n, token).ok_or_else(violation)?)
            }
            _ => {
                if self.registry.is_special(token) {
                    return Err(violation());
                }
                let text = self.registry.token_text(token).ok_or_else(violation)?;
                state.walk_text(text).ok_or_else(violation)?
            }
        };
        Ok(GrammarState {
            grammar: state.grammar.clone(),
            position,
        })
    }

    /// Advance through several tokens
    pub fn advance_all(&self, state: &GrammarState, tokens: &[TokenId]) -> Result<GrammarState> {
        tokens
            .iter()
            .try_fold(state.clone(), |s, t| self.advance(&s, *t))
    }

    /// Number of cached masks
    pub fn cached_masks(&self) -> usize {
        self.masks.lock().len()
    }
}

impl std::fmt::Debug for GrammarEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrammarEngine")
            .field("vocab_size", &self.registry.vocab_size())
            .field("compiled", &self.compiled.lock().len())
            .field("cached_masks", &self.masks.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn engine() -> GrammarEngine {
        GrammarEngine::new(Arc::new(Registry::ascii()))
    }

    fn tok(c: char) -> TokenId {
        c as TokenId
    }

    const EOS: TokenId = 128;

    #[test]
    fn test_regex_mask_and_advance() {
        let engine = engine();
        let state = engine
            .compile(&GrammarSpec::Regex {
                pattern: "ab+".into(),
            })
            .unwrap();

        let mask = engine.mask(&state);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![tok('a')]);

        let after_a = engine.advance(&state, tok('a')).unwrap();
        assert!(!after_a.is_accepting());
        let after_b = engine.advance(&after_a, tok('b')).unwrap();
        assert!(after_b.is_accepting());
        assert!(!after_b.is_complete());
        let mask = engine.mask(&after_b);
        assert!(mask.contains(tok('b')));
        assert!(mask.contains(EOS));

        assert!(matches!(
            engine.advance(&after_a, tok('c')),
            Err(Error::GrammarViolation { token, .. }) if token == tok('c')
        ));
        assert!(engine.advance(&after_a, EOS).is_err());
        assert!(engine.advance(&after_b, EOS).is_ok());
    }

    #[test]
    fn test_advance_does_not_mutate_input() {
        let engine = engine();
        let state = engine
            .compile(&GrammarSpec::Regex {
                pattern: "xy".into(),
            })
            .unwrap();
        let snapshot = state.clone();
        let _ = engine.advance(&state, tok('x')).unwrap();
        let _ = engine.advance(&state, tok('q'));
        assert_eq!(state, snapshot);
    }

    #[test]
    fn test_mask_cache() {
        let engine = engine();
        let state = engine
            .compile(&GrammarSpec::Regex {
                pattern: "[0-9]+".into(),
            })
            .unwrap();
        let first = engine.mask(&state);
        let second = engine.mask(&state);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.count(), 10);
        assert_eq!(engine.cached_masks(), 1);

        let again = engine
            .compile(&GrammarSpec::Regex {
                pattern: "[0-9]+".into(),
            })
            .unwrap();
        assert_eq!(again, state);
    }

    #[test]
    fn test_compiled_cache_is_bounded() {
        let engine = engine().with_compiled_cache_entries(4);
        for i in 0..50 {
            let state = engine
                .compile(&GrammarSpec::Regex {
                    pattern: format!("a{i}"),
                })
                .unwrap();
            engine.mask(&state);
            assert!(engine.cached_grammars() <= 4);
        }
        assert!(engine.cached_masks() <= 4);

        // Grammars still held by a state survive; new ones are served uncached
        let held: Vec<GrammarState> = (0..4)
            .map(|i| {
                engine
                    .compile(&GrammarSpec::Regex {
                        pattern: format!("b{i}"),
                    })
                    .unwrap()
            })
            .collect();
        let extra = engine
            .compile(&GrammarSpec::Regex {
                pattern: "c+".into(),
            })
            .unwrap();
        assert_eq!(engine.cached_grammars(), 4);
        assert!(engine.advance(&extra, tok('c')).is_ok());
        let again = engine
            .compile(&GrammarSpec::Regex {
                pattern: "b0".into(),
            })
            .unwrap();
        assert_eq!(again, held[0]);
    }

    #[test]
    fn test_choice_tracks_alternatives() {
        let engine = engine();
        let state = engine
            .compile(&GrammarSpec::Choice {
                alternatives: vec!["yes".into(), "yeah".into(), "no".into()],
            })
            .unwrap();
        let state = engine.advance_all(&state, &[tok('y'), tok('e')]).unwrap();
        let mask = engine.mask(&state);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![tok('a'), tok('s')]);

        let done = engine.advance(&state, tok('s')).unwrap();
        assert!(done.is_complete());
        assert!(!done.supports_lookahead());
        assert_eq!(engine.mask(&done).iter().collect::<Vec<_>>(), vec![EOS]);
    }

    #[test]
    fn test_token_sequences() {
        let engine = engine();
        let state = engine
            .compile(&GrammarSpec::TokenSequences {
                sequences: vec![vec![5, 6], vec![5, 7, 8]],
            })
            .unwrap();
        assert_eq!(engine.mask(&state).iter().collect::<Vec<_>>(), vec![5]);
        let state = engine.advance(&state, 5).unwrap();
        assert_eq!(engine.mask(&state).iter().collect::<Vec<_>>(), vec![6, 7]);
        let state = engine.advance(&state, 6).unwrap();
        assert!(state.is_complete());
        assert!(engine.advance(&state, 8).is_err());

        assert!(engine
            .compile(&GrammarSpec::TokenSequences {
                sequences: vec![vec![1000]],
            })
            .is_err());
    }

    #[test]
    fn test_json_schema_grammar() {
        let engine = engine();
        let state = engine
            .compile(&GrammarSpec::JsonSchema {
                schema: json!({
                    "type": "object",
                    "properties": {"ok": {"type": "boolean"}},
                    "required": ["ok"]
                }),
            })
            .unwrap();
        let text = r#"{"ok":false}"#;
        let tokens: Vec<TokenId> = text.chars().map(tok).collect();
        let done = engine.advance_all(&state, &tokens).unwrap();
        assert!(done.is_complete());
        assert!(done.is_accepting());
    }

    #[test]
    fn test_named_grammar() {
        let registry = Registry::ascii()
            .with_grammar(
                "digit",
                GrammarSpec::Regex {
                    pattern: r"\d".into(),
                },
            )
            .unwrap();
        let engine = GrammarEngine::new(Arc::new(registry));
        let state = engine
            .compile(&GrammarSpec::Named {
                name: "digit".into(),
            })
            .unwrap();
        assert_eq!(engine.mask(&state).count(), 10);
        assert!(engine
            .compile(&GrammarSpec::Named {
                name: "nope".into(),
            })
            .is_err());
    }

    #[test]
    fn test_spec_from_json() {
        let spec: GrammarSpec =
            serde_json::from_str(r#"{"type": "choice", "alternatives": ["a", "b"]}"#).unwrap();
        assert_eq!(
            spec,
            GrammarSpec::Choice {
                alternatives: vec!["a".into(), "b".into()]
            }
        );
    }

    proptest! {
        #[test]
        fn prop_masked_walk_stays_in_language(choices in proptest::collection::vec(0usize..64, 1..24)) {
            let engine = engine();
            let mut state = engine
                .compile(&GrammarSpec::Regex { pattern: r"(?:[a-c]\d){1,6}".into() })
                .unwrap();
            let mut text = String::new();
            for pick in choices {
                let mask = engine.mask(&state);
                let allowed: Vec<TokenId> = mask.iter().collect();
                prop_assert!(!allowed.is_empty());
                let token = allowed[pick % allowed.len()];
                if token == EOS {
                    break;
                }
                state = engine.advance(&state, token).unwrap();
                text.push(char::from_u32(token).unwrap());
            }
            // Every committed prefix extends to a full match.
            let dfa = CharDfa::compile(r"(?:[a-c]\d){1,6}").unwrap();
            prop_assert!(dfa.walk(dfa.start(), &text).is_some());
        }
    }
}
