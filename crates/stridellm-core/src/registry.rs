//! Vocabulary and named grammar registry
//!
//! Built once at startup and shared by reference (usually behind an `Arc`)
//! with the grammar engine and the scheduler. Nothing in it changes after
//! construction.

use crate::error::{Error, Result};
use crate::grammar::GrammarSpec;
use crate::types::TokenId;
use std::collections::{HashMap, HashSet};

/// Token vocabulary, special tokens and named grammars
#[derive(Debug, Clone)]
pub struct Registry {
    /// Decoded text of each token ID
    vocab: Vec<String>,

    /// End-of-sequence token
    eos_token_id: TokenId,

    /// Tokens that never match grammar text (control tokens)
    special_tokens: HashSet<TokenId>,

    /// Grammars addressable by name from `GrammarSpec::Named`
    grammars: HashMap<String, GrammarSpec>,
}

impl Registry {
    /// Create a registry from decoded token texts
    pub fn new(vocab: Vec<String>, eos_token_id: TokenId) -> Result<Self> {
        if vocab.is_empty() {
            return Err(Error::InvalidConfig("vocabulary is empty".into()));
        }
        if eos_token_id as usize >= vocab.len() {
            return Err(Error::InvalidConfig(format!(
                "eos token {} outside vocabulary of {}",
                eos_token_id,
                vocab.len()
            )));
        }
        let mut special_tokens = HashSet::new();
        special_tokens.insert(eos_token_id);
        Ok(Self {
            vocab,
            eos_token_id,
            special_tokens,
            grammars: HashMap::new(),
        })
    }

    /// Single-character ASCII vocabulary: IDs `0..128` decode to the
    /// matching character (printable ones only), ID 128 is EOS.
    pub fn ascii() -> Self {
        let mut vocab: Vec<String> = (0u8..128)
            .map(|b| {
                if (0x20..0x7f).contains(&b) {
                    (b as char).to_string()
                } else {
                    String::new()
                }
            })
            .collect();
        vocab.push("</s>".to_string());
        let special_tokens = std::iter::once(128).collect();
        Self {
            vocab,
            eos_token_id: 128,
            special_tokens,
            grammars: HashMap::new(),
        }
    }

    /// Mark a token as special
    pub fn with_special_token(mut self, token: TokenId) -> Self {
        self.special_tokens.insert(token);
        self
    }

    /// Register a named grammar
    pub fn with_grammar(mut self, name: impl Into<String>, spec: GrammarSpec) -> Result<Self> {
        let name = name.into();
        if matches!(spec, GrammarSpec::Named { .. }) {
            return Err(Error::InvalidGrammar(format!(
                "grammar '{name}' cannot alias another named grammar"
            )));
        }
        self.grammars.insert(name, spec);
        Ok(self)
    }

    /// Vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// End-of-sequence token
    pub fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    /// Decoded text of a token
    pub fn token_text(&self, token: TokenId) -> Option<&str> {
        self.vocab.get(token as usize).map(String::as_str)
    }

    /// Whether a token carries no grammar-visible text
    pub fn is_special(&self, token: TokenId) -> bool {
        self.special_tokens.contains(&token)
            || self.token_text(token).map_or(true, str::is_empty)
    }

    /// Iterate over `(id, text)` for every token with grammar-visible text
    pub fn text_tokens(&self) -> impl Iterator<Item = (TokenId, &str)> + '_ {
        self.vocab
            .iter()
            .enumerate()
            .map(|(id, text)| (id as TokenId, text.as_str()))
            .filter(|(id, _)| !self.is_special(*id))
    }

    /// Look up a named grammar
    pub fn grammar(&self, name: &str) -> Option<&GrammarSpec> {
        self.grammars.get(name)
    }

    /// Names of all registered grammars
    pub fn grammar_names(&self) -> impl Iterator<Item = &str> {
        self.grammars.keys().map(String::as_str)
    }
}
