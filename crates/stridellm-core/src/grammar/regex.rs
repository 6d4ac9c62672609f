//! Pattern compiler
//!
//! Compiles the regex subset used for constrained decoding into a
//! deterministic character automaton:
//!
//! - literals and escapes (`\d \w \s \D \W \S \n \t \r \xHH \uHHHH`, escaped
//!   metacharacters)
//! - `.`, bracket classes with ranges and negation
//! - groups `( )` and `(?: )`, alternation `|`
//! - quantifiers `* + ?` and `{m}`, `{m,}`, `{m,n}`
//!
//! Patterns always match the whole output, so `^` and `$` are accepted and
//! ignored. The compiled automaton only keeps states from which an accepting
//! state is reachable, so any prefix it accepts can still be completed.

use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap, VecDeque};

const MAX_CODEPOINT: u32 = 0x10FFFF;
const MAX_REPEAT: u32 = 1000;
const MAX_DFA_STATES: usize = 10_000;

/// Inclusive code point range
type Range = (u32, u32);

#[derive(Debug, Clone)]
enum Node {
    Empty,
    Class(Vec<Range>),
    Concat(Vec<Node>),
    Alternate(Vec<Node>),
    Repeat {
        node: Box<Node>,
        min: u32,
        max: Option<u32>,
    },
}

fn normalize(mut ranges: Vec<Range>) -> Vec<Range> {
    ranges.sort_unstable();
    let mut merged: Vec<Range> = Vec::with_capacity(ranges.len());
    for (lo, hi) in ranges {
        match merged.last_mut() {
            Some(last) if lo <= last.1.saturating_add(1) => last.1 = last.1.max(hi),
            _ => merged.push((lo, hi)),
        }
    }
    merged
}

fn complement(ranges: &[Range]) -> Vec<Range> {
    let mut out = Vec::new();
    let mut next = 0u32;
    for &(lo, hi) in ranges {
        if lo > next {
            out.push((next, lo - 1));
        }
        next = hi.saturating_add(1);
    }
    if next <= MAX_CODEPOINT {
        out.push((next, MAX_CODEPOINT));
    }
    out
}

fn single(c: char) -> Vec<Range> {
    vec![(c as u32, c as u32)]
}

fn digit() -> Vec<Range> {
    vec![('0' as u32, '9' as u32)]
}

fn word() -> Vec<Range> {
    normalize(vec![
        ('0' as u32, '9' as u32),
        ('A' as u32, 'Z' as u32),
        ('_' as u32, '_' as u32),
        ('a' as u32, 'z' as u32),
    ])
}

fn space() -> Vec<Range> {
    normalize(vec![(0x09, 0x0D), (0x20, 0x20)])
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(pattern: &str) -> Self {
        Self {
            chars: pattern.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, msg: &str) -> Error {
        Error::InvalidGrammar(format!("{msg} at position {} in pattern", self.pos))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse(mut self) -> Result<Node> {
        let node = self.parse_alternate()?;
        if self.pos < self.chars.len() {
            return Err(self.error("unbalanced ')'"));
        }
        Ok(node)
    }

    fn parse_alternate(&mut self) -> Result<Node> {
        let mut branches = vec![self.parse_concat()?];
        while self.eat('|') {
            branches.push(self.parse_concat()?);
        }
        Ok(if branches.len() == 1 {
            branches.remove(0)
        } else {
            Node::Alternate(branches)
        })
    }

    fn parse_concat(&mut self) -> Result<Node> {
        let mut items = Vec::new();
        while let Some(c) = self.peek() {
            if c == '|' || c == ')' {
                break;
            }
            items.push(self.parse_repeat()?);
        }
        Ok(match items.len() {
            0 => Node::Empty,
            1 => items.remove(0),
            _ => Node::Concat(items),
        })
    }

    fn parse_repeat(&mut self) -> Result<Node> {
        let mut node = self.parse_atom()?;
        loop {
            let (min, max) = match self.peek() {
                Some('*') => {
                    self.pos += 1;
                    (0, None)
                }
                Some('+') => {
                    self.pos += 1;
                    (1, None)
                }
                Some('?') => {
                    self.pos += 1;
                    (0, Some(1))
                }
                Some('{') if self.is_counted_repeat() => self.parse_counted()?,
                _ => break,
            };
            // Lazy quantifiers match the same language.
            self.eat('?');
            node = Node::Repeat {
                node: Box::new(node),
                min,
                max,
            };
        }
        Ok(node)
    }

    fn is_counted_repeat(&self) -> bool {
        let rest = &self.chars[self.pos + 1..];
        let end = match rest.iter().position(|c| *c == '}') {
            Some(end) => end,
            None => return false,
        };
        let body = &rest[..end];
        !body.is_empty()
            && body[0].is_ascii_digit()
            && body.iter().all(|c| c.is_ascii_digit() || *c == ',')
            && body.iter().filter(|c| **c == ',').count() <= 1
    }

    fn parse_number(&mut self) -> Result<u32> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<u32>()
            .map_err(|_| self.error("repetition count out of range"))
    }

    fn parse_counted(&mut self) -> Result<(u32, Option<u32>)> {
        self.pos += 1;
        let min = self.parse_number()?;
        let max = if self.eat(',') {
            if self.peek() == Some('}') {
                None
            } else {
                Some(self.parse_number()?)
            }
        } else {
            Some(min)
        };
        if !self.eat('}') {
            return Err(self.error("unterminated repetition"));
        }
        if max.is_some_and(|max| max < min) {
            return Err(self.error("repetition bounds out of order"));
        }
        if min.max(max.unwrap_or(0)) > MAX_REPEAT {
            return Err(self.error("repetition count too large"));
        }
        Ok((min, max))
    }

    fn parse_atom(&mut self) -> Result<Node> {
        let c = self.bump().ok_or_else(|| self.error("unexpected end"))?;
        match c {
            '(' => {
                if self.eat('?') && !self.eat(':') {
                    return Err(self.error("unsupported group syntax"));
                }
                let inner = self.parse_alternate()?;
                if !self.eat(')') {
                    return Err(self.error("unclosed group"));
                }
                Ok(inner)
            }
            '[' => self.parse_class(),
            '.' => Ok(Node::Class(complement(&single('\n')))),
            '^' | '$' => Ok(Node::Empty),
            '\\' => Ok(Node::Class(self.parse_escape()?)),
            '*' | '+' | '?' => Err(self.error("nothing to repeat")),
            ')' => Err(self.error("unbalanced ')'")),
            c => Ok(Node::Class(single(c))),
        }
    }

    fn parse_escape(&mut self) -> Result<Vec<Range>> {
        let c = self.bump().ok_or_else(|| self.error("dangling escape"))?;
        Ok(match c {
            'd' => digit(),
            'D' => complement(&digit()),
            'w' => word(),
            'W' => complement(&word()),
            's' => space(),
            'S' => complement(&space()),
            'n' => single('\n'),
            't' => single('\t'),
            'r' => single('\r'),
            'f' => single('\x0C'),
            'v' => single('\x0B'),
            'x' => {
                let code = self.parse_hex(2)?;
                vec![(code, code)]
            }
            'u' => {
                let code = self.parse_hex(4)?;
                vec![(code, code)]
            }
            c if c.is_ascii_alphanumeric() => {
                return Err(self.error(&format!("unsupported escape \\{c}")))
            }
            c => single(c),
        })
    }

    fn parse_hex(&mut self, digits: usize) -> Result<u32> {
        let start = self.pos;
        for _ in 0..digits {
            if !self.bump().is_some_and(|c| c.is_ascii_hexdigit()) {
                return Err(self.error("invalid hex escape"));
            }
        }
        let hex: String = self.chars[start..self.pos].iter().collect();
        u32::from_str_radix(&hex, 16).map_err(|_| self.error("invalid hex escape"))
    }

    fn parse_class(&mut self) -> Result<Node> {
        let negated = self.eat('^');
        let mut ranges = Vec::new();
        let mut first = true;
        loop {
            let c = self.bump().ok_or_else(|| self.error("unclosed character class"))?;
            if c == ']' && !first {
                break;
            }
            first = false;
            let lo = if c == '\\' {
                let escaped = self.parse_escape()?;
                if escaped.len() != 1 || escaped[0].0 != escaped[0].1 {
                    ranges.extend(escaped);
                    continue;
                }
                escaped[0].0
            } else {
                c as u32
            };
            if self.peek() == Some('-') && self.chars.get(self.pos + 1).is_some_and(|c| *c != ']')
            {
                self.pos += 1;
                let hi_char = self.bump().ok_or_else(|| self.error("unclosed range"))?;
                let hi = if hi_char == '\\' {
                    let escaped = self.parse_escape()?;
                    if escaped.len() != 1 || escaped[0].0 != escaped[0].1 {
                        return Err(self.error("class escape used as range bound"));
                    }
                    escaped[0].0
                } else {
                    hi_char as u32
                };
                if hi < lo {
                    return Err(self.error("character range out of order"));
                }
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }
        let ranges = normalize(ranges);
        Ok(Node::Class(if negated {
            complement(&ranges)
        } else {
            ranges
        }))
    }
}

#[derive(Default)]
struct NfaState {
    epsilon: Vec<usize>,
    transitions: Vec<(u32, u32, usize)>,
}

#[derive(Default)]
struct Nfa {
    states: Vec<NfaState>,
}

impl Nfa {
    fn add(&mut self) -> usize {
        self.states.push(NfaState::default());
        self.states.len() - 1
    }

    fn epsilon(&mut self, from: usize, to: usize) {
        self.states[from].epsilon.push(to);
    }

    /// Returns (entry, exit) of the fragment
    fn build(&mut self, node: &Node) -> (usize, usize) {
        match node {
            Node::Empty => {
                let s = self.add();
                (s, s)
            }
            Node::Class(ranges) => {
                let s = self.add();
                let e = self.add();
                for &(lo, hi) in ranges {
                    self.states[s].transitions.push((lo, hi, e));
                }
                (s, e)
            }
            Node::Concat(items) => {
                let mut iter = items.iter();
                let (entry, mut exit) = match iter.next() {
                    Some(first) => self.build(first),
                    None => return self.build(&Node::Empty),
                };
                for item in iter {
                    let (a, b) = self.build(item);
                    self.epsilon(exit, a);
                    exit = b;
                }
                (entry, exit)
            }
            Node::Alternate(branches) => {
                let s = self.add();
                let e = self.add();
                for branch in branches {
                    let (a, b) = self.build(branch);
                    self.epsilon(s, a);
                    self.epsilon(b, e);
                }
                (s, e)
            }
            Node::Repeat { node, min, max } => {
                let entry = self.add();
                let mut exit = entry;
                for _ in 0..*min {
                    let (a, b) = self.build(node);
                    self.epsilon(exit, a);
                    exit = b;
                }
                match max {
                    None => {
                        let hub = self.add();
                        let (a, b) = self.build(node);
                        self.epsilon(exit, hub);
                        self.epsilon(hub, a);
                        self.epsilon(b, hub);
                        exit = hub;
                    }
                    Some(max) => {
                        let end = self.add();
                        for _ in *min..*max {
                            let (a, b) = self.build(node);
                            self.epsilon(exit, a);
                            self.epsilon(exit, end);
                            exit = b;
                        }
                        self.epsilon(exit, end);
                        exit = end;
                    }
                }
                (entry, exit)
            }
        }
    }

    fn closure(&self, seeds: impl IntoIterator<Item = usize>) -> BTreeSet<usize> {
        let mut set = BTreeSet::new();
        let mut stack: Vec<usize> = seeds.into_iter().collect();
        while let Some(s) = stack.pop() {
            if set.insert(s) {
                stack.extend(self.states[s].epsilon.iter().copied());
            }
        }
        set
    }
}

#[derive(Debug, Clone)]
struct DfaState {
    /// Sorted, non-overlapping `(lo, hi, target)` transitions
    transitions: Vec<(u32, u32, u32)>,
    accepting: bool,
}

/// Deterministic character automaton
#[derive(Debug, Clone)]
pub struct CharDfa {
    states: Vec<DfaState>,
    start: u32,
}

impl CharDfa {
    /// Compile a pattern
    pub fn compile(pattern: &str) -> Result<Self> {
        let ast = Parser::new(pattern).parse()?;
        let mut nfa = Nfa::default();
        let (entry, accept) = nfa.build(&ast);

        let mut points: BTreeSet<u32> = BTreeSet::new();
        for state in &nfa.states {
            for &(lo, hi, _) in &state.transitions {
                points.insert(lo);
                points.insert(hi.saturating_add(1));
            }
        }
        let points: Vec<u32> = points.into_iter().collect();
        let intervals: Vec<Range> = points
            .windows(2)
            .map(|w| (w[0], w[1] - 1))
            .collect();

        let start_set = nfa.closure([entry]);
        let mut index: HashMap<BTreeSet<usize>, u32> = HashMap::new();
        let mut sets: Vec<BTreeSet<usize>> = Vec::new();
        let mut states: Vec<DfaState> = Vec::new();
        let mut queue = VecDeque::new();

        index.insert(start_set.clone(), 0);
        sets.push(start_set);
        queue.push_back(0u32);

        while let Some(id) = queue.pop_front() {
            let set = sets[id as usize].clone();
            let mut transitions: Vec<(u32, u32, u32)> = Vec::new();
            for &(lo, hi) in &intervals {
                let targets: Vec<usize> = set
                    .iter()
                    .flat_map(|s| nfa.states[*s].transitions.iter())
                    .filter(|(tlo, thi, _)| *tlo <= lo && hi <= *thi)
                    .map(|(_, _, t)| *t)
                    .collect();
                if targets.is_empty() {
                    continue;
                }
                let target_set = nfa.closure(targets);
                let target = match index.get(&target_set) {
                    Some(t) => *t,
                    None => {
                        let t = sets.len() as u32;
                        if sets.len() >= MAX_DFA_STATES {
                            return Err(Error::InvalidGrammar(format!(
                                "pattern expands beyond {MAX_DFA_STATES} automaton states"
                            )));
                        }
                        index.insert(target_set.clone(), t);
                        sets.push(target_set);
                        queue.push_back(t);
                        t
                    }
                };
                match transitions.last_mut() {
                    Some(last) if last.2 == target && last.1.saturating_add(1) == lo => {
                        last.1 = hi
                    }
                    _ => transitions.push((lo, hi, target)),
                }
            }
            states.push(DfaState {
                transitions,
                accepting: set.contains(&accept),
            });
        }

        let mut dfa = CharDfa { states, start: 0 };
        dfa.prune()?;
        Ok(dfa)
    }

    /// Drop transitions into states that can never reach acceptance
    fn prune(&mut self) -> Result<()> {
        let n = self.states.len();
        let mut reverse: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (from, state) in self.states.iter().enumerate() {
            for &(_, _, to) in &state.transitions {
                reverse[to as usize].push(from);
            }
        }
        let mut live = vec![false; n];
        let mut stack: Vec<usize> = (0..n).filter(|s| self.states[*s].accepting).collect();
        while let Some(s) = stack.pop() {
            if !live[s] {
                live[s] = true;
                stack.extend(reverse[s].iter().copied());
            }
        }
        if !live[self.start as usize] {
            return Err(Error::InvalidGrammar("pattern matches nothing".into()));
        }
        for state in &mut self.states {
            state.transitions.retain(|(_, _, to)| live[*to as usize]);
        }
        Ok(())
    }

    /// Initial state
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Number of automaton states
    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    /// Follow one character
    pub fn step(&self, state: u32, c: char) -> Option<u32> {
        let code = c as u32;
        let transitions = &self.states.get(state as usize)?.transitions;
        let idx = transitions.partition_point(|(_, hi, _)| *hi < code);
        transitions
            .get(idx)
            .filter(|(lo, _, _)| *lo <= code)
            .map(|(_, _, to)| *to)
    }

    /// Follow a string; `None` if any character is rejected
    pub fn walk(&self, state: u32, text: &str) -> Option<u32> {
        text.chars().try_fold(state, |s, c| self.step(s, c))
    }

    /// Whether the output may end in this state
    pub fn is_accepting(&self, state: u32) -> bool {
        self.states
            .get(state as usize)
            .is_some_and(|s| s.accepting)
    }

    /// Whether no further character is possible
    pub fn is_exhausted(&self, state: u32) -> bool {
        self.states
            .get(state as usize)
            .map_or(true, |s| s.transitions.is_empty())
    }

    /// Whole-string match
    pub fn matches(&self, text: &str) -> bool {
        self.walk(self.start, text)
            .is_some_and(|s| self.is_accepting(s))
    }
}

/// Escape regex metacharacters in a literal
pub fn escape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if "\\.+*?()|[]{}^$-/".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dfa(pattern: &str) -> CharDfa {
        CharDfa::compile(pattern).unwrap()
    }

    #[test]
    fn test_literals_and_alternation() {
        let d = dfa("cat|dog");
        assert!(d.matches("cat"));
        assert!(d.matches("dog"));
        assert!(!d.matches("ca"));
        assert!(!d.matches("cow"));
    }

    #[test]
    fn test_classes() {
        let d = dfa(r"[a-c]\d[^x]");
        assert!(d.matches("a1y"));
        assert!(d.matches("c9 "));
        assert!(!d.matches("d1y"));
        assert!(!d.matches("a1x"));

        let w = dfa(r"\w+\s\S");
        assert!(w.matches("hello_1 !"));
        assert!(!w.matches("hello  "));
    }

    #[test]
    fn test_quantifiers() {
        let d = dfa("ab*c+d?");
        assert!(d.matches("ac"));
        assert!(d.matches("abbbccd"));
        assert!(!d.matches("abd"));

        let counted = dfa("x{2,3}y{2}z{1,}");
        assert!(counted.matches("xxyyz"));
        assert!(counted.matches("xxxyyzzz"));
        assert!(!counted.matches("xyyz"));
        assert!(!counted.matches("xxxxyyz"));
        assert!(!counted.matches("xxyz"));
    }

    #[test]
    fn test_groups() {
        let d = dfa("(?:ab)+(c|de)");
        assert!(d.matches("abababde"));
        assert!(d.matches("abc"));
        assert!(!d.matches("abd"));
    }

    #[test]
    fn test_literal_brace_is_not_repeat() {
        let d = dfa(r#"\{"a":1\}"#);
        assert!(d.matches(r#"{"a":1}"#));
        let plain = dfa("{x}");
        assert!(plain.matches("{x}"));
    }

    #[test]
    fn test_dead_ends_are_pruned() {
        let d = dfa("ab|ac");
        let s = d.step(d.start(), 'a').unwrap();
        assert!(d.step(s, 'b').is_some());
        assert!(d.step(s, 'd').is_none());
        let done = d.walk(d.start(), "ab").unwrap();
        assert!(d.is_accepting(done));
        assert!(d.is_exhausted(done));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(CharDfa::compile("(ab").is_err());
        assert!(CharDfa::compile("ab)").is_err());
        assert!(CharDfa::compile("*a").is_err());
        assert!(CharDfa::compile("[z-a]").is_err());
        assert!(CharDfa::compile("a{5,2}").is_err());
        assert!(CharDfa::compile(r"\q").is_err());
    }

    #[test]
    fn test_escape_literal() {
        let pattern = escape("a.b*(c)");
        let d = dfa(&pattern);
        assert!(d.matches("a.b*(c)"));
        assert!(!d.matches("axb*(c)"));
    }
}
