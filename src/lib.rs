//! Counting automata built from regex derivatives, matched by a lazy
//! counter-set automaton.
//!
//! Bounded repetitions such as `a{0,500}` are not unrolled.  Instead the
//! pattern is compiled into a **counting automaton** (CA): each state is a
//! derivative residual of the pattern, and transitions carry guards and
//! operators over one counter per counting loop.  Matching runs a
//! **counter-set automaton** (CSA) over the CA: a subset construction that
//! is built on demand, one `(configuration, symbol class)` pair at a time,
//! and that tracks whole *sets* of counter values per live state.
//!
//! # Architecture
//!
//! ```text
//! regex_syntax::hir::Hir ──lower──> SyntaxTree ──normalize──> residual 0
//!                                                                 │
//!            classify / compose / derive (worklist, CaBuilder) <──┘
//!                                   │
//!          remove_unreachable_states + delimit_counting_loops
//!                                   │
//!                                   v
//!                           CountingAutomaton ──> Csa ──> Matcher
//! ```
//!
//! ## Residuals
//!
//! The syntax tree is an arena of hash-consed nodes, so a residual is
//! identified by its [`NodeId`] and two structurally identical residuals are
//! the same CA state.  Bounded repeats carry a [`LoopId`] assigned per
//! syntactic occurrence, which keeps `a{2}a{2}` from collapsing its two
//! loops into one.
//!
//! ## Counters
//!
//! A counting loop is *in scope* of a CA state when its repeat node is an
//! element of the state's top-level concatenation; e.g. in `b{1,2}(ab{1,2}){2,3}`
//! both the inner and the outer loop are live.  A loop outside the scope has
//! the value 0.  Operators act on the scope:
//!
//! ```text
//! INCR(l)   guard value < max    value += 1
//! EXIT(l)   guard value >= min   drop the counter
//! EXIT1(l)  guard value >= min   restart the counter at 1
//! ID                             no-op
//! ```
//!
//! ## Counter sets
//!
//! A CSA state holds one [`CounterSet`] per loop in scope and stands for the
//! product of those sets.  Sets use an offset representation
//! (`value = offset - entry`), so incrementing every member is O(1) and the
//! guards only look at the two ends of the list.  States reaching the same
//! CA state are merged whenever they differ in at most one slot; for the
//! common single-loop case that folds every path into one set, which is what
//! keeps `[ab]*a{2,1000}` at two counter sets however long the input is.
//!
//! Matching is whole-input: `^` and `$` at the pattern boundaries are
//! redundant and are removed during normalization.

use std::fmt;

use regex_syntax::hir;

pub mod algebra;
pub mod ca;
pub mod classes;
pub mod csa;
pub mod equation;
pub mod syntax;

/// Re-export so users do not need a direct `regex-syntax` dependency.
pub use regex_syntax::hir::Hir;

pub use algebra::{CounterGuard, CounterOperator, GuardKind, GuardSet, OperatorKind};
pub use ca::{
    CaBuilder, CaState, CaStateIdx, CaTransition, CountingAutomaton, FinalStateCondition,
};
pub use classes::{SymbolClass, SymbolClassTable};
pub use csa::{Config, CounterSet, Csa, Matcher};
pub use equation::{Equation, EquationKind};
pub use syntax::{CountingLoop, LoopId, Node, NodeId, SyntaxTree};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// An error returned while compiling a pattern or running the matcher.
#[derive(Debug)]
pub enum Error {
    /// A Unicode character class that cannot be lowered to single bytes
    /// (i.e. contains codepoints above U+00FF).
    UnsupportedClass(hir::Class),
    /// A look-around assertion other than `^` (Start) or `$` (End) was
    /// encountered (e.g. `\b`, `\B`).
    UnsupportedLook(hir::Look),
    /// A node kind that the derivative equations do not cover reached the
    /// classifier.  Normalization removes all of them, so this points at a
    /// tree that skipped [`SyntaxTree::normalize`].
    UnsupportedConstruct { kind: &'static str },
    /// A single transition tried to increment a counter that already carries
    /// a pending increment.
    InconsistentCounterUpdate { state: CaStateIdx, loop_id: LoopId },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedClass(class) => {
                write!(f, "unsupported character class: {:?}", class)
            }
            Self::UnsupportedLook(look) => {
                write!(f, "unsupported look-around assertion: {:?}", look)
            }
            Self::UnsupportedConstruct { kind } => {
                write!(f, "unsupported construct reached the classifier: {}", kind)
            }
            Self::InconsistentCounterUpdate { state, loop_id } => {
                write!(
                    f,
                    "double increment of counting loop {} on a transition out of state {}",
                    loop_id, state
                )
            }
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use itertools::Itertools;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::syntax::Anchor;

    /// Parse a pattern into byte-oriented HIR.
    ///
    /// Uses `TranslatorBuilder` with `utf8(false)` so that `.` in `(?s-u)`
    /// mode produces a `Class::Bytes` covering all 256 byte values.
    pub(crate) fn parse_hir_bytes(pattern: &str) -> Hir {
        use regex_syntax::ast::parse::ParserBuilder;
        use regex_syntax::hir::translate::TranslatorBuilder;

        let full = format!("(?s-u){}", pattern);
        let ast = ParserBuilder::new()
            .build()
            .parse(&full)
            .expect("regex-syntax AST parse should succeed");
        TranslatorBuilder::new()
            .utf8(false)
            .build()
            .translate(&full, &ast)
            .expect("regex-syntax HIR translation should succeed")
    }

    /// Whole-input match of `id` by direct recursion over the tree, tracking
    /// the set of positions each node can end at.
    pub(crate) fn reference_is_match(tree: &SyntaxTree, id: NodeId, input: &[u8]) -> bool {
        ends(tree, id, input, &BTreeSet::from([0])).contains(&input.len())
    }

    fn ends(tree: &SyntaxTree, id: NodeId, input: &[u8], starts: &BTreeSet<usize>) -> BTreeSet<usize> {
        let step = |accepts: &dyn Fn(u8) -> bool| -> BTreeSet<usize> {
            starts
                .iter()
                .filter(|&&p| p < input.len() && accepts(input[p]))
                .map(|&p| p + 1)
                .collect()
        };
        match tree.node(id) {
            Node::EmptyMatch => starts.clone(),
            Node::NoMatch => BTreeSet::new(),
            Node::Literal(b) => step(&|c: u8| c == *b),
            Node::LiteralString(bytes) => starts
                .iter()
                .filter(|&&p| input[p..].starts_with(bytes))
                .map(|&p| p + bytes.len())
                .collect(),
            Node::Class { class, negated } => {
                let set = tree.effective_class(*class, *negated);
                step(&|c: u8| set[c])
            }
            Node::AnyByte => step(&|_: u8| true),
            Node::Look(Anchor::Start) => starts.iter().copied().filter(|&p| p == 0).collect(),
            Node::Look(Anchor::End) => starts.iter().copied().filter(|&p| p == input.len()).collect(),
            Node::Concat(items) => items
                .iter()
                .fold(starts.clone(), |acc, &item| ends(tree, item, input, &acc)),
            Node::Alternate(branches) => branches
                .iter()
                .flat_map(|&branch| ends(tree, branch, input, starts))
                .collect(),
            Node::Star(sub) => repeat_ends(tree, *sub, 0, None, input, starts),
            Node::Plus(sub) => repeat_ends(tree, *sub, 1, None, input, starts),
            Node::Quest(sub) => repeat_ends(tree, *sub, 0, Some(1), input, starts),
            Node::Repeat { sub, min, max, .. } => repeat_ends(tree, *sub, *min, *max, input, starts),
            Node::Capture(sub) => ends(tree, *sub, input, starts),
        }
    }

    fn repeat_ends(
        tree: &SyntaxTree,
        sub: NodeId,
        min: u32,
        max: Option<u32>,
        input: &[u8],
        starts: &BTreeSet<usize>,
    ) -> BTreeSet<usize> {
        // Past `min + len + 1` iterations no new end position appears.
        let cap = u64::from(min) + input.len() as u64 + 1;
        let bound = max.map_or(cap, |max| u64::from(max).min(cap));
        let mut frontier = starts.clone();
        let mut out = BTreeSet::new();
        let mut i = 0;
        loop {
            if i >= u64::from(min) {
                out.extend(frontier.iter().copied());
            }
            if i == bound {
                break;
            }
            frontier = ends(tree, sub, input, &frontier);
            if frontier.is_empty() {
                break;
            }
            i += 1;
        }
        out
    }

    fn compile(pattern: &str) -> Csa {
        let ca = CaBuilder::default()
            .build(&parse_hir_bytes(pattern))
            .unwrap_or_else(|e| panic!("failed to build {:?}: {}", pattern, e));
        Csa::new(ca)
    }

    fn oracle(pattern: &str) -> regex::bytes::Regex {
        regex::bytes::Regex::new(&format!("(?s-u)^(?:{})$", pattern)).expect("the regex crate should accept the pattern")
    }

    fn corpus(alphabet: &[u8], max_len: usize) -> impl Iterator<Item = Vec<u8>> + '_ {
        (0..=max_len).flat_map(move |len| std::iter::repeat_n(alphabet.iter().copied(), len).multi_cartesian_product())
    }

    /// Run every input through `is_match`, through `step` one byte at a
    /// time and through `chunk` three bytes at a time, and compare each
    /// against the regex crate.
    fn assert_matches_regex_crate(pattern: &str, inputs: impl IntoIterator<Item = Vec<u8>>) {
        let re = oracle(pattern);
        let mut csa = compile(pattern);
        for input in inputs {
            let expected = re.is_match(&input);
            let shown = String::from_utf8_lossy(&input).into_owned();

            let actual = csa.is_match(&input).unwrap();
            assert_eq!(actual, expected, "pattern {:?} on {:?}", pattern, shown);

            let mut matcher = csa.matcher();
            for &b in &input {
                matcher.step(b).unwrap();
            }
            assert_eq!(matcher.finish(), expected, "pattern {:?} on {:?} (step)", pattern, shown);

            let mut matcher = csa.matcher();
            for chunk in input.chunks(3) {
                matcher.chunk(chunk).unwrap();
            }
            assert_eq!(matcher.finish(), expected, "pattern {:?} on {:?} (chunk)", pattern, shown);
        }
    }

    #[test]
    fn test_scenarios() {
        for (pattern, input, expected) in [
            ("a", "a", true),
            ("a", "b", false),
            ("a*", "", true),
            ("a{2,3}", "aa", true),
            ("a{2,3}", "a", false),
            ("a{2,3}", "aaaa", false),
            ("(ab){1,2}c", "ababc", true),
            ("(ab){1,2}c", "abababc", false),
            ("a|b", "b", true),
        ] {
            let mut csa = compile(pattern);
            assert_eq!(
                csa.is_match(input.as_bytes()).unwrap(),
                expected,
                "pattern {:?} on {:?}",
                pattern,
                input
            );
        }
    }

    #[test]
    fn test_bounded_repetition_grid() {
        for m in [0u32, 1, 3] {
            for n in [m, m + 2, m + 5] {
                let pattern = format!("x{{{},{}}}", m, n);
                let mut csa = compile(&pattern);
                for k in 0..=n + 3 {
                    let input = vec![b'x'; k as usize];
                    assert_eq!(
                        csa.is_match(&input).unwrap(),
                        m <= k && k <= n,
                        "{} on x^{}",
                        pattern,
                        k
                    );
                }
                assert!(!csa.is_match(b"y").unwrap());
            }
        }
    }

    #[test]
    fn test_nested_repetition_against_enumeration() {
        let inner = [&b"ab"[..], &b"abb"[..]];
        let mut expected: BTreeSet<Vec<u8>> = BTreeSet::new();
        for k in 2..=3 {
            for parts in std::iter::repeat_n(inner, k).multi_cartesian_product() {
                expected.insert(parts.concat());
            }
        }

        let mut csa = compile("(ab{1,2}){2,3}");
        for input in corpus(b"ab", 10) {
            assert_eq!(
                csa.is_match(&input).unwrap(),
                expected.contains(&input),
                "{:?}",
                String::from_utf8_lossy(&input)
            );
        }
    }

    #[test]
    fn test_counted_patterns_against_regex_crate() {
        for pattern in [
            "(ab{1,2}){2,3}",
            "((a|bc){1,2}){2,3}",
            "(?:a{2})*",
            "[ab]*a{2,3}",
            "a{1,2}b{0,2}a{2}",
            "(a{1,2}|b){2}c",
            "(?:ab{1,2}){2}c",
            "(?:a|b){3,}c?",
            "a{0,2}a{0,2}",
            "(?:a*b){1,3}",
            "(?:(?:a{1,2}){2})*",
            "(?:(?:a{1,2}){2}){1,3}",
            "(?:(?:a{1,3}){2})*",
            "(?:(?:a{0,2}){0,2}){1,2}",
        ] {
            assert_matches_regex_crate(pattern, corpus(b"abc", 7));
        }
    }

    #[test]
    fn test_enclosing_loop_restarts_at_max() {
        let mut csa = compile("(?:(?:a{1,2}){2})*");
        for k in 0..=12 {
            assert_eq!(csa.is_match(&vec![b'a'; k]).unwrap(), k != 1, "a^{}", k);
        }
        let mut csa = compile("(?:(?:a{1,2}){2}){1,3}");
        for k in 0..=14 {
            assert_eq!(csa.is_match(&vec![b'a'; k]).unwrap(), (2..=12).contains(&k), "a^{}", k);
        }
    }

    /// A random pattern over `[ab]` of at most `depth` nested operators.
    fn random_pattern(rng: &mut StdRng, depth: u32) -> String {
        if depth == 0 || rng.gen_bool(0.25) {
            return ["a", "b", "[ab]"][rng.gen_range(0..3)].to_string();
        }
        let sub = random_pattern(rng, depth - 1);
        match rng.gen_range(0..6) {
            0 => format!("{}{}", sub, random_pattern(rng, depth - 1)),
            1 => format!("(?:{}|{})", sub, random_pattern(rng, depth - 1)),
            2 => format!("(?:{})*", sub),
            3 => format!("(?:{})?", sub),
            4 => format!("(?:{})+", sub),
            _ => {
                let min = rng.gen_range(0..=2);
                let max = min + rng.gen_range(0..=2);
                format!("(?:{}){{{},{}}}", sub, min, max)
            }
        }
    }

    #[test]
    fn test_random_patterns_against_regex_crate() {
        let mut rng = StdRng::seed_from_u64(0x5eed_ca5a);
        let inputs: Vec<Vec<u8>> = corpus(b"ab", 7).collect();
        for _ in 0..400 {
            let pattern = random_pattern(&mut rng, 4);
            let re = oracle(&pattern);
            let mut csa = compile(&pattern);
            for input in &inputs {
                assert_eq!(
                    csa.is_match(input).unwrap(),
                    re.is_match(input),
                    "pattern {:?} on {:?}",
                    pattern,
                    String::from_utf8_lossy(input)
                );
            }
        }
    }

    #[test]
    fn test_wildcard_with_counter() {
        assert_matches_regex_crate(".*a.{3}bc", corpus(b"abc", 8));
        assert_matches_regex_crate(".{2,4}", corpus(b"a\n\xff", 6));
    }

    #[test]
    fn test_anchors() {
        assert_matches_regex_crate("a$b*", corpus(b"ab", 4));
        assert_matches_regex_crate("a^b", corpus(b"ab", 4));
        assert_matches_regex_crate("^(?:a|b)$c*", corpus(b"abc", 4));
        assert_matches_regex_crate("(?:^a|b$)", corpus(b"ab", 3));
    }

    #[test]
    fn test_counter_sets_stay_bounded() {
        let mut csa = compile("a{0,1000}");
        let mut matcher = csa.matcher();
        for _ in 0..1000 {
            matcher.step(b'a').unwrap();
            assert!(matcher.live_counter_sets() <= 1);
        }
        assert!(matcher.finish());
        assert!(!csa.is_match(&[b'a'; 1001]).unwrap());

        let mut csa = compile("[ab]*a{2,50}");
        let mut matcher = csa.matcher();
        let input: Vec<u8> = b"ab".iter().copied().cycle().take(40).chain([b'a'; 200]).collect();
        for &b in &input {
            matcher.step(b).unwrap();
            assert!(matcher.live_counter_sets() <= 2, "{} sets", matcher.live_counter_sets());
        }
        assert!(matcher.finish());
        let configs = csa.cached_configs();
        assert!(configs < 16, "{} configurations", configs);
    }

    #[test]
    fn test_no_counters_against_reference_matcher() {
        let long: Vec<Vec<u8>> = (0..=50)
            .step_by(5)
            .flat_map(|n| {
                [
                    b"ab".iter().copied().cycle().take(n).collect(),
                    b"abc".iter().copied().cycle().take(n).collect(),
                    vec![b'a'; n],
                ]
            })
            .collect();
        for pattern in [
            "abc",
            "a|b|c",
            "(ab|c)*",
            "a*b*c*",
            "(a|b)*abb",
            "(?:ab)*(?:c|)",
            "[^c]*c",
            "((a|b)c*)*",
        ] {
            let mut tree = SyntaxTree::default();
            let root = tree.lower(&parse_hir_bytes(pattern)).unwrap();
            let ca = CaBuilder::default().build(&parse_hir_bytes(pattern)).unwrap();
            assert!(ca.loops().is_empty(), "{} has counters", pattern);
            let mut csa = Csa::new(ca);
            for input in corpus(b"abc", 5).chain(long.iter().cloned()) {
                assert_eq!(
                    csa.is_match(&input).unwrap(),
                    reference_is_match(&tree, root, &input),
                    "pattern {:?} on {:?}",
                    pattern,
                    String::from_utf8_lossy(&input)
                );
            }
        }
    }

    #[test]
    fn test_csa_is_reusable_across_inputs() {
        let mut csa = compile("(ab){1,2}c");
        assert!(csa.is_match(b"ababc").unwrap());
        let configs = csa.cached_configs();
        assert!(!csa.is_match(b"abababc").unwrap());
        assert!(csa.is_match(b"ababc").unwrap());
        assert!(csa.cached_configs() >= configs);
        assert!(csa.is_match(b"abc").unwrap());
    }

    #[test]
    fn test_dead_matcher_stays_dead() {
        let mut csa = compile("ab");
        let mut matcher = csa.matcher();
        matcher.chunk(b"ax").unwrap();
        assert!(matcher.is_dead());
        matcher.chunk(b"b").unwrap();
        assert!(!matcher.finish());
    }

    #[test]
    fn test_error_display() {
        let err = Error::UnsupportedConstruct { kind: "capture" };
        assert_eq!(err.to_string(), "unsupported construct reached the classifier: capture");
        let err = Error::InconsistentCounterUpdate {
            state: CaStateIdx::new(3),
            loop_id: LoopId::new(2),
        };
        assert!(err.to_string().contains("state 3"));
    }
}
