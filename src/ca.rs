//! Counting automaton construction by derivatives.

use std::fmt;
use std::io::{self, Write};
use std::ops::Index;

use indexmap::IndexSet;
use log::{debug, trace};
use regex_syntax::hir::Hir;
use rustc_hash::FxBuildHasher;

use crate::Error;
use crate::algebra::{CounterGuard, CounterOperator, GuardKind, GuardSet, OperatorKind, compose};
use crate::classes::{SymbolClass, SymbolClassTable};
use crate::equation::{EquationKind, classify};
use crate::syntax::{CountingLoop, LoopId, Node, NodeId, SyntaxTree};

// ---------------------------------------------------------------------------
// Automaton
// ---------------------------------------------------------------------------

/// Index into [`CountingAutomaton::states`].  State 0 is the initial state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaStateIdx(u32);

impl CaStateIdx {
    pub const INITIAL: Self = Self(0);

    pub fn new(idx: usize) -> Self {
        Self(idx as u32)
    }

    #[inline]
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CaStateIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed access to the CA state array.
impl Index<CaStateIdx> for [CaState] {
    type Output = CaState;

    #[inline]
    fn index(&self, idx: CaStateIdx) -> &CaState {
        &self[idx.idx()]
    }
}

/// One edge of the automaton.  It fires on `class` when every guard holds,
/// and applies `ops` to the counters of the source state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaTransition {
    pub class: SymbolClass,
    pub target: CaStateIdx,
    pub guards: GuardSet,
    pub ops: Vec<CounterOperator>,
}

/// When a state accepts.  `is_set == false` means never; otherwise every
/// guard (a `CanExit` per top-level loop with a nonzero minimum) must hold.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FinalStateCondition {
    pub is_set: bool,
    pub guards: Vec<CounterGuard>,
}

impl FinalStateCondition {
    /// Summary of the condition as a single guard kind.
    pub fn guard(&self) -> GuardKind {
        if !self.is_set {
            GuardKind::False
        } else if self.guards.is_empty() {
            GuardKind::True
        } else {
            GuardKind::CanExit
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaState {
    /// Canonical text of the residual this state stands for.
    pub label: String,
    /// Sorted, without duplicates.
    pub transitions: Box<[CaTransition]>,
    pub final_condition: FinalStateCondition,
    /// Loops whose counters are live in this state, in residual order.
    pub scope: Box<[CountingLoop]>,
}

impl CaState {
    /// Position of `loop_id` in [`scope`](Self::scope).
    pub fn slot_of(&self, loop_id: LoopId) -> Option<usize> {
        self.scope.iter().position(|l| l.id == loop_id)
    }
}

/// A compiled counting automaton.  Immutable once built.
#[derive(Debug)]
pub struct CountingAutomaton {
    states: Box<[CaState]>,
    loops: Box<[CountingLoop]>,
    classes: SymbolClassTable,
}

impl CountingAutomaton {
    /// Assemble an automaton from parts, e.g. one built by hand.  State 0
    /// is the initial state and every transition target must be a valid
    /// index.
    pub fn new(states: Vec<CaState>, loops: Vec<CountingLoop>, classes: SymbolClassTable) -> Self {
        Self {
            states: states.into(),
            loops: loops.into(),
            classes,
        }
    }

    pub fn states(&self) -> &[CaState] {
        &self.states
    }

    #[inline]
    pub fn state(&self, idx: CaStateIdx) -> &CaState {
        &self.states[idx]
    }

    pub fn loops(&self) -> &[CountingLoop] {
        &self.loops
    }

    pub fn classes(&self) -> &SymbolClassTable {
        &self.classes
    }

    /// Return the total memory footprint (in bytes) of this automaton,
    /// including both inline and heap-allocated data.
    pub fn memory_size(&self) -> usize {
        let inline = std::mem::size_of::<Self>();
        let states_alloc = self.states.len() * std::mem::size_of::<CaState>();
        let states_heap: usize = self
            .states
            .iter()
            .map(|s| {
                s.label.capacity()
                    + s.scope.len() * std::mem::size_of::<CountingLoop>()
                    + s.transitions.len() * std::mem::size_of::<CaTransition>()
                    + s.transitions
                        .iter()
                        .map(|t| {
                            t.ops.capacity() * std::mem::size_of::<CounterOperator>()
                                + t.guards.len() * std::mem::size_of::<CounterGuard>()
                        })
                        .sum::<usize>()
            })
            .sum();
        let loops_alloc = self.loops.len() * std::mem::size_of::<CountingLoop>();
        inline + states_alloc + states_heap + loops_alloc
    }

    /// Emit a Graphviz DOT representation of the automaton.  Accepting
    /// states are drawn as double circles; edges are labelled
    /// `class|operators`.
    pub fn to_dot(&self, mut buffer: impl Write) -> io::Result<()> {
        writeln!(buffer, "digraph countingAutomaton {{")?;
        writeln!(buffer, "\trankdir=LR;")?;
        writeln!(buffer, "\tnode [shape=circle];")?;
        for (i, state) in self.states.iter().enumerate() {
            let shape = if state.final_condition.is_set {
                "doublecircle"
            } else {
                "circle"
            };
            writeln!(
                buffer,
                "\t{} [shape={}, label=\"{}\"];",
                i,
                shape,
                escape_label(&state.label)
            )?;
        }
        for (i, state) in self.states.iter().enumerate() {
            for t in state.transitions.iter() {
                let ops: Vec<String> = t.ops.iter().map(|op| op.to_string()).collect();
                writeln!(
                    buffer,
                    "\t{} -> {} [label=\"{}|{}\"];",
                    i,
                    t.target,
                    t.class,
                    ops.join(",")
                )?;
            }
        }
        writeln!(buffer, "}}")
    }
}

fn escape_label(label: &str) -> String {
    let mut escaped = String::with_capacity(label.len());
    for c in label.chars() {
        if c == '"' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds a [`CountingAutomaton`] from a [`regex_syntax::hir::Hir`].
///
/// The pipeline is:
/// 1. [`SyntaxTree::lower`] and [`SyntaxTree::normalize`] produce the
///    initial residual.
/// 2. A worklist derives every residual reachable by one symbol class at a
///    time, composing counter operators along the way.
/// 3. Unreachable residuals are dropped and each state is annotated with
///    its counter scope and final condition.
#[derive(Debug, Default)]
pub struct CaBuilder {
    tree: SyntaxTree,
}

impl CaBuilder {
    pub fn build(&mut self, hir: &Hir) -> Result<CountingAutomaton, Error> {
        self.tree = SyntaxTree::default();
        let root = self.tree.lower(hir)?;
        self.build_node(root)
    }

    /// The arena used by [`build_node`](Self::build_node), for building
    /// trees by hand.
    pub fn tree_mut(&mut self) -> &mut SyntaxTree {
        &mut self.tree
    }

    /// Build the automaton for a node of [`tree_mut`](Self::tree_mut).
    pub fn build_node(&mut self, root: NodeId) -> Result<CountingAutomaton, Error> {
        let root = self.tree.normalize(root);
        let root = self.tree.strip_boundary_anchors(root);
        let classes = SymbolClassTable::from_tree(&self.tree, root);
        debug!(
            "build: {} over {} symbol classes",
            self.tree.display(root),
            classes.len()
        );

        let mut ctx = BuilderContext {
            tree: &mut self.tree,
            classes: &classes,
            residuals: IndexSet::default(),
            derivatives: Vec::new(),
            worklist: Vec::new(),
        };
        ctx.discover(root);
        while let Some(state) = ctx.worklist.pop() {
            ctx.transitions_of(state)?;
        }
        let states = ctx.finish();

        Ok(CountingAutomaton {
            states: states.into(),
            loops: self.tree.loops().into(),
            classes,
        })
    }
}

/// Working state of one build.
struct BuilderContext<'a> {
    tree: &'a mut SyntaxTree,
    classes: &'a SymbolClassTable,
    /// Every residual seen so far; the index is the provisional state id.
    residuals: IndexSet<NodeId, FxBuildHasher>,
    /// Memoized transitions per residual.
    derivatives: Vec<Option<Vec<CaTransition>>>,
    worklist: Vec<CaStateIdx>,
}

impl BuilderContext<'_> {
    /// Register `residual`, queueing it for derivation if it is new.
    fn discover(&mut self, residual: NodeId) -> CaStateIdx {
        let (idx, inserted) = self.residuals.insert_full(residual);
        let state = CaStateIdx::new(idx);
        if inserted {
            trace!("discover: {} = {}", state, self.tree.display(residual));
            self.derivatives.push(None);
            self.worklist.push(state);
        }
        state
    }

    fn residual(&self, state: CaStateIdx) -> NodeId {
        self.residuals[state.idx()]
    }

    /// Transitions of `state`, derived once and then served from the memo.
    ///
    /// Recursion only descends into strictly smaller residuals, so it
    /// terminates without cycle detection.
    fn transitions_of(&mut self, state: CaStateIdx) -> Result<Vec<CaTransition>, Error> {
        if let Some(transitions) = &self.derivatives[state.idx()] {
            return Ok(transitions.clone());
        }
        let residual = self.residual(state);
        let equation = classify(self.tree, residual)?;
        let mut out = Vec::new();
        match equation.kind {
            EquationKind::Epsilon => {}
            EquationKind::Concatenation => {
                let target = self.discover(equation.op2);
                for class in self.consumable_classes(equation.op1) {
                    out.push(CaTransition {
                        class,
                        target,
                        guards: GuardSet::new(),
                        ops: vec![CounterOperator::id()],
                    });
                }
            }
            EquationKind::Alternation => {
                for branch in self.tree.branches(equation.op1) {
                    let branch = self.tree.concat([branch, equation.op2]);
                    let branch = self.discover(branch);
                    out.extend(self.transitions_of(branch)?);
                }
            }
            EquationKind::Repetition => {
                let body = match self.tree.node(equation.op1) {
                    Node::Star(sub) => *sub,
                    node => {
                        return Err(Error::UnsupportedConstruct {
                            kind: node.kind_name(),
                        });
                    }
                };
                let body = self.discover(body);
                let id = [CounterOperator::id()];
                for t in self.transitions_of(body)? {
                    out.extend(self.chain(&t, &id, &GuardSet::new(), residual));
                }
                if !matches!(self.tree.node(equation.op2), Node::EmptyMatch) {
                    let rest = self.discover(equation.op2);
                    out.extend(self.transitions_of(rest)?);
                }
            }
            EquationKind::CountedRepetition => {
                let (body, loop_id) = match self.tree.node(equation.op1) {
                    Node::Repeat { sub, id, .. } => (*sub, *id),
                    node => {
                        return Err(Error::UnsupportedConstruct {
                            kind: node.kind_name(),
                        });
                    }
                };
                let counting_loop = self
                    .tree
                    .counting_loop(loop_id)
                    .ok_or(Error::UnsupportedConstruct {
                        kind: "unnumbered bounded-repeat",
                    })?;

                let incr = [CounterOperator::new(OperatorKind::Incr, counting_loop)];
                let incr_guards = GuardSet::from([CounterGuard::new(GuardKind::CanIncr, counting_loop)]);
                let body = self.discover(body);
                for t in self.transitions_of(body)? {
                    out.extend(self.chain(&t, &incr, &incr_guards, residual));
                }

                if !matches!(self.tree.node(equation.op2), Node::EmptyMatch) {
                    let exit = [CounterOperator::new(OperatorKind::Exit, counting_loop)];
                    let exit_guards = GuardSet::from([CounterGuard::new(GuardKind::CanExit, counting_loop)]);
                    let rest = self.discover(equation.op2);
                    for t in self.transitions_of(rest)? {
                        if let Some((ops, guards)) = compose(&exit, &exit_guards, &t.ops, &t.guards) {
                            out.push(CaTransition {
                                class: t.class,
                                target: t.target,
                                guards,
                                ops,
                            });
                        }
                    }
                }
            }
        }
        out.sort();
        out.dedup();
        trace!(
            "derive: {} ({:?}) has {} transitions",
            state,
            equation.kind,
            out.len()
        );
        self.derivatives[state.idx()] = Some(out.clone());
        Ok(out)
    }

    /// Follow `t` with `ops`, then continue with `continuation`.
    fn chain(
        &mut self,
        t: &CaTransition,
        ops: &[CounterOperator],
        guards: &GuardSet,
        continuation: NodeId,
    ) -> Option<CaTransition> {
        let (ops, guards) = compose(&t.ops, &t.guards, ops, guards)?;
        let target = self.tree.concat([self.residuals[t.target.idx()], continuation]);
        let target = self.discover(target);
        Some(CaTransition {
            class: t.class,
            target,
            guards,
            ops,
        })
    }

    /// Symbol classes `head` can consume.  Anchors consume nothing.
    fn consumable_classes(&self, head: NodeId) -> Vec<SymbolClass> {
        match self.tree.node(head) {
            Node::Literal(b) => {
                let class = self.classes.class_of(*b);
                if self.classes.is_valid(class) {
                    vec![class]
                } else {
                    vec![]
                }
            }
            Node::Class { class, negated } => self
                .classes
                .classes_of(&self.tree.effective_class(*class, *negated)),
            Node::AnyByte => vec![SymbolClass::ANY],
            _ => vec![],
        }
    }

    /// Drop unreachable residuals and annotate the survivors.
    fn finish(mut self) -> Vec<CaState> {
        let derivatives: Vec<Vec<CaTransition>> = std::mem::take(&mut self.derivatives)
            .into_iter()
            .map(Option::unwrap_or_default)
            .collect();
        let (order, renumber) = remove_unreachable_states(&derivatives);
        debug!(
            "build: {} residuals derived, {} reachable",
            derivatives.len(),
            order.len()
        );

        let tree: &SyntaxTree = self.tree;
        order
            .iter()
            .map(|&old| {
                let residual = self.residuals[old.idx()];
                let mut transitions: Vec<CaTransition> = derivatives[old.idx()]
                    .iter()
                    .map(|t| CaTransition {
                        target: renumber[t.target.idx()].unwrap_or(t.target),
                        ..t.clone()
                    })
                    .collect();
                transitions.sort();
                CaState {
                    label: tree.display(residual).to_string(),
                    transitions: transitions.into(),
                    final_condition: final_condition(tree, residual),
                    scope: delimit_counting_loops(tree, residual),
                }
            })
            .collect()
    }
}

/// Depth-first reachability from state 0.
///
/// Returns the reachable states in their new order (0 stays first) and the
/// old → new renumbering.
fn remove_unreachable_states(
    derivatives: &[Vec<CaTransition>],
) -> (Vec<CaStateIdx>, Vec<Option<CaStateIdx>>) {
    let mut renumber: Vec<Option<CaStateIdx>> = vec![None; derivatives.len()];
    let mut order = Vec::new();
    if derivatives.is_empty() {
        return (order, renumber);
    }
    let mut stack = vec![CaStateIdx::INITIAL];
    renumber[0] = Some(CaStateIdx::INITIAL);
    order.push(CaStateIdx::INITIAL);
    while let Some(s) = stack.pop() {
        for t in derivatives[s.idx()].iter().rev() {
            if renumber[t.target.idx()].is_none() {
                renumber[t.target.idx()] = Some(CaStateIdx::new(order.len()));
                order.push(t.target);
                stack.push(t.target);
            }
        }
    }
    (order, renumber)
}

/// Loops whose repeat node is a top-level element of `residual`.
fn delimit_counting_loops(tree: &SyntaxTree, residual: NodeId) -> Box<[CountingLoop]> {
    let mut scope: Vec<CountingLoop> = Vec::new();
    for element in tree.elements(residual) {
        if let Node::Repeat { id, .. } = tree.node(element)
            && let Some(counting_loop) = tree.counting_loop(*id)
            && !scope.iter().any(|l| l.id == *id)
        {
            scope.push(counting_loop);
        }
    }
    scope.into()
}

/// A residual accepts when each top-level element accepts the empty word.
/// A loop with a nonzero minimum does so once its counter reached it.
fn final_condition(tree: &SyntaxTree, residual: NodeId) -> FinalStateCondition {
    let mut guards = Vec::new();
    for element in tree.elements(residual) {
        if tree.is_nullable(element) {
            continue;
        }
        match tree.node(element) {
            Node::Repeat { id, .. } => match tree.counting_loop(*id) {
                Some(counting_loop) => guards.push(CounterGuard::new(GuardKind::CanExit, counting_loop)),
                None => return FinalStateCondition::default(),
            },
            _ => return FinalStateCondition::default(),
        }
    }
    FinalStateCondition {
        is_set: true,
        guards,
    }
}
