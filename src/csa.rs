//! Counter-set automaton: lazy determinization of a [`CountingAutomaton`].
//!
//! A configuration is a set of CA states, each paired with one counter set
//! per loop in its scope.  A state stands for every combination of values
//! drawn from its sets.  The shape of a configuration (which states, which
//! set feeds which slot) is interned as a [`Config`]; the values themselves
//! live in the [`Matcher`].
//!
//! For each `(Config, class)` the CSA compiles a `Trans`: the CA
//! transitions that may fire and the guards they depend on.  For each guard
//! outcome it compiles an `Update`: the next `Config` and a recipe building
//! each of its counter sets from the current ones.  Both are cached for the
//! lifetime of the [`Csa`], so a warm matcher only evaluates guards and
//! replays recipes.

use std::collections::VecDeque;
use std::fmt;

use indexmap::IndexSet;
use log::{debug, trace};
use rustc_hash::{FxBuildHasher, FxHashMap};

use crate::Error;
use crate::algebra::{CounterGuard, GuardKind, GuardSet, OperatorKind, guard_for, insert_guard};
use crate::ca::{CaState, CaStateIdx, CaTransition, CountingAutomaton};
use crate::classes::SymbolClass;
use crate::syntax::LoopId;

// ---------------------------------------------------------------------------
// Counter sets
// ---------------------------------------------------------------------------

/// A set of counter values with O(1) increment of every member.
///
/// Each member `v` is stored as `offset - v`.  The list is kept ascending,
/// so the front holds the largest value and the back the smallest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CounterSet {
    offset: u64,
    list: VecDeque<u64>,
}

impl CounterSet {
    pub fn singleton(value: u64) -> Self {
        Self {
            offset: value,
            list: VecDeque::from([0]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn max_value(&self) -> Option<u64> {
        self.list.front().map(|e| self.offset - e)
    }

    pub fn min_value(&self) -> Option<u64> {
        self.list.back().map(|e| self.offset - e)
    }

    /// Members in decreasing order.
    pub fn values(&self) -> impl Iterator<Item = u64> + '_ {
        self.list.iter().map(|e| self.offset - e)
    }

    pub fn increment(&mut self) {
        self.offset += 1;
    }

    /// Drop every member outside `lo..=hi`.
    pub fn retain_range(&mut self, lo: u64, hi: u64) {
        while self.max_value().is_some_and(|v| v > hi) {
            self.list.pop_front();
        }
        while self.min_value().is_some_and(|v| v < lo) {
            self.list.pop_back();
        }
    }

    pub fn insert(&mut self, value: u64) {
        if self.list.is_empty() {
            *self = Self::singleton(value);
            return;
        }
        if value > self.offset {
            let shift = value - self.offset;
            for e in self.list.iter_mut() {
                *e += shift;
            }
            self.offset = value;
        }
        let entry = self.offset - value;
        if let Err(pos) = self.list.binary_search(&entry) {
            self.list.insert(pos, entry);
        }
    }

    /// Insert `v + add` for every member `v` of `other` within `lo..=hi`.
    pub fn union_from(&mut self, other: &CounterSet, lo: u64, hi: u64, add: u64) {
        for v in other.values().filter(|v| (lo..=hi).contains(v)) {
            self.insert(v + add);
        }
    }

    /// Whether some member satisfies `guard`.
    pub fn satisfies(&self, guard: &CounterGuard) -> bool {
        let holds = match guard.kind {
            GuardKind::True => true,
            GuardKind::False => false,
            GuardKind::CanIncr => self.min_value().is_some_and(|v| v < u64::from(guard.max)),
            GuardKind::CanExit => self.max_value().is_some_and(|v| v >= u64::from(guard.min)),
        };
        holds != guard.negated
    }
}

impl fmt::Display for CounterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut values: Vec<u64> = self.values().collect();
        values.reverse();
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "}}")
    }
}

// ---------------------------------------------------------------------------
// Configurations
// ---------------------------------------------------------------------------

/// Index into the counter sets of a running [`Matcher`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterSetIdx(u32);

impl CounterSetIdx {
    #[inline]
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// A CA state together with the counter set feeding each slot of its
/// scope.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct State {
    pub key: CaStateIdx,
    pub counters: Box<[CounterSetIdx]>,
}

/// The shape of a matcher configuration: a sorted list of states.
///
/// Two configurations are the same matcher state exactly when their lists
/// are equal; the derived `Ord` is a total order over them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Config {
    pub states: Box<[State]>,
}

impl Config {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Build the canonical configuration for `states`, whose slots refer to
    /// sets by arbitrary indices.
    ///
    /// Returns the configuration and, for each of its sets, the index it
    /// had in the input.
    fn canonical(mut states: Vec<(CaStateIdx, Vec<usize>)>) -> (Self, Vec<usize>) {
        states.sort();
        states.dedup();
        let mut order: Vec<usize> = Vec::new();
        let mut renumber: FxHashMap<usize, CounterSetIdx> = FxHashMap::default();
        let mut out = Vec::with_capacity(states.len());
        for (key, sets) in states {
            let mut counters = Vec::with_capacity(sets.len());
            for set in sets {
                let idx = *renumber.entry(set).or_insert_with(|| {
                    order.push(set);
                    CounterSetIdx(order.len() as u32 - 1)
                });
                counters.push(idx);
            }
            out.push(State {
                key,
                counters: counters.into(),
            });
        }
        out.sort();
        (Self { states: out.into() }, order)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ConfigIdx(u32);

impl ConfigIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct TransIdx(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct UpdateIdx(u32);

// ---------------------------------------------------------------------------
// Compiled transitions and updates
// ---------------------------------------------------------------------------

/// A guard on one slot of one state of a configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Guard {
    state: usize,
    slot: usize,
    guard: CounterGuard,
}

/// A CA transition out of the `origin`-th state of a configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ActiveTransition {
    origin: usize,
    transition: usize,
}

/// Bit `i` is set when guard `i` of the `Trans` holds.
type GuardMask = Box<[u64]>;

#[derive(Debug)]
struct Trans {
    config: ConfigIdx,
    guards: Box<[Guard]>,
    /// Transitions without dynamic guards.
    always: Box<[ActiveTransition]>,
    /// Transitions that fire when all the listed guards hold.
    guarded: Box<[(Box<[usize]>, ActiveTransition)]>,
    update_indexes: FxHashMap<GuardMask, UpdateIdx>,
}

/// Where the members of a new counter set come from.  `Carry` keeps the
/// members of a current set within `lo..=hi`, adding one if `plus`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum SetSource {
    Carry {
        set: CounterSetIdx,
        lo: u64,
        hi: u64,
        plus: bool,
    },
    Fresh(u64),
}

#[derive(Clone, Copy, Debug)]
struct SetPart {
    source: SetSource,
    /// Last read of the source set: it may be moved instead of cloned.
    take: bool,
}

#[derive(Clone, Debug)]
struct SetBuild {
    parts: Box<[SetPart]>,
}

impl SetBuild {
    fn run(&self, current: &mut [CounterSet]) -> CounterSet {
        let mut out = CounterSet::default();
        for (i, part) in self.parts.iter().enumerate() {
            match part.source {
                SetSource::Carry { set, lo, hi, plus } if i == 0 => {
                    out = if part.take {
                        std::mem::take(&mut current[set.idx()])
                    } else {
                        current[set.idx()].clone()
                    };
                    out.retain_range(lo, hi);
                    if plus {
                        out.increment();
                    }
                }
                SetSource::Carry { set, lo, hi, plus } => {
                    out.union_from(&current[set.idx()], lo, hi, u64::from(plus));
                }
                SetSource::Fresh(value) => out.insert(value),
            }
        }
        out
    }
}

#[derive(Debug)]
struct Update {
    target: ConfigIdx,
    /// One recipe per counter set of `target`.
    builds: Box<[SetBuild]>,
}

/// Per-loop value of one source state while an update is compiled.
#[derive(Clone, Copy, Debug)]
enum Slot {
    Carry {
        set: CounterSetIdx,
        lo: u64,
        hi: u64,
        plus: bool,
    },
    Fresh(u64),
    /// The loop was left; its value is 0 again.
    Dropped,
    /// No value can satisfy the operators.
    Dead,
}

/// A target state of an update, with the sources of each of its slots.
type Term = (CaStateIdx, Vec<Vec<SetSource>>);

// ---------------------------------------------------------------------------
// CSA
// ---------------------------------------------------------------------------

/// The lazily built counter-set automaton of one [`CountingAutomaton`].
///
/// Reuse one `Csa` across inputs: its caches only grow.
#[derive(Debug)]
pub struct Csa {
    ca: CountingAutomaton,
    config_indexes: IndexSet<Config, FxBuildHasher>,
    /// Per configuration and symbol class.
    transition_indexes: Vec<Box<[Option<TransIdx>]>>,
    transitions: Vec<Trans>,
    cached_updates: Vec<Update>,
    initial: ConfigIdx,
    initial_sets: Vec<CounterSet>,
}

impl Csa {
    pub fn new(ca: CountingAutomaton) -> Self {
        let mut csa = Self {
            ca,
            config_indexes: IndexSet::default(),
            transition_indexes: Vec::new(),
            transitions: Vec::new(),
            cached_updates: Vec::new(),
            initial: ConfigIdx(0),
            initial_sets: Vec::new(),
        };
        // Every loop of the initial state starts at 0; all slots share
        // the one set {0}.
        let (config, sets) = match csa.ca.states().first() {
            None => (Config::default(), Vec::new()),
            Some(state) if state.scope.is_empty() => {
                let initial = vec![(CaStateIdx::INITIAL, Vec::new())];
                (Config::canonical(initial).0, Vec::new())
            }
            Some(state) => {
                let initial = vec![(CaStateIdx::INITIAL, vec![0; state.scope.len()])];
                (Config::canonical(initial).0, vec![CounterSet::singleton(0)])
            }
        };
        csa.initial = csa.intern(config);
        csa.initial_sets = sets;
        csa
    }

    pub fn ca(&self) -> &CountingAutomaton {
        &self.ca
    }

    /// Start matching a new input.
    pub fn matcher(&mut self) -> Matcher<'_> {
        let config = self.initial;
        let counter_sets = self.initial_sets.clone();
        let dead = self.config_indexes[config.idx()].is_empty();
        Matcher {
            csa: self,
            config,
            counter_sets,
            mask: Vec::new(),
            dead,
        }
    }

    /// Match the whole of `input`.
    pub fn is_match(&mut self, input: &[u8]) -> Result<bool, Error> {
        let mut matcher = self.matcher();
        matcher.chunk(input)?;
        Ok(matcher.finish())
    }

    /// Number of configurations discovered so far.
    pub fn cached_configs(&self) -> usize {
        self.config_indexes.len()
    }

    fn config(&self, idx: ConfigIdx) -> &Config {
        &self.config_indexes[idx.idx()]
    }

    fn intern(&mut self, config: Config) -> ConfigIdx {
        let (idx, inserted) = self.config_indexes.insert_full(config);
        if inserted {
            debug!(
                "csa: config {} with {} states",
                idx,
                self.config_indexes[idx].states.len()
            );
            self.transition_indexes
                .push(vec![None; self.ca.classes().len()].into());
        }
        ConfigIdx(idx as u32)
    }

    fn trans_index(&mut self, config: ConfigIdx, class: SymbolClass) -> TransIdx {
        if let Some(trans) = self.transition_indexes[config.idx()][class.idx()] {
            return trans;
        }
        let trans = self.compute_trans(config, class);
        let idx = TransIdx(self.transitions.len() as u32);
        trace!(
            "csa: trans {} for config {} on class {}: {} always, {} guarded, {} guards",
            idx.0,
            config.0,
            class,
            trans.always.len(),
            trans.guarded.len(),
            trans.guards.len()
        );
        self.transitions.push(trans);
        self.transition_indexes[config.idx()][class.idx()] = Some(idx);
        idx
    }

    /// Collect the CA transitions on `class` out of every state of
    /// `config`, with the slot guards each one needs.
    fn compute_trans(&self, config_idx: ConfigIdx, class: SymbolClass) -> Trans {
        let config = self.config(config_idx);
        let mut guards: Vec<Guard> = Vec::new();
        let mut always = Vec::new();
        let mut guarded = Vec::new();
        for (origin, state) in config.states.iter().enumerate() {
            let ca_state = self.ca.state(state.key);
            'transitions: for (transition, t) in ca_state.transitions.iter().enumerate() {
                if !t.class.admits(class) {
                    continue;
                }
                let mut required = Vec::new();
                for guard in transition_guards(t) {
                    match ca_state.slot_of(guard.loop_id) {
                        Some(slot) => {
                            let guard = Guard {
                                state: origin,
                                slot,
                                guard,
                            };
                            let idx = match guards.iter().position(|g| *g == guard) {
                                Some(idx) => idx,
                                None => {
                                    guards.push(guard);
                                    guards.len() - 1
                                }
                            };
                            required.push(idx);
                        }
                        // Loops outside the scope have the value 0.
                        None if guard.holds_for(0) => {}
                        None => continue 'transitions,
                    }
                }
                let active = ActiveTransition { origin, transition };
                if required.is_empty() {
                    always.push(active);
                } else {
                    guarded.push((required.into_boxed_slice(), active));
                }
            }
        }
        Trans {
            config: config_idx,
            guards: guards.into(),
            always: always.into(),
            guarded: guarded.into(),
            update_indexes: FxHashMap::default(),
        }
    }

    fn update_index(&mut self, trans_idx: TransIdx, mask: &[u64]) -> Result<UpdateIdx, Error> {
        let trans = &self.transitions[trans_idx.0 as usize];
        if let Some(&update) = trans.update_indexes.get(mask) {
            return Ok(update);
        }
        let active: Vec<ActiveTransition> = trans
            .always
            .iter()
            .copied()
            .chain(
                trans
                    .guarded
                    .iter()
                    .filter(|(required, _)| required.iter().all(|&g| mask_bit(mask, g)))
                    .map(|(_, active)| *active),
            )
            .collect();
        let config = trans.config;
        let update = self.compute_update(config, &active)?;
        let idx = UpdateIdx(self.cached_updates.len() as u32);
        debug!(
            "csa: update {} from config {} to config {} ({} active transitions, {} sets)",
            idx.0,
            config.0,
            update.target.0,
            active.len(),
            update.builds.len()
        );
        self.cached_updates.push(update);
        self.transitions[trans_idx.0 as usize]
            .update_indexes
            .insert(mask.into(), idx);
        Ok(idx)
    }

    /// Compile the effect of firing `active` out of `config_idx`.
    fn compute_update(&mut self, config_idx: ConfigIdx, active: &[ActiveTransition]) -> Result<Update, Error> {
        let config = self.config(config_idx);
        let mut terms: Vec<Term> = Vec::new();
        for a in active {
            let origin = &config.states[a.origin];
            let source = self.ca.state(origin.key);
            let t = &source.transitions[a.transition];
            let target = self.ca.state(t.target);
            if let Some(slots) = apply_operators(origin, source, t, target)? {
                terms.push((t.target, slots));
            }
        }
        let terms = merge_terms(terms);

        // Identical unions share one new set.
        let mut unions: Vec<Vec<SetSource>> = Vec::new();
        let mut states: Vec<(CaStateIdx, Vec<usize>)> = Vec::with_capacity(terms.len());
        for (key, slots) in terms {
            let mut sets = Vec::with_capacity(slots.len());
            for union in slots {
                let idx = match unions.iter().position(|u| *u == union) {
                    Some(idx) => idx,
                    None => {
                        unions.push(union);
                        unions.len() - 1
                    }
                };
                sets.push(idx);
            }
            states.push((key, sets));
        }
        let (target, order) = Config::canonical(states);

        let mut builds: Vec<SetBuild> = order
            .iter()
            .map(|&union| SetBuild {
                parts: unions[union]
                    .iter()
                    .map(|&source| SetPart { source, take: false })
                    .collect(),
            })
            .collect();
        mark_last_reads(&mut builds);

        let target = self.intern(target);
        Ok(Update {
            target,
            builds: builds.into(),
        })
    }

    /// Whether some state of the configuration accepts with the given
    /// counter values.
    fn is_accepting(&self, config: ConfigIdx, counter_sets: &[CounterSet]) -> bool {
        self.config(config).states.iter().any(|state| {
            let ca_state = self.ca.state(state.key);
            ca_state.final_condition.is_set
                && ca_state
                    .final_condition
                    .guards
                    .iter()
                    .all(|guard| match ca_state.slot_of(guard.loop_id) {
                        Some(slot) => counter_sets[state.counters[slot].idx()].satisfies(guard),
                        None => guard.holds_for(0),
                    })
        })
    }
}

/// The guards `t` needs on the counter values it starts from.
///
/// Only the first operator on a loop reads the value the transition starts
/// with; later ones read what earlier operators left (an `EXIT` followed by
/// an `INCR` restarts the loop) and are checked while the update is
/// compiled.
fn transition_guards(t: &CaTransition) -> GuardSet {
    let touched = |loop_id: LoopId| t.ops.iter().any(|op| !op.is_id() && op.loop_id == loop_id);
    let mut guards: GuardSet = t.guards.iter().filter(|g| !touched(g.loop_id)).copied().collect();
    let mut seen: Vec<LoopId> = Vec::new();
    for op in t.ops.iter().filter(|op| !op.is_id()) {
        if !seen.contains(&op.loop_id) {
            seen.push(op.loop_id);
            insert_guard(&mut guards, guard_for(op));
        }
    }
    guards
}

#[inline]
fn mask_bit(mask: &[u64], bit: usize) -> bool {
    mask[bit / 64] & (1 << (bit % 64)) != 0
}

/// Run the operators of `t` over the slots of `origin`.
///
/// Returns the sources of each slot of `target`, or `None` when no
/// counter values can take the transition.
fn apply_operators(
    origin: &State,
    source: &CaState,
    t: &CaTransition,
    target: &CaState,
) -> Result<Option<Vec<Vec<SetSource>>>, Error> {
    // (loop, value, incremented by this transition)
    let mut slots: Vec<(LoopId, Slot, bool)> = source
        .scope
        .iter()
        .zip(origin.counters.iter())
        .map(|(l, &set)| {
            let slot = Slot::Carry {
                set,
                lo: 0,
                hi: u64::MAX,
                plus: false,
            };
            (l.id, slot, false)
        })
        .collect();

    for op in t.ops.iter().filter(|op| !op.is_id()) {
        let i = match slots.iter().position(|(id, _, _)| *id == op.loop_id) {
            Some(i) => i,
            None => {
                slots.push((op.loop_id, Slot::Fresh(0), false));
                slots.len() - 1
            }
        };
        let (_, slot, bumped) = &mut slots[i];
        let (min, max) = (u64::from(op.min), u64::from(op.max));
        match op.kind {
            OperatorKind::Id => {}
            OperatorKind::Incr => {
                if *bumped {
                    return Err(Error::InconsistentCounterUpdate {
                        state: origin.key,
                        loop_id: op.loop_id,
                    });
                }
                *bumped = true;
                *slot = match *slot {
                    Slot::Carry { set, lo, hi, .. } if max > 0 => Slot::Carry {
                        set,
                        lo,
                        hi: hi.min(max - 1),
                        plus: true,
                    },
                    Slot::Fresh(v) if v < max => Slot::Fresh(v + 1),
                    Slot::Dropped if max > 0 => Slot::Fresh(1),
                    _ => Slot::Dead,
                };
            }
            OperatorKind::Exit | OperatorKind::Exit1 => {
                let checked = match *slot {
                    Slot::Carry { set, lo, hi, plus } => Slot::Carry {
                        set,
                        lo: lo.max(min.saturating_sub(u64::from(plus))),
                        hi,
                        plus,
                    },
                    Slot::Fresh(v) if v >= min => Slot::Fresh(v),
                    Slot::Dropped if min == 0 => Slot::Dropped,
                    _ => Slot::Dead,
                };
                *slot = match checked {
                    Slot::Carry { lo, hi, .. } if lo > hi => Slot::Dead,
                    Slot::Dead => Slot::Dead,
                    _ if op.kind == OperatorKind::Exit1 => {
                        *bumped = true;
                        Slot::Fresh(1)
                    }
                    _ => Slot::Dropped,
                };
            }
        }
    }

    if slots.iter().any(|(_, slot, _)| match slot {
        Slot::Dead => true,
        Slot::Carry { lo, hi, .. } => lo > hi,
        _ => false,
    }) {
        return Ok(None);
    }

    let sources = target
        .scope
        .iter()
        .map(|l| {
            let source = match slots.iter().find(|(id, _, _)| *id == l.id) {
                Some((_, Slot::Carry { set, lo, hi, plus }, _)) => SetSource::Carry {
                    set: *set,
                    lo: *lo,
                    hi: *hi,
                    plus: *plus,
                },
                Some((_, Slot::Fresh(v), _)) => SetSource::Fresh(*v),
                _ => SetSource::Fresh(0),
            };
            vec![source]
        })
        .collect();
    Ok(Some(sources))
}

/// Merge terms with the same target that differ in at most one slot, by
/// taking the union of that slot.  The product of the slot sets stays
/// exact under such a merge.
fn merge_terms(mut terms: Vec<Term>) -> Vec<Term> {
    terms.sort();
    terms.dedup();
    let mut merged: Vec<Term> = Vec::with_capacity(terms.len());
    let mut start = 0;
    while start < terms.len() {
        let key = terms[start].0;
        let end = terms[start..]
            .iter()
            .position(|t| t.0 != key)
            .map_or(terms.len(), |n| start + n);
        let mut group: Vec<Vec<Vec<SetSource>>> = terms[start..end].iter().map(|t| t.1.clone()).collect();
        'merge: loop {
            for i in 0..group.len() {
                for j in i + 1..group.len() {
                    let differing: Vec<usize> = (0..group[i].len()).filter(|&s| group[i][s] != group[j][s]).collect();
                    if differing.len() <= 1 {
                        let other = group.swap_remove(j);
                        for s in differing {
                            group[i][s].extend_from_slice(&other[s]);
                            group[i][s].sort();
                            group[i][s].dedup();
                        }
                        continue 'merge;
                    }
                }
            }
            break;
        }
        group.sort();
        merged.extend(group.into_iter().map(|slots| (key, slots)));
        start = end;
    }
    merged
}

/// Flag the last read of every current set so it can be moved.
fn mark_last_reads(builds: &mut [SetBuild]) {
    let mut last: FxHashMap<CounterSetIdx, (usize, usize)> = FxHashMap::default();
    for (b, build) in builds.iter().enumerate() {
        for (p, part) in build.parts.iter().enumerate() {
            if let SetSource::Carry { set, .. } = part.source {
                last.insert(set, (b, p));
            }
        }
    }
    for (b, p) in last.into_values() {
        builds[b].parts[p].take = true;
    }
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// Runs one input through a [`Csa`], one byte at a time.
#[derive(Debug)]
pub struct Matcher<'a> {
    csa: &'a mut Csa,
    config: ConfigIdx,
    /// Values behind the set indices of `config`.
    counter_sets: Vec<CounterSet>,
    /// Scratch guard mask.
    mask: Vec<u64>,
    /// No state is left; the input cannot match any more.
    dead: bool,
}

impl Matcher<'_> {
    /// Consume one byte.
    ///
    /// Bytes outside every class of the pattern end the match; the error
    /// channel only reports an inconsistent counter update.
    pub fn step(&mut self, byte: u8) -> Result<(), Error> {
        if self.dead {
            return Ok(());
        }
        let class = self.csa.ca.classes().class_of(byte);
        if !self.csa.ca.classes().is_valid(class) {
            self.dead = true;
            return Ok(());
        }

        let trans_idx = self.csa.trans_index(self.config, class);
        let trans = &self.csa.transitions[trans_idx.0 as usize];
        let config = self.csa.config(self.config);
        self.mask.clear();
        self.mask.resize(trans.guards.len().div_ceil(64), 0);
        for (i, g) in trans.guards.iter().enumerate() {
            let set = config.states[g.state].counters[g.slot];
            if self.counter_sets[set.idx()].satisfies(&g.guard) {
                self.mask[i / 64] |= 1 << (i % 64);
            }
        }

        let update_idx = self.csa.update_index(trans_idx, &self.mask)?;
        self.apply(update_idx);
        Ok(())
    }

    /// Feed an entire byte slice through the matcher, one byte at a time.
    pub fn chunk(&mut self, input: &[u8]) -> Result<(), Error> {
        for &b in input {
            if self.dead {
                break;
            }
            self.step(b)?;
        }
        Ok(())
    }

    /// Signal end-of-input and return the final match result.
    pub fn finish(self) -> bool {
        !self.dead && self.csa.is_accepting(self.config, &self.counter_sets)
    }

    /// Number of counter sets currently alive.
    pub fn live_counter_sets(&self) -> usize {
        self.counter_sets.len()
    }

    pub fn counter_sets(&self) -> &[CounterSet] {
        &self.counter_sets
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    fn apply(&mut self, update_idx: UpdateIdx) {
        let update = &self.csa.cached_updates[update_idx.0 as usize];
        let mut current = std::mem::take(&mut self.counter_sets);
        self.counter_sets = update.builds.iter().map(|build| build.run(&mut current)).collect();
        self.config = update.target;
        if self.counter_sets.iter().any(CounterSet::is_empty) {
            self.prune();
        }
        self.dead = self.csa.config(self.config).is_empty();
    }

    /// Drop the states that refer to an empty counter set.
    fn prune(&mut self) {
        let states: Vec<(CaStateIdx, Vec<usize>)> = self
            .csa
            .config(self.config)
            .states
            .iter()
            .filter(|s| s.counters.iter().all(|c| !self.counter_sets[c.idx()].is_empty()))
            .map(|s| (s.key, s.counters.iter().map(|c| c.idx()).collect()))
            .collect();
        let (config, order) = Config::canonical(states);
        let mut current = std::mem::take(&mut self.counter_sets);
        self.counter_sets = order.iter().map(|&i| std::mem::take(&mut current[i])).collect();
        self.config = self.csa.intern(config);
    }
}
