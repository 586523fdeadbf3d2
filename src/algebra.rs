//! Counter operators, guards, and their composition along a path.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use log::trace;

use crate::syntax::{CountingLoop, LoopId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperatorKind {
    /// Leave every counter alone.
    Id,
    /// Start another iteration of the loop.
    Incr,
    /// Leave the loop.
    Exit,
    /// Leave the loop and immediately enter it again: the counter restarts
    /// at 1.
    Exit1,
}

/// The effect a transition has on one counting loop's counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterOperator {
    pub kind: OperatorKind,
    pub loop_id: LoopId,
    pub min: u32,
    pub max: u32,
}

impl CounterOperator {
    pub fn new(kind: OperatorKind, counting_loop: CountingLoop) -> Self {
        Self {
            kind,
            loop_id: counting_loop.id,
            min: counting_loop.min,
            max: counting_loop.max,
        }
    }

    pub fn id() -> Self {
        Self {
            kind: OperatorKind::Id,
            loop_id: LoopId::NONE,
            min: 0,
            max: 0,
        }
    }

    pub fn is_id(&self) -> bool {
        self.kind == OperatorKind::Id
    }
}

impl fmt::Display for CounterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OperatorKind::Id => write!(f, "ID"),
            OperatorKind::Incr => write!(f, "INCR({})", self.loop_id),
            OperatorKind::Exit => write!(f, "EXIT({})", self.loop_id),
            OperatorKind::Exit1 => write!(f, "EXIT1({})", self.loop_id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GuardKind {
    True,
    /// The counter is below the loop's `max`.
    CanIncr,
    /// The counter has reached the loop's `min`.
    CanExit,
    False,
}

/// A condition on one counter that must hold for a transition to fire or a
/// state to accept.
///
/// Identity is `(kind, loop_id, negated)`; the bounds are copied from the
/// loop and never differ for the same id.
#[derive(Clone, Copy, Debug)]
pub struct CounterGuard {
    pub kind: GuardKind,
    pub loop_id: LoopId,
    pub min: u32,
    pub max: u32,
    pub negated: bool,
}

impl CounterGuard {
    pub fn new(kind: GuardKind, counting_loop: CountingLoop) -> Self {
        Self {
            kind,
            loop_id: counting_loop.id,
            min: counting_loop.min,
            max: counting_loop.max,
            negated: false,
        }
    }

    pub fn always() -> Self {
        Self {
            kind: GuardKind::True,
            loop_id: LoopId::NONE,
            min: 0,
            max: 0,
            negated: false,
        }
    }

    /// Evaluate the guard for a single counter value.
    pub fn holds_for(&self, value: u64) -> bool {
        let holds = match self.kind {
            GuardKind::True => true,
            GuardKind::False => false,
            GuardKind::CanIncr => value < u64::from(self.max),
            GuardKind::CanExit => value >= u64::from(self.min),
        };
        holds != self.negated
    }

    fn key(&self) -> (GuardKind, LoopId, bool) {
        (self.kind, self.loop_id, self.negated)
    }
}

impl PartialEq for CounterGuard {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for CounterGuard {}

impl Hash for CounterGuard {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for CounterGuard {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CounterGuard {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for CounterGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "!")?;
        }
        match self.kind {
            GuardKind::True => write!(f, "True"),
            GuardKind::False => write!(f, "False"),
            GuardKind::CanIncr => write!(f, "CanIncr({})", self.loop_id),
            GuardKind::CanExit => write!(f, "CanExit({})", self.loop_id),
        }
    }
}

/// Conjunction of guards.  `True` guards are never stored, so the empty set
/// is the unconditional guard.
pub type GuardSet = BTreeSet<CounterGuard>;

/// The guard an operator needs on the value it reads.
pub fn guard_for(op: &CounterOperator) -> CounterGuard {
    let kind = match op.kind {
        OperatorKind::Id => GuardKind::True,
        OperatorKind::Incr => GuardKind::CanIncr,
        OperatorKind::Exit | OperatorKind::Exit1 => GuardKind::CanExit,
    };
    CounterGuard {
        kind,
        loop_id: op.loop_id,
        min: op.min,
        max: op.max,
        negated: false,
    }
}

/// Add `guard` to `guards` unless it is trivially true.
pub fn insert_guard(guards: &mut GuardSet, guard: CounterGuard) {
    if guard.kind != GuardKind::True || guard.negated {
        guards.insert(guard);
    }
}

/// Collapse the operator pair at the junction of two paths.
///
/// `None` means no identity applies and the pair is kept as is;
/// `Some(None)` means the pair can never fire.
fn collapse(last: &CounterOperator, first: &CounterOperator) -> Option<Option<CounterOperator>> {
    use OperatorKind::*;

    match (last.kind, first.kind) {
        (Id, _) => Some(Some(*first)),
        (_, Id) => Some(Some(*last)),
        _ if last.loop_id != first.loop_id => None,
        (Exit, Incr) => Some(Some(CounterOperator {
            kind: Exit1,
            ..*first
        })),
        (Exit, Exit) if last.min == 0 && first.min == 0 => Some(Some(*last)),
        (Exit, Exit) => Some(None),
        _ => None,
    }
}

/// Compose the operators and guards of a path `a` with those of the path `b`
/// that follows it.
///
/// The last operator of `a` and the first of `b` are merged when they act on
/// the same loop or one of them is `ID`; the merged operator's guard replaces
/// theirs.  Returns `None` when the composed path can never fire.
pub fn compose(
    ops_a: &[CounterOperator],
    guards_a: &GuardSet,
    ops_b: &[CounterOperator],
    guards_b: &GuardSet,
) -> Option<(Vec<CounterOperator>, GuardSet)> {
    let (Some((last, head)), Some((first, tail))) = (ops_a.split_last(), ops_b.split_first()) else {
        let ops = [ops_a, ops_b].concat();
        let guards = guards_a.union(guards_b).copied().collect();
        return Some((ops, guards));
    };

    let mut guards: GuardSet = guards_a.union(guards_b).copied().collect();
    let mut ops = Vec::with_capacity(ops_a.len() + ops_b.len());
    ops.extend_from_slice(head);
    match collapse(last, first) {
        None => {
            ops.push(*last);
            ops.push(*first);
            ops.extend_from_slice(tail);
        }
        Some(None) => {
            trace!("compose: {} then {} is infeasible", last, first);
            return None;
        }
        Some(Some(merged)) => {
            ops.push(merged);
            ops.extend_from_slice(tail);
            for removed in [last, first] {
                let guard = guard_for(removed);
                if !ops.iter().any(|op| guard_for(op) == guard) {
                    guards.remove(&guard);
                }
            }
            insert_guard(&mut guards, guard_for(&merged));
        }
    }
    Some((ops, guards))
}

#[cfg(test)]
mod tests {
    use itertools::iproduct;

    use super::*;
    use crate::syntax::CountingLoop;

    const LOOPS: [CountingLoop; 3] = [
        CountingLoop {
            id: LoopId::new(1),
            min: 0,
            max: 2,
        },
        CountingLoop {
            id: LoopId::new(2),
            min: 1,
            max: 2,
        },
        CountingLoop {
            id: LoopId::new(3),
            min: 2,
            max: 3,
        },
    ];

    const KINDS: [OperatorKind; 4] = [
        OperatorKind::Id,
        OperatorKind::Incr,
        OperatorKind::Exit,
        OperatorKind::Exit1,
    ];

    fn op(kind: OperatorKind, counting_loop: CountingLoop) -> CounterOperator {
        match kind {
            OperatorKind::Id => CounterOperator::id(),
            _ => CounterOperator::new(kind, counting_loop),
        }
    }

    fn guards_of(ops: &[CounterOperator]) -> GuardSet {
        let mut guards = GuardSet::new();
        for op in ops {
            insert_guard(&mut guards, guard_for(op));
        }
        guards
    }

    /// Apply `ops` one after another; `values` is indexed by loop id.
    fn run(ops: &[CounterOperator], values: &mut [u64; 4]) -> bool {
        for op in ops {
            let v = &mut values[op.loop_id.get() as usize];
            match op.kind {
                OperatorKind::Id => {}
                OperatorKind::Incr if *v < u64::from(op.max) => *v += 1,
                OperatorKind::Exit if *v >= u64::from(op.min) => *v = 0,
                OperatorKind::Exit1 if *v >= u64::from(op.min) => *v = 1,
                _ => return false,
            }
        }
        true
    }

    #[test]
    fn test_identities() {
        let l = LOOPS[1];
        let id = CounterOperator::id();
        let incr = op(OperatorKind::Incr, l);
        let exit = op(OperatorKind::Exit, l);
        let none = GuardSet::new();

        let (ops, guards) = compose(&[id], &none, &[incr], &guards_of(&[incr])).unwrap();
        assert_eq!(ops, vec![incr]);
        assert_eq!(guards, guards_of(&[incr]));

        let (ops, guards) = compose(&[exit], &guards_of(&[exit]), &[incr], &guards_of(&[incr])).unwrap();
        assert_eq!(ops, vec![CounterOperator::new(OperatorKind::Exit1, l)]);
        assert_eq!(guards, guards_of(&[exit]), "CanIncr is replaced by CanExit");

        let (ops, _) = compose(&[exit], &guards_of(&[exit]), &[id], &none).unwrap();
        assert_eq!(ops, vec![exit]);

        let (ops, guards) = compose(&[id], &none, &[id], &none).unwrap();
        assert_eq!(ops, vec![id]);
        assert!(guards.is_empty());
    }

    #[test]
    fn test_double_exit() {
        let none = GuardSet::new();
        let exit0 = op(OperatorKind::Exit, LOOPS[0]);
        let (ops, _) = compose(&[exit0], &none, &[exit0], &none).unwrap();
        assert_eq!(ops, vec![exit0], "min 0 loops may exit twice");

        let exit1 = op(OperatorKind::Exit, LOOPS[1]);
        assert!(compose(&[exit1], &none, &[exit1], &none).is_none());

        // An enclosing loop may already have advanced past its minimum.
        let (ops, _) = compose(&[exit0], &none, &[exit1], &none).unwrap();
        assert_eq!(ops, vec![exit0, exit1]);
    }

    #[test]
    fn test_collapse_keeps_surrounding_operators() {
        let incr0 = op(OperatorKind::Incr, LOOPS[0]);
        let exit1 = op(OperatorKind::Exit, LOOPS[1]);
        let incr1 = op(OperatorKind::Incr, LOOPS[1]);
        let incr2 = op(OperatorKind::Incr, LOOPS[2]);
        let a = [incr0, exit1];
        let b = [incr1, incr2];
        let (ops, guards) = compose(&a, &guards_of(&a), &b, &guards_of(&b)).unwrap();
        assert_eq!(ops, vec![incr0, CounterOperator::new(OperatorKind::Exit1, LOOPS[1]), incr2]);
        assert_eq!(guards, guards_of(&ops));
    }

    #[test]
    fn test_all_pairs_agree_with_sequential_execution() {
        for (&ka, &kb, la, lb) in iproduct!(&KINDS, &KINDS, 0..LOOPS.len(), 0..LOOPS.len()) {
            let a = [op(ka, LOOPS[la])];
            let b = [op(kb, LOOPS[lb])];
            let composed = compose(&a, &guards_of(&a), &b, &guards_of(&b));
            for v in iproduct!(0..=3u64, 0..=3u64, 0..=3u64) {
                let start = [0, v.0, v.1, v.2];
                let mut expected = start;
                let feasible = run(&a, &mut expected) && run(&b, &mut expected);
                match &composed {
                    None => assert!(!feasible, "{} . {} declared infeasible but fires on {:?}", a[0], b[0], start),
                    Some((ops, guards)) => {
                        let mut actual = start;
                        assert_eq!(run(ops, &mut actual), feasible, "{} . {} on {:?}", a[0], b[0], start);
                        if feasible {
                            assert_eq!(actual, expected, "{} . {} on {:?}", a[0], b[0], start);
                        }
                        assert!(ops.len() <= 2);
                        for op in ops {
                            let guard = guard_for(op);
                            assert!(op.is_id() || guards.contains(&guard), "missing {} for {}", guard, op);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_guard_identity_ignores_bounds() {
        let mut a = CounterGuard::new(GuardKind::CanExit, LOOPS[1]);
        let b = CounterGuard::new(GuardKind::CanExit, LOOPS[1]);
        a.min = 7;
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
        a.negated = true;
        assert_ne!(a, b);
    }

    #[test]
    fn test_holds_for() {
        let incr = CounterGuard::new(GuardKind::CanIncr, LOOPS[2]);
        let exit = CounterGuard::new(GuardKind::CanExit, LOOPS[2]);
        assert!(incr.holds_for(2));
        assert!(!incr.holds_for(3));
        assert!(!exit.holds_for(1));
        assert!(exit.holds_for(2));
        let not_exit = CounterGuard { negated: true, ..exit };
        assert!(not_exit.holds_for(1));
        assert!(CounterGuard::always().holds_for(0));
    }
}
