//! Which derivative equation applies to a residual.
//!
//! Every normalized residual `r` falls into one of five shapes:
//!
//! ```text
//! Epsilon            r ∈ { ε, ∅ }                 no transitions
//! Concatenation      r = x · r2    x a byte set or anchor
//! Alternation        r = (r1a | r1b | ...) · r2
//! Repetition         r = x* · r2
//! CountedRepetition  r = x{m,n} · r2
//! ```
//!
//! `op1` is the head and `op2` the rest; `op1 · op2` denotes the same
//! language as `r` in every case.

use crate::Error;
use crate::syntax::{Node, NodeId, SyntaxTree};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EquationKind {
    Epsilon,
    Concatenation,
    Alternation,
    Repetition,
    CountedRepetition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Equation {
    pub kind: EquationKind,
    pub op1: NodeId,
    pub op2: NodeId,
}

impl Equation {
    fn new(kind: EquationKind, op1: NodeId, op2: NodeId) -> Self {
        Self { kind, op1, op2 }
    }
}

/// Split the normalized residual `id` into its equation.
///
/// Captures, `+` and `?` must have been removed by
/// [`SyntaxTree::normalize`]; they fail with
/// [`Error::UnsupportedConstruct`].
pub fn classify(tree: &mut SyntaxTree, id: NodeId) -> Result<Equation, Error> {
    let empty = tree.empty();
    let equation = match tree.node(id).clone() {
        Node::EmptyMatch | Node::NoMatch => Equation::new(EquationKind::Epsilon, empty, empty),
        Node::Literal(_) | Node::Class { .. } | Node::AnyByte | Node::Look(_) => {
            Equation::new(EquationKind::Concatenation, id, empty)
        }
        Node::LiteralString(bytes) => {
            let head = tree.literal(bytes[0]);
            let rest = tree.literal_string(&bytes[1..]);
            Equation::new(EquationKind::Concatenation, head, rest)
        }
        Node::Alternate(_) => Equation::new(EquationKind::Alternation, id, empty),
        Node::Star(_) => Equation::new(EquationKind::Repetition, id, empty),
        Node::Repeat { .. } => Equation::new(EquationKind::CountedRepetition, id, empty),
        Node::Concat(items) => {
            let head = items[0];
            let tail = tree.concat(items[1..].iter().copied());
            match tree.node(head) {
                Node::EmptyMatch => return classify(tree, tail),
                Node::NoMatch => return Ok(Equation::new(EquationKind::Epsilon, empty, empty)),
                _ => {}
            }
            let head = classify(tree, head)?;
            let op2 = tree.concat([head.op2, tail]);
            Equation::new(head.kind, head.op1, op2)
        }
        node @ (Node::Plus(_) | Node::Quest(_) | Node::Capture(_)) => {
            return Err(Error::UnsupportedConstruct {
                kind: node.kind_name(),
            });
        }
    };
    Ok(equation)
}
