//! Arena syntax tree, lowering from `regex-syntax` HIR, and normalization.

use std::fmt;
use std::ops::Index;

use indexmap::IndexSet;
use log::trace;
use regex_syntax::hir::{self, Hir, HirKind};

use crate::Error;

// ---------------------------------------------------------------------------
// Byte classes
// ---------------------------------------------------------------------------

/// A 256-entry boolean lookup table indicating which byte values belong
/// to a character class.  `class[b]` is `true` when byte `b` matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ByteClass([bool; 256]);

impl ByteClass {
    /// A class that matches every byte value.
    pub const ALL: Self = Self([true; 256]);

    /// A class that matches no byte value.
    pub const NONE: Self = Self([false; 256]);

    /// Build a class from inclusive byte ranges.
    pub fn from_ranges(ranges: impl IntoIterator<Item = (u8, u8)>) -> Self {
        let mut class = Self::NONE;
        for (start, end) in ranges {
            for b in start..=end {
                class.0[b as usize] = true;
            }
        }
        class
    }

    pub fn singleton(byte: u8) -> Self {
        let mut class = Self::NONE;
        class.0[byte as usize] = true;
        class
    }

    pub fn len(&self) -> usize {
        self.0.iter().filter(|&&b| b).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn complement(&self) -> Self {
        let mut class = *self;
        for b in class.0.iter_mut() {
            *b = !*b;
        }
        class
    }

    /// Member bytes in increasing order.
    pub fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=255u8).filter(move |&b| self.0[b as usize])
    }

    /// Maximal runs of member bytes as inclusive `(start, end)` pairs.
    pub fn ranges(&self) -> Vec<(u8, u8)> {
        let mut ranges: Vec<(u8, u8)> = Vec::new();
        for b in self.bytes() {
            match ranges.last_mut() {
                Some((_, end)) if *end as u16 + 1 == b as u16 => *end = b,
                _ => ranges.push((b, b)),
            }
        }
        ranges
    }
}

/// `class[byte]` tests whether a byte matches this class.
impl Index<u8> for ByteClass {
    type Output = bool;

    #[inline]
    fn index(&self, byte: u8) -> &bool {
        &self.0[byte as usize]
    }
}

/// Index into the interned byte classes of a [`SyntaxTree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassIdx(u32);

impl ClassIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Index of an interned [`Node`].  Equal ids mean structurally equal trees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Identifier of one syntactic counting loop.  Ids start at 1;
/// [`LoopId::NONE`] is carried by operators and guards that do not refer to
/// any loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(u32);

impl LoopId {
    pub const NONE: Self = Self(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bounded repetition `{min,max}` after normalization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CountingLoop {
    pub id: LoopId,
    pub min: u32,
    pub max: u32,
}

/// The zero-width assertions the front end accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Anchor {
    /// `^`, start of input.
    Start,
    /// `$`, end of input.
    End,
}

/// One syntax-tree node.  Children are referenced by [`NodeId`]; nodes are
/// immutable once interned.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Node {
    EmptyMatch,
    NoMatch,
    Literal(u8),
    /// Two or more literal bytes.
    LiteralString(Box<[u8]>),
    /// A byte class; when `negated` the node matches the complement of
    /// `class`.
    Class { class: ClassIdx, negated: bool },
    AnyByte,
    Look(Anchor),
    /// Flattened concatenation of at least two items.
    Concat(Box<[NodeId]>),
    /// Flattened alternation of at least two branches.
    Alternate(Box<[NodeId]>),
    Star(NodeId),
    Plus(NodeId),
    Quest(NodeId),
    /// `sub{min,max}`.  `max` is `None` for `{min,}`.  `id` is
    /// [`LoopId::NONE`] until the repeat has been normalized.
    Repeat {
        sub: NodeId,
        min: u32,
        max: Option<u32>,
        id: LoopId,
    },
    Capture(NodeId),
}

impl Node {
    /// Short name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::EmptyMatch => "empty-match",
            Node::NoMatch => "no-match",
            Node::Literal(_) => "literal",
            Node::LiteralString(_) => "literal-string",
            Node::Class { .. } => "char-class",
            Node::AnyByte => "any-byte",
            Node::Look(_) => "anchor",
            Node::Concat(_) => "concatenation",
            Node::Alternate(_) => "alternation",
            Node::Star(_) => "star",
            Node::Plus(_) => "plus",
            Node::Quest(_) => "quest",
            Node::Repeat { .. } => "bounded-repeat",
            Node::Capture(_) => "capture",
        }
    }
}

// ---------------------------------------------------------------------------
// Syntax tree
// ---------------------------------------------------------------------------

/// Arena of hash-consed [`Node`]s plus the byte classes and counting loops
/// they reference.
#[derive(Debug, Default)]
pub struct SyntaxTree {
    nodes: IndexSet<Node>,
    classes: IndexSet<ByteClass>,
    loops: Vec<CountingLoop>,
}

impl SyntaxTree {
    /// Return the id of `node`, inserting it if no equal node exists yet.
    pub fn intern(&mut self, node: Node) -> NodeId {
        let (idx, _) = self.nodes.insert_full(node);
        NodeId(idx as u32)
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.idx()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Return the index of `class`, inserting it if it is not already
    /// present.  `\d` and `[0-9]` share one entry.
    pub fn intern_class(&mut self, class: ByteClass) -> ClassIdx {
        let (idx, _) = self.classes.insert_full(class);
        ClassIdx(idx as u32)
    }

    #[inline]
    pub fn class(&self, idx: ClassIdx) -> &ByteClass {
        &self.classes[idx.idx()]
    }

    /// The bytes a class node actually matches, with negation applied.
    pub fn effective_class(&self, class: ClassIdx, negated: bool) -> ByteClass {
        let set = *self.class(class);
        if negated { set.complement() } else { set }
    }

    /// Counting loops registered so far, in id order.
    pub fn loops(&self) -> &[CountingLoop] {
        &self.loops
    }

    pub fn counting_loop(&self, id: LoopId) -> Option<CountingLoop> {
        let idx = id.get().checked_sub(1)?;
        self.loops.get(idx as usize).copied()
    }

    fn next_loop(&mut self, min: u32, max: u32) -> LoopId {
        let id = LoopId(self.loops.len() as u32 + 1);
        self.loops.push(CountingLoop { id, min, max });
        id
    }

    // -- Smart constructors ------------------------------------------------

    pub fn empty(&mut self) -> NodeId {
        self.intern(Node::EmptyMatch)
    }

    pub fn no_match(&mut self) -> NodeId {
        self.intern(Node::NoMatch)
    }

    pub fn literal(&mut self, byte: u8) -> NodeId {
        self.intern(Node::Literal(byte))
    }

    pub fn literal_string(&mut self, bytes: &[u8]) -> NodeId {
        match bytes {
            [] => self.empty(),
            [b] => self.literal(*b),
            _ => self.intern(Node::LiteralString(bytes.into())),
        }
    }

    /// A class node for `set`.  Empty and full sets become `NoMatch` and
    /// `AnyByte`; sets with more than half of the byte values are stored as
    /// the negation of their complement.
    pub fn class_node(&mut self, set: ByteClass) -> NodeId {
        match set.len() {
            0 => self.no_match(),
            256 => self.intern(Node::AnyByte),
            n if n > 128 => {
                let class = self.intern_class(set.complement());
                self.intern(Node::Class {
                    class,
                    negated: true,
                })
            }
            _ => {
                let class = self.intern_class(set);
                self.intern(Node::Class {
                    class,
                    negated: false,
                })
            }
        }
    }

    /// Concatenate `items`, flattening nested concatenations and dropping
    /// empty words.  Any `NoMatch` item makes the whole result `NoMatch`.
    pub fn concat(&mut self, items: impl IntoIterator<Item = NodeId>) -> NodeId {
        let mut flat = Vec::new();
        let mut dead = false;
        for item in items {
            match self.node(item) {
                Node::EmptyMatch => {}
                Node::NoMatch => dead = true,
                Node::Concat(inner) => flat.extend_from_slice(inner),
                _ => flat.push(item),
            }
        }
        if dead {
            return self.no_match();
        }
        match flat.len() {
            0 => self.empty(),
            1 => flat[0],
            _ => self.intern(Node::Concat(flat.into())),
        }
    }

    /// Alternate `branches`, flattening nested alternations and dropping
    /// `NoMatch` branches and exact duplicates.
    pub fn alternate(&mut self, branches: impl IntoIterator<Item = NodeId>) -> NodeId {
        let mut flat: Vec<NodeId> = Vec::new();
        for branch in branches {
            match self.node(branch) {
                Node::NoMatch => {}
                Node::Alternate(inner) => {
                    for &b in inner.iter() {
                        if !flat.contains(&b) {
                            flat.push(b);
                        }
                    }
                }
                _ => {
                    if !flat.contains(&branch) {
                        flat.push(branch);
                    }
                }
            }
        }
        match flat.len() {
            0 => self.no_match(),
            1 => flat[0],
            _ => self.intern(Node::Alternate(flat.into())),
        }
    }

    pub fn star(&mut self, sub: NodeId) -> NodeId {
        match self.node(sub) {
            Node::EmptyMatch | Node::NoMatch => self.empty(),
            Node::Star(_) => sub,
            _ => self.intern(Node::Star(sub)),
        }
    }

    /// Top-level elements of a residual: the items of a concatenation, or
    /// the node itself.
    pub fn elements(&self, id: NodeId) -> Vec<NodeId> {
        match self.node(id) {
            Node::Concat(items) => items.to_vec(),
            _ => vec![id],
        }
    }

    /// Branches of an alternation, or the node itself.
    pub fn branches(&self, id: NodeId) -> Vec<NodeId> {
        match self.node(id) {
            Node::Alternate(branches) => branches.to_vec(),
            _ => vec![id],
        }
    }
}

// ---------------------------------------------------------------------------
// Lowering (regex-syntax HIR -> arena)
// ---------------------------------------------------------------------------

impl SyntaxTree {
    /// Recursively lower a `regex-syntax` HIR node into the arena.
    ///
    /// The result mirrors the HIR (captures, `?`, `+` and unbounded repeats
    /// are kept); [`normalize`](Self::normalize) rewrites them afterwards.
    pub fn lower(&mut self, hir: &Hir) -> Result<NodeId, Error> {
        match hir.kind() {
            HirKind::Empty => Ok(self.empty()),
            HirKind::Literal(lit) => Ok(self.literal_string(&lit.0)),
            HirKind::Class(hir::Class::Bytes(class)) => {
                let set = ByteClass::from_ranges(class.ranges().iter().map(|r| (r.start(), r.end())));
                Ok(self.class_node(set))
            }
            HirKind::Class(hir::Class::Unicode(class)) => {
                // regex-syntax may produce Unicode classes for ASCII-only
                // patterns like `(a|b)` → `[ab]`.  Only classes that fit in
                // a single byte are accepted.
                let ranges = class.ranges();
                let all_single_byte = ranges.iter().all(|r| (r.end() as u32) <= 0xFF);
                if !all_single_byte {
                    return Err(Error::UnsupportedClass(hir::Class::Unicode(class.clone())));
                }
                let set = ByteClass::from_ranges(
                    ranges.iter().map(|r| (r.start() as u32 as u8, r.end() as u32 as u8)),
                );
                Ok(self.class_node(set))
            }
            HirKind::Look(hir::Look::Start) => Ok(self.intern(Node::Look(Anchor::Start))),
            HirKind::Look(hir::Look::End) => Ok(self.intern(Node::Look(Anchor::End))),
            HirKind::Look(look) => Err(Error::UnsupportedLook(*look)),
            HirKind::Capture(cap) => {
                let sub = self.lower(&cap.sub)?;
                Ok(self.intern(Node::Capture(sub)))
            }
            HirKind::Concat(children) => {
                let items = children
                    .iter()
                    .map(|child| self.lower(child))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.concat(items))
            }
            HirKind::Alternation(children) => {
                let branches = children
                    .iter()
                    .map(|child| self.lower(child))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.alternate(branches))
            }
            HirKind::Repetition(rep) => {
                let sub = self.lower(&rep.sub)?;
                let node = match (rep.min, rep.max) {
                    (0, Some(1)) => Node::Quest(sub),
                    (0, None) => Node::Star(sub),
                    (1, None) => Node::Plus(sub),
                    (min, max) => Node::Repeat {
                        sub,
                        min,
                        max,
                        id: LoopId::NONE,
                    },
                };
                Ok(self.intern(node))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

impl SyntaxTree {
    /// Rewrite `id` into the canonical form the derivative equations expect:
    ///
    /// - captures are unwrapped;
    /// - `x+` becomes `x·x*` and `x?` becomes `(|x)`;
    /// - `x{m,}` becomes `x{m}·x*`, `x{0,0}` the empty word, `x{1,1}` just `x`;
    /// - a repeat whose body is nullable gets `min = 0`;
    /// - every bounded repeat is numbered with a fresh [`LoopId`].
    ///
    /// Nodes are never modified in place.  Normalizing a normalized tree
    /// returns the same id.
    pub fn normalize(&mut self, id: NodeId) -> NodeId {
        match self.node(id).clone() {
            Node::Capture(sub) => self.normalize(sub),
            Node::Quest(sub) => {
                let sub = self.normalize(sub);
                let empty = self.empty();
                self.alternate([empty, sub])
            }
            Node::Plus(sub) => {
                // Each copy is normalized on its own so that loops inside
                // the body get distinct ids in the two positions.
                let first = self.normalize(sub);
                let rest = self.normalize(sub);
                let rest = self.star(rest);
                self.concat([first, rest])
            }
            Node::Star(sub) => {
                let sub = self.normalize(sub);
                self.star(sub)
            }
            Node::Repeat { sub, min, max, id } => self.normalize_repeat(sub, min, max, id),
            Node::Concat(items) => {
                let items: Vec<NodeId> = items.iter().map(|&item| self.normalize(item)).collect();
                self.concat(items)
            }
            Node::Alternate(branches) => {
                let branches: Vec<NodeId> =
                    branches.iter().map(|&branch| self.normalize(branch)).collect();
                self.alternate(branches)
            }
            Node::EmptyMatch
            | Node::NoMatch
            | Node::Literal(_)
            | Node::LiteralString(_)
            | Node::Class { .. }
            | Node::AnyByte
            | Node::Look(_) => id,
        }
    }

    fn normalize_repeat(&mut self, sub: NodeId, min: u32, max: Option<u32>, id: LoopId) -> NodeId {
        let Some(max) = max else {
            let rest = self.normalize(sub);
            let rest = self.star(rest);
            if min == 0 {
                return rest;
            }
            let head = self.normalize_repeat(sub, min, Some(min), LoopId::NONE);
            return self.concat([head, rest]);
        };
        let body = self.normalize(sub);
        match self.node(body) {
            Node::EmptyMatch => return body,
            Node::NoMatch if min == 0 => return self.empty(),
            Node::NoMatch => return body,
            _ => {}
        }
        if max == 0 {
            return self.empty();
        }
        let min = if self.is_nullable(body) { 0 } else { min };
        if min == 1 && max == 1 {
            return body;
        }
        let id = if id == LoopId::NONE {
            let id = self.next_loop(min, max);
            trace!("normalize: counting loop {} = {{{},{}}}", id, min, max);
            id
        } else {
            id
        };
        self.intern(Node::Repeat {
            sub: body,
            min,
            max: Some(max),
            id,
        })
    }

    /// Remove `^` and `$` where they coincide with the input boundaries.
    ///
    /// Matching is whole-input, so a `^` whose predecessors in the top-level
    /// concatenation can all match the empty word is dropped together with
    /// them, and likewise a `$` with its successors.  Top-level alternation
    /// branches are handled one by one.
    pub fn strip_boundary_anchors(&mut self, id: NodeId) -> NodeId {
        match self.node(id).clone() {
            Node::Look(_) => self.empty(),
            Node::Alternate(branches) => {
                let branches: Vec<NodeId> = branches
                    .iter()
                    .map(|&branch| self.strip_boundary_anchors(branch))
                    .collect();
                self.alternate(branches)
            }
            Node::Concat(items) => {
                let mut items = items.to_vec();
                let is_start = |tree: &Self, n: NodeId| matches!(tree.node(n), Node::Look(Anchor::Start));
                let is_end = |tree: &Self, n: NodeId| matches!(tree.node(n), Node::Look(Anchor::End));
                if let Some(i) = items.iter().rposition(|&n| is_start(self, n))
                    && items[..i].iter().all(|&n| is_start(self, n) || self.is_nullable(n))
                {
                    items.drain(..=i);
                }
                if let Some(i) = items.iter().position(|&n| is_end(self, n))
                    && items[i + 1..].iter().all(|&n| is_end(self, n) || self.is_nullable(n))
                {
                    items.truncate(i);
                }
                self.concat(items)
            }
            _ => id,
        }
    }

    /// Whether the empty word belongs to the language of `id`.
    ///
    /// Anchors are not nullable: one that survives
    /// [`strip_boundary_anchors`](Self::strip_boundary_anchors) sits strictly
    /// inside the input and can never hold.
    pub fn is_nullable(&self, id: NodeId) -> bool {
        match self.node(id) {
            Node::EmptyMatch | Node::Star(_) | Node::Quest(_) => true,
            Node::NoMatch
            | Node::Literal(_)
            | Node::LiteralString(_)
            | Node::Class { .. }
            | Node::AnyByte
            | Node::Look(_) => false,
            Node::Concat(items) => items.iter().all(|&item| self.is_nullable(item)),
            Node::Alternate(branches) => branches.iter().any(|&branch| self.is_nullable(branch)),
            Node::Plus(sub) | Node::Capture(sub) => self.is_nullable(*sub),
            Node::Repeat { sub, min, .. } => *min == 0 || self.is_nullable(*sub),
        }
    }

    /// Canonical textual form of `id`, valid `(?s-u)` regex syntax.
    pub fn display(&self, id: NodeId) -> NodeDisplay<'_> {
        NodeDisplay { tree: self, id }
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

/// Formats a node as a byte-oriented regex; see [`SyntaxTree::display`].
pub struct NodeDisplay<'a> {
    tree: &'a SyntaxTree,
    id: NodeId,
}

impl fmt::Display for NodeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_node(self.tree, self.id, f)
    }
}

fn write_byte(byte: u8, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b' ' {
        write!(f, "{}", byte as char)
    } else if byte.is_ascii_graphic() && regex_syntax::is_meta_character(byte as char) {
        write!(f, "\\{}", byte as char)
    } else if byte.is_ascii_graphic() {
        write!(f, "{}", byte as char)
    } else {
        write!(f, "\\x{:02X}", byte)
    }
}

fn write_class_byte(byte: u8, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if byte.is_ascii_alphanumeric() {
        write!(f, "{}", byte as char)
    } else {
        write!(f, "\\x{:02X}", byte)
    }
}

fn write_node(tree: &SyntaxTree, id: NodeId, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match tree.node(id) {
        Node::EmptyMatch => write!(f, "(?:)"),
        Node::NoMatch => write!(f, "[^\\x00-\\xFF]"),
        Node::Literal(b) => write_byte(*b, f),
        Node::LiteralString(bytes) => bytes.iter().try_for_each(|&b| write_byte(b, f)),
        Node::Class { class, negated } => {
            write!(f, "[{}", if *negated { "^" } else { "" })?;
            for (start, end) in tree.class(*class).ranges() {
                write_class_byte(start, f)?;
                if end != start {
                    write!(f, "-")?;
                    write_class_byte(end, f)?;
                }
            }
            write!(f, "]")
        }
        Node::AnyByte => write!(f, "."),
        Node::Look(Anchor::Start) => write!(f, "^"),
        Node::Look(Anchor::End) => write!(f, "$"),
        Node::Concat(items) => items.iter().try_for_each(|&item| write_atom(tree, item, false, f)),
        Node::Alternate(branches) => {
            write!(f, "(?:")?;
            for (i, &branch) in branches.iter().enumerate() {
                if i > 0 {
                    write!(f, "|")?;
                }
                write_node(tree, branch, f)?;
            }
            write!(f, ")")
        }
        Node::Star(sub) => {
            write_atom(tree, *sub, true, f)?;
            write!(f, "*")
        }
        Node::Plus(sub) => {
            write_atom(tree, *sub, true, f)?;
            write!(f, "+")
        }
        Node::Quest(sub) => {
            write_atom(tree, *sub, true, f)?;
            write!(f, "?")
        }
        Node::Repeat { sub, min, max, .. } => {
            write_atom(tree, *sub, true, f)?;
            match max {
                Some(max) => write!(f, "{{{},{}}}", min, max),
                None => write!(f, "{{{},}}", min),
            }
        }
        Node::Capture(sub) => {
            write!(f, "(")?;
            write_node(tree, *sub, f)?;
            write!(f, ")")
        }
    }
}

/// Write `id`, wrapped in a non-capturing group unless it is a single atom.
/// Operands of a postfix operator also wrap literal strings and repeats.
fn write_atom(tree: &SyntaxTree, id: NodeId, quantified: bool, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let atomic = match tree.node(id) {
        Node::Concat(_) => false,
        Node::LiteralString(_) | Node::Star(_) | Node::Plus(_) | Node::Quest(_) | Node::Repeat { .. } => {
            !quantified
        }
        _ => true,
    };
    if atomic {
        write_node(tree, id, f)
    } else {
        write!(f, "(?:")?;
        write_node(tree, id, f)?;
        write!(f, ")")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
