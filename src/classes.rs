//! Alphabet compression: bytes that no part of the pattern tells apart share
//! one [`SymbolClass`].

use std::fmt;

use rustc_hash::FxHashMap;

use crate::syntax::{ByteClass, Node, NodeId, SyntaxTree};

/// An equivalence class of input bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolClass(u16);

impl SymbolClass {
    /// Bytes that no literal or class of the pattern mentions.  Nothing ever
    /// consumes them, so reading one ends the match.
    pub const REJECT: Self = Self(0);

    /// Wildcard carried by transitions out of `.`; it stands for every
    /// valid class.
    pub const ANY: Self = Self(u16::MAX);

    pub fn new(class: u16) -> Self {
        Self(class)
    }

    #[inline]
    pub fn idx(self) -> usize {
        self.0 as usize
    }

    /// Whether a transition labelled `self` fires on an input of class
    /// `input`.
    #[inline]
    pub fn admits(self, input: SymbolClass) -> bool {
        self == input || self == Self::ANY
    }
}

impl fmt::Display for SymbolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ANY {
            write!(f, "any")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Byte → [`SymbolClass`] map.  Valid classes are `1..len`.
#[derive(Clone, Debug)]
pub struct SymbolClassTable {
    map: [SymbolClass; 256],
    len: usize,
}

impl SymbolClassTable {
    /// Wrap an externally computed partition.  `len` counts class 0.
    pub fn new(map: [u16; 256], len: usize) -> Self {
        Self {
            map: map.map(SymbolClass),
            len,
        }
    }

    /// Partition the bytes by their membership in every byte set reachable
    /// from `root`: two bytes share a class iff each literal, class and
    /// wildcard either contains both or neither.
    pub fn from_tree(tree: &SyntaxTree, root: NodeId) -> Self {
        let mut sets: Vec<ByteClass> = Vec::new();
        let mut seen = vec![false; tree.len()];
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id.idx()], true) {
                continue;
            }
            let mut add = |set: ByteClass| {
                if !sets.contains(&set) {
                    sets.push(set);
                }
            };
            match tree.node(id) {
                Node::Literal(b) => add(ByteClass::singleton(*b)),
                Node::LiteralString(bytes) => bytes.iter().for_each(|&b| add(ByteClass::singleton(b))),
                Node::Class { class, negated } => add(tree.effective_class(*class, *negated)),
                Node::AnyByte => add(ByteClass::ALL),
                Node::Concat(items) | Node::Alternate(items) => stack.extend(items.iter().copied()),
                Node::Star(sub) | Node::Plus(sub) | Node::Quest(sub) | Node::Capture(sub) => stack.push(*sub),
                Node::Repeat { sub, .. } => stack.push(*sub),
                Node::EmptyMatch | Node::NoMatch | Node::Look(_) => {}
            }
        }

        let mut signatures: FxHashMap<Vec<bool>, u16> = FxHashMap::default();
        let mut map = [SymbolClass::REJECT; 256];
        for byte in 0..=255u8 {
            let signature: Vec<bool> = sets.iter().map(|set| set[byte]).collect();
            if !signature.contains(&true) {
                continue;
            }
            let next = signatures.len() as u16 + 1;
            map[byte as usize] = SymbolClass(*signatures.entry(signature).or_insert(next));
        }
        Self {
            map,
            len: signatures.len() + 1,
        }
    }

    #[inline]
    pub fn class_of(&self, byte: u8) -> SymbolClass {
        self.map[byte as usize]
    }

    /// Number of classes, counting the reject class 0.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len <= 1
    }

    /// Whether `class` is one the matcher may transition on.
    #[inline]
    pub fn is_valid(&self, class: SymbolClass) -> bool {
        class != SymbolClass::REJECT && class.idx() < self.len
    }

    /// The valid classes that contain at least one byte of `set`, ascending.
    pub fn classes_of(&self, set: &ByteClass) -> Vec<SymbolClass> {
        let mut classes: Vec<SymbolClass> = set
            .bytes()
            .map(|b| self.class_of(b))
            .filter(|&c| self.is_valid(c))
            .collect();
        classes.sort_unstable();
        classes.dedup();
        classes
    }

    /// Representative bytes of `class`, for diagnostics.
    pub fn bytes_of(&self, class: SymbolClass) -> impl Iterator<Item = u8> + '_ {
        (0..=255u8).filter(move |&b| self.map[b as usize] == class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::parse_hir_bytes;

    fn table(pattern: &str) -> SymbolClassTable {
        let mut tree = SyntaxTree::default();
        let root = tree.lower(&parse_hir_bytes(pattern)).unwrap();
        let root = tree.normalize(root);
        SymbolClassTable::from_tree(&tree, root)
    }

    #[test]
    fn test_partition_by_membership() {
        let t = table("a[a-c]x");
        // {a}, {b, c}, {x}, plus the reject class.
        assert_eq!(t.len(), 4);
        assert_eq!(t.class_of(b'b'), t.class_of(b'c'));
        assert_ne!(t.class_of(b'a'), t.class_of(b'b'));
        assert_ne!(t.class_of(b'x'), t.class_of(b'a'));
        assert_eq!(t.class_of(b'z'), SymbolClass::REJECT);
        assert_eq!(t.class_of(0), SymbolClass::REJECT);
        assert_eq!(t.bytes_of(t.class_of(b'b')).collect::<Vec<_>>(), b"bc");
    }

    #[test]
    fn test_classes_of_set() {
        let t = table("a[a-c]x");
        let set = ByteClass::from_ranges([(b'a', b'c')]);
        let classes = t.classes_of(&set);
        assert_eq!(classes, vec![t.class_of(b'a'), t.class_of(b'b')]);

        let unrelated = ByteClass::from_ranges([(b'0', b'9')]);
        assert!(t.classes_of(&unrelated).is_empty());
    }

    #[test]
    fn test_wildcard_covers_every_byte() {
        let t = table("a.b");
        for byte in 0..=255u8 {
            assert!(t.is_valid(t.class_of(byte)), "byte {} is rejected", byte);
        }
        assert_eq!(t.len(), 4);
    }

    #[test]
    fn test_validity_range() {
        let t = table("ab");
        assert!(!t.is_valid(SymbolClass::REJECT));
        assert!(t.is_valid(SymbolClass::new(1)));
        assert!(t.is_valid(SymbolClass::new(2)));
        assert!(!t.is_valid(SymbolClass::new(3)));
        assert!(!t.is_valid(SymbolClass::ANY));
        assert!(SymbolClass::ANY.admits(SymbolClass::new(2)));
        assert!(!SymbolClass::new(1).admits(SymbolClass::new(2)));
    }

    #[test]
    fn test_external_table() {
        let mut map = [0u16; 256];
        map[b'q' as usize] = 1;
        let t = SymbolClassTable::new(map, 2);
        assert_eq!(t.class_of(b'q'), SymbolClass::new(1));
        assert!(t.is_valid(t.class_of(b'q')));
        assert!(!t.is_valid(t.class_of(b'r')));
    }
}
