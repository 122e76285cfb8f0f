//! Routines for working with Morton keys.
//!
//! A [SpaceKey] stores the path from the root of a `2^D`-ary tree to a node
//! as interleaved coordinate bits. A leading sentinel bit marks the depth,
//! so keys of different depths never collide and the depth is recovered
//! from the bit length of the key. The root is the sentinel bit alone.

use std::fmt::Display;

use mpi::{datatype::UserDatatype, traits::Equivalence};

use crate::{
    constants::KEY_BITS,
    geometry::{PhysicalBox, Point},
};

/// A Morton key of a node in a `D` dimensional tree.
#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SpaceKey<const D: usize> {
    value: u64,
}

unsafe impl<const D: usize> Equivalence for SpaceKey<D> {
    type Out = UserDatatype;

    fn equivalent_datatype() -> Self::Out {
        UserDatatype::contiguous(1, &u64::equivalent_datatype())
    }
}

impl<const D: usize> SpaceKey<D> {
    /// Deepest level that fits into the key.
    pub const MAX_DEPTH: usize = (KEY_BITS - 1) / D;

    /// Number of children of a node.
    pub const NCHILDREN: usize = 1 << D;

    // Position of the sentinel bit of the root.
    const SENTINEL_SHIFT: usize = (KEY_BITS - 1) % D;

    // Mask for the bits of one level.
    const LEVEL_MASK: u64 = (1 << D) - 1;

    /// Create a key from its raw value.
    pub fn from_value(value: u64) -> Self {
        Self { value }
    }

    /// Raw integer value.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// The root key at depth 0.
    pub fn root() -> Self {
        Self {
            value: 1 << Self::SENTINEL_SHIFT,
        }
    }

    /// The null key. It is not a valid node.
    pub fn null() -> Self {
        Self { value: 0 }
    }

    /// True for the null key.
    pub fn is_null(&self) -> bool {
        self.value == 0
    }

    /// Smallest key on the deepest level.
    pub fn min() -> Self {
        Self {
            value: Self::root().value << (Self::MAX_DEPTH * D),
        }
    }

    /// Largest key on the deepest level.
    pub fn max() -> Self {
        Self {
            value: Self::min().value | ((1 << (Self::MAX_DEPTH * D)) - 1),
        }
    }

    /// Encode `point` inside `range` as the key of the depth `depth` node containing it.
    ///
    /// Points outside of `range` are clamped to the closest boundary cell.
    pub fn encode(range: &PhysicalBox<D>, point: &Point<D>, depth: usize) -> Self {
        assert!(
            depth <= Self::MAX_DEPTH,
            "depth {} exceeds maximum depth {}",
            depth,
            Self::MAX_DEPTH
        );

        let reference = range.physical_to_reference(*point);
        let grid_size = (1u64 << Self::MAX_DEPTH) as f64;
        let grid_max = (1u64 << Self::MAX_DEPTH) - 1;

        // Negative and NaN reference coordinates saturate to zero.
        let coords: [u64; D] =
            std::array::from_fn(|d| ((reference[d] * grid_size) as u64).min(grid_max));

        let mut value = Self::root().value;
        for level in 0..depth {
            let bit = Self::MAX_DEPTH - 1 - level;
            let mut bits = 0;
            for (d, coord) in coords.iter().enumerate() {
                bits |= ((coord >> bit) & 1) << d;
            }
            value = (value << D) | bits;
        }

        Self { value }
    }

    /// Return the center of the cell described by the key.
    pub fn decode(&self, range: &PhysicalBox<D>) -> Point<D> {
        let depth = self.depth();
        let mut coords = [0u64; D];

        for level in 1..=depth {
            let bits = self.child_index_at(level) as u64;
            for (d, coord) in coords.iter_mut().enumerate() {
                *coord |= ((bits >> d) & 1) << (Self::MAX_DEPTH - level);
            }
        }

        let grid_size = (1u64 << Self::MAX_DEPTH) as f64;
        let half_cell = 0.5 / (1u64 << depth) as f64;

        range.reference_to_physical(std::array::from_fn(|d| {
            coords[d] as f64 / grid_size + half_cell
        }))
    }

    /// Depth of the key. The root has depth 0.
    pub fn depth(&self) -> usize {
        debug_assert!(!self.is_null(), "the null key has no depth");
        let highest_bit = KEY_BITS - 1 - self.value.leading_zeros() as usize;
        (highest_bit - Self::SENTINEL_SHIFT) / D
    }

    /// The parent key. The parent of the root is the null key.
    pub fn parent(&self) -> Self {
        Self {
            value: self.value >> D,
        }
    }

    /// Append the child bits `bits` to the key, moving one level down.
    pub fn push(&mut self, bits: usize) {
        assert!(bits < Self::NCHILDREN);
        assert!(self.depth() < Self::MAX_DEPTH);
        self.value = (self.value << D) | bits as u64;
    }

    /// Remove the deepest level from the key and return its child bits.
    pub fn pop(&mut self) -> usize {
        assert!(self.depth() > 0, "cannot pop the root key");
        let bits = self.last_bits();
        self.value >>= D;
        bits
    }

    /// Remove levels until the key has depth `to_depth`.
    ///
    /// Keys that are already at most `to_depth` deep are unchanged.
    pub fn truncate(&mut self, to_depth: usize) {
        let depth = self.depth();
        if depth <= to_depth {
            return;
        }
        self.value >>= (depth - to_depth) * D;
    }

    /// Return the ancestor at depth `to_depth`.
    pub fn truncated(&self, to_depth: usize) -> Self {
        let mut key = *self;
        key.truncate(to_depth);
        key
    }

    /// Return the child with child bits `bits`.
    pub fn child(&self, bits: usize) -> Self {
        let mut key = *self;
        key.push(bits);
        key
    }

    /// Return all children in child bit order.
    pub fn children(&self) -> Vec<Self> {
        (0..Self::NCHILDREN).map(|bits| self.child(bits)).collect()
    }

    /// Child bits of the deepest level.
    pub fn last_bits(&self) -> usize {
        (self.value & Self::LEVEL_MASK) as usize
    }

    /// Child bits at level `level` of the path, `1 <= level <= depth`.
    pub fn child_index_at(&self, level: usize) -> usize {
        let depth = self.depth();
        debug_assert!(level >= 1 && level <= depth);
        ((self.value >> ((depth - level) * D)) & Self::LEVEL_MASK) as usize
    }

    /// True if `self` is an ancestor of `other`. A key is its own ancestor.
    pub fn is_ancestor(&self, other: Self) -> bool {
        let depth = self.depth();
        depth <= other.depth() && other.truncated(depth) == *self
    }

    /// First deepest level descendant.
    pub fn first_descendant(&self) -> Self {
        Self {
            value: self.value << ((Self::MAX_DEPTH - self.depth()) * D),
        }
    }

    /// Last deepest level descendant.
    pub fn last_descendant(&self) -> Self {
        let shift = (Self::MAX_DEPTH - self.depth()) * D;
        Self {
            value: (self.value << shift) | ((1 << shift) - 1),
        }
    }
}

impl<const D: usize> Display for SpaceKey<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            return write!(f, "null");
        }
        write!(f, "1")?;
        for level in 1..=self.depth() {
            write!(f, "{:0width$b}", self.child_index_at(level), width = D)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use super::SpaceKey;
    use crate::{
        geometry::{distance, PhysicalBox},
        tools::seeded_rng,
    };

    #[test]
    fn test_depth_and_navigation() {
        let root = SpaceKey::<3>::root();
        assert_eq!(root.depth(), 0);
        assert_eq!(SpaceKey::<3>::MAX_DEPTH, 21);
        assert_eq!(SpaceKey::<2>::MAX_DEPTH, 31);
        assert_eq!(SpaceKey::<1>::MAX_DEPTH, 63);

        let mut key = root;
        key.push(5);
        key.push(2);
        assert_eq!(key.depth(), 2);
        assert_eq!(key.child_index_at(1), 5);
        assert_eq!(key.child_index_at(2), 2);
        assert_eq!(key.parent(), root.child(5));
        assert!(root.is_ancestor(key));
        assert!(key.parent().is_ancestor(key));
        assert!(!key.is_ancestor(key.parent()));

        assert_eq!(key.pop(), 2);
        assert_eq!(key, root.child(5));
        assert_eq!(key.to_string(), "1101");
    }

    #[test]
    #[should_panic]
    fn test_pop_root_panics() {
        let mut root = SpaceKey::<2>::root();
        root.pop();
    }

    #[test]
    fn test_min_max() {
        for key in [SpaceKey::<1>::min(), SpaceKey::<1>::max()] {
            assert_eq!(key.depth(), SpaceKey::<1>::MAX_DEPTH);
        }
        assert_eq!(SpaceKey::<2>::min().depth(), SpaceKey::<2>::MAX_DEPTH);
        assert_eq!(SpaceKey::<2>::max().depth(), SpaceKey::<2>::MAX_DEPTH);
        assert_eq!(SpaceKey::<3>::max().value(), u64::MAX);

        let root = SpaceKey::<3>::root();
        assert_eq!(root.first_descendant(), SpaceKey::<3>::min());
        assert_eq!(root.last_descendant(), SpaceKey::<3>::max());
        assert!(SpaceKey::<3>::min() < SpaceKey::<3>::max());
    }

    #[test]
    fn test_encode_shares_prefix_in_same_cell() {
        let range = PhysicalBox::new([-1.0, -1.0], [1.0, 1.0]);
        let depth = SpaceKey::<2>::MAX_DEPTH;

        // Points in the same quadrant agree on the first level.
        let p = SpaceKey::encode(&range, &[0.2, 0.7], depth);
        let q = SpaceKey::encode(&range, &[0.9, 0.1], depth);
        let r = SpaceKey::encode(&range, &[-0.5, 0.1], depth);

        assert_eq!(p.truncated(1), q.truncated(1));
        assert_ne!(p.truncated(1), r.truncated(1));
        assert_eq!(p.truncated(1), SpaceKey::encode(&range, &[0.5, 0.5], 1));
    }

    #[test]
    fn test_decode_within_one_cell() {
        let mut rng = seeded_rng(0);
        let range = PhysicalBox::new([-2.0, 0.0, 1.0], [2.0, 1.0, 3.0]);

        for depth in [0, 1, 4, 10, SpaceKey::<3>::MAX_DEPTH] {
            let cell_diagonal = distance(range.min(), range.max()) / (1u64 << depth) as f64;
            for _ in 0..100 {
                let unit: [f64; 3] = [rng.gen(), rng.gen(), rng.gen()];
                let point = range.reference_to_physical(unit);
                let key = SpaceKey::encode(&range, &point, depth);
                assert_eq!(key.depth(), depth);
                let decoded = key.decode(&range);
                assert!(distance(&point, &decoded) <= cell_diagonal);
            }
        }
    }

    #[test]
    fn test_encode_clamps_to_range() {
        let range = PhysicalBox::new([0.0], [1.0]);
        let depth = SpaceKey::<1>::MAX_DEPTH;
        assert_eq!(SpaceKey::encode(&range, &[1.0], depth), SpaceKey::<1>::max());
        assert_eq!(SpaceKey::encode(&range, &[-0.5], depth), SpaceKey::<1>::min());
    }

    #[test]
    fn test_spatial_order_1d() {
        let range = PhysicalBox::new([0.0], [1.0]);
        let depth = SpaceKey::<1>::MAX_DEPTH;
        let keys = (0..100)
            .map(|i| SpaceKey::encode(&range, &[i as f64 / 100.0], depth))
            .collect::<Vec<_>>();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }
}
