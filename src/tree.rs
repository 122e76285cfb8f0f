//! A `2^D`-ary tree over particles keyed by Morton keys.
//!
//! Branches live in a hash map indexed by their [SpaceKey]. Entities live in
//! an arena indexed by [EntityId]; leaves store the ids of the entities they
//! hold. Every internal branch has all of its `2^D` children, empty ones
//! included, so a descent by key always finds the leaf responsible for it.
//!
//! Aggregate fields (mass, center of mass, bounding box, radius, entity
//! counts) are only valid after [Tree::update_all_com]. Any modification
//! marks the tree as dirty until the next update.

mod branch;
pub mod traversal;

use std::collections::HashMap;

pub use branch::{Branch, BranchLocality, BranchSummary};

use crate::{
    constants::fan_out,
    entity::{EntityHolder, EntityId},
    geometry::{distance, PhysicalBox, Point},
    morton::SpaceKey,
};

/// A tree over the particles of one rank, completed with summaries of remote subtrees.
pub struct Tree<const D: usize> {
    range: PhysicalBox<D>,
    rank: usize,
    branches: HashMap<SpaceKey<D>, Branch<D>>,
    entities: Vec<Option<EntityHolder<D>>>,
    num_entities: usize,
    num_nonlocal_branches: usize,
    dirty: bool,
}

impl<const D: usize> Tree<D> {
    /// Create an empty tree over `range` on rank `rank`.
    pub fn new(range: PhysicalBox<D>, rank: usize) -> Self {
        let mut branches = HashMap::new();
        branches.insert(SpaceKey::root(), Branch::new(SpaceKey::root(), rank));

        Self {
            range,
            rank,
            branches,
            entities: Vec::new(),
            num_entities: 0,
            num_nonlocal_branches: 0,
            dirty: false,
        }
    }

    /// Physical range covered by the keys.
    pub fn range(&self) -> &PhysicalBox<D> {
        &self.range
    }

    /// Rank the tree lives on.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The root branch.
    pub fn root(&self) -> &Branch<D> {
        &self.branches[&SpaceKey::root()]
    }

    /// Branch with the given key.
    pub fn branch(&self, key: SpaceKey<D>) -> Option<&Branch<D>> {
        self.branches.get(&key)
    }

    /// Number of branches, leaves included.
    pub fn num_branches(&self) -> usize {
        self.branches.len()
    }

    /// Number of entities in the tree.
    pub fn num_entities(&self) -> usize {
        self.num_entities
    }

    /// Number of non-local branches found by the last aggregate update.
    pub fn num_nonlocal_branches(&self) -> usize {
        self.num_nonlocal_branches
    }

    /// True if the aggregate fields are out of date.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Entity with the given id.
    pub fn entity(&self, id: EntityId) -> Option<&EntityHolder<D>> {
        self.entities.get(id).and_then(|e| e.as_ref())
    }

    /// Mutable access to an entity. Position and key must not change.
    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut EntityHolder<D>> {
        self.entities.get_mut(id).and_then(|e| e.as_mut())
    }

    /// Iterate over all entities together with their ids.
    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &EntityHolder<D>)> {
        self.entities
            .iter()
            .enumerate()
            .filter_map(|(id, e)| e.as_ref().map(|holder| (id, holder)))
    }

    /// Ids of the resident entities.
    pub fn local_entities(&self) -> Vec<EntityId> {
        self.entities()
            .filter(|(_, holder)| holder.is_local())
            .map(|(id, _)| id)
            .collect()
    }

    /// Remove everything from the tree.
    pub fn clear(&mut self) {
        *self = Self::new(self.range, self.rank);
    }

    /// Insert an entity and return its id.
    ///
    /// The key of the holder must be a deepest level key. The leaf
    /// receiving the entity is refined once it holds more than `2^D`
    /// entities.
    pub fn insert(&mut self, holder: EntityHolder<D>) -> EntityId {
        let key = holder.key();
        debug_assert_eq!(key.depth(), SpaceKey::<D>::MAX_DEPTH);

        let id = self.entities.len();
        self.entities.push(Some(holder));
        self.num_entities += 1;
        self.dirty = true;

        let leaf = self.leaf_for(key);
        if self.branches[&leaf].remote_summary {
            self.demote_placeholder(leaf);
        }

        let nentities = {
            let branch = self.branch_mut(leaf);
            branch.entities.push(id);
            branch.entities.len()
        };

        if nentities > fan_out(D) && leaf.depth() < SpaceKey::<D>::MAX_DEPTH {
            self.refine(leaf);
        }

        id
    }

    /// Remove an entity. Subtrees that become empty are coarsened.
    pub fn remove(&mut self, id: EntityId) -> Option<EntityHolder<D>> {
        let holder = self.entities.get_mut(id)?.take()?;
        self.num_entities -= 1;
        self.dirty = true;

        let leaf = self.leaf_for(holder.key());
        let branch = self.branch_mut(leaf);
        if let Some(position) = branch.entities.iter().position(|&e| e == id) {
            branch.entities.remove(position);
        }

        self.coarsen(leaf);

        Some(holder)
    }

    /// Insert the summary of a remote branch.
    ///
    /// Local leaves on the path to the branch are refined. If the branch
    /// position is free, a non-local placeholder carrying the summary is
    /// installed there. If local entities already occupy it, the summary is
    /// added as a summary-only entity instead.
    pub fn insert_branch(&mut self, summary: &BranchSummary<D>) {
        let target = summary.key;
        let depth = target.depth();
        self.dirty = true;

        let mut node = SpaceKey::root();
        while node.depth() < depth {
            let branch = &self.branches[&node];
            if branch.is_leaf {
                if branch.remote_summary {
                    self.demote_placeholder(node);
                }
                self.refine(node);
            }
            node = node.child(target.child_index_at(node.depth() + 1));
        }

        let branch = &self.branches[&target];
        if branch.is_leaf && branch.entities.is_empty() && !branch.remote_summary {
            self.branch_mut(target).install_summary(summary);
        } else {
            let key = self.filing_key(summary, target);
            self.insert(EntityHolder::remote(summary, key));
        }
    }

    /// Ids of the entities with coordinates inside `query`. Remote summaries are skipped.
    pub fn find_in_box(&self, query: &PhysicalBox<D>) -> Vec<EntityId> {
        debug_assert!(!self.dirty, "aggregates are out of date");

        let mut result = Vec::new();
        let mut stack = vec![SpaceKey::root()];

        while let Some(key) = stack.pop() {
            let branch = &self.branches[&key];
            if branch.sub_entities == 0 || branch.remote_summary || !branch.bbox.intersects(query) {
                continue;
            }

            if branch.is_leaf {
                for &id in &branch.entities {
                    if let Some(holder) = self.entity(id) {
                        if !holder.is_remote() && query.contains(holder.coordinates()) {
                            result.push(id);
                        }
                    }
                }
            } else {
                stack.extend(key.children().into_iter().rev());
            }
        }

        result
    }

    /// Ranks owning remote data that may lie within `radius` of `point`.
    ///
    /// Placeholders are tested with their bounding box, summary entities
    /// with their bounding sphere. The result is sorted and free of duplicates.
    pub fn remote_owners_within(&self, point: &Point<D>, radius: f64) -> Vec<usize> {
        debug_assert!(!self.dirty, "aggregates are out of date");

        let mut owners = Vec::new();
        let mut stack = vec![SpaceKey::root()];

        while let Some(key) = stack.pop() {
            let branch = &self.branches[&key];
            if branch.sub_entities == 0 || branch.bbox.distance_to(point) > radius {
                continue;
            }

            if branch.remote_summary {
                owners.push(branch.owner);
            } else if branch.is_leaf {
                for &id in &branch.entities {
                    if let Some(holder) = self.entity(id) {
                        if holder.is_remote()
                            && distance(holder.coordinates(), point) <= radius + holder.radius()
                        {
                            owners.push(holder.owner());
                        }
                    }
                }
            } else {
                stack.extend(key.children());
            }
        }

        owners.sort_unstable();
        owners.dedup();
        owners
    }

    fn branch_mut(&mut self, key: SpaceKey<D>) -> &mut Branch<D> {
        self.branches
            .get_mut(&key)
            .unwrap_or_else(|| panic!("no branch with key {}", key))
    }

    fn holder(&self, id: EntityId) -> &EntityHolder<D> {
        self.entity(id)
            .unwrap_or_else(|| panic!("leaf refers to removed entity {}", id))
    }

    // Descend from the root to the leaf responsible for `key`.
    fn leaf_for(&self, key: SpaceKey<D>) -> SpaceKey<D> {
        let mut node = SpaceKey::root();
        loop {
            if self.branches[&node].is_leaf {
                return node;
            }
            node = node.child(key.child_index_at(node.depth() + 1));
        }
    }

    // Split a leaf into its children. Children that end up with too many
    // entities are split further.
    fn refine(&mut self, key: SpaceKey<D>) {
        let mut stack = vec![key];

        while let Some(node) = stack.pop() {
            let entities = {
                let branch = self.branch_mut(node);
                branch.is_leaf = false;
                std::mem::take(&mut branch.entities)
            };

            let level = node.depth() + 1;
            let mut children = node
                .children()
                .into_iter()
                .map(|child| Branch::new(child, self.rank))
                .collect::<Vec<_>>();

            for id in entities {
                let index = self.holder(id).key().child_index_at(level);
                children[index].entities.push(id);
            }

            for child in children {
                if child.entities.len() > fan_out(D) && level < SpaceKey::<D>::MAX_DEPTH {
                    stack.push(child.key);
                }
                self.branches.insert(child.key, child);
            }
        }
    }

    // Merge groups of empty sibling leaves into their parent, moving upwards.
    fn coarsen(&mut self, leaf: SpaceKey<D>) {
        let mut node = leaf;

        while node.depth() > 0 {
            let parent = node.parent();
            let siblings = parent.children();

            let removable = siblings.iter().all(|sibling| {
                self.branches.get(sibling).is_some_and(|branch| {
                    branch.is_leaf && branch.entities.is_empty() && !branch.remote_summary
                })
            });

            if !removable {
                break;
            }

            for sibling in siblings {
                self.branches.remove(&sibling);
            }
            self.branch_mut(parent).is_leaf = true;

            node = parent;
        }
    }

    // Turn a placeholder into an ordinary leaf holding its summary as an entity.
    fn demote_placeholder(&mut self, key: SpaceKey<D>) {
        let summary = {
            let branch = &self.branches[&key];
            branch.summary(branch.owner)
        };
        let filing_key = self.filing_key(&summary, key);

        let id = self.entities.len();
        self.entities.push(Some(EntityHolder::remote(&summary, filing_key)));
        self.num_entities += 1;

        let rank = self.rank;
        let branch = self.branch_mut(key);
        *branch = Branch::new(key, rank);
        branch.entities.push(id);
    }

    // Deepest level key under `node` at which a summary entity is filed.
    fn filing_key(&self, summary: &BranchSummary<D>, node: SpaceKey<D>) -> SpaceKey<D> {
        let key = SpaceKey::encode(&self.range, &summary.coordinates, SpaceKey::<D>::MAX_DEPTH);
        if node.is_ancestor(key) {
            key
        } else {
            node.first_descendant()
        }
    }
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::{BranchLocality, BranchSummary, Tree};
    use crate::{
        body::Body,
        constants::fan_out,
        entity::EntityHolder,
        geometry::PhysicalBox,
        morton::SpaceKey,
        tools::{generate_random_bodies, seeded_rng},
    };

    fn build_tree(bodies: &[Body<2>], range: PhysicalBox<2>) -> Tree<2> {
        let mut tree = Tree::new(range, 0);
        for (index, body) in bodies.iter().enumerate() {
            tree.insert(EntityHolder::local(body, index, 0, 0, body.h));
        }
        tree.update_all_com(0.0);
        tree
    }

    fn random_bodies(n: usize, seed: usize) -> (Vec<Body<2>>, PhysicalBox<2>) {
        let range = PhysicalBox::new([-1.0, -1.0], [1.0, 1.0]);
        let mut rng = seeded_rng(seed);
        let mut bodies = generate_random_bodies(n, &range, 0.01, 0, &mut rng);
        for body in bodies.iter_mut() {
            body.update_key(&range);
        }
        (bodies, range)
    }

    #[test]
    fn test_refine_keeps_leaves_small() {
        let (bodies, range) = random_bodies(500, 0);
        let tree = build_tree(&bodies, range);

        assert_eq!(tree.num_entities(), 500);
        assert_eq!(tree.root().sub_entities(), 500);

        let mut seen = Vec::new();
        for key in tree.branches.keys() {
            let branch = &tree.branches[key];
            if branch.is_leaf() {
                assert!(branch.entities().len() <= fan_out(2));
                for &id in branch.entities() {
                    assert!(key.is_ancestor(tree.entity(id).unwrap().key()));
                    seen.push(id);
                }
            } else {
                assert!(branch.entities().is_empty());
                for child in key.children() {
                    assert!(tree.branch(child).is_some());
                }
            }
        }

        seen.sort_unstable();
        assert_eq!(seen, (0..500).collect_vec());
    }

    #[test]
    fn test_remove_coarsens() {
        let (bodies, range) = random_bodies(100, 1);
        let mut tree = build_tree(&bodies, range);
        assert!(tree.num_branches() > 1);

        for id in 0..100 {
            assert!(tree.remove(id).is_some());
        }
        assert!(tree.remove(0).is_none());

        assert_eq!(tree.num_entities(), 0);
        assert_eq!(tree.num_branches(), 1);
        assert!(tree.root().is_leaf());

        tree.update_all_com(0.0);
        assert_eq!(tree.root().locality(), BranchLocality::Empty);
        assert_eq!(tree.root().mass(), 0.0);
    }

    #[test]
    fn test_find_in_box() {
        let (bodies, range) = random_bodies(300, 2);
        let tree = build_tree(&bodies, range);

        let query = PhysicalBox::new([-0.2, 0.1], [0.4, 0.5]);
        let mut found = tree.find_in_box(&query);
        found.sort_unstable();

        let expected = bodies
            .iter()
            .enumerate()
            .filter(|(_, body)| query.contains(&body.position))
            .map(|(index, _)| index)
            .collect_vec();

        assert_eq!(found, expected);
    }

    #[test]
    fn test_insert_branch_into_empty_region() {
        let range = PhysicalBox::new([0.0, 0.0], [1.0, 1.0]);
        let mut bodies = vec![
            Body::new(0, [0.1, 0.1], 1.0, 0.01),
            Body::new(1, [0.2, 0.1], 1.0, 0.01),
        ];
        for body in bodies.iter_mut() {
            body.update_key(&range);
        }
        let mut tree = build_tree(&bodies, range);

        // A remote subtree in the upper right quadrant.
        let key = SpaceKey::encode(&range, &[0.75, 0.75], 1);
        let summary = BranchSummary {
            coordinates: [0.75, 0.75],
            mass: 10.0,
            radius: 0.1,
            bmin: [0.6, 0.6],
            bmax: [0.9, 0.9],
            key,
            owner: 3,
            sub_entities: 20,
        };
        tree.insert_branch(&summary);
        assert!(tree.is_dirty());
        tree.update_all_com(0.0);

        let placeholder = tree.branch(key).unwrap();
        assert!(placeholder.is_remote_summary());
        assert_eq!(placeholder.locality(), BranchLocality::NonLocal);
        assert_eq!(placeholder.owner(), 3);

        let root = tree.root();
        assert_eq!(root.mass(), 12.0);
        assert_eq!(root.sub_entities(), 22);
        assert_eq!(root.locality(), BranchLocality::Local);
        assert_eq!(tree.num_nonlocal_branches(), 1);

        assert_eq!(tree.remote_owners_within(&[0.5, 0.5], 0.15), vec![3]);
        assert!(tree.remote_owners_within(&[0.1, 0.1], 0.2).is_empty());

        // Local queries never return remote data.
        assert_eq!(tree.find_in_radius(&[0.75, 0.75], 0.5).len(), 0);
    }

    #[test]
    fn test_insert_branch_onto_local_leaf() {
        let range = PhysicalBox::new([0.0, 0.0], [1.0, 1.0]);
        let mut body = Body::new(0, [0.3, 0.3], 1.0, 0.01);
        body.update_key(&range);
        let mut tree = build_tree(&[body], range);

        // A remote rank shares the deepest cell region of the root.
        let summary = BranchSummary {
            coordinates: [0.35, 0.3],
            mass: 2.0,
            radius: 0.05,
            bmin: [0.3, 0.25],
            bmax: [0.4, 0.35],
            key: SpaceKey::root(),
            owner: 1,
            sub_entities: 2,
        };
        tree.insert_branch(&summary);
        tree.update_all_com(0.0);

        assert_eq!(tree.num_entities(), 2);
        assert_eq!(tree.root().mass(), 3.0);
        assert_eq!(tree.root().sub_entities(), 3);
        assert_eq!(tree.remote_owners_within(&[0.3, 0.3], 0.01), vec![1]);
        assert_eq!(tree.find_in_radius(&[0.3, 0.3], 0.1), vec![0]);
    }
}
