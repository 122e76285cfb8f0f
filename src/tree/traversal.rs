//! Aggregation and queries over a [Tree].

use rayon::prelude::*;

use crate::{
    body::Body,
    domain::Domain,
    entity::{BodyRef, EntityHolder, EntityId, Locality},
    error::{Result, SphError},
    geometry::{distance, PhysicalBox, Point},
    morton::SpaceKey,
    tree::{BranchLocality, Tree},
};

// Running sums for the aggregate of a branch.
struct Aggregate<const D: usize> {
    mass: f64,
    weighted: Point<D>,
    plain: Point<D>,
    nparts: usize,
    sub_entities: usize,
    bbox: PhysicalBox<D>,
    local: bool,
    shared: bool,
    remote_owner: Option<usize>,
}

impl<const D: usize> Aggregate<D> {
    fn new() -> Self {
        Self {
            mass: 0.0,
            weighted: [0.0; D],
            plain: [0.0; D],
            nparts: 0,
            sub_entities: 0,
            bbox: PhysicalBox::empty(),
            local: false,
            shared: false,
            remote_owner: None,
        }
    }

    fn add(&mut self, coordinates: &Point<D>, mass: f64) {
        self.mass += mass;
        self.nparts += 1;
        for d in 0..D {
            self.weighted[d] += mass * coordinates[d];
            self.plain[d] += coordinates[d];
        }
    }

    // Mass weighted centroid. Massless groups use the plain centroid.
    fn center(&self) -> Point<D> {
        if self.mass > 0.0 {
            std::array::from_fn(|d| self.weighted[d] / self.mass)
        } else if self.nparts > 0 {
            std::array::from_fn(|d| self.plain[d] / self.nparts as f64)
        } else {
            [0.0; D]
        }
    }

    fn locality(&self) -> BranchLocality {
        if self.shared {
            BranchLocality::Shared
        } else if self.local {
            BranchLocality::Local
        } else if self.sub_entities > 0 {
            BranchLocality::NonLocal
        } else {
            BranchLocality::Empty
        }
    }
}

impl<const D: usize> Tree<D> {
    /// Recompute the aggregates of the whole tree and count the non-local branches.
    ///
    /// `epsilon` enlarges the radius of every entity.
    pub fn update_all_com(&mut self, epsilon: f64) {
        self.update_com(SpaceKey::root(), epsilon, false);

        self.num_nonlocal_branches = self
            .branches
            .values()
            .filter(|branch| branch.locality == BranchLocality::NonLocal)
            .count();
        self.dirty = false;

        tracing::trace!(
            rank = self.rank,
            branches = self.branches.len(),
            nonlocal = self.num_nonlocal_branches,
            "updated tree aggregates"
        );
    }

    /// Recompute the aggregates of the subtree rooted at `key`, bottom up.
    ///
    /// A leaf aggregates its entities: mass weighted centroid, bounding box
    /// of the entities expanded by `epsilon` plus their radii, and the
    /// largest distance from the centroid to an entity plus `epsilon` and
    /// its radius. An internal branch aggregates its populated children
    /// using their boxes and radii directly. With `local_only` set,
    /// non-local entities and branches are left out of the sums.
    pub fn update_com(&mut self, key: SpaceKey<D>, epsilon: f64, local_only: bool) {
        let branch = &self.branches[&key];
        if branch.remote_summary {
            return;
        }

        if branch.is_leaf {
            self.aggregate_leaf(key, epsilon, local_only);
        } else {
            for child in key.children() {
                self.update_com(child, epsilon, local_only);
            }
            self.aggregate_children(key, local_only);
        }
    }

    fn aggregate_leaf(&mut self, key: SpaceKey<D>, epsilon: f64, local_only: bool) {
        let branch = &self.branches[&key];
        let holders = branch
            .entities
            .iter()
            .filter_map(|&id| self.entity(id))
            .filter(|holder| !local_only || holder.is_local())
            .collect::<Vec<_>>();

        let mut aggregate = Aggregate::new();
        for holder in holders.iter() {
            aggregate.add(holder.coordinates(), holder.mass());
            aggregate.sub_entities += holder.count();
            aggregate
                .bbox
                .grow(holder.coordinates(), epsilon + holder.radius());
            match holder.locality() {
                Locality::Shared => aggregate.shared = true,
                Locality::Local | Locality::Exclusive => aggregate.local = true,
                Locality::NonLocal => {
                    aggregate.remote_owner.get_or_insert(holder.owner());
                }
            }
        }

        let center = aggregate.center();
        let radius = holders
            .iter()
            .map(|holder| distance(holder.coordinates(), &center) + epsilon + holder.radius())
            .fold(0.0, f64::max);

        let owner = if aggregate.local || aggregate.shared {
            self.rank
        } else {
            aggregate.remote_owner.unwrap_or(self.rank)
        };

        let branch = self.branch_mut(key);
        branch.mass = aggregate.mass;
        branch.coordinates = center;
        branch.radius = radius;
        branch.bbox = aggregate.bbox;
        branch.sub_entities = aggregate.sub_entities;
        branch.locality = aggregate.locality();
        branch.owner = owner;
        branch.bit_child = 0;
    }

    fn aggregate_children(&mut self, key: SpaceKey<D>, local_only: bool) {
        let mut aggregate = Aggregate::new();
        let mut bit_child = 0;
        let children = key
            .children()
            .into_iter()
            .enumerate()
            .map(|(index, child)| (index, &self.branches[&child]))
            .filter(|(_, child)| child.sub_entities > 0)
            .filter(|(_, child)| !local_only || child.locality.is_local())
            .collect::<Vec<_>>();

        for (index, child) in children.iter() {
            bit_child |= 1 << index;
            aggregate.add(&child.coordinates, child.mass);
            aggregate.sub_entities += child.sub_entities;
            aggregate.bbox.merge(&child.bbox);
            match child.locality {
                BranchLocality::Shared => aggregate.shared = true,
                BranchLocality::Local => aggregate.local = true,
                BranchLocality::NonLocal => {
                    aggregate.remote_owner.get_or_insert(child.owner);
                }
                BranchLocality::Empty => (),
            }
        }

        let center = aggregate.center();
        let radius = children
            .iter()
            .map(|(_, child)| distance(&child.coordinates, &center) + child.radius)
            .fold(0.0, f64::max);

        let owner = if aggregate.local || aggregate.shared {
            self.rank
        } else {
            aggregate.remote_owner.unwrap_or(self.rank)
        };

        let branch = self.branch_mut(key);
        branch.mass = aggregate.mass;
        branch.coordinates = center;
        branch.radius = radius;
        branch.bbox = aggregate.bbox;
        branch.sub_entities = aggregate.sub_entities;
        branch.locality = aggregate.locality();
        branch.owner = owner;
        branch.bit_child = bit_child;
    }

    /// Ids of the entities within distance `radius` of `point`.
    ///
    /// Children are visited in child index order and leaf entities in
    /// insertion order, so the result order is deterministic. Remote
    /// summaries carry no particle data and are skipped.
    pub fn find_in_radius(&self, point: &Point<D>, radius: f64) -> Vec<EntityId> {
        debug_assert!(!self.dirty, "aggregates are out of date");

        let mut result = Vec::new();
        let mut stack = vec![SpaceKey::root()];

        while let Some(key) = stack.pop() {
            let branch = &self.branches[&key];
            if branch.sub_entities == 0
                || branch.remote_summary
                || branch.bbox.distance_to(point) > radius
            {
                continue;
            }

            if branch.is_leaf {
                for &id in &branch.entities {
                    if let Some(holder) = self.entity(id) {
                        if !holder.is_remote() && distance(holder.coordinates(), point) <= radius {
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

    /// Branches to share with other ranks.
    ///
    /// Returns the shallowest branches below `root` that hold resident
    /// entities, contain at least `min_subentities` entities and whose
    /// deepest level key interval lies within `owned`. Leaves straddling the
    /// interval are returned as well if they are large enough. Placeholders
    /// and empty branches are never returned.
    pub fn find_sub_cells(
        &self,
        root: SpaceKey<D>,
        min_subentities: usize,
        owned: (SpaceKey<D>, SpaceKey<D>),
    ) -> Vec<SpaceKey<D>> {
        debug_assert!(!self.dirty, "aggregates are out of date");

        let (first, last) = owned;
        let mut cells = Vec::new();
        let mut stack = vec![root];

        while let Some(key) = stack.pop() {
            let Some(branch) = self.branches.get(&key) else {
                continue;
            };
            if branch.remote_summary || branch.sub_entities == 0 || !branch.locality.is_local() {
                continue;
            }

            let inside = first <= key.first_descendant() && key.last_descendant() <= last;

            if inside || branch.is_leaf {
                if branch.sub_entities >= min_subentities {
                    cells.push(key);
                }
            } else {
                stack.extend(key.children().into_iter().rev());
            }
        }

        cells
    }
}

/// Entities within `radius` of `point` in the local tree followed by those in the ghost tree.
pub fn find_neighbors<'a, const D: usize>(
    tree: &'a Tree<D>,
    ghost_tree: Option<&'a Tree<D>>,
    point: &Point<D>,
    radius: f64,
) -> Vec<&'a EntityHolder<D>> {
    let mut neighbors = tree
        .find_in_radius(point, radius)
        .into_iter()
        .filter_map(|id| tree.entity(id))
        .collect::<Vec<_>>();

    if let Some(ghost_tree) = ghost_tree {
        neighbors.extend(
            ghost_tree
                .find_in_radius(point, radius)
                .into_iter()
                .filter_map(|id| ghost_tree.entity(id)),
        );
    }

    neighbors
}

/// Apply `f` to every local body together with its neighbors.
///
/// The neighbors of a body are the local bodies and ghosts within
/// `radius(body)` of it, the body itself included. Neighbor lists are
/// computed from a copy of the bodies taken before any update, so `f`
/// sees the same neighbor data regardless of the order in which bodies
/// are processed. Bodies are processed in parallel and `f` may only write
/// to the body it is given.
pub fn for_each_local_with_neighbors<const D: usize, R, F>(
    tree: &Tree<D>,
    ghost_tree: Option<&Tree<D>>,
    domain: &mut Domain<D>,
    radius: R,
    f: F,
) -> Result<()>
where
    R: Fn(&Body<D>) -> f64 + Sync,
    F: Fn(&mut Body<D>, &[&Body<D>]) + Sync,
{
    let epoch = domain.epoch();
    let ghost_epoch = domain.ghost_epoch();
    let (bodies, ghosts) = domain.split_mut();
    let snapshot = bodies.to_vec();

    let neighbors = snapshot
        .par_iter()
        .map(|body| {
            find_neighbors(tree, ghost_tree, &body.position, radius(body))
                .into_iter()
                .map(|holder| resolve_in(holder, &snapshot, epoch, ghosts, ghost_epoch))
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;

    bodies
        .par_iter_mut()
        .zip(neighbors.par_iter())
        .for_each(|(body, list)| f(body, list));

    Ok(())
}

// Resolve a holder against a copy of the local bodies and the ghost buffer.
fn resolve_in<'a, const D: usize>(
    holder: &EntityHolder<D>,
    bodies: &'a [Body<D>],
    epoch: u64,
    ghosts: &'a [Body<D>],
    ghost_epoch: u64,
) -> Result<&'a Body<D>> {
    let (buffer, index, taken, current) = match holder.body_ref() {
        BodyRef::Local {
            index,
            epoch: taken,
        } => (bodies, index, taken, epoch),
        BodyRef::Ghost {
            index,
            epoch: taken,
        } => (ghosts, index, taken, ghost_epoch),
        BodyRef::Remote => {
            return Err(SphError::Precondition(
                "remote summary returned by a neighbor query".to_string(),
            ))
        }
    };

    if taken != current {
        return Err(SphError::StaleReference {
            index,
            epoch: taken,
            current,
        });
    }

    buffer
        .get(index)
        .ok_or_else(|| SphError::Precondition(format!("particle index {} out of bounds", index)))
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;
    use itertools::Itertools;

    use super::for_each_local_with_neighbors;
    use crate::{
        body::Body,
        domain::Domain,
        entity::EntityHolder,
        geometry::{distance, PhysicalBox},
        morton::SpaceKey,
        tools::{generate_random_bodies, seeded_rng},
        tree::{BranchLocality, Tree},
    };

    fn setup(n: usize, seed: usize) -> (Domain<2>, Tree<2>) {
        let range = PhysicalBox::new([-1.0, -1.0], [1.0, 1.0]);
        let mut rng = seeded_rng(seed);
        let mut domain = Domain::new(generate_random_bodies(n, &range, 0.02, 0, &mut rng));
        domain.update_keys(&range);

        let mut tree = Tree::new(range, 0);
        for (index, body) in domain.bodies().iter().enumerate() {
            tree.insert(EntityHolder::local(body, index, domain.epoch(), 0, body.h));
        }
        tree.update_all_com(0.0);
        (domain, tree)
    }

    #[test]
    fn test_find_in_radius_matches_brute_force() {
        let (domain, tree) = setup(100, 0);
        let bodies = domain.bodies();

        for body in bodies {
            let mut found = tree.find_in_radius(&body.position, 0.1);
            found.sort_unstable();

            let expected = bodies
                .iter()
                .enumerate()
                .filter(|(_, other)| distance(&other.position, &body.position) <= 0.1)
                .map(|(index, _)| index)
                .collect_vec();

            assert_eq!(found, expected);
        }
    }

    #[test]
    fn test_aggregates() {
        let (domain, tree) = setup(200, 1);
        let bodies = domain.bodies();
        let root = tree.root();

        let total_mass = bodies.iter().map(|b| b.mass).sum::<f64>();
        assert_relative_eq!(root.mass(), total_mass, epsilon = 1E-12);
        assert_eq!(root.sub_entities(), 200);
        assert_eq!(root.locality(), BranchLocality::Local);

        for d in 0..2 {
            let com = bodies.iter().map(|b| b.mass * b.position[d]).sum::<f64>() / total_mass;
            assert_relative_eq!(root.coordinates()[d], com, epsilon = 1E-12);
        }

        for body in bodies {
            assert!(root.bbox().contains(&body.position));
            assert!(distance(root.coordinates(), &body.position) + body.h <= root.radius() + 1E-12);
        }

        // Every internal branch carries the sum of its children.
        for key in tree.branches.keys() {
            let branch = tree.branch(*key).unwrap();
            if branch.is_leaf() {
                continue;
            }
            let children = key.children();
            let mass = children
                .iter()
                .map(|child| tree.branch(*child).unwrap().mass())
                .sum::<f64>();
            let count = children
                .iter()
                .map(|child| tree.branch(*child).unwrap().sub_entities())
                .sum::<usize>();
            assert_relative_eq!(branch.mass(), mass, epsilon = 1E-12);
            assert_eq!(branch.sub_entities(), count);
            for (index, child) in children.iter().enumerate() {
                let populated = tree.branch(*child).unwrap().sub_entities() > 0;
                assert_eq!(branch.bit_child() & (1 << index) != 0, populated);
            }
        }
    }

    #[test]
    fn test_update_is_idempotent() {
        let (_domain, mut tree) = setup(150, 2);
        let before = tree.root().clone();
        tree.update_all_com(0.0);
        let after = tree.root();

        assert_eq!(before.mass(), after.mass());
        assert_eq!(before.coordinates(), after.coordinates());
        assert_eq!(before.radius(), after.radius());
        assert_eq!(before.bbox(), after.bbox());
    }

    #[test]
    fn test_find_sub_cells_cover_local_entities() {
        let (domain, tree) = setup(300, 3);
        let keys = domain.bodies().iter().map(|b| b.key).collect_vec();
        let first = *keys.iter().min().unwrap();
        let last = *keys.iter().max().unwrap();

        // On a single rank the whole tree is owned.
        let cells = tree.find_sub_cells(SpaceKey::root(), 1, (SpaceKey::min(), SpaceKey::max()));
        assert_eq!(cells, vec![SpaceKey::root()]);

        // With a narrower interval every body is covered by exactly one cell.
        let cells = tree.find_sub_cells(SpaceKey::root(), 1, (first, last));
        let total = cells
            .iter()
            .map(|key| tree.branch(*key).unwrap().sub_entities())
            .sum::<usize>();
        assert_eq!(total, 300);
        for key in keys {
            assert_eq!(cells.iter().filter(|cell| cell.is_ancestor(key)).count(), 1);
        }
    }

    #[test]
    fn test_for_each_local_with_neighbors() {
        let (mut domain, tree) = setup(100, 4);
        let expected = domain
            .bodies()
            .iter()
            .map(|body| {
                domain
                    .bodies()
                    .iter()
                    .filter(|other| distance(&other.position, &body.position) <= 0.2)
                    .count()
            })
            .collect_vec();

        for_each_local_with_neighbors(
            &tree,
            None,
            &mut domain,
            |_| 0.2,
            |body: &mut Body<2>, neighbors: &[&Body<2>]| {
                body.density = neighbors.len() as f64;
            },
        )
        .unwrap();

        for (body, count) in domain.bodies().iter().zip(expected) {
            assert_eq!(body.density, count as f64);
        }

        // A replaced particle array invalidates the tree.
        let bodies = domain.take();
        domain.replace(bodies);
        assert!(
            for_each_local_with_neighbors(&tree, None, &mut domain, |_| 0.2, |_, _| ()).is_err()
        );
    }
}
