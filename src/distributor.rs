//! Domain decomposition across ranks.
//!
//! The [Distributor] drives one repartition cycle:
//! 1. [Distributor::compute_range] finds the global bounding box of all particles.
//! 2. [Distributor::global_sort] orders the particles along the space filling
//!    curve and gives every rank a contiguous key interval.
//! 3. [Distributor::build_tree] builds the local tree.
//! 4. [Distributor::exchange_branches] completes the local tree with
//!    summaries of the subtrees of all other ranks.
//! 5. [Distributor::compute_ghosts] sends copies of the particles near rank
//!    boundaries to the ranks that need them.
//!
//! Between repartitions [Distributor::refresh_ghosts] resends the ghosts
//! with updated values to the same destinations.

use itertools::Itertools;
use rayon::prelude::*;

use crate::{
    body::Body,
    comm::Comm,
    config::SphConfig,
    domain::Domain,
    entity::{BodyRef, EntityHolder, EntityId},
    error::{Result, SphError},
    geometry::{PhysicalBox, Point},
    morton::SpaceKey,
    parsort::{self, SortKey},
    snapshot::Snapshot,
    state::SimulationState,
    tools::{global_inclusive_cumsum, global_size, hypercube_all_gather, send_to_ranks},
    tree::{
        traversal::{find_neighbors, for_each_local_with_neighbors},
        Tree,
    },
};

/// Distributes particles over the ranks of a communicator.
pub struct Distributor<'c, C: Comm, const D: usize> {
    comm: &'c C,
    config: SphConfig,
    range: PhysicalBox<D>,
    total: usize,
    local_counts: Vec<usize>,
    offset: usize,
    splitters: Vec<SortKey<D>>,
    ghost_destinations: Vec<Vec<usize>>,
    ghost_epoch: u64,
    ghost_tree: Option<Tree<D>>,
}

impl<'c, C: Comm, const D: usize> Distributor<'c, C, D> {
    /// Create a distributor. No communication happens here.
    pub fn new(comm: &'c C, config: SphConfig) -> Self {
        Self {
            comm,
            config,
            range: PhysicalBox::empty(),
            total: 0,
            local_counts: vec![0; comm.size()],
            offset: 0,
            splitters: Vec::new(),
            ghost_destinations: Vec::new(),
            ghost_epoch: 0,
            ghost_tree: None,
        }
    }

    /// The communicator.
    pub fn comm(&self) -> &C {
        self.comm
    }

    /// The configuration.
    pub fn config(&self) -> &SphConfig {
        &self.config
    }

    /// Global bounding box of the particles including their radii.
    pub fn global_range(&self) -> &PhysicalBox<D> {
        &self.range
    }

    /// Global number of particles at the last sort.
    pub fn total_count(&self) -> usize {
        self.total
    }

    /// Number of particles of this rank after the last sort.
    pub fn local_count(&self) -> usize {
        self.local_counts[self.comm.rank()]
    }

    /// Number of particles of every rank after the last sort.
    pub fn local_counts(&self) -> &[usize] {
        &self.local_counts
    }

    /// Global index of the first particle of this rank.
    pub fn global_offset(&self) -> usize {
        self.offset
    }

    /// The `P + 1` splitters of the last sort.
    pub fn splitters(&self) -> &[SortKey<D>] {
        &self.splitters
    }

    /// Key interval assigned to every rank by the last sort.
    pub fn key_ranges(&self) -> Vec<(SpaceKey<D>, SpaceKey<D>)> {
        self.splitters
            .iter()
            .tuple_windows()
            .map(|(first, last)| (first.key, last.key))
            .collect()
    }

    /// Tree over the ghosts received by the last ghost exchange.
    pub fn ghost_tree(&self) -> Option<&Tree<D>> {
        self.ghost_tree.as_ref()
    }

    /// Interaction radius of a body.
    pub fn support_radius(&self, body: &Body<D>) -> f64 {
        self.config.kernel_width * body.h
    }

    /// Compute the global bounding box of all particles, each extended by its radius.
    ///
    /// A rank without particles contributes nothing.
    pub fn compute_range(&mut self, bodies: &[Body<D>]) -> PhysicalBox<D> {
        let (lo, hi) = bodies
            .par_iter()
            .fold(
                || ([f64::MAX; D], [f64::MIN; D]),
                |(mut lo, mut hi), body| {
                    for d in 0..D {
                        lo[d] = lo[d].min(body.position[d] - body.radius());
                        hi[d] = hi[d].max(body.position[d] + body.radius());
                    }
                    (lo, hi)
                },
            )
            .reduce(
                || ([f64::MAX; D], [f64::MIN; D]),
                |(lo1, hi1), (lo2, hi2)| {
                    (
                        std::array::from_fn(|d| lo1[d].min(lo2[d])),
                        std::array::from_fn(|d| hi1[d].max(hi2[d])),
                    )
                },
            );

        let lo = self.comm.all_reduce(&lo, f64::min);
        let hi = self.comm.all_reduce(&hi, f64::max);

        self.range = PhysicalBox::new(std::array::from_fn(|d| lo[d]), std::array::from_fn(|d| hi[d]));

        if self.comm.rank() == 0 {
            tracing::debug!(range = %self.range, "computed global range");
        }

        self.range
    }

    /// Sort the particles of all ranks globally by `(key, id)`.
    ///
    /// The keys must be up to date with respect to the global range. The
    /// new particle array replaces the old one in `domain`, so every
    /// reference into the old array becomes stale.
    pub fn global_sort(&mut self, domain: &mut Domain<D>) {
        let bodies = domain.take();
        self.total = global_size(&bodies, self.comm);

        let (sorted, splitters) =
            parsort::global_sort(bodies, self.total, self.config.sample_bytes, self.comm);

        domain.replace(sorted);
        self.splitters = splitters;
        self.local_counts = self
            .comm
            .all_gather_varcount(&[domain.len() as u64])
            .into_iter()
            .map(|count| count as usize)
            .collect();
        let nlocal = domain.len() as u64;
        self.offset = (global_inclusive_cumsum(&[nlocal], self.comm)[0] - nlocal) as usize;

        if self.comm.rank() == 0 {
            tracing::info!(
                total = self.total,
                min = self.local_counts.iter().min(),
                max = self.local_counts.iter().max(),
                "redistributed particles"
            );
        }
    }

    /// Full repartition: global range, keys and global sort.
    ///
    /// Ghosts of the previous partition are dropped.
    pub fn repartition(&mut self, domain: &mut Domain<D>) {
        self.compute_range(domain.bodies());
        domain.update_keys(&self.range);
        self.global_sort(domain);

        self.ghost_destinations.clear();
        self.ghost_tree = None;
        domain.set_ghosts(Vec::new(), Vec::new());
    }

    /// Build the tree over the local particles.
    pub fn build_tree(&self, domain: &Domain<D>) -> Tree<D> {
        let rank = self.comm.rank();
        let mut tree = Tree::new(self.range, rank);
        for (index, body) in domain.bodies().iter().enumerate() {
            tree.insert(EntityHolder::local(
                body,
                index,
                domain.epoch(),
                rank,
                self.support_radius(body),
            ));
        }
        tree.update_all_com(0.0);
        tree
    }

    /// Share branch summaries with all ranks and insert the remote ones into `tree`.
    ///
    /// Returns the number of inserted summaries.
    pub fn exchange_branches(&self, tree: &mut Tree<D>, domain: &Domain<D>) -> usize {
        let rank = self.comm.rank();

        if tree.is_dirty() {
            tree.update_all_com(0.0);
        }

        let keys = domain.bodies().iter().map(|body| body.key);
        let cells = match keys.minmax().into_option() {
            Some(owned) => {
                tree.find_sub_cells(SpaceKey::root(), self.config.branch_criterion, owned)
            }
            None => Vec::new(),
        };

        let summaries = cells
            .iter()
            .filter_map(|&key| tree.branch(key))
            .map(|branch| branch.summary(rank))
            .collect_vec();

        let mut all = hypercube_all_gather(&summaries, self.comm);
        all.sort_by_key(|summary| (summary.key, summary.owner));

        let mut inserted = 0;
        for summary in all.iter().filter(|summary| summary.owner as usize != rank) {
            tree.insert_branch(summary);
            inserted += 1;
        }
        tree.update_all_com(0.0);

        if rank == 0 {
            tracing::info!(branches = all.len(), "exchanged branch summaries");
        }
        tracing::debug!(
            rank,
            local = summaries.len(),
            inserted,
            nonlocal = tree.num_nonlocal_branches(),
            "completed local tree"
        );

        inserted
    }

    /// Find the ghosts every local particle must be sent to and exchange them.
    ///
    /// A particle is sent to every rank owning remote data within its
    /// support. Sent particles are marked shared, all others exclusive.
    /// Requires a tree completed by [Distributor::exchange_branches].
    /// Returns the number of received ghosts.
    pub fn compute_ghosts(&mut self, tree: &mut Tree<D>, domain: &mut Domain<D>) -> Result<usize> {
        let width = self.config.kernel_width;
        let destinations = tree
            .local_entities()
            .par_iter()
            .map(|&id| -> Result<(EntityId, usize, Vec<usize>)> {
                let holder = tree.entity(id).ok_or_else(|| {
                    SphError::Precondition(format!("entity {} is not in the tree", id))
                })?;
                let BodyRef::Local { index, .. } = holder.body_ref() else {
                    return Err(SphError::Precondition(format!(
                        "local entity {} does not refer to a local particle",
                        id
                    )));
                };
                let body = holder.resolve(domain)?;
                let owners = tree.remote_owners_within(&body.position, width * body.h);
                Ok((id, index, owners))
            })
            .collect::<Result<Vec<_>>>();
        let destinations = self.agree(destinations)?;

        let mut per_body = vec![Vec::new(); domain.len()];
        for (id, index, owners) in destinations {
            if let Some(holder) = tree.entity_mut(id) {
                if owners.is_empty() {
                    holder.set_exclusive();
                } else {
                    holder.set_shared();
                }
            }
            per_body[index] = owners;
        }
        tree.update_all_com(0.0);

        self.ghost_destinations = per_body;
        self.ghost_epoch = domain.epoch();

        self.refresh_ghosts(domain)
    }

    /// Send the current values of the shared particles to the same ranks as before.
    ///
    /// Rebuilds the ghost buffer of `domain` and the ghost tree. Fails if
    /// the particle array has been replaced since the destinations were
    /// computed. Returns the number of received ghosts.
    pub fn refresh_ghosts(&mut self, domain: &mut Domain<D>) -> Result<usize> {
        let current = if self.ghost_epoch != domain.epoch()
            || self.ghost_destinations.len() != domain.len()
        {
            Err(SphError::StaleReference {
                index: self.ghost_destinations.len(),
                epoch: self.ghost_epoch,
                current: domain.epoch(),
            })
        } else {
            Ok(())
        };
        self.agree(current)?;

        let (ghosts, owners) = send_to_ranks(domain.bodies(), &self.ghost_destinations, self.comm);
        let nghosts = ghosts.len();
        domain.set_ghosts(ghosts, owners);

        let mut ghost_tree = Tree::new(self.range, self.comm.rank());
        for (index, (body, &owner)) in domain
            .ghosts()
            .iter()
            .zip(domain.ghost_owners())
            .enumerate()
        {
            ghost_tree.insert(EntityHolder::ghost(
                body,
                index,
                domain.ghost_epoch(),
                owner,
                self.support_radius(body),
            ));
        }
        ghost_tree.update_all_com(0.0);
        self.ghost_tree = Some(ghost_tree);

        let nsent = self.ghost_destinations.iter().map(|d| d.len()).sum::<usize>();
        tracing::debug!(
            rank = self.comm.rank(),
            sent = nsent,
            received = nghosts,
            "exchanged ghosts"
        );

        Ok(nghosts)
    }

    // Collective. Fails on every rank if `local` failed on any rank.
    fn agree<T>(&self, local: Result<T>) -> Result<T> {
        let ok = self.comm.all_reduce(&[local.is_ok() as u8], u8::min)[0] == 1;
        match local {
            Ok(_) if !ok => Err(SphError::Precondition(
                "ghost exchange failed on another rank".to_string(),
            )),
            other => other,
        }
    }

    /// Local particles and ghosts within `radius` of `point`.
    pub fn neighbors<'a>(
        &'a self,
        tree: &'a Tree<D>,
        point: &Point<D>,
        radius: f64,
    ) -> Vec<&'a EntityHolder<D>> {
        find_neighbors(tree, self.ghost_tree(), point, radius)
    }

    /// Apply `f` to every local particle and its neighbors within its support.
    pub fn for_each_with_neighbors<F>(&self, tree: &Tree<D>, domain: &mut Domain<D>, f: F) -> Result<()>
    where
        F: Fn(&mut Body<D>, &[&Body<D>]) + Sync,
    {
        let width = self.config.kernel_width;
        for_each_local_with_neighbors(tree, self.ghost_tree(), domain, move |body| width * body.h, f)
    }

    /// True if the particle counts of the ranks differ by more than the configured ratio.
    pub fn needs_resort(&self, domain: &Domain<D>) -> bool {
        let counts = self.comm.all_gather_varcount(&[domain.len() as u64]);
        let max = counts.iter().copied().max().unwrap_or(0);
        let min = counts.iter().copied().min().unwrap_or(0);

        if min == 0 {
            max > 0
        } else {
            max as f64 / min as f64 > self.config.resort_threshold
        }
    }

    /// Export the local particles.
    pub fn snapshot(&self, domain: &Domain<D>, state: &SimulationState) -> Snapshot {
        Snapshot::from_domain(domain, state, self.total, self.global_offset())
    }
}
