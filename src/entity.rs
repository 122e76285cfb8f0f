//! Lightweight handles stored in the leaves of a tree.

use crate::{
    body::Body,
    domain::Domain,
    error::{Result, SphError},
    geometry::Point,
    morton::SpaceKey,
    tree::BranchSummary,
};

/// Index of an entity in the arena of a tree.
pub type EntityId = usize;

/// Where the particle data behind a holder lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BodyRef {
    /// Index into the local particle array of a [Domain].
    Local {
        /// Position in the array.
        index: usize,
        /// Epoch of the array when the reference was taken.
        epoch: u64,
    },
    /// Index into the ghost buffer of a [Domain].
    Ghost {
        /// Position in the buffer.
        index: usize,
        /// Ghost epoch when the reference was taken.
        epoch: u64,
    },
    /// No particle data. Only the cached summary is meaningful.
    Remote,
}

/// Residency of an entity relative to the current rank.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Locality {
    /// Resident. Not yet classified as shared or exclusive.
    Local,
    /// Resident and sent to at least one other rank as a ghost.
    Shared,
    /// Not resident on this rank.
    NonLocal,
    /// Resident and needed by no other rank.
    Exclusive,
}

/// A handle to a particle together with the fields the tree needs.
///
/// Holders with a resident locality refer into the local particle array.
/// Non-local holders either refer into the read-only ghost buffer or carry
/// a remote aggregate without any particle data.
#[derive(Clone, Debug)]
pub struct EntityHolder<const D: usize> {
    body: BodyRef,
    coordinates: Point<D>,
    mass: f64,
    radius: f64,
    key: SpaceKey<D>,
    owner: usize,
    locality: Locality,
    id: u64,
    count: usize,
}

impl<const D: usize> EntityHolder<D> {
    /// Holder for the body at `index` of the local particle array.
    pub fn local(body: &Body<D>, index: usize, epoch: u64, rank: usize, radius: f64) -> Self {
        Self {
            body: BodyRef::Local { index, epoch },
            coordinates: body.position,
            mass: body.mass,
            radius,
            key: body.key,
            owner: rank,
            locality: Locality::Local,
            id: body.id,
            count: 1,
        }
    }

    /// Holder for the body at `index` of the ghost buffer.
    pub fn ghost(body: &Body<D>, index: usize, epoch: u64, owner: usize, radius: f64) -> Self {
        Self {
            body: BodyRef::Ghost { index, epoch },
            coordinates: body.position,
            mass: body.mass,
            radius,
            key: body.key,
            owner,
            locality: Locality::NonLocal,
            id: body.id,
            count: 1,
        }
    }

    /// Summary-only holder for a remote branch.
    ///
    /// `key` is the deepest level key under which the holder is filed.
    pub fn remote(summary: &BranchSummary<D>, key: SpaceKey<D>) -> Self {
        Self {
            body: BodyRef::Remote,
            coordinates: summary.coordinates,
            mass: summary.mass,
            radius: summary.radius,
            key,
            owner: summary.owner as usize,
            locality: Locality::NonLocal,
            id: u64::MAX,
            count: summary.sub_entities as usize,
        }
    }

    /// Reference to the particle data.
    pub fn body_ref(&self) -> BodyRef {
        self.body
    }

    /// Cached position.
    pub fn coordinates(&self) -> &Point<D> {
        &self.coordinates
    }

    /// Cached mass.
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Interaction radius.
    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Key under which the holder is filed.
    pub fn key(&self) -> SpaceKey<D> {
        self.key
    }

    /// Owning rank.
    pub fn owner(&self) -> usize {
        self.owner
    }

    /// Locality tag.
    pub fn locality(&self) -> Locality {
        self.locality
    }

    /// Global id of the particle. `u64::MAX` for remote summaries.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of particles represented by the holder.
    pub fn count(&self) -> usize {
        self.count
    }

    /// True if the particle is resident on this rank.
    pub fn is_local(&self) -> bool {
        matches!(
            self.locality,
            Locality::Local | Locality::Shared | Locality::Exclusive
        )
    }

    /// True if the holder carries a remote aggregate only.
    pub fn is_remote(&self) -> bool {
        self.body == BodyRef::Remote
    }

    /// Mark a resident particle as sent to another rank.
    pub fn set_shared(&mut self) {
        debug_assert!(self.is_local());
        self.locality = Locality::Shared;
    }

    /// Mark a resident particle as needed by no other rank.
    pub fn set_exclusive(&mut self) {
        debug_assert!(self.is_local());
        self.locality = Locality::Exclusive;
    }

    /// Look up the particle in `domain`.
    ///
    /// Fails if the particle array (or ghost buffer) has been replaced since
    /// the holder was created, or if the holder has no particle data.
    pub fn resolve<'a>(&self, domain: &'a Domain<D>) -> Result<&'a Body<D>> {
        match self.body {
            BodyRef::Local { index, epoch } => domain.body(index, epoch),
            BodyRef::Ghost { index, epoch } => domain.ghost(index, epoch),
            BodyRef::Remote => Err(SphError::Precondition(format!(
                "entity owned by rank {} has no particle data on this rank",
                self.owner
            ))),
        }
    }
}
