//! Tree nodes and the summaries exchanged between ranks.

use mpi::{datatype::UserDatatype, traits::Equivalence, Count};

use crate::{
    entity::EntityId,
    geometry::{PhysicalBox, Point},
    morton::SpaceKey,
};

/// Residency of a branch relative to the current rank.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BranchLocality {
    /// Contains at least one resident entity.
    Local,
    /// Contains no entity.
    Empty,
    /// Contains only remote data.
    NonLocal,
    /// Contains resident entities of which some were sent to other ranks.
    Shared,
}

impl BranchLocality {
    /// True if the branch contains resident entities.
    pub fn is_local(&self) -> bool {
        matches!(self, BranchLocality::Local | BranchLocality::Shared)
    }
}

/// A node of the tree.
#[derive(Clone, Debug)]
pub struct Branch<const D: usize> {
    pub(crate) key: SpaceKey<D>,
    pub(crate) bbox: PhysicalBox<D>,
    pub(crate) mass: f64,
    pub(crate) coordinates: Point<D>,
    pub(crate) radius: f64,
    pub(crate) sub_entities: usize,
    pub(crate) locality: BranchLocality,
    pub(crate) owner: usize,
    pub(crate) entities: Vec<EntityId>,
    pub(crate) bit_child: u32,
    pub(crate) is_leaf: bool,
    pub(crate) remote_summary: bool,
}

impl<const D: usize> Branch<D> {
    /// An empty leaf.
    pub fn new(key: SpaceKey<D>, owner: usize) -> Self {
        Self {
            key,
            bbox: PhysicalBox::empty(),
            mass: 0.0,
            coordinates: [0.0; D],
            radius: 0.0,
            sub_entities: 0,
            locality: BranchLocality::Empty,
            owner,
            entities: Vec::new(),
            bit_child: 0,
            is_leaf: true,
            remote_summary: false,
        }
    }

    /// Key of the branch.
    pub fn key(&self) -> SpaceKey<D> {
        self.key
    }

    /// Bounding box of the contained entities, expanded by their radii.
    pub fn bbox(&self) -> &PhysicalBox<D> {
        &self.bbox
    }

    /// Aggregate mass.
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Center of mass.
    pub fn coordinates(&self) -> &Point<D> {
        &self.coordinates
    }

    /// Radius of the sphere around the center of mass enclosing every
    /// contained entity together with its radius.
    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Number of entities in the subtree.
    pub fn sub_entities(&self) -> usize {
        self.sub_entities
    }

    /// Locality tag.
    pub fn locality(&self) -> BranchLocality {
        self.locality
    }

    /// Owning rank. Meaningful for non-local branches.
    pub fn owner(&self) -> usize {
        self.owner
    }

    /// Entities held directly by a leaf.
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Mask of the populated children.
    pub fn bit_child(&self) -> u32 {
        self.bit_child
    }

    /// True if the branch holds entities rather than children.
    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    /// True if the branch is a placeholder for a remote subtree.
    pub fn is_remote_summary(&self) -> bool {
        self.remote_summary
    }

    /// The aggregate data of the branch as sent to other ranks.
    pub fn summary(&self, owner: usize) -> BranchSummary<D> {
        BranchSummary {
            coordinates: self.coordinates,
            mass: self.mass,
            radius: self.radius,
            bmin: *self.bbox.min(),
            bmax: *self.bbox.max(),
            key: self.key,
            owner: owner as u64,
            sub_entities: self.sub_entities as u64,
        }
    }

    // Turn the leaf into a placeholder carrying `summary`.
    pub(crate) fn install_summary(&mut self, summary: &BranchSummary<D>) {
        debug_assert!(self.is_leaf && self.entities.is_empty());
        self.remote_summary = true;
        self.coordinates = summary.coordinates;
        self.mass = summary.mass;
        self.radius = summary.radius;
        self.bbox = summary.bbox();
        self.sub_entities = summary.sub_entities as usize;
        self.owner = summary.owner as usize;
        self.locality = BranchLocality::NonLocal;
        self.bit_child = 0;
    }
}

/// Aggregate data of a branch exchanged between ranks.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BranchSummary<const D: usize> {
    /// Center of mass.
    pub coordinates: Point<D>,
    /// Aggregate mass.
    pub mass: f64,
    /// Bounding radius around the center of mass.
    pub radius: f64,
    /// Lower corner of the bounding box.
    pub bmin: Point<D>,
    /// Upper corner of the bounding box.
    pub bmax: Point<D>,
    /// Key of the branch.
    pub key: SpaceKey<D>,
    /// Rank that owns the particles of the branch.
    pub owner: u64,
    /// Number of particles in the branch.
    pub sub_entities: u64,
}

unsafe impl<const D: usize> Equivalence for BranchSummary<D> {
    type Out = UserDatatype;

    fn equivalent_datatype() -> Self::Out {
        UserDatatype::contiguous(
            std::mem::size_of::<BranchSummary<D>>() as Count,
            &u8::equivalent_datatype(),
        )
    }
}

impl<const D: usize> BranchSummary<D> {
    /// Bounding box of the branch.
    pub fn bbox(&self) -> PhysicalBox<D> {
        PhysicalBox::new(self.bmin, self.bmax)
    }
}
