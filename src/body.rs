//! Particle records.

use mpi::{datatype::UserDatatype, traits::Equivalence, Count};

use crate::{
    geometry::{PhysicalBox, Point},
    morton::SpaceKey,
    parsort::SortKey,
};

/// Kind of a particle.
#[repr(u64)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ParticleType {
    /// Regular fluid particle.
    #[default]
    Normal,
    /// Boundary particle that is not integrated.
    Wall,
}

/// A full SPH particle record.
///
/// Every field is eight bytes wide so the struct has no padding and is
/// moved between ranks as plain bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Body<const D: usize> {
    /// Position.
    pub position: Point<D>,
    /// Velocity.
    pub velocity: Point<D>,
    /// Velocity at the half step of a leapfrog integrator.
    pub velocity_half: Point<D>,
    /// Acceleration.
    pub acceleration: Point<D>,
    /// Mass.
    pub mass: f64,
    /// Smoothing length.
    pub h: f64,
    /// Density.
    pub density: f64,
    /// Pressure.
    pub pressure: f64,
    /// Specific internal energy.
    pub internal_energy: f64,
    /// Specific total energy.
    pub total_energy: f64,
    /// Sound speed.
    pub sound_speed: f64,
    /// Individual timestep.
    pub dt: f64,
    /// Time derivative of the internal energy.
    pub dudt: f64,
    /// Particle kind.
    pub kind: ParticleType,
    /// Space filling curve key of the position.
    pub key: SpaceKey<D>,
    /// Globally unique identifier. Never changes.
    pub id: u64,
}

unsafe impl<const D: usize> Equivalence for Body<D> {
    type Out = UserDatatype;

    fn equivalent_datatype() -> Self::Out {
        UserDatatype::contiguous(
            std::mem::size_of::<Body<D>>() as Count,
            &u8::equivalent_datatype(),
        )
    }
}

impl<const D: usize> Body<D> {
    /// A body at rest with the given id, position, mass and smoothing length.
    pub fn new(id: u64, position: Point<D>, mass: f64, h: f64) -> Self {
        Self {
            position,
            velocity: [0.0; D],
            velocity_half: [0.0; D],
            acceleration: [0.0; D],
            mass,
            h,
            density: 0.0,
            pressure: 0.0,
            internal_energy: 0.0,
            total_energy: 0.0,
            sound_speed: 0.0,
            dt: 0.0,
            dudt: 0.0,
            kind: ParticleType::Normal,
            key: SpaceKey::null(),
            id,
        }
    }

    /// Radius of the particle. This is the smoothing length.
    pub fn radius(&self) -> f64 {
        self.h
    }

    /// Recompute the key from the position at the deepest level.
    pub fn update_key(&mut self, range: &PhysicalBox<D>) {
        self.key = SpaceKey::encode(range, &self.position, SpaceKey::<D>::MAX_DEPTH);
    }

    /// The key used for the global ordering. Ties in the space key are broken by id.
    pub fn sort_key(&self) -> SortKey<D> {
        SortKey::new(self.key, self.id)
    }
}
