//! Storage of the particles resident on a rank.

use rayon::prelude::*;

use crate::{
    body::Body,
    error::{Result, SphError},
    geometry::PhysicalBox,
};

/// The local particle array and the ghost buffer of a rank.
///
/// Each buffer carries an epoch that is bumped whenever the buffer is
/// replaced. Entity holders record the epoch they were created with, so a
/// reference into a discarded array is detected instead of silently
/// reading a different particle.
#[derive(Clone, Debug, Default)]
pub struct Domain<const D: usize> {
    bodies: Vec<Body<D>>,
    ghosts: Vec<Body<D>>,
    ghost_owners: Vec<usize>,
    epoch: u64,
    ghost_epoch: u64,
}

impl<const D: usize> Domain<D> {
    /// Create a domain owning `bodies`.
    pub fn new(bodies: Vec<Body<D>>) -> Self {
        Self {
            bodies,
            ghosts: Vec::new(),
            ghost_owners: Vec::new(),
            epoch: 0,
            ghost_epoch: 0,
        }
    }

    /// The local particles.
    pub fn bodies(&self) -> &[Body<D>] {
        &self.bodies
    }

    /// Local particles for writing together with the read-only ghosts.
    pub fn split_mut(&mut self) -> (&mut [Body<D>], &[Body<D>]) {
        (&mut self.bodies, &self.ghosts)
    }

    /// The ghost particles received from other ranks.
    pub fn ghosts(&self) -> &[Body<D>] {
        &self.ghosts
    }

    /// Owning rank of each ghost.
    pub fn ghost_owners(&self) -> &[usize] {
        &self.ghost_owners
    }

    /// Number of local particles.
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    /// True if there are no local particles.
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// Epoch of the local particle array.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Epoch of the ghost buffer.
    pub fn ghost_epoch(&self) -> u64 {
        self.ghost_epoch
    }

    /// Install a new local particle array and return the old one.
    ///
    /// All references into the old array become stale.
    pub fn replace(&mut self, bodies: Vec<Body<D>>) -> Vec<Body<D>> {
        self.epoch += 1;
        std::mem::replace(&mut self.bodies, bodies)
    }

    /// Hand out the local particles, leaving an empty array behind.
    pub fn take(&mut self) -> Vec<Body<D>> {
        self.replace(Vec::new())
    }

    /// Install a new ghost buffer.
    pub fn set_ghosts(&mut self, ghosts: Vec<Body<D>>, owners: Vec<usize>) {
        assert_eq!(ghosts.len(), owners.len());
        self.ghost_epoch += 1;
        self.ghosts = ghosts;
        self.ghost_owners = owners;
    }

    /// Recompute the keys of all local particles.
    pub fn update_keys(&mut self, range: &PhysicalBox<D>) {
        self.bodies
            .par_iter_mut()
            .for_each(|body| body.update_key(range));
    }

    /// Local particle at `index`, checked against `epoch`.
    pub fn body(&self, index: usize, epoch: u64) -> Result<&Body<D>> {
        Self::lookup(&self.bodies, index, epoch, self.epoch)
    }

    /// Ghost particle at `index`, checked against `epoch`.
    pub fn ghost(&self, index: usize, epoch: u64) -> Result<&Body<D>> {
        Self::lookup(&self.ghosts, index, epoch, self.ghost_epoch)
    }

    fn lookup(bodies: &[Body<D>], index: usize, epoch: u64, current: u64) -> Result<&Body<D>> {
        if epoch != current {
            return Err(SphError::StaleReference {
                index,
                epoch,
                current,
            });
        }
        bodies.get(index).ok_or_else(|| {
            SphError::Precondition(format!(
                "particle index {} out of bounds for {} particles",
                index,
                bodies.len()
            ))
        })
    }
}

#[cfg(test)]
mod test {
    use super::Domain;
    use crate::{body::Body, geometry::PhysicalBox, morton::SpaceKey};

    #[test]
    fn test_epochs() {
        let mut domain = Domain::<2>::new(vec![Body::new(0, [0.0, 0.0], 1.0, 0.1)]);
        assert_eq!(domain.epoch(), 0);
        assert!(domain.body(0, 0).is_ok());
        assert!(domain.body(1, 0).is_err());

        let old = domain.take();
        assert_eq!(old.len(), 1);
        assert!(domain.is_empty());
        assert_eq!(domain.epoch(), 1);
        assert!(domain.body(0, 0).is_err());

        domain.set_ghosts(old, vec![3]);
        assert_eq!(domain.ghost_epoch(), 1);
        assert_eq!(domain.ghost_owners(), &[3]);
        assert!(domain.ghost(0, 1).is_ok());
        assert!(domain.ghost(0, 0).is_err());
    }

    #[test]
    fn test_update_keys() {
        let range = PhysicalBox::new([0.0, 0.0], [1.0, 1.0]);
        let mut domain = Domain::new(vec![
            Body::<2>::new(0, [0.1, 0.1], 1.0, 0.1),
            Body::new(1, [0.9, 0.9], 1.0, 0.1),
        ]);
        domain.update_keys(&range);

        let keys = domain.bodies().iter().map(|b| b.key).collect::<Vec<_>>();
        assert!(keys.iter().all(|k| k.depth() == SpaceKey::<2>::MAX_DEPTH));
        assert!(keys[0] < keys[1]);
    }
}
