//! Export of the local particle data for checkpointing.
//!
//! A [Snapshot] is the contract with an external writer: an ordered list of
//! named per-particle arrays and a list of scalar attributes. The file
//! format is up to the writer.

use crate::{body::Body, domain::Domain, state::SimulationState};

const AXES: [&str; 3] = ["x", "y", "z"];

fn column<const D: usize, F: Fn(&Body<D>) -> f64>(bodies: &[Body<D>], f: F) -> Vec<f64> {
    bodies.iter().map(f).collect()
}

/// Value of a scalar attribute.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AttributeValue {
    /// Integer attribute.
    Int(i64),
    /// Floating point attribute.
    Float(f64),
}

/// Named arrays and attributes describing the particles of one rank.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    attributes: Vec<(String, AttributeValue)>,
    arrays: Vec<(String, Vec<f64>)>,
    ids: Vec<u64>,
}

impl Snapshot {
    /// Collect the local particles of `domain`.
    ///
    /// `total` is the global number of particles and `offset` the global
    /// index of the first local particle.
    pub fn from_domain<const D: usize>(
        domain: &Domain<D>,
        state: &SimulationState,
        total: usize,
        offset: usize,
    ) -> Self {
        let bodies = domain.bodies();

        let mut arrays = Vec::new();
        for (d, axis) in AXES.iter().take(D).enumerate() {
            arrays.push((axis.to_string(), column(bodies, |b| b.position[d])));
        }
        for (d, axis) in AXES.iter().take(D).enumerate() {
            arrays.push((format!("v{}", axis), column(bodies, |b| b.velocity[d])));
        }
        arrays.push(("h".to_string(), column(bodies, |b| b.h)));
        arrays.push(("rho".to_string(), column(bodies, |b| b.density)));
        arrays.push(("P".to_string(), column(bodies, |b| b.pressure)));
        arrays.push(("u".to_string(), column(bodies, |b| b.internal_energy)));
        arrays.push(("m".to_string(), column(bodies, |b| b.mass)));

        let attributes = vec![
            ("nparticles".to_string(), AttributeValue::Int(total as i64)),
            ("offset".to_string(), AttributeValue::Int(offset as i64)),
            ("timestep".to_string(), AttributeValue::Int(state.iteration as i64)),
            ("dimension".to_string(), AttributeValue::Int(D as i64)),
            ("time".to_string(), AttributeValue::Float(state.total_time)),
            ("dt".to_string(), AttributeValue::Float(state.dt)),
        ];

        Self {
            attributes,
            arrays,
            ids: bodies.iter().map(|b| b.id).collect(),
        }
    }

    /// Scalar attributes in a fixed order.
    pub fn attributes(&self) -> &[(String, AttributeValue)] {
        &self.attributes
    }

    /// Per-particle arrays in a fixed order.
    pub fn arrays(&self) -> &[(String, Vec<f64>)] {
        &self.arrays
    }

    /// Particle ids.
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    /// Attribute with the given name.
    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }

    /// Array with the given name.
    pub fn array(&self, name: &str) -> Option<&[f64]> {
        self.arrays
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, values)| values.as_slice())
    }
}

#[cfg(test)]
mod test {
    use super::{AttributeValue, Snapshot};
    use crate::{body::Body, domain::Domain, state::SimulationState};

    #[test]
    fn test_snapshot() {
        let mut first = Body::<2>::new(4, [0.1, 0.2], 1.0, 0.05);
        first.density = 3.0;
        let second = Body::new(9, [0.3, 0.4], 2.0, 0.05);
        let domain = Domain::new(vec![first, second]);

        let mut state = SimulationState::new(0.5);
        state.advance();

        let snapshot = Snapshot::from_domain(&domain, &state, 10, 3);

        let names = snapshot.arrays().iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["x", "y", "vx", "vy", "h", "rho", "P", "u", "m"]);
        assert_eq!(snapshot.array("y").unwrap(), &[0.2, 0.4]);
        assert_eq!(snapshot.array("rho").unwrap(), &[3.0, 0.0]);
        assert!(snapshot.array("z").is_none());
        assert_eq!(snapshot.ids(), &[4, 9]);

        assert_eq!(snapshot.attribute("nparticles"), Some(AttributeValue::Int(10)));
        assert_eq!(snapshot.attribute("timestep"), Some(AttributeValue::Int(1)));
        assert_eq!(snapshot.attribute("dimension"), Some(AttributeValue::Int(2)));
        assert_eq!(snapshot.attribute("time"), Some(AttributeValue::Float(0.5)));
    }
}
