//! Geometry information

use serde::Deserialize;

use crate::error::{Result, SphError};

/// A point in `D` dimensional space.
pub type Point<const D: usize> = [f64; D];

/// Euclidean distance between two points.
pub fn distance<const D: usize>(p: &Point<D>, q: &Point<D>) -> f64 {
    p.iter()
        .zip(q.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        .sqrt()
}

/// Euclidean norm of a vector.
pub fn norm<const D: usize>(v: &Point<D>) -> f64 {
    v.iter().map(|a| a * a).sum::<f64>().sqrt()
}

/// An axis aligned box. Describes the geometry in which a tree lives.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PhysicalBox<const D: usize> {
    min: Point<D>,
    max: Point<D>,
}

impl<const D: usize> PhysicalBox<D> {
    /// Create a new bounding box from its lower and upper corner.
    pub fn new(min: Point<D>, max: Point<D>) -> Self {
        Self { min, max }
    }

    /// An empty box. Growing it with any point yields a box around that point.
    pub fn empty() -> Self {
        Self {
            min: [f64::MAX; D],
            max: [f64::MIN; D],
        }
    }

    /// Give a slice of points. Compute an associated bounding box.
    pub fn from_points(points: &[Point<D>]) -> Self {
        let mut bbox = Self::empty();
        for point in points {
            bbox.grow(point, 0.0);
        }
        bbox
    }

    /// Lower corner.
    pub fn min(&self) -> &Point<D> {
        &self.min
    }

    /// Upper corner.
    pub fn max(&self) -> &Point<D> {
        &self.max
    }

    /// True if no point has been added to the box.
    pub fn is_empty(&self) -> bool {
        (0..D).any(|d| self.min[d] > self.max[d])
    }

    /// Extend the box so that it contains the ball of radius `radius` around `point`.
    pub fn grow(&mut self, point: &Point<D>, radius: f64) {
        for d in 0..D {
            self.min[d] = f64::min(self.min[d], point[d] - radius);
            self.max[d] = f64::max(self.max[d], point[d] + radius);
        }
    }

    /// Extend the box so that it contains `other`.
    pub fn merge(&mut self, other: &Self) {
        for d in 0..D {
            self.min[d] = f64::min(self.min[d], other.min[d]);
            self.max[d] = f64::max(self.max[d], other.max[d]);
        }
    }

    /// True if `point` lies in the closed box.
    pub fn contains(&self, point: &Point<D>) -> bool {
        (0..D).all(|d| self.min[d] <= point[d] && point[d] <= self.max[d])
    }

    /// Distance from `point` to the closest point of the box. Zero inside the box.
    pub fn distance_to(&self, point: &Point<D>) -> f64 {
        let mut dist2 = 0.0;
        for d in 0..D {
            let delta = if point[d] < self.min[d] {
                self.min[d] - point[d]
            } else if point[d] > self.max[d] {
                point[d] - self.max[d]
            } else {
                0.0
            };
            dist2 += delta * delta;
        }
        dist2.sqrt()
    }

    /// True if the ball of radius `radius` around `center` touches the box.
    pub fn intersects_sphere(&self, center: &Point<D>, radius: f64) -> bool {
        !self.is_empty() && self.distance_to(center) <= radius
    }

    /// True if the two boxes overlap.
    pub fn intersects(&self, other: &Self) -> bool {
        (0..D).all(|d| self.min[d] <= other.max[d] && other.min[d] <= self.max[d])
    }

    /// Map a point from the reference box `[0, 1]^D` to the bounding box.
    pub fn reference_to_physical(&self, point: Point<D>) -> Point<D> {
        std::array::from_fn(|d| self.min[d] + (self.max[d] - self.min[d]) * point[d])
    }

    /// Map a point from the physical domain to the reference box.
    ///
    /// Degenerate axes, where the box has zero extent, map to zero.
    pub fn physical_to_reference(&self, point: Point<D>) -> Point<D> {
        std::array::from_fn(|d| {
            let diam = self.max[d] - self.min[d];
            if diam > 0.0 {
                (point[d] - self.min[d]) / diam
            } else {
                0.0
            }
        })
    }
}

impl<const D: usize> std::fmt::Display for PhysicalBox<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(min: {:?}, max: {:?})", self.min, self.max)
    }
}

/// Shape of the region a particle distribution is restricted to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainShape {
    /// Cube of half edge length `r` around the center.
    Cube,
    /// Ball of radius `r` around the center.
    Sphere,
    /// The whole bounding box.
    Full,
}

impl TryFrom<i32> for DomainShape {
    type Error = SphError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(DomainShape::Cube),
            1 => Ok(DomainShape::Sphere),
            2 => Ok(DomainShape::Full),
            other => Err(SphError::Config(format!(
                "unknown domain type {} (expected 0: cube, 1: sphere, 2: full)",
                other
            ))),
        }
    }
}

impl DomainShape {
    /// Check whether `point` lies in the domain.
    ///
    /// The point must lie in `bbox` and in the shape of half size `r`
    /// centered at `center`. The cube test is inclusive, the sphere test
    /// strict.
    pub fn in_domain<const D: usize>(
        &self,
        point: &Point<D>,
        center: &Point<D>,
        bbox: &PhysicalBox<D>,
        r: f64,
    ) -> bool {
        if !bbox.contains(point) {
            return false;
        }

        match self {
            DomainShape::Cube => (0..D).all(|d| (point[d] - center[d]).abs() <= r),
            DomainShape::Sphere => {
                let dist2 = (0..D)
                    .map(|d| (point[d] - center[d]) * (point[d] - center[d]))
                    .sum::<f64>();
                dist2 < r * r
            }
            DomainShape::Full => true,
        }
    }
}
