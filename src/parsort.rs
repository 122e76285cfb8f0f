//! Implementation of a parallel samplesort of particles by key.
//!
//! Every rank sorts its particles locally, contributes evenly spaced key
//! samples to rank 0, and rank 0 picks `P - 1` pivots from the sorted
//! samples. With two sentinels the `P + 1` splitters define one key
//! interval per rank and a variable all-to-all moves every particle to the
//! rank owning its interval.

use std::fmt::Display;

use itertools::Itertools;
use mpi::{datatype::UserDatatype, traits::Equivalence, Count};
use rayon::prelude::*;

use crate::{
    body::Body,
    comm::Comm,
    error::fatal,
    morton::SpaceKey,
    tools::{global_size, redistribute, sort_to_bins},
};

/// The global sort order of particles: space key first, id to break ties.
#[repr(C)]
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SortKey<const D: usize> {
    /// Space key of the particle.
    pub key: SpaceKey<D>,
    /// Global id of the particle.
    pub id: u64,
}

unsafe impl<const D: usize> Equivalence for SortKey<D> {
    type Out = UserDatatype;

    fn equivalent_datatype() -> Self::Out {
        UserDatatype::contiguous(2, &u64::equivalent_datatype())
    }
}

impl<const D: usize> Display for SortKey<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(key: {}, id: {})", self.key, self.id)
    }
}

impl<const D: usize> SortKey<D> {
    /// Create a new sort key.
    pub fn new(key: SpaceKey<D>, id: u64) -> Self {
        Self { key, id }
    }

    /// Lower sentinel. No particle sorts before it.
    pub fn min() -> Self {
        Self::new(SpaceKey::min(), 0)
    }

    /// Upper sentinel.
    pub fn max() -> Self {
        Self::new(SpaceKey::max(), u64::MAX)
    }
}

/// Number of samples a rank with `nlocal` of `total` particles contributes.
///
/// All ranks together send about `sample_bytes` of samples. A rank with
/// particles sends at least one and never more than it has.
pub fn number_of_samples<const D: usize>(nlocal: usize, total: usize, sample_bytes: usize) -> usize {
    if nlocal == 0 || total == 0 {
        return 0;
    }
    let budget = sample_bytes / std::mem::size_of::<SortKey<D>>();
    let nsample = (budget as f64 * nlocal as f64 / total as f64) as usize;
    nsample.clamp(1, nlocal)
}

/// Compute the `P + 1` splitters from locally sorted keys.
///
/// Splitter `i` and `i + 1` bound the keys of rank `i`. The first and last
/// splitters are the sentinels [SortKey::min] and [SortKey::max]. If fewer
/// samples than pivots exist, the missing pivots are placed just below the
/// upper sentinel so that the trailing ranks receive nothing.
pub fn generate_splitters<const D: usize, C: Comm>(
    sorted_keys: &[SortKey<D>],
    total: usize,
    sample_bytes: usize,
    comm: &C,
) -> Vec<SortKey<D>> {
    let size = comm.size();
    let nlocal = sorted_keys.len();
    let nsample = number_of_samples::<D>(nlocal, total, sample_bytes);

    // Evenly spaced positions in the local array.
    let samples = (0..nsample)
        .map(|i| sorted_keys[(nlocal * (i + 1)) / (nsample + 1)])
        .collect_vec();

    let pivots = if let Some(mut all_samples) = comm.gather_varcount_to_root(&samples) {
        all_samples.sort_unstable();
        all_samples.dedup();

        let first = SortKey::min();
        let last = SortKey::max();
        all_samples.retain(|sample| first < *sample && *sample < last);

        let nkeys = all_samples.len();
        let npivots = size - 1;

        let mut pivots = if nkeys > npivots {
            (1..size)
                .map(|i| all_samples[(nkeys * i) / size])
                .collect_vec()
        } else {
            all_samples
        };

        let missing = npivots - pivots.len();
        pivots.extend(
            (0..missing).map(|k| SortKey::new(SpaceKey::max(), u64::MAX - (missing - k) as u64)),
        );
        pivots
    } else {
        Vec::new()
    };

    let pivots = comm.broadcast_from_root(&pivots);

    let splitters = std::iter::once(SortKey::min())
        .chain(pivots)
        .chain(std::iter::once(SortKey::max()))
        .collect_vec();

    if splitters.len() != size + 1 {
        fatal(
            comm,
            &format!("expected {} splitters, got {}", size + 1, splitters.len()),
        );
    }

    if !splitters.iter().tuple_windows().all(|(a, b)| a < b) {
        fatal(comm, "splitters are not strictly increasing");
    }

    splitters
}

/// Globally sort particles by `(key, id)`.
///
/// Returns the new local particles and the splitters. On a single rank the
/// particles are only sorted locally. The total number of particles after
/// the exchange must equal `total`, otherwise the run is aborted.
pub fn global_sort<const D: usize, C: Comm>(
    mut bodies: Vec<Body<D>>,
    total: usize,
    sample_bytes: usize,
    comm: &C,
) -> (Vec<Body<D>>, Vec<SortKey<D>>) {
    let size = comm.size();

    bodies.par_sort_unstable_by_key(|body| body.sort_key());

    if size == 1 {
        return (bodies, vec![SortKey::min(), SortKey::max()]);
    }

    let keys = bodies.iter().map(|body| body.sort_key()).collect_vec();
    let splitters = generate_splitters(&keys, total, sample_bytes, comm);

    let counts = sort_to_bins(&keys, &splitters[..size])
        .iter()
        .map(|&count| count as Count)
        .collect_vec();

    let mut received = redistribute(&bodies, &counts, comm);

    let new_total = global_size(&received, comm);
    if new_total != total {
        fatal(
            comm,
            &format!(
                "global sort lost particles: {} before, {} after redistribution",
                total, new_total
            ),
        );
    }

    received.par_sort_unstable_by_key(|body| body.sort_key());

    (received, splitters)
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::{generate_splitters, global_sort, number_of_samples, SortKey};
    use crate::{
        body::Body,
        comm::{Comm, LocalComm},
        constants::SAMPLE_BYTES,
        geometry::PhysicalBox,
        morton::SpaceKey,
        tools::{generate_random_bodies, seeded_rng},
    };

    fn random_bodies<C: Comm>(n: usize, comm: &C) -> Vec<Body<2>> {
        let range = PhysicalBox::new([-1.0, -1.0], [1.0, 1.0]);
        let mut rng = seeded_rng(comm.rank());
        let mut bodies = generate_random_bodies(n, &range, 0.01, comm.rank(), &mut rng);
        for body in bodies.iter_mut() {
            body.update_key(&range);
        }
        bodies
    }

    #[test]
    fn test_number_of_samples() {
        assert_eq!(number_of_samples::<3>(0, 100, SAMPLE_BYTES), 0);
        assert_eq!(number_of_samples::<3>(10, 100, SAMPLE_BYTES), 10);
        assert_eq!(number_of_samples::<3>(1, 1_000_000_000, SAMPLE_BYTES), 1);
        assert_eq!(number_of_samples::<3>(50_000, 100_000, SAMPLE_BYTES), 8192);
    }

    #[test]
    fn test_global_sort() {
        let results = LocalComm::run(4, |comm| {
            let bodies = random_bodies(250, &comm);
            let (sorted, splitters) = global_sort(bodies, 1000, SAMPLE_BYTES, &comm);
            (comm.rank(), sorted, splitters)
        });

        let total = results.iter().map(|(_, sorted, _)| sorted.len()).sum::<usize>();
        assert_eq!(total, 1000);

        // All ranks agree on the splitters and hold keys in their interval.
        let splitters = &results[0].2;
        assert_eq!(splitters.len(), 5);
        for (rank, sorted, other) in results.iter() {
            assert_eq!(other, splitters);
            for body in sorted {
                assert!(splitters[*rank] <= body.sort_key());
                assert!(body.sort_key() < splitters[rank + 1]);
            }
        }

        // The concatenation is globally sorted and contains every id once.
        let all = results.iter().flat_map(|(_, sorted, _)| sorted.iter()).collect_vec();
        assert!(all.iter().tuple_windows().all(|(a, b)| a.sort_key() < b.sort_key()));
        let ids = all.iter().map(|b| b.id).sorted().collect_vec();
        assert_eq!(ids, (0..1000).collect_vec());
    }

    #[test]
    fn test_single_rank_sorts_locally() {
        let results = LocalComm::run(1, |comm| {
            let bodies = random_bodies(100, &comm);
            global_sort(bodies, 100, SAMPLE_BYTES, &comm)
        });

        let (sorted, splitters) = &results[0];
        assert_eq!(sorted.len(), 100);
        assert!(sorted.iter().tuple_windows().all(|(a, b)| a.sort_key() < b.sort_key()));
        assert_eq!(splitters, &vec![SortKey::min(), SortKey::max()]);
    }

    #[test]
    fn test_splitters_with_few_samples() {
        // Only rank 0 holds particles, and fewer than there are ranks.
        let results = LocalComm::run(5, |comm| {
            let bodies = if comm.rank() == 0 {
                random_bodies(2, &comm)
            } else {
                Vec::new()
            };
            let keys = bodies.iter().map(|b| b.sort_key()).sorted().collect_vec();
            let splitters = generate_splitters(&keys, 2, SAMPLE_BYTES, &comm);
            let (sorted, _) = global_sort(bodies, 2, SAMPLE_BYTES, &comm);
            (splitters, sorted.len())
        });

        for (splitters, _) in results.iter() {
            assert_eq!(splitters.len(), 6);
            assert!(splitters.iter().tuple_windows().all(|(a, b)| a < b));
            assert_eq!(splitters[0].key, SpaceKey::min());
            assert_eq!(splitters[5].key, SpaceKey::max());
        }

        let counts = results.iter().map(|(_, n)| *n).collect_vec();
        assert_eq!(counts.iter().sum::<usize>(), 2);
    }

    #[test]
    fn test_uneven_ranks() {
        for size in [3, 5, 7] {
            let results = LocalComm::run(size, |comm| {
                let n = 50 * (comm.rank() + 1);
                let total = (1..=comm.size()).map(|r| 50 * r).sum::<usize>();
                let bodies = random_bodies(n, &comm);
                global_sort(bodies, total, SAMPLE_BYTES, &comm).0
            });

            let all = results.iter().flatten().collect_vec();
            assert_eq!(all.len(), (1..=size).map(|r| 50 * r).sum::<usize>());
            assert!(all.iter().tuple_windows().all(|(a, b)| a.sort_key() < b.sort_key()));
        }
    }
}
