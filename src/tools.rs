//! Utility routines.

use itertools::Itertools;
use mpi::Count;
use num::traits::Zero;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    body::Body,
    comm::{Comm, Message},
    config::SphConfig,
    error::{Result, SphError},
    geometry::PhysicalBox,
};

/// Gather array to all processes
pub fn gather_to_all<T: Message, C: Comm>(arr: &[T], comm: &C) -> Vec<T> {
    comm.all_gather_varcount(arr)
}

/// Gather distributed array to the root rank.
///
/// The result is a `Vec<T>` on root and `None` on all other ranks.
pub fn gather_to_root<T: Message, C: Comm>(arr: &[T], comm: &C) -> Option<Vec<T>> {
    comm.gather_varcount_to_root(arr)
}

/// Get global size of a distributed array.
///
/// Computes the size and broadcasts it to all ranks.
pub fn global_size<T, C: Comm>(arr: &[T], comm: &C) -> usize {
    comm.all_reduce(&[arr.len() as u64], |a, b| a + b)[0] as usize
}

/// Check if an array is sorted across all ranks.
///
/// Empty ranks are skipped when comparing the boundaries between ranks.
pub fn is_sorted_array<T: Message + PartialOrd, C: Comm>(arr: &[T], comm: &C) -> bool {
    let locally_sorted = arr.iter().tuple_windows().all(|(a, b)| a <= b);

    let boundaries = match (arr.first(), arr.last()) {
        (Some(first), Some(last)) => vec![*first, *last],
        _ => Vec::new(),
    };

    let boundaries_sorted = gather_to_all(&boundaries, comm)
        .iter()
        .tuple_windows()
        .all(|(a, b)| a <= b);

    let all_sorted = comm.all_reduce(&[locally_sorted as u8], |a, b| a.min(b))[0] == 1;

    all_sorted && boundaries_sorted
}

/// Redistribute an array via an all_to_all_varcount operation.
pub fn redistribute<T: Message, C: Comm>(arr: &[T], counts: &[Count], comm: &C) -> Vec<T> {
    comm.all_to_all_varcount(arr, counts).0
}

/// Perform a global inclusive cumulative sum operation.
///
/// For the array `[1, 3, 5, 7]` the output will be `[1, 4, 9, 16]`.
pub fn global_inclusive_cumsum<T: Message + Zero, C: Comm>(arr: &[T], comm: &C) -> Vec<T> {
    let mut scan: Vec<T> = arr
        .iter()
        .scan(<T as Zero>::zero(), |state, x| {
            *state = *x + *state;
            Some(*state)
        })
        .collect_vec();

    // Every rank contributes its local total. Sum up the totals of the lower ranks.
    let scan_last = scan.last().copied().unwrap_or_else(T::zero);
    let offset = gather_to_all(&[scan_last], comm)
        .into_iter()
        .take(comm.rank())
        .fold(T::zero(), |acc, x| acc + x);

    for elem in &mut scan {
        *elem = *elem + offset;
    }

    scan
}

/// Distribute a sorted sequence into bins.
///
/// For an array with n elements to be distributed into p bins, the array
/// `bins` has p sorted elements. Bin `j` is the half-open interval
/// `[bins[j], bins[j+1])` and the last bin is `[bins[p-1], \infty)`.
/// Elements smaller than `bins[0]` are not counted.
/// The function returns a p element array with the counts of how many elements go to each bin.
/// Since the sequence is sorted this fully defines what element goes into which bin.
pub fn sort_to_bins<T: Ord>(sorted_keys: &[T], bins: &[T]) -> Vec<usize> {
    let starts = bins
        .iter()
        .map(|bin| sorted_keys.partition_point(|key| key < bin))
        .chain(std::iter::once(sorted_keys.len()))
        .collect_vec();

    starts.iter().tuple_windows().map(|(a, b)| b - a).collect()
}

/// Send each element of each rank to the ranks listed for it.
///
/// Returns the received elements in source rank order together with the
/// rank each of them came from.
pub fn send_to_ranks<T: Message, C: Comm>(
    arr: &[T],
    destinations: &[Vec<usize>],
    comm: &C,
) -> (Vec<T>, Vec<usize>) {
    let size = comm.size();
    let mut buckets = vec![Vec::new(); size];
    for (elem, ranks) in arr.iter().zip(destinations) {
        for &rank in ranks {
            buckets[rank].push(*elem);
        }
    }

    let counts = buckets.iter().map(|b| b.len() as Count).collect_vec();
    let (received, recv_counts) = comm.all_to_all_varcount(&buckets.concat(), &counts);

    let sources = recv_counts
        .iter()
        .enumerate()
        .flat_map(|(rank, &count)| std::iter::repeat(rank).take(count as usize))
        .collect_vec();

    (received, sources)
}

/// All-gather by recursive doubling over a hypercube.
///
/// Ranks exchange everything they have collected so far with the partner
/// whose rank differs in one bit, one dimension per round. If the number of
/// ranks `P` is not a power of two, let `q` be the largest power of two
/// below `P`. Rank `q + i` first hands its data to rank `i`, the first `q`
/// ranks run the hypercube exchange, and rank `i` finally sends the full
/// result back to rank `q + i`. Every rank ends up with the data of every
/// rank. The order of the result differs between ranks.
pub fn hypercube_all_gather<T: Message, C: Comm>(arr: &[T], comm: &C) -> Vec<T> {
    let size = comm.size();
    let rank = comm.rank();

    let mut data = arr.to_vec();
    if size == 1 {
        return data;
    }

    let cube = 1 << (usize::BITS - 1 - size.leading_zeros());

    if rank >= cube {
        comm.exchange(rank - cube, &data);
    } else if rank + cube < size {
        data.extend(comm.exchange::<T>(rank + cube, &[]));
    }

    if rank < cube {
        let mut bit = 1;
        while bit < cube {
            let partner = rank ^ bit;
            let received = comm.exchange(partner, &data);
            tracing::trace!(rank, partner, received = received.len(), "hypercube round");
            data.extend(received);
            bit <<= 1;
        }
    }

    if rank >= cube {
        data = comm.exchange::<T>(rank - cube, &[]);
    } else if rank + cube < size {
        comm.exchange(rank + cube, &data);
    }

    data
}

/// Generate random bodies in `range` for testing.
///
/// Ids are unique across ranks as long as every rank generates the same number of bodies.
pub fn generate_random_bodies<R: Rng, const D: usize>(
    nbodies: usize,
    range: &PhysicalBox<D>,
    h: f64,
    rank: usize,
    rng: &mut R,
) -> Vec<Body<D>> {
    (0..nbodies)
        .map(|index| {
            let unit: [f64; D] = std::array::from_fn(|_| rng.gen());
            let mass = rng.gen_range(0.5..1.5);
            Body::new(
                (nbodies * rank + index) as u64,
                range.reference_to_physical(unit),
                mass,
                h,
            )
        })
        .collect()
}

/// Generate random bodies inside the domain shape of `config`.
///
/// The shape is centered in `range` with half size equal to half the
/// shortest side of `range`. Points are drawn with an rng seeded from
/// `config.seed` and `rank` and rejected until they lie in the shape.
pub fn generate_bodies_from_config<const D: usize>(
    nbodies: usize,
    range: &PhysicalBox<D>,
    h: f64,
    rank: usize,
    config: &SphConfig,
) -> Result<Vec<Body<D>>> {
    let extent: [f64; D] = std::array::from_fn(|d| range.max()[d] - range.min()[d]);
    let half = 0.5 * extent.iter().copied().fold(f64::INFINITY, f64::min);
    if !(half > 0.0 && half.is_finite()) {
        return Err(SphError::Precondition(format!(
            "cannot place bodies in the degenerate range {}",
            range
        )));
    }
    let center: [f64; D] = std::array::from_fn(|d| range.min()[d] + 0.5 * extent[d]);

    let mut rng = seeded_rng(config.seed as usize + rank);
    let bodies = (0..nbodies)
        .map(|index| {
            let position = loop {
                let unit: [f64; D] = std::array::from_fn(|_| rng.gen());
                let point = range.reference_to_physical(unit);
                if config.domain_shape.in_domain(&point, &center, range, half) {
                    break point;
                }
            };
            let mass = rng.gen_range(0.5..1.5);
            Body::new((nbodies * rank + index) as u64, position, mass, h)
        })
        .collect();

    Ok(bodies)
}

/// Get a seeded rng
pub fn seeded_rng(seed: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed as u64)
}

/// Compute displacements from a vector of counts.
///
/// This is useful for global MPI varcount operations. Let
/// count [ 3, 4, 5]. Then the corresponding displacements are
/// [0, 3, 7]. Note that the last element `5` is ignored.
pub fn displacements(counts: &[Count]) -> Vec<Count> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::{
        generate_bodies_from_config, global_inclusive_cumsum, global_size, hypercube_all_gather,
        is_sorted_array, send_to_ranks, sort_to_bins,
    };
    use crate::{
        comm::{Comm, LocalComm},
        config::SphConfig,
        error::SphError,
        geometry::{distance, DomainShape, PhysicalBox},
    };

    #[test]
    fn test_sort_to_bins() {
        let elems = (0..100).collect_vec();
        let bins = [0, 17, 55];

        let counts = sort_to_bins(&elems, &bins);

        assert_eq!(counts[0], 17);
        assert_eq!(counts[1], 38);
        assert_eq!(counts[2], 45);
    }

    #[test]
    fn test_sort_to_bins_with_empty_bins() {
        let elems = [5, 6, 7, 40];
        let bins = [0, 1, 2, 30, 100];

        assert_eq!(sort_to_bins(&elems, &bins), vec![0, 0, 3, 1, 0]);
        assert_eq!(sort_to_bins::<i32>(&[], &bins), vec![0; 5]);
    }

    #[test]
    fn test_hypercube_all_gather() {
        for size in 1..=8 {
            let results = LocalComm::run(size, |comm| {
                // Rank r contributes r + 1 copies of its rank.
                let local = vec![comm.rank() as u64; comm.rank() + 1];
                let mut gathered = hypercube_all_gather(&local, &comm);
                gathered.sort_unstable();
                gathered
            });

            let expected = (0..size as u64)
                .flat_map(|rank| vec![rank; rank as usize + 1])
                .collect_vec();

            for gathered in results {
                assert_eq!(gathered, expected, "failed for {} ranks", size);
            }
        }
    }

    #[test]
    fn test_global_size() {
        let results = LocalComm::run(4, |comm| {
            let rank = comm.rank() as i64;
            // Rank 2 holds no elements.
            let local = if rank == 2 { vec![] } else { vec![rank, 10 - rank] };
            global_size(&local, &comm)
        });

        assert_eq!(results, vec![6; 4]);
    }

    #[test]
    fn test_cumsum() {
        let results = LocalComm::run(3, |comm| {
            let local = vec![1u64; comm.rank() + 1];
            global_inclusive_cumsum(&local, &comm)
        });

        assert_eq!(results, vec![vec![1], vec![2, 3], vec![4, 5, 6]]);
    }

    #[test]
    fn test_is_sorted_array() {
        let results = LocalComm::run(4, |comm| {
            let rank = comm.rank() as u64;
            let sorted = if rank == 1 { vec![] } else { vec![10 * rank, 10 * rank + 5] };
            let unsorted = vec![10 - rank];
            (
                is_sorted_array(&sorted, &comm),
                is_sorted_array(&unsorted, &comm),
            )
        });

        assert!(results.iter().all(|r| r.0));
        assert!(results.iter().all(|r| !r.1));
    }

    #[test]
    fn test_bodies_from_config() {
        let range = PhysicalBox::new([0.0, 0.0], [2.0, 1.0]);
        let center = [1.0, 0.5];
        let config = SphConfig::from_yaml_str("domain_shape: sphere\nseed: 3").unwrap();

        let bodies = generate_bodies_from_config(500, &range, 0.01, 1, &config).unwrap();
        assert_eq!(bodies.len(), 500);
        assert!(bodies.iter().all(|b| distance(&b.position, &center) < 0.5));
        assert_eq!(bodies[0].id, 500);

        // The same seed and rank reproduce the bodies, another seed does not.
        let again = generate_bodies_from_config(500, &range, 0.01, 1, &config).unwrap();
        assert_eq!(bodies, again);
        let other = SphConfig { seed: 4, ..config.clone() };
        let different = generate_bodies_from_config(500, &range, 0.01, 1, &other).unwrap();
        assert_ne!(bodies, different);

        let cube = SphConfig { domain_shape: DomainShape::Cube, ..config };
        let bodies = generate_bodies_from_config(200, &range, 0.01, 0, &cube).unwrap();
        assert!(bodies.iter().all(|b| (b.position[0] - 1.0).abs() <= 0.5));

        let flat = PhysicalBox::new([0.0, 0.0], [1.0, 0.0]);
        assert!(matches!(
            generate_bodies_from_config(10, &flat, 0.01, 0, &SphConfig::default()),
            Err(SphError::Precondition(_))
        ));
    }

    #[test]
    fn test_send_to_ranks() {
        let results = LocalComm::run(3, |comm| {
            let rank = comm.rank() as u64;
            // Every rank sends its first element to all other ranks.
            let destinations = vec![
                (0..comm.size()).filter(|&r| r != comm.rank()).collect_vec(),
                vec![],
            ];
            send_to_ranks(&[rank, 100 + rank], &destinations, &comm)
        });

        for (rank, (received, sources)) in results.into_iter().enumerate() {
            let expected = (0..3u64).filter(|&r| r != rank as u64).collect_vec();
            assert_eq!(received, expected);
            assert_eq!(sources, expected.iter().map(|&r| r as usize).collect_vec());
        }
    }
}
