//! Communication context shared by all distributed routines.
//!
//! Every distributed routine in this crate is generic over [Comm]. Two
//! implementations are provided:
//! - [MpiComm] wraps an MPI communicator (typically the world communicator).
//! - [LocalComm] runs a fixed number of ranks as threads of the current
//!   process and moves messages through channels. It exists so that the
//!   multi-rank algorithms can be tested with `cargo test`.
use std::any::Any;
use std::mem::MaybeUninit;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Barrier};

use itertools::{izip, Itertools};
use mpi::{
    collective::UserOperation,
    datatype::{Partition, PartitionMut},
    traits::{CommunicatorCollectives, Destination, Equivalence, Root, Source},
    Count,
};

use crate::{constants::HYPERCUBE_TAG, tools::displacements};

/// Types that can be moved between ranks.
pub trait Message: Equivalence + Copy + Send + 'static {}

impl<T: Equivalence + Copy + Send + 'static> Message for T {}

/// The collective and point to point operations used by the distribution layer.
///
/// All collective operations must be called by every rank of the
/// communicator in the same order. They are the only points at which a
/// rank waits for its peers.
pub trait Comm {
    /// Rank of the calling process.
    fn rank(&self) -> usize;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Block until all ranks reach the barrier.
    fn barrier(&self);

    /// Concatenate the arrays of all ranks in rank order on every rank.
    fn all_gather_varcount<T: Message>(&self, arr: &[T]) -> Vec<T>;

    /// Concatenate the arrays of all ranks on rank 0. Returns `None` on all other ranks.
    fn gather_varcount_to_root<T: Message>(&self, arr: &[T]) -> Option<Vec<T>>;

    /// Send the array of rank 0 to all ranks. The argument is ignored on other ranks.
    fn broadcast_from_root<T: Message>(&self, arr: &[T]) -> Vec<T>;

    /// Variable all to all exchange.
    ///
    /// `arr` is split into consecutive chunks, chunk `i` having `counts[i]`
    /// elements and going to rank `i`. Returns the received elements in
    /// source rank order together with the number received from each rank.
    fn all_to_all_varcount<T: Message>(&self, arr: &[T], counts: &[Count]) -> (Vec<T>, Vec<Count>);

    /// Element wise reduction across all ranks with a commutative operation.
    fn all_reduce<T: Message>(&self, local: &[T], op: fn(T, T) -> T) -> Vec<T>;

    /// Send `arr` to `partner` and receive the array `partner` sends back.
    ///
    /// The send is non-blocking, the receive blocks until the partner's
    /// message has arrived.
    fn exchange<T: Message>(&self, partner: usize, arr: &[T]) -> Vec<T>;

    /// Terminate all ranks.
    fn abort(&self, code: i32) -> !;
}

// View the spare capacity of a vector as an initialised slice so MPI can write into it.
// The caller must call `set_len` only after the slice has been completely filled.
fn uninit_slice<T>(buffer: &mut Vec<T>, len: usize) -> &mut [T] {
    let spare: &mut [MaybeUninit<T>] = &mut buffer.spare_capacity_mut()[..len];
    unsafe { std::mem::transmute::<&mut [MaybeUninit<T>], &mut [T]>(spare) }
}

/// [Comm] implementation on top of an MPI communicator.
pub struct MpiComm<C: CommunicatorCollectives> {
    comm: C,
}

impl<C: CommunicatorCollectives> MpiComm<C> {
    /// Wrap an MPI communicator.
    pub fn new(comm: C) -> Self {
        Self { comm }
    }
}

impl<C: CommunicatorCollectives> Comm for MpiComm<C> {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn barrier(&self) {
        self.comm.barrier();
    }

    fn all_gather_varcount<T: Message>(&self, arr: &[T]) -> Vec<T> {
        // First we need to broadcast the individual sizes on each process.

        let local_len = arr.len() as Count;
        let mut sizes = vec![0 as Count; self.size()];
        self.comm.all_gather_into(&local_len, &mut sizes[..]);

        let recv_len = sizes.iter().sum::<Count>() as usize;
        let recv_displs = displacements(&sizes);

        let mut recvbuffer = Vec::<T>::with_capacity(recv_len);
        let buf = uninit_slice(&mut recvbuffer, recv_len);

        let mut receive_partition = PartitionMut::new(buf, &sizes[..], &recv_displs[..]);
        self.comm
            .all_gather_varcount_into(arr, &mut receive_partition);

        unsafe { recvbuffer.set_len(recv_len) };

        recvbuffer
    }

    fn gather_varcount_to_root<T: Message>(&self, arr: &[T]) -> Option<Vec<T>> {
        let n = arr.len() as Count;
        let root_process = self.comm.process_at_rank(0);

        // We first communicate the length of the array to root.

        if self.rank() == 0 {
            let mut counts = vec![0 as Count; self.size()];
            root_process.gather_into_root(&n, &mut counts[..]);

            // We now have all counts at root. Can now do a varcount gather to get
            // the array elements.

            let nelements = counts.iter().sum::<Count>() as usize;
            let displs = displacements(&counts);

            let mut new_arr = Vec::<T>::with_capacity(nelements);
            let buf = uninit_slice(&mut new_arr, nelements);

            let mut partition = PartitionMut::new(buf, &counts[..], &displs[..]);
            root_process.gather_varcount_into_root(arr, &mut partition);

            unsafe { new_arr.set_len(nelements) };
            Some(new_arr)
        } else {
            root_process.gather_into(&n);
            root_process.gather_varcount_into(arr);
            None
        }
    }

    fn broadcast_from_root<T: Message>(&self, arr: &[T]) -> Vec<T> {
        let root_process = self.comm.process_at_rank(0);

        let mut len = arr.len() as Count;
        root_process.broadcast_into(&mut len);
        let len = len as usize;

        if self.rank() == 0 {
            let mut data = arr.to_vec();
            root_process.broadcast_into(&mut data[..]);
            data
        } else {
            let mut data = Vec::<T>::with_capacity(len);
            let buf = uninit_slice(&mut data, len);
            root_process.broadcast_into(buf);
            unsafe { data.set_len(len) };
            data
        }
    }

    fn all_to_all_varcount<T: Message>(&self, arr: &[T], counts: &[Count]) -> (Vec<T>, Vec<Count>) {
        assert_eq!(counts.len(), self.size());

        // First send the counts around via an alltoall operation.

        let mut recv_counts = vec![0 as Count; counts.len()];
        self.comm.all_to_all_into(counts, &mut recv_counts[..]);

        // We have the recv_counts. Allocate space and setup the partitions.

        let nelems = recv_counts.iter().sum::<Count>() as usize;

        let mut output = Vec::<T>::with_capacity(nelems);
        let out_buf = uninit_slice(&mut output, nelems);

        let send_partition = Partition::new(arr, counts, displacements(counts));
        let mut recv_partition =
            PartitionMut::new(out_buf, &recv_counts[..], displacements(&recv_counts));

        self.comm
            .all_to_all_varcount_into(&send_partition, &mut recv_partition);

        unsafe { output.set_len(nelems) };

        (output, recv_counts)
    }

    fn all_reduce<T: Message>(&self, local: &[T], op: fn(T, T) -> T) -> Vec<T> {
        // Just need to initialize the result with something.
        let mut result = local.to_vec();

        self.comm.all_reduce_into(
            local,
            &mut result[..],
            &UserOperation::commutative(move |x, y| {
                let x: &[T] = x.downcast().unwrap();
                let y: &mut [T] = y.downcast().unwrap();
                for (&x_i, y_i) in x.iter().zip(y) {
                    *y_i = op(x_i, *y_i);
                }
            }),
        );

        result
    }

    fn exchange<T: Message>(&self, partner: usize, arr: &[T]) -> Vec<T> {
        let process = self.comm.process_at_rank(partner as i32);

        mpi::request::scope(|scope| {
            let request = process.immediate_send_with_tag(scope, arr, HYPERCUBE_TAG);
            let (received, _status) = process.receive_vec_with_tag::<T>(HYPERCUBE_TAG);
            request.wait();
            received
        })
    }

    fn abort(&self, code: i32) -> ! {
        self.comm.abort(code)
    }
}

type Packet = Box<dyn Any + Send>;

/// In-process [Comm] implementation where every rank is a thread.
///
/// Messages between each ordered pair of ranks travel through their own
/// channel, so they arrive in the order they were sent, as with MPI.
pub struct LocalComm {
    rank: usize,
    size: usize,
    outboxes: Vec<Sender<Packet>>,
    inboxes: Vec<Receiver<Packet>>,
    barrier: Arc<Barrier>,
}

impl LocalComm {
    /// Create the communicators of `size` ranks.
    pub fn create(size: usize) -> Vec<LocalComm> {
        assert!(size > 0, "A communicator needs at least one rank.");

        let mut outboxes = (0..size).map(|_| Vec::with_capacity(size)).collect_vec();
        let mut inboxes = (0..size).map(|_| Vec::with_capacity(size)).collect_vec();

        for source in 0..size {
            for dest in 0..size {
                let (sender, receiver) = channel::<Packet>();
                outboxes[source].push(sender);
                inboxes[dest].push(receiver);
            }
        }

        let barrier = Arc::new(Barrier::new(size));

        izip!(0..size, outboxes, inboxes)
            .map(|(rank, outboxes, inboxes)| LocalComm {
                rank,
                size,
                outboxes,
                inboxes,
                barrier: barrier.clone(),
            })
            .collect()
    }

    /// Run `f` on `size` ranks, each in its own thread, and return the results in rank order.
    ///
    /// A panic on any rank is propagated to the caller.
    pub fn run<R, F>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(LocalComm) -> R + Sync,
        R: Send,
    {
        let comms = Self::create(size);
        let f = &f;

        std::thread::scope(|scope| {
            let handles = comms
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect_vec();

            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(payload) => std::panic::resume_unwind(payload),
                })
                .collect()
        })
    }

    fn send<T: Message>(&self, dest: usize, data: Vec<T>) {
        self.outboxes[dest]
            .send(Box::new(data))
            .expect("receiving rank has terminated");
    }

    fn receive<T: Message>(&self, source: usize) -> Vec<T> {
        let packet = self.inboxes[source]
            .recv()
            .expect("sending rank has terminated");
        *packet
            .downcast::<Vec<T>>()
            .expect("ranks disagree on the message type")
    }
}

impl Comm for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.barrier.wait();
    }

    fn all_gather_varcount<T: Message>(&self, arr: &[T]) -> Vec<T> {
        for dest in 0..self.size {
            self.send(dest, arr.to_vec());
        }
        (0..self.size)
            .flat_map(|source| self.receive::<T>(source))
            .collect()
    }

    fn gather_varcount_to_root<T: Message>(&self, arr: &[T]) -> Option<Vec<T>> {
        self.send(0, arr.to_vec());
        if self.rank == 0 {
            Some(
                (0..self.size)
                    .flat_map(|source| self.receive::<T>(source))
                    .collect(),
            )
        } else {
            None
        }
    }

    fn broadcast_from_root<T: Message>(&self, arr: &[T]) -> Vec<T> {
        if self.rank == 0 {
            for dest in 1..self.size {
                self.send(dest, arr.to_vec());
            }
            arr.to_vec()
        } else {
            self.receive(0)
        }
    }

    fn all_to_all_varcount<T: Message>(&self, arr: &[T], counts: &[Count]) -> (Vec<T>, Vec<Count>) {
        assert_eq!(counts.len(), self.size);

        for (dest, (&count, &displ)) in counts.iter().zip(displacements(counts).iter()).enumerate() {
            let start = displ as usize;
            self.send(dest, arr[start..start + count as usize].to_vec());
        }

        let mut recv_counts = Vec::with_capacity(self.size);
        let mut output = Vec::new();
        for source in 0..self.size {
            let chunk = self.receive::<T>(source);
            recv_counts.push(chunk.len() as Count);
            output.extend(chunk);
        }

        (output, recv_counts)
    }

    fn all_reduce<T: Message>(&self, local: &[T], op: fn(T, T) -> T) -> Vec<T> {
        for dest in 0..self.size {
            self.send(dest, local.to_vec());
        }

        // Every rank folds in rank order, so all ranks obtain identical results.
        let mut result = self.receive::<T>(0);
        for source in 1..self.size {
            let contribution = self.receive::<T>(source);
            assert_eq!(contribution.len(), result.len());
            for (acc, &value) in result.iter_mut().zip(contribution.iter()) {
                *acc = op(*acc, value);
            }
        }

        result
    }

    fn exchange<T: Message>(&self, partner: usize, arr: &[T]) -> Vec<T> {
        self.send(partner, arr.to_vec());
        self.receive(partner)
    }

    fn abort(&self, code: i32) -> ! {
        panic!("rank {} aborted with error code {}", self.rank, code)
    }
}
