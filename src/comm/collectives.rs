//! Collective operations built generically over [`Communicator`].
//!
//! Every operation here is collective: all ranks of the communicator must
//! call it with the same tag, in the same order relative to other
//! collectives. Reductions gather contributions and combine them in rank
//! order, so results are bitwise identical on every rank.

use bytemuck::Pod;

use super::{CommTag, Communicator, Wait};

/// Gather a fixed-size block from every rank to all ranks.
///
/// `block` must have the same length on every rank. The result holds the
/// blocks of ranks `0..size` in rank order (`size * block.len()` items).
pub fn all_gather<T: Pod, C: Communicator>(comm: &C, tag: CommTag, block: &[T]) -> Vec<T> {
    let rank = comm.rank();
    let size = comm.size();
    let bytes: &[u8] = bytemuck::cast_slice(block);

    let mut sends = Vec::with_capacity(size.saturating_sub(1));
    for peer in 0..size {
        if peer != rank {
            sends.push(comm.isend(peer, tag.as_u16(), bytes));
        }
    }

    let mut out = Vec::with_capacity(size * block.len());
    for peer in 0..size {
        if peer == rank {
            out.extend_from_slice(block);
        } else {
            let msg = comm
                .irecv(peer, tag.as_u16(), bytes.len())
                .wait()
                .expect("all_gather: receive completed without data");
            out.extend_from_slice(&bytemuck::pod_collect_to_vec::<u8, T>(&msg));
        }
    }

    for s in sends {
        s.wait();
    }
    out
}

/// Gather variable-length arrays from every rank to all ranks.
///
/// Returns the concatenated data in rank order together with the per-rank
/// element counts (`rcounts`); pair with [`displacements`] to index it.
pub fn all_gather_varcount<T: Pod, C: Communicator>(
    comm: &C,
    tag: CommTag,
    arr: &[T],
) -> (Vec<T>, Vec<usize>) {
    // First round communicates the per-rank lengths.
    let counts: Vec<u64> = all_gather(comm, tag, &[arr.len() as u64]);
    let counts: Vec<usize> = counts.into_iter().map(|c| c as usize).collect();

    let rank = comm.rank();
    let size = comm.size();
    let bytes: &[u8] = bytemuck::cast_slice(arr);
    let data_tag = tag.offset(1);

    let mut sends = Vec::with_capacity(size.saturating_sub(1));
    for peer in 0..size {
        if peer != rank {
            sends.push(comm.isend(peer, data_tag.as_u16(), bytes));
        }
    }

    let item = std::mem::size_of::<T>();
    let mut out = Vec::with_capacity(counts.iter().sum());
    for peer in 0..size {
        if peer == rank {
            out.extend_from_slice(arr);
        } else {
            let msg = comm
                .irecv(peer, data_tag.as_u16(), counts[peer] * item)
                .wait()
                .expect("all_gather_varcount: receive completed without data");
            out.extend_from_slice(&bytemuck::pod_collect_to_vec::<u8, T>(&msg));
        }
    }

    for s in sends {
        s.wait();
    }
    (out, counts)
}

/// Global sum of one `f64` per rank, combined in rank order.
pub fn all_reduce_sum_f64<C: Communicator>(comm: &C, tag: CommTag, value: f64) -> f64 {
    all_gather(comm, tag, &[value]).into_iter().sum()
}

/// Global sum of one `u64` per rank.
pub fn all_reduce_sum_u64<C: Communicator>(comm: &C, tag: CommTag, value: u64) -> u64 {
    all_gather(comm, tag, &[value]).into_iter().sum()
}

/// Global maximum of one `u64` per rank.
pub fn all_reduce_max_u64<C: Communicator>(comm: &C, tag: CommTag, value: u64) -> u64 {
    all_gather(comm, tag, &[value])
        .into_iter()
        .max()
        .expect("communicator has at least one rank")
}

/// Compute displacements from a vector of counts.
///
/// Useful for indexing varcount gathers: for counts `[3, 4, 5]` the
/// corresponding displacements are `[0, 3, 7]`.
pub fn displacements(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}
