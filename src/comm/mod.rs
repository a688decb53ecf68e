//! Cross-worker reduction primitives
//!
//! The centering strategies only need summation across data-parallel
//! workers, so the surface is a single `all_reduce_sum` over f64 buffers.
//! Production deployments plug in their communication backend through the
//! [`Collective`] trait; [`NullCollective`] serves single-process runs and
//! [`ProcessGroup`] provides an in-memory blocking all-reduce for
//! multi-threaded tests.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};

use thiserror::Error;

/// Errors joining an in-memory process group
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommError {
    #[error("world size must be at least 1, got {0}")]
    InvalidWorldSize(usize),

    #[error("rank {rank} out of range for world size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },

    #[error("group '{group}' already created with world size {existing}, requested {requested}")]
    WorldSizeMismatch {
        group: String,
        existing: usize,
        requested: usize,
    },

    #[error("rank {rank} already joined group '{group}'")]
    RankTaken { group: String, rank: usize },
}

/// Summation across data-parallel workers.
///
/// `all_reduce_sum` blocks until every worker in the group has contributed;
/// a straggler stalls the step rather than producing a per-worker failure.
pub trait Collective: Send + Sync {
    /// This worker's index
    fn rank(&self) -> usize;

    /// Total number of workers
    fn world_size(&self) -> usize;

    /// Replace `buf` with the elementwise sum over all workers
    fn all_reduce_sum(&self, buf: &mut [f64]);
}

/// Single-process collective: reductions are identity operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCollective;

impl Collective for NullCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _buf: &mut [f64]) {}
}

#[derive(Debug)]
struct ReducePhase {
    accum: Vec<f64>,
    result: Vec<f64>,
    arrived: usize,
    generation: u64,
    joined: Vec<bool>,
}

#[derive(Debug)]
struct GroupState {
    world_size: usize,
    phase: Mutex<ReducePhase>,
    cv: Condvar,
}

fn registry() -> &'static Mutex<HashMap<String, Arc<GroupState>>> {
    static GROUPS: OnceLock<Mutex<HashMap<String, Arc<GroupState>>>> = OnceLock::new();
    GROUPS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-memory rendezvous group: workers on different threads connect under a
/// shared name and all-reduce through process memory.
#[derive(Debug)]
pub struct ProcessGroup {
    rank: usize,
    state: Arc<GroupState>,
}

impl ProcessGroup {
    /// Join group `name` as `rank` of `world_size`. The first caller creates
    /// the group; later callers must agree on the world size, and each rank
    /// may join once.
    pub fn connect(name: &str, rank: usize, world_size: usize) -> Result<Self, CommError> {
        if world_size == 0 {
            return Err(CommError::InvalidWorldSize(world_size));
        }
        if rank >= world_size {
            return Err(CommError::RankOutOfRange { rank, world_size });
        }

        let mut groups = lock_ignoring_poison(registry());
        let state = groups
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(GroupState {
                    world_size,
                    phase: Mutex::new(ReducePhase {
                        accum: Vec::new(),
                        result: Vec::new(),
                        arrived: 0,
                        generation: 0,
                        joined: vec![false; world_size],
                    }),
                    cv: Condvar::new(),
                })
            })
            .clone();
        drop(groups);

        if state.world_size != world_size {
            return Err(CommError::WorldSizeMismatch {
                group: name.to_string(),
                existing: state.world_size,
                requested: world_size,
            });
        }

        let mut phase = lock_ignoring_poison(&state.phase);
        if phase.joined[rank] {
            return Err(CommError::RankTaken {
                group: name.to_string(),
                rank,
            });
        }
        phase.joined[rank] = true;
        drop(phase);

        Ok(Self { rank, state })
    }
}

impl Collective for ProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.state.world_size
    }

    fn all_reduce_sum(&self, buf: &mut [f64]) {
        let mut phase = lock_ignoring_poison(&self.state.phase);
        if phase.arrived == 0 {
            phase.accum = buf.to_vec();
        } else {
            assert_eq!(
                phase.accum.len(),
                buf.len(),
                "all_reduce_sum: buffer length {} disagrees with the group's {}",
                buf.len(),
                phase.accum.len()
            );
            for (acc, v) in phase.accum.iter_mut().zip(buf.iter()) {
                *acc += *v;
            }
        }
        phase.arrived += 1;

        if phase.arrived == self.state.world_size {
            phase.result = std::mem::take(&mut phase.accum);
            phase.arrived = 0;
            phase.generation += 1;
            buf.copy_from_slice(&phase.result);
            self.state.cv.notify_all();
        } else {
            let generation = phase.generation;
            while phase.generation == generation {
                phase = match self.state.cv.wait(phase) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
            buf.copy_from_slice(&phase.result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_null_collective_is_identity() {
        let c = NullCollective;
        let mut buf = vec![1.0, 2.0];
        c.all_reduce_sum(&mut buf);
        assert_eq!(buf, vec![1.0, 2.0]);
        assert_eq!(c.world_size(), 1);
    }

    #[test]
    fn test_process_group_sums_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                thread::spawn(move || {
                    let group = ProcessGroup::connect("test-sum", rank, 4).unwrap();
                    let mut buf = vec![rank as f64, 1.0];
                    group.all_reduce_sum(&mut buf);
                    buf
                })
            })
            .collect();

        for handle in handles {
            let buf = handle.join().unwrap();
            assert_eq!(buf, vec![6.0, 4.0]);
        }
    }

    #[test]
    fn test_process_group_consecutive_reductions() {
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                thread::spawn(move || {
                    let group = ProcessGroup::connect("test-consecutive", rank, 2).unwrap();
                    let mut first = vec![1.0];
                    group.all_reduce_sum(&mut first);
                    let mut second = vec![10.0 * (rank + 1) as f64];
                    group.all_reduce_sum(&mut second);
                    (first[0], second[0])
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), (2.0, 30.0));
        }
    }

    #[test]
    fn test_connect_rejects_duplicate_rank() {
        let _a = ProcessGroup::connect("test-dup", 0, 2).unwrap();
        let err = ProcessGroup::connect("test-dup", 0, 2).unwrap_err();
        assert!(matches!(err, CommError::RankTaken { rank: 0, .. }));
    }

    #[test]
    fn test_connect_rejects_world_size_mismatch() {
        let _a = ProcessGroup::connect("test-mismatch", 0, 2).unwrap();
        let err = ProcessGroup::connect("test-mismatch", 1, 3).unwrap_err();
        assert!(matches!(err, CommError::WorldSizeMismatch { .. }));
    }

    #[test]
    fn test_connect_rejects_out_of_range_rank() {
        let err = ProcessGroup::connect("test-range", 5, 2).unwrap_err();
        assert_eq!(
            err,
            CommError::RankOutOfRange {
                rank: 5,
                world_size: 2
            }
        );
    }
}
