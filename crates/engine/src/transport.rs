//! The node-to-node transport abstraction.
//!
//! Everything the engine says to another node goes through [`Transport`]:
//! tagged point-to-point byte messages plus the three collectives the step
//! loop needs. The in-memory implementation runs a whole "cluster" inside
//! one process, which is how the multi-node paths are tested.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{EngineError, Result};

/// Collective rounds use tags below this; cell message tags are
/// non-negative.
const COLLECTIVE_TAG_BASE: i64 = -1;

/// Default patience for a blocking receive before the step is declared dead.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Point-to-point and collective communication with the other nodes.
pub trait Transport: Send + Sync {
    /// This node's rank.
    fn rank(&self) -> usize;

    /// Number of nodes.
    fn size(&self) -> usize;

    /// Post a message; must not block on the receiver.
    fn send(&self, peer: usize, tag: i64, payload: Vec<u8>) -> Result<()>;

    /// Non-blocking probe-and-take of a message from `peer` with `tag`.
    fn try_recv(&self, peer: usize, tag: i64) -> Result<Option<Vec<u8>>>;

    /// Blocking receive with a timeout; timeouts are fatal to the step.
    fn recv_timeout(&self, peer: usize, tag: i64, timeout: Duration) -> Result<Vec<u8>>;

    /// Every rank contributes one value, every rank gets all of them in
    /// rank order. The building block for the reductions below.
    fn allgather_u64(&self, value: u64) -> Result<Vec<u64>>;

    /// Minimum across ranks of a signed 64-bit value.
    fn allreduce_min_i64(&self, value: i64) -> Result<i64> {
        let all = self.allgather_u64(value as u64)?;
        Ok(all.into_iter().map(|v| v as i64).min().unwrap_or(value))
    }

    /// Logical OR across ranks.
    fn allreduce_or(&self, value: bool) -> Result<bool> {
        let all = self.allgather_u64(value as u64)?;
        Ok(all.into_iter().any(|v| v != 0))
    }

    /// Every rank's `f64` contribution, in rank order.
    fn allgather_f64(&self, value: f64) -> Result<Vec<f64>> {
        let all = self.allgather_u64(value.to_bits())?;
        Ok(all.into_iter().map(f64::from_bits).collect())
    }

    /// Sum across ranks.
    fn allreduce_sum_u64(&self, value: u64) -> Result<u64> {
        let all = self.allgather_u64(value)?;
        Ok(all.into_iter().sum())
    }

    /// Rendezvous of all ranks.
    fn barrier(&self) -> Result<()> {
        self.allgather_u64(0).map(|_| ())
    }
}

/// Mailboxes shared by all ranks of an in-memory cluster.
struct ClusterShared {
    size: usize,
    /// Keyed by `(to, from, tag)`.
    boxes: Mutex<HashMap<(usize, usize, i64), VecDeque<Vec<u8>>>>,
    cond: Condvar,
}

/// One rank's endpoint of an in-memory cluster.
pub struct MemoryTransport {
    rank: usize,
    shared: Arc<ClusterShared>,
    /// Collective round counter; all ranks call collectives in the same
    /// order, so the sequence numbers line up.
    coll_seq: AtomicI64,
}

/// Build an in-memory cluster of `size` ranks.
pub fn memory_cluster(size: usize) -> Vec<MemoryTransport> {
    let shared = Arc::new(ClusterShared {
        size,
        boxes: Mutex::new(HashMap::new()),
        cond: Condvar::new(),
    });
    (0..size)
        .map(|rank| MemoryTransport {
            rank,
            shared: Arc::clone(&shared),
            coll_seq: AtomicI64::new(0),
        })
        .collect()
}

impl MemoryTransport {
    /// A single-rank cluster, for single-node runs.
    pub fn solo() -> MemoryTransport {
        memory_cluster(1).pop().unwrap()
    }
}

impl Transport for MemoryTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn send(&self, peer: usize, tag: i64, payload: Vec<u8>) -> Result<()> {
        if peer >= self.shared.size {
            return Err(EngineError::Communication {
                node: self.rank,
                peer,
                detail: "no such rank".to_string(),
            });
        }
        let mut boxes = self.shared.boxes.lock().unwrap();
        boxes
            .entry((peer, self.rank, tag))
            .or_default()
            .push_back(payload);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn try_recv(&self, peer: usize, tag: i64) -> Result<Option<Vec<u8>>> {
        let mut boxes = self.shared.boxes.lock().unwrap();
        Ok(boxes
            .get_mut(&(self.rank, peer, tag))
            .and_then(|q| q.pop_front()))
    }

    fn recv_timeout(&self, peer: usize, tag: i64, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut boxes = self.shared.boxes.lock().unwrap();
        loop {
            if let Some(msg) = boxes
                .get_mut(&(self.rank, peer, tag))
                .and_then(|q| q.pop_front())
            {
                return Ok(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::Communication {
                    node: self.rank,
                    peer,
                    detail: format!("receive timed out (tag {})", tag),
                });
            }
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(boxes, deadline - now)
                .unwrap();
            boxes = guard;
        }
    }

    fn allgather_u64(&self, value: u64) -> Result<Vec<u64>> {
        let size = self.shared.size;
        if size == 1 {
            return Ok(vec![value]);
        }
        let seq = self.coll_seq.fetch_add(1, Ordering::Relaxed);
        let tag = COLLECTIVE_TAG_BASE - seq;
        for peer in 0..size {
            if peer != self.rank {
                self.send(peer, tag, value.to_le_bytes().to_vec())?;
            }
        }
        let mut out = vec![0u64; size];
        out[self.rank] = value;
        for peer in 0..size {
            if peer == self.rank {
                continue;
            }
            let bytes = self.recv_timeout(peer, tag, RECV_TIMEOUT)?;
            let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                EngineError::Communication {
                    node: self.rank,
                    peer,
                    detail: "short collective payload".to_string(),
                }
            })?;
            out[peer] = u64::from_le_bytes(arr);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn point_to_point_round_trip() {
        let mut cluster = memory_cluster(2);
        let t1 = cluster.pop().unwrap();
        let t0 = cluster.pop().unwrap();
        t0.send(1, 42, vec![1, 2, 3]).unwrap();
        assert_eq!(t1.try_recv(0, 42).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(t1.try_recv(0, 42).unwrap(), None);
    }

    #[test]
    fn recv_timeout_expires() {
        let t = MemoryTransport::solo();
        let err = t.recv_timeout(0, 7, Duration::from_millis(20));
        assert!(matches!(err, Err(EngineError::Communication { .. })));
    }

    #[test]
    fn allreduce_min_across_ranks() {
        let cluster = memory_cluster(3);
        let values = [17i64, 3, 11];
        let handles: Vec<_> = cluster
            .into_iter()
            .zip(values)
            .map(|(t, v)| thread::spawn(move || t.allreduce_min_i64(v).unwrap()))
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 3);
        }
    }

    #[test]
    fn allreduce_or_detects_any_flag() {
        let cluster = memory_cluster(4);
        let flags = [false, false, true, false];
        let handles: Vec<_> = cluster
            .into_iter()
            .zip(flags)
            .map(|(t, v)| thread::spawn(move || t.allreduce_or(v).unwrap()))
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn consecutive_collectives_do_not_mix() {
        let cluster = memory_cluster(2);
        let handles: Vec<_> = cluster
            .into_iter()
            .enumerate()
            .map(|(rank, t)| {
                thread::spawn(move || {
                    let a = t.allreduce_min_i64(rank as i64).unwrap();
                    let b = t.allreduce_min_i64(10 + rank as i64).unwrap();
                    (a, b)
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), (0, 10));
        }
    }
}
