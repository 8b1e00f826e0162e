//! Global statistics helpers for methods that reduce over the whole volume.
//!
//! Blocks accumulate locally with [`calculate_stats`]; a cross-rank
//! reduction over the communicator combines the per-rank results. Non-finite
//! samples are scrubbed to zero before they enter the accumulation, so a
//! stray NaN cannot poison the reduction.

use crate::comm::{CommError, Communicator, TAG_STATS};
use rustomo_core::Element;

use byteorder::{ByteOrder, LittleEndian};
use ndarray::ArrayView3;

/// Min, max, sum and element count of some scrubbed sample set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockStats {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
}

impl BlockStats {
    pub fn empty() -> Self {
        BlockStats {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            count: 0,
        }
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Combines two accumulations.
    pub fn merge(self, other: BlockStats) -> BlockStats {
        if other.count == 0 {
            return self;
        }
        if self.count == 0 {
            return other;
        }
        BlockStats {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            sum: self.sum + other.sum,
            count: self.count + other.count,
        }
    }

    fn to_bytes(self) -> Vec<u8> {
        let mut out = vec![0_u8; 32];
        LittleEndian::write_f64(&mut out[0..8], self.min);
        LittleEndian::write_f64(&mut out[8..16], self.max);
        LittleEndian::write_f64(&mut out[16..24], self.sum);
        LittleEndian::write_u64(&mut out[24..32], self.count);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CommError> {
        if bytes.len() != 32 {
            return Err(CommError::Malformed(format!(
                "stats payload of {} bytes, expected 32",
                bytes.len()
            )));
        }
        Ok(BlockStats {
            min: LittleEndian::read_f64(&bytes[0..8]),
            max: LittleEndian::read_f64(&bytes[8..16]),
            sum: LittleEndian::read_f64(&bytes[16..24]),
            count: LittleEndian::read_u64(&bytes[24..32]),
        })
    }
}

/// Statistics of one block's samples, with NaN and ±∞ scrubbed to zero.
pub fn calculate_stats<T: Element>(data: ArrayView3<'_, T>) -> BlockStats {
    let mut stats = BlockStats::empty();
    for value in data.iter() {
        let v = value.as_f64();
        let v = if v.is_finite() { v } else { 0.0 };
        stats.min = stats.min.min(v);
        stats.max = stats.max.max(v);
        stats.sum += v;
        stats.count += 1;
    }
    stats
}

/// All-reduce of per-rank statistics; every rank returns the global result.
pub fn reduce_stats(
    local: BlockStats,
    comm: &dyn Communicator,
) -> Result<BlockStats, CommError> {
    if comm.size() == 1 {
        return Ok(local);
    }
    let parts = vec![local.to_bytes(); comm.size()];
    let received = comm.alltoall(TAG_STATS, parts)?;
    let mut global = BlockStats::empty();
    for payload in &received {
        global = global.merge(BlockStats::from_bytes(payload)?);
    }
    Ok(global)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn stats_cover_min_max_sum_count() {
        let data: ndarray::Array3<f32> = Array::from_iter((0..8).map(|v| v as f32))
            .into_shape((2, 2, 2))
            .unwrap();
        let stats = calculate_stats(data.view());
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.max, 7.0);
        assert_eq!(stats.sum, 28.0);
        assert_eq!(stats.count, 8);
        assert_eq!(stats.mean(), 3.5);
    }

    #[test]
    fn non_finite_samples_are_scrubbed() {
        let mut data: ndarray::Array3<f32> = Array::from_elem((1, 2, 2), 1.0);
        data[[0, 0, 0]] = f32::NAN;
        data[[0, 0, 1]] = f32::INFINITY;
        let stats = calculate_stats(data.view());
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.max, 1.0);
        assert_eq!(stats.sum, 2.0);
    }

    #[test]
    fn merge_combines_disjoint_accumulations() {
        let a = BlockStats { min: -1.0, max: 2.0, sum: 3.0, count: 4 };
        let b = BlockStats { min: 0.0, max: 5.0, sum: 10.0, count: 2 };
        let merged = a.merge(b);
        assert_eq!(merged.min, -1.0);
        assert_eq!(merged.max, 5.0);
        assert_eq!(merged.sum, 13.0);
        assert_eq!(merged.count, 6);
        assert_eq!(BlockStats::empty().merge(a), a);
    }

    #[test]
    fn stats_payload_roundtrips() {
        let stats = BlockStats { min: -2.5, max: 9.0, sum: 100.25, count: 42 };
        let back = BlockStats::from_bytes(&stats.to_bytes()).unwrap();
        assert_eq!(back, stats);
    }

    #[test]
    fn reduction_agrees_on_every_rank() {
        use crate::comm::threaded::ThreadedCommunicator;
        use std::thread;

        let handles: Vec<_> = ThreadedCommunicator::create(3)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.rank();
                    let local = BlockStats {
                        min: -(rank as f64),
                        max: rank as f64,
                        sum: 10.0 * rank as f64,
                        count: 5,
                    };
                    reduce_stats(local, &comm).unwrap()
                })
            })
            .collect();
        let results: Vec<BlockStats> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for global in &results {
            assert_eq!(global.min, -2.0);
            assert_eq!(global.max, 2.0);
            assert_eq!(global.sum, 30.0);
            assert_eq!(global.count, 15);
        }
    }
}
