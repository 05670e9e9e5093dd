use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use crate::error::Error;
use crate::index_space::{Axis, IndexSpace};




/// Index of a block in the global partition. Stable for the lifetime of the
/// partition.
pub type BlockId = usize;




/// A rectangular subdomain of the partition, and the rank that owns it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub rank: usize,
    pub space: IndexSpace,
}




/// Which domain boundaries wrap around to the opposite side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Periodicity {
    pub i: bool,
    pub j: bool,
}

impl Periodicity {

    pub fn none() -> Self {
        Self { i: false, j: false }
    }

    pub fn all() -> Self {
        Self { i: true, j: true }
    }

    pub fn is_periodic(&self, axis: Axis) -> bool {
        match axis {
            Axis::I => self.i,
            Axis::J => self.j,
        }
    }

    /// Return the offsets by which a block's image is shifted to find its
    /// periodic neighbors in the given domain. Enough images are generated
    /// on each periodic axis to cover `num_guard` zones, even when that is
    /// wider than the domain. The zero shift always comes first.
    pub fn shifts(&self, domain: &IndexSpace, num_guard: i64) -> Vec<(i64, i64)> {
        let images = |axis: Axis| {
            let range = domain.range(axis);
            let period = range.end - range.start;

            if !self.is_periodic(axis) || period == 0 {
                return vec![0]
            }
            let reach = ((num_guard + period - 1) / period).max(1);
            let mut offsets = vec![0];

            for k in 1..=reach {
                offsets.push(-k * period);
                offsets.push(k * period);
            }
            offsets
        };
        let (si, sj) = (images(Axis::I), images(Axis::J));

        si.iter()
            .flat_map(|a| sj.iter().map(move |b| (*a, *b)))
            .collect()
    }
}




/**
 * A static assignment of blocks to ranks, within a rectangular domain. Every
 * block carries `num_guard` guard zones on each side, which are filled from
 * the neighboring blocks (or their periodic images).
 */
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Partition {
    domain: IndexSpace,
    blocks: Vec<Block>,
    num_guard: i64,
    num_levels: usize,
}




// ============================================================================
impl Partition {

    /**
     * Create a partition from an explicit list of blocks. Blocks must lie
     * inside the domain and must not overlap one another.
     */
    pub fn new(domain: IndexSpace, blocks: Vec<Block>, num_guard: i64) -> Result<Self, Error> {
        if num_guard < 0 {
            return Err(Error::InvalidPartition(format!("negative guard count {}", num_guard)))
        }
        for (n, block) in blocks.iter().enumerate() {
            if block.space.is_empty() || !domain.contains_space(&block.space) {
                return Err(Error::InvalidPartition(format!(
                    "block {} {} is empty or outside the domain {}", n, block.space, domain)))
            }
            if let Some(m) = blocks[..n].iter().position(|b| b.space.intersect(&block.space).is_some()) {
                return Err(Error::InvalidPartition(format!("blocks {} and {} overlap", m, n)))
            }
        }
        Ok(Self { domain, blocks, num_guard, num_levels: 1 })
    }

    /**
     * Cut the domain into a uniform grid of equally sized blocks, assigned to
     * ranks in contiguous chunks of the row-major block ordering.
     */
    pub fn uniform(domain: IndexSpace, num_blocks: (usize, usize), num_ranks: usize, num_guard: i64) -> Result<Self, Error> {
        let (l, m) = domain.dim();
        let (p, q) = num_blocks;

        if p == 0 || q == 0 || l % p != 0 || m % q != 0 {
            return Err(Error::InvalidPartition(format!(
                "a {}x{} domain cannot be cut into {}x{} blocks", l, m, p, q)))
        }
        if num_ranks == 0 || num_ranks > p * q {
            return Err(Error::InvalidPartition(format!(
                "{} ranks cannot share {} blocks", num_ranks, p * q)))
        }
        let (di, dj) = ((l / p) as i64, (m / q) as i64);
        let (i0, j0) = domain.start();
        let total = p * q;

        let blocks = (0..total)
            .map(|n| {
                let (a, b) = ((n / q) as i64, (n % q) as i64);
                let space = IndexSpace::new(
                    i0 + a * di .. i0 + (a + 1) * di,
                    j0 + b * dj .. j0 + (b + 1) * dj);
                Block { rank: n * num_ranks / total, space }
            })
            .collect();

        Self::new(domain, blocks, num_guard)
    }

    /// Declare how many refinement levels the partition belongs to. This
    /// only enters the packed integer form of message tags.
    pub fn with_levels(mut self, num_levels: usize) -> Self {
        self.num_levels = num_levels.max(1);
        self
    }

    pub fn domain(&self) -> &IndexSpace {
        &self.domain
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> Result<&Block, Error> {
        self.blocks.get(id).ok_or(Error::UnknownBlock(id))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn num_guard(&self) -> i64 {
        self.num_guard
    }

    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    /// Return the number of ranks participating in the partition.
    pub fn num_ranks(&self) -> usize {
        self.blocks.iter().map(|b| b.rank + 1).max().unwrap_or(1)
    }

    /// Return the rank that owns the given block.
    pub fn owner(&self, id: BlockId) -> Result<usize, Error> {
        self.block(id).map(|b| b.rank)
    }

    /// Return the ids of the blocks owned by the given rank, in ascending
    /// order.
    pub fn local_blocks(&self, rank: usize) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(move |(_, b)| b.rank == rank)
            .map(|(n, _)| n)
    }

    /// Return the index space of a block including its guard zones.
    pub fn extended_space(&self, id: BlockId) -> Result<IndexSpace, Error> {
        self.block(id).map(|b| b.space.extend_all(self.num_guard))
    }
}




/**
 * One guard-zone transfer implied by the geometry: the values in
 * `source_box` of the source block's valid region fill `dest_box` of the
 * destination block's guard zones. The two boxes have the same shape, and
 * differ by a periodic shift if the transfer wraps around the domain.
 */
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyTag {
    pub source_block: BlockId,
    pub dest_block: BlockId,
    pub source_box: IndexSpace,
    pub dest_box: IndexSpace,
}




/**
 * The adjacency tags seen from one rank: transfers between two of its own
 * blocks, and per-peer lists of transfers it sends or receives. Every rank
 * enumerates transfers in the same global order, so the per-peer lists on
 * the two ends of a connection come out in matching order.
 */
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExchangeTags {
    pub local: Vec<CopyTag>,
    pub send: BTreeMap<usize, Vec<CopyTag>>,
    pub recv: BTreeMap<usize, Vec<CopyTag>>,
}




// ============================================================================
impl ExchangeTags {

    /**
     * Compute the guard-zone transfers for the given rank. For each
     * destination block, the guard-extended region is intersected with
     * every other block (and with every periodic image of every block,
     * including the destination itself).
     */
    pub fn compute(partition: &Partition, periodicity: &Periodicity, rank: usize) -> Self {
        let mut tags = Self::default();
        let shifts = periodicity.shifts(partition.domain(), partition.num_guard());

        for (dest, d) in partition.blocks().iter().enumerate() {
            let extended = d.space.extend_all(partition.num_guard());

            for &shift in &shifts {
                for (source, s) in partition.blocks().iter().enumerate() {
                    if source == dest && shift == (0, 0) {
                        continue;
                    }
                    if d.rank != rank && s.rank != rank {
                        continue;
                    }
                    if let Some(dest_box) = extended.intersect(&s.space.translate(shift)) {
                        let tag = CopyTag {
                            source_block: source,
                            dest_block: dest,
                            source_box: dest_box.translate((-shift.0, -shift.1)),
                            dest_box,
                        };
                        if s.rank == d.rank {
                            tags.local.push(tag)
                        } else if s.rank == rank {
                            tags.send.entry(d.rank).or_default().push(tag)
                        } else {
                            tags.recv.entry(s.rank).or_default().push(tag)
                        }
                    }
                }
            }
        }
        tags
    }

    /// Return the total number of transfers this rank takes part in.
    pub fn len(&self) -> usize {
        self.local.len()
            + self.send.values().map(Vec::len).sum::<usize>()
            + self.recv.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
