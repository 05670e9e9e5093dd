//! Precomputed guard-zone transfers for the blocks of one rank.
//!
//! The [`ConnectionBuilder`] turns the adjacency tags produced by the
//! geometry layer into per-block lists of transfer descriptors. Transfers
//! between two blocks on the same rank become [`LocalCopyDescriptor`]s, which
//! are cross-linked so that the receiving block can name the message it
//! waits for without re-deriving any geometry. Transfers that cross a rank
//! boundary become [`RemoteCommDescriptor`]s, identified by a
//! [`SequenceTag`] that both ends compute independently.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use log::debug;
use serde::{Deserialize, Serialize};
use crate::error::Error;
use crate::index_space::IndexSpace;
use crate::partition::{BlockId, CopyTag, ExchangeTags, Partition};




/// A same-rank guard-zone copy of `byte_size` bytes, from `source_box` on
/// the source block to `dest_box` on the destination block.
///
/// On a block's send list, `partner_index` is the position of the matching
/// descriptor in the destination block's receive list. On a receive list,
/// it is the position of the matching descriptor in the source block's send
/// list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCopyDescriptor {
    pub source_block: BlockId,
    pub dest_block: BlockId,
    pub source_box: IndexSpace,
    pub dest_box: IndexSpace,
    pub byte_size: usize,
    pub partner_index: usize,
}




/// A guard-zone transfer between blocks on different ranks. `peer_rank` is
/// the rank on the other end: the destination for a send, the source for a
/// receive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommDescriptor {
    pub source_block: BlockId,
    pub dest_block: BlockId,
    pub source_box: IndexSpace,
    pub dest_box: IndexSpace,
    pub byte_size: usize,
    pub peer_rank: usize,
    pub sequence_tag: SequenceTag,
}




/**
 * Deterministic identifier of a cross-rank transfer. The ordinal tells apart
 * several transfers between the same ordered pair of blocks, which happens
 * when a block neighbors another one through more than one periodic image.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceTag {
    pub source: BlockId,
    pub dest: BlockId,
    pub ordinal: u32,
}

impl SequenceTag {

    pub fn new(source: BlockId, dest: BlockId, ordinal: u32) -> Self {
        Self { source, dest, ordinal }
    }

    /// Pack the (source, dest) pair into a single integer, for transports
    /// that only carry integer tags. The result is unique over all ordered
    /// pairs of `num_blocks` blocks, but does not include the ordinal.
    pub fn packed(&self, num_levels: usize, num_blocks: usize) -> u64 {
        let n = num_blocks.max(1) as u64;
        let l = num_levels.max(1) as u64;
        (self.source as u64 * n + self.dest as u64 % n) * l
    }
}




/// The same-rank transfers a block takes part in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConnection {
    pub sends: Vec<LocalCopyDescriptor>,
    pub receives: Vec<LocalCopyDescriptor>,
}




/// The cross-rank transfers a block takes part in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConnection {
    pub sends: Vec<RemoteCommDescriptor>,
    pub receives: Vec<RemoteCommDescriptor>,
}

impl RemoteConnection {
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.receives.is_empty()
    }
}




/// All transfers of one block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockConnections {
    pub local: LocalConnection,
    pub remote: RemoteConnection,
}




/**
 * Builds the connection lists for every block owned by one rank.
 */
pub struct ConnectionBuilder<'a> {
    partition: &'a Partition,
    rank: usize,
    num_fields: usize,
    element_size: usize,
}




// ============================================================================
impl<'a> ConnectionBuilder<'a> {

    pub fn new(partition: &'a Partition, rank: usize) -> Self {
        Self {
            partition,
            rank,
            num_fields: 1,
            element_size: mem::size_of::<f64>(),
        }
    }

    /// Declare the number of fields per index and the size of one field
    /// value, which together determine descriptor byte sizes.
    pub fn with_field_layout(mut self, num_fields: usize, element_size: usize) -> Self {
        self.num_fields = num_fields;
        self.element_size = element_size;
        self
    }

    fn byte_size(&self, region: &IndexSpace) -> usize {
        region.len() * self.num_fields * self.element_size
    }

    /**
     * Build the connections of every locally owned block from the geometry
     * layer's tags. Remote connections are left empty if the partition has a
     * single rank. Any inconsistency in the tags is an error.
     */
    pub fn build(&self, tags: &ExchangeTags) -> Result<BTreeMap<BlockId, BlockConnections>, Error> {
        let owned: Vec<BlockId> = self.partition.local_blocks(self.rank).collect();

        for tag in &tags.local {
            self.validate_tag(tag, self.rank, self.rank)?;
        }

        let mut local = self.build_local(&owned, &tags.local);
        link_partners(&mut local)?;

        let mut remote = if self.partition.num_ranks() > 1 {
            self.build_remote(&owned, tags)?
        } else {
            BTreeMap::new()
        };

        let connections: BTreeMap<_, _> = owned
            .iter()
            .map(|f| (*f, BlockConnections {
                local: local.remove(f).unwrap_or_default(),
                remote: remote.remove(f).unwrap_or_default(),
            }))
            .collect();

        debug!(
            "rank {}: built connections for {} blocks ({} local tags, {} remote tags)",
            self.rank,
            connections.len(),
            tags.local.len(),
            tags.len() - tags.local.len());

        Ok(connections)
    }

    fn validate_tag(&self, tag: &CopyTag, source_rank: usize, dest_rank: usize) -> Result<(), Error> {
        if tag.source_box.dim() != tag.dest_box.dim() {
            return Err(Error::BoxMismatch {
                source: tag.source_box.clone(),
                dest: tag.dest_box.clone(),
            })
        }
        for (block, expected) in [(tag.source_block, source_rank), (tag.dest_block, dest_rank)] {
            let rank = self.partition.owner(block)?;

            if rank != expected {
                return Err(Error::ForeignBlock { block, rank, expected })
            }
        }
        Ok(())
    }

    fn build_local(&self, owned: &[BlockId], tags: &[CopyTag]) -> BTreeMap<BlockId, LocalConnection> {
        let mut counts: HashMap<BlockId, (usize, usize)> = HashMap::new();

        for tag in tags {
            counts.entry(tag.source_block).or_default().0 += 1;
            counts.entry(tag.dest_block).or_default().1 += 1;
        }

        let mut local: BTreeMap<_, _> = owned
            .iter()
            .map(|f| {
                let (ns, nd) = counts.get(f).copied().unwrap_or_default();
                (*f, LocalConnection {
                    sends: Vec::with_capacity(ns),
                    receives: Vec::with_capacity(nd),
                })
            })
            .collect();

        for tag in tags {
            let descriptor = |region: &IndexSpace| LocalCopyDescriptor {
                source_block: tag.source_block,
                dest_block: tag.dest_block,
                source_box: tag.source_box.clone(),
                dest_box: tag.dest_box.clone(),
                byte_size: self.byte_size(region),
                partner_index: 0,
            };
            if let Some(con) = local.get_mut(&tag.source_block) {
                con.sends.push(descriptor(&tag.source_box))
            }
            if let Some(con) = local.get_mut(&tag.dest_block) {
                con.receives.push(descriptor(&tag.dest_box))
            }
        }
        local
    }

    fn build_remote(&self, owned: &[BlockId], tags: &ExchangeTags) -> Result<BTreeMap<BlockId, RemoteConnection>, Error> {
        let sends: Vec<(usize, &Vec<CopyTag>)> = tags.send
            .iter()
            .filter(|(pr, _)| **pr != self.rank)
            .map(|(pr, container)| (*pr, container))
            .collect();
        let recvs: Vec<(usize, &Vec<CopyTag>)> = tags.recv
            .iter()
            .filter(|(pr, _)| **pr != self.rank)
            .map(|(pr, container)| (*pr, container))
            .collect();
        let mut counts: HashMap<BlockId, (usize, usize)> = HashMap::new();

        for &(pr, container) in &sends {
            for tag in container.iter() {
                self.validate_tag(tag, self.rank, pr)?;
                counts.entry(tag.source_block).or_default().0 += 1;
            }
        }
        for &(pr, container) in &recvs {
            for tag in container.iter() {
                self.validate_tag(tag, pr, self.rank)?;
                counts.entry(tag.dest_block).or_default().1 += 1;
            }
        }

        let mut remote: BTreeMap<_, _> = owned
            .iter()
            .map(|f| {
                let (ns, nr) = counts.get(f).copied().unwrap_or_default();
                (*f, RemoteConnection {
                    sends: Vec::with_capacity(ns),
                    receives: Vec::with_capacity(nr),
                })
            })
            .collect();

        for &(pr, container) in &sends {
            for (tag, sequence_tag) in container.iter().zip(sequence_tags(container)) {
                if let Some(con) = remote.get_mut(&tag.source_block) {
                    con.sends.push(self.remote_descriptor(tag, &tag.source_box, pr, sequence_tag))
                }
            }
        }
        for &(pr, container) in &recvs {
            for (tag, sequence_tag) in container.iter().zip(sequence_tags(container)) {
                if let Some(con) = remote.get_mut(&tag.dest_block) {
                    con.receives.push(self.remote_descriptor(tag, &tag.dest_box, pr, sequence_tag))
                }
            }
        }
        Ok(remote)
    }

    fn remote_descriptor(&self, tag: &CopyTag, region: &IndexSpace, peer_rank: usize, sequence_tag: SequenceTag) -> RemoteCommDescriptor {
        RemoteCommDescriptor {
            source_block: tag.source_block,
            dest_block: tag.dest_block,
            source_box: tag.source_box.clone(),
            dest_box: tag.dest_box.clone(),
            byte_size: self.byte_size(region),
            peer_rank,
            sequence_tag,
        }
    }
}




/**
 * Assign sequence tags to a per-peer tag container. The ordinal of a tag is
 * the number of earlier tags in the container with the same (source, dest)
 * pair. The containers on the two ends of a connection list the same tags
 * in the same order, so both ends arrive at the same sequence tags.
 */
pub fn sequence_tags(container: &[CopyTag]) -> Vec<SequenceTag> {
    let mut seen: HashMap<(BlockId, BlockId), u32> = HashMap::new();

    container
        .iter()
        .map(|tag| {
            let ordinal = seen.entry((tag.source_block, tag.dest_block)).or_insert(0);
            let result = SequenceTag::new(tag.source_block, tag.dest_block, *ordinal);
            *ordinal += 1;
            result
        })
        .collect()
}




/**
 * Cross-link the local descriptors of a set of blocks: every send descriptor
 * is matched with the receive descriptor on its destination block that has
 * the same blocks and boxes, and vice versa. A descriptor without a partner
 * means the adjacency input contradicts itself.
 */
pub fn link_partners(local: &mut BTreeMap<BlockId, LocalConnection>) -> Result<(), Error> {
    let same = |a: &LocalCopyDescriptor, b: &LocalCopyDescriptor| {
        a.source_block == b.source_block
            && a.dest_block == b.dest_block
            && a.source_box == b.source_box
            && a.dest_box == b.dest_box
    };

    let mut send_partners = Vec::new();
    let mut recv_partners = Vec::new();

    for (&f, con) in local.iter() {
        for (i, snd) in con.sends.iter().enumerate() {
            let j = local
                .get(&snd.dest_block)
                .and_then(|neighbor| neighbor.receives.iter().position(|rcv| same(snd, rcv)))
                .ok_or_else(|| Error::MissingPartner {
                    block: f,
                    neighbor: snd.dest_block,
                    region: snd.dest_box.clone(),
                })?;
            send_partners.push((f, i, j));
        }
        for (i, rcv) in con.receives.iter().enumerate() {
            let j = local
                .get(&rcv.source_block)
                .and_then(|neighbor| neighbor.sends.iter().position(|snd| same(snd, rcv)))
                .ok_or_else(|| Error::MissingPartner {
                    block: f,
                    neighbor: rcv.source_block,
                    region: rcv.dest_box.clone(),
                })?;
            recv_partners.push((f, i, j));
        }
    }

    for (f, i, j) in send_partners {
        if let Some(con) = local.get_mut(&f) {
            con.sends[i].partner_index = j
        }
    }
    for (f, i, j) in recv_partners {
        if let Some(con) = local.get_mut(&f) {
            con.receives[i].partner_index = j
        }
    }
    Ok(())
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::index_space::range2d;
    use crate::partition::{Block, Periodicity};
    use proptest::prelude::*;

    fn build(partition: &Partition, periodicity: Periodicity, rank: usize) -> BTreeMap<BlockId, BlockConnections> {
        let tags = ExchangeTags::compute(partition, &periodicity, rank);
        ConnectionBuilder::new(partition, rank)
            .with_field_layout(2, 8)
            .build(&tags)
            .unwrap()
    }

    #[test]
    fn local_sends_and_receives_are_symmetric() {
        let partition = Partition::uniform(range2d(0..12, 0..12), (3, 3), 1, 2).unwrap();
        let connections = build(&partition, Periodicity::all(), 0);

        for (&f, con) in &connections {
            let pointing_back = connections
                .values()
                .flat_map(|c| c.local.receives.iter())
                .filter(|rcv| rcv.source_block == f)
                .count();
            assert_eq!(con.local.sends.len(), pointing_back);

            for (i, snd) in con.local.sends.iter().enumerate() {
                let rcv = &connections[&snd.dest_block].local.receives[snd.partner_index];
                assert_eq!(rcv.source_block, f);
                assert_eq!(rcv.partner_index, i);
                assert_eq!(rcv.dest_box, snd.dest_box);
                assert_eq!(rcv.byte_size, snd.byte_size);
            }
        }
    }

    #[test]
    fn byte_size_counts_points_fields_and_element_size() {
        let partition = Partition::uniform(range2d(0..8, 0..4), (2, 1), 1, 1).unwrap();
        let connections = build(&partition, Periodicity::none(), 0);
        let snd = &connections[&0].local.sends[0];
        assert_eq!(snd.dest_box, range2d(4..5, 0..4));
        assert_eq!(snd.byte_size, 4 * 2 * 8);
    }

    #[test]
    fn lists_are_sized_exactly() {
        let partition = Partition::uniform(range2d(0..8, 0..8), (2, 2), 1, 1).unwrap();
        let connections = build(&partition, Periodicity::all(), 0);

        for con in connections.values() {
            assert_eq!(con.local.sends.len(), 8);
            assert_eq!(con.local.sends.capacity(), 8);
            assert_eq!(con.local.receives.capacity(), 8);
        }
    }

    #[test]
    fn single_rank_skips_remote_connections() {
        let partition = Partition::uniform(range2d(0..8, 0..8), (2, 2), 1, 1).unwrap();
        let connections = build(&partition, Periodicity::all(), 0);
        assert!(connections.values().all(|c| c.remote.is_empty()));
    }

    #[test]
    fn remote_tags_agree_between_ranks() {
        let partition = Partition::uniform(range2d(0..8, 0..8), (2, 2), 2, 1).unwrap();
        let rank0 = build(&partition, Periodicity::all(), 0);
        let rank1 = build(&partition, Periodicity::all(), 1);

        for (views, peers) in [(&rank0, &rank1), (&rank1, &rank0)] {
            for con in views.values() {
                for snd in &con.remote.sends {
                    let rcv = peers[&snd.dest_block]
                        .remote
                        .receives
                        .iter()
                        .find(|r| r.source_box == snd.source_box && r.dest_box == snd.dest_box)
                        .unwrap();
                    assert_eq!(rcv.sequence_tag, snd.sequence_tag);
                    assert_eq!(rcv.byte_size, snd.byte_size);
                }
            }
        }
    }

    #[test]
    fn periodic_duplicates_get_distinct_ordinals() {
        let partition = Partition::uniform(range2d(0..8, 0..4), (2, 1), 2, 1).unwrap();
        let connections = build(&partition, Periodicity { i: true, j: false }, 0);
        let sends = &connections[&0].remote.sends;

        assert_eq!(sends.len(), 2);
        assert_eq!(sends[0].sequence_tag.ordinal, 0);
        assert_eq!(sends[1].sequence_tag.ordinal, 1);
        assert_eq!(sends[0].peer_rank, 1);
    }

    #[test]
    fn unmatched_descriptor_is_fatal() {
        let mut local = BTreeMap::new();
        local.insert(0, LocalConnection {
            sends: vec![LocalCopyDescriptor {
                source_block: 0,
                dest_block: 1,
                source_box: range2d(0..1, 0..4),
                dest_box: range2d(4..5, 0..4),
                byte_size: 32,
                partner_index: 0,
            }],
            receives: vec![],
        });
        local.insert(1, LocalConnection::default());

        match link_partners(&mut local) {
            Err(Error::MissingPartner { block: 0, neighbor: 1, .. }) => {}
            other => panic!("expected a missing partner, got {:?}", other),
        }
    }

    #[test]
    fn tag_with_mismatched_boxes_is_fatal() {
        let partition = Partition::new(
            range2d(0..8, 0..4),
            vec![
                Block { rank: 0, space: range2d(0..4, 0..4) },
                Block { rank: 0, space: range2d(4..8, 0..4) },
            ],
            1).unwrap();
        let mut tags = ExchangeTags::default();
        tags.local.push(CopyTag {
            source_block: 0,
            dest_block: 1,
            source_box: range2d(3..4, 0..4),
            dest_box: range2d(3..4, 0..3),
        });
        assert!(matches!(
            ConnectionBuilder::new(&partition, 0).build(&tags),
            Err(Error::BoxMismatch { .. })));
    }

    #[test]
    fn tag_naming_a_foreign_block_is_fatal() {
        let partition = Partition::uniform(range2d(0..8, 0..4), (2, 1), 2, 1).unwrap();
        let mut tags = ExchangeTags::compute(&partition, &Periodicity::none(), 0);
        let stray = tags.send[&1][0].clone();
        tags.local.push(stray);
        assert!(matches!(
            ConnectionBuilder::new(&partition, 0).build(&tags),
            Err(Error::ForeignBlock { block: 1, rank: 1, expected: 0 })));
    }

    #[test]
    fn tag_naming_a_block_outside_the_partition_is_fatal() {
        let partition = Partition::uniform(range2d(0..8, 0..4), (2, 1), 1, 1).unwrap();
        let mut tags = ExchangeTags::default();
        tags.local.push(CopyTag {
            source_block: partition.len(),
            dest_block: 0,
            source_box: range2d(8..9, 0..4),
            dest_box: range2d(-1..0, 0..4),
        });
        assert!(matches!(
            ConnectionBuilder::new(&partition, 0).build(&tags),
            Err(Error::UnknownBlock(2))));
    }

    proptest! {
        #[test]
        fn packed_tags_are_unique(num_blocks in 1usize..48, num_levels in 1usize..4) {
            let mut seen = std::collections::HashSet::new();

            for s in 0..num_blocks {
                for d in 0..num_blocks {
                    let packed = SequenceTag::new(s, d, 0).packed(num_levels, num_blocks);
                    prop_assert!(seen.insert(packed));
                }
            }
        }

        #[test]
        fn sequence_tags_match_on_both_ends(num_blocks in 2usize..7, num_ranks in 2usize..4, periodic in any::<bool>()) {
            prop_assume!(num_ranks <= num_blocks);

            let partition = Partition::uniform(range2d(0..4 * num_blocks as i64, 0..4), (num_blocks, 1), num_ranks, 1).unwrap();
            let periodicity = Periodicity { i: periodic, j: false };
            let views: Vec<_> = (0..num_ranks)
                .rev()
                .map(|rank| (rank, ExchangeTags::compute(&partition, &periodicity, rank)))
                .collect();

            for (rank, tags) in &views {
                for (peer, container) in &tags.send {
                    let (_, theirs) = views.iter().find(|(r, _)| r == peer).unwrap();
                    prop_assert_eq!(sequence_tags(container), sequence_tags(&theirs.recv[rank]));
                }
            }
        }
    }
}
