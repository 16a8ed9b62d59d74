//! Kademlia routing table: a binary trie of k-buckets over the identifier space.
//!
//! The trie lives in an arena (`Vec<TreeNode>`) addressed by index. Nodes are only
//! ever appended by [RoutingTable::split], never removed, so an index stays valid
//! for the lifetime of the table and upward traversal is done by walking the
//! index path from the root instead of following parent pointers.

use std::slice::Iter;

use tracing::{debug, error, trace};

use crate::common::{Id, Peer, Prefix, ID_BITS};
use crate::{Error, Result};

/// K = the default maximum size of a k-bucket, and the replication factor.
pub const DEFAULT_K: usize = 20;

const ROOT: usize = 0;

/// Maximum number of peers a bucket at `prefix_len` can hold: `min(k, 2^(ID_BITS - prefix_len))`.
///
/// Buckets near the bottom of the trie shrink because their range holds fewer ids.
pub fn max_bucket_size(prefix_len: usize, k: usize) -> usize {
    let remaining_bits = ID_BITS.saturating_sub(prefix_len) as u32;

    1_usize
        .checked_shl(remaining_bits)
        .map_or(k, |range| k.min(range))
}

/// What [RoutingTable::update] did with the observed peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The peer was already known and moved to the tail of its bucket.
    Refreshed,
    /// The peer was appended to a bucket with free room.
    Inserted,
    /// The least recently seen peer did not answer a ping and was replaced.
    Evicted(Peer),
    /// The least recently seen peer is alive, so the new peer was dropped.
    Discarded,
    /// The peer carries this table's own id.
    Ignored,
}

#[derive(Debug, Clone)]
enum TreeNode {
    Leaf(KBucket),
    Internal {
        prefix: Prefix,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
/// Kademlia routing table
pub struct RoutingTable {
    id: Id,
    k: usize,
    nodes: Vec<TreeNode>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] for the node with the given id, starting as a
    /// single empty root bucket.
    pub fn new(id: Id, k: usize) -> Self {
        RoutingTable {
            id,
            k,
            nodes: vec![TreeNode::Leaf(KBucket::new(Prefix::root(), k))],
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node, the table never stores it.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    // === Public Methods ===

    /// Returns the leaf bucket whose prefix matches `id`.
    pub fn find_responsible_node(&self, id: &Id) -> &KBucket {
        self.bucket(self.leaf_index(id))
    }

    /// Returns up to `count` known peers closest to `target`, closest first.
    ///
    /// Starts at the responsible bucket and widens to the enclosing subtree until
    /// enough peers are found or the whole table has been considered.
    pub fn closest_peers(&self, target: &Id, count: usize) -> Vec<Peer> {
        let mut closest = Vec::new();

        for &index in self.path_to(target).iter().rev() {
            closest = self.subtree_closest(index, target, count);

            if closest.len() >= count {
                break;
            }
        }

        closest
    }

    /// Record that `peer` was seen.
    ///
    /// `ping` is called with the least recently seen peer of a full bucket that
    /// cannot be split, and must return whether it is still alive. It may block.
    pub fn update<F>(&mut self, peer: Peer, mut ping: F) -> Result<UpdateOutcome>
    where
        F: FnMut(&Peer) -> bool,
    {
        if peer.id == self.id {
            return Ok(UpdateOutcome::Ignored);
        }

        loop {
            let index = self.leaf_index(&peer.id);
            let own_id = self.id;
            let bucket = self.bucket_mut(index);

            if bucket.contains(&peer.id) {
                bucket.move_to_tail(&peer.id);
                return Ok(UpdateOutcome::Refreshed);
            }

            if !bucket.is_full() {
                bucket.insert(peer);
                trace!(?peer, prefix = %bucket.prefix, "Inserted peer");
                return Ok(UpdateOutcome::Inserted);
            }

            if bucket.in_range(&own_id) {
                self.split(index)?;
                continue;
            }

            let least_recent = bucket.peers[0];

            if ping(&least_recent) {
                bucket.move_to_tail(&least_recent.id);
                trace!(?peer, ?least_recent, "Bucket full, discarded new peer");

                return Ok(UpdateOutcome::Discarded);
            }

            bucket.remove(&least_recent.id);
            bucket.insert(peer);
            debug!(?peer, evicted = ?least_recent, "Evicted unresponsive peer");

            return Ok(UpdateOutcome::Evicted(least_recent));
        }
    }

    /// Returns `true` if this routing table has no peers.
    pub fn is_empty(&self) -> bool {
        self.buckets().all(|bucket| bucket.is_empty())
    }

    /// Return the number of peers in this routing table.
    pub fn size(&self) -> usize {
        self.buckets().map(|bucket| bucket.len()).sum()
    }

    /// Returns an iterator over the leaf buckets of this table.
    pub fn buckets(&self) -> impl Iterator<Item = &KBucket> {
        self.nodes.iter().filter_map(|node| match node {
            TreeNode::Leaf(bucket) => Some(bucket),
            TreeNode::Internal { .. } => None,
        })
    }

    /// Export an owned vector of all peers in this routing table.
    pub fn to_owned_peers(&self) -> Vec<Peer> {
        self.buckets()
            .flat_map(|bucket| bucket.iter().copied())
            .collect()
    }

    // === Private Methods ===

    fn leaf_index(&self, id: &Id) -> usize {
        let mut index = ROOT;

        while let TreeNode::Internal {
            prefix,
            left,
            right,
        } = &self.nodes[index]
        {
            index = if id.bit(prefix.len()) { *right } else { *left };
        }

        index
    }

    /// Indices of the nodes from the root down to the leaf responsible for `id`.
    fn path_to(&self, id: &Id) -> Vec<usize> {
        let mut path = vec![ROOT];
        let mut index = ROOT;

        while let TreeNode::Internal {
            prefix,
            left,
            right,
        } = &self.nodes[index]
        {
            index = if id.bit(prefix.len()) { *right } else { *left };
            path.push(index);
        }

        path
    }

    fn bucket(&self, index: usize) -> &KBucket {
        match &self.nodes[index] {
            TreeNode::Leaf(bucket) => bucket,
            TreeNode::Internal { .. } => unreachable!("leaf_index always ends at a leaf"),
        }
    }

    fn bucket_mut(&mut self, index: usize) -> &mut KBucket {
        match &mut self.nodes[index] {
            TreeNode::Leaf(bucket) => bucket,
            TreeNode::Internal { .. } => unreachable!("leaf_index always ends at a leaf"),
        }
    }

    fn subtree_closest(&self, index: usize, target: &Id, count: usize) -> Vec<Peer> {
        match &self.nodes[index] {
            TreeNode::Leaf(bucket) => bucket.closest(target, count),
            TreeNode::Internal { left, right, .. } => {
                let mut merged = self.subtree_closest(*left, target, count);
                merged.extend(self.subtree_closest(*right, target, count));

                closest_in(&merged, target, count)
            }
        }
    }

    /// Replace the leaf at `index` with two children split on the next bit,
    /// redistributing its peers.
    fn split(&mut self, index: usize) -> Result<()> {
        let bucket = match &self.nodes[index] {
            TreeNode::Leaf(bucket) => bucket,
            TreeNode::Internal { .. } => return Ok(()),
        };
        let prefix = bucket.prefix;

        let (Some(left_prefix), Some(right_prefix)) = (prefix.child(false), prefix.child(true))
        else {
            error!(%prefix, "Tried to split k-bucket with maximum size of 1");
            return Err(Error::SplitAtMaxDepth(prefix.to_string()));
        };

        debug!(%prefix, "Splitting k-bucket");

        let mut left = KBucket::new(left_prefix, self.k);
        let mut right = KBucket::new(right_prefix, self.k);

        for peer in bucket.iter() {
            if peer.id.bit(prefix.len()) {
                right.insert(*peer);
            } else {
                left.insert(*peer);
            }
        }

        let left_index = self.nodes.len();
        self.nodes.push(TreeNode::Leaf(left));
        self.nodes.push(TreeNode::Leaf(right));
        self.nodes[index] = TreeNode::Internal {
            prefix,
            left: left_index,
            right: left_index + 1,
        };

        Ok(())
    }
}

/// Kbuckets hold up to `max_size` peers covering one prefix of the id space,
/// ordered from least to most recently seen.
#[derive(Debug, Clone)]
pub struct KBucket {
    prefix: Prefix,
    max_size: usize,
    /// Peers in the k-bucket, sorted by the least recently seen.
    peers: Vec<Peer>,
}

impl KBucket {
    pub fn new(prefix: Prefix, k: usize) -> Self {
        let max_size = max_bucket_size(prefix.len(), k);

        KBucket {
            prefix,
            max_size,
            peers: Vec::with_capacity(max_size),
        }
    }

    // === Getters ===

    pub fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.max_size
    }

    pub fn iter(&self) -> Iter<'_, Peer> {
        self.peers.iter()
    }

    // === Public Methods ===

    /// Returns `true` if `id` falls in this bucket's range.
    pub fn in_range(&self, id: &Id) -> bool {
        id.starts_with(&self.prefix)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.peers.iter().any(|peer| &peer.id == id)
    }

    /// Returns up to `count` peers of this bucket closest to `target`, closest first.
    pub fn closest(&self, target: &Id, count: usize) -> Vec<Peer> {
        closest_in(&self.peers, target, count)
    }

    // === Private Methods ===

    /// Append a peer if it is not known yet and there is room left.
    fn insert(&mut self, peer: Peer) -> bool {
        if self.contains(&peer.id) || self.is_full() {
            return false;
        }

        self.peers.push(peer);
        true
    }

    fn move_to_tail(&mut self, id: &Id) {
        if let Some(index) = self.peers.iter().position(|peer| &peer.id == id) {
            let peer = self.peers.remove(index);
            self.peers.push(peer);
        }
    }

    fn remove(&mut self, id: &Id) {
        self.peers.retain(|peer| &peer.id != id);
    }
}

/// Keep the `count` peers closest to `target`, replacing the current farthest
/// whenever a strictly closer one shows up, then sort them closest first.
pub fn closest_in(peers: &[Peer], target: &Id, count: usize) -> Vec<Peer> {
    let mut closest: Vec<Peer> = Vec::with_capacity(count.min(peers.len()));

    if count == 0 {
        return closest;
    }

    for peer in peers {
        if closest.len() < count {
            closest.push(*peer);
            continue;
        }

        let farthest = closest
            .iter()
            .enumerate()
            .map(|(index, kept)| (index, kept.id.distance(target)))
            .max_by_key(|(_, distance)| *distance);

        if let Some((index, distance)) = farthest {
            if peer.id.distance(target) < distance {
                closest[index] = *peer;
            }
        }
    }

    closest.sort_by_key(|peer| peer.id.distance(target));
    closest
}
