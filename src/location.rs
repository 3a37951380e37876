use crate::block::BlockId;
use crate::error::Result;

/// Cluster seam for distributed deployments.
///
/// A locator tracks which nodes hold which blocks. The buffer pool
/// announces its own residency changes through it and, on a miss,
/// asks it for peers that may hold a copy before falling back to the
/// local file manager. Single-node deployments run without one.
///
/// Announcement calls are fire-and-forget from the pool's point of
/// view: a locator that loses an announcement degrades remote lookup,
/// never correctness, since the persistent store remains the source
/// of truth.
pub trait BlockLocator: Send + Sync {
    /// Announce that this node serves `domain`. Called once when the
    /// buffer pool starts.
    fn register_domain(&self, domain: u16);

    /// Withdraw this node's claim on `domain`. Called at shutdown.
    fn unregister_domain(&self, domain: u16);

    /// Announce that `block` became resident on this node.
    fn block_added(&self, block: BlockId);

    /// Announce that `block` is no longer resident on this node.
    fn block_removed(&self, block: BlockId);

    /// Network addresses of peers believed to hold `block`, in
    /// preference order. Empty when nothing is known.
    fn peer_addresses(&self, block: BlockId) -> Vec<String>;

    /// Fetch the full image of `block` from `peer`. `Ok(None)` means
    /// the peer answered but no longer holds the block; an `Err` is a
    /// transport failure and the caller may try the next peer.
    fn pull_block(&self, block: BlockId, peer: &str) -> Result<Option<Vec<u8>>>;
}
