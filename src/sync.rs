//! Chain synchronization
//!
//! Turns inbound peer messages into ledger and mempool updates plus the replies the
//! node should send. Catching up is a bounded sequential replay: the next batch is
//! requested only once the current one is applied. A batch that does not attach to
//! our tip is held per peer while earlier blocks are fetched, until it links to a
//! block we have, at which point fork choice decides.

use crate::blockchain::{Block, Ledger};
use crate::crypto::short_hex;
use crate::error::ChainError;
use crate::fork_choice::{find_fork_point, resolve_fork};
use crate::mempool::Mempool;
use crate::network::{Handshake, Message, PeerId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// What we know about one connected peer's chain.
#[derive(Debug, Clone)]
pub struct PeerSyncInfo {
    pub peer: PeerId,
    pub height: u64,
    pub last_seen: Instant,
    pub blocks_received: u64,
    pub sync_failures: u32,
    pub is_syncing: bool,
}

impl PeerSyncInfo {
    pub fn new(peer: PeerId, height: u64) -> Self {
        Self {
            peer,
            height,
            last_seen: Instant::now(),
            blocks_received: 0,
            sync_failures: 0,
            is_syncing: false,
        }
    }

    /// Three failed batches or forks and the peer gets dropped.
    pub fn is_unreliable(&self) -> bool {
        self.sync_failures >= 3
    }

    /// Nothing heard for five minutes.
    pub fn is_stale(&self) -> bool {
        self.last_seen.elapsed() > Duration::from_secs(300)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub total_blocks_synced: u64,
    pub reorgs: u64,
    pub rejected_blocks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    Synced,
    Failed,
}

/// Something the node should do on the network after handling a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Send { peer: PeerId, message: Message },
    Broadcast { message: Message, except: Option<PeerId> },
    Drop { peer: PeerId },
}

pub struct SyncManager {
    ledger: Arc<RwLock<Ledger>>,
    mempool: Arc<Mempool>,
    peers: Arc<RwLock<HashMap<PeerId, PeerSyncInfo>>>,
    /// Blocks from a peer that do not attach to our chain yet, ascending and contiguous.
    fork_stash: Arc<RwLock<HashMap<PeerId, Vec<Block>>>>,
    sync_state: Arc<RwLock<SyncState>>,
    stats: Arc<RwLock<SyncStats>>,
    batch_size: usize,
}

impl SyncManager {
    pub fn new(ledger: Arc<RwLock<Ledger>>, mempool: Arc<Mempool>, batch_size: usize) -> Self {
        Self {
            ledger,
            mempool,
            peers: Arc::new(RwLock::new(HashMap::new())),
            fork_stash: Arc::new(RwLock::new(HashMap::new())),
            sync_state: Arc::new(RwLock::new(SyncState::Idle)),
            stats: Arc::new(RwLock::new(SyncStats::default())),
            batch_size: batch_size.max(1),
        }
    }

    pub async fn handle_message(&self, peer: &str, message: Message) -> Vec<Outbound> {
        self.touch(peer).await;
        match message {
            Message::Handshake(handshake) => self.on_handshake(peer, &handshake).await,
            Message::NewBlock(block) => self.on_new_block(peer, block).await,
            Message::NewTransaction(tx) => {
                let hash = tx.hash_str();
                match self.mempool.admit(tx.clone()) {
                    Ok(outcome) if outcome.is_new() => vec![Outbound::Broadcast {
                        message: Message::NewTransaction(tx),
                        except: Some(peer.to_string()),
                    }],
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        debug!("Transaction {} from {} not admitted: {}", hash, peer, e);
                        Vec::new()
                    }
                }
            }
            Message::SyncRequest { from_height } => {
                let blocks = self.ledger.read().await.blocks_from(from_height, self.batch_size);
                vec![Outbound::Send {
                    peer: peer.to_string(),
                    message: Message::SyncResponse { blocks },
                }]
            }
            Message::SyncResponse { blocks } => self.on_blocks(peer, blocks).await,
        }
    }

    /// Register a newly connected peer and start catching up if it is ahead.
    pub async fn on_handshake(&self, peer: &str, handshake: &Handshake) -> Vec<Outbound> {
        {
            let mut peers = self.peers.write().await;
            let info = peers
                .entry(peer.to_string())
                .or_insert_with(|| PeerSyncInfo::new(peer.to_string(), handshake.height));
            info.height = handshake.height;
            info.last_seen = Instant::now();
        }

        let (height, tip) = {
            let ledger = self.ledger.read().await;
            (ledger.height(), ledger.tip_hash())
        };
        if handshake.height > height {
            info!(
                "Peer {} is at height {}, we are at {}; syncing",
                peer, handshake.height, height
            );
            self.set_sync_state(SyncState::Syncing).await;
            self.request(peer, height + 1).await
        } else if handshake.height == height && handshake.tip_hash != tip && height > 0 {
            // Same height, different tip: fetch their tip and let fork choice compare.
            self.request(peer, height).await
        } else {
            Vec::new()
        }
    }

    async fn on_new_block(&self, peer: &str, block: Block) -> Vec<Outbound> {
        let height = block.height();
        self.update_peer_height(peer, height).await;
        let (local, known) = {
            let ledger = self.ledger.read().await;
            (ledger.height(), ledger.contains_block(&block.hash()))
        };
        if known {
            return Vec::new();
        }
        if height > local + 1 {
            self.set_sync_state(SyncState::Syncing).await;
            return self.request(peer, local + 1).await;
        }

        let mut actions = self.on_blocks(peer, vec![block.clone()]).await;
        if self.ledger.read().await.contains_block(&block.hash()) {
            actions.push(Outbound::Broadcast {
                message: Message::NewBlock(block),
                except: Some(peer.to_string()),
            });
        }
        actions
    }

    /// Handle a run of blocks from `peer`, either a sync response or a gossiped block.
    pub async fn on_blocks(&self, peer: &str, blocks: Vec<Block>) -> Vec<Outbound> {
        let stashed = self.fork_stash.write().await.remove(peer);
        let blocks = match stashed {
            Some(stash) => Self::merge(stash, blocks),
            None => blocks,
        };
        if blocks.is_empty() {
            self.refresh_state().await;
            return Vec::new();
        }
        if let Some(last) = blocks.last() {
            self.update_peer_height(peer, last.height()).await;
        }

        let mut ledger = self.ledger.write().await;
        let Some((fork_height, first_new)) = find_fork_point(&ledger, &blocks) else {
            if blocks.iter().all(|b| ledger.contains_block(&b.hash())) {
                let next = blocks.last().map_or(0, |b| b.height()) + 1;
                drop(ledger);
                return self.continue_if_behind(peer, next).await;
            }
            return self.search_backwards(&ledger, peer, blocks).await;
        };
        let branch: Vec<Block> = blocks.into_iter().skip(first_new).collect();

        if fork_height == ledger.height() {
            return self.extend(ledger, peer, branch).await;
        }

        // The branch forks below our tip. Fetch the rest of it before deciding.
        let branch_tip = fork_height + branch.len() as u64;
        let advertised = self.peer_height(peer).await.unwrap_or(branch_tip);
        if branch_tip < advertised && branch.len() < self.max_stash(&ledger) {
            self.fork_stash.write().await.insert(peer.to_string(), branch);
            drop(ledger);
            return self.request(peer, branch_tip + 1).await;
        }

        match resolve_fork(&mut ledger, &self.mempool, fork_height, branch) {
            Ok(outcome) => {
                self.stats.write().await.reorgs += 1;
                let height = ledger.height();
                drop(ledger);
                info!(
                    "Reorganised onto {} from peer {} (depth {})",
                    short_hex(&outcome.new_tip),
                    peer,
                    outcome.depth
                );
                self.continue_if_behind(peer, height + 1).await
            }
            Err(e) => {
                drop(ledger);
                warn!("Fork from peer {} at height {} rejected: {}", peer, fork_height, e);
                self.record_sync_failure(peer).await;
                self.refresh_state().await;
                Vec::new()
            }
        }
    }

    /// Apply `branch` on top of our tip, stopping at the first invalid block.
    async fn extend(
        &self,
        mut ledger: tokio::sync::RwLockWriteGuard<'_, Ledger>,
        peer: &str,
        branch: Vec<Block>,
    ) -> Vec<Outbound> {
        let mut applied = 0u64;
        let mut failure: Option<ChainError> = None;
        for block in branch {
            match ledger.apply_block(block) {
                Ok(delta) => {
                    self.mempool.on_commit(&delta.included);
                    applied += 1;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let height = ledger.height();
        drop(ledger);

        if applied > 0 {
            let mut stats = self.stats.write().await;
            stats.total_blocks_synced += applied;
            drop(stats);
            self.record_blocks_received(peer, applied).await;
        }
        if let Some(e) = failure {
            debug!("Stopped syncing from {} at height {}: {}", peer, height + 1, e);
            self.stats.write().await.rejected_blocks += 1;
            self.record_sync_failure(peer).await;
            self.refresh_state().await;
            return Vec::new();
        }
        self.continue_if_behind(peer, height + 1).await
    }

    /// `blocks` have no known parent: hold them and ask for the batch just below.
    async fn search_backwards(&self, ledger: &Ledger, peer: &str, blocks: Vec<Block>) -> Vec<Outbound> {
        let lowest = blocks.first().map_or(0, |b| b.height());
        let local = ledger.height();
        let deepest_fork = lowest.saturating_sub(1);
        let advertised = self.peer_height(peer).await.unwrap_or(0);
        let recovery = advertised >= local + ledger.params().network_recovery_threshold;
        let too_deep = local.saturating_sub(deepest_fork) > ledger.params().max_reorg_depth && !recovery;

        if lowest <= 1 || too_deep || blocks.len() > self.max_stash(ledger) {
            warn!(
                "Peer {} sent blocks from height {} that never attach to our chain",
                peer, lowest
            );
            self.record_sync_failure(peer).await;
            return Vec::new();
        }

        let from = lowest.saturating_sub(self.batch_size as u64).max(1);
        debug!(
            "Blocks from {} at {} do not attach; fetching from {}",
            peer, lowest, from
        );
        self.fork_stash.write().await.insert(peer.to_string(), blocks);
        self.request(peer, from).await
    }

    /// Join a stashed run with a new one when they link up, in either direction.
    fn merge(stash: Vec<Block>, blocks: Vec<Block>) -> Vec<Block> {
        let (Some(stash_first), Some(stash_last)) = (stash.first(), stash.last()) else {
            return blocks;
        };
        match (blocks.first(), blocks.last()) {
            (Some(_), Some(last)) if last.hash() == stash_first.header.previous_hash => {
                let mut merged = blocks;
                merged.extend(stash);
                merged
            }
            (Some(first), Some(_)) if first.header.previous_hash == stash_last.hash() => {
                let mut merged = stash;
                merged.extend(blocks);
                merged
            }
            _ => blocks,
        }
    }

    fn max_stash(&self, ledger: &Ledger) -> usize {
        let params = ledger.params();
        (params.max_reorg_depth + params.network_recovery_threshold) as usize + self.batch_size
    }

    async fn continue_if_behind(&self, peer: &str, next: u64) -> Vec<Outbound> {
        match self.peer_height(peer).await {
            Some(height) if height >= next => self.request(peer, next).await,
            _ => {
                self.refresh_state().await;
                Vec::new()
            }
        }
    }

    async fn request(&self, peer: &str, from_height: u64) -> Vec<Outbound> {
        self.set_peer_syncing(peer, true).await;
        vec![Outbound::Send {
            peer: peer.to_string(),
            message: Message::SyncRequest { from_height },
        }]
    }

    async fn refresh_state(&self) {
        let height = self.ledger.read().await.height();
        let state = self.check_sync_health(height).await;
        self.set_sync_state(state).await;
    }

    async fn touch(&self, peer: &str) {
        if let Some(info) = self.peers.write().await.get_mut(peer) {
            info.last_seen = Instant::now();
        }
    }

    async fn update_peer_height(&self, peer: &str, height: u64) {
        if let Some(info) = self.peers.write().await.get_mut(peer) {
            info.height = info.height.max(height);
        }
    }

    async fn peer_height(&self, peer: &str) -> Option<u64> {
        self.peers.read().await.get(peer).map(|p| p.height)
    }

    async fn set_peer_syncing(&self, peer: &str, syncing: bool) {
        if let Some(info) = self.peers.write().await.get_mut(peer) {
            info.is_syncing = syncing;
        }
    }

    async fn record_blocks_received(&self, peer: &str, count: u64) {
        if let Some(info) = self.peers.write().await.get_mut(peer) {
            info.blocks_received += count;
        }
    }

    /// Count a bad batch or rejected fork against `peer` and forget its stash.
    pub async fn record_sync_failure(&self, peer: &str) {
        let mut peers = self.peers.write().await;
        if let Some(info) = peers.get_mut(peer) {
            info.sync_failures += 1;
            info.is_syncing = false;
            if info.is_unreliable() {
                warn!("Peer {} marked as unreliable", peer);
            }
        }
        drop(peers);
        self.fork_stash.write().await.remove(peer);
    }

    /// Forget a disconnected peer, including any half-fetched fork from it.
    pub async fn remove_peer(&self, peer: &str) {
        self.peers.write().await.remove(peer);
        if self.fork_stash.write().await.remove(peer).is_some() {
            debug!("Discarded pending fork blocks from {}", peer);
        }
    }

    /// Highest reliable, recently seen peer.
    pub async fn get_best_peer(&self) -> Option<PeerId> {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|p| !p.is_unreliable() && !p.is_stale())
            .max_by_key(|p| p.height)
            .map(|p| p.peer.clone())
    }

    /// Peers that are stale or have failed too often.
    pub async fn peers_to_drop(&self) -> Vec<PeerId> {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|p| p.is_unreliable() || p.is_stale())
            .map(|p| p.peer.clone())
            .collect()
    }

    /// Where `local_height` stands against the reliable peers.
    pub async fn check_sync_health(&self, local_height: u64) -> SyncState {
        let peers = self.peers.read().await;
        if peers.is_empty() {
            return SyncState::Idle;
        }
        let reliable: Vec<&PeerSyncInfo> = peers.values().filter(|p| !p.is_unreliable()).collect();
        if reliable.is_empty() {
            return SyncState::Failed;
        }
        let best = reliable.iter().map(|p| p.height).max().unwrap_or(0);
        if local_height >= best {
            SyncState::Synced
        } else {
            let lag = best - local_height;
            if lag > 100 {
                warn!("Node is {} blocks behind best peer", lag);
            }
            SyncState::Syncing
        }
    }

    pub async fn get_sync_state(&self) -> SyncState {
        *self.sync_state.read().await
    }

    async fn set_sync_state(&self, state: SyncState) {
        *self.sync_state.write().await = state;
    }

    pub async fn get_stats(&self) -> SyncStats {
        self.stats.read().await.clone()
    }

    pub async fn get_peer_info(&self, peer: &str) -> Option<PeerSyncInfo> {
        self.peers.read().await.get(peer).cloned()
    }

    pub async fn has_pending_fork(&self, peer: &str) -> bool {
        self.fork_stash.read().await.contains_key(peer)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}
