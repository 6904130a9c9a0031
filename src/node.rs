use crate::blockchain::{now_ms, Block, Ledger};
use crate::config::Config;
use crate::crypto::{short_hex, KeyPair};
use crate::error::{ChainError, NetworkError};
use crate::mempool::{AdmitOutcome, Mempool};
use crate::network::{Message, NetworkEvent, NetworkNode};
use crate::persistence::{FileStore, Persistence};
use crate::sync::{Outbound, SyncManager, SyncState};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Syncing,
    Ready,
}

pub struct Node {
    pub config: Config,
    pub keypair: Arc<KeyPair>,
    pub ledger: Arc<RwLock<Ledger>>,
    pub mempool: Arc<Mempool>,
    pub sync: Arc<SyncManager>,
    pub network: Arc<NetworkNode>,
    pub state: Arc<RwLock<NodeState>>,
    events: Mutex<Option<mpsc::Receiver<NetworkEvent>>>,
}

impl Node {
    /// Open the chain under `storage.data_dir` and wire up the components.
    pub fn init(config: Config) -> Result<Self, ChainError> {
        let store = FileStore::open(&config.storage.data_dir)?;
        Self::with_store(config, Box::new(store))
    }

    pub fn with_store(config: Config, store: Box<dyn Persistence>) -> Result<Self, ChainError> {
        config.validate()?;
        let keypair = Arc::new(config.validator.keypair()?);
        let genesis = config.genesis.to_spec()?;
        let ledger = Ledger::open(config.chain.clone(), &genesis, store)?;

        let mempool = Arc::new(Mempool::new(
            ledger.snapshot_handle(),
            config.mempool.max_size,
            Duration::from_secs(config.mempool.retention_secs),
        ));
        let ledger = Arc::new(RwLock::new(ledger));
        let sync = Arc::new(SyncManager::new(
            Arc::clone(&ledger),
            Arc::clone(&mempool),
            config.chain.max_sync_batch,
        ));
        let (network, events) = NetworkNode::new(config.network.clone(), Arc::clone(&keypair), Arc::clone(&ledger));

        info!(
            "Node {} ready on chain {}",
            short_hex(&keypair.address()),
            config.chain.chain_id
        );
        Ok(Self {
            config,
            keypair,
            ledger,
            mempool,
            sync,
            network: Arc::new(network),
            state: Arc::new(RwLock::new(NodeState::Booting)),
            events: Mutex::new(Some(events)),
        })
    }

    /// Run the node until the P2P listener fails.
    pub async fn start(self: Arc<Self>) -> Result<(), ChainError> {
        let events = self
            .events
            .lock()
            .take()
            .ok_or_else(|| ChainError::ConfigError("node already started".to_string()))?;

        let bind = format!("{}:{}", self.config.network.listen_addr, self.config.network.p2p_port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| ChainError::ConfigError(format!("P2P port {} unavailable: {}", bind, e)))?;
        let server = tokio::spawn(Arc::clone(&self.network).start_server(listener));

        for peer in &self.config.network.bootstrap_peers {
            tokio::spawn(Arc::clone(&self.network).maintain_peer(peer.clone()));
        }

        *self.state.write().await = if self.config.network.bootstrap_peers.is_empty() {
            NodeState::Ready
        } else {
            NodeState::Syncing
        };

        if self.config.validator.enabled {
            let node = Arc::clone(&self);
            tokio::spawn(async move { node.proposer_loop().await });
        }
        let node = Arc::clone(&self);
        tokio::spawn(async move { node.maintenance_loop().await });

        let node = Arc::clone(&self);
        tokio::spawn(async move { node.event_loop(events).await });

        match server.await {
            Ok(result) => result,
            Err(e) => Err(NetworkError::Transport(format!("P2P server task failed: {}", e)).into()),
        }
    }

    async fn event_loop(&self, mut events: mpsc::Receiver<NetworkEvent>) {
        while let Some(event) = events.recv().await {
            let actions = match event {
                NetworkEvent::Connected { peer, handshake } => self.sync.on_handshake(&peer, &handshake).await,
                NetworkEvent::Message { peer, message } => {
                    if let Message::Handshake(handshake) = &message {
                        self.sync.on_handshake(&peer, handshake).await
                    } else {
                        self.sync.handle_message(&peer, message).await
                    }
                }
                NetworkEvent::Disconnected { peer } => {
                    self.sync.remove_peer(&peer).await;
                    Vec::new()
                }
            };
            self.dispatch(actions).await;
            self.refresh_state().await;
        }
        debug!("Network event stream closed");
    }

    async fn dispatch(&self, actions: Vec<Outbound>) {
        for action in actions {
            let result = match action {
                Outbound::Send { peer, message } => self.network.send_to(&peer, &message).await,
                Outbound::Broadcast { message, except } => {
                    self.network.broadcast(&message, except.as_deref()).await.map(|_| ())
                }
                Outbound::Drop { peer } => {
                    self.network.disconnect(&peer).await;
                    Ok(())
                }
            };
            if let Err(e) = result {
                debug!("Outbound message not delivered: {}", e);
            }
        }
    }

    async fn refresh_state(&self) {
        let next = match self.sync.get_sync_state().await {
            SyncState::Syncing => NodeState::Syncing,
            _ => NodeState::Ready,
        };
        let mut state = self.state.write().await;
        if *state != next {
            info!("Node state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    async fn proposer_loop(&self) {
        // Tick once per fallback window so a rank-k slot is noticed as soon as it opens.
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.chain.fallback_window_secs.max(1)));
        loop {
            ticker.tick().await;
            if *self.state.read().await == NodeState::Syncing {
                continue;
            }
            if let Err(e) = self.propose_once().await {
                error!("Failed to propose block: {}", e);
            }
        }
    }

    /// Build, commit and gossip the next block if this node's slot is open: one block
    /// time after the parent for rank 0, one fallback window later for each further rank.
    pub async fn propose_once(&self) -> Result<Option<Block>, ChainError> {
        let mut ledger = self.ledger.write().await;
        let Some(rank) = ledger.proposer_rank(&self.keypair.address()) else {
            return Ok(None);
        };
        let params = ledger.params();
        let opens_at = params
            .fallback_opens_at(ledger.tip().header.timestamp, rank)
            .saturating_add(params.block_time_secs * 1_000);
        let now = now_ms();
        if now < opens_at {
            return Ok(None);
        }
        if rank > 0 {
            warn!(
                "No block at height {} from higher-ranked proposers, proposing at rank {}",
                ledger.height() + 1,
                rank
            );
        }
        let candidates = self.mempool.select_for_block(ledger.params().max_txs_per_block);
        let block = ledger.build_block(&self.keypair, candidates, now)?;
        let delta = ledger.apply_block(block.clone())?;
        drop(ledger);

        self.mempool.on_commit(&delta.included);
        let peers = self.network.broadcast(&Message::NewBlock(block.clone()), None).await?;
        info!(
            "Proposed block {} at height {} with {} txs, sent to {} peers",
            short_hex(&block.hash()),
            block.height(),
            block.transactions.len(),
            peers
        );
        Ok(Some(block))
    }

    /// Admit a locally submitted transaction and gossip it.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<AdmitOutcome, ChainError> {
        let outcome = self.mempool.admit(tx.clone())?;
        if outcome.is_new() {
            self.network.broadcast(&Message::NewTransaction(tx), None).await?;
        }
        Ok(outcome)
    }

    async fn maintenance_loop(&self) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            ticker.tick().await;
            let expired = self.mempool.purge_expired();
            if expired > 0 {
                debug!("Purged {} expired transactions", expired);
            }
            for peer in self.sync.peers_to_drop().await {
                warn!("Dropping stale or unreliable peer {}", peer);
                self.network.disconnect(&peer).await;
                self.sync.remove_peer(&peer).await;
            }
            let info = self.ledger.read().await.get_chain_info();
            info!(
                "Chain height {} tip {} | {} validators | {} pals emitted | {} peers | {} pending txs",
                info.height,
                short_hex(&info.last_hash),
                info.validator_count,
                info.total_emitted,
                self.network.peer_count().await,
                self.mempool.len()
            );
        }
    }
}
