use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use crate::chain::{BlockChain, ChainEvent};
use crate::config::NodeConfig;
use crate::conveyer::Conveyer;
use crate::crypto::{load_or_generate_keypair, PublicKeyBytes};
use crate::errors::ChainResult;
use crate::executor::ContractExecutor;
use crate::interfaces::{ConsensusGateway, NodeGateway, NullGateway};
use crate::scheduler::{ContractNotice, SchedulerHandle, SmartContracts};
use crate::types::{Pool, PoolHash, Transaction};

const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// The node: storage, conveyer and scheduler wired together. The wire
/// transport and the round consensus drive it through [`NodeHandle`].
pub struct Node {
    inner: Arc<NodeInner>,
    scheduler_core: Option<SmartContracts>,
    scheduler_events: Option<mpsc::UnboundedReceiver<crate::scheduler::SchedulerEvent>>,
    notices: Option<mpsc::UnboundedReceiver<ContractNotice>>,
    chain_events: Option<mpsc::UnboundedReceiver<ChainEvent>>,
}

struct NodeInner {
    config: NodeConfig,
    node_id: PublicKeyBytes,
    chain: Arc<BlockChain>,
    conveyer: Arc<Conveyer>,
    scheduler: SchedulerHandle,
    gateway: Arc<dyn NodeGateway>,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        let gateway = Arc::new(NullGateway);
        Self::with_capabilities(
            config,
            Arc::new(crate::executor::OfflineExecutor),
            gateway.clone(),
            gateway,
        )
    }

    pub fn with_capabilities(
        config: NodeConfig,
        executor: Arc<dyn ContractExecutor>,
        gateway: Arc<dyn NodeGateway>,
        consensus: Arc<dyn ConsensusGateway>,
    ) -> ChainResult<Self> {
        config.ensure_directories()?;
        let keypair = load_or_generate_keypair(&config.key_path)?;
        let node_id = keypair.verifying_key().to_bytes();
        let db_path = config.data_dir.join("db");
        let chain = Arc::new(BlockChain::open(&db_path, None)?);
        let chain_events = chain.subscribe();
        let conveyer = Arc::new(Conveyer::new(config.conveyer));

        let (mut scheduler_core, scheduler, scheduler_events, notices) = SmartContracts::new(
            node_id,
            config.rounds,
            chain.clone(),
            executor,
            gateway.clone(),
            consensus,
        );
        scheduler_core.init();

        info!(address = %hex::encode(node_id), "node constructed");
        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                node_id,
                chain,
                conveyer,
                scheduler,
                gateway,
            }),
            scheduler_core: Some(scheduler_core),
            scheduler_events: Some(scheduler_events),
            notices: Some(notices),
            chain_events: Some(chain_events),
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: self.inner.clone(),
        }
    }

    /// Spawns the pump tasks and runs until shutdown.
    pub async fn start(mut self) -> ChainResult<()> {
        let scheduler_core = self.scheduler_core.take().expect("node already started");
        let scheduler_events = self.scheduler_events.take().expect("node already started");
        let mut notices = self.notices.take().expect("node already started");
        let mut chain_events = self.chain_events.take().expect("node already started");

        let scheduler_task = scheduler_core.run(scheduler_events);

        // chain events feed the scheduler in block order
        let scheduler = self.inner.scheduler.clone();
        tokio::spawn(async move {
            while let Some(event) = chain_events.recv().await {
                match event {
                    ChainEvent::StoreBlock(pool) => scheduler.on_store_block(pool),
                    ChainEvent::ReadBlock(pool) => scheduler.on_read_block(pool),
                }
            }
        });

        // contract notices: publish produced packets, log the rest
        let gateway = self.inner.gateway.clone();
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                match notice {
                    ContractNotice::SmartExecuted(packet) => {
                        debug!(
                            transactions = packet.transactions_count(),
                            "publishing contract result packet"
                        );
                        gateway.send_packet(&packet);
                    }
                    ContractNotice::PayableInvoke(transaction) => {
                        debug!(contract = %transaction.target, "payable contract replenished");
                    }
                    ContractNotice::PayableTimeout(transaction) => {
                        warn!(contract = %transaction.target, "payable call timed out");
                    }
                    ContractNotice::EmittedAccepted { transaction, .. } => {
                        debug!(source = %transaction.source, "contract emitted transaction accepted");
                    }
                }
            }
        });

        let replayed = self.inner.chain.replay_committed()?;
        if replayed > 0 {
            info!(blocks = replayed, "state recovered from storage");
        }
        info!(address = %hex::encode(self.inner.node_id), "starting node");

        let _scheduler_task = scheduler_task;
        let mut ticker = time::interval(FLUSH_INTERVAL);
        loop {
            ticker.tick().await;
            for packet in self.inner.conveyer.flush_transactions() {
                self.inner.gateway.send_packet(&packet);
            }
        }
    }
}

impl NodeHandle {
    /// Admits a user transaction into the conveyer.
    pub fn submit_transaction(&self, transaction: Transaction) -> ChainResult<()> {
        self.inner.conveyer.add_transaction(transaction)
    }

    /// Commits a block produced by the consensus round.
    pub fn commit_block(&self, pool: Pool) -> ChainResult<PoolHash> {
        self.inner.chain.store_block(pool)
    }

    pub fn get_block(&self, sequence: u64) -> ChainResult<Option<Pool>> {
        self.inner.chain.load_block(sequence)
    }

    pub fn last_sequence(&self) -> u64 {
        self.inner.chain.last_sequence()
    }

    pub fn last_hash(&self) -> PoolHash {
        self.inner.chain.last_hash()
    }

    pub fn chain(&self) -> &BlockChain {
        &self.inner.chain
    }

    pub fn conveyer(&self) -> &Conveyer {
        &self.inner.conveyer
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.inner.scheduler
    }

    pub fn address(&self) -> &PublicKeyBytes {
        &self.inner.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }
}
