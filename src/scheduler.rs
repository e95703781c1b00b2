//! Smart-contract execution scheduler.
//!
//! A single owner processes [`SchedulerEvent`]s from a channel: committed and
//! replayed blocks, consensus rejections and executor completions. All
//! contract state (`known_contracts`), the execution queue and the replenish
//! watch list are mutated only here, so every observer sees a consistent
//! snapshot per event.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::chain::BlockChain;
use crate::config::RoundLimits;
use crate::crypto::{self, PublicKeyBytes};
use crate::executor::{
    ContractErrorCode, ContractExecutor, ContractInvocation, ExecuteRequest, ExecutionOutcome,
    MethodNameConvention, PayableStatus, ReturnValue, PAYABLE_NAME,
};
use crate::fees;
use crate::interfaces::{smart_consensus_id, ConsensusGateway, NodeGateway, RefExecution};
use crate::types::{
    user_fields, Address, Pool, SmartContractRef, Transaction, TransactionsPacket, UserFieldValue,
};

/// Bytes of the deployer's inner id mixed into the derived contract address.
const INNER_ID_ADDRESS_BYTES: usize = 6;

pub fn is_executable_transaction(transaction: &Transaction) -> bool {
    transaction.is_smart_contract() && !transaction.is_new_state()
}

pub fn is_deploy_transaction(transaction: &Transaction) -> bool {
    is_executable_transaction(transaction)
        && ContractInvocation::from_transaction(transaction)
            .map(|invocation| invocation.is_deploy())
            .unwrap_or(false)
}

pub fn is_start_transaction(transaction: &Transaction) -> bool {
    is_executable_transaction(transaction) && !is_deploy_transaction(transaction)
}

/// The only valid address of a deployed contract:
/// `H(deployer_pk || inner_id (6 bytes) || concatenated bytecode)`.
pub fn valid_smart_address(
    deployer: &PublicKeyBytes,
    inner_id: u64,
    bytecode: &[u8],
) -> PublicKeyBytes {
    let mut data = Vec::with_capacity(deployer.len() + INNER_ID_ADDRESS_BYTES + bytecode.len());
    data.extend_from_slice(deployer);
    data.extend_from_slice(&inner_id.to_le_bytes()[..INNER_ID_ADDRESS_BYTES]);
    data.extend_from_slice(bytecode);
    crypto::digest(&data)
}

/// Loads the transaction a contract reference points at.
pub fn get_transaction(chain: &BlockChain, reference: &SmartContractRef) -> Option<Transaction> {
    let block = chain.load_block(reference.sequence).ok().flatten()?;
    block.transaction(reference.transaction as usize).cloned()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmartContractStatus {
    Waiting,
    Running,
    Finished,
    Closed,
}

/// Everything known about a contract, updated on every observed new_state.
#[derive(Clone, Debug, Default)]
pub struct StateItem {
    pub ref_deploy: Option<SmartContractRef>,
    pub ref_execute: Option<SmartContractRef>,
    /// Non-empty iff the contract has at least one successful transition.
    pub state: Vec<u8>,
    pub payable: PayableStatus,
    /// Declared subcalls per method, from `@UsesContract` annotations.
    pub uses: BTreeMap<String, Vec<(Address, String)>>,
    pub is_locked: bool,
}

/// One contract call; several coalesce into a single queue item when they
/// target the same contract in the same block.
#[derive(Clone, Debug)]
pub struct ExecutionItem {
    pub ref_start: SmartContractRef,
    pub avail_fee: u64,
    pub new_state_fee: u64,
    pub consumed_fee: u64,
    /// Expanded set of contracts this call may invoke.
    pub uses: Vec<PublicKeyBytes>,
    /// The resulting partial packet once execution completed.
    pub result: TransactionsPacket,
}

#[derive(Clone, Debug)]
pub struct QueueItem {
    pub status: SmartContractStatus,
    pub seq_enqueue: u64,
    pub seq_start: u64,
    pub seq_finish: u64,
    pub abs_addr: PublicKeyBytes,
    pub is_executor: bool,
    pub is_rejected: bool,
    pub executions: Vec<ExecutionItem>,
}

impl QueueItem {
    fn new(
        reference: SmartContractRef,
        abs_addr: PublicKeyBytes,
        starter: &Transaction,
        declared_uses: Vec<PublicKeyBytes>,
    ) -> Self {
        let mut item = Self {
            status: SmartContractStatus::Waiting,
            seq_enqueue: reference.sequence,
            seq_start: 0,
            seq_finish: 0,
            abs_addr,
            is_executor: false,
            is_rejected: false,
            executions: Vec::new(),
        };
        item.add(reference, starter, declared_uses);
        item
    }

    /// Appends one more call of the same contract. The new_state fee reserve
    /// equals the starter fee; one extra reserve is held per declared use.
    fn add(
        &mut self,
        reference: SmartContractRef,
        starter: &Transaction,
        declared_uses: Vec<PublicKeyBytes>,
    ) {
        let starter_fee = starter.counted_fee;
        let new_state_fee = starter_fee;
        let mut avail_fee = starter
            .max_fee
            .saturating_sub(starter_fee)
            .saturating_sub(new_state_fee);
        avail_fee = avail_fee.saturating_sub(new_state_fee.saturating_mul(declared_uses.len() as u64));
        self.executions.push(ExecutionItem {
            ref_start: reference,
            avail_fee,
            new_state_fee,
            consumed_fee: 0,
            uses: declared_uses,
            result: TransactionsPacket::new(),
        });
    }

    /// A copy carrying the item's identity but none of its executions.
    fn fork(&self) -> Self {
        Self {
            executions: Vec::new(),
            ..self.clone()
        }
    }
}

/// Completed (or failed) execution of a single call.
#[derive(Clone, Debug)]
pub struct SmartExecutionData {
    pub contract_ref: SmartContractRef,
    /// In: the fee budget. Out: the actual execution fee.
    pub executor_fee: u64,
    pub outcome: ExecutionOutcome,
    pub error: String,
}

impl SmartExecutionData {
    pub fn new(contract_ref: SmartContractRef, executor_fee: u64) -> Self {
        Self {
            contract_ref,
            executor_fee,
            outcome: ExecutionOutcome::default(),
            error: String::new(),
        }
    }

    pub fn set_error(&mut self, code: ContractErrorCode, message: impl Into<String>) {
        self.error = message.into();
        self.outcome.new_state.clear();
        self.outcome.ret_value = ReturnValue::error(code);
    }

    pub fn is_failed(&self) -> bool {
        !self.error.is_empty()
    }
}

#[derive(Debug)]
pub enum SchedulerEvent {
    StoreBlock(Pool),
    ReadBlock(Pool),
    Rejected(Vec<RefExecution>),
    ExecutionCompleted(Vec<SmartExecutionData>),
}

/// Side effects the scheduler reports to the node.
#[derive(Debug)]
pub enum ContractNotice {
    /// An ordinary transfer landed on a payable contract.
    PayableInvoke(Transaction),
    /// A replenish ran out of rounds without a state transition.
    PayableTimeout(Transaction),
    /// A contract-emitted transaction was accepted into a block.
    EmittedAccepted {
        transaction: Transaction,
        starter: Transaction,
    },
    /// A finished execution produced this packet for consensus.
    SmartExecuted(TransactionsPacket),
}

#[derive(Clone)]
pub struct SchedulerHandle {
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl SchedulerHandle {
    pub fn send(&self, event: SchedulerEvent) {
        if self.events.send(event).is_err() {
            warn!("scheduler event dropped, core is gone");
        }
    }

    pub fn on_store_block(&self, block: Pool) {
        self.send(SchedulerEvent::StoreBlock(block));
    }

    pub fn on_read_block(&self, block: Pool) {
        self.send(SchedulerEvent::ReadBlock(block));
    }

    pub fn on_rejected(&self, rejected: Vec<RefExecution>) {
        self.send(SchedulerEvent::Rejected(rejected));
    }
}

/// One call prepared for the executor job.
struct PreparedCall {
    data: SmartExecutionData,
    request: ExecuteRequest,
}

pub struct SmartContracts {
    node_id: PublicKeyBytes,
    limits: RoundLimits,
    chain: Arc<BlockChain>,
    executor: Arc<dyn ContractExecutor>,
    node: Arc<dyn NodeGateway>,
    consensus: Arc<dyn ConsensusGateway>,
    force_execution: bool,
    execution_allowed: bool,
    known_contracts: HashMap<PublicKeyBytes, StateItem>,
    exe_queue: Vec<QueueItem>,
    replenish_contract: Vec<SmartContractRef>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    notices: mpsc::UnboundedSender<ContractNotice>,
}

impl SmartContracts {
    #[allow(clippy::type_complexity)]
    pub fn new(
        node_id: PublicKeyBytes,
        limits: RoundLimits,
        chain: Arc<BlockChain>,
        executor: Arc<dyn ContractExecutor>,
        node: Arc<dyn NodeGateway>,
        consensus: Arc<dyn ConsensusGateway>,
    ) -> (
        Self,
        SchedulerHandle,
        mpsc::UnboundedReceiver<SchedulerEvent>,
        mpsc::UnboundedReceiver<ContractNotice>,
    ) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let force_execution = node.always_execute_contracts();
        let scheduler = Self {
            node_id,
            limits,
            chain,
            executor,
            node,
            consensus,
            force_execution,
            execution_allowed: true,
            known_contracts: HashMap::new(),
            exe_queue: Vec::new(),
            replenish_contract: Vec::new(),
            events: events.clone(),
            notices,
        };
        (
            scheduler,
            SchedulerHandle { events },
            event_rx,
            notice_rx,
        )
    }

    /// Drives the scheduler until every handle is dropped.
    pub fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle_event(event);
            }
            debug!("scheduler event loop finished");
        })
    }

    pub fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::StoreBlock(block) => self.on_store_block(&block),
            SchedulerEvent::ReadBlock(block) => self.on_read_block(&block),
            SchedulerEvent::Rejected(rejected) => self.on_reject(&rejected),
            SchedulerEvent::ExecutionCompleted(data) => self.on_execution_completed(data),
        }
    }

    pub fn known_contract_keys(&self) -> HashSet<PublicKeyBytes> {
        self.known_contracts.keys().copied().collect()
    }

    pub fn contract_state(&self, key: &PublicKeyBytes) -> Option<&StateItem> {
        self.known_contracts.get(key)
    }

    pub fn queue(&self) -> &[QueueItem] {
        &self.exe_queue
    }

    pub fn execution_allowed(&self) -> bool {
        self.execution_allowed
    }

    fn notify(&self, notice: ContractNotice) {
        let _ = self.notices.send(notice);
    }

    fn absolute_address(&self, address: &Address) -> Option<PublicKeyBytes> {
        self.chain.public_key_of(address)
    }

    pub fn in_known_contracts(&self, address: &Address) -> bool {
        self.absolute_address(address)
            .map(|key| self.known_contracts.contains_key(&key))
            .unwrap_or(false)
    }

    /// Startup consolidation: nothing keyed by a compact wallet id survives;
    /// every state item must sit under its absolute address.
    pub fn init(&mut self) {
        for (key, state) in &self.known_contracts {
            if state.state.is_empty() {
                warn!(contract = %hex::encode(key), "completely unsuccessful contract found, neither deployed, nor executed");
            }
            if state.ref_deploy.is_none() {
                warn!(contract = %hex::encode(key), "unsuccessfully deployed contract found");
            }
        }
        info!(
            count = self.known_contracts.len(),
            "smart contract states loaded"
        );
    }

    // ---- block inspection ----------------------------------------------

    pub fn on_store_block(&mut self, block: &Pool) {
        self.test_executor_availability();
        self.test_exe_conditions(block);
        self.test_exe_queue();
        self.test_contracts_locks();

        for (index, transaction) in block.transactions().iter().enumerate() {
            if transaction.is_smart_contract() {
                if is_executable_transaction(transaction) {
                    if is_deploy_transaction(transaction) {
                        debug!(
                            sequence = block.sequence(),
                            index, "contract is deployed"
                        );
                    } else {
                        debug!(
                            sequence = block.sequence(),
                            index, "contract is invoked"
                        );
                    }
                    self.enqueue(block, index as u32);
                } else {
                    debug!(
                        sequence = block.sequence(),
                        index, "contract state is updated"
                    );
                    self.on_new_state(block, index as u32);
                }
            } else if self.is_payable_target(transaction) {
                debug!(
                    sequence = block.sequence(),
                    index, "contract balance is replenished"
                );
                self.notify(ContractNotice::PayableInvoke(transaction.clone()));
                self.enqueue(block, index as u32);
            } else if let Some(source) = self.absolute_address(&transaction.source) {
                if let Some(state) = self.known_contracts.get(&source) {
                    // emitted by a contract
                    let starter = state
                        .ref_execute
                        .and_then(|reference| get_transaction(&self.chain, &reference));
                    if state.payable.implemented() && starter.is_some() {
                        self.notify(ContractNotice::EmittedAccepted {
                            transaction: transaction.clone(),
                            starter: starter.expect("starter checked above"),
                        });
                    } else {
                        error!("failed to find starter transaction for contract emitted one");
                    }
                }
            }
        }

        self.test_exe_queue();
    }

    pub fn on_read_block(&mut self, block: &Pool) {
        // round-based timeout of replenish calls; blocks arrive in order
        while let Some(first) = self.replenish_contract.first().copied() {
            if block.sequence().saturating_sub(first.sequence)
                <= self.limits.max_rounds_cancel_contract
            {
                break;
            }
            if let Some(starter) = get_transaction(&self.chain, &first) {
                self.notify(ContractNotice::PayableTimeout(starter));
            }
            self.replenish_contract.remove(0);
        }

        for (index, transaction) in block.transactions().iter().enumerate() {
            if transaction.is_new_state() {
                self.update_contract_state(transaction, true);
            } else {
                let Some(target) = self.absolute_address(&transaction.target) else {
                    error!("failed to convert optimized address");
                    continue;
                };
                if !self.known_contracts.contains_key(&target) {
                    if is_deploy_transaction(transaction) {
                        // register only the deploy; state arrives with the
                        // matching new_state
                        let state = self.known_contracts.entry(target).or_default();
                        state.ref_deploy = Some(SmartContractRef::new(
                            block.hash(),
                            block.sequence(),
                            index as u32,
                        ));
                    }
                } else if !is_executable_transaction(transaction) {
                    let reference =
                        SmartContractRef::new(block.hash(), block.sequence(), index as u32);
                    self.notify(ContractNotice::PayableInvoke(transaction.clone()));
                    self.replenish_contract.push(reference);
                }
            }
        }
    }

    // ---- queue management ----------------------------------------------

    fn find_in_queue(&self, reference: &SmartContractRef) -> Option<usize> {
        self.exe_queue.iter().position(|item| {
            item.executions
                .iter()
                .any(|execution| execution.ref_start == *reference)
        })
    }

    fn enqueue(&mut self, block: &Pool, transaction_index: u32) {
        let Some(transaction) = block.transaction(transaction_index as usize) else {
            error!("incorrect transaction index in block to enqueue smart contract");
            return;
        };
        let transaction = transaction.clone();
        let new_item =
            SmartContractRef::new(block.hash(), block.sequence(), transaction_index);
        let Some(abs_addr) = self.absolute_address(&transaction.target) else {
            error!("failed to resolve contract address");
            return;
        };

        if let Some(existing) = self.find_in_queue(&new_item) {
            debug!(
                reference = %new_item,
                enqueued_at = self.exe_queue[existing].seq_enqueue,
                "attempt to queue duplicated contract call"
            );
            return;
        }

        let declared_uses = self.resolve_declared_uses(&transaction);

        // calls to the same contract within one block coalesce
        let position = self
            .exe_queue
            .iter()
            .position(|item| item.seq_enqueue == new_item.sequence && item.abs_addr == abs_addr);
        let index = match position {
            Some(index) => {
                info!(reference = %new_item, "add to already enqueued contract");
                self.exe_queue[index].add(new_item, &transaction, declared_uses);
                index
            }
            None => {
                if is_deploy_transaction(&transaction) {
                    // pre-register in known contracts
                    if let Some(invocation) = self.get_smart_contract_impl(&transaction) {
                        let state = self.known_contracts.entry(abs_addr).or_default();
                        state.ref_deploy = Some(new_item);
                        self.update_metadata(&invocation, &abs_addr);
                    }
                } else {
                    // lazy metadata refresh, covers contracts read from disk
                    if !self.is_metadata_actual(&abs_addr) {
                        if let Some(invocation) = self.get_smart_contract_impl(&transaction) {
                            self.known_contracts.entry(abs_addr).or_default();
                            self.update_metadata(&invocation, &abs_addr);
                        }
                    }
                }
                info!(reference = %new_item, "enqueue contract call");
                self.exe_queue.push(QueueItem::new(
                    new_item,
                    abs_addr,
                    &transaction,
                    declared_uses,
                ));
                self.exe_queue.len() - 1
            }
        };

        // expand the uses set from contract metadata; a call to an unknown
        // contract cancels the whole call
        let method = self.executed_method_name(&transaction);
        let execution_index = self.exe_queue[index]
            .executions
            .iter()
            .position(|execution| execution.ref_start == new_item);
        if let Some(execution_index) = execution_index {
            let mut uses = self.exe_queue[index].executions[execution_index].uses.clone();
            let before = uses.len();
            self.add_uses_from(&abs_addr, &method, &mut uses);
            for key in &uses {
                if !self.known_contracts.contains_key(key) && *key != abs_addr {
                    info!(
                        reference = %new_item,
                        "call to unknown contract declared in executing item, cancel"
                    );
                    self.remove_from_queue(&new_item);
                    return;
                }
            }
            let execution = &mut self.exe_queue[index].executions[execution_index];
            let added = uses.len().saturating_sub(before) as u64;
            execution.avail_fee = execution
                .avail_fee
                .saturating_sub(execution.new_state_fee.saturating_mul(added));
            execution.uses = uses;
            execution.consumed_fee = execution
                .consumed_fee
                .saturating_add(fees::round_fee(block));
        } else {
            debug!("logical error, unable to find just created execution item");
        }

        self.update_status_at(index, new_item.sequence, SmartContractStatus::Waiting);
        self.exe_queue[index].is_executor = self.contains_me(block.confidants());
    }

    fn resolve_declared_uses(&self, transaction: &Transaction) -> Vec<PublicKeyBytes> {
        if !is_executable_transaction(transaction) {
            return Vec::new();
        }
        ContractInvocation::from_transaction(transaction)
            .map(|invocation| {
                invocation
                    .used_contracts
                    .iter()
                    .filter_map(|address| self.absolute_address(address))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn on_new_state(&mut self, block: &Pool, transaction_index: u32) {
        let reference =
            SmartContractRef::new(block.hash(), block.sequence(), transaction_index);
        let Some(new_state) = get_transaction(&self.chain, &reference)
            .or_else(|| block.transaction(transaction_index as usize).cloned())
        else {
            error!("get new_state transaction failed");
            return;
        };
        let contract_ref = new_state
            .user_field(user_fields::REF_START)
            .and_then(|field| SmartContractRef::from_user_field(field).ok());
        let Some(contract_ref) = contract_ref else {
            error!("new_state transaction does not contain reference to contract");
            return;
        };

        self.update_contract_state(&new_state, false);
        if let Some(abs_addr) = self.absolute_address(&new_state.target) {
            info!(reference = %contract_ref, contract = %hex::encode(abs_addr), "contract state has been updated");
            self.update_lock_status(&abs_addr, false);
        }
        self.remove_from_queue(&contract_ref);
        self.test_exe_queue();
    }

    /// Walks the queue advancing Waiting items whose locks cleared.
    fn test_exe_queue(&mut self) {
        let mut index = 0usize;
        while index < self.exe_queue.len() {
            let status = self.exe_queue[index].status;
            if status == SmartContractStatus::Closed {
                debug!(
                    seq = self.exe_queue[index].seq_enqueue,
                    "finished item still in queue, remove it"
                );
                self.remove_from_queue_at(index);
                continue;
            }
            if self.exe_queue[index].executions.is_empty() {
                debug!(
                    seq = self.exe_queue[index].seq_enqueue,
                    "empty item in queue, remove it"
                );
                self.remove_from_queue_at(index);
                continue;
            }
            if status == SmartContractStatus::Running || status == SmartContractStatus::Finished {
                index += 1;
                continue;
            }

            // status: Waiting
            let abs_addr = self.exe_queue[index].abs_addr;
            let uses: Vec<PublicKeyBytes> = self.exe_queue[index]
                .executions
                .iter()
                .flat_map(|execution| execution.uses.iter().copied())
                .collect();
            let locked =
                self.is_locked(&abs_addr) || uses.iter().any(|key| self.is_locked(key));
            if locked {
                debug!(
                    seq = self.exe_queue[index].seq_enqueue,
                    "still locked, wait until unlocked"
                );
                index += 1;
                continue;
            }

            debug!(
                seq = self.exe_queue[index].seq_enqueue,
                jobs = self.exe_queue[index].executions.len(),
                "set running status"
            );
            let last_sequence = self.chain.last_sequence();
            self.update_status_at(index, last_sequence, SmartContractStatus::Running);

            let is_executor = self.exe_queue[index].is_executor;
            if is_executor || self.force_execution {
                if is_executor && !self.execution_allowed && !self.test_executor_availability() {
                    info!(
                        seq = self.exe_queue[index].seq_enqueue,
                        "skip execution, executor is not connected"
                    );
                    self.exe_queue[index].is_executor = false;
                    self.send_fake_stages(index);
                } else {
                    debug!(seq = self.exe_queue[index].seq_enqueue, "execute now");
                    let executions = self.exe_queue[index].executions.clone();
                    self.execute_async(&executions);
                }
            } else {
                debug!(
                    seq = self.exe_queue[index].seq_enqueue,
                    "skip execution, not in trusted list"
                );
            }

            index += 1;
        }
    }

    /// Notifies partners that this node cannot play its trusted role: fake
    /// stage-1 and stage-2 votes let the smart consensus proceed without us.
    fn send_fake_stages(&self, index: usize) {
        let item = &self.exe_queue[index];
        let confidants = self.node.smart_confidants(item.seq_enqueue);
        let own_index = confidants
            .iter()
            .position(|confidant| *confidant == self.node_id);
        match own_index {
            Some(own_index) => {
                let Some(first) = item.executions.first() else {
                    return;
                };
                let id = smart_consensus_id(
                    first.ref_start.sequence,
                    first.ref_start.transaction as u16,
                    0,
                );
                info!(
                    seq = item.seq_enqueue,
                    "unable to execute, sending fake stage-1 & stage-2"
                );
                self.consensus
                    .send_fake_stages(&confidants, own_index as u8, id);
            }
            None => {
                info!(
                    seq = item.seq_enqueue,
                    "unable to execute and failed to send fake stages"
                );
            }
        }
    }

    /// Applies round timeouts and fee limits; runs on every stored block.
    fn test_exe_conditions(&mut self, block: &Pool) {
        if self.exe_queue.is_empty() {
            return;
        }
        let sequence = block.sequence();
        let add_fee = fees::round_fee(block);
        let mut completions: Vec<Vec<SmartExecutionData>> = Vec::new();

        for index in 0..self.exe_queue.len() {
            let status = self.exe_queue[index].status;
            if status != SmartContractStatus::Running && status != SmartContractStatus::Finished {
                continue;
            }
            let seq_start = self.exe_queue[index].seq_start;

            // unconditional timeout, both Finished and Running
            if sequence > seq_start
                && sequence - seq_start > self.limits.max_rounds_cancel_contract
            {
                warn!(
                    seq = self.exe_queue[index].seq_enqueue,
                    limit = self.limits.max_rounds_cancel_contract,
                    "in queue over cancellation limit, remove without transaction"
                );
                self.update_status_at(index, sequence, SmartContractStatus::Closed);
                let starters: Vec<_> = self.exe_queue[index]
                    .executions
                    .iter()
                    .map(|execution| execution.ref_start)
                    .collect();
                for reference in starters {
                    match get_transaction(&self.chain, &reference) {
                        Some(starter) if !is_executable_transaction(&starter) => {
                            self.notify(ContractNotice::PayableTimeout(starter));
                        }
                        Some(_) => {}
                        None => error!(
                            reference = %reference,
                            "cannot handle execution timeout, starter transaction not found"
                        ),
                    }
                }
                continue;
            }

            if status != SmartContractStatus::Running {
                continue;
            }

            // soft timeout: preempt the executor
            if sequence > seq_start
                && sequence - seq_start > self.limits.max_rounds_execute_contract
            {
                info!(
                    seq = self.exe_queue[index].seq_enqueue,
                    limit = self.limits.max_rounds_execute_contract,
                    "in queue over execution limit, stop it"
                );
                if self.exe_queue[index].is_executor {
                    let data_list: Vec<_> = self.exe_queue[index]
                        .executions
                        .iter()
                        .map(|execution| {
                            let mut data = SmartExecutionData::new(
                                execution.ref_start,
                                execution.consumed_fee,
                            );
                            data.set_error(
                                ContractErrorCode::TimeExpired,
                                "contract execution timeout",
                            );
                            data
                        })
                        .collect();
                    if !data_list.is_empty() {
                        completions.push(data_list);
                    }
                } else {
                    self.update_status_at(index, sequence, SmartContractStatus::Finished);
                }
                continue;
            }

            // out-of-fee cancels every job of the item
            let mut out_of_fee = false;
            for execution in &mut self.exe_queue[index].executions {
                execution.consumed_fee = execution.consumed_fee.saturating_add(add_fee);
                if execution.avail_fee < execution.consumed_fee {
                    info!(
                        reference = %execution.ref_start,
                        "out of fee, cancel the whole queue item"
                    );
                    out_of_fee = true;
                    break;
                }
            }
            if out_of_fee {
                if self.exe_queue[index].is_executor {
                    let data_list: Vec<_> = self.exe_queue[index]
                        .executions
                        .iter()
                        .map(|execution| {
                            let mut data = SmartExecutionData::new(
                                execution.ref_start,
                                execution.consumed_fee,
                            );
                            data.set_error(
                                ContractErrorCode::OutOfFunds,
                                "contract execution is out of funds",
                            );
                            data
                        })
                        .collect();
                    if !data_list.is_empty() {
                        completions.push(data_list);
                    }
                } else {
                    self.update_status_at(index, sequence, SmartContractStatus::Finished);
                }
            }
        }

        for data_list in completions {
            self.on_execution_completed(data_list);
        }
    }

    fn remove_from_queue_at(&mut self, index: usize) {
        let item = self.exe_queue.remove(index);
        info!(seq = item.seq_enqueue, "remove from queue completed item");
        let last_sequence = self.chain.last_sequence();
        let cancel_at = item
            .seq_start
            .saturating_add(self.limits.max_rounds_cancel_contract + 1);
        if last_sequence > item.seq_start + self.limits.max_rounds_execute_contract
            && last_sequence < cancel_at
        {
            info!(
                remaining = cancel_at - last_sequence,
                "rounds remain until unconditional timeout"
            );
        }
        // unlock only closed items; others wait for their state update
        if item.status == SmartContractStatus::Closed {
            self.unlock_item(&item);
        }
        if self.exe_queue.is_empty() {
            debug!("contract queue is empty, nothing to execute");
        } else {
            debug!(items = self.exe_queue.len(), "items remain in queue");
        }
    }

    fn remove_from_queue(&mut self, reference: &SmartContractRef) {
        let Some(index) = self.find_in_queue(reference) else {
            return;
        };
        let item = &mut self.exe_queue[index];
        item.executions
            .retain(|execution| execution.ref_start != *reference);
        if item.executions.is_empty() {
            self.remove_from_queue_at(index);
        }
    }

    // ---- execution -----------------------------------------------------

    /// Schedules the asynchronous execution of a queue item's calls. The job
    /// feeds each call's fresh state to the next one, then reports back
    /// through the event channel.
    fn execute_async(&mut self, executions: &[ExecutionItem]) -> bool {
        let mut calls = Vec::with_capacity(executions.len());
        for execution in executions {
            let mut data = SmartExecutionData::new(execution.ref_start, execution.avail_fee);
            let Some(starter) = get_transaction(&self.chain, &execution.ref_start) else {
                error!(reference = %execution.ref_start, "load starter transaction failed");
                continue;
            };
            if !is_executable_transaction(&starter) && !self.is_payable_target(&starter) {
                error!("unable to execute neither deploy nor start/replenish transaction");
                return false;
            }
            let Some(invocation) = self.get_smart_contract_impl(&starter) else {
                data.set_error(
                    ContractErrorCode::ExecuteTransaction,
                    "contract invocation is not available",
                );
                calls.push(PreparedCall {
                    data,
                    request: ExecuteRequest {
                        transaction: starter,
                        invocation: ContractInvocation::default(),
                        contract_state: Vec::new(),
                        convention: MethodNameConvention::Default,
                        fee_limit: execution.avail_fee,
                    },
                });
                continue;
            };
            let abs_addr = self.absolute_address(&starter.target);
            let (contract_state, convention) = match abs_addr
                .and_then(|key| self.known_contracts.get(&key))
            {
                Some(state) => {
                    let convention = if starter.is_smart_contract() {
                        MethodNameConvention::Default
                    } else {
                        match state.payable {
                            PayableStatus::Implemented => MethodNameConvention::PayableLegacy,
                            PayableStatus::ImplementedVer1 => MethodNameConvention::Payable,
                            _ => MethodNameConvention::Default,
                        }
                    };
                    (state.state.clone(), convention)
                }
                None => (Vec::new(), MethodNameConvention::Default),
            };
            debug!(
                reference = %execution.ref_start,
                method = %invocation.method,
                "invoke remote executor"
            );
            calls.push(PreparedCall {
                data,
                request: ExecuteRequest {
                    transaction: starter,
                    invocation,
                    contract_state,
                    convention,
                    fee_limit: execution.avail_fee,
                },
            });
        }

        if calls.is_empty() {
            return false;
        }

        let executor = self.executor.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let results =
                tokio::task::spawn_blocking(move || run_executions(executor.as_ref(), calls))
                    .await;
            match results {
                Ok(data_list) => {
                    let _ = events.send(SchedulerEvent::ExecutionCompleted(data_list));
                }
                Err(err) => error!(?err, "executor job panicked"),
            }
        });
        true
    }

    /// Consumes completed executions: builds the per-call new_state
    /// transactions, the emitted transactions and subsequent states, and
    /// hands the integral packet to the smart consensus.
    pub fn on_execution_completed(&mut self, data_list: Vec<SmartExecutionData>) {
        let Some(first) = data_list.first() else {
            return;
        };
        let Some(index) = self.find_in_queue(&first.contract_ref) else {
            return;
        };
        {
            let status = self.exe_queue[index].status;
            if status == SmartContractStatus::Finished || status == SmartContractStatus::Closed {
                // already finished by timeout, no transaction required
                return;
            }
        }
        let last_sequence = self.chain.last_sequence();
        self.update_status_at(index, last_sequence, SmartContractStatus::Finished);

        let mut integral_packet = TransactionsPacket::new();
        let mut next_id: u64 = 0;

        for data_item in &data_list {
            let Some(execution_index) = self.exe_queue[index]
                .executions
                .iter()
                .position(|execution| execution.ref_start == data_item.contract_ref)
            else {
                continue;
            };
            debug!(reference = %data_item.contract_ref, "execution has completed");

            self.exe_queue[index].executions[execution_index].consumed_fee =
                data_item.executor_fee;

            if next_id > 0 {
                next_id += 1;
            } else {
                let starter = get_transaction(&self.chain, &data_item.contract_ref);
                next_id = match starter {
                    Some(starter) => self.chain.next_inner_id(&starter.target),
                    None => 1,
                };
            }

            let execution = self.exe_queue[index].executions[execution_index].clone();
            let Some(mut result) = self.create_new_state(&execution, next_id) else {
                error!("failed to create new_state transaction, even empty");
                continue;
            };
            debug!(inner_id = next_id, reference = %data_item.contract_ref, "assigned inner id to new_state");

            let mut packet = TransactionsPacket::new();
            if data_item.is_failed() {
                error!(error = %data_item.error, reference = %data_item.contract_ref, "execution failed, new state is empty");
                result.add_user_field(user_fields::VALUE, UserFieldValue::Bytes(Vec::new()));
                if let Ok(field) = data_item.outcome.ret_value.to_user_field() {
                    result.add_user_field(user_fields::RET_VAL, field);
                }
                packet.add_transaction(result);
            } else {
                let outcome = &data_item.outcome;
                debug!(
                    reference = %data_item.contract_ref,
                    state_size = outcome.new_state.len(),
                    "execution successful"
                );
                result.add_user_field(
                    user_fields::VALUE,
                    UserFieldValue::Bytes(outcome.new_state.clone()),
                );
                if let Ok(field) = outcome.ret_value.to_user_field() {
                    result.add_user_field(user_fields::RET_VAL, field);
                }
                packet.add_transaction(result);

                for emitted in &outcome.emitted {
                    if emitted.inner_id == 0 {
                        next_id += 1;
                        let mut assigned = emitted.clone();
                        assigned.inner_id = next_id;
                        debug!(inner_id = next_id, "assigned inner id to emitted transaction");
                        packet.add_transaction(assigned);
                    } else {
                        packet.add_transaction(emitted.clone());
                    }
                }

                for (address, state) in &outcome.subsequent_states {
                    next_id += 1;
                    if let Some(mut subsequent) = self.create_new_state(&execution, next_id) {
                        subsequent.inner_id = self.chain.next_inner_id(address);
                        subsequent.source = *address;
                        subsequent.target = *address;
                        subsequent
                            .add_user_field(user_fields::VALUE, UserFieldValue::Bytes(state.clone()));
                        subsequent.add_user_field(user_fields::FEE, UserFieldValue::Amount(0));
                        if let Ok(field) = ReturnValue::Void.to_user_field() {
                            subsequent.add_user_field(user_fields::RET_VAL, field);
                        }
                        packet.add_transaction(subsequent);
                    }
                }
            }

            for transaction in packet.transactions() {
                integral_packet.add_transaction(transaction.clone());
            }
            self.exe_queue[index].executions[execution_index].result = packet;
        }

        debug!(seq = self.exe_queue[index].seq_enqueue, "starting smart consensus");
        let is_executor = self.exe_queue[index].is_executor;
        if !is_executor || !self.start_consensus(index, &integral_packet) {
            error!("consensus is not started, remove item from queue");
            self.remove_from_queue_at(index);
        }

        self.notify(ContractNotice::SmartExecuted(integral_packet));
    }

    /// The new_state transaction skeleton for an execution: the contract pays
    /// itself, the remaining fee budget becomes the max fee.
    fn create_new_state(&self, execution: &ExecutionItem, new_id: u64) -> Option<Transaction> {
        let starter = get_transaction(&self.chain, &execution.ref_start)?;
        let mut result = Transaction::new(
            new_id,
            starter.target,
            starter.target,
            starter.currency,
            0,
            execution.avail_fee.saturating_sub(execution.consumed_fee),
        );
        result.counted_fee = execution.new_state_fee;
        result.add_user_field(user_fields::REF_START, execution.ref_start.to_user_field());
        result.add_user_field(
            user_fields::FEE,
            UserFieldValue::Amount(execution.consumed_fee),
        );
        Some(result)
    }

    fn start_consensus(&self, index: usize, packet: &TransactionsPacket) -> bool {
        let item = &self.exe_queue[index];
        let Some(first) = item.executions.first() else {
            return false;
        };
        let id = smart_consensus_id(
            first.ref_start.sequence,
            first.ref_start.transaction as u16,
            0,
        );
        self.consensus.start_smart_consensus(packet, id)
    }

    // ---- rejection -----------------------------------------------------

    /// Splits partially rejected multi-call items: rejected calls resubmit an
    /// empty state with `ConsensusRejected`, survivors go back to Waiting.
    pub fn on_reject(&mut self, reject_list: &[RefExecution]) {
        if reject_list.is_empty() {
            return;
        }
        let current_sequence = self.chain.last_sequence();
        info!(count = reject_list.len(), "contracts are rejected");

        let mut grouped: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
        for (sequence, transaction) in reject_list {
            grouped.entry(*sequence).or_default().push(*transaction);
        }

        for (sequence, rejected_indices) in grouped {
            let mut new_queue_items: Vec<QueueItem> = Vec::new();
            let mut queue_index = 0usize;
            while queue_index < self.exe_queue.len() {
                if self.exe_queue[queue_index].seq_enqueue == sequence
                    && !self.exe_queue[queue_index].is_rejected
                {
                    let first_rejected = self.exe_queue[queue_index].executions.iter().position(
                        |execution| {
                            rejected_indices.contains(&execution.ref_start.transaction)
                        },
                    );
                    if let Some(first_rejected) = first_rejected {
                        let tail: Vec<ExecutionItem> = self.exe_queue[queue_index]
                            .executions
                            .drain(first_rejected..)
                            .collect();
                        let mut rejected = Vec::new();
                        let mut restart = Vec::new();
                        for mut execution in tail {
                            if rejected_indices.contains(&execution.ref_start.transaction) {
                                // keep result, the new_state is still required
                                rejected.push(execution);
                            } else {
                                execution.result.clear();
                                restart.push(execution);
                            }
                        }
                        debug!(
                            sequence,
                            completed = self.exe_queue[queue_index].executions.len(),
                            rejected = rejected.len(),
                            restart = restart.len(),
                            "queue item is split"
                        );

                        if !rejected.is_empty() {
                            let mut rejected_item = self.exe_queue[queue_index].fork();
                            rejected_item.executions = rejected;
                            set_status_fields(
                                &mut rejected_item,
                                current_sequence,
                                SmartContractStatus::Finished,
                            );
                            rejected_item.is_rejected = true;
                            let mut integral_pack = TransactionsPacket::new();
                            let abs_addr = rejected_item.abs_addr;
                            for execution in &mut rejected_item.executions {
                                let found = execution
                                    .result
                                    .transactions()
                                    .iter()
                                    .find(|transaction| {
                                        transaction.is_new_state()
                                            && self
                                                .chain
                                                .public_key_of(&transaction.target)
                                                .map(|key| key == abs_addr)
                                                .unwrap_or(false)
                                    })
                                    .cloned();
                                if let Some(mut transaction) = found {
                                    transaction.add_user_field(
                                        user_fields::VALUE,
                                        UserFieldValue::Bytes(Vec::new()),
                                    );
                                    if let Ok(field) =
                                        ReturnValue::error(ContractErrorCode::ConsensusRejected)
                                            .to_user_field()
                                    {
                                        transaction.add_user_field(user_fields::RET_VAL, field);
                                    }
                                    integral_pack.add_transaction(transaction.clone());
                                    execution.result.clear();
                                    execution.result.add_transaction(transaction);
                                }
                            }
                            if let Some(first) = rejected_item.executions.first() {
                                let id = smart_consensus_id(
                                    first.ref_start.sequence,
                                    first.ref_start.transaction as u16,
                                    0,
                                );
                                self.consensus.start_smart_consensus(&integral_pack, id);
                            }
                            new_queue_items.push(rejected_item);
                        }
                        if !restart.is_empty() {
                            let mut restart_item = self.exe_queue[queue_index].fork();
                            restart_item.executions = restart;
                            set_status_fields(
                                &mut restart_item,
                                current_sequence,
                                SmartContractStatus::Waiting,
                            );
                            new_queue_items.push(restart_item);
                        }
                    }
                }
                if self.exe_queue[queue_index].executions.is_empty() {
                    self.exe_queue.remove(queue_index);
                    continue;
                }
                queue_index += 1;
            }
            self.exe_queue.extend(new_queue_items);
        }

        self.test_exe_queue();
    }

    // ---- contract state ------------------------------------------------

    fn update_contract_state(&mut self, transaction: &Transaction, reading_db: bool) -> bool {
        let Some(field) = transaction.user_field(user_fields::VALUE) else {
            error!("contract state is not updated, transaction does not contain it");
            return false;
        };
        let Some(state_value) = field.as_bytes() else {
            error!("contract state field has unexpected type");
            return false;
        };
        let reference = transaction
            .user_field(user_fields::REF_START)
            .and_then(|field| SmartContractRef::from_user_field(field).ok());

        if !state_value.is_empty() {
            let Some(abs_addr) = self.absolute_address(&transaction.target) else {
                if reading_db {
                    debug!("(error in blockchain) cannot find contract by address from new_state");
                } else {
                    error!("failed to convert optimized address");
                }
                return false;
            };
            let state_value = state_value.to_vec();
            match reference {
                Some(reference) => {
                    let starter = get_transaction(&self.chain, &reference);
                    let item = self.known_contracts.entry(abs_addr).or_default();
                    item.state = state_value;
                    match starter {
                        Some(starter) if is_executable_transaction(&starter) => {
                            if is_deploy_transaction(&starter) {
                                item.ref_deploy = Some(reference);
                            } else {
                                item.ref_execute = Some(reference);
                            }
                        }
                        Some(_) => {
                            // new_state after a replenish transaction
                            let payable = item.payable;
                            item.ref_execute = Some(reference);
                            if reading_db {
                                let before = self.replenish_contract.len();
                                self.replenish_contract
                                    .retain(|pending| *pending != reference);
                                if before == self.replenish_contract.len() {
                                    debug!("(error in blockchain) cannot find replenish transaction new_state refers to");
                                }
                            } else if !payable.implemented() {
                                error!("non-payable contract state is updated by replenish transaction");
                            }
                        }
                        None => {
                            if reading_db {
                                debug!("(error in blockchain) cannot find starter transaction new_state refers to");
                            } else {
                                warn!("new_state transaction does not refer to starter one");
                            }
                        }
                    }
                }
                None => {
                    let item = self.known_contracts.entry(abs_addr).or_default();
                    item.state = state_value;
                    warn!("new_state transaction does not refer to starter one");
                }
            }
            true
        } else {
            // failed execution: drop a matching replenish watch, if any
            if let Some(reference) = reference {
                self.replenish_contract
                    .retain(|pending| *pending != reference);
            }
            let error_message = transaction
                .user_field(user_fields::RET_VAL)
                .and_then(|field| ReturnValue::from_user_field(field).ok())
                .map(|value| match value {
                    ReturnValue::Byte(code) => crate::executor::error_message(code),
                    ReturnValue::Text(text) => text,
                    _ => "execution is failed".to_string(),
                })
                .unwrap_or_else(|| "execution is failed".to_string());
            debug!(error = %error_message, "contract state is not updated");
            false
        }
    }

    // ---- metadata and payable ------------------------------------------

    fn is_metadata_actual(&self, key: &PublicKeyBytes) -> bool {
        self.known_contracts
            .get(key)
            .map(|state| state.payable != PayableStatus::Unknown)
            .unwrap_or(false)
    }

    fn find_deploy_info(&self, key: &PublicKeyBytes) -> Option<ContractInvocation> {
        let state = self.known_contracts.get(key)?;
        let deploy = get_transaction(&self.chain, &state.ref_deploy?)?;
        ContractInvocation::from_transaction(&deploy)
    }

    /// The full invocation of a transaction: a deploy as-is, a start merged
    /// with its deploy's bytecode, a new_state or replenish resolved through
    /// the deploy reference.
    fn get_smart_contract_impl(&self, transaction: &Transaction) -> Option<ContractInvocation> {
        let abs_addr = self.absolute_address(&transaction.target)?;
        if !transaction.is_smart_contract() {
            if !self.known_contracts.contains_key(&abs_addr) {
                return None;
            }
            // replenish: the payable method of the deployed contract
            let mut invocation = self.find_deploy_info(&abs_addr)?;
            invocation.method = PAYABLE_NAME.to_string();
            invocation.params.clear();
            return Some(invocation);
        }
        if transaction.is_new_state() {
            return self.find_deploy_info(&abs_addr);
        }
        let invocation = ContractInvocation::from_transaction(transaction)?;
        if invocation.is_deploy() {
            Some(invocation)
        } else {
            let mut deploy = self.find_deploy_info(&abs_addr)?;
            deploy.method = invocation.method;
            deploy.params = invocation.params;
            Some(deploy)
        }
    }

    /// Fetches the method table from the executor, refreshing payable status
    /// and declared uses. Failure marks execution as not allowed until the
    /// executor is reachable again.
    fn update_metadata(&mut self, invocation: &ContractInvocation, key: &PublicKeyBytes) -> bool {
        match self.executor.contract_methods(&invocation.byte_code_objects) {
            Ok(methods) => {
                if let Some(state) = self.known_contracts.get_mut(key) {
                    state.payable = methods.payable_status();
                    state.uses = methods.uses();
                }
                true
            }
            Err(err) => {
                self.execution_allowed = self.executor.is_connected();
                if !self.execution_allowed {
                    warn!("unable to connect to executor");
                } else {
                    warn!(?err, "executor metadata fetch failed");
                }
                false
            }
        }
    }

    fn is_payable(&mut self, key: &PublicKeyBytes) -> bool {
        let Some(state) = self.known_contracts.get(key) else {
            return false;
        };
        if state.payable != PayableStatus::Unknown {
            return state.payable.implemented();
        }
        // first-time probe, a bounded blocking call to the executor
        let Some(deploy) = self.find_deploy_info(key) else {
            return false;
        };
        if !self.update_metadata(&deploy, key) {
            return false;
        }
        self.known_contracts
            .get(key)
            .map(|state| state.payable.implemented())
            .unwrap_or(false)
    }

    fn is_payable_target(&mut self, transaction: &Transaction) -> bool {
        if transaction.is_smart_contract() {
            return false;
        }
        let Some(key) = self.absolute_address(&transaction.target) else {
            return false;
        };
        if !self.known_contracts.contains_key(&key) {
            return false;
        }
        self.is_payable(&key)
    }

    /// Enlarges a call's uses set with the metadata-declared subcalls of the
    /// invoked method, recursively.
    fn add_uses_from(
        &mut self,
        key: &PublicKeyBytes,
        method: &str,
        uses: &mut Vec<PublicKeyBytes>,
    ) {
        let needs_refresh = self
            .known_contracts
            .get(key)
            .map(|state| state.uses.is_empty() && state.payable == PayableStatus::Unknown)
            .unwrap_or(false);
        if needs_refresh {
            if let Some(invocation) = self.find_deploy_info(key) {
                if !self.update_metadata(&invocation, key) {
                    info!("disable contract execution until connection to executor restored");
                    self.execution_allowed = false;
                }
            }
        }

        let subcalls: Vec<(Address, String)> = self
            .known_contracts
            .get(key)
            .and_then(|state| state.uses.get(method).cloned())
            .unwrap_or_default();
        for (address, subcall_method) in subcalls {
            let Some(sub_key) = self.absolute_address(&address) else {
                continue;
            };
            if uses.contains(&sub_key) {
                continue;
            }
            uses.push(sub_key);
            self.add_uses_from(&sub_key, &subcall_method, uses);
        }
    }

    fn executed_method_name(&self, transaction: &Transaction) -> String {
        if is_executable_transaction(transaction) {
            return ContractInvocation::from_transaction(transaction)
                .map(|invocation| invocation.method)
                .unwrap_or_default();
        }
        PAYABLE_NAME.to_string()
    }

    // ---- admission gate ------------------------------------------------

    /// Pre-admission test for API transactions; `true` means drop. Contracts
    /// may not emit through the API, and a contract target must be deployed
    /// and payable before it can be replenished.
    pub fn capture_transaction(&mut self, transaction: &Transaction) -> bool {
        if let Some(source) = self.absolute_address(&transaction.source) {
            if self.known_contracts.contains_key(&source) {
                debug!("smart contract is not allowed to emit transaction via API, drop it");
                return true;
            }
        }

        let Some(target) = self.absolute_address(&transaction.target) else {
            return false;
        };
        let (is_contract, has_state) = match self.known_contracts.get(&target) {
            Some(state) => (true, !state.state.is_empty()),
            None => (false, false),
        };
        if !is_contract {
            return false;
        }
        if !has_state {
            info!("unable to execute not successfully deployed contract, drop transaction");
            return true;
        }
        if !self.is_payable(&target) {
            if transaction.amount > 0 {
                info!("unable to replenish balance of contract without payable(), drop transaction");
                return true;
            }
            if !transaction.is_smart_contract() {
                info!("unable to call payable(), feature is not implemented in contract, drop transaction");
                return true;
            }
        } else if is_executable_transaction(transaction) {
            if let Some(invocation) = ContractInvocation::from_transaction(transaction) {
                if invocation.method == PAYABLE_NAME {
                    info!("unable to call payable() directly, drop transaction");
                    return true;
                }
            }
        }
        false
    }

    // ---- locks ---------------------------------------------------------

    fn is_locked(&self, key: &PublicKeyBytes) -> bool {
        self.known_contracts
            .get(key)
            .map(|state| state.is_locked)
            .unwrap_or(false)
    }

    fn update_lock_status(&mut self, key: &PublicKeyBytes, value: bool) {
        if let Some(state) = self.known_contracts.get_mut(key) {
            if state.is_locked != value {
                debug!(
                    contract = %hex::encode(key),
                    locked = value,
                    "contract lock changed"
                );
                state.is_locked = value;
            }
        }
    }

    fn lock_item(&mut self, index: usize, value: bool) {
        let abs_addr = self.exe_queue[index].abs_addr;
        let uses: Vec<PublicKeyBytes> = self.exe_queue[index]
            .executions
            .iter()
            .flat_map(|execution| execution.uses.iter().copied())
            .collect();
        self.update_lock_status(&abs_addr, value);
        for key in uses {
            self.update_lock_status(&key, value);
        }
    }

    fn unlock_item(&mut self, item: &QueueItem) {
        let abs_addr = item.abs_addr;
        let uses: Vec<PublicKeyBytes> = item
            .executions
            .iter()
            .flat_map(|execution| execution.uses.iter().copied())
            .collect();
        self.update_lock_status(&abs_addr, false);
        for key in uses {
            self.update_lock_status(&key, false);
        }
    }

    /// With nothing Running or Finished no contract may stay locked.
    fn test_contracts_locks(&mut self) {
        let busy = self.exe_queue.iter().any(|item| {
            item.status == SmartContractStatus::Running
                || item.status == SmartContractStatus::Finished
        });
        if busy {
            return;
        }
        for (key, state) in self.known_contracts.iter_mut() {
            if state.is_locked {
                state.is_locked = false;
                debug!(
                    contract = %hex::encode(key),
                    "found locked contract which is not executed now, unlock"
                );
            }
        }
    }

    fn update_status_at(&mut self, index: usize, sequence: u64, status: SmartContractStatus) {
        set_status_fields(&mut self.exe_queue[index], sequence, status);
        match status {
            SmartContractStatus::Running => self.lock_item(index, true),
            SmartContractStatus::Closed => self.lock_item(index, false),
            _ => {}
        }
    }

    fn test_executor_availability(&mut self) -> bool {
        if !self.execution_allowed {
            self.execution_allowed = self.executor.is_connected();
            if self.execution_allowed {
                info!("connection to executor is restored");
                // refresh metadata missed while the executor was unavailable
                let stale: Vec<PublicKeyBytes> = self
                    .exe_queue
                    .iter()
                    .filter(|item| {
                        item.status == SmartContractStatus::Running
                            || item.status == SmartContractStatus::Finished
                    })
                    .map(|item| item.abs_addr)
                    .filter(|key| !self.is_metadata_actual(key))
                    .collect();
                for key in stale {
                    if let Some(invocation) = self.find_deploy_info(&key) {
                        if !self.update_metadata(&invocation, &key) && !self.execution_allowed {
                            break;
                        }
                    }
                }
            }
        }
        self.execution_allowed
    }

    fn contains_me(&self, confidants: &[PublicKeyBytes]) -> bool {
        confidants.iter().any(|key| *key == self.node_id)
    }
}

impl crate::validator::ContractsView for SmartContracts {
    fn is_known_contract(&self, key: &PublicKeyBytes) -> bool {
        self.known_contracts.contains_key(key)
    }
}

fn set_status_fields(item: &mut QueueItem, sequence: u64, status: SmartContractStatus) {
    item.status = status;
    match status {
        SmartContractStatus::Waiting => {
            item.seq_enqueue = sequence;
            debug!(seq = item.seq_enqueue, "waiting");
        }
        SmartContractStatus::Running => {
            item.seq_start = sequence;
            debug!(seq = item.seq_enqueue, "running");
        }
        SmartContractStatus::Finished => {
            item.seq_finish = sequence;
            debug!(seq = item.seq_enqueue, "finished");
        }
        SmartContractStatus::Closed => {
            debug!(seq = item.seq_enqueue, "closed");
        }
    }
}

/// The executor job: runs a queue item's calls in order, feeding each call's
/// fresh state to the next one.
fn run_executions(
    executor: &dyn ContractExecutor,
    calls: Vec<PreparedCall>,
) -> Vec<SmartExecutionData> {
    let mut last_state: Vec<u8> = Vec::new();
    let mut results = Vec::with_capacity(calls.len());
    for call in calls {
        let mut data = call.data;
        let mut request = call.request;
        if data.is_failed() {
            results.push(data);
            continue;
        }
        if !last_state.is_empty() {
            request.contract_state = last_state.clone();
        }
        match executor.execute(request) {
            Ok(outcome) => {
                if outcome.new_state.is_empty() {
                    data.outcome = outcome;
                    data.set_error(
                        ContractErrorCode::Exception,
                        "contract execution failed, new contract state is empty",
                    );
                } else {
                    let total_fee = fees::execution_fee(outcome.execution_cost);
                    if total_fee > data.executor_fee {
                        data.outcome = outcome;
                        data.set_error(
                            ContractErrorCode::OutOfFunds,
                            "contract execution is out of funds",
                        );
                    } else {
                        data.executor_fee = total_fee;
                        last_state = outcome.new_state.clone();
                        data.outcome = outcome;
                    }
                }
            }
            Err(err) => {
                data.set_error(ContractErrorCode::ExecuteTransaction, err.to_string());
            }
        }
        results.push(data);
    }
    results
}
