#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use tempfile::TempDir;

use conclave_chain::chain::BlockChain;
use conclave_chain::crypto::{self, PublicKeyBytes};
use conclave_chain::errors::{ChainError, ChainResult};
use conclave_chain::executor::{
    ByteCodeObject, ContractExecutor, ContractInvocation, ContractMethods, ExecuteRequest,
    ExecutionOutcome, ReturnValue,
};
use conclave_chain::interfaces::{ConsensusGateway, NodeGateway};
use conclave_chain::scheduler::valid_smart_address;
use conclave_chain::types::{
    user_fields, Address, Pool, PoolHash, Transaction, TransactionsPacket,
};

pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn public_key(seed: u8) -> PublicKeyBytes {
    signing_key(seed).verifying_key().to_bytes()
}

pub fn sign_transaction(transaction: &mut Transaction, key: &SigningKey) {
    let bytes = transaction.signing_bytes();
    transaction.signature = crypto::sign_message(key, &bytes);
}

pub fn open_chain() -> (TempDir, Arc<BlockChain>) {
    let dir = TempDir::new().expect("create temp dir for chain");
    let chain = BlockChain::open(&dir.path().join("db"), None).expect("open blockchain");
    (dir, Arc::new(chain))
}

/// A block crediting each listed wallet from an external faucet key.
pub fn funding_block(
    sequence: u64,
    previous_hash: PoolHash,
    credits: &[(PublicKeyBytes, u128)],
    confidants: Vec<PublicKeyBytes>,
) -> Pool {
    let mut pool = Pool::new(sequence, previous_hash);
    pool.set_confidants(confidants);
    for (index, (target, amount)) in credits.iter().enumerate() {
        let mut tx = Transaction::new(
            index as u64 + 1,
            Address::Key(public_key(250)),
            Address::Key(*target),
            1,
            *amount,
            100,
        );
        tx.counted_fee = 10;
        pool.add_transaction(tx);
    }
    pool.compose();
    pool
}

pub fn empty_block(sequence: u64, previous_hash: PoolHash) -> Pool {
    let mut pool = Pool::new(sequence, previous_hash);
    pool.compose();
    pool
}

/// A deploy transaction with a correctly derived contract address; returns
/// the transaction and the contract's key.
pub fn deploy_transaction(
    deployer: &SigningKey,
    inner_id: u64,
    bytecode: Vec<u8>,
    max_fee: u64,
) -> (Transaction, PublicKeyBytes) {
    let invocation = ContractInvocation::deploy(vec![ByteCodeObject {
        name: "Main".into(),
        code: bytecode,
    }]);
    let contract = valid_smart_address(
        &deployer.verifying_key().to_bytes(),
        inner_id,
        &invocation.concatenated_bytecode(),
    );
    let mut tx = Transaction::new(
        inner_id,
        Address::Key(deployer.verifying_key().to_bytes()),
        Address::Key(contract),
        1,
        0,
        max_fee,
    );
    tx.add_user_field(
        user_fields::CODE,
        invocation.to_user_field().expect("encode deploy invocation"),
    );
    tx.counted_fee = 10;
    sign_transaction(&mut tx, deployer);
    (tx, contract)
}

pub fn start_transaction(
    caller: &SigningKey,
    inner_id: u64,
    contract: PublicKeyBytes,
    method: &str,
    max_fee: u64,
) -> Transaction {
    let invocation = ContractInvocation::start(method, Vec::new());
    let mut tx = Transaction::new(
        inner_id,
        Address::Key(caller.verifying_key().to_bytes()),
        Address::Key(contract),
        1,
        0,
        max_fee,
    );
    tx.add_user_field(
        user_fields::CODE,
        invocation.to_user_field().expect("encode start invocation"),
    );
    tx.counted_fee = 10;
    sign_transaction(&mut tx, caller);
    tx
}

/// Executor double: echoes the previous state with one byte appended, so
/// state chaining across multi-call executions is observable.
pub struct MockExecutor {
    pub connected: AtomicBool,
    pub methods: Mutex<ContractMethods>,
    pub requests: Mutex<Vec<ExecuteRequest>>,
    pub execution_cost: u64,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(true),
            methods: Mutex::new(ContractMethods::default()),
            requests: Mutex::new(Vec::new()),
            execution_cost: 1,
        }
    }
}

impl ContractExecutor for MockExecutor {
    fn contract_methods(&self, _byte_code: &[ByteCodeObject]) -> ChainResult<ContractMethods> {
        if !self.is_connected() {
            return Err(ChainError::Contract("executor is not connected".into()));
        }
        Ok(self.methods.lock().clone())
    }

    fn execute(&self, request: ExecuteRequest) -> ChainResult<ExecutionOutcome> {
        if !self.is_connected() {
            return Err(ChainError::Contract("executor is not connected".into()));
        }
        let mut new_state = request.contract_state.clone();
        new_state.push(b'x');
        self.requests.lock().push(request);
        Ok(ExecutionOutcome {
            new_state,
            ret_value: ReturnValue::Void,
            emitted: Vec::new(),
            subsequent_states: Default::default(),
            execution_cost: self.execution_cost,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Records every smart-consensus session the scheduler starts.
#[derive(Default)]
pub struct RecordingConsensus {
    pub sessions: Mutex<Vec<(TransactionsPacket, u64)>>,
    pub fake_stages: Mutex<Vec<(u8, u64)>>,
}

impl ConsensusGateway for RecordingConsensus {
    fn start_smart_consensus(&self, packet: &TransactionsPacket, id: u64) -> bool {
        self.sessions.lock().push((packet.clone(), id));
        true
    }

    fn send_fake_stages(&self, _confidants: &[PublicKeyBytes], own_index: u8, id: u64) {
        self.fake_stages.lock().push((own_index, id));
    }
}

pub struct TestGateway {
    pub always_execute: bool,
    pub confidants: Vec<PublicKeyBytes>,
    pub sent_packets: Mutex<Vec<TransactionsPacket>>,
}

impl TestGateway {
    pub fn new(always_execute: bool) -> Self {
        Self {
            always_execute,
            confidants: Vec::new(),
            sent_packets: Mutex::new(Vec::new()),
        }
    }
}

impl NodeGateway for TestGateway {
    fn send_packet(&self, packet: &TransactionsPacket) {
        self.sent_packets.lock().push(packet.clone());
    }

    fn smart_confidants(&self, _sequence: u64) -> Vec<PublicKeyBytes> {
        self.confidants.clone()
    }

    fn always_execute_contracts(&self) -> bool {
        self.always_execute
    }
}
