use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::chain::BlockChain;
use crate::conveyer::Characteristic;
use crate::crypto::PublicKeyBytes;
use crate::fees;
use crate::interfaces::RefExecution;
use crate::scheduler::{is_deploy_transaction, valid_smart_address};
use crate::types::{
    user_fields, SmartContractRef, Transaction, TransactionsPacket,
};

const VALID: u8 = 1;
const INVALID: u8 = 0;

/// Read-only view into the scheduler's contract table, enough for the
/// validator to recognize contract-emitted transactions.
pub trait ContractsView: Sync {
    fn is_known_contract(&self, key: &PublicKeyBytes) -> bool;
}

impl ContractsView for HashSet<PublicKeyBytes> {
    fn is_known_contract(&self, key: &PublicKeyBytes) -> bool {
        self.contains(key)
    }
}

pub struct ValidationContext<'a> {
    pub chain: &'a BlockChain,
    pub contracts: &'a dyn ContractsView,
}

/// Produces the round characteristic by iterated validation. Deterministic:
/// every confidant derives the same mask from the same inputs.
#[derive(Default)]
pub struct IterValidator {
    smart_source_invalid_signatures: HashSet<PublicKeyBytes>,
}

impl IterValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn form_characteristic(
        &mut self,
        context: &ValidationContext<'_>,
        transactions: &mut [Transaction],
        smart_packets: &[TransactionsPacket],
    ) -> (Characteristic, Vec<RefExecution>) {
        let mut mask = vec![VALID; transactions.len()];

        self.check_transactions_signatures(context, transactions, &mut mask, smart_packets);

        let mut iteration = 1usize;
        loop {
            debug!(iteration, "validation iteration");
            fees::set_transactions_fees(transactions, &mask);
            let need_one_more = self.validate_transactions(context, &mut mask, transactions);
            iteration += 1;
            if !need_one_more {
                break;
            }
        }

        let rejected_smarts = collect_rejected_smarts(&mask, transactions);
        if !rejected_smarts.is_empty() {
            info!(
                count = rejected_smarts.len(),
                "rejecting new_state(s) of smart contract(s)"
            );
        }
        (Characteristic { mask }, rejected_smarts)
    }

    fn validate_transactions(
        &mut self,
        context: &ValidationContext<'_>,
        mask: &mut [u8],
        transactions: &[Transaction],
    ) -> bool {
        let mut need_one_more_iteration = false;
        let mut blocked = 0usize;

        for (index, transaction) in transactions.iter().enumerate() {
            if mask[index] == INVALID {
                continue;
            }
            let mut is_valid = transaction.max_fee >= transaction.counted_fee;
            if is_valid && is_deploy_transaction(transaction) {
                is_valid = self.deploy_additional_check(context, index, transaction);
            }
            if !is_valid {
                debug!(index, "transaction rejected by validator");
                mask[index] = INVALID;
                need_one_more_iteration = true;
                blocked += 1;
            }
        }

        // graph pass: replay the round against wallet balances, cascading
        // rejection onto transactions left unfunded by earlier rejections
        let removed_by_graph = self.validate_by_graph(context, mask, transactions);
        if blocked == 0 && removed_by_graph == 0 {
            need_one_more_iteration = false;
        }
        if removed_by_graph > 0 {
            info!(removed_by_graph, "transactions rejected by graph validation");
            need_one_more_iteration = true;
        }

        // iterations switched off
        if need_one_more_iteration {
            debug!("another pass requested, multi-pass validation is disabled");
        }
        false
    }

    fn validate_by_graph(
        &mut self,
        context: &ValidationContext<'_>,
        mask: &mut [u8],
        transactions: &[Transaction],
    ) -> usize {
        let mut balances: HashMap<PublicKeyBytes, u128> =
            context.chain.wallets().balances_snapshot();
        let mut removed = 0usize;

        for (index, transaction) in transactions.iter().enumerate() {
            if mask[index] == INVALID {
                continue;
            }
            // new_state transactions spend no wallet funds
            if transaction.is_new_state() {
                continue;
            }
            let Some(source) = context.chain.public_key_of(&transaction.source) else {
                mask[index] = INVALID;
                removed += 1;
                continue;
            };
            let required = transaction
                .amount
                .saturating_add(transaction.max_fee as u128);
            let available = balances.get(&source).copied().unwrap_or(0);
            if available < required {
                debug!(index, "transaction unfunded, rejected by graph");
                mask[index] = INVALID;
                removed += 1;
                continue;
            }
            *balances.entry(source).or_insert(0) = available
                - transaction.amount
                - transaction.counted_fee.min(transaction.max_fee) as u128;
            if let Some(target) = context.chain.public_key_of(&transaction.target) {
                *balances.entry(target).or_insert(0) += transaction.amount;
            }
        }
        removed
    }

    fn deploy_additional_check(
        &self,
        context: &ValidationContext<'_>,
        index: usize,
        transaction: &Transaction,
    ) -> bool {
        let invocation = crate::executor::ContractInvocation::from_transaction(transaction);
        let is_valid = match invocation {
            Some(invocation) if invocation.is_deploy() => {
                let deployer = context.chain.public_key_of(&transaction.source);
                let target = context.chain.public_key_of(&transaction.target);
                match (deployer, target) {
                    (Some(deployer), Some(target)) => {
                        valid_smart_address(
                            &deployer,
                            transaction.inner_id,
                            &invocation.concatenated_bytecode(),
                        ) == target
                    }
                    _ => false,
                }
            }
            _ => true,
        };
        if !is_valid {
            info!(index, "transaction rejected, malformed contract address");
        }
        is_valid
    }

    fn check_transactions_signatures(
        &mut self,
        context: &ValidationContext<'_>,
        transactions: &[Transaction],
        mask: &mut [u8],
        smart_packets: &[TransactionsPacket],
    ) {
        self.check_signatures_smart_source(context, smart_packets);
        let mut rejected = 0usize;
        for (index, transaction) in transactions.iter().enumerate() {
            if !self.check_transaction_signature(context, transaction) {
                mask[index] = INVALID;
                rejected += 1;
                info!(index, "transaction rejected, incorrect signature");
            }
        }
        if rejected > 0 {
            info!(rejected, "wrong signatures in round");
        }
    }

    fn check_transaction_signature(
        &self,
        context: &ValidationContext<'_>,
        transaction: &Transaction,
    ) -> bool {
        let smart_source_transaction = !transaction.is_smart_contract()
            && context
                .chain
                .public_key_of(&transaction.source)
                .map(|key| context.contracts.is_known_contract(&key))
                .unwrap_or(false);

        if !transaction.is_new_state() && !smart_source_transaction {
            // ordinary transaction, verified under the sender's key
            match context.chain.public_key_of(&transaction.source) {
                Some(key) => transaction.verify_signature(&key),
                None => false,
            }
        } else {
            // contract self-transitions and contract-emitted transactions are
            // covered by their packet's confidant quorum instead
            if transaction.is_new_state() && transaction.source != transaction.target {
                debug!("smart state transaction has different source and target");
                return false;
            }
            let source = context.chain.public_key_of(&transaction.source);
            match source {
                Some(key) => !self.smart_source_invalid_signatures.contains(&key),
                None => false,
            }
        }
    }

    fn check_signatures_smart_source(
        &mut self,
        context: &ValidationContext<'_>,
        smart_packets: &[TransactionsPacket],
    ) {
        self.smart_source_invalid_signatures.clear();

        for packet in smart_packets {
            let Some(transaction) = packet.transactions().first() else {
                continue;
            };
            let Some(source) = context.chain.public_key_of(&transaction.source) else {
                continue;
            };

            let reference = transaction
                .user_field(user_fields::REF_START)
                .and_then(|field| SmartContractRef::from_user_field(field).ok());
            let Some(reference) = reference else {
                info!("contract ref is not properly set in transaction");
                self.smart_source_invalid_signatures.insert(source);
                continue;
            };

            let block = context.chain.load_block(reference.sequence).ok().flatten();
            let Some(block) = block else {
                info!("failed to load block with init transaction");
                self.smart_source_invalid_signatures.insert(source);
                continue;
            };

            if !packet.has_quorum(block.confidants()) {
                info!("not enough valid signatures on smart packet");
                self.smart_source_invalid_signatures.insert(source);
            }
        }
    }
}

fn collect_rejected_smarts(mask: &[u8], transactions: &[Transaction]) -> Vec<RefExecution> {
    let mut rejected = Vec::new();
    for (index, transaction) in transactions.iter().enumerate() {
        if mask.get(index).copied().unwrap_or(VALID) == INVALID && transaction.is_new_state() {
            if let Some(field) = transaction.user_field(user_fields::REF_START) {
                if let Ok(reference) = SmartContractRef::from_user_field(field) {
                    rejected.push((reference.sequence, reference.transaction));
                }
            }
        }
    }
    rejected
}
