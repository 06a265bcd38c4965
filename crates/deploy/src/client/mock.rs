//! In-memory [`ChainClient`] for tests and dry runs.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use alloy_core::primitives::{Address, TxHash};

use super::{ChainClient, ClientError, DeployRequest, DeploymentReceipt, FeeEstimate};
use crate::submitter::SignedDeployment;

/// Base gas of a creation transaction.
const CREATE_GAS: u64 = 53_000;
/// Replacements must raise both fee caps by at least this percentage.
const REPLACEMENT_BUMP_PERCENT: u128 = 10;

#[derive(Debug)]
struct ChainState {
    height: u64,
    fees: FeeEstimate,
    /// Mined transaction count per sender.
    nonces: HashMap<Address, u64>,
    receipts: HashMap<TxHash, DeploymentReceipt>,
    sent: Vec<SignedDeployment>,
    /// Accepted but not mined, oldest first.
    pool: Vec<SignedDeployment>,
    send_failures: VecDeque<ClientError>,
    estimate_failures: VecDeque<ClientError>,
    drop_broadcasts: usize,
    revert_deployments: usize,
    mine_replaced: bool,
}

/// A single-node chain that mines every accepted transaction immediately.
///
/// Failures are scripted: the next sends or estimates can be made to fail, the next
/// broadcasts can be accepted without ever being mined, and deployments can revert.
#[derive(Debug)]
pub struct InMemoryChain {
    chain_id: u64,
    state: Mutex<ChainState>,
}

impl InMemoryChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(ChainState {
                height: 1,
                fees: FeeEstimate {
                    max_fee_per_gas: 2_000_000_000,
                    max_priority_fee_per_gas: 1_000_000_000,
                },
                nonces: HashMap::new(),
                receipts: HashMap::new(),
                sent: Vec::new(),
                pool: Vec::new(),
                send_failures: VecDeque::new(),
                estimate_failures: VecDeque::new(),
                drop_broadcasts: 0,
                revert_deployments: 0,
                mine_replaced: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every transaction accepted so far, in broadcast order.
    pub fn sent(&self) -> Vec<SignedDeployment> {
        self.state().sent.clone()
    }

    /// Number of transactions mined from `address`.
    pub fn mined_count(&self, address: Address) -> u64 {
        self.state().mined(address)
    }

    pub fn receipt(&self, hash: &TxHash) -> Option<DeploymentReceipt> {
        self.state().receipts.get(hash).cloned()
    }

    pub fn set_fees(&self, fees: FeeEstimate) {
        self.state().fees = fees;
    }

    /// Make the next broadcast fail with `error` without reaching the pool.
    pub fn fail_next_send(&self, error: ClientError) {
        self.state().send_failures.push_back(error);
    }

    pub fn fail_next_estimate(&self, error: ClientError) {
        self.state().estimate_failures.push_back(error);
    }

    /// Accept the next `count` broadcasts but leave them unmined.
    pub fn drop_next_broadcasts(&self, count: usize) {
        self.state().drop_broadcasts += count;
    }

    /// Mine the next `count` deployments with a failed status.
    pub fn revert_next_deployments(&self, count: usize) {
        self.state().revert_deployments += count;
    }

    /// When a replacement arrives for an unmined transaction, mine the original first.
    pub fn mine_replaced_transactions(&self, enabled: bool) {
        self.state().mine_replaced = enabled;
    }

    /// Mine pooled transactions in nonce order, the oldest broadcast of each nonce first.
    pub fn mine_pending(&self) -> usize {
        let mut state = self.state();
        let mut mined = 0;
        loop {
            let Some(transaction) = state
                .pool
                .iter()
                .find(|pooled| pooled.nonce == state.mined(pooled.from))
                .cloned()
            else {
                return mined;
            };
            mine(&mut state, &transaction);
            mined += 1;
        }
    }
}

impl ChainState {
    fn mined(&self, address: Address) -> u64 {
        self.nonces.get(&address).copied().unwrap_or_default()
    }

    /// Next nonce after the mined transactions and the gapless run of pooled ones.
    fn pending(&self, address: Address) -> u64 {
        let mut next = self.mined(address);
        while self
            .pool
            .iter()
            .any(|pooled| pooled.from == address && pooled.nonce == next)
        {
            next += 1;
        }
        next
    }
}

fn mine(state: &mut ChainState, transaction: &SignedDeployment) {
    state.height += 1;
    state.nonces.insert(transaction.from, transaction.nonce + 1);
    state
        .pool
        .retain(|pooled| !(pooled.from == transaction.from && pooled.nonce == transaction.nonce));

    let success = if state.revert_deployments > 0 {
        state.revert_deployments -= 1;
        false
    } else {
        true
    };

    state.receipts.insert(
        transaction.hash,
        DeploymentReceipt {
            tx_hash: transaction.hash,
            block_number: state.height,
            contract_address: success.then(|| transaction.from.create(transaction.nonce)),
            success,
        },
    );
}

impl ChainClient for InMemoryChain {
    async fn chain_id(&self) -> Result<u64, ClientError> {
        Ok(self.chain_id)
    }

    /// Every call advances the chain by one block, so confirmations accrue while polling.
    async fn block_number(&self) -> Result<u64, ClientError> {
        let mut state = self.state();
        state.height += 1;
        Ok(state.height)
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, ClientError> {
        Ok(self.state().pending(address))
    }

    async fn mined_nonce(&self, address: Address) -> Result<u64, ClientError> {
        Ok(self.state().mined(address))
    }

    async fn estimate_gas(&self, request: &DeployRequest) -> Result<u64, ClientError> {
        if let Some(error) = self.state().estimate_failures.pop_front() {
            return Err(error);
        }
        Ok(CREATE_GAS + 16 * request.input.len() as u64)
    }

    async fn fee_estimate(&self) -> Result<FeeEstimate, ClientError> {
        Ok(self.state().fees)
    }

    async fn send_transaction(&self, transaction: &SignedDeployment) -> Result<TxHash, ClientError> {
        let mut state = self.state();

        if let Some(error) = state.send_failures.pop_front() {
            return Err(error);
        }
        if state.receipts.contains_key(&transaction.hash)
            || state.pool.iter().any(|pooled| pooled.hash == transaction.hash)
        {
            return Err(ClientError::AlreadyKnown(transaction.hash.to_string()));
        }

        let replaced = state
            .pool
            .iter()
            .find(|pooled| pooled.from == transaction.from && pooled.nonce == transaction.nonce)
            .cloned();
        if let Some(replaced) = replaced {
            if state.mine_replaced {
                mine(&mut state, &replaced);
            } else {
                let min_fee = replaced.max_fee_per_gas * (100 + REPLACEMENT_BUMP_PERCENT) / 100;
                let min_tip =
                    replaced.max_priority_fee_per_gas * (100 + REPLACEMENT_BUMP_PERCENT) / 100;
                if transaction.max_fee_per_gas < min_fee
                    || transaction.max_priority_fee_per_gas < min_tip
                {
                    return Err(ClientError::Underpriced(format!(
                        "replacement of nonce {} needs at least {min_fee} wei",
                        transaction.nonce
                    )));
                }
            }
        }

        let next = state.mined(transaction.from);
        if transaction.nonce < next {
            return Err(ClientError::NonceTooLow(format!(
                "next nonce {next}, tx nonce {}",
                transaction.nonce
            )));
        }
        let pending = state.pending(transaction.from);
        if transaction.nonce > pending {
            return Err(ClientError::Rpc(format!(
                "nonce gap: next nonce {pending}, tx nonce {}",
                transaction.nonce
            )));
        }

        state.sent.push(transaction.clone());
        if state.drop_broadcasts > 0 {
            state.drop_broadcasts -= 1;
            state.pool.push(transaction.clone());
        } else if transaction.nonce == next {
            mine(&mut state, transaction);
        } else {
            // Queued behind an unmined nonce.
            state.pool.push(transaction.clone());
        }

        Ok(transaction.hash)
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<DeploymentReceipt>, ClientError> {
        Ok(self.state().receipts.get(&hash).cloned())
    }
}
