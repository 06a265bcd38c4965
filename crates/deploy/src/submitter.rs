//! Nonce management, signing, broadcast and confirmation of deployment transactions.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use alloy_consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy_core::primitives::{Address, Bytes, TxHash, TxKind, U256};
use alloy_eips::eip2718::Encodable2718;
use alloy_network::TxSigner;
use alloy_signer_local::PrivateKeySigner;
use backon::{ExponentialBuilder, Retryable};
use thiserror::Error;

use crate::{
    DeployError,
    client::{ChainClient, ClientError, DeployRequest, DeploymentReceipt, FeeEstimate},
    network::{NetworkProfile, RetryPolicy},
};

/// A signed creation transaction, ready to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDeployment {
    pub from: Address,
    pub nonce: u64,
    pub hash: TxHash,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    /// EIP-2718 encoding of the signed transaction.
    pub raw: Bytes,
}

/// Durable log of broadcast attempts, written before each broadcast.
pub trait AttemptJournal: Send + Sync {
    fn record(
        &self,
        attempt: &SignedDeployment,
    ) -> impl Future<Output = Result<(), DeployError>> + Send;
}

/// Journal that keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJournal;

impl AttemptJournal for NoJournal {
    async fn record(&self, _attempt: &SignedDeployment) -> Result<(), DeployError> {
        Ok(())
    }
}

type NonceSlot = Arc<tokio::sync::Mutex<Option<u64>>>;

/// Next nonce per signer.
///
/// A signer's slot is locked for the whole submission, so at most one transaction
/// per signer is in flight. `None` means the next submission reads the chain.
#[derive(Debug, Default)]
pub struct NonceManager {
    slots: Mutex<HashMap<Address, NonceSlot>>,
}

impl NonceManager {
    fn slot(&self, address: Address) -> NonceSlot {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(address)
            .or_default()
            .clone()
    }

    /// The locally tracked next nonce of `address`, if any.
    pub async fn next(&self, address: Address) -> Option<u64> {
        *self.slot(address).lock().await
    }
}

/// A broadcast that an earlier run left unconfirmed.
///
/// Resuming it keeps the nonce, so the next attempt replaces the earlier ones instead
/// of queueing behind them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inflight {
    pub nonce: u64,
    /// Hashes already broadcast for `nonce`, oldest first.
    pub tx_hashes: Vec<TxHash>,
    /// Fee caps of the latest attempt, the floor for the replacement.
    pub fees: Option<FeeEstimate>,
}

/// A deployment included on chain with enough confirmations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmed {
    pub tx_hash: TxHash,
    pub address: Address,
    pub block_number: u64,
    pub nonce: u64,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    /// Rejected or reverted by the chain. Never retried.
    #[error("{0}")]
    Failed(String),
    #[error("not confirmed after {attempts} attempt(s): {last_error}")]
    Timeout { attempts: usize, last_error: String },
    #[error(transparent)]
    Journal(DeployError),
}

impl SubmitError {
    pub fn into_deploy_error(self, network: &str, contract: &str) -> DeployError {
        match self {
            Self::Failed(reason) => DeployError::DeploymentFailed {
                network: network.to_string(),
                contract: contract.to_string(),
                reason,
            },
            Self::Timeout {
                attempts,
                last_error,
            } => DeployError::TransactionTimeout {
                network: network.to_string(),
                contract: contract.to_string(),
                attempts,
                last_error,
            },
            Self::Journal(e) => e,
        }
    }
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
    #[error(transparent)]
    Journal(DeployError),
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ClientError> for AttemptError {
    fn from(e: ClientError) -> Self {
        if e.is_transient() {
            Self::Transient(e.to_string())
        } else {
            Self::Fatal(e.to_string())
        }
    }
}

/// Everything one submission carries from attempt to attempt.
#[derive(Debug, Default)]
struct Submission {
    attempts: usize,
    nonce: Option<u64>,
    /// Hashes broadcast for the current nonce, oldest first.
    hashes: Vec<TxHash>,
    last_fees: Option<FeeEstimate>,
}

/// Sends deployment transactions for one network and waits for their confirmation.
#[derive(Debug)]
pub struct TransactionSubmitter<C> {
    client: Arc<C>,
    network: String,
    chain_id: u64,
    confirmations: u64,
    gas_multiplier: f64,
    policy: RetryPolicy,
    nonces: NonceManager,
}

impl<C: ChainClient> TransactionSubmitter<C> {
    pub fn new(client: Arc<C>, profile: &NetworkProfile) -> Self {
        Self {
            client,
            network: profile.name.clone(),
            chain_id: profile.chain_id,
            confirmations: profile.confirmations,
            gas_multiplier: profile.gas_multiplier,
            policy: profile.retry.clone(),
            nonces: NonceManager::default(),
        }
    }

    pub fn nonces(&self) -> &NonceManager {
        &self.nonces
    }

    /// Deploy `input` from `signer`, retrying transient failures with the same nonce.
    ///
    /// The signer's nonce only advances once the transaction is confirmed. Any failure
    /// forgets the local nonce so the next submission starts from the chain again.
    pub async fn submit<J: AttemptJournal>(
        &self,
        signer: &PrivateKeySigner,
        input: Bytes,
        journal: &J,
    ) -> Result<Confirmed, SubmitError> {
        self.run(signer, input, journal, Submission::default()).await
    }

    /// Pick up `inflight` where an earlier run stopped.
    ///
    /// Receipts of the earlier hashes are checked first. If none is mined, a replacement
    /// with bumped fees is broadcast at the same nonce.
    pub async fn resume<J: AttemptJournal>(
        &self,
        signer: &PrivateKeySigner,
        input: Bytes,
        journal: &J,
        inflight: Inflight,
    ) -> Result<Confirmed, SubmitError> {
        let submission = Submission {
            attempts: 0,
            nonce: Some(inflight.nonce),
            hashes: inflight.tx_hashes,
            last_fees: inflight.fees,
        };
        self.run(signer, input, journal, submission).await
    }

    async fn run<J: AttemptJournal>(
        &self,
        signer: &PrivateKeySigner,
        input: Bytes,
        journal: &J,
        submission: Submission,
    ) -> Result<Confirmed, SubmitError> {
        let from = signer.address();
        let slot = self.nonces.slot(from);
        let mut next_nonce = slot.lock().await;

        let submission = tokio::sync::Mutex::new(submission);
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.policy.min_delay)
            .with_max_delay(self.policy.max_delay)
            .with_max_times(self.policy.max_attempts.saturating_sub(1))
            .with_jitter();

        let local_nonce = *next_nonce;
        let result = (|| self.attempt(&submission, signer, &input, local_nonce, journal))
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .when(AttemptError::is_transient)
            .notify(|err: &AttemptError, delay: Duration| {
                tracing::warn!(
                    network = %self.network,
                    from = %from,
                    err = %err,
                    delay = ?delay,
                    "Deployment attempt failed, retrying"
                );
            })
            .await;

        let attempts = submission.lock().await.attempts;
        match result {
            Ok(confirmed) => {
                let after = confirmed.nonce + 1;
                *next_nonce = Some(next_nonce.map_or(after, |local| local.max(after)));
                Ok(confirmed)
            }
            Err(e) => {
                *next_nonce = None;
                Err(match e {
                    AttemptError::Transient(last_error) => SubmitError::Timeout {
                        attempts,
                        last_error,
                    },
                    AttemptError::Fatal(reason) => SubmitError::Failed(reason),
                    AttemptError::Journal(e) => SubmitError::Journal(e),
                })
            }
        }
    }

    async fn attempt<J: AttemptJournal>(
        &self,
        submission: &tokio::sync::Mutex<Submission>,
        signer: &PrivateKeySigner,
        input: &Bytes,
        local_nonce: Option<u64>,
        journal: &J,
    ) -> Result<Confirmed, AttemptError> {
        let mut submission = submission.lock().await;
        submission.attempts += 1;
        let from = signer.address();

        // An earlier broadcast may have been mined while we were waiting.
        if let Some(receipt) = self.find_receipt(&submission.hashes).await? {
            return self.confirm(receipt, &submission, from).await;
        }

        let nonce = match submission.nonce {
            Some(nonce) => nonce,
            None => {
                let chain_nonce = self.client.pending_nonce(from).await?;
                let nonce = local_nonce.map_or(chain_nonce, |local| local.max(chain_nonce));
                submission.nonce = Some(nonce);
                nonce
            }
        };

        let estimate = self
            .client
            .estimate_gas(&DeployRequest {
                from,
                input: input.clone(),
            })
            .await?;
        let gas_limit = (estimate as f64 * self.gas_multiplier).ceil() as u64;

        let fees = bump_fees(
            self.client.fee_estimate().await?,
            submission.last_fees,
            self.policy.fee_bump_percent,
        );

        let signed = self
            .sign(signer, nonce, gas_limit, fees, input.clone())
            .await?;
        journal
            .record(&signed)
            .await
            .map_err(AttemptError::Journal)?;
        submission.hashes.push(signed.hash);
        submission.last_fees = Some(fees);

        tracing::info!(
            network = %self.network,
            from = %from,
            nonce,
            tx_hash = %signed.hash,
            gas_limit,
            max_fee_per_gas = fees.max_fee_per_gas,
            attempt = submission.attempts,
            "Broadcasting deployment"
        );

        match self.client.send_transaction(&signed).await {
            Ok(_) => {}
            Err(ClientError::AlreadyKnown(_)) => {
                tracing::debug!(tx_hash = %signed.hash, "Transaction already known to the node");
            }
            Err(ClientError::NonceTooLow(message)) => {
                let earlier = &submission.hashes[..submission.hashes.len() - 1];
                if let Some(receipt) = self.find_receipt(earlier).await? {
                    return self.confirm(receipt, &submission, from).await;
                }
                if earlier.is_empty() {
                    // Someone else used the nonce; start over from the chain.
                    submission.nonce = None;
                    submission.hashes.clear();
                    submission.last_fees = None;
                }
                return Err(AttemptError::Transient(format!("nonce too low: {message}")));
            }
            Err(e) => return Err(e.into()),
        }

        let receipt = tokio::time::timeout(
            self.policy.confirmation_timeout,
            self.wait_for_receipt(&submission.hashes),
        )
        .await
        .map_err(|_| {
            AttemptError::Transient(format!(
                "transaction {} not mined within {:?}",
                signed.hash, self.policy.confirmation_timeout
            ))
        })??;

        self.confirm(receipt, &submission, from).await
    }

    async fn sign(
        &self,
        signer: &PrivateKeySigner,
        nonce: u64,
        gas_limit: u64,
        fees: FeeEstimate,
        input: Bytes,
    ) -> Result<SignedDeployment, AttemptError> {
        let mut tx = TxEip1559 {
            chain_id: self.chain_id,
            nonce,
            gas_limit,
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            to: TxKind::Create,
            value: U256::ZERO,
            access_list: Default::default(),
            input,
        };

        let signature = signer
            .sign_transaction(&mut tx)
            .await
            .map_err(|e| AttemptError::Fatal(format!("Failed to sign transaction: {e}")))?;

        let envelope = TxEnvelope::from(tx.into_signed(signature));

        Ok(SignedDeployment {
            from: signer.address(),
            nonce,
            hash: *envelope.tx_hash(),
            gas_limit,
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            raw: envelope.encoded_2718().into(),
        })
    }

    /// First receipt found among `hashes`. Lookup errors are left to the next poll.
    async fn find_receipt(&self, hashes: &[TxHash]) -> Result<Option<DeploymentReceipt>, AttemptError> {
        for hash in hashes {
            match self.client.transaction_receipt(*hash).await {
                Ok(Some(receipt)) => return Ok(Some(receipt)),
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    tracing::debug!(tx_hash = %hash, err = %e, "Receipt lookup failed");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn wait_for_receipt(&self, hashes: &[TxHash]) -> Result<DeploymentReceipt, AttemptError> {
        loop {
            if let Some(receipt) = self.find_receipt(hashes).await? {
                return Ok(receipt);
            }
            tokio::time::sleep(self.policy.poll_interval).await;
        }
    }

    /// Check the receipt status and wait for the configured number of confirmations.
    async fn confirm(
        &self,
        receipt: DeploymentReceipt,
        submission: &Submission,
        from: Address,
    ) -> Result<Confirmed, AttemptError> {
        if !receipt.success {
            return Err(AttemptError::Fatal(format!(
                "transaction {} reverted in block {}",
                receipt.tx_hash, receipt.block_number
            )));
        }

        let nonce = submission.nonce.unwrap_or_default();
        let target = receipt.block_number + self.confirmations.saturating_sub(1);

        let waited = tokio::time::timeout(self.policy.confirmation_timeout, async {
            loop {
                match self.client.block_number().await {
                    Ok(height) if height >= target => return,
                    Ok(_) => {}
                    Err(e) => tracing::debug!(err = %e, "Block number lookup failed"),
                }
                tokio::time::sleep(self.policy.poll_interval).await;
            }
        })
        .await;

        if waited.is_err() {
            return Err(AttemptError::Transient(format!(
                "transaction {} did not reach {} confirmation(s) within {:?}",
                receipt.tx_hash, self.confirmations, self.policy.confirmation_timeout
            )));
        }

        let address = receipt
            .contract_address
            .unwrap_or_else(|| from.create(nonce));

        tracing::info!(
            network = %self.network,
            tx_hash = %receipt.tx_hash,
            address = %address,
            block_number = receipt.block_number,
            nonce,
            "Deployment confirmed"
        );

        Ok(Confirmed {
            tx_hash: receipt.tx_hash,
            address,
            block_number: receipt.block_number,
            nonce,
            attempts: submission.attempts,
        })
    }
}

/// Raise both fee caps by at least `bump_percent` over the previous attempt.
fn bump_fees(current: FeeEstimate, previous: Option<FeeEstimate>, bump_percent: u64) -> FeeEstimate {
    let Some(previous) = previous else {
        return current;
    };
    let bump = |old: u128| (old * (100 + bump_percent as u128)).div_ceil(100);

    let max_priority_fee_per_gas = current
        .max_priority_fee_per_gas
        .max(bump(previous.max_priority_fee_per_gas));
    let max_fee_per_gas = current
        .max_fee_per_gas
        .max(bump(previous.max_fee_per_gas))
        .max(max_priority_fee_per_gas);

    FeeEstimate {
        max_fee_per_gas,
        max_priority_fee_per_gas,
    }
}
