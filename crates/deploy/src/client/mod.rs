//! The seam to an already-connected chain client.

mod mock;
mod rpc;

pub use mock::InMemoryChain;
pub use rpc::JsonRpcClient;

use std::future::Future;

use alloy_core::primitives::{Address, Bytes, TxHash};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::submitter::SignedDeployment;

/// A contract creation call, used for gas estimation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub from: Address,
    pub input: Bytes,
}

/// EIP-1559 fee caps, in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeEstimate {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// The parts of a transaction receipt a deployment cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub contract_address: Option<Address>,
    pub success: bool,
}

/// Failures reported by a [`ChainClient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("node busy: {0}")]
    Busy(String),
    #[error("replacement transaction underpriced: {0}")]
    Underpriced(String),
    #[error("nonce too low: {0}")]
    NonceTooLow(String),
    #[error("transaction already known: {0}")]
    AlreadyKnown(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("execution reverted: {0}")]
    Reverted(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("RPC error: {0}")]
    Rpc(String),
}

impl ClientError {
    /// Whether trying again later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Busy(_)
                | Self::Underpriced(_)
                | Self::NonceTooLow(_)
                | Self::Transport(_)
        )
    }

    /// Classify a node error message.
    pub fn from_rpc_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("nonce too low") || lower.contains("nonce has already been used") {
            Self::NonceTooLow(message)
        } else if lower.contains("already known") || lower.contains("known transaction") {
            Self::AlreadyKnown(message)
        } else if lower.contains("underpriced") || lower.contains("fee too low") {
            Self::Underpriced(message)
        } else if lower.contains("insufficient funds") {
            Self::InsufficientFunds(message)
        } else if lower.contains("invalid signature") || lower.contains("invalid sender") {
            Self::InvalidSignature(message)
        } else if lower.contains("revert") {
            Self::Reverted(message)
        } else if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout(message)
        } else if lower.contains("busy")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
        {
            Self::Busy(message)
        } else {
            Self::Rpc(message)
        }
    }
}

/// Read and write access to one chain.
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> impl Future<Output = Result<u64, ClientError>> + Send;

    fn block_number(&self) -> impl Future<Output = Result<u64, ClientError>> + Send;

    /// Transaction count of `address`, pending transactions included.
    fn pending_nonce(&self, address: Address)
    -> impl Future<Output = Result<u64, ClientError>> + Send;

    /// Transaction count of `address` in the latest block.
    fn mined_nonce(&self, address: Address)
    -> impl Future<Output = Result<u64, ClientError>> + Send;

    fn estimate_gas(
        &self,
        request: &DeployRequest,
    ) -> impl Future<Output = Result<u64, ClientError>> + Send;

    fn fee_estimate(&self) -> impl Future<Output = Result<FeeEstimate, ClientError>> + Send;

    /// Broadcast a signed transaction and return its hash.
    fn send_transaction(
        &self,
        transaction: &SignedDeployment,
    ) -> impl Future<Output = Result<TxHash, ClientError>> + Send;

    /// `None` while the transaction is not mined.
    fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> impl Future<Output = Result<Option<DeploymentReceipt>, ClientError>> + Send;
}
