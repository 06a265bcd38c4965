//! [`ChainClient`] over Ethereum JSON-RPC.

use std::time::Duration;

use alloy_core::primitives::{Address, TxHash};
use anyhow::Context;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use url::Url;

use super::{ChainClient, ClientError, DeployRequest, DeploymentReceipt, FeeEstimate};
use crate::submitter::SignedDeployment;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Priority fee used when the node cannot suggest one (1 gwei).
const FALLBACK_PRIORITY_FEE: u128 = 1_000_000_000;

/// Deserialize a u64 from a hex string (with 0x prefix).
fn deserialize_u64_from_hex<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: &str = Deserialize::deserialize(deserializer)?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(serde::de::Error::custom)
}

fn parse_quantity(method: &str, s: &str) -> Result<u128, ClientError> {
    u128::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| ClientError::Rpc(format!("{method} returned an invalid quantity `{s}`: {e}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockFees {
    base_fee_per_gas: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: TxHash,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    block_number: u64,
    contract_address: Option<Address>,
    status: Option<String>,
}

/// JSON-RPC client for one endpoint.
#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: Url,
}

impl JsonRpcClient {
    pub fn new(url: Url) -> anyhow::Result<Self> {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: Url, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { http, url })
    }

    /// Make a JSON-RPC call and deserialize the result.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T, ClientError> {
        tracing::trace!(method, url = %self.url, "JSON-RPC call");

        let response = self
            .http
            .post(self.url.clone())
            .json(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1
            }))
            .send()
            .await
            .map_err(|e| transport_error(method, e))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        {
            return Err(ClientError::Busy(format!("{method} returned HTTP {status}")));
        }

        let body: Value = response.json().await.map_err(|e| {
            if status.is_success() {
                ClientError::Rpc(format!("Failed to parse {method} response: {e}"))
            } else {
                ClientError::Transport(format!("{method} returned HTTP {status}"))
            }
        })?;

        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown");
            return Err(ClientError::from_rpc_message(message));
        }

        let result = body
            .get("result")
            .cloned()
            .ok_or_else(|| ClientError::Rpc(format!("No result in {method} response")))?;

        serde_json::from_value(result)
            .map_err(|e| ClientError::Rpc(format!("Failed to deserialize {method} result: {e}")))
    }

    async fn quantity(&self, method: &str, params: Vec<Value>) -> Result<u128, ClientError> {
        let value: String = self.call(method, params).await?;
        parse_quantity(method, &value)
    }
}

fn transport_error(method: &str, e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout(format!("{method}: {e}"))
    } else {
        ClientError::Transport(format!("{method}: {e}"))
    }
}

fn to_u64(method: &str, value: u128) -> Result<u64, ClientError> {
    u64::try_from(value).map_err(|_| ClientError::Rpc(format!("{method} result {value} overflows u64")))
}

impl ChainClient for JsonRpcClient {
    async fn chain_id(&self) -> Result<u64, ClientError> {
        let id = self.quantity("eth_chainId", vec![]).await?;
        to_u64("eth_chainId", id)
    }

    async fn block_number(&self) -> Result<u64, ClientError> {
        let number = self.quantity("eth_blockNumber", vec![]).await?;
        to_u64("eth_blockNumber", number)
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, ClientError> {
        let nonce = self
            .quantity("eth_getTransactionCount", vec![json!(address), json!("pending")])
            .await?;
        to_u64("eth_getTransactionCount", nonce)
    }

    async fn mined_nonce(&self, address: Address) -> Result<u64, ClientError> {
        let nonce = self
            .quantity("eth_getTransactionCount", vec![json!(address), json!("latest")])
            .await?;
        to_u64("eth_getTransactionCount", nonce)
    }

    async fn estimate_gas(&self, request: &DeployRequest) -> Result<u64, ClientError> {
        let gas = self
            .quantity(
                "eth_estimateGas",
                vec![json!({ "from": request.from, "data": request.input })],
            )
            .await?;
        to_u64("eth_estimateGas", gas)
    }

    async fn fee_estimate(&self) -> Result<FeeEstimate, ClientError> {
        let block: Option<BlockFees> = self
            .call("eth_getBlockByNumber", vec![json!("latest"), json!(false)])
            .await?;

        let base_fee = match block.and_then(|b| b.base_fee_per_gas) {
            Some(base_fee) => parse_quantity("eth_getBlockByNumber", &base_fee)?,
            None => {
                // Pre-London chain: a plain gas price doubles as both fee caps.
                let gas_price = self.quantity("eth_gasPrice", vec![]).await?;
                return Ok(FeeEstimate {
                    max_fee_per_gas: gas_price,
                    max_priority_fee_per_gas: gas_price,
                });
            }
        };

        let priority = match self.quantity("eth_maxPriorityFeePerGas", vec![]).await {
            Ok(priority) => priority,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                tracing::debug!(err = %e, "Node cannot suggest a priority fee, using fallback");
                FALLBACK_PRIORITY_FEE
            }
        };

        Ok(FeeEstimate {
            max_fee_per_gas: base_fee.saturating_mul(2).saturating_add(priority),
            max_priority_fee_per_gas: priority,
        })
    }

    async fn send_transaction(&self, transaction: &SignedDeployment) -> Result<TxHash, ClientError> {
        self.call("eth_sendRawTransaction", vec![json!(transaction.raw)])
            .await
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<DeploymentReceipt>, ClientError> {
        let receipt: Option<RpcReceipt> = self
            .call("eth_getTransactionReceipt", vec![json!(hash)])
            .await?;

        Ok(receipt.map(|receipt| DeploymentReceipt {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            contract_address: receipt.contract_address,
            success: receipt.status.as_deref() != Some("0x0"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_receipt() {
        let receipt: RpcReceipt = serde_json::from_value(json!({
            "transactionHash": "0xabababababababababababababababababababababababababababababababab",
            "blockNumber": "0x2a",
            "contractAddress": "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "status": "0x1",
            "gasUsed": "0x5208"
        }))
        .unwrap();

        assert_eq!(receipt.block_number, 42);
        assert!(receipt.contract_address.is_some());
        assert_eq!(receipt.status.as_deref(), Some("0x1"));
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("eth_chainId", "0x5").unwrap(), 5);
        assert!(parse_quantity("eth_chainId", "0xzz").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let client = JsonRpcClient::with_timeout(
            "http://127.0.0.1:1".parse().unwrap(),
            Duration::from_millis(500),
        )
        .unwrap();

        let err = client.chain_id().await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }
}
