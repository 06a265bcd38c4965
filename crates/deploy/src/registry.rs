//! Persisted deployment records, one partition per network.
//!
//! Layout:
//!
//! ```text
//! <deployments>/<network>/.chainId
//! <deployments>/<network>/.lock
//! <deployments>/<network>/<Contract>.json
//! <deployments>/<network>/.pending/<Contract>.json
//! ```

use std::{path::Path, sync::Mutex};

use alloy_core::primitives::{Address, Bytes, TxHash};
use anyhow::Context;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    DeployError,
    client::FeeEstimate,
    fs::ArtifactPersister,
    network::NetworkProfile,
    submitter::{AttemptJournal, Inflight, SignedDeployment},
    task::ContentHash,
};

const CHAIN_ID_FILE: &str = ".chainId";
const PENDING_DIR: &str = ".pending";

/// The outcome of one deployment, as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub contract_name: String,
    pub network: String,
    pub chain_id: u64,
    pub address: Address,
    pub bytecode_hash: ContentHash,
    pub constructor_args_hash: ContentHash,
    pub tx_hash: TxHash,
    pub block_number: u64,
    /// Unix seconds at which the deployment was recorded.
    pub timestamp: i64,
    pub deployer: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abi: Option<Value>,
    /// ABI-encoded constructor arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler_version: Option<String>,
}

/// A deployment broadcast but not yet terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransaction {
    pub contract_name: String,
    pub from: Address,
    pub nonce: u64,
    /// Every hash broadcast for this nonce, oldest first.
    pub tx_hashes: Vec<TxHash>,
    pub bytecode_hash: ContentHash,
    pub constructor_args_hash: ContentHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Bytes>,
    /// Creation input of the broadcast transactions, needed to sign a replacement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Bytes>,
    /// Fee caps of the latest attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fees: Option<FeeEstimate>,
}

impl PendingTransaction {
    /// Where a submission resuming this entry picks up.
    pub fn inflight(&self) -> Inflight {
        Inflight {
            nonce: self.nonce,
            tx_hashes: self.tx_hashes.clone(),
            fees: self.fees,
        }
    }
}

/// Why a task has to be (re)deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DeployReason {
    NotDeployed,
    BytecodeChanged,
    ArgsChanged,
    NotPersisted,
}

/// What to do with a task given the registry contents.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Skip(DeploymentRecord),
    Deploy(DeployReason),
}

impl Decision {
    /// Skip iff a prior record exists with the same bytecode and constructor arguments.
    pub fn evaluate(
        existing: Option<DeploymentRecord>,
        bytecode_hash: &ContentHash,
        constructor_args_hash: &ContentHash,
    ) -> Self {
        match existing {
            None => Self::Deploy(DeployReason::NotDeployed),
            Some(record) if &record.bytecode_hash != bytecode_hash => {
                Self::Deploy(DeployReason::BytecodeChanged)
            }
            Some(record) if &record.constructor_args_hash != constructor_args_hash => {
                Self::Deploy(DeployReason::ArgsChanged)
            }
            Some(record) => Self::Skip(record),
        }
    }
}

/// Deployment records of one network.
///
/// When the network does not persist deployments every read comes back empty and
/// every write is dropped, so each run deploys everything again.
#[derive(Debug, Clone)]
pub struct DeploymentRegistry {
    network: String,
    chain_id: u64,
    persist: bool,
    partition: ArtifactPersister,
    pending: ArtifactPersister,
}

impl DeploymentRegistry {
    pub fn new(deployments_dir: &Path, profile: &NetworkProfile) -> Self {
        let partition = ArtifactPersister::new(deployments_dir.join(&profile.name));
        let pending = ArtifactPersister::new(partition.path(PENDING_DIR));
        Self {
            network: profile.name.clone(),
            chain_id: profile.chain_id,
            persist: profile.persist_deployments,
            partition,
            pending,
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn is_persistent(&self) -> bool {
        self.persist
    }

    /// Bind the partition to the profile's chain id, or check an existing binding.
    pub async fn init(&self) -> Result<(), DeployError> {
        if !self.persist {
            return Ok(());
        }

        let chain_id = self.chain_id;
        let stored = self
            .blocking(move |partition, _| {
                let _lock = partition.lock_exclusive()?;
                match partition.read_string(CHAIN_ID_FILE)? {
                    Some(stored) => Ok(Some(stored.trim().to_string())),
                    None => {
                        partition.write_atomic(CHAIN_ID_FILE, chain_id.to_string().as_bytes())?;
                        Ok(None)
                    }
                }
            })
            .await?;

        match stored {
            None => {
                tracing::debug!(network = %self.network, chain_id, "Bound deployments partition to chain");
                Ok(())
            }
            Some(stored) if stored == chain_id.to_string() => Ok(()),
            Some(stored) => Err(DeployError::config(
                &self.network,
                format!(
                    "deployments partition belongs to chain {stored}, but the network is configured with chain {chain_id}"
                ),
            )),
        }
    }

    pub async fn lookup(&self, contract_name: &str) -> Result<Option<DeploymentRecord>, DeployError> {
        if !self.persist {
            return Ok(None);
        }

        let file = record_file(contract_name);
        self.blocking(move |partition, _| {
            let _lock = partition.lock_shared()?;
            partition.read_json(&file)
        })
        .await
    }

    /// Look up `contract_name` and decide whether it has to be deployed.
    pub async fn decide(
        &self,
        contract_name: &str,
        bytecode_hash: &ContentHash,
        constructor_args_hash: &ContentHash,
    ) -> Result<Decision, DeployError> {
        if !self.persist {
            return Ok(Decision::Deploy(DeployReason::NotPersisted));
        }
        let existing = self.lookup(contract_name).await?;
        Ok(Decision::evaluate(existing, bytecode_hash, constructor_args_hash))
    }

    /// Atomically write (or overwrite) the record of a contract.
    pub async fn commit(&self, record: &DeploymentRecord) -> Result<(), DeployError> {
        if !self.persist {
            tracing::debug!(
                network = %self.network,
                contract = %record.contract_name,
                "Deployments are not persisted on this network, record dropped"
            );
            return Ok(());
        }

        let file = record_file(&record.contract_name);
        let record = record.clone();
        self.blocking(move |partition, _| {
            let _lock = partition.lock_exclusive()?;
            partition.write_json(&file, &record)
        })
        .await
    }

    /// Every record of the partition, sorted by contract name.
    pub async fn all(&self) -> Result<Vec<DeploymentRecord>, DeployError> {
        if !self.persist {
            return Ok(Vec::new());
        }

        self.blocking(|partition, _| {
            let _lock = partition.lock_shared()?;
            read_all(partition)
        })
        .await
    }

    /// Delete every record of the partition. Only ever called on explicit request.
    pub async fn reset(&self) -> Result<(), DeployError> {
        if !self.persist {
            return Ok(());
        }

        tracing::warn!(network = %self.network, "Resetting deployments");
        self.blocking(|partition, _| {
            let _lock = partition.lock_exclusive()?;
            let root = partition.root();
            std::fs::remove_dir_all(root)
                .with_context(|| format!("Failed to remove {}", root.display()))
        })
        .await
    }

    /// Journal a transaction before it is broadcast.
    pub async fn record_pending(&self, pending: &PendingTransaction) -> Result<(), DeployError> {
        if !self.persist {
            return Ok(());
        }

        let file = record_file(&pending.contract_name);
        let pending = pending.clone();
        self.blocking(move |partition, journal| {
            let _lock = partition.lock_exclusive()?;
            journal.write_json(&file, &pending)
        })
        .await
    }

    /// Journal entries left over by earlier runs.
    pub async fn pending(&self) -> Result<Vec<PendingTransaction>, DeployError> {
        if !self.persist {
            return Ok(Vec::new());
        }

        self.blocking(|partition, journal| {
            let _lock = partition.lock_shared()?;
            read_all(journal)
        })
        .await
    }

    pub async fn clear_pending(&self, contract_name: &str) -> Result<(), DeployError> {
        if !self.persist {
            return Ok(());
        }

        let file = record_file(contract_name);
        self.blocking(move |partition, journal| {
            let _lock = partition.lock_exclusive()?;
            journal.remove(&file)
        })
        .await
    }

    /// A journal collecting the attempts of one submission.
    pub fn journal(&self, entry: PendingTransaction) -> PendingJournal<'_> {
        PendingJournal {
            registry: self,
            entry: Mutex::new(entry),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, DeployError>
    where
        T: Send + 'static,
        F: FnOnce(&ArtifactPersister, &ArtifactPersister) -> anyhow::Result<T> + Send + 'static,
    {
        let partition = self.partition.clone();
        let pending = self.pending.clone();
        tokio::task::spawn_blocking(move || f(&partition, &pending))
            .await
            .context("Registry task panicked")
            .and_then(|result| result)
            .map_err(|e| DeployError::registry(&self.network, e))
    }
}

/// Records every broadcast attempt of one contract in the pending journal.
#[derive(Debug)]
pub struct PendingJournal<'a> {
    registry: &'a DeploymentRegistry,
    entry: Mutex<PendingTransaction>,
}

impl AttemptJournal for PendingJournal<'_> {
    async fn record(&self, attempt: &SignedDeployment) -> Result<(), DeployError> {
        let snapshot = {
            let mut entry = self
                .entry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if entry.nonce != attempt.nonce {
                entry.tx_hashes.clear();
            }
            entry.from = attempt.from;
            entry.nonce = attempt.nonce;
            if !entry.tx_hashes.contains(&attempt.hash) {
                entry.tx_hashes.push(attempt.hash);
            }
            entry.fees = Some(FeeEstimate {
                max_fee_per_gas: attempt.max_fee_per_gas,
                max_priority_fee_per_gas: attempt.max_priority_fee_per_gas,
            });
            entry.clone()
        };
        self.registry.record_pending(&snapshot).await
    }
}

fn record_file(contract_name: &str) -> String {
    format!("{contract_name}.json")
}

fn read_all<T: DeserializeOwned>(persister: &ArtifactPersister) -> anyhow::Result<Vec<T>> {
    let mut values = Vec::new();
    for name in persister.list_json()? {
        if let Some(value) = persister.read_json(&name)? {
            values.push(value);
        }
    }
    Ok(values)
}
