//! On-disk configuration for a deployment workspace.
//!
//! The configuration is a TOML file (by default `deploykit.toml`) that can be
//! overridden by environment variables prefixed with `DEPLOYKIT_`, nested keys
//! being separated by `__` (e.g. `DEPLOYKIT_NETWORKS__GOERLI__URL`).

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use alloy_core::primitives::Bytes;
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{
    DeployError,
    task::{ArgValue, Artifact, DeploymentTask},
};

/// The default name for the configuration file.
pub const DEFAULT_CONFIG_FILENAME: &str = "deploykit.toml";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "DEPLOYKIT_";

/// The role used when a task does not name one.
pub const DEFAULT_ROLE: &str = "deployer";

/// Network reported for errors that are not specific to one network.
pub const ALL_NETWORKS: &str = "*";

/// Root configuration of a deployment workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Compiler version the artifacts were produced with. Recorded, never invoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solidity: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Role name -> account index, with optional per-network overrides.
    #[serde(default)]
    pub named_accounts: BTreeMap<String, NamedAccountSpec>,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

/// Filesystem locations used by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding compiled contract artifacts.
    #[serde(default = "default_artifacts_dir")]
    pub artifacts: PathBuf,
    /// Root directory of the deployment registry.
    #[serde(default = "default_deployments_dir")]
    pub deployments: PathBuf,
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_deployments_dir() -> PathBuf {
    PathBuf::from("deployments")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            artifacts: default_artifacts_dir(),
            deployments: default_deployments_dir(),
        }
    }
}

/// Raw, unvalidated settings for one network.
///
/// Every required field is optional here so that a missing value is reported as a
/// [`DeployError::Config`] naming the field instead of a generic parse failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// JSON-RPC endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub chain_id: Option<i64>,
    #[serde(default)]
    pub accounts: Option<AccountsConfig>,
    /// Persist deployment records for this network.
    #[serde(default)]
    pub save_deployments: bool,
    /// Blocks to wait on top of the inclusion block.
    #[serde(default)]
    pub confirmations: Option<u64>,
    /// Multiplier applied to the node's gas estimate.
    #[serde(default)]
    pub gas_multiplier: Option<f64>,
    /// Whether this is a live network (as opposed to a local dev chain).
    #[serde(default)]
    pub live: Option<bool>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Account material for a network: either explicit keys or a mnemonic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccountsConfig {
    Keys(Vec<String>),
    Mnemonic(MnemonicConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MnemonicConfig {
    pub mnemonic: String,
    #[serde(default = "default_derivation_path")]
    pub path: String,
    #[serde(default)]
    pub initial_index: u32,
    #[serde(default = "default_account_count")]
    pub count: u32,
}

fn default_derivation_path() -> String {
    "m/44'/60'/0'/0".to_string()
}

fn default_account_count() -> u32 {
    20
}

/// A named account declaration.
///
/// Either a bare index (`deployer = 0`) or a table with a `default` entry plus
/// overrides keyed by network name or chain id (`deployer = { default = 0, Goerli = 1 }`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NamedAccountSpec {
    Index(usize),
    PerNetwork(BTreeMap<String, usize>),
}

impl NamedAccountSpec {
    /// The account index for the given network, if any applies.
    pub fn index_for(&self, network: &str, chain_id: u64) -> Option<usize> {
        match self {
            Self::Index(index) => Some(*index),
            Self::PerNetwork(map) => map
                .get(network)
                .or_else(|| map.get(&chain_id.to_string()))
                .or_else(|| map.get("default"))
                .copied(),
        }
    }
}

/// Retry and confirmation knobs. Durations are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_attempts: Option<usize>,
    #[serde(default)]
    pub min_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub confirmation_timeout_ms: Option<u64>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub fee_bump_percent: Option<u64>,
}

/// Declaration of one deployment task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    /// Artifact to deploy. Defaults to `name`.
    #[serde(default)]
    pub contract: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub args: Vec<ArgValue>,
    /// Named account that sends the deployment. Defaults to `deployer`.
    #[serde(default)]
    pub from: Option<String>,
    /// Inline creation bytecode, bypassing the artifacts directory.
    #[serde(default)]
    pub bytecode: Option<Bytes>,
}

impl DeployConfig {
    /// Load the configuration from a TOML file, applying environment overrides.
    pub fn load_from_file(path: &Path) -> Result<Self, DeployError> {
        Self::read_file(path).map_err(|e| DeployError::config(ALL_NETWORKS, format!("{e:#}")))
    }

    fn read_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Configuration file not found: {}", path.display());
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        tracing::info!(path = %path.display(), networks = config.networks.len(), "Configuration loaded");
        Ok(config)
    }

    /// Parse a configuration from a TOML string, without environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Figment::new()
            .merge(Toml::string(content))
            .extract()
            .context("Failed to parse configuration")
    }

    /// The raw settings of a network.
    pub fn network(&self, name: &str) -> Result<&NetworkConfig, DeployError> {
        self.networks
            .get(name)
            .ok_or_else(|| DeployError::config(name, "network is not declared in the configuration"))
    }

    /// Build deployment tasks from the `[[tasks]]` declarations, loading artifacts as needed.
    pub fn load_tasks(&self) -> Result<Vec<DeploymentTask>, DeployError> {
        self.build_tasks()
            .map_err(|e| DeployError::config(ALL_NETWORKS, format!("{e:#}")))
    }

    fn build_tasks(&self) -> Result<Vec<DeploymentTask>> {
        self.tasks
            .iter()
            .map(|spec| {
                let contract = spec.contract.clone().unwrap_or_else(|| spec.name.clone());
                let (bytecode, abi) = match &spec.bytecode {
                    Some(bytecode) => (bytecode.clone(), None),
                    None => {
                        let artifact = Artifact::find(&self.paths.artifacts, &contract)
                            .with_context(|| format!("Failed to load artifact for task `{}`", spec.name))?;
                        (artifact.bytecode, Some(artifact.abi))
                    }
                };

                let mut task = DeploymentTask::new(&spec.name, bytecode)
                    .contract(contract)
                    .from_role(spec.from.as_deref().unwrap_or(DEFAULT_ROLE))
                    .args(spec.args.clone());
                for dependency in &spec.dependencies {
                    task = task.depends_on(dependency);
                }
                for tag in &spec.tags {
                    task = task.tag(tag);
                }
                if let Some(abi) = abi {
                    task = task.abi(abi);
                }
                Ok(task)
            })
            .collect()
    }
}
