//! Error taxonomy surfaced by a deployment run.

use thiserror::Error;

use crate::graph::GraphError;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by the orchestrator and its components.
///
/// Every variant carries the network it happened on and, where it applies, the
/// contract being deployed, so the operator never has to guess the context.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Malformed or missing network / account settings.
    #[error("configuration error on network `{network}`: {message}")]
    Config { network: String, message: String },

    /// A named account could not be turned into a signer.
    #[error("cannot resolve account `{role}` on network `{network}`: {message}")]
    AccountResolution {
        network: String,
        role: String,
        message: String,
    },

    /// The task graph is invalid (cycle, unknown dependency, duplicate or invalid name).
    #[error("invalid deployment graph on network `{network}`: {source}")]
    DependencyCycle {
        network: String,
        #[source]
        source: GraphError,
    },

    /// Retries were exhausted before the transaction confirmed.
    #[error(
        "deployment of `{contract}` on network `{network}` timed out after {attempts} attempt(s): {last_error}"
    )]
    TransactionTimeout {
        network: String,
        contract: String,
        attempts: usize,
        last_error: String,
    },

    /// The chain rejected or reverted the deployment.
    #[error("deployment of `{contract}` on network `{network}` failed: {reason}")]
    DeploymentFailed {
        network: String,
        contract: String,
        reason: String,
    },

    /// The deployment registry could not be read or written.
    #[error("deployment registry I/O failed on network `{network}`: {source}")]
    RegistryIo {
        network: String,
        #[source]
        source: BoxError,
    },

    /// The run was cancelled before every task was launched.
    #[error("deployment on network `{network}` was cancelled")]
    Cancelled { network: String },
}

impl DeployError {
    pub fn config(network: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            network: network.into(),
            message: message.into(),
        }
    }

    pub fn account(
        network: impl Into<String>,
        role: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::AccountResolution {
            network: network.into(),
            role: role.into(),
            message: message.into(),
        }
    }

    pub fn registry(network: impl Into<String>, source: anyhow::Error) -> Self {
        Self::RegistryIo {
            network: network.into(),
            source: source.into(),
        }
    }

    /// Whether the error only affects one task (and its dependents) rather than the run.
    pub fn is_task_local(&self) -> bool {
        matches!(
            self,
            Self::TransactionTimeout { .. } | Self::DeploymentFailed { .. }
        )
    }

    /// Process exit code for the command line surface.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config { .. } => 2,
            Self::AccountResolution { .. } => 3,
            Self::DependencyCycle { .. } => 4,
            Self::DeploymentFailed { .. } => 5,
            Self::TransactionTimeout { .. } => 6,
            Self::RegistryIo { .. } => 7,
            Self::Cancelled { .. } => 130,
        }
    }
}
