//! deploykit - Idempotent smart-contract deployment orchestrator.
//!
//! This crate turns a set of compiled contract artifacts and a network profile into
//! confirmed on-chain deployments, recording each outcome so that re-runs only
//! deploy what changed.

pub mod accounts;
pub mod cancel;
pub mod client;
pub mod config;
mod error;
pub mod fs;
pub mod graph;
pub mod network;
pub mod orchestrator;
pub mod registry;
pub mod submitter;
pub mod task;

pub use accounts::{AccountResolver, AccountSource, RedactedSecret};
pub use cancel::{CancelHandle, CancelSignal};
pub use client::{ChainClient, ClientError, InMemoryChain, JsonRpcClient};
pub use config::{DEFAULT_CONFIG_FILENAME, DeployConfig, NetworkConfig};
pub use error::DeployError;
pub use graph::{GraphError, ScriptDependencyGraph};
pub use network::{NetworkConfigResolver, NetworkProfile, RetryPolicy};
pub use orchestrator::{
    Orchestrator, RunOptions, RunReport, RunState, TaskOutcome, TaskStatus, deploy_networks,
};
pub use registry::{Decision, DeployReason, DeploymentRecord, DeploymentRegistry, PendingTransaction};
pub use submitter::{Inflight, TransactionSubmitter};
pub use task::{ArgValue, Artifact, ContentHash, DeploymentTask};
