//! The deployment run state machine.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use alloy_core::primitives::{Address, TxHash};
use futures::future::join_all;

use crate::{
    DeployError,
    accounts::AccountResolver,
    cancel::CancelSignal,
    client::ChainClient,
    config::DeployConfig,
    graph::ScriptDependencyGraph,
    network::{NetworkConfigResolver, NetworkProfile},
    registry::{Decision, DeploymentRecord, DeploymentRegistry, PendingTransaction},
    submitter::{SubmitError, TransactionSubmitter},
    task::{ContentHash, DeploymentTask},
};

/// Phase of a run. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RunState {
    Init,
    Resolving,
    Ordering,
    Executing,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TaskStatus {
    Deployed,
    Skipped,
    Failed,
    /// Not started because the run aborted first.
    Pending,
    /// Not started because a dependency failed.
    Blocked,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub name: String,
    pub status: TaskStatus,
    pub address: Option<Address>,
    pub tx_hash: Option<TxHash>,
    pub detail: Option<String>,
}

impl TaskOutcome {
    fn new(name: &str, status: TaskStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            address: None,
            tx_hash: None,
            detail: None,
        }
    }

    fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// What a run did, task by task.
#[derive(Debug)]
pub struct RunReport {
    pub network: String,
    pub state: RunState,
    /// One entry per selected task, in execution order.
    pub outcomes: Vec<TaskOutcome>,
    pub errors: Vec<DeployError>,
    /// Number of deployment transactions confirmed during the run.
    pub transactions: usize,
}

impl RunReport {
    fn new(network: &str) -> Self {
        Self {
            network: network.to_string(),
            state: RunState::Init,
            outcomes: Vec::new(),
            errors: Vec::new(),
            transactions: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn outcome(&self, name: &str) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|outcome| outcome.name == name)
    }

    pub fn first_error(&self) -> Option<&DeployError> {
        self.errors.first()
    }

    /// The report if the run completed, its first error otherwise.
    pub fn into_result(mut self) -> Result<Self, DeployError> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(self.errors.swap_remove(0))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Only run tasks carrying one of these tags, plus their dependencies.
    pub tags: Vec<String>,
    /// Delete the network's records before the run.
    pub reset: bool,
}

/// Everything resolved before the first task runs.
struct Prepared<'a, C> {
    profile: NetworkProfile,
    accounts: AccountResolver,
    registry: DeploymentRegistry,
    submitter: TransactionSubmitter<C>,
    plan: Vec<&'a DeploymentTask>,
}

/// Runs the deployment tasks of one network.
pub struct Orchestrator<C> {
    config: DeployConfig,
    network: String,
    tasks: Vec<DeploymentTask>,
    client: Arc<C>,
    cancel: CancelSignal,
    state: RunState,
}

impl<C: ChainClient> Orchestrator<C> {
    pub fn new(
        config: DeployConfig,
        network: impl Into<String>,
        tasks: Vec<DeploymentTask>,
        client: Arc<C>,
    ) -> Self {
        Self {
            config,
            network: network.into(),
            tasks,
            client,
            cancel: CancelSignal::never(),
            state: RunState::Init,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Run every selected task, in dependency order.
    pub async fn run(&mut self, options: &RunOptions) -> RunReport {
        let mut report = RunReport::new(&self.network);
        self.state = RunState::Init;

        let result = self.execute(options, &mut report).await;
        let state = match result {
            Ok(()) if report.errors.is_empty() => RunState::Completed,
            Ok(()) => RunState::Aborted,
            Err(e) => {
                tracing::error!(network = %self.network, err = %e, "Deployment aborted");
                report.errors.insert(0, e);
                RunState::Aborted
            }
        };
        self.transition(state);
        report.state = state;

        tracing::info!(
            network = %self.network,
            state = %state,
            transactions = report.transactions,
            deployed = report.outcomes.iter().filter(|o| o.status == TaskStatus::Deployed).count(),
            skipped = report.outcomes.iter().filter(|o| o.status == TaskStatus::Skipped).count(),
            "Deployment run finished"
        );

        report
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!(network = %self.network, from = %self.state, to = %next, "Run state");
        self.state = next;
    }

    async fn execute(&mut self, options: &RunOptions, report: &mut RunReport) -> Result<(), DeployError> {
        self.transition(RunState::Resolving);
        let profile = NetworkConfigResolver::resolve(&self.network, self.config.network(&self.network)?)?;
        let accounts = AccountResolver::new(&profile, &self.config.named_accounts);

        let chain_id = self.client.chain_id().await.map_err(|e| {
            DeployError::config(&self.network, format!("cannot query the chain id: {e}"))
        })?;
        if chain_id != profile.chain_id {
            return Err(DeployError::config(
                &self.network,
                format!(
                    "configured chain id {} does not match the connected chain {chain_id}",
                    profile.chain_id
                ),
            ));
        }

        self.transition(RunState::Ordering);
        let graph = ScriptDependencyGraph::build(&self.tasks).map_err(|source| {
            DeployError::DependencyCycle {
                network: self.network.clone(),
                source,
            }
        })?;
        let plan = graph
            .plan(&options.tags)
            .map_err(|source| DeployError::DependencyCycle {
                network: self.network.clone(),
                source,
            })?;

        // Every signer is resolved up front so a bad account fails before any transaction.
        for task in &plan {
            accounts.resolve(&task.from)?;
        }

        tracing::info!(
            network = %self.network,
            chain_id,
            tasks = plan.len(),
            order = ?plan.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "Deployment plan"
        );

        // Nothing is written before the run is known to be able to proceed.
        let registry = DeploymentRegistry::new(&self.config.paths.deployments, &profile);
        if options.reset {
            registry.reset().await?;
        }
        registry.init().await?;

        let prepared = Prepared {
            submitter: TransactionSubmitter::new(self.client.clone(), &profile),
            profile,
            accounts,
            registry,
            plan,
        };

        reconcile_pending(self.client.as_ref(), &prepared, &self.tasks, &self.config).await?;

        self.state = RunState::Executing;
        tracing::debug!(network = %self.network, "Run state: Executing");
        execute_plan(&self.config, &self.network, &self.cancel, prepared, report).await
    }
}

async fn execute_plan<C: ChainClient>(
    config: &DeployConfig,
    network: &str,
    cancel: &CancelSignal,
    prepared: Prepared<'_, C>,
    report: &mut RunReport,
) -> Result<(), DeployError> {
    let mut addresses: HashMap<String, Address> = HashMap::new();
    let mut failed: HashSet<&str> = HashSet::new();

    for (position, task) in prepared.plan.iter().enumerate() {
        if cancel.is_cancelled() {
            tracing::warn!(network, contract = %task.name, "Run cancelled, not launching remaining tasks");
            report.outcomes.extend(
                prepared.plan[position..]
                    .iter()
                    .map(|t| TaskOutcome::new(&t.name, TaskStatus::Cancelled)),
            );
            return Err(DeployError::Cancelled {
                network: network.to_string(),
            });
        }

        if let Some(dependency) = task
            .all_dependencies()
            .into_iter()
            .find(|dependency| failed.contains(dependency))
        {
            tracing::warn!(network, contract = %task.name, dependency, "Dependency failed, skipping task");
            failed.insert(&task.name);
            report.outcomes.push(
                TaskOutcome::new(&task.name, TaskStatus::Blocked)
                    .detail(format!("dependency `{dependency}` failed")),
            );
            continue;
        }

        match execute_task(config, &prepared, task, &addresses).await {
            Ok(outcome) => {
                if let Some(address) = outcome.address {
                    addresses.insert(task.name.clone(), address);
                }
                if outcome.status == TaskStatus::Deployed {
                    report.transactions += 1;
                }
                report.outcomes.push(outcome);
            }
            Err(e) if e.is_task_local() => {
                tracing::error!(network, contract = %task.name, err = %e, "Deployment failed");
                failed.insert(&task.name);
                report
                    .outcomes
                    .push(TaskOutcome::new(&task.name, TaskStatus::Failed).detail(e.to_string()));
                report.errors.push(e);
            }
            Err(e) => {
                report
                    .outcomes
                    .push(TaskOutcome::new(&task.name, TaskStatus::Failed).detail(e.to_string()));
                report.outcomes.extend(
                    prepared.plan[position + 1..]
                        .iter()
                        .map(|t| TaskOutcome::new(&t.name, TaskStatus::Pending)),
                );
                return Err(e);
            }
        }
    }

    Ok(())
}

async fn execute_task<C: ChainClient>(
    config: &DeployConfig,
    prepared: &Prepared<'_, C>,
    task: &DeploymentTask,
    addresses: &HashMap<String, Address>,
) -> Result<TaskOutcome, DeployError> {
    let network = prepared.profile.name.as_str();
    let registry = &prepared.registry;

    let encoded_args = task.encode_args(addresses).map_err(|e| {
        DeployError::config(network, format!("constructor arguments of `{}`: {e:#}", task.name))
    })?;
    let constructor_args_hash = ContentHash::of(&encoded_args);

    let reason = match registry
        .decide(&task.name, &task.bytecode_hash, &constructor_args_hash)
        .await?
    {
        Decision::Skip(record) => {
            tracing::info!(
                network,
                contract = %task.name,
                address = %record.address,
                "Already deployed with the same bytecode and arguments, skipping"
            );
            return Ok(TaskOutcome {
                address: Some(record.address),
                tx_hash: Some(record.tx_hash),
                ..TaskOutcome::new(&task.name, TaskStatus::Skipped)
            });
        }
        Decision::Deploy(reason) => reason,
    };

    let signer = prepared.accounts.resolve(&task.from)?;
    tracing::info!(
        network,
        contract = %task.name,
        reason = %reason,
        deployer = %signer.address(),
        "Deploying"
    );

    let args = (!encoded_args.is_empty()).then(|| encoded_args.clone());
    let input = task.deploy_input(&encoded_args);
    let journal = registry.journal(PendingTransaction {
        contract_name: task.name.clone(),
        from: signer.address(),
        nonce: 0,
        tx_hashes: Vec::new(),
        bytecode_hash: task.bytecode_hash.clone(),
        constructor_args_hash: constructor_args_hash.clone(),
        args: args.clone(),
        input: Some(input.clone()),
        fees: None,
    });

    let confirmed = match prepared
        .submitter
        .submit(&signer, input, &journal)
        .await
    {
        Ok(confirmed) => confirmed,
        Err(SubmitError::Failed(reason)) => {
            // Terminal: nothing left to reconcile.
            registry.clear_pending(&task.name).await?;
            return Err(SubmitError::Failed(reason).into_deploy_error(network, &task.name));
        }
        // A timed out transaction may still be mined; its journal entry stays.
        Err(e) => return Err(e.into_deploy_error(network, &task.name)),
    };

    let record = DeploymentRecord {
        contract_name: task.name.clone(),
        network: network.to_string(),
        chain_id: prepared.profile.chain_id,
        address: confirmed.address,
        bytecode_hash: task.bytecode_hash.clone(),
        constructor_args_hash,
        tx_hash: confirmed.tx_hash,
        block_number: confirmed.block_number,
        timestamp: chrono::Utc::now().timestamp(),
        deployer: signer.address(),
        abi: task.abi.clone(),
        args,
        compiler_version: config.solidity.clone(),
    };
    registry.commit(&record).await?;
    registry.clear_pending(&task.name).await?;

    tracing::info!(
        network,
        contract = %task.name,
        address = %confirmed.address,
        tx_hash = %confirmed.tx_hash,
        "Deployed"
    );

    Ok(TaskOutcome {
        address: Some(confirmed.address),
        tx_hash: Some(confirmed.tx_hash),
        ..TaskOutcome::new(&task.name, TaskStatus::Deployed)
    })
}

/// Settle journal entries left by an interrupted or timed out run.
///
/// A journaled transaction that was mined in the meantime is committed as if the
/// earlier run had seen it through. One still waiting for its nonce is resumed at that
/// nonce, so no later transaction of the sender queues behind it. An entry whose nonce
/// was taken by another transaction, or that reverted, is dropped and deployed again.
async fn reconcile_pending<C: ChainClient>(
    client: &C,
    prepared: &Prepared<'_, C>,
    tasks: &[DeploymentTask],
    config: &DeployConfig,
) -> Result<(), DeployError> {
    let registry = &prepared.registry;
    let network = registry.network();

    'entries: for entry in registry.pending().await? {
        let mut receipt = None;
        for hash in &entry.tx_hashes {
            match client.transaction_receipt(*hash).await {
                Ok(Some(found)) => {
                    receipt = Some(found);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        network,
                        contract = %entry.contract_name,
                        tx_hash = %hash,
                        err = %e,
                        "Cannot check journaled transaction, keeping it"
                    );
                    continue 'entries;
                }
            }
        }

        match receipt {
            Some(receipt) if receipt.success => {
                let address = receipt
                    .contract_address
                    .unwrap_or_else(|| entry.from.create(entry.nonce));
                tracing::info!(
                    network,
                    contract = %entry.contract_name,
                    address = %address,
                    tx_hash = %receipt.tx_hash,
                    "Journaled deployment was mined, recording it"
                );
                let record = pending_record(
                    prepared,
                    tasks,
                    config,
                    &entry,
                    receipt.tx_hash,
                    address,
                    receipt.block_number,
                );
                registry.commit(&record).await?;
            }
            Some(receipt) => {
                tracing::warn!(network, contract = %entry.contract_name, tx_hash = %receipt.tx_hash, "Journaled deployment reverted");
            }
            None => {
                let mined = match client.mined_nonce(entry.from).await {
                    Ok(mined) => mined,
                    Err(e) => {
                        tracing::warn!(
                            network,
                            contract = %entry.contract_name,
                            err = %e,
                            "Cannot read the sender's nonce, keeping the journaled deployment"
                        );
                        continue 'entries;
                    }
                };
                if entry.nonce >= mined {
                    resume_pending(prepared, tasks, config, entry).await?;
                    continue 'entries;
                }
                tracing::warn!(
                    network,
                    contract = %entry.contract_name,
                    nonce = entry.nonce,
                    mined,
                    "Nonce of the journaled deployment was used by another transaction, it will be deployed again"
                );
            }
        }

        registry.clear_pending(&entry.contract_name).await?;
    }

    Ok(())
}

/// Drive a journaled deployment that is still waiting for its nonce to a terminal state.
async fn resume_pending<C: ChainClient>(
    prepared: &Prepared<'_, C>,
    tasks: &[DeploymentTask],
    config: &DeployConfig,
    entry: PendingTransaction,
) -> Result<(), DeployError> {
    let registry = &prepared.registry;
    let network = registry.network();

    let Some(input) = entry.input.clone() else {
        tracing::warn!(
            network,
            contract = %entry.contract_name,
            "Journaled deployment has no input to replace it with, it will be deployed again"
        );
        return registry.clear_pending(&entry.contract_name).await;
    };
    let signer = prepared.accounts.signer_for(entry.from).ok_or_else(|| {
        DeployError::account(
            network,
            entry.from.to_string(),
            format!(
                "no configured account signs the journaled deployment of `{}`",
                entry.contract_name
            ),
        )
    })?;

    tracing::info!(
        network,
        contract = %entry.contract_name,
        nonce = entry.nonce,
        broadcasts = entry.tx_hashes.len(),
        "Resuming journaled deployment"
    );

    let journal = registry.journal(entry.clone());
    match prepared
        .submitter
        .resume(&signer, input, &journal, entry.inflight())
        .await
    {
        Ok(confirmed) => {
            let record = pending_record(
                prepared,
                tasks,
                config,
                &entry,
                confirmed.tx_hash,
                confirmed.address,
                confirmed.block_number,
            );
            registry.commit(&record).await?;
        }
        Err(SubmitError::Failed(reason)) => {
            tracing::warn!(
                network,
                contract = %entry.contract_name,
                reason = %reason,
                "Journaled deployment failed, it will be deployed again"
            );
        }
        // Still unconfirmed: the entry stays and nothing else can use the sender's nonce.
        Err(e) => return Err(e.into_deploy_error(network, &entry.contract_name)),
    }

    registry.clear_pending(&entry.contract_name).await
}

fn pending_record<C>(
    prepared: &Prepared<'_, C>,
    tasks: &[DeploymentTask],
    config: &DeployConfig,
    entry: &PendingTransaction,
    tx_hash: TxHash,
    address: Address,
    block_number: u64,
) -> DeploymentRecord {
    let abi = tasks
        .iter()
        .find(|task| task.name == entry.contract_name)
        .and_then(|task| task.abi.clone());
    DeploymentRecord {
        contract_name: entry.contract_name.clone(),
        network: prepared.profile.name.clone(),
        chain_id: prepared.profile.chain_id,
        address,
        bytecode_hash: entry.bytecode_hash.clone(),
        constructor_args_hash: entry.constructor_args_hash.clone(),
        tx_hash,
        block_number,
        timestamp: chrono::Utc::now().timestamp(),
        deployer: entry.from,
        abi,
        args: entry.args.clone(),
        compiler_version: config.solidity.clone(),
    }
}

/// Run several networks concurrently, each with its own client and registry partition.
pub async fn deploy_networks<C: ChainClient>(
    orchestrators: &mut [Orchestrator<C>],
    options: &RunOptions,
) -> Vec<RunReport> {
    join_all(orchestrators.iter_mut().map(|orchestrator| orchestrator.run(options))).await
}
