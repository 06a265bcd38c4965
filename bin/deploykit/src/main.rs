//! deploykit deploys compiled smart contracts to one or more networks, skipping
//! whatever is already deployed with the same bytecode and arguments.

mod cli;

use std::{process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL};

use cli::{Cli, Command, DeployArgs, DeploymentsArgs};
use deploykit::{
    CancelHandle, DeployConfig, DeployError, DeploymentRegistry, JsonRpcClient,
    NetworkConfigResolver, NetworkProfile, Orchestrator, RunOptions, RunReport, deploy_networks,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// The code of the deployment error behind `e`, 1 for anything else.
fn exit_code(e: &anyhow::Error) -> u8 {
    e.downcast_ref::<DeployError>()
        .map_or(1, DeployError::exit_code)
}

async fn run(cli: Cli) -> Result<()> {
    let config = DeployConfig::load_from_file(&cli.config)?;

    match cli.command {
        Command::Deploy(args) => deploy(config, args).await,
        Command::Deployments(args) => list_deployments(config, args).await,
    }
}

fn resolve_profile(config: &DeployConfig, network: &str) -> Result<NetworkProfile, DeployError> {
    NetworkConfigResolver::resolve(network, config.network(network)?)
}

fn connect(profile: &NetworkProfile) -> Result<JsonRpcClient> {
    if !matches!(profile.rpc_endpoint.scheme(), "http" | "https") {
        return Err(DeployError::config(
            &profile.name,
            "only http(s) endpoints can be used to submit deployments",
        )
        .into());
    }
    JsonRpcClient::new(profile.rpc_endpoint.clone())
}

async fn deploy(config: DeployConfig, args: DeployArgs) -> Result<()> {
    let tasks = config.load_tasks()?;

    let (cancel, _) = CancelHandle::new();
    let mut orchestrators = Vec::with_capacity(args.network.len());
    for network in &args.network {
        let profile = resolve_profile(&config, network)?;
        let client = connect(&profile)
            .with_context(|| format!("Failed to connect to network `{network}`"))?;

        tracing::info!(
            network = %network,
            rpc_endpoint = %profile.rpc_endpoint,
            chain_id = profile.chain_id,
            live = profile.live,
            "Connecting to network"
        );

        orchestrators.push(
            Orchestrator::new(config.clone(), network, tasks.clone(), Arc::new(client))
                .with_cancel(cancel.signal()),
        );
    }

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, finishing in-flight transactions before stopping");
            ctrl_c.cancel();
        }
    });

    let options = RunOptions {
        tags: args.tags,
        reset: args.reset,
    };
    let reports = deploy_networks(&mut orchestrators, &options).await;

    println!("{}", summary_table(&reports));

    for report in reports {
        report.into_result()?;
    }

    Ok(())
}

fn summary_table(reports: &[RunReport]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Network", "Contract", "Status", "Address", "Tx hash", "Detail"]);

    for report in reports {
        if report.outcomes.is_empty() {
            table.add_row(vec![
                report.network.clone(),
                "-".to_string(),
                report.state.to_string(),
                String::new(),
                String::new(),
                report
                    .first_error()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            ]);
        }
        for outcome in &report.outcomes {
            table.add_row(vec![
                report.network.clone(),
                outcome.name.clone(),
                outcome.status.to_string(),
                outcome.address.map(|a| a.to_string()).unwrap_or_default(),
                outcome.tx_hash.map(|h| h.to_string()).unwrap_or_default(),
                outcome.detail.clone().unwrap_or_default(),
            ]);
        }
    }

    table
}

async fn list_deployments(config: DeployConfig, args: DeploymentsArgs) -> Result<()> {
    let profile = resolve_profile(&config, &args.network)?;
    let registry = DeploymentRegistry::new(&config.paths.deployments, &profile);

    if !registry.is_persistent() {
        tracing::warn!(network = %args.network, "Deployments are not saved on this network");
    }

    let records = registry.all().await?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Contract", "Address", "Tx hash", "Block", "Deployer", "Recorded at"]);

    for record in &records {
        let recorded_at = chrono::DateTime::from_timestamp(record.timestamp, 0)
            .map(|at| at.to_string())
            .unwrap_or_else(|| record.timestamp.to_string());
        table.add_row(vec![
            record.contract_name.clone(),
            record.address.to_string(),
            record.tx_hash.to_string(),
            record.block_number.to_string(),
            record.deployer.to_string(),
            recorded_at,
        ]);
    }

    println!("{table}");
    tracing::info!(network = %args.network, count = records.len(), "Listed deployments");

    Ok(())
}
