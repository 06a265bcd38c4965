use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use deploykit::DEFAULT_CONFIG_FILENAME;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "deploykit")]
#[command(
    author,
    version,
    about = "Deploy smart contracts idempotently, in dependency order, to one or more networks"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "DEPLOYKIT_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the deploykit.toml configuration file.
    ///
    /// Any value in the file can be overridden with a `DEPLOYKIT_` environment variable,
    /// nested keys separated by `__` (e.g. `DEPLOYKIT_NETWORKS__GOERLI__URL`).
    #[arg(short, long, global = true, alias = "conf", env = "DEPLOYKIT_CONFIG", default_value = DEFAULT_CONFIG_FILENAME)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Deploy every task that is missing or changed on the given networks.
    Deploy(DeployArgs),
    /// List the recorded deployments of a network.
    Deployments(DeploymentsArgs),
}

#[derive(Debug, Clone, Args)]
pub struct DeployArgs {
    /// Networks to deploy to, concurrently. Repeat the flag or separate names with commas.
    #[arg(short, long, required = true, value_delimiter = ',')]
    pub network: Vec<String>,

    /// Only deploy tasks carrying one of these tags (and their dependencies).
    #[arg(short, long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Delete the recorded deployments of the networks first, redeploying everything.
    #[arg(long, default_value_t = false)]
    pub reset: bool,
}

#[derive(Debug, Clone, Args)]
pub struct DeploymentsArgs {
    /// The network to list.
    #[arg(short, long)]
    pub network: String,
}
