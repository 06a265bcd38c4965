//! Integration tests for deploykit.
//!
//! Every test drives a full orchestrator run against an in-memory chain, with the
//! deployment registry in a scratch directory.
//! Run with: cargo test --test integration_test

use std::{path::PathBuf, str::FromStr, sync::Arc};

use alloy_core::primitives::{Address, Bytes, TxHash};
use deploykit::{
    ArgValue, CancelHandle, ClientError, DeployConfig, DeployError, DeploymentRecord,
    DeploymentTask, InMemoryChain, Orchestrator, RunOptions, RunReport, RunState, TaskStatus,
    deploy_networks, submitter::SignedDeployment,
};
use tempdir::TempDir;

const DEV_ADDRESS_0: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

/// The Goerli example: TokenA, then a Vault taking TokenA's address and an amount.
const GOERLI_CONFIG: &str = r#"
    solidity = "0.8.8"

    [named_accounts.deployer]
    default = 0

    [networks.Goerli]
    url = "https://goerli.example/rpc"
    accounts = ["0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"]
    chain_id = 5
    save_deployments = true

    [networks.Goerli.retry]
    max_attempts = 3
    min_delay_ms = 1
    max_delay_ms = 5
    confirmation_timeout_ms = 100
    poll_interval_ms = 5

    [networks.Sepolia]
    url = "https://sepolia.example/rpc"
    accounts = ["0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"]
    chain_id = 11155111
    save_deployments = true
    confirmations = 2

    [networks.Sepolia.retry]
    min_delay_ms = 1
    max_delay_ms = 5
    poll_interval_ms = 5

    [[tasks]]
    name = "TokenA"
    bytecode = "0x6080604052"

    [[tasks]]
    name = "Vault"
    bytecode = "0x6080604053"
    dependencies = ["TokenA"]
    args = [{ address_of = "TokenA" }, { uint = "1000" }]
    tags = ["vault"]
"#;

/// Test setup context containing common test infrastructure.
struct TestContext {
    _temp_dir: TempDir,
    config: DeployConfig,
    deployments: PathBuf,
}

impl TestContext {
    fn new(test_prefix: &str) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();

        let temp_dir = TempDir::new(&format!("deploykit-{test_prefix}"))
            .expect("Failed to create temp dir");
        let deployments = temp_dir.path().join("deployments");

        let mut config =
            DeployConfig::from_toml_str(GOERLI_CONFIG).expect("Failed to parse test config");
        config.paths.deployments = deployments.clone();

        Self {
            _temp_dir: temp_dir,
            config,
            deployments,
        }
    }

    fn network_mut(&mut self, name: &str) -> &mut deploykit::NetworkConfig {
        self.config
            .networks
            .get_mut(name)
            .expect("network declared in test config")
    }

    fn tasks(&self) -> Vec<DeploymentTask> {
        self.config.load_tasks().expect("Failed to load tasks")
    }

    fn orchestrator(&self, network: &str, chain: &Arc<InMemoryChain>) -> Orchestrator<InMemoryChain> {
        Orchestrator::new(self.config.clone(), network, self.tasks(), chain.clone())
    }

    async fn run(&self, chain: &Arc<InMemoryChain>) -> RunReport {
        self.orchestrator("Goerli", chain)
            .run(&RunOptions::default())
            .await
    }

    fn record(&self, network: &str, contract: &str) -> Option<DeploymentRecord> {
        let path = self.deployments.join(network).join(format!("{contract}.json"));
        let content = std::fs::read_to_string(path).ok()?;
        Some(serde_json::from_str(&content).expect("Failed to parse record"))
    }
}

fn deployer() -> Address {
    Address::from_str(DEV_ADDRESS_0).unwrap()
}

fn statuses(report: &RunReport) -> Vec<(String, TaskStatus)> {
    report
        .outcomes
        .iter()
        .map(|outcome| (outcome.name.clone(), outcome.status))
        .collect()
}

#[tokio::test]
async fn test_goerli_example_deploys_in_order_and_records() {
    let ctx = TestContext::new("goerli");
    let chain = Arc::new(InMemoryChain::new(5));

    let report = ctx.run(&chain).await;

    assert_eq!(report.state, RunState::Completed, "errors: {:?}", report.errors);
    assert_eq!(
        statuses(&report),
        vec![
            ("TokenA".to_string(), TaskStatus::Deployed),
            ("Vault".to_string(), TaskStatus::Deployed)
        ]
    );
    assert_eq!(report.transactions, 2);

    let sent = chain.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].nonce, 0);
    assert_eq!(sent[1].nonce, 1);

    let token = ctx.record("Goerli", "TokenA").expect("TokenA record");
    let vault = ctx.record("Goerli", "Vault").expect("Vault record");
    assert_eq!(token.address, deployer().create(0));
    assert_eq!(vault.address, deployer().create(1));
    assert_eq!(token.chain_id, 5);
    assert_eq!(token.deployer, deployer());
    assert_eq!(vault.compiler_version.as_deref(), Some("0.8.8"));
    assert!(token.block_number < vault.block_number);

    // The Vault was constructed with TokenA's address.
    let args = vault.args.expect("Vault constructor arguments");
    assert_eq!(&args[12..32], token.address.as_slice());

    let chain_id = std::fs::read_to_string(ctx.deployments.join("Goerli/.chainId")).unwrap();
    assert_eq!(chain_id.trim(), "5");
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let ctx = TestContext::new("idempotent");
    let chain = Arc::new(InMemoryChain::new(5));

    ctx.run(&chain).await.into_result().unwrap();
    let report = ctx.run(&chain).await;

    assert!(report.is_success());
    assert_eq!(report.transactions, 0);
    assert_eq!(chain.sent().len(), 2);
    assert_eq!(
        statuses(&report),
        vec![
            ("TokenA".to_string(), TaskStatus::Skipped),
            ("Vault".to_string(), TaskStatus::Skipped)
        ]
    );
    assert_eq!(
        report.outcome("Vault").unwrap().address,
        Some(deployer().create(1))
    );
}

#[tokio::test]
async fn test_changed_arguments_redeploy_only_that_contract() {
    let mut ctx = TestContext::new("args-change");
    let chain = Arc::new(InMemoryChain::new(5));
    ctx.run(&chain).await.into_result().unwrap();
    let before = ctx.record("Goerli", "Vault").unwrap();

    ctx.config.tasks[1].args[1] = ArgValue::Uint("2000".to_string());
    let report = ctx.run(&chain).await;

    assert!(report.is_success());
    assert_eq!(chain.sent().len(), 3);
    assert_eq!(report.outcome("TokenA").unwrap().status, TaskStatus::Skipped);
    assert_eq!(report.outcome("Vault").unwrap().status, TaskStatus::Deployed);

    let after = ctx.record("Goerli", "Vault").unwrap();
    assert_ne!(after.constructor_args_hash, before.constructor_args_hash);
    assert_eq!(after.bytecode_hash, before.bytecode_hash);
    assert_eq!(after.address, deployer().create(2));
}

#[tokio::test]
async fn test_changed_bytecode_redeploys() {
    let mut ctx = TestContext::new("bytecode-change");
    let chain = Arc::new(InMemoryChain::new(5));
    ctx.run(&chain).await.into_result().unwrap();

    ctx.config.tasks[0].bytecode = Some(vec![0x60, 0x80, 0x60, 0x40, 0x54].into());
    let report = ctx.run(&chain).await;

    // TokenA moved, so the Vault's constructor arguments changed too.
    assert!(report.is_success());
    assert_eq!(report.transactions, 2);
    assert_eq!(
        ctx.record("Goerli", "Vault").unwrap().args.unwrap()[12..32],
        deployer().create(2).as_slice()[..]
    );
}

#[tokio::test]
async fn test_unpersisted_network_always_redeploys() {
    let mut ctx = TestContext::new("no-persist");
    ctx.network_mut("Goerli").save_deployments = false;
    let chain = Arc::new(InMemoryChain::new(5));

    ctx.run(&chain).await.into_result().unwrap();
    let report = ctx.run(&chain).await;

    assert!(report.is_success());
    assert_eq!(report.transactions, 2);
    assert_eq!(chain.sent().len(), 4);
    assert!(!ctx.deployments.join("Goerli").exists());
}

#[tokio::test]
async fn test_cycle_fails_before_any_transaction() {
    let mut ctx = TestContext::new("cycle");
    ctx.config.tasks[0].dependencies = vec!["Vault".to_string()];
    let chain = Arc::new(InMemoryChain::new(5));

    let report = ctx.run(&chain).await;

    assert_eq!(report.state, RunState::Aborted);
    assert!(chain.sent().is_empty());
    let err = report.into_result().unwrap_err();
    assert!(matches!(err, DeployError::DependencyCycle { .. }));
    assert!(err.to_string().contains("TokenA -> Vault -> TokenA"));
    assert_eq!(err.exit_code(), 4);
}

#[tokio::test]
async fn test_chain_id_mismatch_aborts_before_any_transaction() {
    let ctx = TestContext::new("chain-mismatch");
    let chain = Arc::new(InMemoryChain::new(1));

    let report = ctx.run(&chain).await;

    assert_eq!(report.state, RunState::Aborted);
    assert!(report.outcomes.is_empty());
    assert!(chain.sent().is_empty());
    assert!(!ctx.deployments.join("Goerli").exists());
    assert!(matches!(
        report.into_result(),
        Err(DeployError::Config { .. })
    ));
}

#[tokio::test]
async fn test_unset_signing_key_is_a_config_error() {
    let mut ctx = TestContext::new("no-key");
    ctx.network_mut("Goerli").accounts = Some(deploykit::config::AccountsConfig::Keys(vec![
        String::new(),
    ]));
    let chain = Arc::new(InMemoryChain::new(5));

    let err = ctx.run(&chain).await.into_result().unwrap_err();
    assert!(matches!(err, DeployError::Config { ref network, .. } if network == "Goerli"));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn test_unknown_role_fails_before_any_transaction() {
    let mut ctx = TestContext::new("unknown-role");
    ctx.config.tasks[1].from = Some("admin".to_string());
    let chain = Arc::new(InMemoryChain::new(5));

    let err = ctx.run(&chain).await.into_result().unwrap_err();
    assert!(matches!(err, DeployError::AccountResolution { ref role, .. } if role == "admin"));
    assert!(chain.sent().is_empty());
}

#[tokio::test]
async fn test_transient_failures_are_retried_with_the_same_nonce() {
    let ctx = TestContext::new("transient");
    let chain = Arc::new(InMemoryChain::new(5));
    chain.fail_next_estimate(ClientError::Busy("rate limited".to_string()));
    chain.fail_next_send(ClientError::Timeout("slow node".to_string()));

    let report = ctx.run(&chain).await;

    assert!(report.is_success(), "errors: {:?}", report.errors);
    let nonces: Vec<u64> = chain.sent().iter().map(|tx| tx.nonce).collect();
    assert_eq!(nonces, vec![0, 1]);
}

#[tokio::test]
async fn test_fatal_failure_blocks_only_dependents() {
    let mut ctx = TestContext::new("fatal");
    let mut oracle = ctx.config.tasks[0].clone();
    oracle.name = "Oracle".to_string();
    oracle.bytecode = Some(vec![0x60, 0x01].into());
    ctx.config.tasks.push(oracle);

    let chain = Arc::new(InMemoryChain::new(5));
    chain.fail_next_send(ClientError::InsufficientFunds("balance 0".to_string()));

    let report = ctx.run(&chain).await;

    assert_eq!(report.state, RunState::Aborted);
    assert_eq!(
        statuses(&report),
        vec![
            ("TokenA".to_string(), TaskStatus::Failed),
            ("Vault".to_string(), TaskStatus::Blocked),
            ("Oracle".to_string(), TaskStatus::Deployed)
        ]
    );

    // No gap: the independent task took the nonce the failed one never used.
    let sent = chain.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].nonce, 0);
    assert!(ctx.record("Goerli", "TokenA").is_none());
    assert!(ctx.record("Goerli", "Oracle").is_some());

    let err = report.into_result().unwrap_err();
    assert!(matches!(err, DeployError::DeploymentFailed { ref contract, .. } if contract == "TokenA"));
    assert_eq!(err.exit_code(), 5);
}

#[tokio::test]
async fn test_timed_out_deployment_is_reconciled_on_next_run() {
    let ctx = TestContext::new("reconcile");
    let chain = Arc::new(InMemoryChain::new(5));
    chain.drop_next_broadcasts(3);

    let report = ctx.run(&chain).await;
    assert_eq!(report.outcome("TokenA").unwrap().status, TaskStatus::Failed);
    assert_eq!(report.outcome("Vault").unwrap().status, TaskStatus::Blocked);
    let err = report.into_result().unwrap_err();
    assert!(matches!(err, DeployError::TransactionTimeout { attempts: 3, .. }));
    assert_eq!(err.exit_code(), 6);
    assert!(ctx.deployments.join("Goerli/.pending/TokenA.json").exists());

    // The first broadcast finally lands.
    let first = chain.sent()[0].hash;
    assert_eq!(chain.mine_pending(), 1);

    let report = ctx.run(&chain).await;
    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(report.outcome("TokenA").unwrap().status, TaskStatus::Skipped);
    assert_eq!(report.outcome("Vault").unwrap().status, TaskStatus::Deployed);

    let token = ctx.record("Goerli", "TokenA").unwrap();
    assert_eq!(token.tx_hash, first);
    assert_eq!(token.address, deployer().create(0));
    assert_eq!(ctx.record("Goerli", "Vault").unwrap().address, deployer().create(1));
    assert!(!ctx.deployments.join("Goerli/.pending/TokenA.json").exists());
}

#[tokio::test]
async fn test_rerun_replaces_the_unmined_deployment_at_its_nonce() {
    let ctx = TestContext::new("resume");
    let chain = Arc::new(InMemoryChain::new(5));
    chain.drop_next_broadcasts(3);

    let report = ctx.run(&chain).await;
    assert_eq!(report.outcome("TokenA").unwrap().status, TaskStatus::Failed);
    assert!(ctx.deployments.join("Goerli/.pending/TokenA.json").exists());

    // Nothing was mined in between: TokenA keeps nonce 0 and Vault follows it.
    let report = ctx.run(&chain).await;
    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(report.outcome("TokenA").unwrap().status, TaskStatus::Skipped);
    assert_eq!(report.outcome("Vault").unwrap().status, TaskStatus::Deployed);

    let sent = chain.sent();
    let nonces: Vec<u64> = sent.iter().map(|tx| tx.nonce).collect();
    assert_eq!(nonces, vec![0, 0, 0, 0, 1]);
    assert!(sent[3].max_fee_per_gas > sent[2].max_fee_per_gas);

    let token = ctx.record("Goerli", "TokenA").unwrap();
    assert_eq!(token.tx_hash, sent[3].hash);
    assert_eq!(token.address, deployer().create(0));
    assert_eq!(ctx.record("Goerli", "Vault").unwrap().address, deployer().create(1));
    assert!(!ctx.deployments.join("Goerli/.pending/TokenA.json").exists());
    assert_eq!(chain.mine_pending(), 0);
}

#[tokio::test]
async fn test_journaled_nonce_taken_by_another_transaction_redeploys() {
    let ctx = TestContext::new("superseded");
    let chain = Arc::new(InMemoryChain::new(5));
    chain.drop_next_broadcasts(3);
    ctx.run(&chain).await.into_result().unwrap_err();

    // Someone else uses the deployer's nonce 0.
    let other = SignedDeployment {
        from: deployer(),
        nonce: 0,
        hash: TxHash::repeat_byte(0xee),
        gas_limit: 21_000,
        max_fee_per_gas: 1_000_000_000_000,
        max_priority_fee_per_gas: 1_000_000_000_000,
        raw: Bytes::new(),
    };
    deploykit::ChainClient::send_transaction(chain.as_ref(), &other)
        .await
        .unwrap();
    assert_eq!(chain.mined_count(deployer()), 1);

    let report = ctx.run(&chain).await;
    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(report.outcome("TokenA").unwrap().status, TaskStatus::Deployed);

    let token = ctx.record("Goerli", "TokenA").unwrap();
    assert_eq!(token.address, deployer().create(1));
    assert_ne!(token.tx_hash, other.hash);
    assert_eq!(ctx.record("Goerli", "Vault").unwrap().address, deployer().create(2));
    assert!(!ctx.deployments.join("Goerli/.pending/TokenA.json").exists());
}

#[tokio::test]
async fn test_cancel_during_submission_lets_it_confirm() {
    let ctx = TestContext::new("cancel-inflight");
    let chain = Arc::new(InMemoryChain::new(5));
    chain.drop_next_broadcasts(1);
    let (handle, signal) = CancelHandle::new();

    let miner = tokio::spawn({
        let chain = chain.clone();
        async move {
            while chain.sent().is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
            handle.cancel();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            chain.mine_pending()
        }
    });

    let report = ctx
        .orchestrator("Goerli", &chain)
        .with_cancel(signal)
        .run(&RunOptions::default())
        .await;
    assert_eq!(miner.await.unwrap(), 1);

    assert_eq!(report.state, RunState::Aborted);
    assert_eq!(
        statuses(&report),
        vec![
            ("TokenA".to_string(), TaskStatus::Deployed),
            ("Vault".to_string(), TaskStatus::Cancelled)
        ]
    );
    assert_eq!(chain.sent().len(), 1);

    let token = ctx.record("Goerli", "TokenA").unwrap();
    assert_eq!(token.tx_hash, chain.sent()[0].hash);
    assert!(ctx.record("Goerli", "Vault").is_none());
    assert!(!ctx.deployments.join("Goerli/.pending/TokenA.json").exists());
    assert_eq!(report.into_result().unwrap_err().exit_code(), 130);
}

#[tokio::test]
async fn test_cancelled_run_launches_nothing() {
    let ctx = TestContext::new("cancel");
    let chain = Arc::new(InMemoryChain::new(5));
    let (handle, signal) = CancelHandle::new();
    handle.cancel();

    let report = ctx
        .orchestrator("Goerli", &chain)
        .with_cancel(signal)
        .run(&RunOptions::default())
        .await;

    assert_eq!(report.state, RunState::Aborted);
    assert!(chain.sent().is_empty());
    assert!(
        report
            .outcomes
            .iter()
            .all(|outcome| outcome.status == TaskStatus::Cancelled)
    );
    assert_eq!(report.into_result().unwrap_err().exit_code(), 130);
}

#[tokio::test]
async fn test_tag_filter_includes_dependencies() {
    let mut ctx = TestContext::new("tags");
    let mut unrelated = ctx.config.tasks[0].clone();
    unrelated.name = "Unrelated".to_string();
    ctx.config.tasks.push(unrelated);
    let chain = Arc::new(InMemoryChain::new(5));

    let report = ctx
        .orchestrator("Goerli", &chain)
        .run(&RunOptions {
            tags: vec!["vault".to_string()],
            reset: false,
        })
        .await;

    assert!(report.is_success());
    assert_eq!(
        statuses(&report),
        vec![
            ("TokenA".to_string(), TaskStatus::Deployed),
            ("Vault".to_string(), TaskStatus::Deployed)
        ]
    );
    assert!(report.outcome("Unrelated").is_none());
}

#[tokio::test]
async fn test_reset_redeploys_everything() {
    let ctx = TestContext::new("reset");
    let chain = Arc::new(InMemoryChain::new(5));
    ctx.run(&chain).await.into_result().unwrap();

    let report = ctx
        .orchestrator("Goerli", &chain)
        .run(&RunOptions {
            tags: vec![],
            reset: true,
        })
        .await;

    assert!(report.is_success());
    assert_eq!(report.transactions, 2);
    assert_eq!(chain.sent().len(), 4);
}

#[tokio::test]
async fn test_reset_with_a_cycle_keeps_existing_records() {
    let mut ctx = TestContext::new("reset-cycle");
    let chain = Arc::new(InMemoryChain::new(5));
    ctx.run(&chain).await.into_result().unwrap();

    ctx.config.tasks[0].dependencies = vec!["Vault".to_string()];
    let report = ctx
        .orchestrator("Goerli", &chain)
        .run(&RunOptions {
            tags: vec![],
            reset: true,
        })
        .await;

    assert_eq!(report.state, RunState::Aborted);
    assert!(matches!(
        report.into_result(),
        Err(DeployError::DependencyCycle { .. })
    ));
    assert_eq!(chain.sent().len(), 2);
    assert!(ctx.record("Goerli", "TokenA").is_some());
    assert!(ctx.record("Goerli", "Vault").is_some());
}

#[tokio::test]
async fn test_reset_with_an_unknown_role_keeps_existing_records() {
    let mut ctx = TestContext::new("reset-role");
    let chain = Arc::new(InMemoryChain::new(5));
    ctx.run(&chain).await.into_result().unwrap();

    ctx.config.tasks[1].from = Some("admin".to_string());
    let err = ctx
        .orchestrator("Goerli", &chain)
        .run(&RunOptions {
            tags: vec![],
            reset: true,
        })
        .await
        .into_result()
        .unwrap_err();

    assert!(matches!(err, DeployError::AccountResolution { ref role, .. } if role == "admin"));
    assert_eq!(chain.sent().len(), 2);
    assert!(ctx.record("Goerli", "TokenA").is_some());
    assert!(ctx.record("Goerli", "Vault").is_some());
}

#[tokio::test]
async fn test_networks_deploy_concurrently_into_separate_partitions() {
    let ctx = TestContext::new("multi");
    let goerli = Arc::new(InMemoryChain::new(5));
    let sepolia = Arc::new(InMemoryChain::new(11155111));

    let mut orchestrators = vec![
        ctx.orchestrator("Goerli", &goerli),
        ctx.orchestrator("Sepolia", &sepolia),
    ];
    let reports = deploy_networks(&mut orchestrators, &RunOptions::default()).await;

    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(RunReport::is_success));
    assert_eq!(goerli.sent().len(), 2);
    assert_eq!(sepolia.sent().len(), 2);

    assert_eq!(ctx.record("Goerli", "Vault").unwrap().chain_id, 5);
    assert_eq!(ctx.record("Sepolia", "Vault").unwrap().chain_id, 11155111);
}
