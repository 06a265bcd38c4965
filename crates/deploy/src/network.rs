//! Validation of raw network settings into an immutable [`NetworkProfile`].

use std::time::Duration;

use url::Url;

use crate::{
    DeployError,
    accounts::{AccountSource, RedactedSecret},
    config::{AccountsConfig, NetworkConfig, RetryConfig},
};

/// Default number of confirmations to wait for.
pub const DEFAULT_CONFIRMATIONS: u64 = 1;
/// Default multiplier applied to gas estimates.
pub const DEFAULT_GAS_MULTIPLIER: f64 = 1.2;
/// Nodes reject replacements that raise fees by less than 12.5%.
pub const MIN_FEE_BUMP_PERCENT: u64 = 13;

/// Retry and confirmation policy of the transaction submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of broadcast attempts, the first one included.
    pub max_attempts: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// How long a single attempt waits for its receipt and confirmations.
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
    /// Minimum fee increase applied when replacing a previous attempt.
    pub fee_bump_percent: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            confirmation_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            fee_bump_percent: MIN_FEE_BUMP_PERCENT,
        }
    }
}

impl RetryPolicy {
    fn from_config(raw: &RetryConfig) -> Self {
        let default = Self::default();
        Self {
            max_attempts: raw.max_attempts.unwrap_or(default.max_attempts),
            min_delay: raw
                .min_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(default.min_delay),
            max_delay: raw
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(default.max_delay),
            confirmation_timeout: raw
                .confirmation_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default.confirmation_timeout),
            poll_interval: raw
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(default.poll_interval),
            fee_bump_percent: raw.fee_bump_percent.unwrap_or(default.fee_bump_percent),
        }
    }
}

/// A validated network, immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct NetworkProfile {
    pub name: String,
    pub rpc_endpoint: Url,
    pub chain_id: u64,
    pub accounts: AccountSource,
    pub persist_deployments: bool,
    pub confirmations: u64,
    pub gas_multiplier: f64,
    pub live: bool,
    pub tags: Vec<String>,
    pub retry: RetryPolicy,
}

/// Turns a [`NetworkConfig`] into a [`NetworkProfile`], or explains what is wrong with it.
pub struct NetworkConfigResolver;

impl NetworkConfigResolver {
    pub fn resolve(name: &str, raw: &NetworkConfig) -> Result<NetworkProfile, DeployError> {
        let rpc_endpoint = Self::resolve_url(name, raw.url.as_deref())?;

        let chain_id = match raw.chain_id {
            None => return Err(DeployError::config(name, "`chain_id` is required")),
            Some(id) if id <= 0 => {
                return Err(DeployError::config(
                    name,
                    format!("`chain_id` must be a positive integer, got {id}"),
                ));
            }
            Some(id) => id as u64,
        };

        let accounts = Self::resolve_accounts(name, raw.accounts.as_ref())?;

        let confirmations = raw.confirmations.unwrap_or(DEFAULT_CONFIRMATIONS);
        if confirmations == 0 {
            return Err(DeployError::config(name, "`confirmations` must be at least 1"));
        }

        let gas_multiplier = raw.gas_multiplier.unwrap_or(DEFAULT_GAS_MULTIPLIER);
        if !gas_multiplier.is_finite() || gas_multiplier < 1.0 {
            return Err(DeployError::config(
                name,
                format!("`gas_multiplier` must be at least 1.0, got {gas_multiplier}"),
            ));
        }

        let retry = RetryPolicy::from_config(&raw.retry);
        if retry.max_attempts == 0 {
            return Err(DeployError::config(name, "`retry.max_attempts` must be at least 1"));
        }
        if retry.fee_bump_percent < MIN_FEE_BUMP_PERCENT {
            return Err(DeployError::config(
                name,
                format!("`retry.fee_bump_percent` must be at least {MIN_FEE_BUMP_PERCENT}"),
            ));
        }

        let live = raw.live.unwrap_or_else(|| !is_local_endpoint(&rpc_endpoint));

        Ok(NetworkProfile {
            name: name.to_string(),
            rpc_endpoint,
            chain_id,
            accounts,
            persist_deployments: raw.save_deployments,
            confirmations,
            gas_multiplier,
            live,
            tags: raw.tags.clone(),
            retry,
        })
    }

    fn resolve_url(name: &str, url: Option<&str>) -> Result<Url, DeployError> {
        let url = url.map(str::trim).unwrap_or_default();
        if url.is_empty() {
            return Err(DeployError::config(name, "`url` is unset or empty"));
        }

        let parsed = Url::parse(url)
            .map_err(|e| DeployError::config(name, format!("`url` is malformed: {e}")))?;

        match parsed.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            scheme => {
                return Err(DeployError::config(
                    name,
                    format!("`url` has unsupported scheme `{scheme}`"),
                ));
            }
        }

        if parsed.host_str().is_none() {
            return Err(DeployError::config(name, "`url` has no host"));
        }

        Ok(parsed)
    }

    fn resolve_accounts(
        name: &str,
        accounts: Option<&AccountsConfig>,
    ) -> Result<AccountSource, DeployError> {
        match accounts {
            None => Err(DeployError::config(name, "`accounts` is required")),
            Some(AccountsConfig::Keys(keys)) => {
                if keys.is_empty() {
                    return Err(DeployError::config(name, "`accounts` has no signing keys"));
                }
                if let Some(position) = keys.iter().position(|key| key.trim().is_empty()) {
                    return Err(DeployError::config(
                        name,
                        format!("signing key #{position} is unset or empty"),
                    ));
                }
                Ok(AccountSource::Keys(
                    keys.iter().map(|key| RedactedSecret::new(key.trim())).collect(),
                ))
            }
            Some(AccountsConfig::Mnemonic(mnemonic)) => {
                if mnemonic.mnemonic.trim().is_empty() {
                    return Err(DeployError::config(name, "`accounts.mnemonic` is unset or empty"));
                }
                if mnemonic.count == 0 {
                    return Err(DeployError::config(name, "`accounts.count` must be at least 1"));
                }
                Ok(AccountSource::Mnemonic {
                    phrase: RedactedSecret::new(mnemonic.mnemonic.trim()),
                    path: mnemonic.path.trim_end_matches('/').to_string(),
                    initial_index: mnemonic.initial_index,
                    count: mnemonic.count,
                })
            }
        }
    }
}

fn is_local_endpoint(url: &Url) -> bool {
    matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "0.0.0.0" | "[::1]"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MnemonicConfig;

    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn goerli() -> NetworkConfig {
        NetworkConfig {
            url: Some("https://goerli.example/rpc".to_string()),
            chain_id: Some(5),
            accounts: Some(AccountsConfig::Keys(vec![KEY.to_string()])),
            save_deployments: true,
            ..Default::default()
        }
    }

    fn config_message(result: Result<NetworkProfile, DeployError>) -> String {
        match result {
            Err(DeployError::Config { message, .. }) => message,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_valid_profile() {
        let profile = NetworkConfigResolver::resolve("Goerli", &goerli()).unwrap();

        assert_eq!(profile.name, "Goerli");
        assert_eq!(profile.chain_id, 5);
        assert_eq!(profile.rpc_endpoint.as_str(), "https://goerli.example/rpc");
        assert!(profile.persist_deployments);
        assert_eq!(profile.confirmations, DEFAULT_CONFIRMATIONS);
        assert!(profile.live);
        assert_eq!(profile.retry, RetryPolicy::default());
    }

    #[test]
    fn test_unset_url_is_rejected() {
        let mut raw = goerli();
        raw.url = None;
        assert!(config_message(NetworkConfigResolver::resolve("Goerli", &raw)).contains("url"));

        raw.url = Some("   ".to_string());
        assert!(config_message(NetworkConfigResolver::resolve("Goerli", &raw)).contains("url"));
    }

    #[test]
    fn test_malformed_url_is_rejected() {
        let mut raw = goerli();
        raw.url = Some("not a url".to_string());
        assert!(config_message(NetworkConfigResolver::resolve("Goerli", &raw)).contains("malformed"));

        raw.url = Some("ftp://goerli.example".to_string());
        assert!(config_message(NetworkConfigResolver::resolve("Goerli", &raw)).contains("scheme"));
    }

    #[test]
    fn test_chain_id_must_be_positive() {
        let mut raw = goerli();
        raw.chain_id = None;
        assert!(config_message(NetworkConfigResolver::resolve("Goerli", &raw)).contains("chain_id"));

        raw.chain_id = Some(0);
        assert!(config_message(NetworkConfigResolver::resolve("Goerli", &raw)).contains("positive"));

        raw.chain_id = Some(-5);
        assert!(config_message(NetworkConfigResolver::resolve("Goerli", &raw)).contains("positive"));
    }

    #[test]
    fn test_unset_signing_key_is_rejected() {
        let mut raw = goerli();
        raw.accounts = Some(AccountsConfig::Keys(vec!["".to_string()]));
        assert!(config_message(NetworkConfigResolver::resolve("Goerli", &raw)).contains("unset"));

        raw.accounts = Some(AccountsConfig::Keys(vec![]));
        assert!(NetworkConfigResolver::resolve("Goerli", &raw).is_err());

        raw.accounts = None;
        assert!(config_message(NetworkConfigResolver::resolve("Goerli", &raw)).contains("accounts"));
    }

    #[test]
    fn test_mnemonic_source() {
        let mut raw = goerli();
        raw.accounts = Some(AccountsConfig::Mnemonic(MnemonicConfig {
            mnemonic: "test test test test test test test test test test test junk".to_string(),
            path: "m/44'/60'/0'/0/".to_string(),
            initial_index: 2,
            count: 5,
        }));

        let profile = NetworkConfigResolver::resolve("Goerli", &raw).unwrap();
        match profile.accounts {
            AccountSource::Mnemonic {
                path,
                initial_index,
                count,
                ..
            } => {
                assert_eq!(path, "m/44'/60'/0'/0");
                assert_eq!(initial_index, 2);
                assert_eq!(count, 5);
            }
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[test]
    fn test_local_endpoint_is_not_live() {
        let mut raw = goerli();
        raw.url = Some("http://localhost:8545".to_string());
        let profile = NetworkConfigResolver::resolve("local", &raw).unwrap();
        assert!(!profile.live);

        raw.live = Some(true);
        let profile = NetworkConfigResolver::resolve("local", &raw).unwrap();
        assert!(profile.live);
    }

    #[test]
    fn test_retry_overrides() {
        let mut raw = goerli();
        raw.retry = RetryConfig {
            max_attempts: Some(3),
            poll_interval_ms: Some(10),
            ..Default::default()
        };
        let profile = NetworkConfigResolver::resolve("Goerli", &raw).unwrap();
        assert_eq!(profile.retry.max_attempts, 3);
        assert_eq!(profile.retry.poll_interval, Duration::from_millis(10));
        assert_eq!(profile.retry.max_delay, RetryPolicy::default().max_delay);

        raw.retry.max_attempts = Some(0);
        assert!(NetworkConfigResolver::resolve("Goerli", &raw).is_err());

        raw.retry.max_attempts = Some(3);
        raw.retry.fee_bump_percent = Some(10);
        assert!(config_message(NetworkConfigResolver::resolve("Goerli", &raw)).contains("fee_bump_percent"));
    }
}
