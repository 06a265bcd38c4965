//! Resolution of named roles (e.g. `deployer`) to concrete signers.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Mutex, PoisonError},
};

use alloy_core::primitives::Address;
use alloy_signer_local::{MnemonicBuilder, PrivateKeySigner, coins_bip39::English};

use crate::{DeployError, config::NamedAccountSpec, network::NetworkProfile};

/// A secret string that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct RedactedSecret(String);

impl RedactedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RedactedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RedactedSecret(***)")
    }
}

/// Where the signing keys of a network come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountSource {
    /// An explicit list of private keys, addressed by position.
    Keys(Vec<RedactedSecret>),
    /// A BIP-39 mnemonic, addressed by `path/initial_index + index`.
    Mnemonic {
        phrase: RedactedSecret,
        path: String,
        initial_index: u32,
        count: u32,
    },
}

impl AccountSource {
    /// Number of accounts the source can produce.
    pub fn len(&self) -> usize {
        match self {
            Self::Keys(keys) => keys.len(),
            Self::Mnemonic { count, .. } => *count as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Maps roles to signers for one network.
///
/// Resolution is pure: the same role on the same network and account source always
/// yields the same signer. Resolved signers are cached for the lifetime of the resolver.
#[derive(Debug)]
pub struct AccountResolver {
    network: String,
    chain_id: u64,
    source: AccountSource,
    named_accounts: BTreeMap<String, NamedAccountSpec>,
    cache: Mutex<HashMap<usize, PrivateKeySigner>>,
}

impl AccountResolver {
    pub fn new(profile: &NetworkProfile, named_accounts: &BTreeMap<String, NamedAccountSpec>) -> Self {
        Self {
            network: profile.name.clone(),
            chain_id: profile.chain_id,
            source: profile.accounts.clone(),
            named_accounts: named_accounts.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The account index a role maps to on this network.
    ///
    /// A role that is not declared but parses as a number is used as a raw index.
    pub fn index_for(&self, role: &str) -> Result<usize, DeployError> {
        match self.named_accounts.get(role) {
            Some(spec) => spec.index_for(&self.network, self.chain_id).ok_or_else(|| {
                DeployError::account(
                    &self.network,
                    role,
                    "no index declared for this network and no `default`",
                )
            }),
            None => role.parse::<usize>().map_err(|_| {
                DeployError::account(&self.network, role, "role is not declared in `named_accounts`")
            }),
        }
    }

    /// Resolve a role to its signer.
    pub fn resolve(&self, role: &str) -> Result<PrivateKeySigner, DeployError> {
        let index = self.index_for(role)?;
        self.signer_at(index)
            .map_err(|message| DeployError::account(&self.network, role, message))
    }

    /// Resolve a role to its address.
    pub fn address(&self, role: &str) -> Result<Address, DeployError> {
        self.resolve(role).map(|signer| signer.address())
    }

    /// The configured signer controlling `address`, if any.
    pub fn signer_for(&self, address: Address) -> Option<PrivateKeySigner> {
        (0..self.source.len())
            .filter_map(|index| self.signer_at(index).ok())
            .find(|signer| signer.address() == address)
    }

    fn signer_at(&self, index: usize) -> Result<PrivateKeySigner, String> {
        if let Some(signer) = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(&index) {
            return Ok(signer.clone());
        }

        if index >= self.source.len() {
            return Err(format!(
                "account index {index} is out of range, the account source has {} account(s)",
                self.source.len()
            ));
        }

        let signer = match &self.source {
            AccountSource::Keys(keys) => keys[index]
                .expose()
                .parse::<PrivateKeySigner>()
                .map_err(|e| format!("signing key #{index} is invalid: {e}"))?,
            AccountSource::Mnemonic {
                phrase,
                path,
                initial_index,
                ..
            } => {
                let derivation = format!("{}/{}", path, *initial_index as usize + index);
                MnemonicBuilder::<English>::default()
                    .phrase(phrase.expose())
                    .derivation_path(&derivation)
                    .map_err(|e| format!("derivation path `{derivation}` is invalid: {e}"))?
                    .build()
                    .map_err(|e| format!("mnemonic cannot derive `{derivation}`: {e}"))?
            }
        };

        tracing::debug!(
            network = %self.network,
            index,
            address = %signer.address(),
            "Resolved signer"
        );

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, signer.clone());
        Ok(signer)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::network::{DEFAULT_GAS_MULTIPLIER, RetryPolicy};

    /// First two accounts of the well-known development mnemonic.
    const DEV_MNEMONIC: &str = "test test test test test test test test test test test junk";
    const DEV_KEY_0: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const DEV_ADDRESS_0: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
    const DEV_ADDRESS_1: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    fn profile(accounts: AccountSource) -> NetworkProfile {
        NetworkProfile {
            name: "Goerli".to_string(),
            rpc_endpoint: "https://goerli.example/rpc".parse().unwrap(),
            chain_id: 5,
            accounts,
            persist_deployments: true,
            confirmations: 1,
            gas_multiplier: DEFAULT_GAS_MULTIPLIER,
            live: true,
            tags: vec![],
            retry: RetryPolicy::default(),
        }
    }

    fn deployer_at(index: usize) -> BTreeMap<String, NamedAccountSpec> {
        BTreeMap::from([(
            "deployer".to_string(),
            NamedAccountSpec::PerNetwork(BTreeMap::from([("default".to_string(), index)])),
        )])
    }

    #[test]
    fn test_resolve_from_key_list() {
        let source = AccountSource::Keys(vec![RedactedSecret::new(DEV_KEY_0)]);
        let resolver = AccountResolver::new(&profile(source), &deployer_at(0));

        let address = resolver.address("deployer").unwrap();
        assert_eq!(address, Address::from_str(DEV_ADDRESS_0).unwrap());
    }

    #[test]
    fn test_key_without_prefix() {
        let source = AccountSource::Keys(vec![RedactedSecret::new(DEV_KEY_0.trim_start_matches("0x"))]);
        let resolver = AccountResolver::new(&profile(source), &deployer_at(0));
        assert_eq!(
            resolver.address("deployer").unwrap(),
            Address::from_str(DEV_ADDRESS_0).unwrap()
        );
    }

    #[test]
    fn test_resolve_from_mnemonic() {
        let source = AccountSource::Mnemonic {
            phrase: RedactedSecret::new(DEV_MNEMONIC),
            path: "m/44'/60'/0'/0".to_string(),
            initial_index: 0,
            count: 10,
        };
        let resolver = AccountResolver::new(&profile(source.clone()), &deployer_at(1));
        assert_eq!(
            resolver.address("deployer").unwrap(),
            Address::from_str(DEV_ADDRESS_1).unwrap()
        );

        // Same role, same source: same identity.
        let again = AccountResolver::new(&profile(source), &deployer_at(1));
        assert_eq!(again.address("deployer").unwrap(), resolver.address("deployer").unwrap());
    }

    #[test]
    fn test_mnemonic_initial_index_offsets_derivation() {
        let source = AccountSource::Mnemonic {
            phrase: RedactedSecret::new(DEV_MNEMONIC),
            path: "m/44'/60'/0'/0".to_string(),
            initial_index: 1,
            count: 10,
        };
        let resolver = AccountResolver::new(&profile(source), &deployer_at(0));
        assert_eq!(
            resolver.address("deployer").unwrap(),
            Address::from_str(DEV_ADDRESS_1).unwrap()
        );
    }

    #[test]
    fn test_signer_for_address() {
        let source = AccountSource::Mnemonic {
            phrase: RedactedSecret::new(DEV_MNEMONIC),
            path: "m/44'/60'/0'/0".to_string(),
            initial_index: 0,
            count: 3,
        };
        let resolver = AccountResolver::new(&profile(source), &deployer_at(0));

        let signer = resolver
            .signer_for(Address::from_str(DEV_ADDRESS_1).unwrap())
            .unwrap();
        assert_eq!(signer.address(), Address::from_str(DEV_ADDRESS_1).unwrap());
        assert!(resolver.signer_for(Address::repeat_byte(0x42)).is_none());
    }

    #[test]
    fn test_index_out_of_range() {
        let source = AccountSource::Keys(vec![RedactedSecret::new(DEV_KEY_0)]);
        let resolver = AccountResolver::new(&profile(source), &deployer_at(3));

        let err = resolver.resolve("deployer").unwrap_err();
        assert!(matches!(err, DeployError::AccountResolution { ref role, .. } if role == "deployer"));
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_invalid_key_material() {
        let source = AccountSource::Keys(vec![RedactedSecret::new("0xnothex")]);
        let resolver = AccountResolver::new(&profile(source), &deployer_at(0));
        assert!(matches!(
            resolver.resolve("deployer"),
            Err(DeployError::AccountResolution { .. })
        ));
    }

    #[test]
    fn test_unknown_role_and_numeric_role() {
        let source = AccountSource::Keys(vec![RedactedSecret::new(DEV_KEY_0)]);
        let resolver = AccountResolver::new(&profile(source), &deployer_at(0));

        assert!(resolver.resolve("admin").is_err());
        assert_eq!(resolver.index_for("0").unwrap(), 0);
    }

    #[test]
    fn test_secret_is_redacted() {
        let secret = RedactedSecret::new(DEV_KEY_0);
        assert!(!format!("{secret:?}").contains("ac0974"));
    }
}
