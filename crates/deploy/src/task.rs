//! Deployment tasks, constructor arguments, compiled artifacts and content hashing.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, B256, Bytes, I256, U256},
};
use anyhow::{Context, Result};
use derive_more::{Deref, Display, From};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// `0x`-prefixed hex SHA-256 of some content (bytecode or encoded constructor arguments).
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, Deref, From,
)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash some bytes. Deterministic: the same content always produces the same hash.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(format!("0x{}", hex::encode(hasher.finalize())))
    }
}

/// A constructor argument.
///
/// `address_of` refers to the address another task deployed (in this run or a
/// previous one), which also makes that task an implicit dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    Address(Address),
    AddressOf(String),
    /// Decimal or `0x` hex.
    Uint(String),
    Int(String),
    Bool(bool),
    String(String),
    Bytes(Bytes),
    Bytes32(B256),
}

impl ArgValue {
    fn to_sol_value(&self, addresses: &HashMap<String, Address>) -> Result<DynSolValue> {
        Ok(match self {
            Self::Address(address) => DynSolValue::Address(*address),
            Self::AddressOf(task) => DynSolValue::Address(
                *addresses
                    .get(task)
                    .with_context(|| format!("No deployed address known for `{task}`"))?,
            ),
            Self::Uint(value) => DynSolValue::Uint(
                value
                    .parse::<U256>()
                    .with_context(|| format!("Invalid uint argument `{value}`"))?,
                256,
            ),
            Self::Int(value) => DynSolValue::Int(
                value
                    .parse::<I256>()
                    .with_context(|| format!("Invalid int argument `{value}`"))?,
                256,
            ),
            Self::Bool(value) => DynSolValue::Bool(*value),
            Self::String(value) => DynSolValue::String(value.clone()),
            Self::Bytes(value) => DynSolValue::Bytes(value.to_vec()),
            Self::Bytes32(value) => DynSolValue::FixedBytes(*value, 32),
        })
    }
}

/// One contract deployment, declared before a run and immutable during it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentTask {
    /// Deployment name, also the key of its record in the registry.
    pub name: String,
    /// Artifact the bytecode came from.
    pub contract: String,
    /// Declared dependencies, in declaration order, without duplicates.
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
    /// Creation bytecode.
    pub bytecode: Bytes,
    pub bytecode_hash: ContentHash,
    pub args: Vec<ArgValue>,
    /// Named account sending the deployment.
    pub from: String,
    pub abi: Option<Value>,
}

impl DeploymentTask {
    pub fn new(name: impl Into<String>, bytecode: impl Into<Bytes>) -> Self {
        let name = name.into();
        let bytecode = bytecode.into();
        Self {
            contract: name.clone(),
            name,
            dependencies: Vec::new(),
            tags: Vec::new(),
            bytecode_hash: ContentHash::of(&bytecode),
            bytecode,
            args: Vec::new(),
            from: crate::config::DEFAULT_ROLE.to_string(),
            abi: None,
        }
    }

    pub fn contract(mut self, contract: impl Into<String>) -> Self {
        self.contract = contract.into();
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn arg(mut self, arg: ArgValue) -> Self {
        self.args.push(arg);
        self
    }

    pub fn args(mut self, args: Vec<ArgValue>) -> Self {
        self.args = args;
        self
    }

    pub fn from_role(mut self, role: impl Into<String>) -> Self {
        self.from = role.into();
        self
    }

    pub fn abi(mut self, abi: Value) -> Self {
        self.abi = Some(abi);
        self
    }

    /// Declared dependencies followed by tasks referenced through `address_of`.
    pub fn all_dependencies(&self) -> Vec<&str> {
        let mut all: Vec<&str> = self.dependencies.iter().map(String::as_str).collect();
        for arg in &self.args {
            if let ArgValue::AddressOf(task) = arg {
                if !all.contains(&task.as_str()) {
                    all.push(task);
                }
            }
        }
        all
    }

    /// ABI-encode the constructor arguments against the known deployed addresses.
    pub fn encode_args(&self, addresses: &HashMap<String, Address>) -> Result<Bytes> {
        if self.args.is_empty() {
            return Ok(Bytes::new());
        }

        let values = self
            .args
            .iter()
            .map(|arg| arg.to_sol_value(addresses))
            .collect::<Result<Vec<_>>>()?;

        Ok(DynSolValue::Tuple(values).abi_encode_params().into())
    }

    /// Creation transaction input: bytecode followed by the encoded arguments.
    pub fn deploy_input(&self, encoded_args: &[u8]) -> Bytes {
        let mut input = Vec::with_capacity(self.bytecode.len() + encoded_args.len());
        input.extend_from_slice(&self.bytecode);
        input.extend_from_slice(encoded_args);
        input.into()
    }
}

/// A compiled contract artifact, in the layout produced by common Solidity toolchains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub contract_name: String,
    #[serde(default)]
    pub abi: Value,
    pub bytecode: Bytes,
}

impl Artifact {
    /// Load an artifact file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read artifact {}", path.display()))?;
        let artifact: Self = serde_json::from_str(&content).with_context(|| {
            format!(
                "Failed to parse artifact {} (unlinked libraries are not supported)",
                path.display()
            )
        })?;

        if artifact.bytecode.is_empty() {
            anyhow::bail!(
                "Artifact {} has no creation bytecode (abstract contract or interface?)",
                path.display()
            );
        }

        Ok(artifact)
    }

    /// Find `<contract>.json` anywhere under the artifacts directory and load it.
    pub fn find(artifacts_dir: &Path, contract: &str) -> Result<Self> {
        let file_name = format!("{contract}.json");
        let path = find_file(artifacts_dir, &file_name)?.with_context(|| {
            format!(
                "Artifact `{}` not found under {}",
                contract,
                artifacts_dir.display()
            )
        })?;
        Self::load_from_file(&path)
    }
}

fn find_file(dir: &Path, file_name: &str) -> Result<Option<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory {}", dir.display()))?;

    let mut subdirs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if path.file_name().and_then(|n| n.to_str()) == Some(file_name) {
            return Ok(Some(path));
        }
    }

    subdirs.sort();
    for subdir in subdirs {
        if let Some(found) = find_file(&subdir, file_name)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_hash_determinism() {
        let hash1 = ContentHash::of(&[0x60, 0x80, 0x60, 0x40]);
        let hash2 = ContentHash::of(&[0x60, 0x80, 0x60, 0x40]);

        assert_eq!(hash1, hash2, "Hash should be deterministic");
        assert!(hash1.starts_with("0x"));
        assert_eq!(hash1.len(), 66, "SHA-256 hash should be 64 hex characters after the prefix");
        assert_ne!(hash1, ContentHash::of(&[0x60, 0x80]));
    }

    #[test]
    fn test_new_task_hashes_bytecode() {
        let task = DeploymentTask::new("TokenA", vec![0x60, 0x80]);
        assert_eq!(task.bytecode_hash, ContentHash::of(&[0x60, 0x80]));
        assert_eq!(task.contract, "TokenA");
        assert_eq!(task.from, "deployer");
    }

    #[test]
    fn test_address_of_is_an_implicit_dependency() {
        let task = DeploymentTask::new("Vault", vec![0x60])
            .depends_on("Oracle")
            .depends_on("Oracle")
            .arg(ArgValue::AddressOf("TokenA".to_string()))
            .arg(ArgValue::AddressOf("Oracle".to_string()));

        assert_eq!(task.dependencies, vec!["Oracle".to_string()]);
        assert_eq!(task.all_dependencies(), vec!["Oracle", "TokenA"]);
    }

    #[test]
    fn test_encode_args() {
        let token = Address::from_str("0x70997970C51812dc3A010C7d01b50e0d17dc79C8").unwrap();
        let addresses = HashMap::from([("TokenA".to_string(), token)]);

        let task = DeploymentTask::new("Vault", vec![0x60])
            .arg(ArgValue::AddressOf("TokenA".to_string()))
            .arg(ArgValue::Uint("1000".to_string()));

        let encoded = task.encode_args(&addresses).unwrap();
        assert_eq!(encoded.len(), 64);
        assert_eq!(&encoded[12..32], token.as_slice());
        assert_eq!(encoded[63], 0xe8);
        assert_eq!(encoded[62], 0x03);

        let input = task.deploy_input(&encoded);
        assert_eq!(input.len(), 65);
        assert_eq!(input[0], 0x60);
    }

    #[test]
    fn test_encode_args_requires_known_address() {
        let task = DeploymentTask::new("Vault", vec![0x60]).arg(ArgValue::AddressOf("TokenA".to_string()));
        assert!(task.encode_args(&HashMap::new()).is_err());
    }

    #[test]
    fn test_no_args_encode_to_empty() {
        let task = DeploymentTask::new("TokenA", vec![0x60]);
        assert!(task.encode_args(&HashMap::new()).unwrap().is_empty());
    }

    #[test]
    fn test_find_artifact() {
        let temp_dir = TempDir::new("deploykit-test").expect("Failed to create temp dir");
        let nested = temp_dir.path().join("contracts/Token.sol");
        fs::create_dir_all(&nested).unwrap();
        fs::write(
            nested.join("TokenA.json"),
            r#"{"contractName":"TokenA","abi":[],"bytecode":"0x6080604052"}"#,
        )
        .unwrap();

        let artifact = Artifact::find(temp_dir.path(), "TokenA").unwrap();
        assert_eq!(artifact.contract_name, "TokenA");
        assert_eq!(artifact.bytecode.len(), 5);

        assert!(Artifact::find(temp_dir.path(), "Missing").is_err());
    }

    #[test]
    fn test_artifact_without_bytecode_is_rejected() {
        let temp_dir = TempDir::new("deploykit-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join("IToken.json");
        fs::write(&path, r#"{"contractName":"IToken","abi":[],"bytecode":"0x"}"#).unwrap();

        assert!(Artifact::load_from_file(&path).is_err());
    }
}
