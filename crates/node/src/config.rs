//! Node configuration: `hp.cfg` on disk, the consensus-mutable
//! `patch.cfg` subset inside the vfs, directory scaffolding, and the
//! single-instance lock.

use hotpocket_consensus::ConsensusMode;
use hotpocket_types::{KeyPair, PublicKey, Role, Unl};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Config version floor accepted by this build.
pub const MIN_CONFIG_VERSION: &str = "0.3.0";

const MAX_ROUND_TIME: u32 = 3_600_000;
const MAX_STAGE_SLICE: u8 = 33;

/// Configuration failures are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("another instance already holds the contract directory")]
    AlreadyRunning,
}

impl ConfigError {
    fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.into(),
            source,
        }
    }
}

/// History retention mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryMode {
    /// Keep everything; serve log sync.
    Full,
    /// Keep a bounded shard window.
    Custom,
}

/// Node-local section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    pub public_key: String,
    pub private_key: String,
    pub role: Role,
    pub history: HistoryMode,
    pub max_primary_shards: u64,
    pub max_raw_shards: u64,
}

/// Per-round resource ceilings. Patch-mutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundLimits {
    pub user_input_bytes: u64,
    pub user_output_bytes: u64,
    pub npl_output_bytes: u64,
    pub proc_cpu_seconds: u64,
    pub proc_mem_bytes: u64,
    pub proc_ofd_count: u64,
    pub exec_timeout_ms: u64,
}

impl Default for RoundLimits {
    fn default() -> Self {
        Self {
            user_input_bytes: 10 * 1024 * 1024,
            user_output_bytes: 10 * 1024 * 1024,
            npl_output_bytes: 1024 * 1024,
            proc_cpu_seconds: 0,
            proc_mem_bytes: 0,
            proc_ofd_count: 0,
            exec_timeout_ms: 30_000,
        }
    }
}

/// Consensus tunables. Patch-mutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusSection {
    pub mode: ConsensusMode,
    pub roundtime_ms: u32,
    pub stage_slice_percent: u8,
    pub threshold_percent: u8,
}

/// Contract section; everything mirrored into [`PatchConfig`] is
/// consensus-mutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSection {
    pub id: String,
    pub version: String,
    pub unl: BTreeSet<String>,
    pub bin_path: String,
    pub bin_args: Vec<String>,
    pub environment: Vec<(String, String)>,
    pub max_input_ledger_offset: u32,
    pub execute: bool,
    pub run_as: Option<(u32, u32)>,
    pub consensus: ConsensusSection,
    pub npl_mode: ConsensusMode,
    pub round_limits: RoundLimits,
}

/// Peer mesh section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSection {
    pub port: u16,
    pub idle_timeout_ms: u64,
    pub msg_forwarding: bool,
    pub known_peers: Vec<String>,
    /// Bad messages tolerated per accounting minute before the peer is
    /// banned for the session (0 = unlimited).
    pub max_bad_msgs_per_min: u32,
}

/// User connection section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSection {
    pub port: u16,
    pub idle_timeout_ms: u64,
    /// Malformed lines tolerated per accounting minute before the user
    /// connection is dropped (0 = unlimited).
    pub max_bad_msgs_per_min: u32,
}

/// Logging section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    pub log_level: String,
}

/// The whole `hp.cfg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpConfig {
    pub hp_version: String,
    pub node: NodeSection,
    pub contract: ContractSection,
    pub mesh: MeshSection,
    pub user: UserSection,
    pub log: LogSection,
}

/// The consensus-mutable subset that lives inside the vfs as
/// `patch.cfg`. Its hash is part of consensus state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchConfig {
    pub version: String,
    pub unl: BTreeSet<String>,
    pub bin_path: String,
    pub bin_args: Vec<String>,
    pub environment: Vec<(String, String)>,
    pub max_input_ledger_offset: u32,
    pub consensus: ConsensusSection,
    pub npl_mode: ConsensusMode,
    pub round_limits: RoundLimits,
}

impl HpConfig {
    /// Default config for a freshly created contract directory.
    pub fn default_for_new(key: &KeyPair) -> Self {
        let pubkey_hex = key.public_key().to_hex();
        Self {
            hp_version: MIN_CONFIG_VERSION.to_string(),
            node: NodeSection {
                public_key: pubkey_hex.clone(),
                private_key: hex::encode(key.secret_bytes()),
                role: Role::Validator,
                history: HistoryMode::Custom,
                max_primary_shards: 1,
                max_raw_shards: 0,
            },
            contract: ContractSection {
                id: uuid_v4(),
                version: "1.0".to_string(),
                unl: [pubkey_hex].into_iter().collect(),
                bin_path: "<your contract binary here>".to_string(),
                bin_args: vec![],
                environment: vec![],
                max_input_ledger_offset: 10,
                execute: true,
                run_as: None,
                consensus: ConsensusSection {
                    mode: ConsensusMode::Private,
                    roundtime_ms: 1000,
                    stage_slice_percent: 25,
                    threshold_percent: 80,
                },
                npl_mode: ConsensusMode::Private,
                round_limits: RoundLimits::default(),
            },
            mesh: MeshSection {
                port: 22860,
                idle_timeout_ms: 120_000,
                msg_forwarding: true,
                known_peers: vec![],
                max_bad_msgs_per_min: 200,
            },
            user: UserSection {
                port: 8080,
                idle_timeout_ms: 0,
                max_bad_msgs_per_min: 200,
            },
            log: LogSection {
                log_level: "inf".to_string(),
            },
        }
    }

    /// Validate bounds and key material.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let consensus = &self.contract.consensus;
        if consensus.roundtime_ms == 0 || consensus.roundtime_ms > MAX_ROUND_TIME {
            return Err(ConfigError::Invalid(format!(
                "roundtime {} outside [1, {MAX_ROUND_TIME}]",
                consensus.roundtime_ms
            )));
        }
        if consensus.stage_slice_percent == 0 || consensus.stage_slice_percent > MAX_STAGE_SLICE {
            return Err(ConfigError::Invalid(format!(
                "stage_slice {} outside [1, {MAX_STAGE_SLICE}]",
                consensus.stage_slice_percent
            )));
        }
        if consensus.threshold_percent == 0 || consensus.threshold_percent > 100 {
            return Err(ConfigError::Invalid(format!(
                "threshold {} outside [1, 100]",
                consensus.threshold_percent
            )));
        }
        if self.node.history == HistoryMode::Custom && self.node.max_primary_shards == 0 {
            return Err(ConfigError::Invalid(
                "max_primary_shards cannot be zero in history=custom mode".to_string(),
            ));
        }
        self.keypair()?;
        self.unl()?;
        Ok(())
    }

    /// The node keypair from the hex key material.
    pub fn keypair(&self) -> Result<KeyPair, ConfigError> {
        let bytes = hex::decode(&self.node.private_key)
            .map_err(|_| ConfigError::Invalid("private key is not hex".to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConfigError::Invalid("private key must be 32 bytes".to_string()))?;
        let key = KeyPair::from_seed(seed);
        if key.public_key().to_hex() != self.node.public_key {
            return Err(ConfigError::Invalid(
                "public key does not match private key".to_string(),
            ));
        }
        Ok(key)
    }

    /// Build the UNL from the contract section.
    pub fn unl(&self) -> Result<Unl, ConfigError> {
        parse_unl(
            &self.contract.unl,
            self.contract.consensus.threshold_percent,
        )
    }

    /// Extract the consensus-mutable subset.
    pub fn patch(&self) -> PatchConfig {
        PatchConfig {
            version: self.contract.version.clone(),
            unl: self.contract.unl.clone(),
            bin_path: self.contract.bin_path.clone(),
            bin_args: self.contract.bin_args.clone(),
            environment: self.contract.environment.clone(),
            max_input_ledger_offset: self.contract.max_input_ledger_offset,
            consensus: self.contract.consensus.clone(),
            npl_mode: self.contract.npl_mode,
            round_limits: self.contract.round_limits.clone(),
        }
    }

    /// Fold an agreed patch back into the running config.
    pub fn apply_patch(&mut self, patch: PatchConfig) {
        self.contract.version = patch.version;
        self.contract.unl = patch.unl;
        self.contract.bin_path = patch.bin_path;
        self.contract.bin_args = patch.bin_args;
        self.contract.environment = patch.environment;
        self.contract.max_input_ledger_offset = patch.max_input_ledger_offset;
        self.contract.consensus = patch.consensus;
        self.contract.npl_mode = patch.npl_mode;
        self.contract.round_limits = patch.round_limits;
    }
}

/// Parse a hex-encoded UNL with a threshold.
pub fn parse_unl(members: &BTreeSet<String>, threshold: u8) -> Result<Unl, ConfigError> {
    let mut keys = BTreeSet::new();
    for hex_key in members {
        keys.insert(
            PublicKey::from_hex(hex_key)
                .map_err(|_| ConfigError::Invalid(format!("bad UNL key: {hex_key}")))?,
        );
    }
    Unl::new(keys, threshold).map_err(|e| ConfigError::Invalid(e.to_string()))
}

/// Directory layout of one contract instance.
#[derive(Debug, Clone)]
pub struct ContractCtx {
    pub contract_dir: PathBuf,
    pub config_file: PathBuf,
    pub contract_fs_dir: PathBuf,
    pub ledger_dir: PathBuf,
    pub exec_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl ContractCtx {
    /// Resolve paths from the base directory.
    pub fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().to_path_buf();
        Self {
            config_file: base.join("cfg").join("hp.cfg"),
            contract_fs_dir: base.join("contract_fs"),
            ledger_dir: base.join("ledger"),
            exec_dir: base.join("exec"),
            log_dir: base.join("log"),
            contract_dir: base,
        }
    }

    /// Scaffold a new contract directory with a default config.
    pub fn create_new(&self) -> Result<(), ConfigError> {
        if self.contract_dir.exists() {
            return Err(ConfigError::Invalid(format!(
                "contract dir already exists: {}",
                self.contract_dir.display()
            )));
        }
        for dir in [
            self.config_file.parent().unwrap().to_path_buf(),
            self.contract_fs_dir.clone(),
            self.ledger_dir.clone(),
            self.exec_dir.clone(),
            self.log_dir.clone(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| ConfigError::io(dir.display().to_string(), e))?;
        }

        let key = KeyPair::generate();
        let config = HpConfig::default_for_new(&key);
        write_config(&self.config_file, &config)?;
        Ok(())
    }

    /// Regenerate the node key, swapping it inside the UNL in place.
    pub fn rekey(&self) -> Result<(), ConfigError> {
        let _lock = InstanceLock::acquire(&self.config_file)?;
        let mut config = read_config(&self.config_file)?;

        let old_pubkey = config.node.public_key.clone();
        if !config.contract.unl.remove(&old_pubkey) {
            return Err(ConfigError::Invalid(
                "updating public key in unl list failed".to_string(),
            ));
        }

        let key = KeyPair::generate();
        config.node.public_key = key.public_key().to_hex();
        config.node.private_key = hex::encode(key.secret_bytes());
        config.contract.unl.insert(config.node.public_key.clone());

        write_config(&self.config_file, &config)
    }
}

/// Read and parse `hp.cfg`.
pub fn read_config(path: &Path) -> Result<HpConfig, ConfigError> {
    let bytes = fs::read(path).map_err(|e| ConfigError::io(path.display().to_string(), e))?;
    let config: HpConfig = serde_json::from_slice(&bytes)
        .map_err(|e| ConfigError::Invalid(format!("config parse: {e}")))?;

    if config.hp_version.is_empty() {
        return Err(ConfigError::Invalid("config hp_version missing".to_string()));
    }
    if version_compare(&config.hp_version, MIN_CONFIG_VERSION) == std::cmp::Ordering::Less {
        return Err(ConfigError::Invalid(format!(
            "config version too old, minimum {MIN_CONFIG_VERSION} required, {} found",
            config.hp_version
        )));
    }
    Ok(config)
}

/// Persist `hp.cfg` prettily (operators edit it by hand).
pub fn write_config(path: &Path, config: &HpConfig) -> Result<(), ConfigError> {
    let json = serde_json::to_vec_pretty(config)
        .map_err(|e| ConfigError::Invalid(format!("config serialize: {e}")))?;
    fs::write(path, json).map_err(|e| ConfigError::io(path.display().to_string(), e))
}

/// Holds an exclusive flock on the config file for the process
/// lifetime. A second process fails to acquire it and must exit: the
/// lock doubles as the single-instance guard.
pub struct InstanceLock {
    _file: fs::File,
}

impl InstanceLock {
    /// Acquire or fail fast.
    pub fn acquire(config_file: &Path) -> Result<Self, ConfigError> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(config_file)
            .map_err(|e| ConfigError::io(config_file.display().to_string(), e))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(ConfigError::AlreadyRunning);
        }
        Ok(Self { _file: file })
    }
}

fn version_compare(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect()
    };
    parse(a).cmp(&parse(b))
}

/// Random contract id in the canonical 8-4-4-4-12 shape.
fn uuid_v4() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let h = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> HpConfig {
        HpConfig::default_for_new(&KeyPair::generate())
    }

    #[test]
    fn default_config_validates() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn bounds_are_enforced() {
        let mut c = valid_config();
        c.contract.consensus.roundtime_ms = 0;
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.contract.consensus.roundtime_ms = MAX_ROUND_TIME + 1;
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.contract.consensus.stage_slice_percent = 34;
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.contract.consensus.threshold_percent = 0;
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.node.max_primary_shards = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn mismatched_keys_are_rejected() {
        let mut c = valid_config();
        c.node.public_key = KeyPair::generate().public_key().to_hex();
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hp.cfg");
        let config = valid_config();
        write_config(&path, &config).unwrap();
        let loaded = read_config(&path).unwrap();
        assert_eq!(loaded.node.public_key, config.node.public_key);
        assert_eq!(loaded.contract.unl, config.contract.unl);
        loaded.validate().unwrap();
    }

    #[test]
    fn old_config_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hp.cfg");
        let mut config = valid_config();
        config.hp_version = "0.1.0".to_string();
        write_config(&path, &config).unwrap();
        assert!(read_config(&path).is_err());
    }

    #[test]
    fn create_new_scaffolds_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContractCtx::new(dir.path().join("contract"));
        ctx.create_new().unwrap();
        assert!(ctx.config_file.exists());
        let config = read_config(&ctx.config_file).unwrap();
        config.validate().unwrap();
        // Self is in its own UNL.
        assert!(config.contract.unl.contains(&config.node.public_key));

        assert!(ctx.create_new().is_err());
    }

    #[test]
    fn rekey_swaps_key_inside_unl() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContractCtx::new(dir.path().join("contract"));
        ctx.create_new().unwrap();
        let before = read_config(&ctx.config_file).unwrap();

        ctx.rekey().unwrap();
        let after = read_config(&ctx.config_file).unwrap();
        after.validate().unwrap();
        assert_ne!(before.node.public_key, after.node.public_key);
        assert!(!after.contract.unl.contains(&before.node.public_key));
        assert!(after.contract.unl.contains(&after.node.public_key));
        assert_eq!(after.contract.unl.len(), before.contract.unl.len());
    }

    #[test]
    fn instance_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hp.cfg");
        std::fs::write(&path, b"{}").unwrap();

        let first = InstanceLock::acquire(&path).unwrap();
        assert!(matches!(
            InstanceLock::acquire(&path),
            Err(ConfigError::AlreadyRunning)
        ));
        drop(first);
        InstanceLock::acquire(&path).unwrap();
    }

    #[test]
    fn patch_round_trip_preserves_subset() {
        let config = valid_config();
        let patch = config.patch();
        let mut other = valid_config();
        other.apply_patch(patch.clone());
        assert_eq!(other.patch(), patch);
        // Node-local fields untouched.
        assert_ne!(other.node.public_key, config.node.public_key);
    }
}
