//! Configuration for the strata daemon and the IOV backend.
//!
//! Files are TOML. Resolution order: explicit path → $STRATA_CONFIG →
//! defaults. Values that must hold invariants (thread counts, parallel-call
//! caps) are validated after parsing, not while deserializing, so a config
//! error names the offending key.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ── Validated counts ──────────────────────────────────────────────────────────

/// Worker-thread count; must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NumberOfThreads(pub u32);

impl NumberOfThreads {
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.0 == 0 {
            return Err(ConfigError::MustBePositive("number_of_threads"));
        }
        Ok(self)
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }
}

// ── IOV backend parameter ─────────────────────────────────────────────────────

/// The IOV backend's construction parameter, read from its config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IovParameter {
    /// Network endpoint of the IOV provider.
    pub provider: String,
    pub number_of_threads: NumberOfThreadsSection,
    pub indirect_communication: IndirectCommunication,
    pub direct_communication: DirectCommunication,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumberOfThreadsSection {
    pub transport_clients: NumberOfThreads,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndirectCommunication {
    /// Ring slots for bounce-buffered copies.
    pub number_of_buffers: u32,
    /// Per-operation byte cap on the indirect path.
    pub maximum_transfer_size: u64,
    /// Bounded wait when all buffers are busy.
    pub acquire_buffer_timeout_in_milliseconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectCommunication {
    /// Per-operation byte cap on the direct path.
    pub maximum_transfer_size: u64,
}

impl Default for IovParameter {
    fn default() -> Self {
        Self {
            provider: "127.0.0.1:9430".into(),
            number_of_threads: NumberOfThreadsSection::default(),
            indirect_communication: IndirectCommunication::default(),
            direct_communication: DirectCommunication::default(),
        }
    }
}

impl Default for NumberOfThreadsSection {
    fn default() -> Self {
        Self {
            transport_clients: NumberOfThreads(4),
        }
    }
}

impl Default for IndirectCommunication {
    fn default() -> Self {
        Self {
            number_of_buffers: 8,
            maximum_transfer_size: 8 * 1024 * 1024,
            acquire_buffer_timeout_in_milliseconds: 10_000,
        }
    }
}

impl Default for DirectCommunication {
    fn default() -> Self {
        Self {
            maximum_transfer_size: 64 * 1024 * 1024,
        }
    }
}

impl IovParameter {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_owned(), e))?;
        let parameter: IovParameter =
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_owned(), e))?;
        parameter.validate()
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        self.number_of_threads.transport_clients.validate()?;
        Ok(self)
    }
}

// ── Daemon configuration ──────────────────────────────────────────────────────

/// Top-level stratad configuration. Every provider section is optional;
/// only configured providers are started.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub storage: Option<StorageProviderConfig>,
    pub block_device: Option<BlockDeviceConfig>,
    pub iov: Option<IovProviderConfig>,
    pub share: Option<ShareConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageProviderConfig {
    /// Control-channel listen address.
    pub listen: String,
    /// Bulk-transport listen address.
    pub bulk_listen: String,
    /// Trace-event log file. Empty = no tracing.
    pub trace_log: PathBuf,
}

impl Default for StorageProviderConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9410".into(),
            bulk_listen: "127.0.0.1:9411".into(),
            trace_log: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockDeviceConfig {
    pub listen: String,
    pub block_size: u64,
}

impl Default for BlockDeviceConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9420".into(),
            block_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IovProviderConfig {
    pub listen: String,
    /// Meta-database path. Empty = in-memory only.
    pub database: PathBuf,
    /// IOV backend parameter file. When set, its `provider` endpoint wins
    /// over `listen` and its thread/transfer settings are validated.
    pub parameter_file: PathBuf,
}

impl Default for IovProviderConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9430".into(),
            database: PathBuf::new(),
            parameter_file: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    pub listen: String,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9440".into(),
        }
    }
}

impl StrataConfig {
    /// Load config from an explicit path, else $STRATA_CONFIG, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_owned()),
            None => std::env::var("STRATA_CONFIG").ok().map(PathBuf::from),
        };
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
                toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path, e))
            }
            None => Ok(StrataConfig::default()),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("{0} must be positive")]
    MustBePositive(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
