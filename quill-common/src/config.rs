//! Indexer configuration.

use std::path::PathBuf;

/// Database size limit configuration.
///
/// This enum provides a clean TOML interface and easy extensibility for different units.
#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseSize {
    /// Limited to a specific size in GB
    Gb(usize),
    /// Limited to a specific size in MB, mostly useful for tests.
    Mb(usize),
}

impl Default for DatabaseSize {
    fn default() -> Self {
        DatabaseSize::Gb(32)
    }
}

impl PartialEq for DatabaseSize {
    fn eq(&self, other: &Self) -> bool {
        self.to_byte_count() == other.to_byte_count()
    }
}

impl DatabaseSize {
    /// Convert to bytes
    pub fn to_byte_count(&self) -> usize {
        match self {
            DatabaseSize::Gb(gb) => gb * 1024 * 1024 * 1024,
            DatabaseSize::Mb(mb) => mb * 1024 * 1024,
        }
    }
}

/// Database configuration.
///
/// Configures the file path and size limit for the persistent index store.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct DatabaseConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// Database size limit. Defaults to 32 GB.
    #[serde(default)]
    pub size: DatabaseSize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./quill_index"),
            size: DatabaseSize::default(),
        }
    }
}

/// Synchronisation mode of the indexer.
///
/// In `Follow` mode the engine tracks the backend tip and is allowed to
/// disconnect trailing blocks on a reorg. In `Bulk` mode (initial sync)
/// disconnects are refused and a reorg requires a reindex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Steady-state operation, disconnects permitted.
    Follow,
    /// Initial bulk sync, disconnects refused.
    Bulk,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Follow
    }
}

/// Top level configuration of the indexing engine.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct IndexerConfig {
    /// Coin identifier, e.g. "Bitcoin Testnet". Persisted into the store;
    /// opening an existing store under a different coin is a fatal error.
    pub coin: String,
    /// Persistent store location and sizing.
    #[serde(default)]
    pub db: DatabaseConfig,
    /// Synchronisation mode.
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// Number of most recent blocks for which the undo log is retained.
    /// Disconnecting below this window requires a reindex.
    #[serde(default = "default_block_txs_keep")]
    pub block_txs_keep: u32,
    /// Advisory upper bound on the number of cached transactions.
    #[serde(default = "default_tx_cache_size")]
    pub tx_cache_size: usize,
}

fn default_block_txs_keep() -> u32 {
    300
}

fn default_tx_cache_size() -> usize {
    100_000
}

impl IndexerConfig {
    /// Returns a configuration suitable for a throw-away store, used by tests.
    pub fn ephemeral(coin: &str, path: PathBuf) -> Self {
        Self {
            coin: coin.to_string(),
            db: DatabaseConfig {
                path,
                size: DatabaseSize::Mb(256),
            },
            sync_mode: SyncMode::Follow,
            block_txs_keep: default_block_txs_keep(),
            tx_cache_size: default_tx_cache_size(),
        }
    }
}
