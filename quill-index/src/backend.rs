//! The backend interface the engine consumes.
//!
//! The engine never talks to a node directly; an implementation of
//! [`BlockSource`] (JSON-RPC client, embedded node, test double) is handed
//! in at construction. Rate limiting and connection pooling are the
//! implementation's business.

use async_trait::async_trait;

use crate::chain::{Block, ContractInfo, Tx};
use crate::types::{AddrDesc, Amount, BlockHash, Height, MempoolEntry, Txid};

/// Errors surfaced by a backend implementation.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The RPC transport or the node itself failed.
    #[error("backend rpc error: {0}")]
    Rpc(String),

    /// The requested entity is unknown to the backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend does not implement this capability.
    #[error("backend does not support {0}")]
    NotSupported(&'static str),
}

/// Block and transaction source backing the engine.
///
/// The account-specific methods have refusing defaults so that UTXO
/// backends only implement what their chain family needs.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Returns the backend's current best block.
    async fn best_block(&self) -> Result<(Height, BlockHash), BackendError>;

    /// Returns the canonical hash at `height`, or `None` above the tip.
    async fn block_hash(&self, height: Height) -> Result<Option<BlockHash>, BackendError>;

    /// Fetches and parses the block with the given hash.
    async fn block(&self, hash: &BlockHash) -> Result<Block, BackendError>;

    /// Fetches a transaction with its confirmation height; `None` height
    /// marks a mempool transaction.
    async fn transaction(&self, txid: &Txid) -> Result<(Tx, Option<Height>), BackendError>;

    /// Returns the mempool postings touching the given descriptor.
    async fn mempool_entries(&self, desc: &AddrDesc) -> Result<Vec<MempoolEntry>, BackendError>;

    /// Current account balance (account chains).
    async fn account_balance(&self, _desc: &AddrDesc) -> Result<Amount, BackendError> {
        Err(BackendError::NotSupported("account_balance"))
    }

    /// Current account nonce (account chains).
    async fn account_nonce(&self, _desc: &AddrDesc) -> Result<u64, BackendError> {
        Err(BackendError::NotSupported("account_nonce"))
    }

    /// Token contract metadata, `None` for non-contract descriptors
    /// (account chains).
    async fn contract_info(
        &self,
        _desc: &AddrDesc,
    ) -> Result<Option<ContractInfo>, BackendError> {
        Err(BackendError::NotSupported("contract_info"))
    }

    /// Token balance of `owner` at `contract` (account chains).
    async fn contract_balance(
        &self,
        _owner: &AddrDesc,
        _contract: &AddrDesc,
    ) -> Result<Amount, BackendError> {
        Err(BackendError::NotSupported("contract_balance"))
    }
}
