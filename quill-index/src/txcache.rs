//! Persistent by-txid cache of parsed transactions.
//!
//! Populated lazily by readers that had to go to the backend; served from
//! the `transactions` column afterwards. Sharing needs no extra lock, the
//! column store mediates. Hit and miss counts feed the engine state.

use std::sync::Arc;

use crate::backend::{BackendError, BlockSource};
use crate::chain::{ChainModel, Tx};
use crate::db::IndexDb;
use crate::error::IndexError;
use crate::types::{Height, Txid};

/// The transaction cache.
pub struct TxCache {
    db: Arc<IndexDb>,
    chain: Arc<dyn ChainModel>,
    backend: Arc<dyn BlockSource>,
}

impl TxCache {
    /// Creates a cache over the given store and backend.
    pub fn new(db: Arc<IndexDb>, chain: Arc<dyn ChainModel>, backend: Arc<dyn BlockSource>) -> Self {
        Self { db, chain, backend }
    }

    /// Returns a parsed transaction with its confirmation height and block
    /// time, from the cache when possible, from the backend otherwise.
    ///
    /// Confirmed backend responses are written back to the cache; mempool
    /// transactions are not cached, their block placement is not settled.
    pub async fn transaction(
        &self,
        txid: &Txid,
    ) -> Result<(Tx, Option<Height>, u32), IndexError> {
        if let Some(packed) = self.db.cached_tx_get(txid).await? {
            self.db.state().record_cache_hit();
            let (tx, height, block_time) = self
                .chain
                .unpack_tx(&packed)
                .map_err(|e| IndexError::corrupt("transactions row", txid.as_bytes(), e))?;
            return Ok((tx, Some(height), block_time));
        }
        self.db.state().record_cache_miss();

        let (tx, height) = match self.backend.transaction(txid).await {
            Ok(found) => found,
            Err(BackendError::NotFound(msg)) => return Err(IndexError::NotFound(msg)),
            Err(e) => return Err(IndexError::Backend(e)),
        };
        let mut block_time = 0;
        if let Some(height) = height {
            if let Some(record) = self.db.block_record(height).await? {
                block_time = record.time;
            }
            let packed = self.chain.pack_tx(&tx, height, block_time)?;
            self.db.cached_tx_put(txid, &packed).await?;
        }
        Ok((tx, height, block_time))
    }
}
