//! The persistent column store of the engine.
//!
//! Eight named LMDB databases hold the index (§schema below). One write
//! transaction spanning all of them is the atomic per-block batch; read
//! operations open their own read transaction and therefore observe a
//! point-in-time snapshot across every column.
//!
//! Schema:
//!
//! | column          | key                        | value |
//! |-----------------|----------------------------|-------|
//! | `height`        | 4B BE height               | [`BlockRecord`] |
//! | `addresses`     | addrDesc ‖ 4B BE height    | repeated (txid ‖ varint(signedVout)) |
//! | `tx_addresses`  | txid                       | [`TxAddressesRow`] (UTXO chains) |
//! | `addr_balance`  | addrDesc                   | [`AddrBalanceRow`] (UTXO chains) |
//! | `addr_contracts`| addrDesc                   | [`AddrContractsRow`] (account chains) |
//! | `block_txs`     | 4B BE height               | [`BlockUndo`] |
//! | `transactions`  | txid                       | packed tx (cache) |
//! | `internal`      | constant keys              | serialized engine state |

pub(crate) mod connect;
pub(crate) mod disconnect;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use lmdb::{Cursor, Database, DatabaseFlags, Environment, EnvironmentFlags, Transaction};
use tracing::info;

use quill_common::{IndexerConfig, SyncMode};

use crate::chain::{ChainModel, ChainType};
use crate::error::IndexError;
use crate::types::{
    AddrBalanceRow, AddrContractsRow, AddrDesc, Amount, BlockRecord, Cancel, Height, HistoryEntry,
    Txid, TxAddressesRow,
};

/// Version of the on-disk layout. Bumping it invalidates existing stores;
/// opening a store written by a different version is a fatal startup error.
pub const SCHEMA_VERSION: u32 = 1;

const STATE_KEY: &[u8] = b"state";

/// Process-wide engine state: identity, sync progress and cache counters.
///
/// Mutated only under the writer lock; readers observe it through snapshots
/// of the `internal` column or the in-memory atomics.
#[derive(Debug)]
pub struct InternalState {
    coin: String,
    chain_type: ChainType,
    decimals: u32,
    best_height: RwLock<Option<Height>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl InternalState {
    /// Coin identifier the store was created for.
    pub fn coin(&self) -> &str {
        &self.coin
    }

    /// Chain family of the store.
    pub fn chain_type(&self) -> ChainType {
        self.chain_type
    }

    /// Decimals of the chain's base unit, stored for reader use.
    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    /// Height of the most recently connected block.
    pub fn best_height(&self) -> Option<Height> {
        *self.best_height.read().expect("state lock poisoned")
    }

    /// Transaction cache hits since process start.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Transaction cache misses since process start.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn set_best_height(&self, h: Option<Height>) {
        *self.best_height.write().expect("state lock poisoned") = h;
    }
}

/// Serialized form of the `internal` column state row.
#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedState {
    schema_version: u32,
    coin: String,
    chain_type: ChainType,
    decimals: u32,
    best_height: Option<u32>,
}

/// An unspent output reconstructed from the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmedUtxo {
    /// Funding transaction.
    pub txid: Txid,
    /// Output index.
    pub vout: u32,
    /// Output value.
    pub value: Amount,
    /// Height the output was mined at.
    pub height: Height,
}

#[derive(Clone, Copy)]
pub(crate) struct Columns {
    pub(crate) height: Database,
    pub(crate) addresses: Database,
    pub(crate) tx_addresses: Database,
    pub(crate) addr_balance: Database,
    pub(crate) addr_contracts: Database,
    pub(crate) block_txs: Database,
    pub(crate) transactions: Database,
    pub(crate) internal: Database,
}

/// Column identifiers, used by tests to examine raw store content.
#[cfg(test)]
#[derive(Clone, Copy, Debug)]
pub(crate) enum Column {
    Height,
    Addresses,
    TxAddresses,
    AddrBalance,
    AddrContracts,
    BlockTxs,
    Transactions,
}

/// The persistent index store.
///
/// At most one connect-or-disconnect runs at a time, serialized by the
/// internal writer lock; readers run in parallel to the writer and to one
/// another on store snapshots.
pub struct IndexDb {
    env: Environment,
    pub(crate) cols: Columns,
    chain: Arc<dyn ChainModel>,
    state: Arc<InternalState>,
    pub(crate) write_lock: tokio::sync::Mutex<()>,
    pub(crate) block_txs_keep: u32,
    pub(crate) sync_mode: SyncMode,
    path: PathBuf,
}

impl std::fmt::Debug for IndexDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexDb").field("path", &self.path).finish_non_exhaustive()
    }
}

impl IndexDb {
    /// Opens (or creates) the store under the configured directory.
    ///
    /// Fatal conditions: schema version mismatch, coin or chain family
    /// mismatch, and a best-height row that disagrees with the `height`
    /// column.
    pub fn open(config: &IndexerConfig, chain: Arc<dyn ChainModel>) -> Result<Self, IndexError> {
        let path = config.db.path.clone();
        if !path.exists() {
            fs::create_dir_all(&path)?;
        }

        let env = Environment::new()
            .set_max_dbs(8)
            .set_map_size(config.db.size.to_byte_count())
            .set_flags(EnvironmentFlags::NO_TLS | EnvironmentFlags::NO_READAHEAD)
            .open(&path)?;

        let cols = Columns {
            height: open_or_create_db(&env, "height")?,
            addresses: open_or_create_db(&env, "addresses")?,
            tx_addresses: open_or_create_db(&env, "tx_addresses")?,
            addr_balance: open_or_create_db(&env, "addr_balance")?,
            addr_contracts: open_or_create_db(&env, "addr_contracts")?,
            block_txs: open_or_create_db(&env, "block_txs")?,
            transactions: open_or_create_db(&env, "transactions")?,
            internal: open_or_create_db(&env, "internal")?,
        };

        let state = Self::load_or_init_state(&env, &cols, config, chain.as_ref())?;

        let db = Self {
            env,
            cols,
            chain,
            state: Arc::new(state),
            write_lock: tokio::sync::Mutex::new(()),
            block_txs_keep: config.block_txs_keep.max(1),
            sync_mode: config.sync_mode,
            path,
        };

        // Startup verification: the persisted best height and the height
        // column must agree (a crash can only land on a block boundary, so
        // disagreement means the store was tampered with or corrupted).
        let column_tip = db.tip_height_blocking()?;
        if db.state.best_height() != column_tip {
            return Err(IndexError::Inconsistent(format!(
                "best height {:?} does not match height column tip {:?}",
                db.state.best_height(),
                column_tip
            )));
        }

        info!(
            coin = db.state.coin(),
            chain = %db.state.chain_type(),
            best = ?db.state.best_height().map(u32::from),
            "index store opened"
        );
        Ok(db)
    }

    fn load_or_init_state(
        env: &Environment,
        cols: &Columns,
        config: &IndexerConfig,
        chain: &dyn ChainModel,
    ) -> Result<InternalState, IndexError> {
        let txn = env.begin_ro_txn()?;
        let existing = match txn.get(cols.internal, &STATE_KEY) {
            Ok(raw) => Some(
                serde_json::from_slice::<PersistedState>(raw)
                    .map_err(|e| IndexError::corrupt("internal state", STATE_KEY, e))?,
            ),
            Err(lmdb::Error::NotFound) => None,
            Err(e) => return Err(IndexError::Store(e)),
        };
        drop(txn);

        let state = match existing {
            Some(persisted) => {
                if persisted.schema_version != SCHEMA_VERSION {
                    return Err(IndexError::Corruption(format!(
                        "schema version mismatch: store has {}, this build requires {}; reindex required",
                        persisted.schema_version, SCHEMA_VERSION
                    )));
                }
                if persisted.coin != config.coin {
                    return Err(IndexError::Corruption(format!(
                        "store was created for coin {:?}, configured coin is {:?}",
                        persisted.coin, config.coin
                    )));
                }
                if persisted.chain_type != chain.chain_type() {
                    return Err(IndexError::Corruption(format!(
                        "store was created for a {} chain, the chain model is {}",
                        persisted.chain_type,
                        chain.chain_type()
                    )));
                }
                InternalState {
                    coin: persisted.coin,
                    chain_type: persisted.chain_type,
                    decimals: persisted.decimals,
                    best_height: RwLock::new(persisted.best_height.map(Height::new)),
                    cache_hits: AtomicU64::new(0),
                    cache_misses: AtomicU64::new(0),
                }
            }
            None => {
                let state = InternalState {
                    coin: config.coin.clone(),
                    chain_type: chain.chain_type(),
                    decimals: chain.amount_decimals(),
                    best_height: RwLock::new(None),
                    cache_hits: AtomicU64::new(0),
                    cache_misses: AtomicU64::new(0),
                };
                let mut txn = env.begin_rw_txn()?;
                txn.put(
                    cols.internal,
                    &STATE_KEY,
                    &serialize_state(&state),
                    lmdb::WriteFlags::empty(),
                )?;
                txn.commit()?;
                state
            }
        };
        Ok(state)
    }

    /// Shared engine state.
    pub fn state(&self) -> Arc<InternalState> {
        Arc::clone(&self.state)
    }

    /// The chain model the store was opened with.
    pub fn chain(&self) -> &Arc<dyn ChainModel> {
        &self.chain
    }

    /// Size of the store on disk, in bytes.
    pub fn database_size(&self) -> u64 {
        fs::metadata(self.path.join("data.mdb"))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Flushes the store and releases it. Pending write batches have either
    /// committed or never happened, so the on-disk state is always at a
    /// block boundary.
    pub async fn close(&self) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        tokio::task::block_in_place(|| self.env.sync(true))?;
        Ok(())
    }

    // *** Read side ***

    pub(crate) fn tip_height_blocking(&self) -> Result<Option<Height>, IndexError> {
        let txn = self.env.begin_ro_txn()?;
        let cur = txn.open_ro_cursor(self.cols.height)?;
        match cur.get(None, None, lmdb_sys::MDB_LAST) {
            Ok((key, _)) => {
                let key = key.ok_or_else(|| {
                    IndexError::Corruption("height column returned keyless row".into())
                })?;
                Ok(Some(Height::from_key(key).map_err(|e| {
                    IndexError::corrupt("height key", key, e)
                })?))
            }
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(IndexError::Store(e)),
        }
    }

    /// Returns the best indexed block, or `None` for an empty store.
    pub async fn best_block(&self) -> Result<Option<(Height, BlockRecord)>, IndexError> {
        tokio::task::block_in_place(|| {
            let Some(height) = self.tip_height_blocking()? else {
                return Ok(None);
            };
            let txn = self.env.begin_ro_txn()?;
            let key = height.to_key();
            let raw = txn.get(self.cols.height, &key)?;
            let record = BlockRecord::unpack(raw)
                .map_err(|e| IndexError::corrupt("height row", &key, e))?;
            Ok(Some((height, record)))
        })
    }

    /// Returns the block record stored at `height`.
    pub async fn block_record(&self, height: Height) -> Result<Option<BlockRecord>, IndexError> {
        tokio::task::block_in_place(|| {
            let txn = self.env.begin_ro_txn()?;
            let key = height.to_key();
            match txn.get(self.cols.height, &key) {
                Ok(raw) => Ok(Some(
                    BlockRecord::unpack(raw)
                        .map_err(|e| IndexError::corrupt("height row", &key, e))?,
                )),
                Err(lmdb::Error::NotFound) => Ok(None),
                Err(e) => Err(IndexError::Store(e)),
            }
        })
    }

    /// Returns the `tx_addresses` row of a confirmed transaction.
    pub async fn tx_addresses(&self, txid: &Txid) -> Result<Option<TxAddressesRow>, IndexError> {
        tokio::task::block_in_place(|| {
            let txn = self.env.begin_ro_txn()?;
            tx_addresses_in(&txn, self.cols.tx_addresses, txid)
        })
    }

    /// Returns the balance row of a descriptor.
    pub async fn addr_balance(&self, desc: &AddrDesc) -> Result<Option<AddrBalanceRow>, IndexError> {
        tokio::task::block_in_place(|| {
            let txn = self.env.begin_ro_txn()?;
            match txn.get(self.cols.addr_balance, &desc.as_bytes()) {
                Ok(raw) => Ok(Some(AddrBalanceRow::unpack(raw).map_err(|e| {
                    IndexError::corrupt("addr_balance row", desc.as_bytes(), e)
                })?)),
                Err(lmdb::Error::NotFound) => Ok(None),
                Err(e) => Err(IndexError::Store(e)),
            }
        })
    }

    /// Returns the contract counters row of a descriptor (account chains).
    pub async fn addr_contracts(
        &self,
        desc: &AddrDesc,
    ) -> Result<Option<AddrContractsRow>, IndexError> {
        tokio::task::block_in_place(|| {
            let txn = self.env.begin_ro_txn()?;
            match txn.get(self.cols.addr_contracts, &desc.as_bytes()) {
                Ok(raw) => Ok(Some(AddrContractsRow::unpack(raw).map_err(|e| {
                    IndexError::corrupt("addr_contracts row", desc.as_bytes(), e)
                })?)),
                Err(lmdb::Error::NotFound) => Ok(None),
                Err(e) => Err(IndexError::Store(e)),
            }
        })
    }

    /// Collects all confirmed postings of a descriptor within the inclusive
    /// height range, in chronological order (block order, then transaction
    /// order within the block, then position order within the transaction).
    pub async fn address_history(
        &self,
        desc: &AddrDesc,
        from: Height,
        to: Height,
        cancel: &Cancel,
    ) -> Result<Vec<(Height, HistoryEntry)>, IndexError> {
        let txid_len = self.chain.txid_len();
        tokio::task::block_in_place(|| {
            let txn = self.env.begin_ro_txn()?;
            let mut out = Vec::new();
            let mut cursor = txn.open_ro_cursor(self.cols.addresses)?;
            let start = HistoryEntry::row_key(desc, from);
            for (key, val) in cursor.iter_from(&start[..]) {
                if cancel.is_cancelled() {
                    return Err(IndexError::Aborted);
                }
                let Some(height) = row_height_for(desc, key) else {
                    break;
                };
                if height > to {
                    break;
                }
                let entries = HistoryEntry::unpack_row(val, txid_len)
                    .map_err(|e| IndexError::corrupt("addresses row", key, e))?;
                out.extend(entries.into_iter().map(|e| (height, e)));
            }
            Ok(out)
        })
    }

    /// Reconstructs the confirmed UTXO set of a descriptor.
    ///
    /// Walks the address's credit outpoints newest first, skipping spent
    /// outputs via `tx_addresses`, and subtracts every reported value from
    /// the stored balance. The walk stops as soon as the checksum reaches
    /// zero; a non-zero residual after a full walk is a consistency signal
    /// which the caller is expected to log.
    ///
    /// The whole reconstruction runs inside one store snapshot, so the
    /// `addresses`, `tx_addresses` and `addr_balance` columns are observed
    /// without torn state.
    pub async fn confirmed_utxos(
        &self,
        desc: &AddrDesc,
        cancel: &Cancel,
    ) -> Result<(Vec<ConfirmedUtxo>, Amount), IndexError> {
        let txid_len = self.chain.txid_len();
        tokio::task::block_in_place(|| {
            let txn = self.env.begin_ro_txn()?;

            let balance = match txn.get(self.cols.addr_balance, &desc.as_bytes()) {
                Ok(raw) => AddrBalanceRow::unpack(raw)
                    .map_err(|e| IndexError::corrupt("addr_balance row", desc.as_bytes(), e))?
                    .balance,
                Err(lmdb::Error::NotFound) => return Ok((Vec::new(), Amount::zero())),
                Err(e) => return Err(IndexError::Store(e)),
            };
            if balance.is_zero() {
                return Ok((Vec::new(), Amount::zero()));
            }

            // Credit outpoints, oldest first.
            let mut outpoints: Vec<(Height, Txid, u32)> = Vec::new();
            {
                let mut cursor = txn.open_ro_cursor(self.cols.addresses)?;
                let start = HistoryEntry::row_key(desc, Height::new(0));
                for (key, val) in cursor.iter_from(&start[..]) {
                    if cancel.is_cancelled() {
                        return Err(IndexError::Aborted);
                    }
                    let Some(height) = row_height_for(desc, key) else {
                        break;
                    };
                    let entries = HistoryEntry::unpack_row(val, txid_len)
                        .map_err(|e| IndexError::corrupt("addresses row", key, e))?;
                    for e in entries {
                        if e.vout.is_credit() {
                            outpoints.push((height, e.txid, e.vout.index()));
                        }
                    }
                }
            }

            let mut utxos = Vec::new();
            let mut checksum = balance;
            let mut last_txid: Option<Txid> = None;
            let mut last_row: Option<TxAddressesRow> = None;
            for (height, txid, vout) in outpoints.into_iter().rev() {
                if checksum.is_zero() {
                    break;
                }
                if cancel.is_cancelled() {
                    return Err(IndexError::Aborted);
                }
                if last_txid.as_ref() != Some(&txid) {
                    last_row = tx_addresses_in(&txn, self.cols.tx_addresses, &txid)?;
                    last_txid = Some(txid.clone());
                }
                let Some(row) = &last_row else {
                    tracing::warn!(%txid, "DB inconsistency: tx not found in tx_addresses");
                    continue;
                };
                let Some(output) = row.outputs.get(vout as usize) else {
                    tracing::warn!(%txid, vout, "DB inconsistency: tx_addresses row has too few outputs");
                    continue;
                };
                if output.spent {
                    continue;
                }
                utxos.push(ConfirmedUtxo {
                    txid: txid.clone(),
                    vout,
                    value: output.value,
                    height,
                });
                checksum = checksum.saturating_sub(&output.value);
            }
            Ok((utxos, checksum))
        })
    }

    // *** Transaction cache rows ***

    pub(crate) async fn cached_tx_get(&self, txid: &Txid) -> Result<Option<Vec<u8>>, IndexError> {
        tokio::task::block_in_place(|| {
            let txn = self.env.begin_ro_txn()?;
            match txn.get(self.cols.transactions, &txid.as_bytes()) {
                Ok(raw) => Ok(Some(raw.to_vec())),
                Err(lmdb::Error::NotFound) => Ok(None),
                Err(e) => Err(IndexError::Store(e)),
            }
        })
    }

    pub(crate) async fn cached_tx_put(&self, txid: &Txid, packed: &[u8]) -> Result<(), IndexError> {
        tokio::task::block_in_place(|| {
            let mut txn = self.env.begin_rw_txn()?;
            txn.put(
                self.cols.transactions,
                &txid.as_bytes(),
                &packed,
                lmdb::WriteFlags::empty(),
            )?;
            txn.commit()?;
            Ok(())
        })
    }

    // *** Write-path internals shared by connect/disconnect ***

    pub(crate) fn persist_state_in(
        &self,
        txn: &mut lmdb::RwTransaction<'_>,
        best_height: Option<Height>,
    ) -> Result<(), IndexError> {
        self.state.set_best_height(best_height);
        txn.put(
            self.cols.internal,
            &STATE_KEY,
            &serialize_state(&self.state),
            lmdb::WriteFlags::empty(),
        )?;
        Ok(())
    }

    pub(crate) fn env(&self) -> &Environment {
        &self.env
    }

    // *** Test support ***

    /// Dumps a whole column as raw key/value pairs in key order.
    #[cfg(test)]
    pub(crate) fn dump_column(&self, col: Column) -> Vec<(Vec<u8>, Vec<u8>)> {
        let db = match col {
            Column::Height => self.cols.height,
            Column::Addresses => self.cols.addresses,
            Column::TxAddresses => self.cols.tx_addresses,
            Column::AddrBalance => self.cols.addr_balance,
            Column::AddrContracts => self.cols.addr_contracts,
            Column::BlockTxs => self.cols.block_txs,
            Column::Transactions => self.cols.transactions,
        };
        let txn = self.env.begin_ro_txn().expect("ro txn");
        let mut cursor = txn.open_ro_cursor(db).expect("cursor");
        cursor
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect()
    }
}

/// Extracts the height suffix of an `addresses` row key, or `None` once the
/// cursor left the descriptor's prefix.
fn row_height_for(desc: &AddrDesc, key: &[u8]) -> Option<Height> {
    let prefix = desc.as_bytes();
    if key.len() != prefix.len() + Height::KEY_LEN || !key.starts_with(prefix) {
        return None;
    }
    Height::from_key(&key[prefix.len()..]).ok()
}

pub(crate) fn tx_addresses_in<T: Transaction>(
    txn: &T,
    db: Database,
    txid: &Txid,
) -> Result<Option<TxAddressesRow>, IndexError> {
    match txn.get(db, &txid.as_bytes()) {
        Ok(raw) => Ok(Some(TxAddressesRow::unpack(raw).map_err(|e| {
            IndexError::corrupt("tx_addresses row", txid.as_bytes(), e)
        })?)),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(IndexError::Store(e)),
    }
}

fn serialize_state(state: &InternalState) -> Vec<u8> {
    serde_json::to_vec(&PersistedState {
        schema_version: SCHEMA_VERSION,
        coin: state.coin.clone(),
        chain_type: state.chain_type,
        decimals: state.decimals,
        best_height: state.best_height().map(u32::from),
    })
    .expect("state serialization cannot fail")
}

fn open_or_create_db(env: &Environment, name: &str) -> Result<Database, IndexError> {
    match env.open_db(Some(name)) {
        Ok(db) => Ok(db),
        Err(lmdb::Error::NotFound) => Ok(env.create_db(Some(name), DatabaseFlags::empty())?),
        Err(e) => Err(IndexError::Store(e)),
    }
}
