//! Block disconnect: rolling trailing blocks back from the undo log.

use std::collections::{HashMap, HashSet};

use lmdb::{Transaction, WriteFlags};
use tracing::{info, warn};

use crate::chain::ChainType;
use crate::db::{tx_addresses_in, IndexDb};
use crate::error::IndexError;
use crate::types::{
    AccountTxUndo, AddrBalanceRow, AddrContractsRow, AddrDesc, Amount, BlockUndo, Height,
    HistoryEntry, TxAddressesRow, TxUndo, Txid,
};

impl IndexDb {
    /// Disconnects the trailing blocks `from ..= to`, newest first.
    ///
    /// The range must be a strict suffix of indexed history, and every
    /// height in it must still have its undo row; a range reaching below
    /// the retained undo window returns [`IndexError::ReindexRequired`]
    /// without touching any state.
    pub async fn disconnect_block_range(
        &self,
        from: Height,
        to: Height,
    ) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;

        tokio::task::block_in_place(|| {
            if from > to {
                return Err(IndexError::Invalid(format!(
                    "invalid disconnect range {from}..={to}"
                )));
            }
            // Bulk sync keeps no usable undo history.
            if self.sync_mode == quill_common::SyncMode::Bulk {
                return Err(IndexError::ReindexRequired(from.as_u32()));
            }
            match self.tip_height_blocking()? {
                Some(tip) if tip == to => {}
                tip => {
                    return Err(IndexError::Invalid(format!(
                        "disconnect range must end at the current tip {tip:?}, got {to}"
                    )));
                }
            }

            // Every height needs its undo row before anything is touched.
            {
                let txn = self.env().begin_ro_txn()?;
                for h in from.as_u32()..=to.as_u32() {
                    match txn.get(self.cols.block_txs, &Height::new(h).to_key()) {
                        Ok(_) => {}
                        Err(lmdb::Error::NotFound) => {
                            return Err(IndexError::ReindexRequired(h));
                        }
                        Err(e) => return Err(IndexError::Store(e)),
                    }
                }
            }

            for h in (from.as_u32()..=to.as_u32()).rev() {
                self.disconnect_one(Height::new(h))?;
            }

            self.env().sync(true)?;
            info!(%from, %to, "blocks disconnected");
            Ok(())
        })
    }

    fn disconnect_one(&self, height: Height) -> Result<(), IndexError> {
        let height_key = height.to_key();
        let raw_undo = {
            let txn = self.env().begin_ro_txn()?;
            txn.get(self.cols.block_txs, &height_key)?.to_vec()
        };

        let txid_len = self.chain().txid_len();
        match self.chain().chain_type() {
            ChainType::Utxo => {
                let undo = BlockUndo::unpack_utxo(&raw_undo, txid_len)
                    .map_err(|e| IndexError::corrupt("block_txs row", &height_key, e))?;
                self.disconnect_utxo(height, undo)
            }
            ChainType::Account => {
                let undo = BlockUndo::unpack_account(&raw_undo, txid_len)
                    .map_err(|e| IndexError::corrupt("block_txs row", &height_key, e))?;
                self.disconnect_account(height, undo)
            }
        }
    }

    // *** UTXO branch ***

    fn disconnect_utxo(&self, height: Height, undo: Vec<TxUndo>) -> Result<(), IndexError> {
        let mut balances: HashMap<AddrDesc, AddrBalanceRow> = HashMap::new();
        let mut prev_rows: HashMap<Txid, TxAddressesRow> = HashMap::new();
        let mut touched: HashSet<AddrDesc> = HashSet::new();

        // Rows created by this block; retracted wholesale below.
        let mut own_rows: HashMap<Txid, TxAddressesRow> = HashMap::new();
        {
            let txn = self.env().begin_ro_txn()?;
            for tx in &undo {
                match tx_addresses_in(&txn, self.cols.tx_addresses, &tx.txid)? {
                    Some(row) => {
                        own_rows.insert(tx.txid.clone(), row);
                    }
                    None => {
                        warn!(txid = %tx.txid, "DB inconsistency: tx not found in tx_addresses")
                    }
                }
            }
        }

        for tx in &undo {
            let mut per_tx_seen: HashSet<AddrDesc> = HashSet::new();

            // Retract the outputs this transaction created.
            if let Some(row) = own_rows.get(&tx.txid) {
                // clone the slots; the map entry stays untouched for
                // intra-block unspend lookups below
                for output in row.outputs.clone() {
                    if output.addr_desc.is_empty() {
                        continue;
                    }
                    touched.insert(output.addr_desc.clone());
                    let bal = self.disc_balance_entry(&mut balances, &output.addr_desc)?;
                    bal.balance = sub_or_warn(bal.balance, output.value, &output.addr_desc);
                    if per_tx_seen.insert(output.addr_desc.clone()) {
                        bal.tx_count = bal.tx_count.saturating_sub(1);
                    }
                }
            }

            // Restore the outputs this transaction spent.
            for uin in &tx.inputs {
                if !uin.addr_desc.is_empty() {
                    touched.insert(uin.addr_desc.clone());
                }

                let value = if let Some(row) = own_rows.get_mut(&uin.prev_txid) {
                    // Intra-block spend: the creating row is deleted with
                    // this block, only the balance movement is inverted.
                    match row.outputs.get_mut(uin.prev_vout as usize) {
                        Some(spot) => {
                            spot.spent = false;
                            spot.value
                        }
                        None => {
                            warn!(prev = %uin.prev_txid, vout = uin.prev_vout,
                                "DB inconsistency: undo references output out of range");
                            continue;
                        }
                    }
                } else {
                    if !prev_rows.contains_key(&uin.prev_txid) {
                        let txn = self.env().begin_ro_txn()?;
                        match tx_addresses_in(&txn, self.cols.tx_addresses, &uin.prev_txid)? {
                            Some(row) => {
                                prev_rows.insert(uin.prev_txid.clone(), row);
                            }
                            None => {
                                warn!(prev = %uin.prev_txid,
                                    "DB inconsistency: spent tx not found in tx_addresses");
                                continue;
                            }
                        }
                    }
                    let row = prev_rows.get_mut(&uin.prev_txid).expect("entry just inserted");
                    match row.outputs.get_mut(uin.prev_vout as usize) {
                        Some(spot) => {
                            spot.spent = false;
                            spot.value
                        }
                        None => {
                            warn!(prev = %uin.prev_txid, vout = uin.prev_vout,
                                "DB inconsistency: undo references output out of range");
                            continue;
                        }
                    }
                };

                if uin.addr_desc.is_empty() {
                    continue;
                }
                let bal = self.disc_balance_entry(&mut balances, &uin.addr_desc)?;
                bal.balance += value;
                bal.sent = sub_or_warn(bal.sent, value, &uin.addr_desc);
                if per_tx_seen.insert(uin.addr_desc.clone()) {
                    bal.tx_count = bal.tx_count.saturating_sub(1);
                }
            }
        }

        // One atomic batch per disconnected block.
        let height_key = height.to_key();
        let mut txn = self.env().begin_rw_txn()?;

        for (desc, row) in &balances {
            if row.is_void() {
                del_tolerant(&mut txn, self.cols.addr_balance, desc.as_bytes())?;
            } else {
                txn.put(
                    self.cols.addr_balance,
                    &desc.as_bytes(),
                    &row.pack(),
                    WriteFlags::empty(),
                )?;
            }
        }
        for (txid, row) in &prev_rows {
            txn.put(
                self.cols.tx_addresses,
                &txid.as_bytes(),
                &row.pack(),
                WriteFlags::empty(),
            )?;
        }
        for txid in own_rows.keys() {
            del_tolerant(&mut txn, self.cols.tx_addresses, txid.as_bytes())?;
        }
        for desc in &touched {
            del_tolerant(
                &mut txn,
                self.cols.addresses,
                &HistoryEntry::row_key(desc, height),
            )?;
        }
        del_tolerant(&mut txn, self.cols.height, &height_key)?;
        del_tolerant(&mut txn, self.cols.block_txs, &height_key)?;

        let new_best = self.best_below(&txn, height)?;
        self.persist_state_in(&mut txn, new_best)?;
        txn.commit()?;
        Ok(())
    }

    // *** Account branch ***

    fn disconnect_account(
        &self,
        height: Height,
        undo: Vec<AccountTxUndo>,
    ) -> Result<(), IndexError> {
        let mut contracts: HashMap<AddrDesc, AddrContractsRow> = HashMap::new();
        let mut touched: HashSet<AddrDesc> = HashSet::new();

        for tx in &undo {
            for desc in [&tx.from, &tx.to] {
                if desc.is_empty() {
                    continue;
                }
                touched.insert(desc.clone());
                let row = self.disc_contracts_entry(&mut contracts, desc)?;
                row.total_tx_count = row.total_tx_count.saturating_sub(1);
            }
            for (addr, contract) in &tx.touches {
                touched.insert(addr.clone());
                let row = self.disc_contracts_entry(&mut contracts, addr)?;
                match row.find_contract(contract) {
                    Some(index) => {
                        let slot = &mut row.contracts[index as usize - 1];
                        slot.tx_count = slot.tx_count.saturating_sub(1);
                        // Contracts unwind in exact inverse order of their
                        // first appearance, so dropping a zeroed tail entry
                        // keeps the indices of older postings stable.
                        if slot.tx_count == 0 {
                            row.contracts.remove(index as usize - 1);
                        }
                    }
                    None => warn!(addr = %addr, contract = %contract,
                        "DB inconsistency: undo references unknown contract"),
                }
            }
        }

        let height_key = height.to_key();
        let mut txn = self.env().begin_rw_txn()?;

        for (desc, row) in &contracts {
            if row.is_void() {
                del_tolerant(&mut txn, self.cols.addr_contracts, desc.as_bytes())?;
            } else {
                txn.put(
                    self.cols.addr_contracts,
                    &desc.as_bytes(),
                    &row.pack(),
                    WriteFlags::empty(),
                )?;
            }
        }
        for desc in &touched {
            del_tolerant(
                &mut txn,
                self.cols.addresses,
                &HistoryEntry::row_key(desc, height),
            )?;
        }
        // Cached transaction bodies of this block are stale once it is gone.
        for tx in &undo {
            del_tolerant(&mut txn, self.cols.transactions, tx.txid.as_bytes())?;
        }
        del_tolerant(&mut txn, self.cols.height, &height_key)?;
        del_tolerant(&mut txn, self.cols.block_txs, &height_key)?;

        let new_best = self.best_below(&txn, height)?;
        self.persist_state_in(&mut txn, new_best)?;
        txn.commit()?;
        Ok(())
    }

    // *** helpers ***

    fn best_below(
        &self,
        txn: &lmdb::RwTransaction<'_>,
        height: Height,
    ) -> Result<Option<Height>, IndexError> {
        if height.as_u32() == 0 {
            return Ok(None);
        }
        let below = height - 1;
        match txn.get(self.cols.height, &below.to_key()) {
            Ok(_) => Ok(Some(below)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(IndexError::Store(e)),
        }
    }

    fn disc_balance_entry<'a>(
        &self,
        balances: &'a mut HashMap<AddrDesc, AddrBalanceRow>,
        desc: &AddrDesc,
    ) -> Result<&'a mut AddrBalanceRow, IndexError> {
        if !balances.contains_key(desc) {
            let txn = self.env().begin_ro_txn()?;
            let row = match txn.get(self.cols.addr_balance, &desc.as_bytes()) {
                Ok(raw) => AddrBalanceRow::unpack(raw)
                    .map_err(|e| IndexError::corrupt("addr_balance row", desc.as_bytes(), e))?,
                Err(lmdb::Error::NotFound) => {
                    warn!(addr = %desc, "DB inconsistency: disconnect of address without balance row");
                    AddrBalanceRow::default()
                }
                Err(e) => return Err(IndexError::Store(e)),
            };
            balances.insert(desc.clone(), row);
        }
        Ok(balances.get_mut(desc).expect("entry just inserted"))
    }

    fn disc_contracts_entry<'a>(
        &self,
        contracts: &'a mut HashMap<AddrDesc, AddrContractsRow>,
        desc: &AddrDesc,
    ) -> Result<&'a mut AddrContractsRow, IndexError> {
        if !contracts.contains_key(desc) {
            let txn = self.env().begin_ro_txn()?;
            let row = match txn.get(self.cols.addr_contracts, &desc.as_bytes()) {
                Ok(raw) => AddrContractsRow::unpack(raw)
                    .map_err(|e| IndexError::corrupt("addr_contracts row", desc.as_bytes(), e))?,
                Err(lmdb::Error::NotFound) => {
                    warn!(addr = %desc, "DB inconsistency: disconnect of address without contracts row");
                    AddrContractsRow::default()
                }
                Err(e) => return Err(IndexError::Store(e)),
            };
            contracts.insert(desc.clone(), row);
        }
        Ok(contracts.get_mut(desc).expect("entry just inserted"))
    }
}

fn sub_or_warn(lhs: Amount, rhs: Amount, desc: &AddrDesc) -> Amount {
    match lhs.checked_sub(&rhs) {
        Some(v) => v,
        None => {
            warn!(addr = %desc, "DB inconsistency: amount underflow on disconnect, clamping to zero");
            Amount::zero()
        }
    }
}

fn del_tolerant(
    txn: &mut lmdb::RwTransaction<'_>,
    db: lmdb::Database,
    key: &[u8],
) -> Result<(), IndexError> {
    match txn.del(db, &key, None) {
        Ok(()) | Err(lmdb::Error::NotFound) => Ok(()),
        Err(e) => Err(IndexError::Store(e)),
    }
}
