//! Block connect: turning one parsed block into one atomic write batch.

use std::collections::{HashMap, HashSet};

use lmdb::{Cursor, Transaction, WriteFlags};
use tracing::{debug, info, warn};

use crate::chain::{Block, ChainType, Tx};
use crate::db::{tx_addresses_in, IndexDb};
use crate::error::IndexError;
use crate::types::{
    AccountTxUndo, AddrBalanceRow, AddrContractsRow, AddrDesc, BlockRecord, BlockUndo, Height,
    HistoryEntry, SignedVout, TxAddrInput, TxAddrOutput, TxAddressesRow, TxUndo, Txid, UndoInput,
};

/// In-memory accumulator of one block's mutations, committed in a single
/// write transaction.
#[derive(Default)]
struct Batch {
    addresses: HashMap<AddrDesc, Vec<HistoryEntry>>,
    tx_rows: HashMap<Txid, TxAddressesRow>,
    balances: HashMap<AddrDesc, AddrBalanceRow>,
    contracts: HashMap<AddrDesc, AddrContractsRow>,
    undo: BlockUndoBuilder,
}

enum BlockUndoBuilder {
    Utxo(Vec<TxUndo>),
    Account(Vec<AccountTxUndo>),
}

impl Default for BlockUndoBuilder {
    fn default() -> Self {
        BlockUndoBuilder::Utxo(Vec::new())
    }
}

/// Appends a posting to the per-descriptor accumulator.
///
/// Returns true if this is the first posting of `entry.txid` for the
/// descriptor, which is exactly when the transaction counter must grow.
/// Account chains collapse byte-identical postings (the same transfer side
/// can repeat within one transaction); UTXO chains keep every occurrence,
/// the reader treats the row as a multiset.
fn add_posting(
    addresses: &mut HashMap<AddrDesc, Vec<HistoryEntry>>,
    desc: &AddrDesc,
    entry: HistoryEntry,
    dedup_exact: bool,
) -> bool {
    let list = addresses.entry(desc.clone()).or_default();
    let first_for_tx = !list.iter().any(|e| e.txid == entry.txid);
    if !dedup_exact || !list.contains(&entry) {
        list.push(entry);
    }
    first_for_tx
}

impl IndexDb {
    /// Connects one block already validated by the backend.
    ///
    /// Produces exactly one atomic batch across `height`, `addresses`,
    /// `tx_addresses` (or `addr_contracts`), `addr_balance` and
    /// `block_txs`; a connect that commits is visible to readers all at
    /// once, a connect that fails leaves no trace.
    pub async fn connect_block(&self, block: &Block) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;

        tokio::task::block_in_place(|| {
            if let Some(tip) = self.tip_height_blocking()? {
                if block.height != tip + 1 {
                    return Err(IndexError::Invalid(format!(
                        "cannot connect block at height {}, current tip is {tip}",
                        block.height
                    )));
                }
            }

            let mut batch = Batch::default();
            match self.chain().chain_type() {
                ChainType::Utxo => self.build_utxo_batch(block, &mut batch)?,
                ChainType::Account => self.build_account_batch(block, &mut batch)?,
            }
            self.commit_batch(block, batch)?;

            self.env().sync(true)?;
            info!(height = %block.height, hash = %block.hash, txs = block.txs.len(), "block connected");
            Ok(())
        })
    }

    // *** UTXO branch ***

    fn build_utxo_batch(&self, block: &Block, batch: &mut Batch) -> Result<(), IndexError> {
        let mut undo = Vec::with_capacity(block.txs.len());

        // Pre-pass: load the tx_addresses rows of every previous outpoint
        // referenced from an earlier block. Outpoints created inside this
        // block resolve from the in-memory rows, never from disk.
        let block_txids: HashSet<&Txid> = block.txs.iter().map(|tx| &tx.txid).collect();
        {
            let txn = self.env().begin_ro_txn()?;
            for tx in &block.txs {
                for input in &tx.inputs {
                    let Some(prev_txid) = &input.prev_txid else {
                        continue;
                    };
                    if block_txids.contains(prev_txid) || batch.tx_rows.contains_key(prev_txid) {
                        continue;
                    }
                    if let Some(row) = tx_addresses_in(&txn, self.cols.tx_addresses, prev_txid)? {
                        batch.tx_rows.insert(prev_txid.clone(), row);
                    }
                }
            }
        }

        // Per-transaction pass, in iteration order. Each transaction's
        // outputs are recorded before its inputs, and both before the next
        // transaction, so a row's postings keep transaction order within
        // the block and position order within the transaction.
        for tx in &block.txs {
            let mut row = TxAddressesRow {
                height: block.height,
                inputs: vec![
                    TxAddrInput {
                        addr_desc: AddrDesc::empty(),
                        value: crate::types::Amount::zero(),
                    };
                    tx.inputs.iter().filter(|i| !i.is_coinbase()).count()
                ],
                outputs: Vec::with_capacity(tx.outputs.len()),
            };
            for (n, output) in tx.outputs.iter().enumerate() {
                let desc = match self.chain().addr_desc_from_vout(output) {
                    Ok(desc) => desc,
                    Err(e) => {
                        debug!(txid = %tx.txid, vout = n, "unresolvable output script: {e}");
                        AddrDesc::empty()
                    }
                };
                row.outputs.push(TxAddrOutput {
                    addr_desc: desc.clone(),
                    value: output.value,
                    spent: false,
                });
                if desc.is_empty() {
                    continue;
                }
                let first = add_posting(
                    &mut batch.addresses,
                    &desc,
                    HistoryEntry {
                        txid: tx.txid.clone(),
                        vout: SignedVout::credit(n as u32),
                    },
                    false,
                );
                let bal = self.balance_entry(&mut batch.balances, &desc)?;
                bal.balance += output.value;
                bal.tx_count += first as u32;
            }
            batch.tx_rows.insert(tx.txid.clone(), row);

            // Inputs of the same transaction: mark previous outputs spent,
            // move value from balance to sent, record the undo entries.
            // Intra-block previous outputs resolve from the rows inserted
            // by the transactions before this one.
            let mut tx_undo = TxUndo {
                txid: tx.txid.clone(),
                inputs: Vec::new(),
            };
            let mut slot = 0usize;
            for input in &tx.inputs {
                let Some(prev_txid) = &input.prev_txid else {
                    continue;
                };
                let vin_slot = slot;
                slot += 1;

                let Some(prev_row) = batch.tx_rows.get_mut(prev_txid) else {
                    warn!(txid = %tx.txid, prev = %prev_txid,
                        "DB inconsistency: input tx not found in tx_addresses");
                    continue;
                };
                let Some(spot) = prev_row.outputs.get_mut(input.prev_vout as usize) else {
                    warn!(txid = %tx.txid, prev = %prev_txid, vout = input.prev_vout,
                        "DB inconsistency: referenced output index out of range");
                    continue;
                };
                if spot.spent {
                    warn!(prev = %prev_txid, vout = input.prev_vout,
                        "DB inconsistency: double spend of output");
                }
                spot.spent = true;
                let desc = spot.addr_desc.clone();
                let value = spot.value;

                tx_undo.inputs.push(UndoInput {
                    addr_desc: desc.clone(),
                    prev_txid: prev_txid.clone(),
                    prev_vout: input.prev_vout,
                });

                if let Some(own_row) = batch.tx_rows.get_mut(&tx.txid) {
                    own_row.inputs[vin_slot] = TxAddrInput {
                        addr_desc: desc.clone(),
                        value,
                    };
                }

                if desc.is_empty() {
                    continue;
                }
                let first = add_posting(
                    &mut batch.addresses,
                    &desc,
                    HistoryEntry {
                        txid: tx.txid.clone(),
                        vout: SignedVout::debit(input.prev_vout),
                    },
                    false,
                );
                let bal = self.balance_entry(&mut batch.balances, &desc)?;
                bal.tx_count += first as u32;
                bal.sent += value;
                bal.balance = match bal.balance.checked_sub(&value) {
                    Some(b) => b,
                    None => {
                        warn!(addr = %desc, "DB inconsistency: balance underflow, clamping to zero");
                        crate::types::Amount::zero()
                    }
                };
            }
            undo.push(tx_undo);
        }

        batch.undo = BlockUndoBuilder::Utxo(undo);
        Ok(())
    }

    // *** Account branch ***

    fn build_account_batch(&self, block: &Block, batch: &mut Batch) -> Result<(), IndexError> {
        let mut undo = Vec::with_capacity(block.txs.len());

        for tx in &block.txs {
            let from = self.account_desc(tx, true);
            let to = self.account_desc(tx, false);

            // Base transfer postings: recipient side is +0, sender side
            // the complement of 0.
            if !to.is_empty() {
                add_posting(
                    &mut batch.addresses,
                    &to,
                    HistoryEntry {
                        txid: tx.txid.clone(),
                        vout: SignedVout::credit(0),
                    },
                    true,
                );
                self.contracts_entry(&mut batch.contracts, &to)?.total_tx_count += 1;
            }
            if !from.is_empty() {
                add_posting(
                    &mut batch.addresses,
                    &from,
                    HistoryEntry {
                        txid: tx.txid.clone(),
                        vout: SignedVout::debit(0),
                    },
                    true,
                );
                self.contracts_entry(&mut batch.contracts, &from)?.total_tx_count += 1;
            }

            // Token transfers. The posting's vout encodes the 1-based
            // position of the contract in that address's contract list, so
            // that a height-range scan can be narrowed to one contract.
            let mut touches = Vec::new();
            for transfer in self.chain().token_transfers(tx)? {
                for (side, is_sender) in [(&transfer.from, true), (&transfer.to, false)] {
                    if side.is_empty() {
                        continue;
                    }
                    let row = self.contracts_entry(&mut batch.contracts, side)?;
                    let index = row.contract_index(&transfer.contract);
                    row.contracts[index as usize - 1].tx_count += 1;
                    let vout = if is_sender {
                        SignedVout::debit(index)
                    } else {
                        SignedVout::credit(index)
                    };
                    add_posting(
                        &mut batch.addresses,
                        side,
                        HistoryEntry {
                            txid: tx.txid.clone(),
                            vout,
                        },
                        true,
                    );
                    touches.push((side.clone(), transfer.contract.clone()));
                }
            }

            undo.push(AccountTxUndo {
                txid: tx.txid.clone(),
                from,
                to,
                touches,
            });
        }

        batch.undo = BlockUndoBuilder::Account(undo);
        Ok(())
    }

    fn account_desc(&self, tx: &Tx, sender: bool) -> AddrDesc {
        let addresses = if sender {
            tx.inputs.first().map(|i| &i.addresses)
        } else {
            tx.outputs.first().map(|o| &o.addresses)
        };
        let Some(addr) = addresses.and_then(|a| a.first()) else {
            return AddrDesc::empty();
        };
        match self.chain().addr_desc_from_address(addr) {
            Ok(desc) => desc,
            Err(e) => {
                debug!(txid = %tx.txid, addr, "unresolvable account address: {e}");
                AddrDesc::empty()
            }
        }
    }

    // *** Lazy row loading ***

    fn balance_entry<'a>(
        &self,
        balances: &'a mut HashMap<AddrDesc, AddrBalanceRow>,
        desc: &AddrDesc,
    ) -> Result<&'a mut AddrBalanceRow, IndexError> {
        if !balances.contains_key(desc) {
            let txn = self.env().begin_ro_txn()?;
            let row = match txn.get(self.cols.addr_balance, &desc.as_bytes()) {
                Ok(raw) => AddrBalanceRow::unpack(raw)
                    .map_err(|e| IndexError::corrupt("addr_balance row", desc.as_bytes(), e))?,
                Err(lmdb::Error::NotFound) => AddrBalanceRow::default(),
                Err(e) => return Err(IndexError::Store(e)),
            };
            balances.insert(desc.clone(), row);
        }
        Ok(balances.get_mut(desc).expect("entry just inserted"))
    }

    fn contracts_entry<'a>(
        &self,
        contracts: &'a mut HashMap<AddrDesc, AddrContractsRow>,
        desc: &AddrDesc,
    ) -> Result<&'a mut AddrContractsRow, IndexError> {
        if !contracts.contains_key(desc) {
            let txn = self.env().begin_ro_txn()?;
            let row = match txn.get(self.cols.addr_contracts, &desc.as_bytes()) {
                Ok(raw) => AddrContractsRow::unpack(raw)
                    .map_err(|e| IndexError::corrupt("addr_contracts row", desc.as_bytes(), e))?,
                Err(lmdb::Error::NotFound) => AddrContractsRow::default(),
                Err(e) => return Err(IndexError::Store(e)),
            };
            contracts.insert(desc.clone(), row);
        }
        Ok(contracts.get_mut(desc).expect("entry just inserted"))
    }

    // *** Commit ***

    fn commit_batch(&self, block: &Block, batch: Batch) -> Result<(), IndexError> {
        let height_key = block.height.to_key();
        let record = BlockRecord {
            hash: block.hash,
            time: block.time,
            tx_count: block.txs.len() as u32,
            size: block.size,
        };

        let mut txn = self.env().begin_rw_txn()?;

        txn.put(
            self.cols.height,
            &height_key,
            &record.pack(),
            WriteFlags::empty(),
        )?;

        for (desc, entries) in &batch.addresses {
            txn.put(
                self.cols.addresses,
                &HistoryEntry::row_key(desc, block.height),
                &HistoryEntry::pack_row(entries),
                WriteFlags::empty(),
            )?;
        }

        for (txid, row) in &batch.tx_rows {
            txn.put(
                self.cols.tx_addresses,
                &txid.as_bytes(),
                &row.pack(),
                WriteFlags::empty(),
            )?;
        }

        for (desc, row) in &batch.balances {
            txn.put(
                self.cols.addr_balance,
                &desc.as_bytes(),
                &row.pack(),
                WriteFlags::empty(),
            )?;
        }

        for (desc, row) in &batch.contracts {
            txn.put(
                self.cols.addr_contracts,
                &desc.as_bytes(),
                &row.pack(),
                WriteFlags::empty(),
            )?;
        }

        let undo = match batch.undo {
            BlockUndoBuilder::Utxo(txs) => BlockUndo::Utxo(txs),
            BlockUndoBuilder::Account(txs) => BlockUndo::Account(txs),
        };
        txn.put(
            self.cols.block_txs,
            &height_key,
            &undo.pack(),
            WriteFlags::empty(),
        )?;

        // Retention sweep: the undo log only needs to cover the window a
        // reorg may realistically reach back over.
        if block.height.as_u32() + 1 > self.block_txs_keep {
            let bound = Height::new(block.height.as_u32() + 1 - self.block_txs_keep).to_key();
            let stale: Vec<Vec<u8>> = {
                let mut cursor = txn.open_ro_cursor(self.cols.block_txs)?;
                cursor
                    .iter_start()
                    .map(|(k, _)| k.to_vec())
                    .take_while(|k| k.as_slice() < &bound[..])
                    .collect()
            };
            for key in stale {
                txn.del(self.cols.block_txs, &key, None)?;
            }
        }

        self.persist_state_in(&mut txn, Some(block.height))?;
        txn.commit()?;
        Ok(())
    }
}
