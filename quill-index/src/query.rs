//! The query layer: address lookup with paging, UTXO reconstruction,
//! spending-transaction resolution and block listing on top of the index
//! columns.

pub mod types;

use std::collections::HashSet;
use std::sync::Arc;

use hex::FromHex;
use tracing::warn;

use crate::backend::{BackendError, BlockSource};
use crate::chain::{ChainModel, ChainType, ContractInfo};
use crate::db::IndexDb;
use crate::error::IndexError;
use crate::query::types::{
    AddressFilter, AddressInfo, AddressOption, BlockPage, BlockSummary, BlocksPage, Paging,
    SystemInfo, TokenHolding, TokenTransferView, TxDetails, TxVin, TxVout, Utxo, VoutFilter,
};
use crate::txcache::TxCache;
use crate::types::{
    AddrDesc, Amount, BlockHash, BlockRecord, Cancel, Height, Txid, TxAddressesRow,
};

/// Handle to the read side of the engine.
///
/// Every operation takes a [`Cancel`] flag, honored at iterator-step
/// boundaries, and observes the store through per-call snapshots: a block
/// committed at time T is visible in full to calls starting after T and not
/// at all to calls that started before.
pub struct Query {
    db: Arc<IndexDb>,
    cache: Arc<TxCache>,
    backend: Arc<dyn BlockSource>,
    chain: Arc<dyn ChainModel>,
}

impl Query {
    /// Creates a query handle.
    pub fn new(
        db: Arc<IndexDb>,
        cache: Arc<TxCache>,
        backend: Arc<dyn BlockSource>,
        chain: Arc<dyn ChainModel>,
    ) -> Self {
        Self {
            db,
            cache,
            backend,
            chain,
        }
    }

    // *** Transactions ***

    /// Resolves one transaction: input funding, output spent bits and,
    /// optionally, the transaction spending each spent output.
    pub async fn transaction(
        &self,
        txid: &Txid,
        with_spending: bool,
        cancel: &Cancel,
    ) -> Result<TxDetails, IndexError> {
        let (tx, height, block_time) = self.cache.transaction(txid).await?;
        self.transaction_details(tx, height, block_time, with_spending, cancel)
            .await
    }

    /// Returns the txid of the transaction that spent output `n` of `txid`,
    /// or `None` while the output is unspent.
    ///
    /// There is no direct prev-outpoint → spender index; the posting walk
    /// plus the candidate's `tx_addresses` input amount is a cheap filter
    /// and the raw vin comparison closes it.
    pub async fn spending_txid(
        &self,
        txid: &Txid,
        n: u32,
        cancel: &Cancel,
    ) -> Result<Option<Txid>, IndexError> {
        let tx = self.transaction(txid, false, cancel).await?;
        let Some(vout) = tx.vout.get(n as usize) else {
            return Err(IndexError::Invalid(format!(
                "vout index {n} out of range for tx {txid} with {} outputs",
                tx.vout.len()
            )));
        };
        let mut vout = vout.clone();
        let from = tx.block_height.unwrap_or(Height::new(0));
        self.resolve_spending(&mut vout, txid, from, cancel).await?;
        Ok(vout.spent_txid)
    }

    async fn transaction_details(
        &self,
        tx: crate::chain::Tx,
        height: Option<Height>,
        block_time: u32,
        with_spending: bool,
        cancel: &Cancel,
    ) -> Result<TxDetails, IndexError> {
        let chain_type = self.chain.chain_type();
        let confirmed = height.is_some();

        let ta = if confirmed && chain_type == ChainType::Utxo {
            let row = self.db.tx_addresses(&tx.txid).await?;
            if row.is_none() {
                warn!(txid = %tx.txid, "DB inconsistency: tx not found in tx_addresses");
            }
            row
        } else {
            None
        };

        let (block_hash, block_time) = match height {
            Some(h) => match self.db.block_record(h).await? {
                Some(rec) => (Some(rec.hash), rec.time),
                None => (None, block_time),
            },
            None => (None, block_time),
        };

        let mut value_in = Amount::zero();
        let mut vins = Vec::with_capacity(tx.inputs.len());
        for (i, input) in tx.inputs.iter().enumerate() {
            let mut vin = TxVin {
                n: i as u32,
                txid: input.prev_txid.clone(),
                vout: input.prev_vout,
                ..TxVin::default()
            };
            match chain_type {
                ChainType::Utxo => {
                    // A missing prev txid is a coinbase input.
                    if let Some(prev_txid) = &input.prev_txid {
                        self.resolve_vin_funding(&mut vin, prev_txid, input.prev_vout, confirmed)
                            .await?;
                        if let Some(v) = vin.value {
                            value_in += v;
                        }
                    }
                }
                ChainType::Account => {
                    if let Some(addr) = input.addresses.first() {
                        vin.addr_desc = self.chain.addr_desc_from_address(addr).ok();
                        vin.addresses = input.addresses.clone();
                    }
                }
            }
            vins.push(vin);
        }

        let mut value_out = Amount::zero();
        let mut vouts = Vec::with_capacity(tx.outputs.len());
        for (i, output) in tx.outputs.iter().enumerate() {
            value_out += output.value;
            let desc = self.chain.addr_desc_from_vout(output).ok();
            let addresses = match &desc {
                Some(d) => self.chain.addresses_from_addr_desc(d),
                None => output.addresses.clone(),
            };
            let mut vout = TxVout {
                n: i as u32,
                value: output.value,
                addr_desc: desc,
                addresses,
                ..TxVout::default()
            };
            if let Some(ta) = &ta {
                if let Some(slot) = ta.outputs.get(i) {
                    vout.spent = slot.spent;
                }
                if with_spending && vout.spent {
                    let from = height.unwrap_or(Height::new(0));
                    self.resolve_spending(&mut vout, &tx.txid, from, cancel)
                        .await?;
                }
            }
            vouts.push(vout);
        }

        let (value_in, fees) = match chain_type {
            ChainType::Utxo => {
                // Coinbase transactions have zero value in and zero fee.
                let fees = value_in.saturating_sub(&value_out);
                (Some(value_in), fees)
            }
            ChainType::Account => (None, Amount::zero()),
        };

        let mut token_transfers = Vec::new();
        if chain_type == ChainType::Account {
            for t in self.chain.token_transfers(&tx)? {
                let info = match self.backend.contract_info(&t.contract).await {
                    Ok(info) => info,
                    Err(e) => {
                        warn!(contract = %t.contract, "contract info lookup failed: {e}");
                        None
                    }
                };
                let info = info.unwrap_or_else(|| self.fallback_contract_info(&t.contract));
                token_transfers.push(TokenTransferView {
                    contract: info.contract,
                    from: self.first_address(&t.from),
                    to: self.first_address(&t.to),
                    value: t.value,
                    name: info.name,
                    symbol: info.symbol,
                    decimals: info.decimals,
                });
            }
        }

        Ok(TxDetails {
            txid: tx.txid,
            block_hash,
            block_height: height,
            block_time,
            confirmations: self.confirmations(height),
            value_in,
            value_out,
            fees,
            vin: vins,
            vout: vouts,
            token_transfers,
        })
    }

    /// Fills an input's funding address and value from the previous
    /// transaction's `tx_addresses` row, falling back to the backend for
    /// mempool ancestors.
    async fn resolve_vin_funding(
        &self,
        vin: &mut TxVin,
        prev_txid: &Txid,
        prev_vout: u32,
        confirmed: bool,
    ) -> Result<(), IndexError> {
        match self.db.tx_addresses(prev_txid).await? {
            Some(tas) => {
                if let Some(slot) = tas.outputs.get(prev_vout as usize) {
                    vin.value = Some(slot.value);
                    vin.addresses = self.chain.addresses_from_addr_desc(&slot.addr_desc);
                    vin.addr_desc = Some(slot.addr_desc.clone());
                }
            }
            None => {
                // Mempool ancestors are not in tx_addresses; for confirmed
                // ones the row is missing only when the store is damaged.
                if confirmed {
                    warn!(txid = %prev_txid, "DB inconsistency: tx not found in tx_addresses");
                }
                let (otx, _, _) = self.cache.transaction(prev_txid).await?;
                if let Some(output) = otx.outputs.get(prev_vout as usize) {
                    vin.value = Some(output.value);
                    if let Ok(desc) = self.chain.addr_desc_from_vout(output) {
                        vin.addresses = self.chain.addresses_from_addr_desc(&desc);
                        vin.addr_desc = Some(desc);
                    }
                }
            }
        }
        Ok(())
    }

    /// Finds the transaction spending `vout` of `txid` by walking the
    /// output address's postings upward from the funding height. The first
    /// verified candidate wins and the walk stops.
    async fn resolve_spending(
        &self,
        vout: &mut TxVout,
        txid: &Txid,
        from_height: Height,
        cancel: &Cancel,
    ) -> Result<(), IndexError> {
        let Some(desc) = vout.addr_desc.clone() else {
            return Ok(());
        };
        let postings = self
            .db
            .address_history(&desc, from_height, Height::new(u32::MAX), cancel)
            .await?;
        for (height, entry) in postings {
            if cancel.is_cancelled() {
                return Err(IndexError::Aborted);
            }
            if entry.vout.is_credit() {
                continue;
            }
            let index = entry.vout.index();
            let Some(candidate) = self.db.tx_addresses(&entry.txid).await? else {
                warn!(txid = %entry.txid, "DB inconsistency: tx not found in tx_addresses");
                continue;
            };
            let amount_matches = candidate
                .inputs
                .get(index as usize)
                .is_some_and(|slot| slot.value == vout.value);
            if !amount_matches {
                continue;
            }
            // The amount filter is probabilistic; the raw vin closes it.
            let (spender, _, _) = match self.cache.transaction(&entry.txid).await {
                Ok(found) => found,
                Err(IndexError::Aborted) => return Err(IndexError::Aborted),
                Err(e) => {
                    warn!(txid = %entry.txid, "spending candidate fetch failed: {e}");
                    continue;
                }
            };
            let verified = spender.inputs.get(index as usize).is_some_and(|vin| {
                vin.prev_txid.as_ref() == Some(txid) && vin.prev_vout == vout.n
            });
            if verified {
                vout.spent_txid = Some(entry.txid);
                vout.spent_height = Some(height);
                vout.spent_index = Some(index);
                return Ok(());
            }
        }
        Ok(())
    }

    // *** Addresses ***

    /// Computes address balances and history.
    ///
    /// Mempool postings are merged ahead of confirmed ones, newest first,
    /// deduplicated; paging covers the confirmed portion and page 1 always
    /// carries every mempool entry.
    pub async fn address(
        &self,
        address: &str,
        page: u32,
        items_per_page: u32,
        option: AddressOption,
        filter: &AddressFilter,
        cancel: &Cancel,
    ) -> Result<AddressInfo, IndexError> {
        let mut page0 = page.saturating_sub(1) as usize;
        let items = items_per_page.max(1) as usize;
        let desc = self
            .chain
            .addr_desc_from_address(address)
            .map_err(|e| IndexError::Invalid(format!("invalid address {address}: {e}")))?;

        let mut info = AddressInfo::default();
        let mut have_index_row = false;
        let mut effective_filter = filter.clone();

        match self.chain.chain_type() {
            ChainType::Account => {
                have_index_row = self
                    .account_address_state(&desc, option, filter, &mut effective_filter, &mut info)
                    .await?;
            }
            ChainType::Utxo => {
                if let Some(ba) = self.db.addr_balance(&desc).await? {
                    have_index_row = true;
                    info.balance = ba.balance;
                    info.total_received = Some(ba.received());
                    info.total_sent = Some(ba.sent);
                    info.tx_count = ba.tx_count;
                }
            }
        }

        // Convert back to the canonical string format where the descriptor
        // maps to exactly one address; reverse lookup is best effort.
        let addresses = self.chain.addresses_from_addr_desc(&desc);
        info.address = match addresses.len() {
            1 => addresses.into_iter().next().expect("length checked"),
            _ => address.to_string(),
        };

        let mut mempool_txids = Vec::new();
        if option >= AddressOption::TxidHistory || !have_index_row {
            mempool_txids =
                unique_txids_reverse(self.mempool_txids(&desc, &effective_filter).await?);
            info.unconfirmed_tx_count = mempool_txids.len() as u32;
            if !have_index_row {
                // Only unconfirmed activity: there is nothing to page.
                page0 = 0;
            }
        }

        if !have_index_row && mempool_txids.is_empty() {
            return Err(IndexError::NotFound(format!("address {address} not found")));
        }

        if option >= AddressOption::TxidHistory {
            let confirmed = unique_txids_reverse(
                self.confirmed_txids(&desc, &effective_filter, cancel).await?,
            );
            let (paging, from, to, new_page) = compute_paging(confirmed.len(), page0, items);
            info.paging = paging;
            page0 = new_page;

            for txid in &mempool_txids {
                match self.transaction(txid, false, cancel).await {
                    Err(IndexError::Aborted) => return Err(IndexError::Aborted),
                    Err(e) => {
                        warn!(%txid, "mempool transaction failed to resolve: {e}");
                        continue;
                    }
                    Ok(tx) => {
                        info.unconfirmed_received += addr_vout_value(&tx, &desc);
                        info.unconfirmed_sent += addr_vin_value(&tx, &desc);
                        if page0 == 0 {
                            if option == AddressOption::TxidHistory {
                                info.txids.push(txid.clone());
                            } else {
                                info.transactions.push(tx);
                            }
                        }
                    }
                }
            }

            for txid in &confirmed[from..to] {
                if option == AddressOption::TxidHistory {
                    info.txids.push(txid.clone());
                } else if option == AddressOption::TxHistoryLight
                    && self.chain.chain_type() == ChainType::Utxo
                {
                    let Some(ta) = self.db.tx_addresses(txid).await? else {
                        warn!(%txid, "DB inconsistency: tx not found in tx_addresses");
                        continue;
                    };
                    let Some(record) = self.db.block_record(ta.height).await? else {
                        warn!(height = %ta.height, "DB inconsistency: block not found in height column");
                        continue;
                    };
                    info.transactions
                        .push(self.tx_from_tx_addresses(txid, &ta, &record));
                } else {
                    info.transactions
                        .push(self.transaction(txid, false, cancel).await?);
                }
            }
        }

        Ok(info)
    }

    /// Account-side state of an address query: backend balance and nonce,
    /// token holdings, contract narrowing. Returns whether the address is
    /// known to the index.
    async fn account_address_state(
        &self,
        desc: &AddrDesc,
        option: AddressOption,
        filter: &AddressFilter,
        effective_filter: &mut AddressFilter,
        info: &mut AddressInfo,
    ) -> Result<bool, IndexError> {
        let Some(ca) = self.db.addr_contracts(desc).await? else {
            return Ok(false);
        };
        info.tx_count = ca.total_tx_count;
        info.balance = self.backend.account_balance(desc).await?;
        info.nonce = Some(self.backend.account_nonce(desc).await?);

        let filter_desc = match &filter.contract {
            Some(contract) => Some(self.chain.addr_desc_from_address(contract).map_err(|e| {
                IndexError::Invalid(format!("invalid contract filter {contract}: {e}"))
            })?),
            None => None,
        };
        if filter_desc.is_some() {
            // Narrow to that contract's postings; a contract the address
            // never touched yields an empty history.
            effective_filter.vout = VoutFilter::Index(u32::MAX);
        }

        for (i, holding) in ca.contracts.iter().enumerate() {
            let contract_index = i as u32 + 1;
            if let Some(fd) = &filter_desc {
                if &holding.contract != fd {
                    continue;
                }
                effective_filter.vout = VoutFilter::Index(contract_index);
            }
            let contract_info = match self.backend.contract_info(&holding.contract).await {
                Ok(ci) => ci,
                Err(e) => {
                    warn!(contract = %holding.contract, "contract info lookup failed: {e}");
                    None
                }
            };
            let contract_info =
                contract_info.unwrap_or_else(|| self.fallback_contract_info(&holding.contract));
            // Token balances are skipped at the Basic tier.
            let balance = if option != AddressOption::Basic {
                match self.backend.contract_balance(desc, &holding.contract).await {
                    Ok(b) => Some(b),
                    Err(e) => {
                        warn!(contract = %holding.contract, "contract balance lookup failed: {e}");
                        None
                    }
                }
            } else {
                None
            };
            info.tokens.push(TokenHolding {
                contract: contract_info.contract,
                name: contract_info.name,
                symbol: contract_info.symbol,
                decimals: contract_info.decimals,
                transfers: holding.tx_count,
                balance,
                contract_index,
            });
        }

        info.contract_info = match self.backend.contract_info(desc).await {
            Ok(ci) => ci,
            Err(BackendError::NotSupported(_)) => None,
            Err(e) => return Err(IndexError::Backend(e)),
        };
        Ok(true)
    }

    /// Reconstructs the unspent outputs of an address, newest first,
    /// mempool outputs ahead of confirmed ones.
    pub async fn address_utxos(
        &self,
        address: &str,
        only_confirmed: bool,
        cancel: &Cancel,
    ) -> Result<Vec<Utxo>, IndexError> {
        let desc = self
            .chain
            .addr_desc_from_address(address)
            .map_err(|e| IndexError::Invalid(format!("invalid address {address}: {e}")))?;

        let mut utxos = Vec::new();
        let mut spent_in_mempool: HashSet<(Txid, u32)> = HashSet::new();

        if !only_confirmed {
            let txm = unique_txids_reverse(
                self.mempool_txids(&desc, &AddressFilter::default()).await?,
            );
            let mut mempool_txs = Vec::with_capacity(txm.len());
            for txid in &txm {
                match self.cache.transaction(txid).await {
                    Err(IndexError::Aborted) => return Err(IndexError::Aborted),
                    Err(e) => {
                        warn!(%txid, "mempool transaction failed to resolve: {e}");
                        continue;
                    }
                    Ok((tx, _, _)) => {
                        for input in &tx.inputs {
                            if let Some(prev) = &input.prev_txid {
                                spent_in_mempool.insert((prev.clone(), input.prev_vout));
                            }
                        }
                        mempool_txs.push(tx);
                    }
                }
            }
            for tx in &mempool_txs {
                for (n, output) in tx.outputs.iter().enumerate() {
                    let Ok(vout_desc) = self.chain.addr_desc_from_vout(output) else {
                        continue;
                    };
                    if vout_desc != desc {
                        continue;
                    }
                    if spent_in_mempool.contains(&(tx.txid.clone(), n as u32)) {
                        continue;
                    }
                    utxos.push(Utxo {
                        txid: tx.txid.clone(),
                        vout: n as u32,
                        value: output.value,
                        height: None,
                        confirmations: 0,
                    });
                }
            }
        }

        let (confirmed, residual) = self.db.confirmed_utxos(&desc, cancel).await?;
        if !residual.is_zero() {
            warn!(addr = %desc, %residual, "DB inconsistency: UTXO checksum is not zero");
        }
        for u in confirmed {
            if spent_in_mempool.contains(&(u.txid.clone(), u.vout)) {
                continue;
            }
            utxos.push(Utxo {
                confirmations: self.confirmations(Some(u.height)),
                txid: u.txid,
                vout: u.vout,
                value: u.value,
                height: Some(u.height),
            });
        }
        Ok(utxos)
    }

    // *** Blocks & system ***

    /// Lists indexed blocks, newest first.
    pub async fn blocks(&self, page: u32, per_page: u32) -> Result<BlocksPage, IndexError> {
        let Some(best) = self.db.state().best_height() else {
            return Ok(BlocksPage::default());
        };
        let page0 = page.saturating_sub(1) as usize;
        let per_page = per_page.max(1) as usize;
        let count = best.as_u32() as usize + 1;
        let (paging, from, to, _) = compute_paging(count, page0, per_page);
        let mut blocks = Vec::with_capacity(to - from);
        for i in from..to {
            let height = best - i as u32;
            // Stores synced from a later start height simply end early.
            let Some(record) = self.db.block_record(height).await? else {
                break;
            };
            blocks.push(summary(height, &record));
        }
        Ok(BlocksPage { paging, blocks })
    }

    /// Returns one block with a page of its transactions. Accepts a height
    /// or a block hash.
    pub async fn block(
        &self,
        id: &str,
        page: u32,
        per_page: u32,
        cancel: &Cancel,
    ) -> Result<BlockPage, IndexError> {
        let hash = match id.parse::<u32>() {
            Ok(h) => match self.db.block_record(Height::new(h)).await? {
                Some(record) => record.hash,
                None => {
                    return Err(IndexError::NotFound(format!("block {id} not found")));
                }
            },
            Err(_) => BlockHash::from_hex(id)
                .map_err(|_| IndexError::Invalid(format!("invalid block id {id}")))?,
        };
        let block = match self.backend.block(&hash).await {
            Ok(block) => block,
            Err(BackendError::NotFound(_)) => {
                return Err(IndexError::NotFound(format!("block {id} not found")));
            }
            Err(e) => return Err(IndexError::Backend(e)),
        };

        let record = self
            .db
            .block_record(block.height)
            .await?
            .unwrap_or(BlockRecord {
                hash: block.hash,
                time: block.time,
                tx_count: block.txs.len() as u32,
                size: block.size,
            });

        let page0 = page.saturating_sub(1) as usize;
        let per_page = per_page.max(1) as usize;
        let (paging, from, to, _) = compute_paging(block.txs.len(), page0, per_page);
        let mut transactions = Vec::with_capacity(to - from);
        for tx in &block.txs[from..to] {
            if cancel.is_cancelled() {
                return Err(IndexError::Aborted);
            }
            match self.chain.chain_type() {
                ChainType::Utxo => {
                    let Some(ta) = self.db.tx_addresses(&tx.txid).await? else {
                        warn!(txid = %tx.txid, "DB inconsistency: tx not found in tx_addresses");
                        continue;
                    };
                    transactions.push(self.tx_from_tx_addresses(&tx.txid, &ta, &record));
                }
                ChainType::Account => {
                    transactions.push(self.transaction(&tx.txid, false, cancel).await?);
                }
            }
        }
        Ok(BlockPage {
            paging,
            summary: summary(block.height, &record),
            transactions,
        })
    }

    /// Engine status: identity, sync progress, store size, cache counters.
    pub async fn system_info(&self) -> Result<SystemInfo, IndexError> {
        let state = self.db.state();
        let best = self.db.best_block().await?;
        Ok(SystemInfo {
            coin: state.coin().to_string(),
            chain_type: state.chain_type().to_string(),
            best_height: best.as_ref().map(|(h, _)| *h),
            best_hash: best.map(|(_, rec)| rec.hash),
            decimals: state.decimals(),
            db_size: self.db.database_size(),
            tx_cache_hits: state.cache_hits(),
            tx_cache_misses: state.cache_misses(),
        })
    }

    // *** helpers ***

    /// A transaction summary served purely from the index, without the
    /// backend round trip of a full resolution.
    fn tx_from_tx_addresses(
        &self,
        txid: &Txid,
        ta: &TxAddressesRow,
        record: &BlockRecord,
    ) -> TxDetails {
        let mut value_in = Amount::zero();
        let vin = ta
            .inputs
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                value_in += slot.value;
                TxVin {
                    n: i as u32,
                    value: Some(slot.value),
                    addresses: self.chain.addresses_from_addr_desc(&slot.addr_desc),
                    addr_desc: Some(slot.addr_desc.clone()),
                    ..TxVin::default()
                }
            })
            .collect();
        let mut value_out = Amount::zero();
        let vout = ta
            .outputs
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                value_out += slot.value;
                TxVout {
                    n: i as u32,
                    value: slot.value,
                    addresses: self.chain.addresses_from_addr_desc(&slot.addr_desc),
                    addr_desc: Some(slot.addr_desc.clone()),
                    spent: slot.spent,
                    ..TxVout::default()
                }
            })
            .collect();
        TxDetails {
            txid: txid.clone(),
            block_hash: Some(record.hash),
            block_height: Some(ta.height),
            block_time: record.time,
            confirmations: self.confirmations(Some(ta.height)),
            fees: value_in.saturating_sub(&value_out),
            value_in: Some(value_in),
            value_out,
            vin,
            vout,
            token_transfers: Vec::new(),
        }
    }

    async fn confirmed_txids(
        &self,
        desc: &AddrDesc,
        filter: &AddressFilter,
        cancel: &Cancel,
    ) -> Result<Vec<Txid>, IndexError> {
        let from = filter.from_height.unwrap_or(Height::new(0));
        let to = filter.to_height.unwrap_or(Height::new(u32::MAX));
        let postings = self.db.address_history(desc, from, to, cancel).await?;
        Ok(postings
            .into_iter()
            .filter(|(_, e)| filter.accepts(e.vout.index(), e.vout.is_credit()))
            .map(|(_, e)| e.txid)
            .collect())
    }

    async fn mempool_txids(
        &self,
        desc: &AddrDesc,
        filter: &AddressFilter,
    ) -> Result<Vec<Txid>, IndexError> {
        let entries = self.backend.mempool_entries(desc).await?;
        Ok(entries
            .into_iter()
            .filter(|e| filter.accepts(e.vout.index(), e.vout.is_credit()))
            .map(|e| e.txid)
            .collect())
    }

    fn confirmations(&self, height: Option<Height>) -> u32 {
        match (height, self.db.state().best_height()) {
            (Some(h), Some(best)) if best >= h => best.as_u32() - h.as_u32() + 1,
            _ => 0,
        }
    }

    fn first_address(&self, desc: &AddrDesc) -> String {
        self.chain
            .addresses_from_addr_desc(desc)
            .into_iter()
            .next()
            .unwrap_or_else(|| desc.to_string())
    }

    fn fallback_contract_info(&self, contract: &AddrDesc) -> ContractInfo {
        let name = self.first_address(contract);
        ContractInfo {
            contract: name.clone(),
            name,
            ..ContractInfo::default()
        }
    }
}

fn summary(height: Height, record: &BlockRecord) -> BlockSummary {
    BlockSummary {
        height,
        hash: record.hash,
        time: record.time,
        tx_count: record.tx_count,
        size: record.size,
    }
}

fn addr_vout_value(tx: &TxDetails, desc: &AddrDesc) -> Amount {
    let mut sum = Amount::zero();
    for vout in &tx.vout {
        if vout.addr_desc.as_ref() == Some(desc) {
            sum += vout.value;
        }
    }
    sum
}

fn addr_vin_value(tx: &TxDetails, desc: &AddrDesc) -> Amount {
    let mut sum = Amount::zero();
    for vin in &tx.vin {
        if vin.addr_desc.as_ref() == Some(desc) {
            if let Some(v) = vin.value {
                sum += v;
            }
        }
    }
    sum
}

/// Removes duplicate txids preserving newest-first order.
fn unique_txids_reverse(txids: Vec<Txid>) -> Vec<Txid> {
    let mut seen: HashSet<Txid> = HashSet::with_capacity(txids.len());
    let mut out = Vec::with_capacity(txids.len());
    for txid in txids.into_iter().rev() {
        if seen.insert(txid.clone()) {
            out.push(txid);
        }
    }
    out
}

/// Maps a 0-based page request onto `count` items, clamping past-the-end
/// requests to the last page. Returns the paging descriptor, the item
/// range, and the effective 0-based page.
fn compute_paging(count: usize, page: usize, items: usize) -> (Paging, usize, usize, usize) {
    let total_pages = if count == 0 { 0 } else { (count - 1) / items };
    let page = if page * items >= count {
        total_pages
    } else {
        page
    };
    let from = page * items;
    let to = ((page + 1) * items).min(count);
    (
        Paging {
            page: page as u32 + 1,
            total_pages: total_pages as u32 + 1,
            items_on_page: items as u32,
        },
        from,
        to,
        page,
    )
}
