//! Quill's index engine.
//!
//! A multi-currency blockchain indexer core: it maintains a persistent,
//! queryable secondary index derived from the canonical state of a backend
//! node, for both UTXO-model and account-model chains. Compact on-disk
//! columns answer in sub-linear time which transactions touched an address,
//! what an address's confirmed balance and UTXO set are, and which address
//! and value funded a given transaction input.
//!
//! The engine does not validate blocks, verify signatures or decide chain
//! reorganisations; it follows the backend through a block-connect /
//! block-disconnect protocol that keeps every column consistent, including
//! across reorgs.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod chain;
pub mod db;
pub mod encoding;
pub mod error;
pub mod query;
pub mod txcache;
pub mod types;

#[cfg(test)]
mod tests;

pub use backend::{BackendError, BlockSource};
pub use chain::{
    Block, ChainError, ChainModel, ChainType, ContractInfo, TokenTransfer, Tx, TxInput, TxOutput,
};
pub use db::{ConfirmedUtxo, IndexDb, InternalState, SCHEMA_VERSION};
pub use error::IndexError;
pub use query::types::{
    AddressFilter, AddressInfo, AddressOption, BlockPage, BlockSummary, BlocksPage, Paging,
    SystemInfo, TokenHolding, TokenTransferView, TxDetails, TxVin, TxVout, Utxo, VoutFilter,
};
pub use query::Query;
pub use txcache::TxCache;
pub use types::{
    AccountTxUndo, AddrBalanceRow, AddrContractsRow, AddrDesc, Amount, BlockHash, BlockRecord,
    BlockUndo, Cancel, ContractCount, Height, HistoryEntry, MempoolEntry, SignedVout, TxAddrInput,
    TxAddrOutput, TxAddressesRow, TxUndo, Txid, UndoInput,
};
