//! Caller-visible result types of the query layer.

use crate::chain::ContractInfo;
use crate::types::{AddrDesc, Amount, BlockHash, Height, Txid};

/// Paging descriptor. Pages are 1-based on the wire; an out-of-range page
/// clamps to the last one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Paging {
    /// The page actually served, 1-based.
    pub page: u32,
    /// Total number of pages.
    pub total_pages: u32,
    /// Requested page size.
    pub items_on_page: u32,
}

/// What an address query is asked to compute, in monotonically growing
/// cost. Implementations must not compute fields a lower tier does not
/// require.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddressOption {
    /// Identity and counters only.
    Basic,
    /// Adds balances.
    Balance,
    /// Adds the paged txid history.
    TxidHistory,
    /// Adds transaction summaries served purely from the index.
    TxHistoryLight,
    /// Adds fully resolved transactions.
    TxHistory,
}

/// Which posting side an address history query wants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VoutFilter {
    /// Both sides.
    #[default]
    Off,
    /// Spending (input) postings only.
    Inputs,
    /// Crediting (output) postings only.
    Outputs,
    /// Postings whose decoded index equals the given value, either side.
    Index(u32),
}

/// Narrowing of an address history query.
#[derive(Clone, Debug, Default)]
pub struct AddressFilter {
    /// Lowest height included; `None` means from genesis.
    pub from_height: Option<Height>,
    /// Highest height included; `None` means up to the tip.
    pub to_height: Option<Height>,
    /// Posting side selection.
    pub vout: VoutFilter,
    /// Account chains: restrict to transfers of one contract.
    pub contract: Option<String>,
}

impl AddressFilter {
    pub(crate) fn accepts(&self, index: u32, is_output: bool) -> bool {
        match self.vout {
            VoutFilter::Off => true,
            VoutFilter::Inputs => !is_output,
            VoutFilter::Outputs => is_output,
            VoutFilter::Index(want) => index == want,
        }
    }
}

/// One resolved transaction input.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxVin {
    /// Input position.
    pub n: u32,
    /// Referenced transaction; `None` for coinbase inputs.
    pub txid: Option<Txid>,
    /// Referenced output index.
    pub vout: u32,
    /// Descriptor of the funding address, when resolved.
    pub addr_desc: Option<AddrDesc>,
    /// Address strings of the funding address, best effort.
    pub addresses: Vec<String>,
    /// Value the input moved, when resolved.
    pub value: Option<Amount>,
}

/// One resolved transaction output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxVout {
    /// Output position.
    pub n: u32,
    /// Output value.
    pub value: Amount,
    /// Descriptor of the credited address, when resolvable.
    pub addr_desc: Option<AddrDesc>,
    /// Address strings, best effort.
    pub addresses: Vec<String>,
    /// Whether a confirmed transaction already spent this output.
    pub spent: bool,
    /// The spending transaction, if resolution was requested and found it.
    pub spent_txid: Option<Txid>,
    /// Height of the spending transaction.
    pub spent_height: Option<Height>,
    /// Input position within the spending transaction.
    pub spent_index: Option<u32>,
}

/// A token transfer with resolved contract metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenTransferView {
    /// Contract address string.
    pub contract: String,
    /// Sender address string.
    pub from: String,
    /// Recipient address string.
    pub to: String,
    /// Transferred token amount.
    pub value: Amount,
    /// Token name.
    pub name: String,
    /// Token symbol.
    pub symbol: String,
    /// Token decimals.
    pub decimals: u32,
}

/// A fully resolved transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxDetails {
    /// Transaction id.
    pub txid: Txid,
    /// Containing block hash, confirmed transactions only.
    pub block_hash: Option<BlockHash>,
    /// Containing block height, confirmed transactions only.
    pub block_height: Option<Height>,
    /// Containing block time.
    pub block_time: u32,
    /// Number of confirmations; zero for mempool transactions.
    pub confirmations: u32,
    /// Sum of input values, `None` where inputs are not resolvable.
    pub value_in: Option<Amount>,
    /// Sum of output values.
    pub value_out: Amount,
    /// Fee paid; zero for coinbase transactions.
    pub fees: Amount,
    /// Resolved inputs.
    pub vin: Vec<TxVin>,
    /// Resolved outputs.
    pub vout: Vec<TxVout>,
    /// Token transfers, account chains only.
    pub token_transfers: Vec<TokenTransferView>,
}

/// Per-contract token position of an address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenHolding {
    /// Contract address string.
    pub contract: String,
    /// Token name.
    pub name: String,
    /// Token symbol.
    pub symbol: String,
    /// Token decimals.
    pub decimals: u32,
    /// Number of transfers of this token the address took part in.
    pub transfers: u32,
    /// Current token balance; omitted for the `Basic` option tier.
    pub balance: Option<Amount>,
    /// 1-based position of the contract in the address's contract list;
    /// usable as an index filter.
    pub contract_index: u32,
}

/// The result of an address query. Which fields are populated depends on
/// the requested [`AddressOption`] tier.
#[derive(Clone, Debug, Default)]
pub struct AddressInfo {
    /// The address in the chain's string format.
    pub address: String,
    /// Paging of the confirmed history.
    pub paging: Paging,
    /// Confirmed balance.
    pub balance: Amount,
    /// Total received (UTXO chains).
    pub total_received: Option<Amount>,
    /// Total sent (UTXO chains).
    pub total_sent: Option<Amount>,
    /// Number of confirmed transactions the address appeared in.
    pub tx_count: u32,
    /// Value credited by mempool transactions.
    pub unconfirmed_received: Amount,
    /// Value debited by mempool transactions.
    pub unconfirmed_sent: Amount,
    /// Number of distinct mempool transactions touching the address.
    pub unconfirmed_tx_count: u32,
    /// Txid history page (`TxidHistory` tier).
    pub txids: Vec<Txid>,
    /// Transaction history page (`TxHistoryLight` and `TxHistory` tiers).
    pub transactions: Vec<TxDetails>,
    /// Token holdings (account chains).
    pub tokens: Vec<TokenHolding>,
    /// Contract metadata when the address itself is a contract.
    pub contract_info: Option<ContractInfo>,
    /// Account nonce (account chains).
    pub nonce: Option<u64>,
}

/// One unspent output of an address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    /// Funding transaction.
    pub txid: Txid,
    /// Output index.
    pub vout: u32,
    /// Output value.
    pub value: Amount,
    /// Height the output confirmed at; `None` for mempool outputs.
    pub height: Option<Height>,
    /// Number of confirmations; zero for mempool outputs.
    pub confirmations: u32,
}

/// Identity and shape of one block, served from the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockSummary {
    /// Block height.
    pub height: Height,
    /// Block hash.
    pub hash: BlockHash,
    /// Block time.
    pub time: u32,
    /// Number of transactions.
    pub tx_count: u32,
    /// Serialized size in bytes.
    pub size: u32,
}

/// One page of the block list, newest first.
#[derive(Clone, Debug, Default)]
pub struct BlocksPage {
    /// Paging descriptor.
    pub paging: Paging,
    /// Block summaries on this page.
    pub blocks: Vec<BlockSummary>,
}

/// One page of a single block's transactions.
#[derive(Clone, Debug)]
pub struct BlockPage {
    /// Paging descriptor.
    pub paging: Paging,
    /// The block itself.
    pub summary: BlockSummary,
    /// Transactions on this page.
    pub transactions: Vec<TxDetails>,
}

/// Engine-level status served to operators.
#[derive(Clone, Debug)]
pub struct SystemInfo {
    /// Coin identifier.
    pub coin: String,
    /// Chain family, as a string.
    pub chain_type: String,
    /// Best indexed height.
    pub best_height: Option<Height>,
    /// Best indexed hash.
    pub best_hash: Option<BlockHash>,
    /// Decimals of the base unit.
    pub decimals: u32,
    /// Store size on disk, bytes.
    pub db_size: u64,
    /// Transaction cache hits since start.
    pub tx_cache_hits: u64,
    /// Transaction cache misses since start.
    pub tx_cache_misses: u64,
}
