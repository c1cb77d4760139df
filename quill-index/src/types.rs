//! Core identifier and column row types used by the index engine.
//!
//! Held here to ensure serialisation consistency across the write and read
//! paths: every column value grammar is implemented exactly once, on the row
//! type it belongs to.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use std::io::{self, Read, Write};
use hex::{FromHex, FromHexError, ToHex};
use primitive_types::U256;

use crate::encoding::{
    read_amount, read_bytes, read_fixed, read_u32_be, read_varint, read_varuint, read_varuint_t,
    read_vec, write_amount, write_bytes, write_fixed, write_u32_be, write_varint, write_varuint,
    write_vec,
};

// *** Key Objects ***

/// Block height.
///
/// NOTE: Encoded as a 4-byte big-endian byte string so that key order in the
/// lexicographically sorted store equals chronological order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct Height(u32);

impl Height {
    /// Encoded width of a height key.
    pub const KEY_LEN: usize = 4;

    /// Constructs a new height.
    pub fn new(h: u32) -> Self {
        Self(h)
    }

    /// Returns the raw height value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the big-endian key bytes of this height.
    pub fn to_key(&self) -> [u8; Self::KEY_LEN] {
        self.0.to_be_bytes()
    }

    /// Parses a height from its big-endian key bytes.
    pub fn from_key(bytes: &[u8]) -> io::Result<Self> {
        let arr: [u8; Self::KEY_LEN] = bytes
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "height key must be 4 bytes"))?;
        Ok(Self(u32::from_be_bytes(arr)))
    }
}

impl std::ops::Add<u32> for Height {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        Height(self.0 + rhs)
    }
}

impl std::ops::Sub<u32> for Height {
    type Output = Self;

    fn sub(self, rhs: u32) -> Self::Output {
        Height(self.0 - rhs)
    }
}

impl From<u32> for Height {
    fn from(h: u32) -> Self {
        Height(h)
    }
}

impl From<Height> for u32 {
    fn from(h: Height) -> Self {
        h.0
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    /// Borrow the inner bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for BlockHash {
    fn from(bytes: [u8; 32]) -> Self {
        BlockHash(bytes)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.encode_hex::<String>())
    }
}

impl FromHex for BlockHash {
    type Error = FromHexError;

    fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, Self::Error> {
        Ok(Self(<[u8; 32]>::from_hex(hex)?))
    }
}

/// Transaction identifier.
///
/// Opaque byte string; its width is fixed per chain model and the engine
/// never interprets the contents.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct Txid(Vec<u8>);

impl Txid {
    /// Borrow the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the byte width of this txid.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for a zero-length txid.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Txid {
    fn from(bytes: Vec<u8>) -> Self {
        Txid(bytes)
    }
}

impl From<&[u8]> for Txid {
    fn from(bytes: &[u8]) -> Self {
        Txid(bytes.to_vec())
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.encode_hex::<String>())
    }
}

impl fmt::Debug for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txid({})", self)
    }
}

impl FromHex for Txid {
    type Error = FromHexError;

    fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, Self::Error> {
        Ok(Self(Vec::<u8>::from_hex(hex)?))
    }
}

/// Address descriptor: the opaque byte identifier of a spendable entity.
///
/// For UTXO chains this is derived from the output script, for account
/// chains from the account address. Two scripts with the same spendability
/// share a descriptor. A zero-length descriptor marks an output whose
/// script the chain model could not resolve; such outputs keep their vout
/// slot but produce no postings and no balance updates.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct AddrDesc(Vec<u8>);

impl AddrDesc {
    /// Constructs an empty (unresolvable) descriptor.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Borrow the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns true for the empty descriptor.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for AddrDesc {
    fn from(bytes: Vec<u8>) -> Self {
        AddrDesc(bytes)
    }
}

impl From<&[u8]> for AddrDesc {
    fn from(bytes: &[u8]) -> Self {
        AddrDesc(bytes.to_vec())
    }
}

impl fmt::Display for AddrDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.encode_hex::<String>())
    }
}

impl fmt::Debug for AddrDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddrDesc({})", self)
    }
}

impl FromHex for AddrDesc {
    type Error = FromHexError;

    fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, Self::Error> {
        Ok(Self(Vec::<u8>::from_hex(hex)?))
    }
}

/// Non-negative arbitrary precision amount (satoshi or wei).
///
/// Backed by a 256-bit unsigned integer, which covers both chain families.
/// Stored on disk as a length-prefixed big-endian magnitude with no leading
/// zero bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct Amount(U256);

impl Amount {
    /// The zero amount.
    pub fn zero() -> Self {
        Self(U256::zero())
    }

    /// Returns true if the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Constructs an amount from a u64.
    pub fn from_u64(v: u64) -> Self {
        Self(U256::from(v))
    }

    /// Constructs an amount from big-endian magnitude bytes.
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        Self(U256::from_big_endian(bytes))
    }

    /// Returns the big-endian magnitude with leading zero bytes stripped.
    /// Zero yields an empty vector.
    pub fn to_be_bytes_trimmed(&self) -> Vec<u8> {
        let full = self.0.to_big_endian();
        let first = full.iter().position(|&b| b != 0).unwrap_or(full.len());
        full[first..].to_vec()
    }

    /// Checked addition.
    pub fn checked_add(&self, other: &Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    /// Checked subtraction; `None` on underflow.
    pub fn checked_sub(&self, other: &Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    /// Saturating subtraction.
    pub fn saturating_sub(&self, other: &Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// *** Address history postings ***

/// Side-and-index of a posting, stored as a zig-zag varint.
///
/// A credit of output `N` encodes as `+N`. A debit referencing previous
/// output (or contract position) `K` encodes as `-(K + 1)`, so that index 0
/// remains representable on both sides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct SignedVout(i32);

impl SignedVout {
    /// A credit posting for output index `n`.
    pub fn credit(n: u32) -> Self {
        Self(n as i32)
    }

    /// A debit posting referencing previous output index `k`.
    pub fn debit(k: u32) -> Self {
        Self(-(k as i32) - 1)
    }

    /// Returns true for credit (output side) postings.
    pub fn is_credit(&self) -> bool {
        self.0 >= 0
    }

    /// Returns the referenced index regardless of side.
    pub fn index(&self) -> u32 {
        if self.0 >= 0 {
            self.0 as u32
        } else {
            (-self.0 - 1) as u32
        }
    }

    /// Returns the raw signed value.
    pub fn raw(&self) -> i32 {
        self.0
    }
}

/// One entry of an `addresses` column row: a transaction that touched the
/// address at the row's height, with the side encoded in the vout sign.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct HistoryEntry {
    /// Transaction that produced the posting.
    pub txid: Txid,
    /// Signed output index.
    pub vout: SignedVout,
}

impl HistoryEntry {
    /// Builds the key of an `addresses` row: `addrDesc ‖ 4-byte BE height`.
    pub fn row_key(desc: &AddrDesc, height: Height) -> Vec<u8> {
        let mut key = Vec::with_capacity(desc.as_bytes().len() + Height::KEY_LEN);
        key.extend_from_slice(desc.as_bytes());
        key.extend_from_slice(&height.to_key());
        key
    }

    /// Packs a slice of postings into one row value.
    pub fn pack_row(entries: &[HistoryEntry]) -> Vec<u8> {
        let mut buf = Vec::new();
        for e in entries {
            buf.extend_from_slice(e.txid.as_bytes());
            write_varint(&mut buf, e.vout.0 as i64).expect("write to Vec cannot fail");
        }
        buf
    }

    /// Unpacks a row value. The txid width is a property of the chain model.
    pub fn unpack_row(mut data: &[u8], txid_len: usize) -> io::Result<Vec<HistoryEntry>> {
        let mut entries = Vec::new();
        while !data.is_empty() {
            let mut txid = vec![0u8; txid_len];
            data.read_exact(&mut txid)?;
            let vout = read_varint(&mut data)?;
            let vout = i32::try_from(vout)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "vout out of range"))?;
            entries.push(HistoryEntry {
                txid: Txid(txid),
                vout: SignedVout(vout),
            });
        }
        Ok(entries)
    }
}

// *** Column rows ***

/// Value of the `height` column: identity and shape of one indexed block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct BlockRecord {
    /// Block hash.
    pub hash: BlockHash,
    /// Block time, seconds since epoch.
    pub time: u32,
    /// Number of transactions in the block.
    pub tx_count: u32,
    /// Serialized block size in bytes.
    pub size: u32,
}

impl BlockRecord {
    /// Packs the record: `hash ‖ time(4B BE) ‖ varuint(txCount) ‖ varuint(size)`.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(40);
        write_fixed(&mut buf, self.hash.as_bytes()).expect("write to Vec cannot fail");
        write_u32_be(&mut buf, self.time).expect("write to Vec cannot fail");
        write_varuint(&mut buf, self.tx_count as u64).expect("write to Vec cannot fail");
        write_varuint(&mut buf, self.size as u64).expect("write to Vec cannot fail");
        buf
    }

    /// Unpacks a record.
    pub fn unpack(mut data: &[u8]) -> io::Result<Self> {
        let hash = BlockHash(read_fixed::<32, _>(&mut data)?);
        let time = read_u32_be(&mut data)?;
        let tx_count: u32 = read_varuint_t(&mut data)?;
        let size: u32 = read_varuint_t(&mut data)?;
        Ok(Self {
            hash,
            time,
            tx_count,
            size,
        })
    }
}

/// One input slot of a `tx_addresses` row.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct TxAddrInput {
    /// Descriptor of the address the input spent from.
    pub addr_desc: AddrDesc,
    /// Value moved by the input.
    pub value: Amount,
}

/// One output slot of a `tx_addresses` row.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct TxAddrOutput {
    /// Descriptor of the credited address; empty for unresolvable scripts.
    pub addr_desc: AddrDesc,
    /// Value of the output.
    pub value: Amount,
    /// Set once a later confirmed transaction spends this output.
    pub spent: bool,
}

/// Value of the `tx_addresses` column (UTXO chains): the address and value
/// of every input and output of one confirmed transaction, with a spent bit
/// per output.
///
/// This is the record that lets a vin recover the address and value it
/// spent, and the engine know whether an output is still unspent.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct TxAddressesRow {
    /// Height the transaction was mined at.
    pub height: Height,
    /// Input slots, one per vin, in position order.
    pub inputs: Vec<TxAddrInput>,
    /// Output slots, one per vout, in position order.
    pub outputs: Vec<TxAddrOutput>,
}

impl TxAddressesRow {
    /// Packs the row. The spent flag is folded into the low bit of each
    /// output's descriptor length.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varuint(&mut buf, self.height.as_u32() as u64).expect("write to Vec cannot fail");
        write_vec(&mut buf, &self.inputs, |w, i| {
            write_bytes(&mut *w, i.addr_desc.as_bytes())?;
            write_amount(w, &i.value)
        })
        .expect("write to Vec cannot fail");
        write_vec(&mut buf, &self.outputs, |w, o| {
            let folded = ((o.addr_desc.as_bytes().len() as u64) << 1) | (o.spent as u64);
            write_varuint(&mut *w, folded)?;
            w.write_all(o.addr_desc.as_bytes())?;
            write_amount(w, &o.value)
        })
        .expect("write to Vec cannot fail");
        buf
    }

    /// Unpacks a row.
    pub fn unpack(mut data: &[u8]) -> io::Result<Self> {
        let height = Height(read_varuint_t(&mut data)?);
        let inputs = read_vec(&mut data, |r| {
            let addr_desc = AddrDesc(read_bytes(&mut *r)?);
            let value = read_amount(r)?;
            Ok(TxAddrInput { addr_desc, value })
        })?;
        let outputs = read_vec(&mut data, |r| {
            let folded = read_varuint(&mut *r)?;
            let spent = folded & 1 == 1;
            let len = (folded >> 1) as usize;
            let mut desc = vec![0u8; len];
            r.read_exact(&mut desc)?;
            let value = read_amount(r)?;
            Ok(TxAddrOutput {
                addr_desc: AddrDesc(desc),
                value,
                spent,
            })
        })?;
        Ok(Self {
            height,
            inputs,
            outputs,
        })
    }
}

/// Value of the `addr_balance` column (UTXO chains).
///
/// `received` is derived as `sent + balance` and never stored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct AddrBalanceRow {
    /// Number of transactions the address appeared in.
    pub tx_count: u32,
    /// Total amount ever debited from the address.
    pub sent: Amount,
    /// Current confirmed balance.
    pub balance: Amount,
}

impl AddrBalanceRow {
    /// Derived total received amount.
    pub fn received(&self) -> Amount {
        self.sent + self.balance
    }

    /// Returns true once the row carries no information and can be dropped
    /// on disconnect.
    pub fn is_void(&self) -> bool {
        self.tx_count == 0 && self.sent.is_zero() && self.balance.is_zero()
    }

    /// Packs the row: `varuint(txCount) ‖ amount(sent) ‖ amount(balance)`.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varuint(&mut buf, self.tx_count as u64).expect("write to Vec cannot fail");
        write_amount(&mut buf, &self.sent).expect("write to Vec cannot fail");
        write_amount(&mut buf, &self.balance).expect("write to Vec cannot fail");
        buf
    }

    /// Unpacks a row.
    pub fn unpack(mut data: &[u8]) -> io::Result<Self> {
        let tx_count: u32 = read_varuint_t(&mut data)?;
        let sent = read_amount(&mut data)?;
        let balance = read_amount(&mut data)?;
        Ok(Self {
            tx_count,
            sent,
            balance,
        })
    }
}

/// Per-contract transfer counter inside an `addr_contracts` row.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct ContractCount {
    /// Contract descriptor.
    pub contract: AddrDesc,
    /// Number of token transfers of this contract the address took part in.
    pub tx_count: u32,
}

/// Value of the `addr_contracts` column (account chains): the native
/// transfer count of an address plus one counter per token contract it
/// interacted with.
///
/// The 1-based position of a contract in the list doubles as the signed
/// vout value of that address's token transfer postings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct AddrContractsRow {
    /// Number of native transfers the address took part in.
    pub total_tx_count: u32,
    /// Per-contract counters, in first-seen order.
    pub contracts: Vec<ContractCount>,
}

impl AddrContractsRow {
    /// Returns the 1-based position of `contract`, appending a zero counter
    /// if the contract was not seen before.
    pub fn contract_index(&mut self, contract: &AddrDesc) -> u32 {
        if let Some(pos) = self.contracts.iter().position(|c| &c.contract == contract) {
            return pos as u32 + 1;
        }
        self.contracts.push(ContractCount {
            contract: contract.clone(),
            tx_count: 0,
        });
        self.contracts.len() as u32
    }

    /// Looks up the 1-based position of `contract` without inserting.
    pub fn find_contract(&self, contract: &AddrDesc) -> Option<u32> {
        self.contracts
            .iter()
            .position(|c| &c.contract == contract)
            .map(|p| p as u32 + 1)
    }

    /// Returns true once the row carries no information and can be dropped
    /// on disconnect.
    pub fn is_void(&self) -> bool {
        self.total_tx_count == 0 && self.contracts.is_empty()
    }

    /// Packs the row: `varuint(total) ‖ repeated (bytes(contract) ‖ varuint(count))`.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varuint(&mut buf, self.total_tx_count as u64).expect("write to Vec cannot fail");
        for c in &self.contracts {
            write_bytes(&mut buf, c.contract.as_bytes()).expect("write to Vec cannot fail");
            write_varuint(&mut buf, c.tx_count as u64).expect("write to Vec cannot fail");
        }
        buf
    }

    /// Unpacks a row.
    pub fn unpack(mut data: &[u8]) -> io::Result<Self> {
        let total_tx_count: u32 = read_varuint_t(&mut data)?;
        let mut contracts = Vec::new();
        while !data.is_empty() {
            let contract = AddrDesc(read_bytes(&mut data)?);
            let tx_count: u32 = read_varuint_t(&mut data)?;
            contracts.push(ContractCount { contract, tx_count });
        }
        Ok(Self {
            total_tx_count,
            contracts,
        })
    }
}

// *** Undo log rows ***

/// Undo record for one input of a UTXO transaction: everything needed to
/// re-mark the referenced output unspent and delete the debit posting.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct UndoInput {
    /// Descriptor of the previous output's address.
    pub addr_desc: AddrDesc,
    /// Transaction the spent output belongs to.
    pub prev_txid: Txid,
    /// Output index within that transaction.
    pub prev_vout: u32,
}

/// Undo record for one UTXO transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct TxUndo {
    /// Transaction id.
    pub txid: Txid,
    /// One entry per non-coinbase vin, in position order.
    pub inputs: Vec<UndoInput>,
}

/// Undo record for one account-chain transaction: base transfer endpoints
/// plus one (address, contract) pair per token transfer side.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct AccountTxUndo {
    /// Transaction id.
    pub txid: Txid,
    /// Sender descriptor; empty when unresolvable.
    pub from: AddrDesc,
    /// Recipient descriptor; empty for contract creation.
    pub to: AddrDesc,
    /// `(address, contract)` per transfer side, sender first, in transfer
    /// order.
    pub touches: Vec<(AddrDesc, AddrDesc)>,
}

/// Value of the `block_txs` column: the undo log of one block.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub enum BlockUndo {
    /// UTXO-chain undo log.
    Utxo(Vec<TxUndo>),
    /// Account-chain undo log.
    Account(Vec<AccountTxUndo>),
}

impl BlockUndo {
    /// Packs the undo log of one block.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            BlockUndo::Utxo(txs) => {
                for tx in txs {
                    buf.extend_from_slice(tx.txid.as_bytes());
                    write_vec(&mut buf, &tx.inputs, |w, i| {
                        write_bytes(&mut *w, i.addr_desc.as_bytes())?;
                        w.write_all(i.prev_txid.as_bytes())?;
                        write_varint(w, -(i.prev_vout as i64) - 1)
                    })
                    .expect("write to Vec cannot fail");
                }
            }
            BlockUndo::Account(txs) => {
                for tx in txs {
                    buf.extend_from_slice(tx.txid.as_bytes());
                    write_bytes(&mut buf, tx.from.as_bytes()).expect("write to Vec cannot fail");
                    write_bytes(&mut buf, tx.to.as_bytes()).expect("write to Vec cannot fail");
                    write_vec(&mut buf, &tx.touches, |w, (addr, contract)| {
                        write_bytes(&mut *w, addr.as_bytes())?;
                        write_bytes(w, contract.as_bytes())
                    })
                    .expect("write to Vec cannot fail");
                }
            }
        }
        buf
    }

    /// Unpacks a UTXO undo log. The txid width is a property of the chain model.
    pub fn unpack_utxo(mut data: &[u8], txid_len: usize) -> io::Result<Vec<TxUndo>> {
        let mut txs = Vec::new();
        while !data.is_empty() {
            let mut txid = vec![0u8; txid_len];
            data.read_exact(&mut txid)?;
            let inputs = read_vec(&mut data, |r| {
                let addr_desc = AddrDesc(read_bytes(&mut *r)?);
                let mut prev_txid = vec![0u8; txid_len];
                r.read_exact(&mut prev_txid)?;
                let signed = read_varint(r)?;
                if signed >= 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "undo input vout must be a debit",
                    ));
                }
                Ok(UndoInput {
                    addr_desc,
                    prev_txid: Txid(prev_txid),
                    prev_vout: (-signed - 1) as u32,
                })
            })?;
            txs.push(TxUndo {
                txid: Txid(txid),
                inputs,
            });
        }
        Ok(txs)
    }

    /// Unpacks an account-chain undo log.
    pub fn unpack_account(mut data: &[u8], txid_len: usize) -> io::Result<Vec<AccountTxUndo>> {
        let mut txs = Vec::new();
        while !data.is_empty() {
            let mut txid = vec![0u8; txid_len];
            data.read_exact(&mut txid)?;
            let from = AddrDesc(read_bytes(&mut data)?);
            let to = AddrDesc(read_bytes(&mut data)?);
            let touches = read_vec(&mut data, |r| {
                let addr = AddrDesc(read_bytes(&mut *r)?);
                let contract = AddrDesc(read_bytes(r)?);
                Ok((addr, contract))
            })?;
            txs.push(AccountTxUndo {
                txid: Txid(txid),
                from,
                to,
                touches,
            });
        }
        Ok(txs)
    }
}

// *** Mempool interface values ***

/// One mempool posting for an address, as served by the backend: a positive
/// vout marks an output crediting the address, a complemented vout an input
/// spending from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MempoolEntry {
    /// Transaction id.
    pub txid: Txid,
    /// Signed output index, same convention as confirmed postings.
    pub vout: SignedVout,
}

// *** Cancellation ***

/// Cheap cloneable cancellation flag for read operations.
///
/// Scans test the flag at iterator-step boundaries and abort with
/// [`IndexError::Aborted`](crate::error::IndexError::Aborted). Writes ignore
/// it: a batch commit either completes or fails atomically.
#[derive(Clone, Debug, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    /// Creates a fresh, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
