//! Chain model abstraction.
//!
//! One engine serves both UTXO-model and account-model chains. Everything
//! coin specific — block parsing, descriptor derivation, transaction
//! packing — sits behind [`ChainModel`]; the engine treats descriptors as
//! opaque byte strings and never assumes an address string format.

use std::io::{self, Read};

use crate::encoding::{
    read_amount, read_bytes, read_u32_be, read_varuint_t, read_vec, write_amount, write_bytes,
    write_u32_be, write_varuint, write_vec,
};
use crate::types::{AddrDesc, Amount, BlockHash, Height, Txid};

/// The two chain families the engine understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    /// Bitcoin-like chains: value lives in unspent transaction outputs.
    Utxo,
    /// Ethereum-like chains: value lives in account balances.
    Account,
}

impl std::fmt::Display for ChainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ChainType::Utxo => "utxo",
            ChainType::Account => "account",
        })
    }
}

/// Errors produced by chain model implementations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// Raw block or transaction data failed to parse.
    #[error("parse error: {0}")]
    Parse(String),

    /// An address string or output script could not be interpreted.
    #[error("address error: {0}")]
    Address(String),

    /// The operation is not meaningful for this chain family.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// A packed transaction record was malformed.
    #[error("packed tx error: {0}")]
    PackedTx(String),
}

// *** Parsed chain data ***

/// One parsed transaction input.
///
/// For account chains a transaction carries exactly one input whose
/// `addresses` name the sender; `prev_txid` stays `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct TxInput {
    /// Referenced previous transaction; `None` marks a coinbase input.
    pub prev_txid: Option<Txid>,
    /// Referenced output index within the previous transaction.
    pub prev_vout: u32,
    /// Addresses attributed to the input by the backend, if any.
    pub addresses: Vec<String>,
}

impl TxInput {
    /// Returns true for coinbase inputs, which contribute no posting and no
    /// input slot.
    pub fn is_coinbase(&self) -> bool {
        self.prev_txid.is_none()
    }
}

/// One parsed transaction output.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct TxOutput {
    /// Output value.
    pub value: Amount,
    /// Raw output script; empty for account chains.
    pub script: Vec<u8>,
    /// Addresses attributed to the output by the backend, if any.
    pub addresses: Vec<String>,
}

/// A parsed token transfer carried by an account-chain transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct TokenTransfer {
    /// Token contract descriptor.
    pub contract: AddrDesc,
    /// Sender descriptor.
    pub from: AddrDesc,
    /// Recipient descriptor.
    pub to: AddrDesc,
    /// Transferred token amount.
    pub value: Amount,
}

/// One parsed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct Tx {
    /// Transaction id.
    pub txid: Txid,
    /// Inputs in position order.
    pub inputs: Vec<TxInput>,
    /// Outputs in position order.
    pub outputs: Vec<TxOutput>,
    /// Transaction lock time, zero when unused.
    pub locktime: u32,
    /// Token transfers extracted by the chain model; empty on UTXO chains.
    pub token_transfers: Vec<TokenTransfer>,
}

/// One parsed block, already validated by the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub struct Block {
    /// Height of the block in the canonical chain.
    pub height: Height,
    /// Block hash.
    pub hash: BlockHash,
    /// Block time, seconds since epoch.
    pub time: u32,
    /// Serialized block size in bytes.
    pub size: u32,
    /// Transactions in block order.
    pub txs: Vec<Tx>,
}

/// Token contract metadata, resolved through the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContractInfo {
    /// Contract address in the chain's string format.
    pub contract: String,
    /// Human readable token name.
    pub name: String,
    /// Token ticker symbol.
    pub symbol: String,
    /// Token decimals.
    pub decimals: u32,
}

// *** Chain model trait ***

/// Coin-specific parsing and descriptor derivation.
///
/// Selected once at engine construction; the engine holds exactly one
/// implementation and dispatches on [`ChainModel::chain_type`] only where
/// the two families genuinely diverge.
pub trait ChainModel: Send + Sync {
    /// Which chain family this model serves.
    fn chain_type(&self) -> ChainType;

    /// Fixed byte width of this chain's transaction ids.
    fn txid_len(&self) -> usize;

    /// Number of decimal places of the chain's base unit.
    fn amount_decimals(&self) -> u32;

    /// Parses a raw block as served by the backend.
    fn parse_block(&self, raw: &[u8]) -> Result<Block, ChainError>;

    /// Derives the address descriptor of an output.
    ///
    /// Unresolvable scripts are an error; the indexer records an empty
    /// descriptor for the slot and moves on.
    fn addr_desc_from_vout(&self, vout: &TxOutput) -> Result<AddrDesc, ChainError>;

    /// Derives the address descriptor of an address string.
    fn addr_desc_from_address(&self, address: &str) -> Result<AddrDesc, ChainError>;

    /// Reverse lookup of address strings for a descriptor.
    ///
    /// Best effort: returns an empty vector for descriptors that do not map
    /// back to a standard address. Callers must handle the empty case
    /// without failing the request.
    fn addresses_from_addr_desc(&self, desc: &AddrDesc) -> Vec<String>;

    /// Extracts the token transfers of a transaction. Only meaningful on
    /// account chains; the default returns what the parser put on the
    /// transaction.
    fn token_transfers(&self, tx: &Tx) -> Result<Vec<TokenTransfer>, ChainError> {
        Ok(tx.token_transfers.clone())
    }

    /// Packs a parsed transaction together with its inclusion height and
    /// block time for the transaction cache column.
    fn pack_tx(&self, tx: &Tx, height: Height, block_time: u32) -> Result<Vec<u8>, ChainError> {
        Ok(pack_tx_generic(tx, height, block_time))
    }

    /// Reverses [`ChainModel::pack_tx`].
    fn unpack_tx(&self, packed: &[u8]) -> Result<(Tx, Height, u32), ChainError> {
        unpack_tx_generic(packed).map_err(|e| ChainError::PackedTx(e.to_string()))
    }
}

// *** Generic packed transaction format ***
//
// Chain models are free to override pack_tx/unpack_tx with a chain native
// format; this one is complete for anything the engine itself needs.

fn pack_tx_generic(tx: &Tx, height: Height, block_time: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    write_varuint(&mut buf, height.as_u32() as u64).expect("write to Vec cannot fail");
    write_u32_be(&mut buf, block_time).expect("write to Vec cannot fail");
    write_bytes(&mut buf, tx.txid.as_bytes()).expect("write to Vec cannot fail");
    write_u32_be(&mut buf, tx.locktime).expect("write to Vec cannot fail");
    write_vec(&mut buf, &tx.inputs, |w, i| {
        match &i.prev_txid {
            Some(txid) => write_bytes(&mut *w, txid.as_bytes())?,
            None => write_bytes(&mut *w, &[])?,
        }
        write_varuint(&mut *w, i.prev_vout as u64)?;
        write_vec(w, &i.addresses, |w, a| write_bytes(w, a.as_bytes()))
    })
    .expect("write to Vec cannot fail");
    write_vec(&mut buf, &tx.outputs, |w, o| {
        write_amount(&mut *w, &o.value)?;
        write_bytes(&mut *w, &o.script)?;
        write_vec(w, &o.addresses, |w, a| write_bytes(w, a.as_bytes()))
    })
    .expect("write to Vec cannot fail");
    write_vec(&mut buf, &tx.token_transfers, |w, t| {
        write_bytes(&mut *w, t.contract.as_bytes())?;
        write_bytes(&mut *w, t.from.as_bytes())?;
        write_bytes(&mut *w, t.to.as_bytes())?;
        write_amount(w, &t.value)
    })
    .expect("write to Vec cannot fail");
    buf
}

fn unpack_tx_generic(mut data: &[u8]) -> io::Result<(Tx, Height, u32)> {
    let height = Height::new(read_varuint_t(&mut data)?);
    let block_time = read_u32_be(&mut data)?;
    let txid = Txid::from(read_bytes(&mut data)?);
    let locktime = read_u32_be(&mut data)?;
    let inputs = read_vec(&mut data, |r| {
        let prev = read_bytes(&mut *r)?;
        let prev_txid = if prev.is_empty() {
            None
        } else {
            Some(Txid::from(prev))
        };
        let prev_vout: u32 = read_varuint_t(&mut *r)?;
        let addresses = read_vec(r, read_string)?;
        Ok(TxInput {
            prev_txid,
            prev_vout,
            addresses,
        })
    })?;
    let outputs = read_vec(&mut data, |r| {
        let value = read_amount(&mut *r)?;
        let script = read_bytes(&mut *r)?;
        let addresses = read_vec(r, read_string)?;
        Ok(TxOutput {
            value,
            script,
            addresses,
        })
    })?;
    let token_transfers = read_vec(&mut data, |r| {
        let contract = AddrDesc::from(read_bytes(&mut *r)?);
        let from = AddrDesc::from(read_bytes(&mut *r)?);
        let to = AddrDesc::from(read_bytes(&mut *r)?);
        let value = read_amount(r)?;
        Ok(TokenTransfer {
            contract,
            from,
            to,
            value,
        })
    })?;
    if !data.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "trailing bytes after packed tx",
        ));
    }
    Ok((
        Tx {
            txid,
            inputs,
            outputs,
            locktime,
            token_transfers,
        },
        height,
        block_time,
    ))
}

fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    String::from_utf8(read_bytes(r)?)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 address string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_tx_roundtrip() {
        let tx = Tx {
            txid: Txid::from(vec![0x11; 32]),
            inputs: vec![
                TxInput {
                    prev_txid: None,
                    prev_vout: 0,
                    addresses: vec![],
                },
                TxInput {
                    prev_txid: Some(Txid::from(vec![0x22; 32])),
                    prev_vout: 3,
                    addresses: vec!["addr1".to_string()],
                },
            ],
            outputs: vec![TxOutput {
                value: Amount::from_u64(100000000),
                script: vec![0x76, 0xa9],
                addresses: vec!["addr2".to_string()],
            }],
            locktime: 0,
            token_transfers: vec![TokenTransfer {
                contract: AddrDesc::from(vec![4u8; 20]),
                from: AddrDesc::from(vec![5u8; 20]),
                to: AddrDesc::from(vec![6u8; 20]),
                value: Amount::from_u64(77),
            }],
        };
        let packed = pack_tx_generic(&tx, Height::new(225493), 1534858021);
        let (back, height, time) = unpack_tx_generic(&packed).unwrap();
        assert_eq!(back, tx);
        assert_eq!(height, Height::new(225493));
        assert_eq!(time, 1534858021);
    }

    #[test]
    fn packed_tx_rejects_trailing_garbage() {
        let tx = Tx {
            txid: Txid::from(vec![0x11; 32]),
            inputs: vec![],
            outputs: vec![],
            locktime: 0,
            token_transfers: vec![],
        };
        let mut packed = pack_tx_generic(&tx, Height::new(1), 0);
        packed.push(0xff);
        assert!(unpack_tx_generic(&packed).is_err());
    }
}
