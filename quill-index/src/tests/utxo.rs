//! End-to-end UTXO-chain indexing tests with byte-exact column checks.
//!
//! The central scenario mirrors production reorg handling: connect two
//! blocks (the second spending outputs of the first, cross-block and
//! intra-block), disconnect the second, reconnect it, and compare every
//! column byte for byte at each step.

use hex::FromHex;

use super::fixtures::*;
use crate::db::Column;
use crate::error::IndexError;
use crate::types::{
    AddrBalanceRow, AddrDesc, Amount, Cancel, Height, HistoryEntry, TxAddressesRow,
};

fn block_record_bytes(hash: &str, time: u32, tx_count: u64, size: u64) -> Vec<u8> {
    cat(&[
        &Vec::<u8>::from_hex(hash).unwrap(),
        &time.to_be_bytes(),
        &vu(tx_count),
        &vu(size),
    ])
}

fn out_slot(desc: &AddrDesc, sat: u64, spent: bool) -> Vec<u8> {
    let folded = ((desc.as_bytes().len() as u64) << 1) | (spent as u64);
    cat(&[&vu(folded), desc.as_bytes(), &amt(sat)])
}

fn empty_out_slot(sat: u64) -> Vec<u8> {
    cat(&[&vu(0), &amt(sat)])
}

fn in_slot(desc: &AddrDesc, sat: u64) -> Vec<u8> {
    cat(&[&desc_bytes(desc), &amt(sat)])
}

fn undo_in(desc: &AddrDesc, prev: &str, prev_vout: u32) -> Vec<u8> {
    // zig-zag of -(prev_vout + 1)
    let signed = (2 * prev_vout + 1) as u8;
    cat(&[&desc_bytes(desc), txid(prev).as_bytes(), &[signed]])
}

/// One posting: txid followed by the zig-zag signed vout byte.
fn hist(id: &str, vout_byte: u8) -> Vec<u8> {
    cat(&[txid(id).as_bytes(), &[vout_byte]])
}

fn balance_row(tx_count: u64, sent: u64, balance: u64) -> Vec<u8> {
    cat(&[&vu(tx_count), &amt(sent), &amt(balance)])
}

fn verify_after_block1(db: &crate::db::IndexDb, after_disconnect: bool) {
    let (d1, d2, d3, d4, d5) = (
        desc_for(ADDR1),
        desc_for(ADDR2),
        desc_for(ADDR3),
        desc_for(ADDR4),
        desc_for(ADDR5),
    );

    check_column(
        db,
        Column::Height,
        vec![(
            H1.to_be_bytes().to_vec(),
            block_record_bytes(HASH_B1, TIME_B1, 2, SIZE_B1 as u64),
        )],
    );

    // the vout is a signed varint: value*2 for credits, value*2+1 for the
    // complement of debits
    check_column(
        db,
        Column::Addresses,
        vec![
            (addr_key(&d1, H1), hist(TXID_B1T1, 0x00)),
            (addr_key(&d2, H1), hist(TXID_B1T1, 0x02)),
            (addr_key(&d3, H1), hist(TXID_B1T2, 0x00)),
            (addr_key(&d4, H1), hist(TXID_B1T2, 0x02)),
            (addr_key(&d5, H1), hist(TXID_B1T2, 0x04)),
        ],
    );

    check_column(
        db,
        Column::TxAddresses,
        vec![
            (
                txid(TXID_B1T1).as_bytes().to_vec(),
                cat(&[
                    &vu(H1 as u64),
                    &vu(0),
                    &vu(2),
                    &out_slot(&d1, SAT_B1T1_A1, false),
                    &out_slot(&d2, SAT_B1T1_A2, false),
                ]),
            ),
            (
                txid(TXID_B1T2).as_bytes().to_vec(),
                cat(&[
                    &vu(H1 as u64),
                    &vu(0),
                    &vu(3),
                    &out_slot(&d3, SAT_B1T2_A3, false),
                    &out_slot(&d4, SAT_B1T2_A4, false),
                    &out_slot(&d5, SAT_B1T2_A5, false),
                ]),
            ),
        ],
    );

    check_column(
        db,
        Column::AddrBalance,
        vec![
            (d1.as_bytes().to_vec(), balance_row(1, 0, SAT_B1T1_A1)),
            (d2.as_bytes().to_vec(), balance_row(1, 0, SAT_B1T1_A2)),
            (d3.as_bytes().to_vec(), balance_row(1, 0, SAT_B1T2_A3)),
            (d4.as_bytes().to_vec(), balance_row(1, 0, SAT_B1T2_A4)),
            (d5.as_bytes().to_vec(), balance_row(1, 0, SAT_B1T2_A5)),
        ],
    );

    // the undo row of block 1 falls out of the retention window when
    // block 2 connects, so it cannot come back after a disconnect
    let block_txs = if after_disconnect {
        vec![]
    } else {
        vec![(
            H1.to_be_bytes().to_vec(),
            cat(&[
                txid(TXID_B1T1).as_bytes(),
                &vu(0),
                txid(TXID_B1T2).as_bytes(),
                &vu(0),
            ]),
        )]
    };
    check_column(db, Column::BlockTxs, block_txs);
}

fn verify_after_block2(db: &crate::db::IndexDb) {
    let (d1, d2, d3, d4, d5) = (
        desc_for(ADDR1),
        desc_for(ADDR2),
        desc_for(ADDR3),
        desc_for(ADDR4),
        desc_for(ADDR5),
    );
    let (d6, d7, d8, d9, dm) = (
        desc_for(ADDR6),
        desc_for(ADDR7),
        desc_for(ADDR8),
        desc_for(ADDR9),
        desc_for(ADDR_MINER),
    );

    check_column(
        db,
        Column::Height,
        vec![
            (
                H1.to_be_bytes().to_vec(),
                block_record_bytes(HASH_B1, TIME_B1, 2, SIZE_B1 as u64),
            ),
            (
                H2.to_be_bytes().to_vec(),
                block_record_bytes(HASH_B2, TIME_B2, 4, SIZE_B2 as u64),
            ),
        ],
    );

    check_column(
        db,
        Column::Addresses,
        vec![
            (addr_key(&d1, H1), hist(TXID_B1T1, 0x00)),
            (addr_key(&d2, H1), hist(TXID_B1T1, 0x02)),
            (addr_key(&d3, H1), hist(TXID_B1T2, 0x00)),
            (addr_key(&d4, H1), hist(TXID_B1T2, 0x02)),
            (addr_key(&d5, H1), hist(TXID_B1T2, 0x04)),
            (addr_key(&d2, H2), hist(TXID_B2T1, 0x03)),
            (addr_key(&d3, H2), hist(TXID_B2T1, 0x01)),
            (addr_key(&d4, H2), hist(TXID_B2T2, 0x03)),
            (
                addr_key(&d5, H2),
                cat(&[&hist(TXID_B2T3, 0x00), &hist(TXID_B2T3, 0x05)]),
            ),
            (
                addr_key(&d6, H2),
                cat(&[&hist(TXID_B2T1, 0x00), &hist(TXID_B2T2, 0x01)]),
            ),
            (addr_key(&d7, H2), hist(TXID_B2T1, 0x02)),
            (addr_key(&d8, H2), hist(TXID_B2T2, 0x00)),
            (addr_key(&d9, H2), hist(TXID_B2T2, 0x02)),
            (addr_key(&dm, H2), hist(TXID_B2T4, 0x00)),
        ],
    );

    check_column(
        db,
        Column::TxAddresses,
        vec![
            (
                txid(TXID_B1T1).as_bytes().to_vec(),
                cat(&[
                    &vu(H1 as u64),
                    &vu(0),
                    &vu(2),
                    &out_slot(&d1, SAT_B1T1_A1, false),
                    &out_slot(&d2, SAT_B1T1_A2, true),
                ]),
            ),
            (
                txid(TXID_B1T2).as_bytes().to_vec(),
                cat(&[
                    &vu(H1 as u64),
                    &vu(0),
                    &vu(3),
                    &out_slot(&d3, SAT_B1T2_A3, true),
                    &out_slot(&d4, SAT_B1T2_A4, true),
                    &out_slot(&d5, SAT_B1T2_A5, true),
                ]),
            ),
            (
                txid(TXID_B2T1).as_bytes().to_vec(),
                cat(&[
                    &vu(H2 as u64),
                    &vu(2),
                    &in_slot(&d3, SAT_B1T2_A3),
                    &in_slot(&d2, SAT_B1T1_A2),
                    &vu(2),
                    &out_slot(&d6, SAT_B2T1_A6, true),
                    &out_slot(&d7, SAT_B2T1_A7, false),
                ]),
            ),
            (
                txid(TXID_B2T2).as_bytes().to_vec(),
                cat(&[
                    &vu(H2 as u64),
                    &vu(2),
                    &in_slot(&d6, SAT_B2T1_A6),
                    &in_slot(&d4, SAT_B1T2_A4),
                    &vu(2),
                    &out_slot(&d8, SAT_B2T2_A8, false),
                    &out_slot(&d9, SAT_B2T2_A9, false),
                ]),
            ),
            (
                txid(TXID_B2T3).as_bytes().to_vec(),
                cat(&[
                    &vu(H2 as u64),
                    &vu(1),
                    &in_slot(&d5, SAT_B1T2_A5),
                    &vu(1),
                    &out_slot(&d5, SAT_B2T3_A5, false),
                ]),
            ),
            (
                txid(TXID_B2T4).as_bytes().to_vec(),
                cat(&[
                    &vu(H2 as u64),
                    &vu(0),
                    &vu(2),
                    &out_slot(&dm, SAT_B2T4_MINER, false),
                    &empty_out_slot(0),
                ]),
            ),
        ],
    );

    check_column(
        db,
        Column::AddrBalance,
        vec![
            (d1.as_bytes().to_vec(), balance_row(1, 0, SAT_B1T1_A1)),
            (d2.as_bytes().to_vec(), balance_row(2, SAT_B1T1_A2, 0)),
            (d3.as_bytes().to_vec(), balance_row(2, SAT_B1T2_A3, 0)),
            (d4.as_bytes().to_vec(), balance_row(2, SAT_B1T2_A4, 0)),
            (
                d5.as_bytes().to_vec(),
                balance_row(2, SAT_B1T2_A5, SAT_B2T3_A5),
            ),
            (d6.as_bytes().to_vec(), balance_row(2, SAT_B2T1_A6, 0)),
            (d7.as_bytes().to_vec(), balance_row(1, 0, SAT_B2T1_A7)),
            (d8.as_bytes().to_vec(), balance_row(1, 0, SAT_B2T2_A8)),
            (d9.as_bytes().to_vec(), balance_row(1, 0, SAT_B2T2_A9)),
            (dm.as_bytes().to_vec(), balance_row(1, 0, SAT_B2T4_MINER)),
        ],
    );

    check_column(
        db,
        Column::BlockTxs,
        vec![(
            H2.to_be_bytes().to_vec(),
            cat(&[
                txid(TXID_B2T1).as_bytes(),
                &vu(2),
                &undo_in(&d3, TXID_B1T2, 0),
                &undo_in(&d2, TXID_B1T1, 1),
                txid(TXID_B2T2).as_bytes(),
                &vu(2),
                &undo_in(&d6, TXID_B2T1, 0),
                &undo_in(&d4, TXID_B1T2, 1),
                txid(TXID_B2T3).as_bytes(),
                &vu(1),
                &undo_in(&d5, TXID_B1T2, 2),
                txid(TXID_B2T4).as_bytes(),
                &vu(0),
            ]),
        )],
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn utxo_connect_disconnect_reconnect() {
    let (_dir, db) = utxo_db();

    db.connect_block(&utxo_block1()).await.unwrap();
    verify_after_block1(&db, false);

    db.connect_block(&utxo_block2()).await.unwrap();
    verify_after_block2(&db);
    let after_block2 = snapshot(&db);

    // the undo row of block 1 is past the retention window, the range
    // cannot be unwound
    let err = db
        .disconnect_block_range(Height::new(H1), Height::new(H2))
        .await
        .unwrap_err();
    assert!(
        matches!(err, IndexError::ReindexRequired(h) if h == H1),
        "expected ReindexRequired, got {err:?}"
    );
    verify_after_block2(&db);

    db.disconnect_block_range(Height::new(H2), Height::new(H2))
        .await
        .unwrap();
    verify_after_block1(&db, true);
    assert_eq!(db.state().best_height(), Some(Height::new(H1)));

    db.connect_block(&utxo_block2()).await.unwrap();
    verify_after_block2(&db);
    assert_eq!(snapshot(&db), after_block2);
}

#[tokio::test(flavor = "multi_thread")]
async fn intra_block_spend() {
    let (_dir, db) = utxo_db();
    db.connect_block(&utxo_block1()).await.unwrap();
    db.connect_block(&utxo_block2()).await.unwrap();

    // exactly the first output of B2T1 carries the spent bit
    let row = db.tx_addresses(&txid(TXID_B2T1)).await.unwrap().unwrap();
    assert!(row.outputs[0].spent);
    assert!(!row.outputs[1].spent);

    // the spent address has a credit and a debit posting in the same block
    let d6 = desc_for(ADDR6);
    let history = db
        .address_history(&d6, Height::new(0), Height::new(u32::MAX), &Cancel::new())
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].1.vout.is_credit());
    assert_eq!(history[0].1.txid, txid(TXID_B2T1));
    assert!(!history[1].1.vout.is_credit());
    assert_eq!(history[1].1.txid, txid(TXID_B2T2));

    // and the balance reflects the net effect
    let bal = db.addr_balance(&d6).await.unwrap().unwrap();
    assert_eq!(bal.balance, Amount::zero());
    assert_eq!(bal.sent, Amount::from_u64(SAT_B2T1_A6));
    assert_eq!(bal.tx_count, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn same_block_debit_precedes_later_credit() {
    let (_dir, db) = utxo_db();
    db.connect_block(&ordering_block1()).await.unwrap();
    db.connect_block(&ordering_block2()).await.unwrap();

    // inside block 2 the first transaction debits the address and a later
    // one credits it; the stored row must keep transaction order
    let x = desc_for(ADDR_X);
    let y = desc_for(ADDR_Y);
    check_column(
        &db,
        Column::Addresses,
        vec![
            (addr_key(&x, ORD_H1), hist(TXID_ORD_O1, 0x00)),
            (
                addr_key(&x, ORD_H2),
                cat(&[&hist(TXID_ORD_S1, 0x01), &hist(TXID_ORD_O2, 0x02)]),
            ),
            (
                addr_key(&y, ORD_H2),
                cat(&[&hist(TXID_ORD_S1, 0x00), &hist(TXID_ORD_O2, 0x00)]),
            ),
        ],
    );

    let history = db
        .address_history(&x, Height::new(0), Height::new(u32::MAX), &Cancel::new())
        .await
        .unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].1.txid, txid(TXID_ORD_O1));
    assert!(history[0].1.vout.is_credit());
    assert_eq!(history[1].1.txid, txid(TXID_ORD_S1));
    assert!(!history[1].1.vout.is_credit());
    assert_eq!(history[2].1.txid, txid(TXID_ORD_O2));
    assert!(history[2].1.vout.is_credit());
}

#[tokio::test(flavor = "multi_thread")]
async fn balance_matches_unspent_outputs() {
    let (_dir, db) = utxo_db();
    db.connect_block(&utxo_block1()).await.unwrap();
    db.connect_block(&utxo_block2()).await.unwrap();

    let mut unspent: std::collections::HashMap<Vec<u8>, Amount> = std::collections::HashMap::new();
    for (_txid, raw) in db.dump_column(Column::TxAddresses) {
        let row = TxAddressesRow::unpack(&raw).unwrap();
        for output in row.outputs {
            if output.spent || output.addr_desc.is_empty() {
                continue;
            }
            let sum = unspent
                .entry(output.addr_desc.as_bytes().to_vec())
                .or_insert_with(Amount::zero);
            *sum += output.value;
        }
    }

    for (desc, raw) in db.dump_column(Column::AddrBalance) {
        let row = AddrBalanceRow::unpack(&raw).unwrap();
        let expected = unspent.remove(&desc).unwrap_or_else(Amount::zero);
        assert_eq!(
            row.balance,
            expected,
            "balance mismatch for descriptor {}",
            hex::encode(&desc)
        );
    }
    assert!(unspent.is_empty(), "unspent outputs without balance row");
}

#[tokio::test(flavor = "multi_thread")]
async fn postings_cover_every_output() {
    let (_dir, db) = utxo_db();
    db.connect_block(&utxo_block1()).await.unwrap();
    db.connect_block(&utxo_block2()).await.unwrap();

    let addresses: std::collections::HashMap<Vec<u8>, Vec<u8>> =
        db.dump_column(Column::Addresses).into_iter().collect();

    for (txid_bytes, raw) in db.dump_column(Column::TxAddresses) {
        let row = TxAddressesRow::unpack(&raw).unwrap();
        for (n, output) in row.outputs.iter().enumerate() {
            if output.addr_desc.is_empty() {
                continue;
            }
            let key = addr_key(&output.addr_desc, row.height.as_u32());
            let row_value = addresses
                .get(&key)
                .unwrap_or_else(|| panic!("missing addresses row for {}", hex::encode(&key)));
            let entries = HistoryEntry::unpack_row(row_value, 32).unwrap();
            assert!(
                entries.iter().any(|e| {
                    e.txid.as_bytes() == txid_bytes.as_slice()
                        && e.vout.is_credit()
                        && e.vout.index() == n as u32
                }),
                "no credit posting for output {n} of {}",
                hex::encode(&txid_bytes)
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_rejects_gap() {
    let (_dir, db) = utxo_db();
    db.connect_block(&utxo_block1()).await.unwrap();
    let mut wrong = utxo_block2();
    wrong.height = Height::new(H2 + 5);
    let err = db.connect_block(&wrong).await.unwrap_err();
    assert!(matches!(err, IndexError::Invalid(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_rejects_non_suffix() {
    let (_dir, db) = utxo_db();
    db.connect_block(&utxo_block1()).await.unwrap();
    db.connect_block(&utxo_block2()).await.unwrap();

    let err = db
        .disconnect_block_range(Height::new(H1), Height::new(H1))
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::Invalid(_)));
    verify_after_block2(&db);
}

#[tokio::test(flavor = "multi_thread")]
async fn bulk_sync_mode_refuses_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.sync_mode = quill_common::SyncMode::Bulk;
    let db = crate::db::IndexDb::open(&config, std::sync::Arc::new(ScriptChain)).unwrap();
    db.connect_block(&utxo_block1()).await.unwrap();
    db.connect_block(&utxo_block2()).await.unwrap();

    let err = db
        .disconnect_block_range(Height::new(H2), Height::new(H2))
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::ReindexRequired(_)));
    verify_after_block2(&db);
}

#[tokio::test(flavor = "multi_thread")]
async fn store_reopen_and_identity_checks() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    {
        let db = crate::db::IndexDb::open(&config, std::sync::Arc::new(ScriptChain)).unwrap();
        db.connect_block(&utxo_block1()).await.unwrap();
        db.close().await.unwrap();
    }

    {
        let db = crate::db::IndexDb::open(&config, std::sync::Arc::new(ScriptChain)).unwrap();
        assert_eq!(db.state().best_height(), Some(Height::new(H1)));
        verify_after_block1(&db, false);
    }

    let mut other_coin = config.clone();
    other_coin.coin = "Othercoin".to_string();
    let err = crate::db::IndexDb::open(&other_coin, std::sync::Arc::new(ScriptChain)).unwrap_err();
    assert!(matches!(err, IndexError::Corruption(_)));

    let err = crate::db::IndexDb::open(&config, std::sync::Arc::new(HexAccountChain)).unwrap_err();
    assert!(matches!(err, IndexError::Corruption(_)));
}
