//! End-to-end account-chain indexing tests.
//!
//! Token transfer postings encode the 1-based position of the contract in
//! the address's contract list; the expected rows below spell the encoding
//! out byte by byte.

use std::sync::Arc;

use hex::FromHex;

use super::fixtures::*;
use crate::db::Column;
use crate::error::IndexError;
use crate::chain::ContractInfo;
use crate::query::types::{AddressFilter, AddressOption};
use crate::query::Query;
use crate::txcache::TxCache;
use crate::types::{AddrDesc, Amount, Cancel, Height, Txid};

fn block_record_bytes(hash: &str, time: u32, tx_count: u64, size: u64) -> Vec<u8> {
    cat(&[
        &Vec::<u8>::from_hex(hash).unwrap(),
        &time.to_be_bytes(),
        &vu(tx_count),
        &vu(size),
    ])
}

fn hist(id: &str, vout_byte: u8) -> Vec<u8> {
    cat(&[txid(id).as_bytes(), &[vout_byte]])
}

/// `addr_contracts` row: total count followed by (contract, count) pairs.
fn contracts_row(total: u64, contracts: &[(&AddrDesc, u64)]) -> Vec<u8> {
    let mut buf = vu(total);
    for (contract, count) in contracts {
        buf.extend_from_slice(&desc_bytes(contract));
        buf.extend_from_slice(&vu(*count));
    }
    buf
}

fn verify_after_account_block1(db: &crate::db::IndexDb, after_disconnect: bool) {
    let (a, b, c, c1) = (
        acct_desc(ACC_A),
        acct_desc(ACC_B),
        acct_desc(ACC_C),
        acct_desc(CONTRACT_1),
    );

    check_column(
        db,
        Column::Height,
        vec![(
            ACC_H1.to_be_bytes().to_vec(),
            block_record_bytes(ACC_HASH_B1, ACC_TIME_B1, 2, 28_431),
        )],
    );

    check_column(
        db,
        Column::Addresses,
        vec![
            (addr_key(&a, ACC_H1), hist(ACC_TXID_B1T1, 0x01)),
            (
                addr_key(&b, ACC_H1),
                cat(&[&hist(ACC_TXID_B1T1, 0x00), &hist(ACC_TXID_B1T2, 0x02)]),
            ),
            (
                addr_key(&c, ACC_H1),
                cat(&[&hist(ACC_TXID_B1T2, 0x01), &hist(ACC_TXID_B1T2, 0x03)]),
            ),
            (addr_key(&c1, ACC_H1), hist(ACC_TXID_B1T2, 0x00)),
        ],
    );

    check_column(
        db,
        Column::AddrContracts,
        vec![
            (a.as_bytes().to_vec(), contracts_row(1, &[])),
            (b.as_bytes().to_vec(), contracts_row(1, &[(&c1, 1)])),
            (c.as_bytes().to_vec(), contracts_row(1, &[(&c1, 1)])),
            (c1.as_bytes().to_vec(), contracts_row(1, &[])),
        ],
    );

    let block_txs = if after_disconnect {
        vec![]
    } else {
        vec![(
            ACC_H1.to_be_bytes().to_vec(),
            cat(&[
                txid(ACC_TXID_B1T1).as_bytes(),
                &desc_bytes(&a),
                &desc_bytes(&b),
                &vu(0),
                txid(ACC_TXID_B1T2).as_bytes(),
                &desc_bytes(&c),
                &desc_bytes(&c1),
                &vu(2),
                &desc_bytes(&c),
                &desc_bytes(&c1),
                &desc_bytes(&b),
                &desc_bytes(&c1),
            ]),
        )]
    };
    check_column(db, Column::BlockTxs, block_txs);
}

fn verify_after_account_block2(db: &crate::db::IndexDb) {
    let (a, b, c, c1) = (
        acct_desc(ACC_A),
        acct_desc(ACC_B),
        acct_desc(ACC_C),
        acct_desc(CONTRACT_1),
    );
    let (d, e, f, g, c2) = (
        acct_desc(ACC_D),
        acct_desc(ACC_E),
        acct_desc(ACC_F),
        acct_desc(ACC_G),
        acct_desc(CONTRACT_2),
    );

    check_column(
        db,
        Column::Height,
        vec![
            (
                ACC_H1.to_be_bytes().to_vec(),
                block_record_bytes(ACC_HASH_B1, ACC_TIME_B1, 2, 28_431),
            ),
            (
                ACC_H2.to_be_bytes().to_vec(),
                block_record_bytes(ACC_HASH_B2, ACC_TIME_B2, 2, 1_987_654),
            ),
        ],
    );

    check_column(
        db,
        Column::Addresses,
        vec![
            (addr_key(&a, ACC_H1), hist(ACC_TXID_B1T1, 0x01)),
            (
                addr_key(&b, ACC_H1),
                cat(&[&hist(ACC_TXID_B1T1, 0x00), &hist(ACC_TXID_B1T2, 0x02)]),
            ),
            (
                addr_key(&c, ACC_H1),
                cat(&[&hist(ACC_TXID_B1T2, 0x01), &hist(ACC_TXID_B1T2, 0x03)]),
            ),
            (addr_key(&c1, ACC_H1), hist(ACC_TXID_B1T2, 0x00)),
            (
                addr_key(&b, ACC_H2),
                cat(&[
                    &hist(ACC_TXID_B2T1, 0x01),
                    &hist(ACC_TXID_B2T2, 0x05),
                    &hist(ACC_TXID_B2T2, 0x02),
                ]),
            ),
            (addr_key(&d, ACC_H2), hist(ACC_TXID_B2T1, 0x00)),
            (
                addr_key(&e, ACC_H2),
                cat(&[
                    &hist(ACC_TXID_B2T2, 0x01),
                    &hist(ACC_TXID_B2T2, 0x02),
                    &hist(ACC_TXID_B2T2, 0x05),
                    &hist(ACC_TXID_B2T2, 0x04),
                    &hist(ACC_TXID_B2T2, 0x03),
                ]),
            ),
            (
                addr_key(&f, ACC_H2),
                cat(&[&hist(ACC_TXID_B2T2, 0x03), &hist(ACC_TXID_B2T2, 0x04)]),
            ),
            (addr_key(&g, ACC_H2), hist(ACC_TXID_B2T2, 0x00)),
        ],
    );

    check_column(
        db,
        Column::AddrContracts,
        vec![
            (a.as_bytes().to_vec(), contracts_row(1, &[])),
            (
                b.as_bytes().to_vec(),
                contracts_row(2, &[(&c1, 2), (&c2, 1)]),
            ),
            (c.as_bytes().to_vec(), contracts_row(1, &[(&c1, 1)])),
            (c1.as_bytes().to_vec(), contracts_row(1, &[])),
            (d.as_bytes().to_vec(), contracts_row(1, &[])),
            (
                e.as_bytes().to_vec(),
                contracts_row(1, &[(&c2, 2), (&c1, 2)]),
            ),
            (
                f.as_bytes().to_vec(),
                contracts_row(0, &[(&c1, 1), (&c2, 1)]),
            ),
            (g.as_bytes().to_vec(), contracts_row(1, &[])),
        ],
    );

    check_column(
        db,
        Column::BlockTxs,
        vec![(
            ACC_H2.to_be_bytes().to_vec(),
            cat(&[
                txid(ACC_TXID_B2T1).as_bytes(),
                &desc_bytes(&b),
                &desc_bytes(&d),
                &vu(0),
                txid(ACC_TXID_B2T2).as_bytes(),
                &desc_bytes(&e),
                &desc_bytes(&g),
                &vu(8),
                // one (address, contract) pair per transfer side, sender first
                &desc_bytes(&b),
                &desc_bytes(&c2),
                &desc_bytes(&e),
                &desc_bytes(&c2),
                &desc_bytes(&e),
                &desc_bytes(&c1),
                &desc_bytes(&b),
                &desc_bytes(&c1),
                &desc_bytes(&f),
                &desc_bytes(&c1),
                &desc_bytes(&e),
                &desc_bytes(&c1),
                &desc_bytes(&e),
                &desc_bytes(&c2),
                &desc_bytes(&f),
                &desc_bytes(&c2),
            ]),
        )],
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn account_connect_disconnect_reconnect() {
    let (_dir, db) = account_db();

    db.connect_block(&account_block1()).await.unwrap();
    verify_after_account_block1(&db, false);

    db.connect_block(&account_block2()).await.unwrap();
    verify_after_account_block2(&db);
    let after_block2 = snapshot(&db);

    let err = db
        .disconnect_block_range(Height::new(ACC_H1), Height::new(ACC_H2))
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::ReindexRequired(h) if h == ACC_H1));
    verify_after_account_block2(&db);

    // a cached transaction of the disconnected block must be evicted
    db.cached_tx_put(&txid(ACC_TXID_B2T2), b"packed-body")
        .await
        .unwrap();

    db.disconnect_block_range(Height::new(ACC_H2), Height::new(ACC_H2))
        .await
        .unwrap();
    verify_after_account_block1(&db, true);
    check_column(&db, Column::Transactions, vec![]);

    db.connect_block(&account_block2()).await.unwrap();
    verify_after_account_block2(&db);
    assert_eq!(snapshot(&db), after_block2);
}

#[tokio::test(flavor = "multi_thread")]
async fn account_address_query_reports_contract_counts() {
    let (_dir, db) = account_db();
    db.connect_block(&account_block1()).await.unwrap();
    db.connect_block(&account_block2()).await.unwrap();

    let backend = Arc::new(MockBackend::default());
    backend.add_block(&account_block1());
    backend.add_block(&account_block2());
    let b = acct_desc(ACC_B);
    backend
        .balances
        .lock()
        .unwrap()
        .insert(b.clone(), Amount::from_u64(7_777));
    backend.nonces.lock().unwrap().insert(b.clone(), 3);
    backend.contracts.lock().unwrap().insert(
        acct_desc(CONTRACT_1),
        ContractInfo {
            contract: CONTRACT_1.to_string(),
            name: "TokenOne".to_string(),
            symbol: "TK1".to_string(),
            decimals: 18,
        },
    );
    backend
        .token_balances
        .lock()
        .unwrap()
        .insert((b.clone(), acct_desc(CONTRACT_1)), Amount::from_u64(500));

    let chain: Arc<dyn crate::chain::ChainModel> = Arc::new(HexAccountChain);
    let cache = Arc::new(TxCache::new(db.clone(), chain.clone(), backend.clone()));
    let query = Query::new(db.clone(), cache, backend, chain);

    let info = query
        .address(
            ACC_B,
            1,
            10,
            AddressOption::TxidHistory,
            &AddressFilter::default(),
            &Cancel::new(),
        )
        .await
        .unwrap();

    assert_eq!(info.tx_count, 2);
    assert_eq!(info.balance, Amount::from_u64(7_777));
    assert_eq!(info.nonce, Some(3));
    assert_eq!(info.tokens.len(), 2);
    assert_eq!(info.tokens[0].name, "TokenOne");
    assert_eq!(info.tokens[0].transfers, 2);
    assert_eq!(info.tokens[0].contract_index, 1);
    assert_eq!(info.tokens[0].balance, Some(Amount::from_u64(500)));
    assert_eq!(info.tokens[1].transfers, 1);
    assert_eq!(info.tokens[1].contract_index, 2);

    let expected: Vec<Txid> = [ACC_TXID_B2T2, ACC_TXID_B2T1, ACC_TXID_B1T2, ACC_TXID_B1T1]
        .iter()
        .map(|s| txid(s))
        .collect();
    assert_eq!(info.txids, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn account_address_query_narrows_to_contract() {
    let (_dir, db) = account_db();
    db.connect_block(&account_block1()).await.unwrap();
    db.connect_block(&account_block2()).await.unwrap();

    let backend = Arc::new(MockBackend::default());
    backend.add_block(&account_block1());
    backend.add_block(&account_block2());

    let chain: Arc<dyn crate::chain::ChainModel> = Arc::new(HexAccountChain);
    let cache = Arc::new(TxCache::new(db.clone(), chain.clone(), backend.clone()));
    let query = Query::new(db.clone(), cache, backend, chain);

    let filter = AddressFilter {
        contract: Some(CONTRACT_1.to_string()),
        ..AddressFilter::default()
    };
    let info = query
        .address(
            ACC_B,
            1,
            10,
            AddressOption::TxidHistory,
            &filter,
            &Cancel::new(),
        )
        .await
        .unwrap();
    let expected: Vec<Txid> = [ACC_TXID_B2T2, ACC_TXID_B1T2]
        .iter()
        .map(|s| txid(s))
        .collect();
    assert_eq!(info.txids, expected);
    // only the filtered contract is reported
    assert_eq!(info.tokens.len(), 1);
    assert_eq!(info.tokens[0].contract_index, 1);

    // a contract the address never touched yields an empty history
    let filter = AddressFilter {
        contract: Some(ACC_G.to_string()),
        ..AddressFilter::default()
    };
    let info = query
        .address(
            ACC_B,
            1,
            10,
            AddressOption::TxidHistory,
            &filter,
            &Cancel::new(),
        )
        .await
        .unwrap();
    assert!(info.txids.is_empty());
    assert!(info.tokens.is_empty());
}
