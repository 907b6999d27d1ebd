use mvsdb::{
    AssetCert, AssetDetail, Attachment, Block, DataBase, DidDetail, DidTransfer, Error, Header,
    Input, Output, Point, PointKind, PrefixFilter, Settings, ShortHash, StealthMetadata,
    Transaction,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

const GENESIS_ADDRESS: ShortHash = [1u8; 20];

// Common test setup
fn setup_test_db() -> (TempDir, Settings, DataBase) {
    let temp_dir = TempDir::new().unwrap();
    let settings = Settings::new(temp_dir.path()).with_buckets(101);
    DataBase::initialize(settings.clone(), &block(0, vec![coinbase(0, GENESIS_ADDRESS, 50)]))
        .unwrap();
    let db = DataBase::open(settings.clone()).unwrap();
    (temp_dir, settings, db)
}

fn coinbase(number: u64, address: ShortHash, value: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![Input {
            previous_output: Point::null(),
            script: number.to_le_bytes().to_vec(),
            sequence: u32::MAX,
            address: None,
            attachment: None,
        }],
        outputs: vec![pay(address, value)],
        locktime: 0,
    }
}

fn pay(address: ShortHash, value: u64) -> Output {
    Output {
        value,
        script: vec![0x76, 0xa9],
        address: Some(address),
        stealth: None,
        attachment: None,
    }
}

fn spend(previous_output: Point, address: ShortHash, outputs: Vec<Output>) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![Input {
            previous_output,
            script: vec![0x48],
            sequence: u32::MAX,
            address: Some(address),
            attachment: None,
        }],
        outputs,
        locktime: 0,
    }
}

fn block(number: u64, transactions: Vec<Transaction>) -> Block {
    Block {
        header: Header {
            version: 1,
            previous_block_hash: [0u8; 32],
            merkle: [number as u8; 32],
            timestamp: 1_500_000_000 + number as u32,
            bits: 0x1d00ffff,
            nonce: number,
            number,
        },
        transactions,
    }
}

#[test]
fn test_initialize_and_open() {
    let (_dir, _settings, db) = setup_test_db();

    assert_eq!(db.last_height().unwrap(), Some(0));
    let genesis = db.block(0).unwrap().unwrap();
    assert_eq!(genesis.header.number, 0);
    assert_eq!(db.history(&GENESIS_ADDRESS, 0, 0).unwrap().len(), 1);

    // Only the genesis block is stored, so nothing can be popped
    assert!(matches!(db.pop(), Err(Error::ChainEmpty)));
}

#[test]
fn test_push_pop_inverse() {
    let (_dir, _settings, db) = setup_test_db();
    let alice = [0xa1u8; 20];
    let bob = [0xb0u8; 20];

    let reward = coinbase(1, alice, 5_000);
    let reward_point = Point::new(reward.hash(), 0);
    assert_eq!(db.push(&block(1, vec![reward])).unwrap(), 1);

    let payment = spend(reward_point, alice, vec![pay(bob, 3_000), pay(alice, 2_000)]);
    let payment_hash = payment.hash();
    let second = block(2, vec![coinbase(2, GENESIS_ADDRESS, 50), payment]);
    assert_eq!(db.push(&second).unwrap(), 2);

    assert_eq!(db.spend(&reward_point).unwrap(), Some(Point::new(payment_hash, 0)));
    let found = db.transaction(&payment_hash).unwrap().unwrap();
    assert_eq!(found.height, 2);
    assert_eq!(found.index, 1);

    // Newest first: change output, then the spend, then the reward
    let rows = db.history(&alice, 0, 0).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].kind, PointKind::Output);
    assert_eq!(rows[0].value, 2_000);
    assert_eq!(rows[1].kind, PointKind::Spend);
    assert_eq!(rows[1].value, reward_point.checksum());
    assert_eq!(rows[2].value, 5_000);
    assert_eq!(db.history(&alice, 0, 2).unwrap().len(), 2);
    assert_eq!(db.history(&alice, 1, 0).unwrap().len(), 1);
    assert_eq!(db.history(&bob, 0, 0).unwrap().len(), 1);

    let popped = db.pop().unwrap();
    assert_eq!(popped, second);

    assert_eq!(db.last_height().unwrap(), Some(1));
    assert!(db.spend(&reward_point).unwrap().is_none());
    assert!(db.transaction(&payment_hash).unwrap().is_none());
    assert!(db.block_by_hash(&second.hash()).unwrap().is_none());
    assert!(db.history(&bob, 0, 0).unwrap().is_empty());
    let rows = db.history(&alice, 0, 0).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, 5_000);

    // The popped block can be pushed again
    assert_eq!(db.push(&second).unwrap(), 2);
    assert_eq!(db.history(&alice, 0, 0).unwrap().len(), 3);
}

#[test]
fn test_push_with_gap_then_pop() {
    let (_dir, _settings, db) = setup_test_db();
    let address = [0x0au8; 20];
    let high = block(100, vec![coinbase(100, address, 5_000)]);
    let hash = high.transactions[0].hash();

    db.push_at(&high, 100).unwrap();
    assert_eq!(db.last_height().unwrap(), Some(100));
    assert_eq!(db.next_gap(0).unwrap(), Some(1));
    assert_eq!(db.gap_range().unwrap(), Some((1, 99)));
    assert!(db.block_by_height(50).unwrap().is_none());
    assert_eq!(db.block_by_height(100).unwrap().unwrap().height, 100);

    let rows = db.history(&address, 0, 0).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].height, 100);
    assert_eq!(rows[0].value, 5_000);

    assert_eq!(db.pop().unwrap(), high);
    assert!(db.history(&address, 0, 0).unwrap().is_empty());
    assert!(db.transaction(&hash).unwrap().is_none());
    assert!(db.block_by_hash(&high.hash()).unwrap().is_none());
}

#[test]
fn test_stealth_rows() {
    let (_dir, _settings, db) = setup_test_db();
    let receiver = [0x5eu8; 20];

    let mut tx = coinbase(1, GENESIS_ADDRESS, 50);
    tx.outputs = vec![
        Output {
            value: 0,
            script: vec![0x6a],
            address: None,
            stealth: Some(StealthMetadata {
                prefix: 0xabcd_1234,
                ephemeral_key_hash: [7u8; 32],
            }),
            attachment: None,
        },
        pay(receiver, 1_000),
    ];
    let hash = tx.hash();
    db.push(&block(1, vec![tx])).unwrap();

    let rows = db.stealth(&PrefixFilter::new(0xabcd_0000, 16).unwrap(), 0).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].address, receiver);
    assert_eq!(rows[0].transaction_hash, hash);
    assert_eq!(rows[0].height, 1);
    assert!(db
        .stealth(&PrefixFilter::new(0x1234_0000, 16).unwrap(), 0)
        .unwrap()
        .is_empty());
    assert!(db.stealth(&PrefixFilter::any(), 2).unwrap().is_empty());

    db.pop().unwrap();
    assert!(db.stealth(&PrefixFilter::any(), 0).unwrap().is_empty());
}

#[test]
fn test_asset_issue_and_business_history() {
    let (_dir, _settings, db) = setup_test_db();
    let issuer = [0x15u8; 20];
    let detail = AssetDetail {
        symbol: "MVS.TEST".to_string(),
        maximum_supply: 1_000_000,
        decimal_number: 4,
        issuer: "tester".to_string(),
        description: "test asset".to_string(),
    };

    let mut tx = coinbase(1, issuer, 0);
    tx.outputs[0].attachment = Some(Attachment::AssetIssue(detail.clone()));
    let hash = tx.hash();
    db.push(&block(1, vec![tx])).unwrap();

    let record = db.asset("MVS.TEST").unwrap().unwrap();
    assert_eq!(record.detail, detail);
    assert_eq!(record.height, 1);
    assert_eq!(record.transaction_hash, hash);

    let rows = db.business_history(&issuer, 0, 0).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attachment, Attachment::AssetIssue(detail));
    assert_eq!(rows[0].timestamp, 1_500_000_001);
    assert_eq!(rows[0].row.point, Point::new(hash, 0));

    db.pop().unwrap();
    assert!(db.asset("MVS.TEST").unwrap().is_none());
    assert!(db.business_history(&issuer, 0, 0).unwrap().is_empty());
}

#[test]
fn test_duplicate_asset_issue_outputs_pop_cleanly() {
    let (_dir, _settings, db) = setup_test_db();
    let issuer = [0x16u8; 20];
    let detail = AssetDetail {
        symbol: "MVS.TWIN".to_string(),
        maximum_supply: 10,
        decimal_number: 0,
        issuer: "twin".to_string(),
        description: "issued twice".to_string(),
    };

    let mut tx = coinbase(1, issuer, 0);
    let mut output = pay(issuer, 0);
    output.attachment = Some(Attachment::AssetIssue(detail.clone()));
    tx.outputs = vec![output.clone(), output];
    let first = block(1, vec![tx]);
    db.push(&first).unwrap();

    assert_eq!(db.asset("MVS.TWIN").unwrap().unwrap().detail, detail);
    assert_eq!(db.business_history(&issuer, 0, 0).unwrap().len(), 2);

    assert_eq!(db.pop().unwrap(), first);
    assert!(db.asset("MVS.TWIN").unwrap().is_none());
    assert!(db.business_history(&issuer, 0, 0).unwrap().is_empty());
    assert!(db.history(&issuer, 0, 0).unwrap().is_empty());

    // Nothing is left behind to trip a second round
    db.push(&first).unwrap();
    db.pop().unwrap();
    assert!(db.asset("MVS.TWIN").unwrap().is_none());
}

#[test]
fn test_did_and_cert_push_pop() {
    let (_dir, _settings, db) = setup_test_db();
    let owner = [0xd1u8; 20];
    let receiver = [0xd2u8; 20];
    let detail = DidDetail {
        symbol: "alice.did".to_string(),
        issuer: "alice".to_string(),
        address: "MAliceAddress".to_string(),
        description: "alice".to_string(),
    };
    let cert = AssetCert {
        symbol: "MVS.CERT".to_string(),
        owner: "alice".to_string(),
        certs: 1,
    };

    let mut register = coinbase(1, owner, 0);
    register.outputs[0].attachment = Some(Attachment::DidRegister(detail.clone()));
    let mut granted = pay(owner, 0);
    granted.attachment = Some(Attachment::AssetCert(cert.clone()));
    register.outputs.push(granted);
    let register_hash = register.hash();
    db.push(&block(1, vec![register])).unwrap();

    let record = db.did("alice.did").unwrap().unwrap();
    assert_eq!(record.detail, detail);
    assert_eq!(record.transaction_hash, register_hash);
    assert_eq!(db.cert("MVS.CERT", 1).unwrap().unwrap().cert, cert);
    assert!(db.cert("MVS.CERT", 2).unwrap().is_none());

    let mut transfer = coinbase(2, receiver, 0);
    transfer.outputs[0].attachment = Some(Attachment::DidTransfer(DidTransfer {
        symbol: "alice.did".to_string(),
        address: "MBobAddress".to_string(),
    }));
    db.push(&block(2, vec![transfer])).unwrap();

    let current = db.did("alice.did").unwrap().unwrap();
    assert_eq!(current.height, 2);
    assert_eq!(current.detail.address, "MBobAddress");
    assert_eq!(current.detail.issuer, "alice");
    assert_eq!(db.did_history("alice.did").unwrap().len(), 2);
    let rows = db.business_history(&receiver, 0, 0).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attachment.kind(), 6);

    db.pop().unwrap();
    assert_eq!(db.did("alice.did").unwrap().unwrap().detail, detail);
    assert!(db.business_history(&receiver, 0, 0).unwrap().is_empty());

    db.pop().unwrap();
    assert!(db.did("alice.did").unwrap().is_none());
    assert!(db.did_history("alice.did").unwrap().is_empty());
    assert!(db.cert("MVS.CERT", 1).unwrap().is_none());
    assert!(db.business_history(&owner, 0, 0).unwrap().is_empty());
}

#[test]
fn test_stealth_start_height() {
    let temp_dir = TempDir::new().unwrap();
    let settings = Settings::new(temp_dir.path())
        .with_buckets(101)
        .with_stealth_start_height(2);
    DataBase::initialize(settings.clone(), &block(0, vec![coinbase(0, GENESIS_ADDRESS, 50)]))
        .unwrap();
    let db = DataBase::open(settings).unwrap();
    let receiver = [0x5fu8; 20];

    let stealth_tx = |number: u64| {
        let mut tx = coinbase(number, GENESIS_ADDRESS, 0);
        tx.outputs = vec![
            Output {
                value: 0,
                script: vec![0x6a],
                address: None,
                stealth: Some(StealthMetadata {
                    prefix: 0xfeed_0000 | number as u32,
                    ephemeral_key_hash: [number as u8; 32],
                }),
                attachment: None,
            },
            pay(receiver, 100),
        ];
        tx
    };

    db.push(&block(1, vec![stealth_tx(1)])).unwrap();
    assert!(db.stealth(&PrefixFilter::any(), 0).unwrap().is_empty());

    let above = stealth_tx(2);
    let above_hash = above.hash();
    db.push(&block(2, vec![above])).unwrap();
    let rows = db.stealth(&PrefixFilter::any(), 0).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].height, 2);
    assert_eq!(rows[0].transaction_hash, above_hash);
    assert_eq!(rows[0].address, receiver);

    db.pop().unwrap();
    assert!(db.stealth(&PrefixFilter::any(), 0).unwrap().is_empty());

    // Popping below the start height leaves the stealth rows untouched
    db.pop().unwrap();
    assert!(db.stealth(&PrefixFilter::any(), 0).unwrap().is_empty());
    assert_eq!(db.last_height().unwrap(), Some(0));
}

#[test]
fn test_open_corrupt_store_reports_real_error() {
    let (dir, settings, db) = setup_test_db();
    db.stop().unwrap();
    db.close().unwrap();
    drop(db);

    // Overwrite the persisted bucket count of the spend table
    let path = dir.path().join("spend_table");
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[..8].copy_from_slice(&7u64.to_le_bytes());
    std::fs::write(&path, bytes).unwrap();

    let first = DataBase::open(settings.clone());
    assert!(matches!(first, Err(Error::Corrupted(_))));
    let second = DataBase::open(settings);
    assert!(matches!(second, Err(Error::Corrupted(_))));
}

#[test]
fn test_oversized_attachment_rejected_before_write() {
    let (_dir, _settings, db) = setup_test_db();
    let mut tx = coinbase(1, GENESIS_ADDRESS, 0);
    tx.outputs[0].attachment = Some(Attachment::AssetIssue(AssetDetail {
        symbol: "BIG".to_string(),
        maximum_supply: 1,
        decimal_number: 0,
        issuer: "i".repeat(150),
        description: "d".repeat(150),
    }));

    assert!(matches!(
        db.push(&block(1, vec![tx])),
        Err(Error::BadValueSize { .. })
    ));
    assert_eq!(db.last_height().unwrap(), Some(0));
    assert_eq!(db.history(&GENESIS_ADDRESS, 0, 0).unwrap().len(), 1);
}

#[test]
fn test_process_lock() {
    let (_dir, settings, db) = setup_test_db();

    // A second instance on the same directory is refused
    assert!(matches!(
        DataBase::open(settings.clone()),
        Err(Error::AlreadyLocked(_))
    ));

    db.stop().unwrap();
    drop(db);
    assert!(!settings.directory.join("process_lock").exists());

    let db = DataBase::open(settings).unwrap();
    assert_eq!(db.last_height().unwrap(), Some(0));
}

#[test]
fn test_restart_persistence() {
    let (_dir, settings, db) = setup_test_db();
    let address = [0x33u8; 20];
    let tx = coinbase(1, address, 7_500);
    let hash = tx.hash();
    db.push(&block(1, vec![tx])).unwrap();
    db.stop().unwrap();
    db.close().unwrap();
    drop(db);

    let db = DataBase::open(settings).unwrap();
    assert_eq!(db.last_height().unwrap(), Some(1));
    assert_eq!(db.transaction(&hash).unwrap().unwrap().height, 1);
    assert_eq!(db.history(&address, 0, 0).unwrap()[0].value, 7_500);

    let stat = db.statinfo().unwrap();
    assert_eq!(stat.top_height, Some(1));
    assert_eq!(stat.history.unwrap().row_count, 2);
}

#[test]
fn test_reads_during_writes() {
    let temp_dir = TempDir::new().unwrap();
    let settings = Settings::new(temp_dir.path())
        .with_buckets(101)
        .with_read_retries(1_000_000);
    DataBase::initialize(settings.clone(), &block(0, vec![coinbase(0, GENESIS_ADDRESS, 50)]))
        .unwrap();
    let db = Arc::new(DataBase::open(settings).unwrap());
    let address = [0x77u8; 20];
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let rows = db.history(&address, 0, 0).unwrap();
                    assert!(rows.len() <= 64);
                    for row in &rows {
                        assert_eq!(row.value, u64::from(row.height) * 10);
                    }
                    assert!(db.last_height().unwrap().is_some());
                }
            })
        })
        .collect();

    for number in 1..=64u64 {
        db.push(&block(number, vec![coinbase(number, address, number * 10)]))
            .unwrap();
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(db.history(&address, 0, 0).unwrap().len(), 64);
}
