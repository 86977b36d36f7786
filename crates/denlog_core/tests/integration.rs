//! End-to-end tests for the log engine lifecycle: append, sync, crash,
//! reopen.

use denlog_core::log::reader::BackwardScanner;
use denlog_core::{Append, Config, EngineError, LogEntryType, LogManager, Lsn, Provisional};
use denlog_storage::{Device, MemDevice};
use std::sync::Arc;
use tempfile::tempdir;

fn open(device: &Arc<MemDevice>, config: Config) -> LogManager {
    LogManager::open(Arc::<MemDevice>::clone(device) as Arc<dyn Device>, config).unwrap()
}

fn small_files() -> Config {
    Config::new().max_file_size(2048)
}

#[test]
fn lsns_stay_monotonic_across_many_rotations() {
    let device = Arc::new(MemDevice::new());
    let log = open(&device, small_files());

    let mut prev = Lsn::NULL;
    for i in 0..200u32 {
        let lsn = log
            .append(Append::new(LogEntryType::Data, &vec![i as u8; 100]))
            .unwrap();
        if !prev.is_null() {
            assert!(lsn > prev, "lsn went backwards at append {i}");
        }
        prev = lsn;
    }
    assert!(prev.file_num() > 3, "expected several rotations");
}

#[test]
fn everything_survives_reopen() {
    let device = Arc::new(MemDevice::new());
    let mut lsns = Vec::new();
    {
        let log = open(&device, small_files());
        for i in 0..50u32 {
            let lsn = log
                .append(Append::new(LogEntryType::TxnData, format!("row {i}").as_bytes()))
                .unwrap();
            lsns.push(lsn);
        }
        log.flush_and_sync().unwrap();
    }

    let log = open(&device, small_files());
    assert_eq!(log.last_used_lsn(), *lsns.last().unwrap());
    for (i, lsn) in lsns.iter().enumerate() {
        let entry = log.read(*lsn).unwrap();
        assert_eq!(entry.item, format!("row {i}").as_bytes());
    }
}

#[test]
fn forward_scan_matches_append_order_across_files() {
    let device = Arc::new(MemDevice::new());
    let log = open(&device, small_files());

    let mut appended = Vec::new();
    for i in 0..80u32 {
        let lsn = log
            .append(Append::new(LogEntryType::Data, &vec![i as u8; 64]))
            .unwrap();
        appended.push(lsn);
    }
    assert!(appended.last().unwrap().file_num() > 0);

    let mut reader = log.forward_reader().unwrap();
    let mut scanned = Vec::new();
    while let Some(entry) = reader
        .next_matching(|t| t == LogEntryType::Data)
        .unwrap()
    {
        scanned.push(entry.lsn);
    }
    assert_eq!(scanned, appended);
}

#[test]
fn backward_chain_visits_every_entry_once() {
    let device = Arc::new(MemDevice::new());
    let log = open(&device, small_files());

    let mut appended = Vec::new();
    for i in 0..60u32 {
        let lsn = log
            .append(Append::new(LogEntryType::Data, &vec![i as u8; 64]))
            .unwrap();
        appended.push(lsn);
    }

    let mut scanner = log.backward_scanner(log.last_used_lsn()).unwrap();
    let mut reversed = Vec::new();
    while let Some(entry) = scanner.next_back().unwrap() {
        if entry.header.entry_type == LogEntryType::Data {
            reversed.push(entry.lsn);
        }
    }
    reversed.reverse();
    assert_eq!(reversed, appended);
}

#[test]
fn any_flipped_byte_is_detected() {
    let device = Arc::new(MemDevice::new());
    let lsn;
    {
        let log = open(&device, Config::new());
        lsn = log
            .append(Append::new(LogEntryType::Node, &vec![0x5A; 128]))
            .unwrap();
        log.flush_and_sync().unwrap();
    }

    // Flip one item byte on disk and re-read through a fresh engine so the
    // buffer pool cannot mask the damage.
    let name = format!("{:08x}.jdb", lsn.file_num());
    let mut bytes = device.raw_bytes(&name).unwrap();
    let victim = lsn.offset() as usize + 20;
    bytes[victim] ^= 0x01;
    device.set_raw_bytes(&name, bytes).unwrap();

    // The torn entry is the last one, so reopen treats it as the tail and
    // drops it.
    let log = open(&device, Config::new());
    assert!(log.last_used_lsn() < lsn);
}

#[test]
fn corrupt_interior_entry_fails_reads_but_not_open() {
    let device = Arc::new(MemDevice::new());
    let first;
    let second;
    {
        let log = open(&device, Config::new());
        first = log
            .append(Append::new(LogEntryType::Data, b"interior"))
            .unwrap();
        second = log
            .append(Append::new(LogEntryType::Data, b"tail"))
            .unwrap();
        log.flush_and_sync().unwrap();
    }

    let name = format!("{:08x}.jdb", first.file_num());
    let mut bytes = device.raw_bytes(&name).unwrap();
    bytes[first.offset() as usize + 16] ^= 0xFF;
    device.set_raw_bytes(&name, bytes).unwrap();

    // The probe stops at the first bad entry and truncates, so the tail
    // entry is sacrificed along with it.
    let log = open(&device, Config::new());
    assert!(log.last_used_lsn() < first);
    assert!(log.read(second).is_err());
}

#[test]
fn crash_during_write_leaves_no_lsn_gap() {
    let device = Arc::new(MemDevice::new());
    let config = Config::new().log_buffer_size(128).num_log_buffers(2);
    let log = open(&device, config);

    log.append(Append::new(LogEntryType::Data, &vec![1u8; 100]))
        .unwrap();
    let expected = log.next_available_lsn();

    device.fail_next_write();
    let err = log
        .append(Append::new(LogEntryType::Data, &vec![2u8; 100]))
        .unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)));

    let lsn = log
        .append(Append::new(LogEntryType::Data, &vec![3u8; 100]))
        .unwrap();
    assert_eq!(lsn, expected, "failed append must not consume an LSN");

    log.flush_and_sync().unwrap();
    let reopened = open(&device, Config::new());
    assert_eq!(reopened.read(lsn).unwrap().item, vec![3u8; 100]);
}

#[test]
fn provisional_flags_survive_the_log() {
    let device = Arc::new(MemDevice::new());
    let log = open(&device, Config::new());

    let always = log
        .append(Append::new(LogEntryType::Node, b"shadow").provisional(Provisional::Always))
        .unwrap();
    let before = log
        .append(
            Append::new(LogEntryType::Node, b"maybe").provisional(Provisional::BeforeCkptEnd),
        )
        .unwrap();
    let plain = log.append(Append::new(LogEntryType::Node, b"live")).unwrap();

    assert_eq!(log.read(always).unwrap().header.provisional, Provisional::Always);
    assert_eq!(
        log.read(before).unwrap().header.provisional,
        Provisional::BeforeCkptEnd
    );
    assert_eq!(log.read(plain).unwrap().header.provisional, Provisional::No);

    // Recovery skip policy against a checkpoint between `before` and
    // `plain`.
    let ckpt = plain;
    assert!(Provisional::Always.is_skipped(always, ckpt));
    assert!(Provisional::BeforeCkptEnd.is_skipped(before, ckpt));
    assert!(!Provisional::No.is_skipped(plain, ckpt));
}

#[test]
fn replication_stream_is_ordered_and_durable() {
    let device = Arc::new(MemDevice::new());
    let mut lsns = Vec::new();
    {
        let log = open(&device, Config::new());
        for i in 0..10u32 {
            lsns.push(
                log.append(
                    Append::new(LogEntryType::TxnData, &i.to_le_bytes()).replicated(),
                )
                .unwrap(),
            );
        }
        log.flush_and_sync().unwrap();
    }

    let log = open(&device, Config::new());
    let mut prev = 0u64;
    for lsn in lsns {
        let vlsn = log.read(lsn).unwrap().vlsn.expect("replicated entry");
        assert!(vlsn > prev);
        prev = vlsn;
    }
}

#[test]
fn quarantined_file_is_left_aside_and_log_continues() {
    let device = Arc::new(MemDevice::new());
    {
        let log = open(&device, small_files());
        for i in 0..40u32 {
            log.append(Append::new(LogEntryType::Data, &vec![i as u8; 100]))
                .unwrap();
        }
        log.flush_and_sync().unwrap();
    }

    // Crash shape: the last file made it to disk as a broken header and
    // nothing else.
    let last = {
        let mut files: Vec<String> = device
            .list()
            .unwrap()
            .into_iter()
            .filter(|n| n.ends_with(".jdb"))
            .collect();
        files.sort();
        files.pop().unwrap()
    };
    let mut bytes = device.raw_bytes(&last).unwrap();
    bytes.truncate(38);
    bytes[5] ^= 0xFF;
    device.set_raw_bytes(&last, bytes).unwrap();

    let log = open(&device, small_files());
    let bad = last.replace(".jdb", ".bad");
    assert!(device.exists(&bad), "corrupt file renamed aside");
    assert!(!device.exists(&last));

    // The engine keeps appending past the quarantined file.
    let lsn = log
        .append(Append::new(LogEntryType::Data, b"after quarantine"))
        .unwrap();
    assert_eq!(log.read(lsn).unwrap().item, b"after quarantine");
}

#[test]
fn filesystem_environment_full_lifecycle() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("db");

    let lsn;
    {
        let log = LogManager::open_path(&path, Config::new()).unwrap();
        lsn = log
            .append(Append::new(LogEntryType::TxnCommit, b"committed"))
            .unwrap();
        log.close().unwrap();
    }

    let log = LogManager::open_path(&path, Config::new().read_only(true)).unwrap();
    let entry = log.read(lsn).unwrap();
    assert_eq!(entry.header.entry_type, LogEntryType::TxnCommit);
    assert_eq!(entry.item, b"committed");
}

#[test]
fn oversized_entries_roundtrip_through_rotation() {
    let device = Arc::new(MemDevice::new());
    let config = Config::new()
        .max_file_size(4096)
        .log_buffer_size(1024)
        .num_log_buffers(2);
    let log = open(&device, config.clone());

    // Bigger than a buffer and bigger than a file.
    let big = vec![0xC3u8; 8000];
    let small_before = log.append(Append::new(LogEntryType::Data, b"before")).unwrap();
    let big_lsn = log.append(Append::new(LogEntryType::Node, &big)).unwrap();
    let small_after = log.append(Append::new(LogEntryType::Data, b"after")).unwrap();
    log.flush_and_sync().unwrap();

    let reopened = open(&device, config);
    assert_eq!(reopened.read(small_before).unwrap().item, b"before");
    assert_eq!(reopened.read(big_lsn).unwrap().item, big);
    assert_eq!(reopened.read(small_after).unwrap().item, b"after");
}

#[test]
fn backward_scan_errors_at_cleaned_files_by_default() {
    let device = Arc::new(MemDevice::new());
    let log = open(&device, small_files());
    for i in 0..60u32 {
        log.append(Append::new(LogEntryType::Data, &vec![i as u8; 100]))
            .unwrap();
    }
    log.flush_and_sync().unwrap();

    // Clean the first file away, as the space reclaimer would.
    log.file_manager().retire_file(0).unwrap();

    // The chain promises entries the walk can no longer reach; reaching
    // the gap is not the same as reaching the log's true start.
    let mut scanner: BackwardScanner<'_> = log.backward_scanner(log.last_used_lsn()).unwrap();
    let err = loop {
        match scanner.next_back() {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("walk ended silently at the cleaned file"),
            Err(err) => break err,
        }
    };
    assert!(matches!(err, EngineError::FileCleaned { file_num: 0 }));
}

#[test]
fn backward_scan_can_opt_into_stopping_at_cleaned_files() {
    let device = Arc::new(MemDevice::new());
    let log = open(&device, small_files());
    for i in 0..60u32 {
        log.append(Append::new(LogEntryType::Data, &vec![i as u8; 100]))
            .unwrap();
    }
    log.flush_and_sync().unwrap();

    log.file_manager().retire_file(0).unwrap();

    let mut scanner = log
        .backward_scanner(log.last_used_lsn())
        .unwrap()
        .stop_at_cleaned();
    let mut lowest = Lsn::NULL;
    while let Some(entry) = scanner.next_back().unwrap() {
        lowest = entry.lsn;
    }
    assert!(lowest.file_num() >= 1, "walk must not enter the retired file");
}
