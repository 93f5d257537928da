//! Integration tests for the concrete scenarios (S1-S6) and the
//! close/open and checksum-integrity testable properties.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{Shard, ShardOptions};

fn tempdir(name: &str) -> PathBuf {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    let dir = std::env::temp_dir().join(format!(
        "shardmap-scenarios-{}-{}-{}",
        name,
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn options(block_size: u32) -> ShardOptions {
    ShardOptions {
        block_size,
        create_if_missing: true,
        ..Default::default()
    }
}

#[test]
fn s1_basic_put_and_available() {
    let dir = tempdir("s1");
    let shard = Shard::open(dir.join("shard"), options(64)).unwrap();

    shard.put(b"k", b"0").unwrap();
    shard.put(b"k", b"1").unwrap();
    shard.put(b"k", b"2").unwrap();

    assert_eq!(
        shard.get_all(b"k").unwrap(),
        Some(vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec()])
    );

    let handle = shard.get_shared(b"k").unwrap();
    let mut it = handle.iter();
    assert_eq!(it.available(), 3);
    it.next().unwrap();
    assert_eq!(it.available(), 2);
    it.next().unwrap();
    it.next().unwrap();
    assert_eq!(it.available(), 0);
}

#[test]
fn s2_remove_first_equal() {
    let dir = tempdir("s2");
    let shard = Shard::open(dir.join("shard"), options(64)).unwrap();
    shard.put(b"k", b"0").unwrap();
    shard.put(b"k", b"1").unwrap();
    shard.put(b"k", b"2").unwrap();

    assert!(shard.remove_first_equal(b"k", b"1").unwrap());
    assert_eq!(
        shard.get_all(b"k").unwrap(),
        Some(vec![b"0".to_vec(), b"2".to_vec()])
    );
    assert!(!shard.remove_first_equal(b"k", b"1").unwrap());
}

#[test]
fn s3_bulk_insert_and_remove_every_23rd() {
    let dir = tempdir("s3");
    let shard = Shard::open(dir.join("shard"), options(512)).unwrap();

    const N: u64 = 100_000;
    for i in 0..N {
        shard.put(b"k", format!("value{i}").as_bytes()).unwrap();
    }
    assert_eq!(shard.available(b"k"), Some(N));

    let full = shard.get_all(b"k").unwrap().unwrap();
    assert_eq!(full.len(), N as usize);
    for (i, v) in full.iter().enumerate() {
        assert_eq!(v, format!("value{i}").as_bytes());
    }

    let removed = shard.remove_all(b"k", |i, _| i % 23 == 0).unwrap();
    assert_eq!(removed, N.div_ceil(23));

    let remaining = shard.get_all(b"k").unwrap().unwrap();
    assert_eq!(remaining.len(), (N - removed) as usize);
    let mut expected_idx = 0u64;
    for v in &remaining {
        while expected_idx % 23 == 0 {
            expected_idx += 1;
        }
        assert_eq!(v, format!("value{expected_idx}").as_bytes());
        expected_idx += 1;
    }
}

#[test]
fn s4_split_value_across_blocks() {
    let dir = tempdir("s4");
    let shard = Shard::open(dir.join("shard"), options(128)).unwrap();
    let value: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
    shard.put(b"k", &value).unwrap();

    let got = shard.get_all(b"k").unwrap().unwrap();
    assert_eq!(got, vec![value]);
}

#[test]
fn s5_open_failure_modes() {
    let dir = tempdir("s5");

    let opts = ShardOptions {
        create_if_missing: false,
        ..Default::default()
    };
    assert!(Shard::open(dir.join("shard"), opts).is_err());

    {
        let shard = Shard::open(dir.join("shard"), options(512)).unwrap();
        shard.put(b"k", b"v").unwrap();
        shard.close().unwrap();
    }

    let opts = ShardOptions {
        create_if_missing: true,
        error_if_exists: true,
        ..Default::default()
    };
    assert!(Shard::open(dir.join("shard"), opts).is_err());
}

#[test]
fn s6_concurrent_appends_from_two_threads() {
    let dir = tempdir("s6");
    let shard = Shard::open(dir.join("shard"), options(512)).unwrap();

    std::thread::scope(|scope| {
        for t in 0..2 {
            let shard = &shard;
            scope.spawn(move || {
                for i in 0..10_000 {
                    shard.put(b"k", format!("t{t}-{i}").as_bytes()).unwrap();
                }
            });
        }
    });

    assert_eq!(shard.available(b"k"), Some(20_000));
    let all = shard.get_all(b"k").unwrap().unwrap();
    assert_eq!(all.len(), 20_000);

    let mut expected: Vec<Vec<u8>> = (0..2)
        .flat_map(|t| (0..10_000).map(move |i| format!("t{t}-{i}").into_bytes()))
        .collect();
    let mut actual = all;
    expected.sort();
    actual.sort();
    assert_eq!(expected, actual);
}

#[test]
fn close_open_round_trip_preserves_live_values() {
    let dir = tempdir("roundtrip");
    let prefix = dir.join("shard");

    {
        let shard = Shard::open(&prefix, options(128)).unwrap();
        shard.put(b"a", b"1").unwrap();
        shard.put(b"a", b"2").unwrap();
        shard.put(b"b", b"x").unwrap();
        shard.remove_first_equal(b"a", b"1").unwrap();
        shard.close().unwrap();
    }

    let reopened = Shard::open(
        &prefix,
        ShardOptions {
            create_if_missing: false,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(reopened.get_all(b"a").unwrap(), Some(vec![b"2".to_vec()]));
    assert_eq!(reopened.get_all(b"b").unwrap(), Some(vec![b"x".to_vec()]));
    assert_eq!(reopened.get_all(b"missing").unwrap(), None);
}

#[test]
fn flipped_stats_byte_fails_reopen_with_corruption() {
    let dir = tempdir("checksum");
    let prefix = dir.join("shard");

    {
        let shard = Shard::open(&prefix, options(128)).unwrap();
        shard.put(b"k", b"v").unwrap();
        shard.close().unwrap();
    }

    let stats_path = {
        let mut p = prefix.clone().into_os_string();
        p.push(".stats");
        PathBuf::from(p)
    };
    let mut bytes = std::fs::read(&stats_path).unwrap();
    bytes[0] ^= 0xFF;
    std::fs::write(&stats_path, &bytes).unwrap();

    let reopened = Shard::open(
        &prefix,
        ShardOptions {
            create_if_missing: false,
            ..Default::default()
        },
    );
    assert!(reopened.is_err());
}

#[test]
fn readonly_shard_rejects_mutations_and_skips_rewrite() {
    let dir = tempdir("readonly");
    let prefix = dir.join("shard");

    {
        let shard = Shard::open(&prefix, options(128)).unwrap();
        shard.put(b"k", b"v").unwrap();
        shard.close().unwrap();
    }

    let shard = Shard::open(
        &prefix,
        ShardOptions {
            create_if_missing: false,
            readonly: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(shard.put(b"k", b"v2").is_err());
    assert_eq!(shard.get_all(b"k").unwrap(), Some(vec![b"v".to_vec()]));
}
