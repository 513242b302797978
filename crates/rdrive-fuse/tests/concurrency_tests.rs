//! Concurrent access to one bridge from many threads.

mod common;

use common::{TestFs, p};
use rdrive_core::testing::Op;
use rdrive_mount::RemoteErrorCategory;
use rdrive_mount::testing::{assert_bytes_equal, assert_category, random_bytes};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_concurrent_writers_on_disjoint_paths() {
    let t = TestFs::builder().pool_size(3).build();
    let payloads: Vec<Vec<u8>> = (0..8).map(|i| random_bytes(1000 + i * 1500)).collect();

    thread::scope(|s| {
        for (i, data) in payloads.iter().enumerate() {
            let t = &t;
            s.spawn(move || t.write_file(&format!("/file-{i}.bin"), data));
        }
    });

    for (i, data) in payloads.iter().enumerate() {
        let path = format!("/file-{i}.bin");
        assert_bytes_equal(&t.store.file(&path).unwrap(), data, &path);
    }
    assert_eq!(t.names("/").len(), payloads.len());
    assert!(t.store.max_live_sessions() <= 3);
    assert_eq!(t.fs.handle_count(), 0);
}

#[test]
fn test_concurrent_closes_on_one_path_never_interleave() {
    let t = TestFs::new();
    t.store.put_file("/shared.bin", b"");
    let payloads: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 20_000]).collect();

    let handles: Vec<u64> = payloads
        .iter()
        .map(|data| {
            let fh = t.fs.open(&p("/shared.bin"), true, true).unwrap();
            t.write_all(fh, data);
            fh
        })
        .collect();

    thread::scope(|s| {
        for fh in &handles {
            let t = &t;
            s.spawn(move || t.fs.close(*fh).unwrap());
        }
    });

    let remote = t.store.file("/shared.bin").unwrap();
    assert!(
        payloads.contains(&remote),
        "remote object should be exactly one writer's buffer"
    );
    assert_eq!(t.store.calls(Op::WriteFull), payloads.len() as u64);
}

#[test]
fn test_readers_share_cached_metadata() {
    let t = TestFs::new();
    let data = random_bytes(30_000);
    t.store.put_file("/r.bin", &data);
    t.fs.get_attributes(&p("/r.bin")).unwrap();

    thread::scope(|s| {
        for _ in 0..6 {
            let t = &t;
            let data = &data;
            s.spawn(move || {
                assert_eq!(t.fs.get_attributes(&p("/r.bin")).unwrap().size, 30_000);
                assert_bytes_equal(&t.read_file("/r.bin"), data, "concurrent read");
            });
        }
    });

    assert_eq!(t.store.calls(Op::Stat), 1 + 6);
}

#[test]
fn test_listing_stays_consistent_under_mutation() {
    let t = TestFs::new();
    t.store.put_dir("/d");

    thread::scope(|s| {
        for worker in 0..4 {
            let t = &t;
            s.spawn(move || {
                for i in 0..10 {
                    let path = format!("/d/w{worker}-{i}.txt");
                    t.write_file(&path, path.as_bytes());
                    t.fs.list(&p("/d")).unwrap();
                    if i % 2 == 1 {
                        t.fs.delete(&p(&path)).unwrap();
                    }
                }
            });
        }
    });

    let names = t.names("/d");
    assert_eq!(names.len(), 4 * 5);
    assert!(names.iter().all(|n| {
        let i: usize = n.trim_end_matches(".txt").rsplit('-').next().unwrap().parse().unwrap();
        i % 2 == 0
    }));
}

#[test]
fn test_disjoint_paths_do_not_wait_on_slow_mutation() {
    let t = TestFs::builder().pool_size(2).build();
    t.store.put_dir("/slow");
    t.store.put_dir("/fast");
    // Overlapping primes leave two idle sessions
    t.store.set_latency(Duration::from_millis(50));
    thread::scope(|s| {
        s.spawn(|| t.names("/slow"));
        s.spawn(|| t.names("/fast"));
    });
    assert_eq!(t.fs.pool().idle_count(), 2);

    let (fh, _) = t.fs.create(&p("/slow/big.bin")).unwrap();
    t.fs.write(fh, 0, &random_bytes(10_000)).unwrap();
    t.store.set_latency(Duration::from_millis(300));

    thread::scope(|s| {
        let slow = s.spawn(|| t.fs.close(fh));
        thread::sleep(Duration::from_millis(50));
        let started = std::time::Instant::now();
        t.fs.mkdir(&p("/fast/sub")).unwrap();
        // Waiting behind the upload would add most of its latency
        assert!(started.elapsed() < Duration::from_millis(500));
        slow.join().unwrap().unwrap();
    });
}

#[test]
fn test_rename_and_delete_do_not_wait_on_another_handles_download() {
    let t = TestFs::new();
    let original = random_bytes(10_000);
    t.store.put_file("/big.bin", &original);
    t.store.put_file("/x.txt", b"x");
    let fh = t.fs.open(&p("/big.bin"), true, false).unwrap();
    t.store.delay_after(Op::ReadFull, Duration::from_millis(800));

    thread::scope(|s| {
        // First write downloads the object while holding the handle
        let writer = s.spawn(|| t.fs.write(fh, 0, b"patch"));
        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        t.fs.rename(&p("/x.txt"), &p("/y.txt"), false).unwrap();
        t.fs.delete(&p("/y.txt")).unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(400), "disjoint rename took {elapsed:?}");
        assert_eq!(writer.join().unwrap().unwrap(), 5);
    });

    t.fs.close(fh).unwrap();
    let mut expected = original;
    expected[..5].copy_from_slice(b"patch");
    assert_bytes_equal(&t.store.file("/big.bin").unwrap(), &expected, "patched object");
    assert!(!t.store.contains("/y.txt"));
}

#[test]
fn test_handle_follows_directory_rename_made_during_its_download() {
    let t = TestFs::new();
    t.store.put_file("/old/big.bin", &random_bytes(5000));
    let fh = t.fs.open(&p("/old/big.bin"), true, false).unwrap();
    t.store.delay_after(Op::ReadFull, Duration::from_millis(300));

    thread::scope(|s| {
        let writer = s.spawn(|| t.fs.write(fh, 0, b"moved"));
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        t.fs.rename(&p("/old"), &p("/new"), false).unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        writer.join().unwrap().unwrap();
    });

    t.fs.close(fh).unwrap();
    assert_eq!(&t.store.file("/new/big.bin").unwrap()[..5], b"moved");
    assert!(!t.store.contains("/old"));
}

#[test]
fn test_exhausted_pool_times_out() {
    let t = TestFs::builder()
        .pool_size(1)
        .acquire_timeout(Duration::from_millis(20))
        .build();
    t.store.put_file("/a.txt", b"a");
    t.store.put_file("/b.txt", b"b");
    t.store.set_latency(Duration::from_millis(200));

    thread::scope(|s| {
        let holder = s.spawn(|| t.fs.get_attributes(&p("/a.txt")));
        thread::sleep(Duration::from_millis(50));
        assert_category(t.fs.get_attributes(&p("/b.txt")), RemoteErrorCategory::Timeout, "pool exhausted");
        assert!(holder.join().unwrap().is_ok());
    });
    assert!(t.fs.pool().stats().acquire_timeout_count() >= 1);
}
