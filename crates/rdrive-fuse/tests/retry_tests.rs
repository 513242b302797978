//! Failure handling through the bridge: transient retries, semantic errors
//! surfaced on first occurrence, Fatal suspension, errno translation.

mod common;

use common::{TestFs, p};
use rdrive_core::ErrorKind;
use rdrive_core::testing::Op;
use rdrive_fuse::HandlePhase;
use rdrive_mount::RemoteErrorCategory;
use rdrive_mount::testing::assert_category;

const ATTEMPTS: u32 = 3;

fn retrying() -> TestFs {
    TestFs::builder().retry_attempts(ATTEMPTS).build()
}

#[test]
fn test_transient_list_failures_below_limit_are_invisible() {
    let t = retrying();
    t.store.put_file("/a.txt", b"a");
    t.store.fail_next(Op::List, ErrorKind::Transient, ATTEMPTS as usize - 1);

    assert_eq!(t.names("/"), ["a.txt"]);
    assert_eq!(t.store.calls(Op::List), u64::from(ATTEMPTS));
    assert_eq!(t.fs.pool().stats().retry_count(), u64::from(ATTEMPTS) - 1);
}

#[test]
fn test_transient_list_failures_at_limit_surface() {
    let t = retrying();
    t.store.fail_next(Op::List, ErrorKind::Transient, ATTEMPTS as usize);

    let result = t.fs.list(&p("/"));
    let err = result.as_ref().err().map(rdrive_fuse::FsError::to_errno);
    assert_category(result, RemoteErrorCategory::Transient, "exhausted retries");
    assert_eq!(err, Some(libc::EIO));
    assert_eq!(t.store.calls(Op::List), u64::from(ATTEMPTS));
}

#[test]
fn test_connect_failures_below_limit_are_invisible() {
    let t = retrying();
    t.store.put_file("/a.txt", b"abc");
    t.store.fail_next(Op::Connect, ErrorKind::Transient, ATTEMPTS as usize - 1);

    assert_eq!(t.fs.get_attributes(&p("/a.txt")).unwrap().size, 3);
    assert_eq!(t.store.calls(Op::Connect), u64::from(ATTEMPTS));
    assert_eq!(t.store.calls(Op::Stat), 1);
}

#[test]
fn test_connect_failures_at_limit_surface() {
    let t = retrying();
    t.store.put_file("/a.txt", b"abc");
    t.store.fail_next(Op::Connect, ErrorKind::Timeout, ATTEMPTS as usize);

    assert_category(t.fs.get_attributes(&p("/a.txt")), RemoteErrorCategory::Timeout, "connect timeout");
    assert_eq!(t.store.calls(Op::Stat), 0);

    // The next request starts with a fresh budget
    assert_eq!(t.fs.get_attributes(&p("/a.txt")).unwrap().size, 3);
}

#[test]
fn test_not_found_is_not_retried() {
    let t = retrying();
    assert_category(t.fs.get_attributes(&p("/missing")), RemoteErrorCategory::NotFound, "stat missing");
    assert_eq!(t.store.calls(Op::Stat), 1);

    t.store.put_file("/present", b"x");
    t.store.fail_next(Op::Stat, ErrorKind::NotFound, 1);
    assert_category(t.fs.get_attributes(&p("/present")), RemoteErrorCategory::NotFound, "injected not found");
    assert_eq!(t.store.calls(Op::Stat), 2);
}

#[test]
fn test_not_empty_is_not_retried() {
    let t = retrying();
    t.store.put_file("/d/f.txt", b"x");

    let result = t.fs.rmdir(&p("/d"));
    assert_eq!(result.as_ref().err().map(rdrive_fuse::FsError::to_errno), Some(libc::ENOTEMPTY));
    assert_category(result, RemoteErrorCategory::NotEmpty, "rmdir non-empty");
    assert_eq!(t.store.calls(Op::Rmdir), 1);
}

#[test]
fn test_semantic_errors_surface_on_first_attempt() {
    let t = retrying();
    t.store.put_dir("/d");

    assert_category(t.fs.mkdir(&p("/d")), RemoteErrorCategory::AlreadyExists, "mkdir existing");
    assert_eq!(t.store.calls(Op::Mkdir), 1);

    t.store.fail_next(Op::Delete, ErrorKind::AccessDenied, 1);
    t.store.put_file("/locked.txt", b"x");
    assert_category(t.fs.delete(&p("/locked.txt")), RemoteErrorCategory::AccessDenied, "delete denied");
    assert_eq!(t.store.calls(Op::Delete), 1);
    assert!(t.store.contains("/locked.txt"));
}

#[test]
fn test_transient_upload_failures_are_retried() {
    let t = retrying();
    let (fh, _) = t.fs.create(&p("/f.txt")).unwrap();
    t.fs.write(fh, 0, b"payload").unwrap();
    t.store.fail_next(Op::WriteFull, ErrorKind::Transient, ATTEMPTS as usize - 1);

    t.fs.close(fh).unwrap();

    assert_eq!(t.store.file("/f.txt").unwrap(), b"payload");
    assert_eq!(t.store.calls(Op::WriteFull), u64::from(ATTEMPTS));
}

#[test]
fn test_quota_failure_keeps_buffer_for_retry() {
    let t = retrying();
    let (fh, _) = t.fs.create(&p("/f.txt")).unwrap();
    t.fs.write(fh, 0, b"payload").unwrap();
    t.store.fail_next(Op::WriteFull, ErrorKind::QuotaExceeded, 1);

    let result = t.fs.close(fh);
    assert_eq!(result.as_ref().err().map(rdrive_fuse::FsError::to_errno), Some(libc::ENOSPC));
    assert_eq!(t.store.calls(Op::WriteFull), 1);
    assert_eq!(t.fs.handle_phase(fh), Some(HandlePhase::Dirty));
    assert_eq!(t.store.file("/f.txt").unwrap(), b"");

    t.fs.close(fh).unwrap();
    assert_eq!(t.store.file("/f.txt").unwrap(), b"payload");
    assert_eq!(t.fs.handle_count(), 0);
    assert_eq!(t.fs.transfer_stats().snapshot().upload_failures, 1);
}

#[test]
fn test_fatal_error_suspends_backend_until_reset() {
    let t = retrying();
    t.store.put_file("/a/x.txt", b"x");
    t.store.put_file("/b/y.txt", b"y");
    t.store.fail_next(Op::List, ErrorKind::Fatal, 1);

    let result = t.fs.list(&p("/a"));
    assert_eq!(result.as_ref().err().map(rdrive_fuse::FsError::to_errno), Some(libc::EPERM));
    assert_category(result, RemoteErrorCategory::Fatal, "fatal list");
    assert!(t.fs.pool().is_suspended());

    let lists = t.store.calls(Op::List);
    let connects = t.store.calls(Op::Connect);
    assert_category(t.fs.list(&p("/b")), RemoteErrorCategory::Fatal, "suspended list");
    assert_eq!(t.store.calls(Op::List), lists);
    assert_eq!(t.store.calls(Op::Connect), connects);

    t.fs.pool().reset();
    assert_eq!(t.names("/b"), ["y.txt"]);
}

#[test]
fn test_failed_open_has_no_side_effects() {
    let t = retrying();
    assert_category(t.fs.open(&p("/missing"), false, false), RemoteErrorCategory::NotFound, "open missing");
    assert_eq!(t.fs.handle_count(), 0);

    t.store.put_dir("/d");
    assert_category(t.fs.open(&p("/d"), true, false), RemoteErrorCategory::IsDirectory, "open dir");
    assert_eq!(t.fs.handle_count(), 0);
}

#[test]
fn test_download_is_retried_from_scratch() {
    let t = TestFs::builder().without_range_reads().retry_attempts(ATTEMPTS).build();
    t.store.put_file("/f.txt", b"0123456789");
    t.store.fail_next(Op::ReadFull, ErrorKind::Transient, 1);

    let fh = t.fs.open(&p("/f.txt"), false, false).unwrap();
    assert_eq!(t.read_to_end(fh), b"0123456789");
    assert_eq!(t.store.calls(Op::ReadFull), 2);
    t.fs.close(fh).unwrap();
}
