//! End-to-end coverage of the three write strategies against a single
//! reader, plus reopen-from-image round trips.

use std::sync::Arc;
use ulayfs::{File, UlayfsError};
use ulayfs_pmem::{NullPersist, RecordingPersist};

fn read_all(file: &File, len: usize, offset: u64) -> Vec<u8> {
    let mut buf = vec![0_u8; len];
    let got = file.pread(&mut buf, offset).expect("pread");
    buf.truncate(got);
    buf
}

#[test]
fn create_and_aligned_write() {
    let file = File::create_volatile(256).expect("create");
    let data = vec![b'A'; 4096];
    assert_eq!(file.pwrite(&data, 0).expect("pwrite"), 4096);
    assert_eq!(file.size(), 4096);
    assert_eq!(read_all(&file, 4096, 0), data);
}

#[test]
fn single_block_unaligned_write() {
    let file = File::create_volatile(256).expect("create");
    // Zero-initialized 4096-byte file.
    file.pwrite(&[0_u8; 4096], 0).expect("prime");
    assert_eq!(file.pwrite(b"test str\n", 100).expect("pwrite"), 9);

    assert_eq!(read_all(&file, 9, 100), b"test str\n");

    // The rest of the block stays zero.
    let whole = read_all(&file, 4096, 0);
    assert!(whole[..100].iter().all(|b| *b == 0));
    assert_eq!(&whole[100..109], b"test str\n");
    assert!(whole[109..].iter().all(|b| *b == 0));
}

#[test]
fn multi_block_unaligned_write_straddles_three_blocks() {
    let file = File::create_volatile(256).expect("create");
    file.pwrite(&[0_u8; 12288], 0).expect("prime");

    let pattern: Vec<u8> = b"0123456789abcdef"
        .iter()
        .copied()
        .cycle()
        .take(8192)
        .collect();
    assert_eq!(file.pwrite(&pattern, 100).expect("pwrite"), 8192);

    let out = read_all(&file, 12288, 0);
    assert_eq!(out.len(), 12288);
    assert!(out[..100].iter().all(|b| *b == 0));
    assert_eq!(&out[100..8292], &pattern[..]);
    assert!(out[8292..].iter().all(|b| *b == 0));
}

#[test]
fn unaligned_write_into_holes_zero_fills_edges() {
    let file = File::create_volatile(256).expect("create");
    // No priming: every source block is a hole.
    assert_eq!(file.pwrite(b"hole", 5000).expect("pwrite"), 4);
    let out = read_all(&file, 5004, 0);
    assert!(out[..5000].iter().all(|b| *b == 0));
    assert_eq!(&out[5000..], b"hole");
}

#[test]
fn overwrite_is_last_writer_wins() {
    let file = File::create_volatile(256).expect("create");
    file.pwrite(&vec![b'x'; 8192], 0).expect("first");
    file.pwrite(&vec![b'y'; 100], 4000).expect("second");

    let out = read_all(&file, 8192, 0);
    assert!(out[..4000].iter().all(|b| *b == b'x'));
    assert!(out[4000..4100].iter().all(|b| *b == b'y'));
    assert!(out[4100..].iter().all(|b| *b == b'x'));
}

#[test]
fn reads_clamp_to_logical_size() {
    let file = File::create_volatile(256).expect("create");
    file.pwrite(b"abc", 0).expect("pwrite");
    assert_eq!(file.size(), 3);

    let mut buf = [0_u8; 16];
    assert_eq!(file.pread(&mut buf, 0).expect("pread"), 3);
    assert_eq!(file.pread(&mut buf, 3).expect("pread at end"), 0);
    assert_eq!(file.pread(&mut buf, 100).expect("pread past end"), 0);
}

#[test]
fn large_write_uses_indirect_commit() {
    // 70 blocks exceeds the inline commit's 64-block bound, forcing the
    // log entry path end to end.
    let file = File::create_volatile(512).expect("create");
    let data: Vec<u8> = (0..70 * 4096).map(|i| (i % 251) as u8).collect();
    assert_eq!(file.pwrite(&data, 4096).expect("pwrite"), data.len());
    assert_eq!(read_all(&file, data.len(), 4096), data);
    // The block before the write is an untouched hole.
    assert!(read_all(&file, 4096, 0).iter().all(|b| *b == 0));
}

#[test]
fn out_of_space_surfaces_enospc() {
    let file = File::create_volatile(16).expect("create");
    let big = vec![0_u8; 32 * 4096];
    let err = file.pwrite(&big, 0).expect_err("must exhaust");
    assert!(matches!(err, UlayfsError::OutOfSpace));
    assert_eq!(err.to_errno(), libc::ENOSPC);

    // The failed write stays invisible and the file still works.
    assert_eq!(file.size(), 0);
    assert_eq!(file.pwrite(b"ok", 0).expect("small write"), 2);
    assert_eq!(read_all(&file, 2, 0), b"ok");
}

#[test]
fn image_round_trip_preserves_contents() {
    let persist = Arc::new(RecordingPersist::new(256));
    let file = File::create(256, persist.clone()).expect("create");
    file.pwrite(&vec![7_u8; 4096], 0).expect("aligned");
    file.pwrite(b"edge bytes", 6000).expect("unaligned");

    let reopened =
        File::open_image(persist.image_now(), Arc::new(NullPersist)).expect("reopen");
    assert_eq!(reopened.size(), file.size());
    assert_eq!(read_all(&reopened, 4096, 0), vec![7_u8; 4096]);
    assert_eq!(read_all(&reopened, 10, 6000), b"edge bytes");
}

#[test]
fn file_backed_create_and_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("backing");

    {
        let file = File::create_at(&path, 256).expect("create");
        file.pwrite(&vec![b'D'; 4096], 0).expect("aligned");
        file.pwrite(b"durable", 4200).expect("unaligned");
    }

    let reopened = File::open_at(&path).expect("reopen");
    assert_eq!(read_all(&reopened, 4096, 0), vec![b'D'; 4096]);
    assert_eq!(read_all(&reopened, 7, 4200), b"durable");
}

#[test]
fn open_garbage_image_aborts_on_signature_check() {
    let image = vec![0x5A_u8; 256 * 4096];
    let outcome = std::panic::catch_unwind(move || {
        let _ = File::open_image(image, Arc::new(NullPersist));
    });
    assert!(outcome.is_err(), "garbage signature must abort the open");
}
