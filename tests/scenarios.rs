//! Integration tests covering the concrete scenarios spec §8 walks through:
//! file layout on create, cross-transaction get, cursor seek, bulk
//! delete/freelist reclamation, concurrent open, and key/value limits.

use std::time::Duration;

use stavedb::{Database, Error, Options};

#[test]
fn top_level_keys_survive_commit_even_when_small_enough_to_look_inlinable() {
    // A handful of small keys put directly at the database root (outside any
    // named bucket) serialize to well under page_size/4 - the same size test
    // the inline-bucket optimization uses for a *nested* bucket's root. The
    // top-level root has no parent leaf entry to pack an inline payload into,
    // so it must always keep (or get) a real page instead.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.db");
    {
        let db = Database::open_default(&path).unwrap();
        db.update(|tx| {
            let root = tx.root_bucket();
            root.put(b"a", b"1")?;
            root.put(b"b", b"2")?;
            Ok(())
        })
        .unwrap();
    }
    let db = Database::open_default(&path).unwrap();
    db.view(|tx| {
        let root = tx.root_bucket();
        assert_eq!(root.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(root.get(b"b").unwrap(), Some(b"2".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn fresh_file_has_four_pages_with_expected_meta_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.db");
    let db = Database::open(&path, Options { page_size: 4096, ..Default::default() }).unwrap();

    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len, 4096 * 4);

    let buf = std::fs::read(&path).unwrap();
    // meta page 0's body starts at offset 16; magic is the first 4 LE bytes.
    assert_eq!(&buf[16..20], &0xED0CDAEDu32.to_le_bytes());
    assert_eq!(&buf[20..24], &2u32.to_le_bytes());

    drop(db);
}

#[test]
fn bulk_put_then_read_in_later_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_default(dir.path().join("a.db")).unwrap();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        for i in 0..200u32 {
            b.put(format!("k{i}").as_bytes(), format!("value{i}").as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let b = tx.bucket(b"b")?;
        assert_eq!(b.get(b"k0").unwrap(), Some(b"value0".to_vec()));
        assert_eq!(b.get(b"k199").unwrap(), Some(b"value199".to_vec()));
        assert_eq!(b.get(b"k200").unwrap(), None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_seek_lands_on_exact_or_next_greater_key() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_default(dir.path().join("a.db")).unwrap();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        b.put(b"a", b"1")?;
        b.put(b"b", b"2")?;
        b.put(b"c", b"3")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let b = tx.bucket(b"b")?;
        let mut cursor = b.cursor();
        assert_eq!(cursor.seek(b"b").unwrap(), Some((b"b".to_vec(), Some(b"2".to_vec()))));
        assert_eq!(cursor.seek(b"bb").unwrap(), Some((b"c".to_vec(), Some(b"3".to_vec()))));
        assert_eq!(cursor.seek(b"d").unwrap(), None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn deleting_half_of_a_large_tree_reclaims_pages_once_readers_close() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_default(dir.path().join("a.db")).unwrap();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        for i in 0..10_000u32 {
            b.put(format!("k{i:06}").as_bytes(), format!("v{i:06}").as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    // Hold a reader open across the delete so its pages stay pending rather
    // than immediately reclaimable.
    let reader = db.begin(false).unwrap();

    let before = db.stats();
    db.update(|tx| {
        let b = tx.bucket(b"b")?;
        for i in (0..10_000u32).step_by(2) {
            b.delete(format!("k{i:06}").as_bytes())?;
        }
        Ok(())
    })
    .unwrap();
    let after_delete_reader_open = db.stats();
    assert!(
        after_delete_reader_open.pending_page_count > 0,
        "pages freed while a reader from before the delete is still open should be pending, not free"
    );
    assert_eq!(
        after_delete_reader_open.free_page_count, before.free_page_count,
        "the free set shouldn't grow while the old reader can still see those pages"
    );

    let pending_after_delete = after_delete_reader_open.pending_page_count;
    reader.rollback().unwrap();

    // Pending pages graduate to free once a writer commits whose own read
    // snapshot postdates the txid that freed them; since every transaction
    // (including the committing writer itself) registers as a reader of its
    // own pre-commit snapshot, releasing the delete's big batch takes two
    // more commits (one to make its txid the oldest visible snapshot, one
    // more to actually release it) and each of those commits frees a
    // handful of its own pages that won't be released until later still.
    for _ in 0..2 {
        db.update(|tx| {
            tx.bucket(b"b")?.put(b"zzz-marker", b"v")?;
            Ok(())
        })
        .unwrap();
    }
    let after_reader_closed = db.stats();
    assert!(
        after_reader_closed.pending_page_count < pending_after_delete,
        "the delete's large batch of pending pages should have been released by now"
    );
    assert!(after_reader_closed.free_page_count > before.free_page_count);
}

/// Regression test for a leak where emptying a leaf (or collapsing a
/// single-child branch root) during rebalance detached the node from its
/// parent without ever freeing its old on-disk page: repeating an
/// insert-then-delete-everything cycle used to grow the file without bound
/// because every cycle's pages fell outside {tree, freelist, meta, pending}
/// and so could never be reused.
#[test]
fn repeated_full_insert_delete_cycles_reuse_pages_instead_of_growing_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.db");
    let db = Database::open_default(&path).unwrap();

    db.update(|tx| {
        tx.create_bucket(b"b")?;
        Ok(())
    })
    .unwrap();

    let run_cycle = |db: &Database| {
        db.update(|tx| {
            let b = tx.bucket(b"b")?;
            for i in 0..2_000u32 {
                b.put(format!("k{i:06}").as_bytes(), format!("v{i:06}").as_bytes())?;
            }
            Ok(())
        })
        .unwrap();
        db.update(|tx| {
            let b = tx.bucket(b"b")?;
            for i in 0..2_000u32 {
                b.delete(format!("k{i:06}").as_bytes())?;
            }
            Ok(())
        })
        .unwrap();
        // No reader is ever held open across a cycle, so two follow-up
        // commits are enough to drain this cycle's pending pages to free.
        for _ in 0..2 {
            db.update(|tx| {
                tx.bucket(b"b")?.put(b"marker", b"v")?;
                Ok(())
            })
            .unwrap();
        }
    };

    run_cycle(&db);
    let size_after_first_cycle = std::fs::metadata(&path).unwrap().len();
    let free_after_first_cycle = db.stats().free_page_count;
    assert!(free_after_first_cycle > 0, "first cycle's pages should have drained to the free set");

    for _ in 0..4 {
        run_cycle(&db);
    }
    let size_after_later_cycles = std::fs::metadata(&path).unwrap().len();

    assert_eq!(
        size_after_later_cycles, size_after_first_cycle,
        "repeated insert/delete cycles should reuse reclaimed pages, not grow the file"
    );
}

/// Regression test: `deleteBucket` must recursively free a nested
/// sub-bucket's own pages, not just the pages of the bucket it was called
/// directly on.
#[test]
fn delete_bucket_frees_nested_sub_bucket_pages_too() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.db");
    let db = Database::open_default(&path).unwrap();

    db.update(|tx| {
        let outer = tx.create_bucket(b"outer")?;
        let inner = outer.create_bucket(b"inner")?;
        // Enough entries that the nested bucket gets a real (non-inline) root.
        for i in 0..2_000u32 {
            inner.put(format!("k{i:06}").as_bytes(), format!("v{i:06}").as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        tx.delete_bucket(b"outer")?;
        Ok(())
    })
    .unwrap();
    // Drain this transaction's own pending pages to free, same as the cycle
    // helper above.
    for _ in 0..2 {
        db.update(|tx| {
            tx.create_bucket_if_not_exists(b"marker")?;
            Ok(())
        })
        .unwrap();
    }
    let free_after_delete = db.stats().free_page_count;

    let size_before_refill = std::fs::metadata(&path).unwrap().len();
    db.update(|tx| {
        let outer = tx.create_bucket(b"outer2")?;
        let inner = outer.create_bucket(b"inner2")?;
        for i in 0..2_000u32 {
            inner.put(format!("k{i:06}").as_bytes(), format!("v{i:06}").as_bytes())?;
        }
        Ok(())
    })
    .unwrap();
    let size_after_refill = std::fs::metadata(&path).unwrap().len();

    assert!(
        free_after_delete > 0,
        "deleting a bucket with a large nested sub-bucket should free a substantial number of pages"
    );
    assert_eq!(
        size_after_refill, size_before_refill,
        "rebuilding an equivalent bucket+sub-bucket tree should fit entirely in reclaimed pages"
    );
}

#[test]
fn a_second_writable_open_fails_while_the_first_holds_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.db");
    let db = Database::open_default(&path).unwrap();
    db.update(|tx| {
        tx.create_bucket(b"b")?;
        Ok(())
    })
    .unwrap();

    let second = Database::open(&path, Options { timeout: Some(Duration::from_millis(50)), ..Default::default() });
    assert!(second.is_err());

    db.close().unwrap();
    drop(db);

    // Upgrading after the first handle closes succeeds.
    let third = Database::open_default(&path).unwrap();
    third
        .view(|tx| {
            assert!(tx.bucket(b"b").is_ok());
            Ok(())
        })
        .unwrap();
}

#[test]
fn key_and_value_size_limits() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_default(dir.path().join("a.db")).unwrap();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        assert!(matches!(b.put(b"", b"v"), Err(Error::KeyRequired)));
        let huge_key = vec![0u8; 33 * 1024];
        assert!(matches!(b.put(&huge_key, b"v"), Err(Error::KeyTooLarge)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn reopen_fidelity_preserves_data_and_sequence_and_bumps_txid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.db");
    let txid_before;
    {
        let db = Database::open_default(&path).unwrap();
        db.update(|tx| {
            let b = tx.create_bucket(b"b")?;
            b.put(b"k", b"v")?;
            assert_eq!(b.next_sequence().unwrap(), 1);
            assert_eq!(b.next_sequence().unwrap(), 2);
            Ok(())
        })
        .unwrap();
        txid_before = db.stats().tx_id;
        db.close().unwrap();
    }

    let db = Database::open_default(&path).unwrap();
    db.view(|tx| {
        let b = tx.bucket(b"b")?;
        assert_eq!(b.get(b"k").unwrap(), Some(b"v".to_vec()));
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let b = tx.bucket(b"b")?;
        assert_eq!(b.next_sequence().unwrap(), 3, "sequence counter must survive the reopen");
        Ok(())
    })
    .unwrap();
    assert_eq!(db.stats().tx_id, txid_before + 1);
}
