//! Property tests for the invariants spec §8 calls out directly: round-trip
//! (committed key/value pairs match a reference map) and lex order (every
//! page reachable from the active meta yields strictly ascending keys).
//! Grounded on seemantr-rdb's `#[quickcheck]`-attribute style, but driven
//! against real put/delete sequences through the engine rather than a
//! mechanical encode/decode grid.

use std::collections::BTreeMap;

use quickcheck_macros::quickcheck;
use stavedb::Database;

/// A short, bounded key/value so quickcheck doesn't spend its budget on
/// values near the crate's 32 KiB key / 2 GiB value ceilings (those limits
/// get their own focused test in `tests/scenarios.rs`).
fn clamp(mut bytes: Vec<u8>, max_len: usize) -> Vec<u8> {
    bytes.truncate(max_len);
    bytes
}

#[quickcheck]
fn put_delete_round_trip_matches_reference_map(ops: Vec<(bool, Vec<u8>, Vec<u8>)>) -> bool {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_default(dir.path().join("t.db")).unwrap();
    let mut reference: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        for (is_delete, raw_key, raw_value) in &ops {
            let mut key = clamp(raw_key.clone(), 64);
            if key.is_empty() {
                key.push(0);
            }
            if *is_delete {
                b.delete(&key)?;
                reference.remove(&key);
            } else {
                let value = clamp(raw_value.clone(), 128);
                b.put(&key, &value)?;
                reference.insert(key, value);
            }
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let b = tx.bucket(b"b")?;

        for (k, v) in &reference {
            if b.get(k).unwrap().as_ref() != Some(v) {
                return Ok(false);
            }
        }

        let mut cursor = b.cursor();
        let mut item = cursor.first()?;
        let mut last_key: Option<Vec<u8>> = None;
        let mut seen = 0usize;
        while let Some((key, value)) = item {
            if let Some(lk) = &last_key {
                if key <= *lk {
                    return Ok(false);
                }
            }
            if reference.get(&key) != value.as_ref() {
                return Ok(false);
            }
            last_key = Some(key);
            seen += 1;
            item = cursor.next()?;
        }
        Ok(seen == reference.len())
    })
    .unwrap()
}

#[quickcheck]
fn reader_opened_before_a_commit_never_observes_it(
    initial: Vec<(Vec<u8>, Vec<u8>)>,
    after: Vec<(Vec<u8>, Vec<u8>)>,
) -> bool {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_default(dir.path().join("t.db")).unwrap();

    let initial_keys: Vec<Vec<u8>> = db
        .update(|tx| {
            let b = tx.create_bucket(b"b")?;
            let mut keys = Vec::new();
            for (raw_key, raw_value) in &initial {
                let mut key = clamp(raw_key.clone(), 64);
                if key.is_empty() {
                    key.push(0);
                }
                let value = clamp(raw_value.clone(), 128);
                b.put(&key, &value)?;
                keys.push(key);
            }
            Ok(keys)
        })
        .unwrap();

    let reader = db.begin(false).unwrap();
    let snapshot: BTreeMap<Vec<u8>, Option<Vec<u8>>> = {
        let b = reader.bucket(b"b").unwrap();
        initial_keys.iter().map(|k| (k.clone(), b.get(k).unwrap())).collect()
    };

    db.update(|tx| {
        let b = tx.bucket(b"b")?;
        for (raw_key, raw_value) in &after {
            let mut key = clamp(raw_key.clone(), 64);
            if key.is_empty() {
                key.push(0);
            }
            let value = clamp(raw_value.clone(), 128);
            b.put(&key, &value)?;
        }
        for k in &initial_keys {
            b.delete(k)?;
        }
        Ok(())
    })
    .unwrap();

    let still_matches = {
        let b = reader.bucket(b"b").unwrap();
        initial_keys.iter().all(|k| b.get(k).unwrap() == snapshot[k])
    };
    reader.rollback().unwrap();
    still_matches
}
