use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use comlogger::store::{LastValueStore, StorePolicy, WriteOutcome, LAST_VALUE_FILE_NAME};
use tokio_test::assert_ok;

fn policy() -> StorePolicy {
    StorePolicy {
        min_free_bytes: 0,
        attempts: 5,
        retry_delay: Duration::from_millis(1),
    }
}

#[test]
fn concurrent_writers_never_expose_partial_content() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LastValueStore::new(dir.path(), policy()));
    let line_a = "+11.1111,".repeat(200);
    let line_b = "-22.2222,".repeat(300);
    let expected_a = format!("{line_a}\n");
    let expected_b = format!("{line_b}\n");

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let path = store.path().to_path_buf();
        let done = Arc::clone(&done);
        let (a, b) = (expected_a.clone(), expected_b.clone());
        thread::spawn(move || {
            let mut observed = 0u32;
            while !done.load(Ordering::Acquire) {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    assert!(
                        content == a || content == b,
                        "torn read of {} bytes",
                        content.len()
                    );
                    observed += 1;
                }
            }
            observed
        })
    };

    let writers: Vec<_> = [line_a, line_b]
        .into_iter()
        .map(|line| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..200 {
                    assert_eq!(store.write(&line).unwrap(), WriteOutcome::Written);
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }
    done.store(true, Ordering::Release);
    assert!(reader.join().unwrap() > 0);

    let last = std::fs::read_to_string(store.path()).unwrap();
    assert!(last == expected_a || last == expected_b);
    let stray = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() != LAST_VALUE_FILE_NAME)
        .count();
    assert_eq!(stray, 0, "temporary files left behind");
}

#[test]
fn two_stores_on_one_folder_share_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let first = LastValueStore::new(dir.path(), policy());
    let second = LastValueStore::new(dir.path(), policy());
    assert_ok!(first.write("one"));
    assert_ok!(second.write("two"));
    assert_eq!(first.read().unwrap().as_deref(), Some("two"));
}
