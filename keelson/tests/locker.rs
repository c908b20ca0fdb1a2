//! Cooperative lock contention across three coroutines.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keelson::{lock, start_loop, sync};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn overlapping_key_sets_never_run_together() {
    let lp = start_loop();
    let held = Arc::new(Mutex::new(HashSet::<&'static str>::new()));
    let (done_tx, done_rx) = flume::bounded::<&'static str>(3);

    let tasks: [(&'static str, Vec<&'static str>); 3] = [
        ("ab", vec!["A", "B"]),
        ("bc", vec!["B", "C"]),
        ("a", vec!["A"]),
    ];

    for (name, keys) in tasks {
        let held = Arc::clone(&held);
        let done = done_tx.clone();
        lp.execute(move || {
            let guard = lock(keys.clone());

            // no overlapping holder may exist while we hold the keys
            {
                let mut audit = held.lock().unwrap();
                for key in &keys {
                    assert!(audit.insert(key), "key {key} already held");
                }
            }

            // hold the keys across a suspension so the others interleave
            sync(|| std::thread::sleep(Duration::from_millis(20)))?;

            {
                let mut audit = held.lock().unwrap();
                for key in &keys {
                    audit.remove(key);
                }
            }
            drop(guard);
            let _ = done.send(name);
            Ok(())
        })
        .unwrap();
    }

    // every locker completes exactly once, so no deadlock and no starvation
    let mut finished: Vec<&str> = (0..3)
        .map(|_| done_rx.recv_timeout(WAIT).unwrap())
        .collect();
    finished.sort_unstable();
    assert_eq!(finished, vec!["a", "ab", "bc"]);
    assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(held.lock().unwrap().is_empty());

    lp.cancel();
}
