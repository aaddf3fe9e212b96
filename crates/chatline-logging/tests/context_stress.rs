//! Stress tests for session context under many threads

use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use chatline_logging::SessionContextGuard;

/// Guards on different threads never see each other's session
#[test]
fn test_concurrent_session_contexts() {
    const NUM_THREADS: usize = 32;
    const ITERATIONS: usize = 200;

    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|thread_id| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let user = format!("user-{thread_id}");
                barrier.wait();

                for _ in 0..ITERATIONS {
                    let _guard = SessionContextGuard::new(user.clone());
                    assert_eq!(SessionContextGuard::current_user_id(), Some(user.clone()));
                }
                assert!(SessionContextGuard::current().is_none());
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

/// Every guard gets a fresh session id
#[test]
fn test_session_ids_are_unique() {
    let ids = Arc::new(Mutex::new(HashSet::new()));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ids = Arc::clone(&ids);
            thread::spawn(move || {
                for _ in 0..500 {
                    let _guard = SessionContextGuard::new("alice");
                    let id = SessionContextGuard::current_session_id().unwrap();
                    assert!(ids.lock().unwrap().insert(id));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(ids.lock().unwrap().len(), 8 * 500);
}

/// Re-login inside a session and back out, many times over
#[test]
fn test_rapid_relogin() {
    let _outer = SessionContextGuard::new("alice");
    let outer = SessionContextGuard::current().unwrap();

    for i in 0..1000 {
        let _inner = SessionContextGuard::new(format!("guest-{i}"));
        assert_eq!(
            SessionContextGuard::current_user_id(),
            Some(format!("guest-{i}"))
        );
    }

    assert_eq!(SessionContextGuard::current(), Some(outer));
}
