use kernel_sync::SpinLock;
use std::{panic, thread};

#[test]
fn basic_lock_and_raii() {
    let l = SpinLock::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());

    // lock again; previous drop must have unlocked
    {
        let mut g = l.lock();
        *g += 1;
        assert_eq!(*g, 42);
    }
}

#[test]
fn try_lock_semantics() {
    let l = SpinLock::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert_eq!(**g1.as_ref().unwrap(), 1);

    // while held, try_lock must fail
    assert!(l.try_lock().is_none());

    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn with_lock_guards_a_free_stack() {
    let l = SpinLock::new(vec![3_u32, 2, 1]);
    let popped = l.with_lock(Vec::pop);
    assert_eq!(popped, Some(1));
    l.with_lock(|s| s.push(7));
    assert_eq!(l.lock().as_slice(), &[3, 2, 7]);
}

#[test]
fn get_mut_allows_direct_mutation() {
    let mut l = SpinLock::new(vec![1, 2, 3]);
    l.get_mut().push(4);
    assert_eq!(l.lock().as_slice(), &[1, 2, 3, 4]);
}

#[test]
fn contended_pops_and_pushes_never_duplicate() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    let threads = 8;
    let iters = 2_000;

    let stack = Arc::new(SpinLock::new((0..64_u32).collect::<Vec<_>>()));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let stack = Arc::clone(&stack);
        let in_cs = Arc::clone(&in_cs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                let item = stack.with_lock(|s| {
                    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "mutual exclusion violated");
                    let item = s.pop();
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                    item
                });
                thread::yield_now();
                if let Some(item) = item {
                    stack.with_lock(|s| s.push(item));
                }
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    let mut items = stack.with_lock(|s| s.clone());
    items.sort_unstable();
    assert_eq!(items, (0..64).collect::<Vec<_>>());
    assert_eq!(in_cs.load(Ordering::SeqCst), 0);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    let val = l.with_lock(|v| *v);
    assert_eq!(val, 123);
}

/// Spot-check a concrete instantiation compiles as Sync.
#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = SpinLock::new(0u8);
    takes_sync(&l);
}
