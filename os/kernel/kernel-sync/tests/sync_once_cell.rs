use kernel_sync::SyncOnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn get_is_none_until_initialized() {
    let cell = SyncOnceCell::<u32>::new();
    assert!(cell.get().is_none());
    assert!(!cell.is_initialized());

    assert_eq!(*cell.get_or_init(|| 7), 7);
    assert!(cell.is_initialized());
    assert_eq!(cell.get(), Some(&7));

    // second initializer is ignored
    assert_eq!(*cell.get_or_init(|| 9), 7);
}

#[test]
fn concurrent_initializers_run_once() {
    static CELL: SyncOnceCell<usize> = SyncOnceCell::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let threads = 8;
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let runs = Arc::clone(&runs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                *CELL.get_or_init(|| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    i
                })
            })
        })
        .collect();

    let seen: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(seen.windows(2).all(|w| w[0] == w[1]));
}
