use kernel_sync::PublishOnce;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[test]
fn empty_until_set() {
    let cell = PublishOnce::<u32>::new();
    assert!(cell.get().is_none());
    assert!(!cell.is_published());
    assert!(cell.wait().is_none());

    assert_eq!(cell.set(7), Ok(&7));
    assert_eq!(cell.get(), Some(&7));
    assert!(cell.is_published());
}

#[test]
fn second_set_is_refused_and_returns_value() {
    let cell = PublishOnce::new();
    cell.set(String::from("coherent")).unwrap();

    let rejected = cell.set(String::from("non-coherent")).unwrap_err();
    assert_eq!(rejected, "non-coherent");
    assert_eq!(cell.get().map(String::as_str), Some("coherent"));
}

#[test]
fn exactly_one_racing_writer_wins() {
    let cell = Arc::new(PublishOnce::new());
    let wins = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cell = Arc::clone(&cell);
            let wins = Arc::clone(&wins);
            thread::spawn(move || {
                if cell.set(i).is_ok() {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
                *cell.wait().expect("published by someone")
            })
        })
        .collect();

    let seen: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert!(seen.iter().all(|v| Some(v) == cell.get()));
}

#[test]
fn published_value_is_dropped() {
    struct Counted(Arc<AtomicUsize>);
    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));
    {
        let cell = PublishOnce::new();
        let _ = cell.set(Counted(Arc::clone(&drops)));
        // The refused value is dropped by the caller immediately.
        drop(cell.set(Counted(Arc::clone(&drops))));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}
