//! Mutual exclusion and reader/writer exclusion across real threads.

use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use membrane_sync::{CooperativeMutex, LockKind, LockManager, SharedMutex};

const SETTLE: Duration = Duration::from_millis(50);

#[test]
fn test_second_acquirer_waits_for_release() {
    let mutex = Arc::new(SharedMutex::named("suite/exclusive"));
    let (events, log) = mpsc::channel();

    let first = mutex.acquire();
    assert!(mutex.try_acquire().is_none());

    let contender = {
        let mutex = Arc::clone(&mutex);
        let events = events.clone();
        thread::spawn(move || {
            let guard = mutex.acquire();
            events.send("second acquired").unwrap();
            guard.release();
        })
    };

    thread::sleep(SETTLE);
    assert!(mutex.is_locked());
    events.send("first released").unwrap();
    first.release();
    contender.join().unwrap();

    let order: Vec<&str> = log.try_iter().collect();
    assert_eq!(order, ["first released", "second acquired"]);
    let snapshot = mutex.metrics().snapshot();
    assert_eq!(snapshot.acquisitions, 2);
    assert_eq!(snapshot.contentions, 1);
}

#[test]
fn test_readers_share_and_writer_waits_for_all() {
    const READERS: usize = 4;
    let manager = LockManager::new();
    let lock = manager.rwlock("suite/readers").unwrap();
    let all_reading = Arc::new(Barrier::new(READERS + 1));
    let release = Arc::new(Barrier::new(READERS + 1));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let all_reading = Arc::clone(&all_reading);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                let guard = lock.read();
                all_reading.wait();
                release.wait();
                drop(guard);
            })
        })
        .collect();

    all_reading.wait();
    assert_eq!(lock.readers(), u32::try_from(READERS).unwrap());

    let (done, writer_done) = mpsc::channel();
    let writer = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            let guard = lock.write();
            done.send(()).unwrap();
            drop(guard);
        })
    };

    thread::sleep(SETTLE);
    assert!(writer_done.try_recv().is_err(), "writer ran alongside readers");

    release.wait();
    for reader in readers {
        reader.join().unwrap();
    }
    writer_done.recv_timeout(Duration::from_secs(5)).unwrap();
    writer.join().unwrap();
    assert_eq!(lock.readers(), 0);
    assert!(!lock.is_write_locked());
}

#[test]
fn test_reader_waits_for_writer() {
    let manager = LockManager::new();
    let lock = manager.rwlock("suite/writer-first").unwrap();
    let guard = lock.write();

    let (done, reader_done) = mpsc::channel();
    let reader = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            let read = lock.read();
            done.send(()).unwrap();
            drop(read);
        })
    };

    thread::sleep(SETTLE);
    assert!(reader_done.try_recv().is_err(), "reader ran alongside writer");
    drop(guard);
    reader_done.recv_timeout(Duration::from_secs(5)).unwrap();
    reader.join().unwrap();
}

#[test]
fn test_manager_rejects_kind_mismatch() {
    let manager = LockManager::new();
    let _shared = manager.mutex("suite/shared").unwrap();
    let err = manager.rwlock("suite/shared").unwrap_err();
    assert!(err.to_string().contains("suite/shared"));

    let kinds: Vec<LockKind> = manager.snapshot().iter().map(|s| s.kind).collect();
    assert_eq!(kinds, [LockKind::Mutex]);
}

#[tokio::test]
async fn test_cooperative_mutex_hands_over_between_tasks() {
    let mutex = Arc::new(CooperativeMutex::named("suite/cooperative"));
    let guard = mutex.acquire().await;

    let waiter = {
        let mutex = Arc::clone(&mutex);
        tokio::spawn(async move {
            let guard = mutex.acquire().await;
            guard.release();
        })
    };

    tokio::time::sleep(SETTLE).await;
    assert!(!waiter.is_finished());
    guard.release();
    waiter.await.unwrap();
    assert!(!mutex.is_locked());
}
