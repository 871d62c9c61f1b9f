use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use strand::fiber::{self, Cond, Mutex};
use strand::Error;

#[test]
fn cond_ping_pong() {
    strand::init().unwrap();
    let cond = Rc::new(Cond::new());
    let completed = Rc::new(Cell::new(0u32));

    let waiter = {
        let cond = cond.clone();
        let completed = completed.clone();
        fiber::start(move || {
            for _ in 0..5 {
                cond.wait().unwrap();
                completed.set(completed.get() + 1);
            }
        })
    };
    let signaller = {
        let cond = cond.clone();
        let completed = completed.clone();
        fiber::start(move || {
            for round in 0..5 {
                // The waiter re-enters wait without yielding in between, so
                // once its counter shows `round` it is already waiting.
                while completed.get() < round {
                    fiber::yield_now();
                }
                cond.signal();
                fiber::yield_now();
            }
        })
    };

    waiter.join().unwrap();
    signaller.join().unwrap();
    assert_eq!(completed.get(), 5);
}

#[test]
fn broadcast_wakes_every_waiter() {
    strand::init().unwrap();
    let cond = Rc::new(Cond::new());
    let woken = Rc::new(Cell::new(0u32));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let cond = cond.clone();
            let woken = woken.clone();
            fiber::start(move || {
                cond.wait().unwrap();
                woken.set(woken.get() + 1);
            })
        })
        .collect();

    // Let all three reach the wait list, then release them at once.
    fiber::sleep(Duration::from_millis(5)).unwrap();
    cond.broadcast();
    for jh in handles {
        jh.join().unwrap();
    }
    assert_eq!(woken.get(), 3);
}

#[test]
fn timedwait_expires() {
    strand::init().unwrap();
    let cond = Cond::new();
    let started = Instant::now();
    let res = cond.timedwait(20_000);
    assert!(matches!(res, Err(Error::TimedOut)));
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert!(!fiber::is_interrupted());

    // The timeout flag must not leak into the next wait.
    let res = cond.timedwait(10_000);
    assert!(matches!(res, Err(Error::TimedOut)));
}

#[test]
fn timedwait_signalled_in_time() {
    strand::init().unwrap();
    let cond = Rc::new(Cond::new());
    let cond2 = cond.clone();
    let jh = fiber::start(move || cond2.timedwait(1_000_000));
    fiber::sleep(Duration::from_millis(5)).unwrap();
    cond.signal();
    assert!(jh.join().unwrap().is_ok());
}

#[test]
fn mutex_handoff_is_fifo() {
    strand::init().unwrap();
    let mutex = Rc::new(Mutex::new());
    let order = Rc::new(RefCell::new(Vec::new()));

    mutex.lock().unwrap();

    let handles: Vec<_> = ["b", "c", "d"]
        .iter()
        .map(|&name| {
            let mutex = mutex.clone();
            let order = order.clone();
            fiber::start(move || {
                mutex.lock().unwrap();
                order.borrow_mut().push(name);
                mutex.unlock().unwrap();
            })
        })
        .collect();

    // Let b, c and d queue up in that order.
    fiber::sleep(Duration::from_millis(5)).unwrap();
    assert!(order.borrow().is_empty());

    mutex.unlock().unwrap();
    for jh in handles {
        jh.join().unwrap();
    }
    assert_eq!(*order.borrow(), vec!["b", "c", "d"]);
}

#[test]
fn mutex_error_cases() {
    strand::init().unwrap();
    let mutex = Mutex::new();

    assert!(matches!(mutex.unlock(), Err(Error::NotOwner)));
    mutex.lock().unwrap();
    assert!(matches!(mutex.lock(), Err(Error::Deadlock)));
    assert!(matches!(mutex.trylock(), Err(Error::Busy)));
    mutex.unlock().unwrap();

    mutex.trylock().unwrap();
    mutex.unlock().unwrap();
}

#[test]
fn mutex_guard_releases() {
    strand::init().unwrap();
    let mutex = Mutex::new();
    {
        let _guard = mutex.guard().unwrap();
        assert!(matches!(mutex.trylock(), Err(Error::Busy)));
    }
    mutex.trylock().unwrap();
    mutex.unlock().unwrap();
}

#[test]
fn locked_mutex_refuses_destroy() {
    strand::init().unwrap();
    let mutex = Mutex::new();
    mutex.lock().unwrap();
    assert!(matches!(mutex.destroy(), Err(Error::Busy)));
}

#[test]
fn cond_with_waiter_refuses_destroy() {
    strand::init().unwrap();
    let cond = Cond::new();
    let cond_ptr: *const Cond = &cond;
    let jh = fiber::start(move || unsafe { (*cond_ptr).wait() });
    fiber::sleep(Duration::from_millis(5)).unwrap();

    assert!(matches!(cond.destroy(), Err(Error::Busy)));

    jh.handle().interrupt();
    assert!(matches!(jh.join().unwrap(), Err(Error::Interrupted)));
}

#[test]
fn interrupted_lock_wait_fails() {
    strand::init().unwrap();
    let mutex = Rc::new(Mutex::new());
    mutex.lock().unwrap();

    let mutex2 = mutex.clone();
    let jh = fiber::start(move || mutex2.lock());
    fiber::sleep(Duration::from_millis(5)).unwrap();

    jh.handle().interrupt();
    assert!(matches!(jh.join().unwrap(), Err(Error::Interrupted)));

    // We still own the lock.
    assert!(matches!(mutex.lock(), Err(Error::Deadlock)));
    mutex.unlock().unwrap();
}

#[test]
fn handoff_beats_interrupt() {
    strand::init().unwrap();
    let mutex = Rc::new(Mutex::new());
    mutex.lock().unwrap();

    let mutex2 = mutex.clone();
    let jh = fiber::start(move || {
        // The unlock below hands us the lock even though an interrupt is
        // pending; the interrupt must then hit the next blocking call.
        mutex2.lock().unwrap();
        mutex2.unlock().unwrap();
        fiber::sleep(Duration::from_millis(50))
    });
    fiber::sleep(Duration::from_millis(5)).unwrap();

    mutex.unlock().unwrap();
    jh.handle().interrupt();
    assert!(matches!(jh.join().unwrap(), Err(Error::Interrupted)));
}

#[test]
fn signal_wakes_in_fifo_order() {
    strand::init().unwrap();
    let cond = Rc::new(Cond::new());
    let order = Rc::new(RefCell::new(Vec::new()));

    let handles: Vec<_> = (0..3u32)
        .map(|id| {
            let cond = cond.clone();
            let order = order.clone();
            fiber::start(move || {
                cond.wait().unwrap();
                order.borrow_mut().push(id);
            })
        })
        .collect();

    fiber::sleep(Duration::from_millis(5)).unwrap();
    for _ in 0..3 {
        cond.signal();
        fiber::yield_now();
    }
    for jh in handles {
        jh.join().unwrap();
    }
    assert_eq!(*order.borrow(), vec![0, 1, 2]);
}
