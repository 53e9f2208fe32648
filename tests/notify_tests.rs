//! When the future driving a batch goes away, another waiting future has to
//! be woken to take over. These tests poll futures by hand and check exactly
//! which ones get woken.

mod common;

use common::{Skipper, Task};
use scopeloader::{FetchResult, Loader, LoaderConfig};
use std::{
    collections::HashMap,
    future::Future,
    mem,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier, Mutex,
    },
    task::{Context, Poll, Waker},
    thread::sleep,
    time::Duration,
};

/// Batch function that makes its caller poll it twice
async fn echo_after_skip(keys: Vec<i32>) -> FetchResult<i32, ()> {
    Skipper::new(1).await;
    Ok(keys.into_iter().map(Ok).collect())
}

fn loader() -> Loader<i32, i32, ()> {
    let config = LoaderConfig::default().with_wait(Duration::from_millis(1));
    Loader::new(config, echo_after_skip)
}

/// The one task that was woken. Fails unless exactly one was.
fn signaled_task<F: Future + Unpin>(tasks: &HashMap<i32, Task<F>>) -> i32 {
    let mut signaled = tasks
        .iter()
        .filter(|(_, task)| task.is_signaled())
        .map(|(&key, _)| key);

    let key = signaled.next().expect("no task was woken to take over");
    assert_eq!(signaled.next(), None, "more than one task was woken");
    key
}

#[test]
fn test_notify_lifecycle() {
    let loader = loader();

    let mut task1 = Task::new(loader.load(1));
    let mut task2 = Task::new(loader.load(2));
    let mut task3 = Task::new(loader.load(3));

    // task1 polls last, so it drives the timer
    assert_eq!(task3.poll(), Poll::Pending);
    assert_eq!(task2.poll(), Poll::Pending);
    assert_eq!(task1.poll(), Poll::Pending);

    assert!(!task1.is_signaled());
    assert!(!task2.is_signaled());
    assert!(!task3.is_signaled());

    sleep(Duration::from_millis(10));

    // Only the driver hears about the timer
    assert!(task1.is_signaled());
    assert!(!task2.is_signaled());
    assert!(!task3.is_signaled());

    // Dispatch: the batch function skips once, waking task1 again
    assert_eq!(task1.poll(), Poll::Pending);
    assert!(task1.is_signaled());
    assert!(!task2.is_signaled());
    assert!(!task3.is_signaled());

    // Completion wakes everyone else
    assert_eq!(task1.poll(), Poll::Ready(Ok(1)));
    assert!(task2.is_signaled());
    assert!(task3.is_signaled());

    assert_eq!(task2.poll(), Poll::Ready(Ok(2)));
    assert_eq!(task3.poll(), Poll::Ready(Ok(3)));
}

#[test]
fn test_notify_lifecycle_drops() {
    let loader = loader();

    let mut tasks: HashMap<i32, _> = (1..=5)
        .map(|key| (key, Task::new(loader.load(key))))
        .collect();

    for key in 1..=5 {
        assert_eq!(tasks.get_mut(&key).unwrap().poll(), Poll::Pending);
    }
    assert!(tasks.values().all(|task| !task.is_signaled()));

    // Task 5 polled last and drives the batch. Dropping it during the
    // window hands the batch to someone else.
    tasks.remove(&5);
    let driver = signaled_task(&tasks);

    sleep(Duration::from_millis(10));
    for (&key, task) in tasks.iter() {
        assert_eq!(task.is_signaled(), key == driver);
    }

    // The new driver dispatches, and stops at the Skipper
    assert_eq!(tasks.get_mut(&driver).unwrap().poll(), Poll::Pending);

    // Dropping it while the batch function is parked hands off again
    tasks.remove(&driver);
    let driver = signaled_task(&tasks);

    assert_eq!(tasks.get_mut(&driver).unwrap().poll(), Poll::Ready(Ok(driver)));

    // Everyone else was woken; the finished driver wasn't woken again
    for (&key, task) in tasks.iter() {
        assert_eq!(task.is_signaled(), key != driver);
    }

    tasks.remove(&driver);
    for (&key, task) in tasks.iter_mut() {
        assert_eq!(task.poll(), Poll::Ready(Ok(key)));
    }

    // The dropped tasks' keys were loaded all the same
    assert_eq!(loader.peek(&5), Some(Ok(5)));
}

#[test]
fn test_full_batch_wakes_the_driver() {
    let config = LoaderConfig::new(2, Duration::from_secs(3600)).unwrap();
    let loader = Loader::new(config, echo_after_skip);

    let mut task1 = Task::new(loader.load(1));
    assert_eq!(task1.poll(), Poll::Pending);
    assert!(!task1.is_signaled());

    // The second key fills the batch, so the driver is woken to dispatch it
    // without waiting for the timer.
    let mut task2 = Task::new(loader.load(2));
    assert!(task1.is_signaled());

    assert_eq!(task1.poll(), Poll::Pending);
    assert_eq!(task1.poll(), Poll::Ready(Ok(1)));

    // task2 was never polled, so there was nothing to wake; its first poll
    // finds the result waiting.
    assert!(!task2.is_signaled());
    assert_eq!(task2.poll(), Poll::Ready(Ok(2)));
}

#[test]
fn test_flush_wakes_the_driver() {
    let config = LoaderConfig::default().with_wait(Duration::from_secs(3600));
    let loader = Loader::new(config, echo_after_skip);

    let mut task1 = Task::new(loader.load(1));
    let mut task2 = Task::new(loader.load(2));
    assert_eq!(task1.poll(), Poll::Pending);
    assert_eq!(task2.poll(), Poll::Pending);

    assert!(loader.flush());
    assert!(task2.is_signaled());
    assert!(!task1.is_signaled());

    assert_eq!(task2.poll(), Poll::Pending);
    assert_eq!(task2.poll(), Poll::Ready(Ok(2)));
    assert!(task1.is_signaled());
    assert_eq!(task1.poll(), Poll::Ready(Ok(1)));
}

/// A backend call that finishes only when told to, waking whichever waker
/// it was last polled with.
#[derive(Debug, Default)]
struct Backend {
    finished: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl Backend {
    fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
        if let Some(waker) = self.waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

/// Batch function future. Its first poll blocks its thread between two
/// barrier waits, so that another thread can poll the batch meanwhile.
struct Gated {
    keys: Vec<i32>,
    gate: Option<Arc<Barrier>>,
    backend: Arc<Backend>,
}

impl Future for Gated {
    type Output = FetchResult<i32, ()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(gate) = this.gate.take() {
            gate.wait();
            gate.wait();
        }

        if this.backend.finished.load(Ordering::SeqCst) {
            let keys = mem::take(&mut this.keys);
            return Poll::Ready(Ok(keys.into_iter().map(Ok).collect()));
        }

        *this.backend.waker.lock().unwrap() = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[test]
fn test_drop_after_a_concurrent_poll_of_the_batch_function() {
    let gate = Arc::new(Barrier::new(2));
    let backend = Arc::new(Backend::default());

    let loader = {
        let gate = Arc::clone(&gate);
        let backend = Arc::clone(&backend);
        let config = LoaderConfig::default().with_wait(Duration::ZERO);

        Loader::new(config, move |keys: Vec<i32>| Gated {
            keys,
            gate: Some(Arc::clone(&gate)),
            backend: Arc::clone(&backend),
        })
    };

    let task1 = Task::new(loader.load(1));
    let mut task2 = Task::new(loader.load(2));

    let task1 = crossbeam::scope(|s| {
        let handle = s.spawn(move |_| {
            let mut task1 = task1;

            // Dispatches the batch and stays inside the batch function until
            // the main thread has polled task2
            assert_eq!(task1.poll(), Poll::Pending);
            task1
        });

        gate.wait();

        // task1 has the batch function checked out, so task2 just waits
        assert_eq!(task2.poll(), Poll::Pending);

        gate.wait();
        handle.join().unwrap()
    })
    .unwrap();

    // The backend holds task1's waker, so task1 drives the batch; dropping
    // it must hand the batch over to task2.
    assert!(!task2.is_signaled());
    drop(task1);
    assert!(task2.is_signaled());

    backend.finish();
    assert_eq!(task2.poll(), Poll::Ready(Ok(2)));
    assert_eq!(loader.peek(&1), Some(Ok(1)));
}
