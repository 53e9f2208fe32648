//! Wakers and futures for polling loads by hand, shared by the integration
//! tests.

#![allow(dead_code)]

use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::FutureExt;
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
};

/// A Waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone, IntoWaker)]
pub struct NoOpWaker;

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

/// A waker that remembers whether it was woken since the last reset
#[derive(Debug, Clone, Default, IntoWaker)]
pub struct BoolWaker {
    cell: Arc<AtomicBool>,
}

impl BoolWaker {
    pub fn reset(&self) {
        self.cell.store(false, Ordering::SeqCst)
    }

    pub fn is_signaled(&self) -> bool {
        self.cell.load(Ordering::SeqCst)
    }
}

impl WakeRef for BoolWaker {
    fn wake_by_ref(&self) {
        self.cell.store(true, Ordering::SeqCst)
    }
}

impl Wake for BoolWaker {}

/// Yields `Pending` a fixed number of times, waking itself each time, then
/// finishes. Lets a batch function take several polls.
#[derive(Debug, Clone)]
pub struct Skipper {
    remaining_skips: usize,
}

impl Skipper {
    pub fn new(count: usize) -> Self {
        Skipper {
            remaining_skips: count,
        }
    }
}

impl Future for Skipper {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.get_mut().remaining_skips {
            0 => Poll::Ready(()),
            skips => {
                *skips -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

/// A future polled by hand with a waker of its own, so that tests can see
/// exactly which futures were woken.
pub struct Task<F: Future + Unpin> {
    fut: F,
    signal: BoolWaker,
    waker: Waker,
}

impl<F: Future + Unpin> Task<F> {
    pub fn new(fut: F) -> Self {
        let signal = BoolWaker::default();

        Task {
            fut,
            waker: signal.clone().into_waker(),
            signal,
        }
    }

    pub fn poll(&mut self) -> Poll<F::Output> {
        self.signal.reset();
        self.fut.poll_unpin(&mut Context::from_waker(&self.waker))
    }

    pub fn is_signaled(&self) -> bool {
        self.signal.is_signaled()
    }
}
