use std::{
    collections::hash_map::{Entry, HashMap},
    task::Waker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Token(u64);

/// The wakers of every future waiting on one batch.
///
/// Only one task needs to drive a batch (poll its timer, then its batch
/// function), but every task needs to hear about the result. The WakerSet
/// tracks the "driving waker": whichever waker most recently polled the
/// shared state. Timers and batch functions only remember the last waker
/// they were polled with, so this is the waker they will wake.
///
/// When the driving future is dropped, another waker is chosen and woken so
/// that it can take over; so long as futures discard their tokens when they
/// are dropped, the batch always has a path forward.
#[derive(Debug, Default)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driving_waker: Option<Token>,

    // Tokens are never reused. A WakerSet lives only as long as one batch.
    next_token: u64,
}

impl WakerSet {
    /// Record the waker a future was just polled with. A future that has not
    /// registered before gets a token written into `token`; one that has has
    /// its waker replaced. Either way it becomes the driving waker.
    pub(crate) fn register(&mut self, token: &mut Option<Token>, waker: &Waker) {
        let token = match *token {
            Some(token) => token,
            None => {
                let fresh = Token(self.next_token);
                self.next_token += 1;
                *token = Some(fresh);
                fresh
            }
        };

        match self.wakers.entry(token) {
            Entry::Occupied(mut entry) => {
                if !entry.get().will_wake(waker) {
                    entry.get_mut().clone_from(waker);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(waker.clone());
            }
        }

        self.driving_waker = Some(token);
    }

    /// Make an already registered waker the driving waker again. Discarded
    /// tokens are ignored.
    pub(crate) fn set_driver(&mut self, token: Token) {
        if self.wakers.contains_key(&token) {
            self.driving_waker = Some(token);
        }
    }

    /// Discard a waker without waking anyone. Only for a future that is about
    /// to complete; otherwise use `discard_and_wake`.
    pub(crate) fn discard_waker(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker == Some(token) {
            self.driving_waker = None;
        }
    }

    /// Discard a waker. If it was the driving waker (or there is no driving
    /// waker), an arbitrary remaining waker becomes the driver and is woken.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker == Some(token) || self.driving_waker.is_none() {
            self.driving_waker = None;
            if let Some((&token, waker)) = self.wakers.iter().next() {
                self.driving_waker = Some(token);
                waker.wake_by_ref();
            }
        }
    }

    /// Wake only the driving waker, so that it notices the shared state has
    /// changed (for instance, that its batch filled up).
    pub(crate) fn wake_driver(&self) {
        if let Some(waker) = self
            .driving_waker
            .as_ref()
            .and_then(|token| self.wakers.get(token))
        {
            waker.wake_by_ref();
        }
    }

    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.wakers.len()
    }
}
