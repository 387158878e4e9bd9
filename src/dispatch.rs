//! Single-consumer dispatch queue.
//!
//! Any number of threads may [`Dispatcher::post`] callbacks; they run one at a
//! time, in posting order, on whichever thread drains the [`DispatchQueue`].
//! State handed to the drain functions is therefore only ever touched from
//! that one thread.

use crate::error::DispatchClosed;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};

pub type Callback<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Cloneable posting handle, safe to move to worker threads.
pub struct Dispatcher<S: 'static> {
    tx: Sender<Callback<S>>,
}

impl<S: 'static> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Dispatcher { tx: self.tx.clone() }
    }
}

impl<S: 'static> Dispatcher<S> {
    /// Schedule `callback` to run later on the dispatch context.
    pub fn post(&self, callback: impl FnOnce(&mut S) + Send + 'static) -> Result<(), DispatchClosed> {
        self.tx.send(Box::new(callback)).map_err(|_| DispatchClosed)
    }
}

pub struct DispatchQueue<S: 'static> {
    tx: Sender<Callback<S>>,
    rx: Receiver<Callback<S>>,
}

impl<S: 'static> Default for DispatchQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> DispatchQueue<S> {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam::channel::unbounded();
        DispatchQueue { tx, rx }
    }

    pub fn dispatcher(&self) -> Dispatcher<S> {
        Dispatcher { tx: self.tx.clone() }
    }

    /// Number of callbacks waiting to run.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Run callbacks in order until `done(state)` holds. Returns immediately
    /// if it already holds. Blocks between callbacks.
    pub fn run_until(&self, state: &mut S, done: impl Fn(&S) -> bool) {
        while !done(state) {
            // The queue keeps a sender alive, so recv only fails if that invariant breaks.
            match self.rx.recv() {
                Ok(callback) => callback(state),
                Err(_) => return,
            }
        }
    }

    /// Like [`run_until`](Self::run_until) but gives up after `timeout`.
    /// Returns whether `done(state)` holds.
    pub fn run_until_timeout(&self, state: &mut S, done: impl Fn(&S) -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !done(state) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(callback) => callback(state),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return done(state),
            }
        }
        true
    }

    /// Run every callback queued right now without blocking. Returns how many ran.
    pub fn run_pending(&self, state: &mut S) -> usize {
        let mut ran = 0;
        loop {
            match self.rx.try_recv() {
                Ok(callback) => {
                    callback(state);
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return ran,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_run_in_post_order() {
        let queue: DispatchQueue<Vec<i32>> = DispatchQueue::new();
        let dispatcher = queue.dispatcher();
        for i in 0..5 {
            dispatcher.post(move |v| v.push(i)).unwrap();
        }

        let mut state = Vec::new();
        assert_eq!(queue.run_pending(&mut state), 5);
        assert_eq!(state, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn run_until_serializes_posts_from_many_threads() {
        let queue: DispatchQueue<u64> = DispatchQueue::new();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let dispatcher = queue.dispatcher();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        dispatcher.post(|total| *total += 1).unwrap();
                    }
                })
            })
            .collect();

        let mut total = 0u64;
        queue.run_until(&mut total, |t| *t == 8000);
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(total, 8000);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn run_until_timeout_reports_unfinished() {
        let queue: DispatchQueue<bool> = DispatchQueue::new();
        let mut flag = false;
        assert!(!queue.run_until_timeout(&mut flag, |f| *f, Duration::from_millis(20)));

        queue.dispatcher().post(|f| *f = true).unwrap();
        assert!(queue.run_until_timeout(&mut flag, |f| *f, Duration::from_secs(5)));
    }

    #[test]
    fn post_fails_after_queue_dropped() {
        let queue: DispatchQueue<()> = DispatchQueue::new();
        let dispatcher = queue.dispatcher();
        drop(queue);
        assert_eq!(dispatcher.post(|_| {}), Err(DispatchClosed));
    }
}
