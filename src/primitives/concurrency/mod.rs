#![forbid(unsafe_code)]
//! One-shot completion signals.
//!
//! A [`latch`] pairs one [`Completion`] with a [`Waiter`]; a [`barrier`] hands out `n`
//! completions that all feed the same waiter. Outcomes travel over an mpsc channel, so a
//! completion dropped without being signalled still releases the waiter (with
//! [`StoreError::Closed`]) instead of leaving it blocked forever.

use std::sync::mpsc::{self, Receiver, Sender};

use crate::types::{Result, StoreError};

/// Sending half of a latch or barrier slot. Consumed when signalled.
pub struct Completion<T> {
    tx: Sender<Result<T>>,
}

impl<T> Completion<T> {
    /// Reports the outcome of one participant.
    pub fn complete(self, outcome: Result<T>) {
        // The waiter may have given up already; nothing to report to.
        let _ = self.tx.send(outcome);
    }
}

/// Receiving half: blocks until every participant has reported.
pub struct Waiter<T> {
    rx: Receiver<Result<T>>,
    expected: usize,
}

impl<T> Waiter<T> {
    /// Number of participants the waiter expects.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Waits for all participants and returns their results in arrival order.
    ///
    /// Every participant is awaited even after a failure; the first error wins.
    pub fn wait(self) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(self.expected);
        let mut first_err = None;
        for _ in 0..self.expected {
            match self.rx.recv() {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(_) => {
                    if first_err.is_none() {
                        first_err = Some(StoreError::Closed("completion dropped unsignalled"));
                    }
                    break;
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    /// Waits for a single-participant latch.
    pub fn wait_one(self) -> Result<T> {
        debug_assert_eq!(self.expected, 1);
        match self.rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(StoreError::Closed("completion dropped unsignalled")),
        }
    }
}

/// Single count-down latch.
pub fn latch<T>() -> (Completion<T>, Waiter<T>) {
    let (tx, rx) = mpsc::channel();
    (Completion { tx }, Waiter { rx, expected: 1 })
}

/// Barrier over `parties` participants.
pub fn barrier<T>(parties: usize) -> (Vec<Completion<T>>, Waiter<T>) {
    let (tx, rx) = mpsc::channel();
    let completions = (0..parties)
        .map(|_| Completion { tx: tx.clone() })
        .collect();
    (
        completions,
        Waiter {
            rx,
            expected: parties,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn latch_delivers_value() {
        let (done, waiter) = latch();
        thread::spawn(move || done.complete(Ok(7u32)));
        assert_eq!(waiter.wait_one().unwrap(), 7);
    }

    #[test]
    fn barrier_waits_for_every_party() {
        let (parts, waiter) = barrier::<usize>(4);
        for (i, part) in parts.into_iter().enumerate() {
            thread::spawn(move || part.complete(Ok(i)));
        }
        let mut got = waiter.wait().unwrap();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }

    #[test]
    fn barrier_reports_first_error_after_all_arrive() {
        let (mut parts, waiter) = barrier::<()>(3);
        parts.pop().unwrap().complete(Err(StoreError::Invalid("boom")));
        for part in parts {
            part.complete(Ok(()));
        }
        assert!(matches!(waiter.wait(), Err(StoreError::Invalid("boom"))));
    }

    #[test]
    fn dropped_completion_releases_waiter() {
        let (done, waiter) = latch::<()>();
        drop(done);
        assert!(matches!(waiter.wait_one(), Err(StoreError::Closed(_))));

        let (parts, waiter) = barrier::<()>(2);
        drop(parts);
        assert!(matches!(waiter.wait(), Err(StoreError::Closed(_))));
    }

    #[test]
    fn empty_barrier_is_immediately_satisfied() {
        let (parts, waiter) = barrier::<()>(0);
        assert!(parts.is_empty());
        assert!(waiter.wait().unwrap().is_empty());
    }
}
