//! Per-channel credit bucket.
//!
//! A credit is one chunk of buffer space at the peer. Senders debit credits
//! before every wire message; the peer hands them back piggybacked on its
//! own traffic. There is no timeout: if the peer never returns credits, or
//! the two ends disagree on what a message costs, `acquire` blocks until the
//! gate is closed. Requests that exceed the bucket's capacity are the one
//! case that can be detected up front, and they are rejected.

use std::sync::{Condvar, Mutex};

use tracing::{trace, warn};

use crate::error::{ChannelError, Result};
use crate::lock;

#[derive(Debug)]
struct CreditState {
    credits: usize,
    acquired: u64,
    freed: u64,
    closed: bool,
}

/// Snapshot of a credit bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreditSnapshot {
    pub available: usize,
    pub acquired: u64,
    pub freed: u64,
}

/// Blocking token bucket of flow-control credits.
#[derive(Debug)]
pub struct CreditGate {
    state: Mutex<CreditState>,
    available: Condvar,
    capacity: usize,
}

impl CreditGate {
    /// A full bucket of `capacity` credits.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CreditState {
                credits: capacity,
                acquired: 0,
                freed: 0,
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Block until `n` credits are available, then debit them.
    ///
    /// Fails with [`ChannelError::Closed`] once the gate is closed, including
    /// for callers already waiting.
    pub fn acquire(&self, n: usize) -> Result<()> {
        self.check_capacity(n)?;
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return Err(ChannelError::Closed);
            }
            if state.credits >= n {
                break;
            }
            trace!(requested = n, available = state.credits, "waiting for credits");
            state = self
                .available
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        state.credits -= n;
        state.acquired += n as u64;
        Ok(())
    }

    /// Debit `n` credits if available right now.
    pub fn try_acquire(&self, n: usize) -> Result<bool> {
        self.check_capacity(n)?;
        let mut state = lock(&self.state);
        if state.closed {
            return Err(ChannelError::Closed);
        }
        if state.credits < n {
            return Ok(false);
        }
        state.credits -= n;
        state.acquired += n as u64;
        Ok(true)
    }

    /// Return `n` credits and wake blocked senders.
    pub fn free(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut state = lock(&self.state);
        state.credits += n;
        state.freed += n as u64;
        if state.credits > self.capacity {
            warn!(
                credits = state.credits,
                capacity = self.capacity,
                "peer returned more credits than were granted"
            );
        }
        drop(state);
        self.available.notify_all();
    }

    /// Fail every current and future `acquire`. Freed credits are still
    /// counted.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Credits available right now.
    pub fn available(&self) -> usize {
        lock(&self.state).credits
    }

    /// Bucket size the channel was configured with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn snapshot(&self) -> CreditSnapshot {
        let state = lock(&self.state);
        CreditSnapshot {
            available: state.credits,
            acquired: state.acquired,
            freed: state.freed,
        }
    }

    fn check_capacity(&self, n: usize) -> Result<()> {
        if n > self.capacity {
            return Err(ChannelError::CreditsExceedCapacity {
                requested: n,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn acquire_and_free_conserve_credits() {
        let gate = CreditGate::new(10);
        gate.acquire(4).unwrap();
        gate.acquire(3).unwrap();
        gate.free(5);
        gate.acquire(8).unwrap();

        let snap = gate.snapshot();
        // credits_after = credits_before - acquired + freed
        assert_eq!(snap.available as u64, 10 - snap.acquired + snap.freed);
        assert_eq!(snap.available, 0);
        assert_eq!((snap.acquired, snap.freed), (15, 5));
    }

    #[test]
    fn try_acquire_does_not_block() {
        let gate = CreditGate::new(3);
        assert!(gate.try_acquire(3).unwrap());
        assert!(!gate.try_acquire(1).unwrap());
        assert_eq!(gate.available(), 0);
    }

    #[test]
    fn request_over_capacity_is_rejected() {
        let gate = CreditGate::new(2);
        let err = gate.acquire(3).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::CreditsExceedCapacity {
                requested: 3,
                capacity: 2
            }
        ));
        assert_eq!(gate.available(), 2);
    }

    #[test]
    fn acquire_blocks_until_credits_are_freed() {
        let gate = Arc::new(CreditGate::new(4));
        gate.acquire(4).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.acquire(2).unwrap();
                done_tx.send(()).unwrap();
            })
        };

        // No credits come back: the sender stays blocked.
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        gate.free(1);
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        gate.free(1);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
        assert_eq!(gate.available(), 0);
    }

    #[test]
    fn close_wakes_blocked_senders() {
        let gate = Arc::new(CreditGate::new(3));
        gate.acquire(3).unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.acquire(3))
        };
        thread::sleep(Duration::from_millis(20));
        gate.close();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(ChannelError::Closed)));
        assert!(gate.is_closed());
        assert!(matches!(gate.try_acquire(1), Err(ChannelError::Closed)));

        gate.free(3);
        assert_eq!(gate.snapshot().freed, 3);
        assert!(matches!(gate.acquire(1), Err(ChannelError::Closed)));
    }

    #[test]
    fn credits_never_go_negative_under_contention() {
        let gate = Arc::new(CreditGate::new(8));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || {
                    for _ in 0..200 {
                        gate.acquire(3).unwrap();
                        assert!(gate.available() <= 8);
                        gate.free(3);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let snap = gate.snapshot();
        assert_eq!(snap.available, 8);
        assert_eq!(snap.acquired, snap.freed);
    }
}
