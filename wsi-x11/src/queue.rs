//! Bounded image-index queues.
//!
//! The present and acquire queues carry image indices between the
//! application thread and the queue manager. Capacity is `N + 1` so the
//! shutdown sentinel always has a free slot and a push can never block.

use std::time::{Duration, Instant};

/// Wake value pushed to unblock a peer when the swapchain shuts down or
/// the queue manager dies.
pub(crate) const SENTINEL: u32 = u32::MAX;

pub(crate) fn image_queue(image_count: u32) -> (flume::Sender<u32>, flume::Receiver<u32>) {
    flume::bounded(image_count as usize + 1)
}

/// Outcome of a bounded-wait pull.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Pull {
    Index(u32),
    NotReady,
    Timeout,
    Disconnected,
}

/// Pulls one index, waiting up to `timeout_ns` nanoseconds. A zero timeout
/// never blocks and `u64::MAX` waits forever.
pub(crate) fn pull(rx: &flume::Receiver<u32>, timeout_ns: u64) -> Pull {
    if timeout_ns == 0 {
        return match rx.try_recv() {
            Ok(index) => Pull::Index(index),
            Err(flume::TryRecvError::Empty) => Pull::NotReady,
            Err(flume::TryRecvError::Disconnected) => Pull::Disconnected,
        };
    }
    if timeout_ns == u64::MAX {
        return match rx.recv() {
            Ok(index) => Pull::Index(index),
            Err(_) => Pull::Disconnected,
        };
    }
    let deadline = Instant::now() + Duration::from_nanos(timeout_ns);
    match rx.recv_deadline(deadline) {
        Ok(index) => Pull::Index(index),
        Err(flume::RecvTimeoutError::Timeout) => Pull::Timeout,
        Err(flume::RecvTimeoutError::Disconnected) => Pull::Disconnected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn drains_then_reports_not_ready() {
        let (tx, rx) = image_queue(3);
        for index in 0..3 {
            tx.send(index).unwrap();
        }
        assert_eq!(pull(&rx, 0), Pull::Index(0));
        assert_eq!(pull(&rx, 0), Pull::Index(1));
        assert_eq!(pull(&rx, 0), Pull::Index(2));
        assert_eq!(pull(&rx, 0), Pull::NotReady);
    }

    #[test]
    fn finite_timeout_expires() {
        let (_tx, rx) = image_queue(2);
        let start = Instant::now();
        assert_eq!(pull(&rx, 5_000_000), Pull::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn sentinel_wakes_a_blocked_puller() {
        let (tx, rx) = image_queue(2);
        let waiter = std::thread::spawn(move || pull(&rx, u64::MAX));
        std::thread::sleep(Duration::from_millis(10));
        tx.send(SENTINEL).unwrap();
        assert_eq!(waiter.join().unwrap(), Pull::Index(SENTINEL));
    }

    #[test]
    fn sentinel_always_fits() {
        let (tx, _rx) = image_queue(2);
        // Queue full of real indices plus the sentinel must not block.
        tx.send(0).unwrap();
        tx.send(1).unwrap();
        tx.try_send(SENTINEL).unwrap();
    }

    #[test]
    fn disconnect_is_reported() {
        let (tx, rx) = image_queue(2);
        drop(tx);
        assert_eq!(pull(&rx, 0), Pull::Disconnected);
        assert_eq!(pull(&rx, u64::MAX), Pull::Disconnected);
    }
}
