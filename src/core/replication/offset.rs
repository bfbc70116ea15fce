//! Per-client WAIT bookkeeping, grounded on `redis-go`'s
//! `internal/command/wait.go`: `OffsTracker{CapturedOffs, AckCh}` plus the
//! `GetRepOffsets` collector loop, split here into a tracker (owned by the
//! client's record in the connection table) and a free function that runs on
//! its own OS thread.

use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

/// One entry per connected replica, reported on the ack channel as
/// `(replica_token, offset)` so the collector can count distinct replicas
/// rather than distinct messages.
pub type AckMessage = (u64, u64);

/// Owned by a client connection. Tracks the offset captured at the time of
/// that client's most recent write, and the channel `REPLCONF ACK` frames
/// get forwarded onto while a `WAIT` is outstanding for this client.
#[derive(Default)]
pub struct OffsetTracker {
    captured_offset: std::sync::atomic::AtomicU64,
    ack_tx: Mutex<Option<mpsc::Sender<AckMessage>>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captured_offset(&self) -> u64 {
        self.captured_offset.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn set_captured_offset(&self, offset: u64) {
        self.captured_offset.store(offset, std::sync::atomic::Ordering::SeqCst);
    }

    /// "Close and replace the client's per-connection acknowledgement
    /// channel with a fresh buffered channel" (§4.6 step 1 of `WAIT`).
    pub fn fresh_ack_channel(&self) -> mpsc::Receiver<AckMessage> {
        let (tx, rx) = mpsc::channel();
        *self.ack_tx.lock().unwrap() = Some(tx);
        rx
    }

    /// Delivers an incoming `REPLCONF ACK` to this client's open channel, if any.
    pub fn deliver_ack(&self, replica_token: u64, offset: u64) {
        if let Some(tx) = self.ack_tx.lock().unwrap().as_ref() {
            let _ = tx.send((replica_token, offset));
        }
    }

    pub fn close_ack_channel(&self) {
        *self.ack_tx.lock().unwrap() = None;
    }
}

/// Runs on a short-lived worker thread (§4.6 implementation note). Blocks on
/// `rx` until either `num_replicas` distinct replicas have reported an
/// offset >= `captured_offset`, or `timeout` elapses, whichever comes first.
/// Returns the number of distinct replicas that met the bar.
pub fn collect_acks(
    rx: mpsc::Receiver<AckMessage>,
    num_replicas: usize,
    captured_offset: u64,
    timeout: Duration,
) -> usize {
    let deadline = std::time::Instant::now() + timeout;
    let mut satisfied = std::collections::HashSet::new();
    loop {
        if satisfied.len() >= num_replicas {
            break;
        }
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok((replica_token, offset)) => {
                if offset >= captured_offset {
                    satisfied.insert(replica_token);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    satisfied.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_acks_until_threshold_met() {
        let tracker = OffsetTracker::new();
        tracker.set_captured_offset(100);
        let rx = tracker.fresh_ack_channel();
        tracker.deliver_ack(1, 100);
        tracker.deliver_ack(2, 50);
        tracker.deliver_ack(2, 150);
        drop(tracker);
        let count = collect_acks(rx, 2, 100, Duration::from_millis(200));
        assert_eq!(count, 2);
    }

    #[test]
    fn times_out_when_not_enough_replicas_ack() {
        let tracker = OffsetTracker::new();
        tracker.set_captured_offset(100);
        let rx = tracker.fresh_ack_channel();
        tracker.deliver_ack(1, 100);
        let count = collect_acks(rx, 5, 100, Duration::from_millis(50));
        assert_eq!(count, 1);
    }
}
