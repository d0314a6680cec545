//! Running counters and their serializable snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::background::ReaderState;

#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn inc(&self) {
        self.add(1);
    }

    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReaderCounters {
    pub(crate) messages_read: Counter,
    pub(crate) parse_errors: Counter,
    pub(crate) socket_errors: Counter,
    pub(crate) bytes_read: Counter,
    pub(crate) invalid_frames: Counter,
    pub(crate) resync_attempts: Counter,
    pub(crate) resync_successes: Counter,
}

impl ReaderCounters {
    pub(crate) fn snapshot(&self) -> ReaderStats {
        ReaderStats {
            messages_read: self.messages_read.get(),
            parse_errors: self.parse_errors.get(),
            socket_errors: self.socket_errors.get(),
            bytes_read: self.bytes_read.get(),
            invalid_frames: self.invalid_frames.get(),
            resync_attempts: self.resync_attempts.get(),
            resync_successes: self.resync_successes.get(),
        }
    }
}

/// Background reader statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaderStats {
    pub messages_read: u64,
    /// Frames that could not be used, including failures outside the marker check.
    pub parse_errors: u64,
    pub socket_errors: u64,
    pub bytes_read: u64,
    /// Frames rejected for bad markers or an oversized additional-data announcement.
    pub invalid_frames: u64,
    pub resync_attempts: u64,
    pub resync_successes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct DispatcherCounters {
    pub(crate) messages_received: Counter,
    pub(crate) responses_dispatched: Counter,
    pub(crate) callbacks_dispatched: Counter,
    pub(crate) unsolicited_queued: Counter,
    pub(crate) dropped_late_responses: Counter,
    pub(crate) dropped_queue_overflow: Counter,
    pub(crate) dropped_unmatched: Counter,
}

impl DispatcherCounters {
    pub(crate) fn snapshot(&self) -> DispatcherStats {
        let dropped_late_responses = self.dropped_late_responses.get();
        let dropped_queue_overflow = self.dropped_queue_overflow.get();
        let dropped_unmatched = self.dropped_unmatched.get();
        DispatcherStats {
            messages_received: self.messages_received.get(),
            responses_dispatched: self.responses_dispatched.get(),
            callbacks_dispatched: self.callbacks_dispatched.get(),
            unsolicited_queued: self.unsolicited_queued.get(),
            messages_dropped: dropped_late_responses + dropped_queue_overflow + dropped_unmatched,
            dropped_late_responses,
            dropped_queue_overflow,
            dropped_unmatched,
        }
    }
}

/// Dispatcher statistics.
///
/// Every dispatched message lands in exactly one bucket, so
/// `messages_received == responses_dispatched + callbacks_dispatched +
/// unsolicited_queued + messages_dropped` once dispatch calls have returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub messages_received: u64,
    pub responses_dispatched: u64,
    pub callbacks_dispatched: u64,
    pub unsolicited_queued: u64,
    pub messages_dropped: u64,
    pub dropped_late_responses: u64,
    pub dropped_queue_overflow: u64,
    pub dropped_unmatched: u64,
}

impl DispatcherStats {
    /// Sum of all destinations.
    pub fn accounted(&self) -> u64 {
        self.responses_dispatched
            + self.callbacks_dispatched
            + self.unsolicited_queued
            + self.messages_dropped
    }
}

/// Combined engine snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub connected: bool,
    pub reader_state: ReaderState,
    pub unsolicited_pending: usize,
    pub reader: ReaderStats,
    pub dispatcher: DispatcherStats,
}
