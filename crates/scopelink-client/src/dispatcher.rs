//! Routes every received message to exactly one destination.
//!
//! Priority order for a message with code `C`:
//! 1. the caller waiting on a pending request for `C`,
//! 2. every callback registered for `C`, in registration order,
//! 3. the bounded fallback queue, if `C` is an unsolicited code,
//! 4. otherwise the message is dropped and counted.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use scopelink_frame::{code_name, Message};
use tracing::{debug, warn};

use crate::config::DispatcherConfig;
use crate::stats::{DispatcherCounters, DispatcherStats};

/// Callback invoked on the reader thread for a matching message.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Identifies a registered callback for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Where `dispatch` sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Delivered to a waiting caller.
    Response,
    /// Delivered to this many handlers.
    Callbacks(usize),
    /// Pushed into the unsolicited queue.
    Queued,
    /// Discarded.
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The waiting caller had already given up.
    LateResponse,
    /// The unsolicited queue was full.
    QueueFull,
    /// Nobody was interested in the code.
    Unmatched,
}

#[derive(Debug, Default)]
struct SlotState {
    message: Option<Message>,
    abandoned: bool,
}

/// Single-use rendezvous between the reader and one waiting caller.
#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
    filled: Condvar,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking deposit. Hands the message back if the slot cannot take it.
    fn deposit(&self, message: Message) -> std::result::Result<(), Message> {
        let mut state = self.lock();
        if state.abandoned || state.message.is_some() {
            return Err(message);
        }
        state.message = Some(message);
        self.filled.notify_all();
        Ok(())
    }
}

/// A caller's registration for one response code.
#[derive(Debug)]
pub struct PendingRequest {
    code: u32,
    id: u64,
    slot: Arc<Slot>,
}

impl PendingRequest {
    pub fn code(&self) -> u32 {
        self.code
    }

    /// Block until the response arrives or `timeout` elapses.
    ///
    /// On timeout the slot is marked abandoned, so a response racing the
    /// deadline is counted as late instead of vanishing.
    pub fn wait(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.lock();
        loop {
            if let Some(message) = state.message.take() {
                return Some(message);
            }
            let now = Instant::now();
            if now >= deadline {
                state.abandoned = true;
                return None;
            }
            let (guard, _) = self
                .slot
                .filled
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Take the response if it already arrived.
    pub fn try_take(&self) -> Option<Message> {
        self.slot.lock().message.take()
    }
}

#[derive(Default)]
struct Tables {
    pending: HashMap<u32, (u64, Arc<Slot>)>,
    callbacks: HashMap<u32, Vec<(CallbackId, Handler)>>,
}

/// Correlates responses with waiting callers and fans out notifications.
pub struct Dispatcher {
    tables: Mutex<Tables>,
    unsolicited: Mutex<VecDeque<Message>>,
    unsolicited_ready: Condvar,
    next_id: AtomicU64,
    counters: DispatcherCounters,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            unsolicited: Mutex::new(VecDeque::with_capacity(config.unsolicited_capacity)),
            unsolicited_ready: Condvar::new(),
            next_id: AtomicU64::new(1),
            counters: DispatcherCounters::default(),
            config,
        }
    }

    fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.unsolicited.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register interest in the next response carrying `code`.
    ///
    /// Only one request per code can be outstanding; a second registration
    /// replaces the first, whose caller will time out.
    pub fn register_pending_request(&self, code: u32) -> PendingRequest {
        let id = self.next_id();
        let slot = Arc::new(Slot::default());
        let previous = self
            .lock_tables()
            .pending
            .insert(code, (id, Arc::clone(&slot)));
        if previous.is_some() {
            warn!(code, name = code_name(code), "overwriting outstanding pending request");
        }
        debug!(code, id, "registered pending request");
        PendingRequest { code, id, slot }
    }

    /// Remove whatever registration exists for `code`.
    pub fn unregister_pending_request(&self, code: u32) -> bool {
        self.lock_tables().pending.remove(&code).is_some()
    }

    /// Remove `request`'s registration, leaving any newer one for the same code.
    pub fn release(&self, request: &PendingRequest) -> bool {
        let mut tables = self.lock_tables();
        match tables.pending.get(&request.code) {
            Some((id, _)) if *id == request.id => {
                tables.pending.remove(&request.code);
                true
            }
            _ => false,
        }
    }

    pub fn has_pending(&self, code: u32) -> bool {
        self.lock_tables().pending.contains_key(&code)
    }

    pub fn register_callback<F>(&self, code: u32, handler: F) -> CallbackId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.register_handler(code, Arc::new(handler))
    }

    pub fn register_handler(&self, code: u32, handler: Handler) -> CallbackId {
        let id = CallbackId(self.next_id());
        self.lock_tables()
            .callbacks
            .entry(code)
            .or_default()
            .push((id, handler));
        debug!(code, "registered callback");
        id
    }

    pub fn unregister_callback(&self, code: u32, id: CallbackId) -> bool {
        let mut tables = self.lock_tables();
        let Some(handlers) = tables.callbacks.get_mut(&code) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            tables.callbacks.remove(&code);
        }
        removed
    }

    /// Route one message. Handlers run on the calling thread, outside the lock.
    pub fn dispatch(&self, message: Message) -> Route {
        self.counters.messages_received.inc();
        let code = message.command_code;

        let handlers: Vec<Handler> = {
            let mut tables = self.lock_tables();
            if let Some((_, slot)) = tables.pending.remove(&code) {
                drop(tables);
                return match slot.deposit(message) {
                    Ok(()) => {
                        self.counters.responses_dispatched.inc();
                        debug!(code, "delivered response");
                        Route::Response
                    }
                    Err(_) => {
                        self.counters.dropped_late_responses.inc();
                        warn!(code, name = code_name(code), "response arrived after caller gave up");
                        Route::Dropped(DropReason::LateResponse)
                    }
                };
            }
            tables
                .callbacks
                .get(&code)
                .map(|registered| registered.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };

        if !handlers.is_empty() {
            for handler in &handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
                    warn!(code, name = code_name(code), "callback panicked");
                }
            }
            self.counters.callbacks_dispatched.inc();
            debug!(code, count = handlers.len(), "delivered to callbacks");
            return Route::Callbacks(handlers.len());
        }

        if self.config.is_unsolicited(code) {
            return self.enqueue_unsolicited(message);
        }

        self.counters.dropped_unmatched.inc();
        debug!(code, name = code_name(code), "no receiver for message");
        Route::Dropped(DropReason::Unmatched)
    }

    fn enqueue_unsolicited(&self, message: Message) -> Route {
        let code = message.command_code;
        let mut queue = self.lock_queue();
        if queue.len() >= self.config.unsolicited_capacity {
            drop(queue);
            self.counters.dropped_queue_overflow.inc();
            warn!(code, capacity = self.config.unsolicited_capacity, "unsolicited queue full, dropping");
            return Route::Dropped(DropReason::QueueFull);
        }
        queue.push_back(message);
        self.counters.unsolicited_queued.inc();
        self.unsolicited_ready.notify_one();
        debug!(code, queued = queue.len(), "queued unsolicited message");
        Route::Queued
    }

    /// Pop the oldest unsolicited message, waiting up to `timeout`.
    pub fn recv_unsolicited(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock_queue();
        loop {
            if let Some(message) = queue.pop_front() {
                return Some(message);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .unsolicited_ready
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
        }
    }

    pub fn drain_unsolicited(&self) -> Vec<Message> {
        self.lock_queue().drain(..).collect()
    }

    pub fn unsolicited_len(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.lock_tables();
        f.debug_struct("Dispatcher")
            .field("pending", &tables.pending.len())
            .field("callback_codes", &tables.callbacks.len())
            .field("unsolicited", &self.unsolicited_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use scopelink_frame::codes::{ERROR_NOTIFICATION, STAGE_POSITION_GET, SYSTEM_STATE_CHANGED};

    use super::*;

    fn counting_handler(hits: &Arc<AtomicUsize>) -> impl Fn(&Message) + Send + Sync + 'static {
        let hits = Arc::clone(hits);
        move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn response_reaches_waiting_caller() {
        let dispatcher = Arc::new(Dispatcher::new());
        let pending = dispatcher.register_pending_request(STAGE_POSITION_GET);

        let d = Arc::clone(&dispatcher);
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            d.dispatch(Message::new(STAGE_POSITION_GET).with_value(12.5))
        });

        let reply = pending.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(reply.value(), 12.5);
        assert_eq!(sender.join().unwrap(), Route::Response);
        assert!(!dispatcher.has_pending(STAGE_POSITION_GET));
    }

    #[test]
    fn pending_request_beats_callback() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.register_callback(STAGE_POSITION_GET, counting_handler(&hits));
        let pending = dispatcher.register_pending_request(STAGE_POSITION_GET);

        assert_eq!(dispatcher.dispatch(Message::new(STAGE_POSITION_GET)), Route::Response);
        assert!(pending.try_take().is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // registration is consumed, so the next frame goes to the callback
        assert_eq!(dispatcher.dispatch(Message::new(STAGE_POSITION_GET)), Route::Callbacks(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let order = Arc::clone(&order);
            dispatcher.register_callback(SYSTEM_STATE_CHANGED, move |_| {
                order.lock().unwrap().push(tag);
            });
        }

        assert_eq!(dispatcher.dispatch(Message::new(SYSTEM_STATE_CHANGED)), Route::Callbacks(3));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(dispatcher.unsolicited_len(), 0);
    }

    #[test]
    fn unregistered_callback_stops_firing() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = dispatcher.register_callback(ERROR_NOTIFICATION, counting_handler(&hits));

        assert!(dispatcher.unregister_callback(ERROR_NOTIFICATION, id));
        assert!(!dispatcher.unregister_callback(ERROR_NOTIFICATION, id));

        assert_eq!(dispatcher.dispatch(Message::new(ERROR_NOTIFICATION)), Route::Queued);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_callback_does_not_stop_others() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.register_callback(SYSTEM_STATE_CHANGED, |_| panic!("handler failure"));
        dispatcher.register_callback(SYSTEM_STATE_CHANGED, counting_handler(&hits));

        assert_eq!(dispatcher.dispatch(Message::new(SYSTEM_STATE_CHANGED)), Route::Callbacks(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_may_reenter_dispatcher() {
        let dispatcher = Arc::new(Dispatcher::new());
        let d = Arc::clone(&dispatcher);
        let registered = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&registered);
        dispatcher.register_callback(SYSTEM_STATE_CHANGED, move |_| {
            d.register_callback(ERROR_NOTIFICATION, |_| {});
            r.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(Message::new(SYSTEM_STATE_CHANGED));
        assert_eq!(registered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsolicited_queue_drops_new_when_full() {
        let dispatcher = Dispatcher::with_config(DispatcherConfig::default().with_unsolicited_capacity(2));
        for value in 0..3 {
            dispatcher.dispatch(Message::new(SYSTEM_STATE_CHANGED).with_value(f64::from(value)));
        }

        let stats = dispatcher.stats();
        assert_eq!(stats.unsolicited_queued, 2);
        assert_eq!(stats.dropped_queue_overflow, 1);

        let kept: Vec<f64> = dispatcher.drain_unsolicited().iter().map(Message::value).collect();
        assert_eq!(kept, vec![0.0, 1.0]);
    }

    #[test]
    fn unknown_code_is_dropped() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.dispatch(Message::new(0xBEEF)), Route::Dropped(DropReason::Unmatched));
        assert_eq!(dispatcher.stats().dropped_unmatched, 1);
        assert_eq!(dispatcher.unsolicited_len(), 0);
    }

    #[test]
    fn timed_out_caller_leaves_no_registration() {
        let dispatcher = Dispatcher::new();
        let pending = dispatcher.register_pending_request(STAGE_POSITION_GET);

        let started = Instant::now();
        assert!(pending.wait(Duration::from_millis(50)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));

        assert!(dispatcher.release(&pending));
        assert!(!dispatcher.has_pending(STAGE_POSITION_GET));
    }

    #[test]
    fn response_after_abandon_counts_as_late() {
        let dispatcher = Dispatcher::new();
        let pending = dispatcher.register_pending_request(STAGE_POSITION_GET);
        assert!(pending.wait(Duration::from_millis(1)).is_none());

        // caller gave up but has not released yet
        assert_eq!(
            dispatcher.dispatch(Message::new(STAGE_POSITION_GET)),
            Route::Dropped(DropReason::LateResponse)
        );
        assert_eq!(dispatcher.stats().dropped_late_responses, 1);
    }

    #[test]
    fn unregistered_request_no_longer_receives() {
        let dispatcher = Dispatcher::new();
        let pending = dispatcher.register_pending_request(STAGE_POSITION_GET);

        assert!(dispatcher.unregister_pending_request(STAGE_POSITION_GET));
        assert!(!dispatcher.has_pending(STAGE_POSITION_GET));
        assert!(!dispatcher.unregister_pending_request(STAGE_POSITION_GET));

        assert_eq!(
            dispatcher.dispatch(Message::new(STAGE_POSITION_GET)),
            Route::Dropped(DropReason::Unmatched)
        );
        assert!(pending.try_take().is_none());
        assert_eq!(dispatcher.stats().dropped_unmatched, 1);
    }

    #[test]
    fn release_keeps_newer_registration() {
        let dispatcher = Dispatcher::new();
        let first = dispatcher.register_pending_request(STAGE_POSITION_GET);
        let second = dispatcher.register_pending_request(STAGE_POSITION_GET);

        assert!(!dispatcher.release(&first));
        assert!(dispatcher.has_pending(STAGE_POSITION_GET));

        dispatcher.dispatch(Message::new(STAGE_POSITION_GET));
        assert!(second.try_take().is_some());
        assert!(first.try_take().is_none());
    }

    #[test]
    fn recv_unsolicited_waits_for_arrival() {
        let dispatcher = Arc::new(Dispatcher::new());
        let d = Arc::clone(&dispatcher);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            d.dispatch(Message::new(SYSTEM_STATE_CHANGED).with_payload(b"Idle"));
        });

        let msg = dispatcher.recv_unsolicited(Duration::from_secs(2)).unwrap();
        assert_eq!(msg.payload_str(), "Idle");
        assert!(dispatcher.recv_unsolicited(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn every_message_has_exactly_one_destination() {
        let dispatcher = Dispatcher::with_config(DispatcherConfig::default().with_unsolicited_capacity(3));
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.register_callback(ERROR_NOTIFICATION, counting_handler(&hits));
        let mut waiting = Vec::new();

        for i in 0u32..200 {
            match i % 5 {
                0 => {
                    waiting.push(dispatcher.register_pending_request(STAGE_POSITION_GET));
                    dispatcher.dispatch(Message::new(STAGE_POSITION_GET));
                }
                1 => {
                    dispatcher.dispatch(Message::new(ERROR_NOTIFICATION));
                }
                2 => {
                    dispatcher.dispatch(Message::new(SYSTEM_STATE_CHANGED));
                }
                3 => {
                    dispatcher.dispatch(Message::new(STAGE_POSITION_GET));
                }
                _ => {
                    dispatcher.dispatch(Message::new(0x9999));
                }
            }
        }

        let stats = dispatcher.stats();
        assert_eq!(stats.messages_received, 200);
        assert_eq!(stats.accounted(), 200);
        assert_eq!(stats.responses_dispatched, 40);
        assert_eq!(stats.callbacks_dispatched, 40);
        assert_eq!(stats.unsolicited_queued, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 40);
        assert!(waiting.iter().all(|p| p.try_take().is_some()));
    }
}
