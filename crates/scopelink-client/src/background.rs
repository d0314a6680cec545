//! Background thread that drains the command channel.
//!
//! The worker is the only reader of the command socket. It decodes frames,
//! hands them to the [`Dispatcher`], recovers from corrupted streams and can
//! be paused so a legacy caller may borrow the socket for a synchronous
//! exchange. Bytes of a partially received frame are parked while paused so
//! the borrower can finish that frame before reading its own.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use scopelink_frame::{FrameError, FrameReader, Message, ReadEvent, ResyncOutcome};
use scopelink_transport::PollRead;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::ReaderConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ClientError, Result};
use crate::stats::{ReaderCounters, ReaderStats};

/// Lifecycle of the background reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderState {
    NotStarted,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug)]
struct Control {
    state: ReaderState,
    alive: bool,
    shutdown: bool,
    pause_requested: bool,
    pause_confirmed: bool,
    /// Undecoded bytes parked by the worker while paused.
    parked: BytesMut,
}

#[derive(Debug)]
struct Shared {
    control: Mutex<Control>,
    changed: Condvar,
    counters: ReaderCounters,
}

enum Gate {
    Run,
    Resumed,
    Shutdown,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Control>, timeout: Duration) -> MutexGuard<'a, Control> {
        let (guard, _) = self
            .changed
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        guard
    }

    fn shutting_down(&self) -> bool {
        self.lock().shutdown
    }
}

/// Marks the worker finished even if the loop unwinds.
struct FinishGuard(Arc<Shared>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let mut control = self.0.lock();
        control.alive = false;
        control.pause_confirmed = false;
        control.state = ReaderState::Stopped;
        self.0.changed.notify_all();
    }
}

/// Owns the worker thread reading frames from the command channel.
#[derive(Debug)]
pub struct BackgroundReader {
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    config: ReaderConfig,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundReader {
    pub fn new(dispatcher: Arc<Dispatcher>, config: ReaderConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: ReaderState::NotStarted,
                    alive: false,
                    shutdown: false,
                    pause_requested: false,
                    pause_confirmed: false,
                    parked: BytesMut::new(),
                }),
                changed: Condvar::new(),
                counters: ReaderCounters::default(),
            }),
            dispatcher,
            config,
            handle: Mutex::new(None),
        }
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the worker on `source`.
    ///
    /// Returns `Ok(false)` without spawning if a worker is already running.
    pub fn start<S>(&self, source: S) -> Result<bool>
    where
        S: PollRead + 'static,
    {
        let mut handle = self.lock_handle();
        {
            let mut control = self.shared.lock();
            if control.alive {
                warn!("background reader already running");
                return Ok(false);
            }
            control.alive = true;
            control.shutdown = false;
            control.pause_requested = false;
            control.pause_confirmed = false;
            control.parked.clear();
            control.state = ReaderState::Running;
        }

        if let Some(previous) = handle.take() {
            let _ = previous.join();
        }

        let shared = Arc::clone(&self.shared);
        let dispatcher = Arc::clone(&self.dispatcher);
        let config = self.config.clone();
        let spawned = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || run(shared, dispatcher, config, source));

        match spawned {
            Ok(join) => {
                *handle = Some(join);
                info!(thread = %self.config.thread_name, "background reader started");
                Ok(true)
            }
            Err(err) => {
                let mut control = self.shared.lock();
                control.alive = false;
                control.state = ReaderState::Stopped;
                Err(ClientError::ReaderSpawn(err))
            }
        }
    }

    /// Request shutdown and wait up to `timeout` for the worker to exit.
    ///
    /// Returns false if the worker did not finish in time; it is detached and
    /// exits on its next poll.
    pub fn stop(&self, timeout: Duration) -> bool {
        let mut handle = self.lock_handle();
        let deadline = Instant::now() + timeout;
        let mut control = self.shared.lock();
        if !control.alive && handle.is_none() {
            return true;
        }
        control.shutdown = true;
        control.pause_requested = false;
        self.shared.changed.notify_all();

        while control.alive {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            control = self.shared.wait(control, deadline - now);
        }
        let finished = !control.alive;
        drop(control);

        match handle.take() {
            Some(join) if finished => {
                if join.join().is_err() {
                    error!("background reader panicked");
                }
                info!("background reader stopped");
            }
            Some(_) => warn!(?timeout, "background reader did not stop in time"),
            None => {}
        }
        finished
    }

    /// Ask the worker to stop reading and wait for it to acknowledge.
    ///
    /// The pause stays requested even if the acknowledgement times out.
    /// Returns true once no read can be in progress.
    pub fn pause(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut control = self.shared.lock();
        control.pause_requested = true;
        self.shared.changed.notify_all();

        while control.alive && !control.pause_confirmed {
            let now = Instant::now();
            if now >= deadline {
                warn!(?timeout, "background reader did not acknowledge pause");
                return false;
            }
            control = self.shared.wait(control, deadline - now);
        }
        true
    }

    /// Let the worker continue reading.
    pub fn resume(&self) {
        let mut control = self.shared.lock();
        if control.pause_requested {
            control.pause_requested = false;
            self.shared.changed.notify_all();
        }
    }

    /// Take the bytes a paused worker had received but not yet decoded.
    ///
    /// They start on a frame boundary. Empty unless the pause was
    /// acknowledged.
    pub fn take_buffered(&self) -> BytesMut {
        std::mem::take(&mut self.shared.lock().parked)
    }

    /// Hand bytes back to the paused worker; it decodes them first on resume.
    pub fn restore_buffered(&self, mut bytes: BytesMut) {
        if bytes.is_empty() {
            return;
        }
        let mut control = self.shared.lock();
        bytes.extend_from_slice(&control.parked);
        control.parked = bytes;
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().alive
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().state == ReaderState::Paused
    }

    pub fn state(&self) -> ReaderState {
        self.shared.lock().state
    }

    pub fn stats(&self) -> ReaderStats {
        self.shared.counters.snapshot()
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }
}

impl Drop for BackgroundReader {
    fn drop(&mut self) {
        self.stop(self.config.stop_timeout);
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Worker<S> {
    reader: FrameReader<S>,
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    config: ReaderConfig,
    invalid_streak: u32,
    resyncing: bool,
    reported_bytes: u64,
}

fn run<S: PollRead>(shared: Arc<Shared>, dispatcher: Arc<Dispatcher>, config: ReaderConfig, mut source: S) {
    let _finish = FinishGuard(Arc::clone(&shared));

    if let Err(err) = source.set_poll_timeout(Some(config.poll_interval)) {
        shared.counters.socket_errors.inc();
        error!(error = %err, "failed to configure reader poll timeout");
        return;
    }

    let mut worker = Worker {
        reader: FrameReader::with_config(source, config.frame_config()),
        shared,
        dispatcher,
        config,
        invalid_streak: 0,
        resyncing: false,
        reported_bytes: 0,
    };
    worker.run();
}

impl<S: PollRead> Worker<S> {
    fn run(&mut self) {
        loop {
            match self.gate() {
                Gate::Shutdown => break,
                Gate::Run => {}
                Gate::Resumed => {
                    // The socket may have been borrowed with another timeout.
                    if let Err(err) = self.reader.get_mut().set_poll_timeout(Some(self.config.poll_interval)) {
                        self.shared.counters.socket_errors.inc();
                        error!(error = %err, "failed to restore reader poll timeout");
                        break;
                    }
                }
            }

            // Once resynchronizing, no bytes are decoded without a marker scan.
            let flow = if self.resyncing { self.resync() } else { self.poll() };
            if let Flow::Stop = flow {
                break;
            }
        }
        debug!("background reader loop exited");
    }

    /// Checked before every read. Parks undecoded bytes while paused.
    fn gate(&mut self) -> Gate {
        let mut control = self.shared.lock();
        if control.shutdown {
            return Gate::Shutdown;
        }
        if !control.pause_requested {
            return Gate::Run;
        }

        // A stream being resynchronized has no frame boundary to hand over.
        if !self.resyncing {
            control.parked = self.reader.take_buffered();
        }
        control.pause_confirmed = true;
        control.state = ReaderState::Paused;
        self.shared.changed.notify_all();
        debug!(parked = control.parked.len(), "background reader paused");

        while control.pause_requested && !control.shutdown {
            control = self.shared.wait(control, self.config.poll_interval);
        }
        control.pause_confirmed = false;
        self.reader.restore_buffered(std::mem::take(&mut control.parked));
        if control.shutdown {
            return Gate::Shutdown;
        }
        control.state = ReaderState::Running;
        debug!("background reader resumed");
        Gate::Resumed
    }

    fn poll(&mut self) -> Flow {
        let polled = self.reader.poll_frame();
        self.sync_bytes();
        match polled {
            Ok(None) => Flow::Continue,
            Ok(Some(ReadEvent::Frame(message))) => {
                self.deliver(message);
                Flow::Continue
            }
            Ok(Some(ReadEvent::Invalid(message))) => {
                debug!(code = message.command_code, "frame markers invalid");
                self.on_unusable_frame("invalid frame markers")
            }
            Err(FrameError::AdditionalDataTooLarge { size, max }) => {
                debug!(size, max, "additional data exceeds limit");
                self.on_unusable_frame("additional data too large")
            }
            Err(err) => self.on_error(err),
        }
    }

    fn deliver(&mut self, message: Message) {
        self.shared.counters.messages_read.inc();
        self.invalid_streak = 0;
        debug!(
            code = message.command_code,
            status = message.status_code,
            extra = message.additional_data_size,
            "frame received"
        );
        self.dispatcher.dispatch(message);
    }

    fn on_unusable_frame(&mut self, reason: &str) -> Flow {
        self.shared.counters.invalid_frames.inc();
        self.shared.counters.parse_errors.inc();
        self.invalid_streak = self.invalid_streak.saturating_add(1);
        let streak = self.invalid_streak;
        if streak <= 3 || streak % 100 == 0 {
            warn!(consecutive = streak, reason, "discarding frame");
        }
        if streak >= self.config.resync_threshold {
            self.resyncing = true;
        }
        Flow::Continue
    }

    /// One scan for the next start marker; repeated until a frame is recovered.
    fn resync(&mut self) -> Flow {
        let outcome = self.reader.resync();
        self.sync_bytes();
        if !matches!(outcome, Ok(ResyncOutcome::NotFound { discarded: 0 })) {
            self.shared.counters.resync_attempts.inc();
        }
        match outcome {
            Ok(ResyncOutcome::Recovered { message, discarded }) => {
                self.shared.counters.resync_successes.inc();
                self.resyncing = false;
                info!(discarded, code = message.command_code, "stream resynchronized");
                self.deliver(message);
                Flow::Continue
            }
            Ok(ResyncOutcome::NotFound { .. } | ResyncOutcome::Rejected { .. }) => Flow::Continue,
            Ok(ResyncOutcome::Incomplete { discarded }) => {
                debug!(discarded, "resync candidate incomplete");
                Flow::Continue
            }
            Err(FrameError::AdditionalDataTooLarge { size, max }) => {
                debug!(size, max, "resync candidate announced oversized data");
                self.shared.counters.parse_errors.inc();
                Flow::Continue
            }
            Err(err) => self.on_error(err),
        }
    }

    fn on_error(&mut self, err: FrameError) -> Flow {
        if self.shared.shutting_down() {
            return Flow::Stop;
        }
        match err {
            FrameError::ConnectionClosed => {
                self.shared.counters.socket_errors.inc();
                warn!("instrument closed the command channel");
                Flow::Stop
            }
            FrameError::Io(err) => {
                self.shared.counters.socket_errors.inc();
                error!(error = %err, "command channel read failed");
                Flow::Stop
            }
            other => {
                self.shared.counters.parse_errors.inc();
                warn!(error = %other, "failed to process frame");
                Flow::Continue
            }
        }
    }

    fn sync_bytes(&mut self) {
        let total = self.reader.bytes_read();
        self.shared.counters.bytes_read.add(total - self.reported_bytes);
        self.reported_bytes = total;
    }
}
