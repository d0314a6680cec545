use std::time::Duration;

use scopelink_frame::{FrameConfig, DEFAULT_MAX_ADDITIONAL_DATA, DEFAULT_RESYNC_WINDOW, UNSOLICITED_CODES};

/// Background reader configuration.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Read timeout used so the worker can notice pause and stop requests.
    pub poll_interval: Duration,
    /// Consecutive invalid frames that trigger a resynchronization attempt.
    pub resync_threshold: u32,
    /// Raw bytes scanned per resynchronization attempt.
    pub resync_window: usize,
    /// Largest additional-data block accepted after a frame.
    pub max_additional_data: usize,
    /// How long `stop` waits for the worker to exit.
    pub stop_timeout: Duration,
    /// Name given to the worker thread.
    pub thread_name: String,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            resync_threshold: 5,
            resync_window: DEFAULT_RESYNC_WINDOW,
            max_additional_data: DEFAULT_MAX_ADDITIONAL_DATA,
            stop_timeout: Duration::from_secs(2),
            thread_name: "scopelink-reader".to_string(),
        }
    }
}

impl ReaderConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_resync_threshold(mut self, threshold: u32) -> Self {
        self.resync_threshold = threshold.max(1);
        self
    }

    pub fn with_resync_window(mut self, window: usize) -> Self {
        self.resync_window = window;
        self
    }

    pub fn with_max_additional_data(mut self, max: usize) -> Self {
        self.max_additional_data = max;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Frame reader settings derived from this configuration.
    pub(crate) fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_additional_data: self.max_additional_data,
            resync_window: self.resync_window,
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Capacity of the fallback queue for unhandled notifications.
    pub unsolicited_capacity: usize,
    /// Codes routed to the fallback queue when no handler is registered.
    pub unsolicited_codes: Vec<u32>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            unsolicited_capacity: 100,
            unsolicited_codes: UNSOLICITED_CODES.to_vec(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_unsolicited_capacity(mut self, capacity: usize) -> Self {
        self.unsolicited_capacity = capacity;
        self
    }

    pub fn with_unsolicited_codes(mut self, codes: impl IntoIterator<Item = u32>) -> Self {
        self.unsolicited_codes = codes.into_iter().collect();
        self
    }

    pub fn is_unsolicited(&self, code: u32) -> bool {
        self.unsolicited_codes.contains(&code)
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    /// How long a synchronous exchange waits for the reader to pause.
    pub pause_timeout: Duration,
    pub reader: ReaderConfig,
    pub dispatcher: DispatcherConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            pause_timeout: Duration::from_secs(2),
            reader: ReaderConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_pause_timeout(mut self, timeout: Duration) -> Self {
        self.pause_timeout = timeout;
        self
    }

    pub fn with_reader(mut self, reader: ReaderConfig) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }
}
