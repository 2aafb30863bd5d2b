//! Runtime knobs for watch sessions, read from `VINK_*` environment variables.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Channel capacity between a transport and its session.
    pub stream_buffer: usize,
    /// Upper bound for one cascade lookup; `None` waits indefinitely.
    pub lookup_timeout: Option<Duration>,
    /// Pending errors kept per subscription; newer errors are dropped when full.
    pub error_queue_cap: usize,
    /// Resolve cascade links for types that declare them.
    pub cascade: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { stream_buffer: 1024, lookup_timeout: Some(Duration::from_secs(30)), error_queue_cap: 64, cascade: true }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let stream_buffer = std::env::var("VINK_STREAM_BUFFER").ok().and_then(|s| s.parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(d.stream_buffer);
        // 0 disables the timeout
        let lookup_timeout = match std::env::var("VINK_LOOKUP_TIMEOUT_MS").ok().and_then(|s| s.parse::<u64>().ok()) {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => d.lookup_timeout,
        };
        let error_queue_cap = std::env::var("VINK_ERROR_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(d.error_queue_cap);
        let cascade = std::env::var("VINK_CASCADE").map(|v| v != "0" && !v.eq_ignore_ascii_case("false")).unwrap_or(d.cascade);
        Self { stream_buffer, lookup_timeout, error_queue_cap, cascade }
    }

    pub fn without_cascade(mut self) -> Self {
        self.cascade = false;
        self
    }
}
