// Fixed-window request limiter keyed by client identity

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Counter for one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub count: u32,
    pub window_start: Instant,
}

pub struct RateLimiter {
    windows: Mutex<HashMap<String, RateWindow>>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window_length(&self) -> Duration {
        self.window
    }

    pub fn prune(&self) {
        self.prune_at(Instant::now())
    }

    pub fn allow(&self, client: &str) -> bool {
        self.allow_at(client, Instant::now())
    }

    /// Count a request at `now`. The window restarts once more than `window`
    /// has passed since it opened; otherwise the request is allowed while the
    /// count stays within the limit.
    pub fn allow_at(&self, client: &str, now: Instant) -> bool {
        let mut windows = match self.windows.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };

        let entry = windows.entry(client.to_string()).or_insert(RateWindow {
            count: 0,
            window_start: now,
        });

        if now.saturating_duration_since(entry.window_start) > self.window {
            entry.count = 1;
            entry.window_start = now;
            return true;
        }

        entry.count = entry.count.saturating_add(1);
        entry.count <= self.limit
    }

    /// Snapshot of a client's window
    pub fn window(&self, client: &str) -> Option<RateWindow> {
        self.windows.lock().ok()?.get(client).copied()
    }

    /// Seconds until the client's window restarts
    pub fn retry_after(&self, client: &str) -> u64 {
        self.retry_after_at(client, Instant::now())
    }

    pub fn retry_after_at(&self, client: &str, now: Instant) -> u64 {
        match self.window(client) {
            Some(w) => {
                let reset = w.window_start + self.window;
                reset.saturating_duration_since(now).as_secs().max(1)
            }
            None => 0,
        }
    }

    /// Drop windows that have fully expired
    pub fn prune_at(&self, now: Instant) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.retain(|_, w| now.saturating_duration_since(w.window_start) <= self.window);
        }
    }
}
