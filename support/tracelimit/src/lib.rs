// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rate-limited [`tracing`] events.
//!
//! Device emulators log malformed guest accesses so that misbehaving guests
//! can be diagnosed, but a guest can reach such a log site in a tight loop.
//! Routing those sites through [`warn_ratelimited!`] caps the volume so the
//! rest of the log stays usable.
//!
//! Each call site gets its own limiter: a fixed window over a coarse
//! millisecond clock that admits a burst of events per window and counts
//! what it drops. The count of suppressed events is attached to the first
//! event of the next window. Counting is approximate under concurrency;
//! the limiter bounds log volume, it does not account exactly.

#![forbid(unsafe_code)]

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::OnceLock;
use std::time::Instant;
#[doc(hidden)]
pub use tracing;

const WINDOW_MS: u32 = 5000;
const BURST: u32 = 10;

static DISABLE_RATE_LIMITING: AtomicBool = AtomicBool::new(false);

/// Disables or reenables rate limiting globally.
///
/// Rate limiting defaults to enabled. Tests and local debugging sessions
/// may want every event.
pub fn disable_rate_limiting(disabled: bool) {
    DISABLE_RATE_LIMITING.store(disabled, Ordering::Relaxed);
}

/// Milliseconds elapsed since the first limiter event in the process.
fn now_ms() -> u64 {
    static CLOCK_BASE: OnceLock<Instant> = OnceLock::new();
    CLOCK_BASE.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[doc(hidden)]
pub struct RateLimiter {
    window_ms: u32,
    burst: u32,
    /// Start of the current window in [`now_ms`] time, or `u64::MAX`
    /// before the first event.
    window_start: AtomicU64,
    /// Events seen in the current window, admitted or not.
    seen: AtomicU32,
    /// Events dropped since the last one logged.
    suppressed: AtomicU64,
}

#[doc(hidden)]
#[derive(Debug)]
pub struct RateLimited;

impl RateLimiter {
    pub const fn new_default() -> Self {
        Self::new(WINDOW_MS, BURST)
    }

    pub const fn new(window_ms: u32, burst: u32) -> Self {
        Self {
            window_ms,
            burst,
            window_start: AtomicU64::new(u64::MAX),
            seen: AtomicU32::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns `Ok(suppressed)` if this event should be logged, where
    /// `suppressed` is `Some(n)` if `n` events were dropped since the last
    /// one logged.
    pub fn event(&self) -> Result<Option<u64>, RateLimited> {
        if DISABLE_RATE_LIMITING.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let now = now_ms();
        let start = self.window_start.load(Ordering::Relaxed);
        if start == u64::MAX || now.saturating_sub(start) >= self.window_ms as u64 {
            // Open a new window; this event is its first.
            self.window_start.store(now, Ordering::Relaxed);
            self.seen.store(1, Ordering::Relaxed);
            let suppressed = self.suppressed.swap(0, Ordering::Relaxed);
            return Ok((suppressed != 0).then_some(suppressed));
        }
        if self.seen.fetch_add(1, Ordering::Relaxed) < self.burst {
            Ok(None)
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            Err(RateLimited)
        }
    }
}

/// As [`tracing::warn!`], but rate limited per call site.
#[macro_export]
macro_rules! warn_ratelimited {
    ($($rest:tt)*) => {
        {
            static LIMITER: $crate::RateLimiter = $crate::RateLimiter::new_default();
            if let Ok(suppressed) = LIMITER.event() {
                $crate::tracing::warn!(suppressed, $($rest)*);
            }
        }
    };
}
