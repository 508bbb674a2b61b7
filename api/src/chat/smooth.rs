//! Chunk smoothing for the outgoing text stream.
//!
//! Providers emit token-sized fragments; forwarding each one produces a
//! jittery client render. The smoother regroups text on line boundaries and
//! flushes a partial line once it has been held too long, so a slow model
//! still appears live.

use std::time::{Duration, Instant};

/// How long a partial line may sit in the buffer before it is flushed anyway.
pub const DEFAULT_MAX_HOLD: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct StreamSmoother {
    buf: String,
    /// When the oldest unflushed byte arrived.
    held_since: Option<Instant>,
    max_hold: Duration,
}

impl StreamSmoother {
    pub fn new(max_hold: Duration) -> Self {
        Self {
            buf: String::new(),
            held_since: None,
            max_hold,
        }
    }

    /// Absorb a fragment, returning the chunks ready to emit. Completed
    /// lines are emitted whole (newline included); a trailing partial line
    /// is held until its line completes or `max_hold` elapses.
    pub fn push(&mut self, delta: &str, now: Instant) -> Vec<String> {
        self.buf.push_str(delta);
        let mut out = Vec::new();
        while let Some(at) = self.buf.find('\n') {
            out.push(self.buf.drain(..=at).collect());
            // Whatever remains arrived with this push.
            self.held_since = Some(now);
        }
        if self.buf.is_empty() {
            self.held_since = None;
        } else {
            let since = *self.held_since.get_or_insert(now);
            if now.duration_since(since) >= self.max_hold {
                out.push(std::mem::take(&mut self.buf));
                self.held_since = None;
            }
        }
        out
    }

    /// When the currently held partial line must be flushed, if anything is
    /// held. Lets the caller arm a timer instead of waiting for the next
    /// delta to re-evaluate the hold.
    pub fn deadline(&self) -> Option<Instant> {
        self.held_since.map(|since| since + self.max_hold)
    }

    /// Emit any held partial line. Call at step boundaries and at end of
    /// stream so held text is never reordered after a tool event or lost.
    pub fn flush(&mut self) -> Option<String> {
        self.held_since = None;
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

impl Default for StreamSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HOLD)
    }
}
