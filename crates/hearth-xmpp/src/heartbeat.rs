//! Periodic work driven off one shared tick.
//!
//! Statistics flushing and stale-registration cleanup run here even when
//! no socket is active. Karma is not recovered here; each connection does
//! that on its own tick. Beats are registered with an interval and run from
//! [`Heartbeat::run`], or synchronously from [`Heartbeat::tick_at`] in tests. A beat that returns
//! [`HandlerResult::Unregister`] is removed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::routing::HandlerResult;
use crate::XmppError;

/// Handle for a registered beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BeatId(u64);

type BeatFn = Box<dyn FnMut() -> HandlerResult + Send>;

struct Beat {
    id: BeatId,
    interval: Duration,
    next_due: Instant,
    run: BeatFn,
}

/// Registry of periodic callbacks.
pub struct Heartbeat {
    beats: Mutex<Vec<Beat>>,
    next_id: AtomicU64,
}

impl Heartbeat {
    /// Empty heartbeat.
    pub fn new() -> Self {
        Self {
            beats: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `beat` every `interval`, first after one interval has passed.
    ///
    /// Beats run with the registry locked: a beat must not call back into
    /// its own heartbeat.
    pub fn register<F>(&self, interval: Duration, beat: F) -> Result<BeatId, XmppError>
    where
        F: FnMut() -> HandlerResult + Send + 'static,
    {
        self.register_at(interval, beat, Instant::now())
    }

    /// [`register`](Self::register) with an explicit clock.
    pub fn register_at<F>(&self, interval: Duration, beat: F, now: Instant) -> Result<BeatId, XmppError>
    where
        F: FnMut() -> HandlerResult + Send + 'static,
    {
        if interval.is_zero() {
            return Err(XmppError::config("heartbeat interval must be non-zero"));
        }

        let id = BeatId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut beats = self.beats.lock().unwrap_or_else(|e| e.into_inner());
        beats.push(Beat {
            id,
            interval,
            next_due: now + interval,
            run: Box::new(beat),
        });
        debug!(beat = id.0, interval_ms = interval.as_millis() as u64, "Registered heartbeat");
        Ok(id)
    }

    /// Remove a beat. Returns `false` if it was already gone.
    pub fn unregister(&self, id: BeatId) -> bool {
        let mut beats = self.beats.lock().unwrap_or_else(|e| e.into_inner());
        let before = beats.len();
        beats.retain(|b| b.id != id);
        beats.len() != before
    }

    /// Number of registered beats.
    pub fn len(&self) -> usize {
        self.beats.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no beats are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every beat that is due at `now`. Returns how many ran.
    pub fn tick_at(&self, now: Instant) -> usize {
        let mut beats = self.beats.lock().unwrap_or_else(|e| e.into_inner());
        let mut ran = 0;

        beats.retain_mut(|beat| {
            if now < beat.next_due {
                return true;
            }
            ran += 1;
            beat.next_due = now + beat.interval;

            match (beat.run)() {
                HandlerResult::Unregister => {
                    debug!(beat = beat.id.0, "Heartbeat unregistered itself");
                    false
                }
                HandlerResult::Error => {
                    warn!(beat = beat.id.0, "Heartbeat reported an error");
                    true
                }
                HandlerResult::Pass | HandlerResult::Done | HandlerResult::Last => true,
            }
        });

        ran
    }

    /// Tick every `period` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Heartbeat stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick_at(tokio::time::Instant::now().into_std());
                }
            }
        }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}
