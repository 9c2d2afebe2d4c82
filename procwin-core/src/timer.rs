//! Processing-time timers. Every partition owns one [TimerScheduler] which wakes it up on every
//! slide boundary. Boundaries are multiples of the slide relative to the epoch, so schedulers of
//! different partitions (and different hosts) fire for the same windows at the same wall-clock
//! instant without any coordination, as long as their clocks are reasonably in sync.
//!
//! A delayed wake-up is never caught up by firing the missed deadlines one after the other. The
//! next deadline is always computed from the current time and the late wake-up closes every window
//! which became due in the meantime.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{partition_labels, window_metrics};
use crate::windower::{WindowAssigner, truncate_to_duration, utc_from_millis};

/// Source of processing time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system wall clock on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock read once at creation and advanced by tokio's monotonic clock afterward, so step
/// adjustments of the system clock do not move deadlines backwards. Under a paused tokio runtime
/// it only moves when tokio's time is advanced.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin_wall: DateTime<Utc>,
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(origin_wall: DateTime<Utc>) -> Self {
        Self {
            origin_wall,
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed =
            chrono::Duration::from_std(self.origin.elapsed()).unwrap_or(chrono::Duration::MAX);
        self.origin_wall
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Returns the smallest epoch-relative multiple of `slide_millis` strictly greater than `now`.
pub fn next_deadline(slide_millis: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    let now_millis = now.timestamp_millis();
    utc_from_millis(truncate_to_duration(now_millis, slide_millis).saturating_add(slide_millis))
}

/// Cancels the wake-ups of a [TimerScheduler]. Cancelling is idempotent.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cln_token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cln_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cln_token.is_cancelled()
    }
}

pub struct TimerScheduler {
    slide_millis: i64,
    clock: Arc<dyn Clock>,
    cln_token: CancellationToken,
    /// Last deadline handed out, deadlines are strictly increasing.
    last_deadline: Option<i64>,
    partition: u16,
}

impl TimerScheduler {
    pub fn new(assigner: &WindowAssigner, clock: Arc<dyn Clock>, partition: u16) -> Self {
        Self {
            slide_millis: assigner.slide_millis(),
            clock,
            cln_token: CancellationToken::new(),
            last_deadline: None,
            partition,
        }
    }

    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            cln_token: self.cln_token.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cln_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cln_token.is_cancelled()
    }

    /// Computes the next slide boundary after the current time. If the clock went backwards the
    /// boundary after the previous deadline is used instead, a deadline is never handed out twice.
    pub fn schedule_next(&mut self) -> DateTime<Utc> {
        let mut deadline = next_deadline(self.slide_millis, self.clock.now()).timestamp_millis();
        if let Some(last) = self.last_deadline {
            deadline = deadline.max(last.saturating_add(self.slide_millis));
        }
        self.last_deadline = Some(deadline);
        utc_from_millis(deadline)
    }

    /// Sleeps until the next deadline and returns it, or None once the scheduler is cancelled.
    pub async fn wait_next(&mut self) -> Option<DateTime<Utc>> {
        if self.is_cancelled() {
            return None;
        }

        let deadline = self.schedule_next();
        let delay = (deadline - self.clock.now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = self.cln_token.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        let lag = self.clock.now() - deadline;
        window_metrics()
            .timer_lag
            .get_or_create(&partition_labels(self.partition))
            .observe(lag.num_milliseconds().max(0) as f64);
        if lag.num_milliseconds() >= self.slide_millis {
            warn!(
                partition = self.partition,
                deadline = deadline.timestamp_millis(),
                lag_ms = lag.num_milliseconds(),
                "Timer wake-up is late by more than a slide, overdue windows close together"
            );
        }

        Some(deadline)
    }

    /// Starts a task delivering every deadline into `tx`, wrapped by `wrap`. The task stops when the
    /// scheduler is cancelled or the receiver is dropped.
    pub fn start<M, W>(mut self, tx: mpsc::Sender<M>, wrap: W) -> JoinHandle<()>
    where
        M: Send + 'static,
        W: Fn(DateTime<Utc>) -> M + Send + 'static,
    {
        tokio::spawn(async move {
            info!(partition = self.partition, slide_ms = self.slide_millis, "Timer started");
            while let Some(deadline) = self.wait_next().await {
                debug!(
                    partition = self.partition,
                    deadline = deadline.timestamp_millis(),
                    "Timer fired"
                );
                if tx.send(wrap(deadline)).await.is_err() {
                    break;
                }
            }
            info!(partition = self.partition, "Timer stopped");
        })
    }
}
