//! Window assignment for processing-time aligned windows. A window of `size` is created every
//! `slide`, and every window start is an epoch-relative multiple of `slide`, so independent operator
//! instances agree on the boundaries without talking to each other.
//!
//! When `slide == size` the windows are tumbling and every timestamp belongs to exactly one window.
//! When `slide < size` the windows overlap, e.g. with size 30s and slide 10s a timestamp of 100
//! belongs to `[80, 110)`, `[90, 120)` and `[100, 130)`. To avoid re-aggregating the overlap, the
//! timeline is cut into `slide` sized [Pane]s and a window is the union of `size / slide` panes.
//!
//! Windows that would start before the epoch are never produced, so during warm-up a timestamp
//! belongs to fewer than `size / slide` windows.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

/// Truncates a timestamp to the closest multiple of the given duration at or before it.
pub(crate) fn truncate_to_duration(timestamp_millis: i64, duration_millis: i64) -> i64 {
    timestamp_millis.div_euclid(duration_millis) * duration_millis
}

/// Converts epoch millis into a [DateTime], saturating at the bounds chrono can represent.
pub(crate) fn utc_from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(if millis < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// A Window is represented by its start and end time, `[start_time, end_time)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Window {
    /// Start time of the window (inclusive).
    pub start_time: DateTime<Utc>,
    /// End time of the window (exclusive).
    pub end_time: DateTime<Utc>,
}

impl Ord for Window {
    fn cmp(&self, other: &Self) -> Ordering {
        // windows are closed in the order of their end time
        self.end_time
            .cmp(&other.end_time)
            .then_with(|| self.start_time.cmp(&other.start_time))
    }
}

impl PartialOrd for Window {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Window {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start_millis(), self.end_millis())
    }
}

impl Window {
    pub fn new(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time,
        }
    }

    pub(crate) fn from_millis(start_millis: i64, end_millis: i64) -> Self {
        Self::new(utc_from_millis(start_millis), utc_from_millis(end_millis))
    }

    pub fn start_millis(&self) -> i64 {
        self.start_time.timestamp_millis()
    }

    pub fn end_millis(&self) -> i64 {
        self.end_time.timestamp_millis()
    }

    /// Returns true if the timestamp falls in `[start_time, end_time)`.
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start_time <= timestamp && timestamp < self.end_time
    }
}

/// A Pane is the `slide` sized building block of a [Window]. Panes are ordered by their start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pane {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl Pane {
    pub(crate) fn from_millis(start_millis: i64, end_millis: i64) -> Self {
        Self {
            start_time: utc_from_millis(start_millis),
            end_time: utc_from_millis(end_millis),
        }
    }

    pub fn start_millis(&self) -> i64 {
        self.start_time.timestamp_millis()
    }
}

impl Display for Pane {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pane[{}, {})",
            self.start_millis(),
            self.end_time.timestamp_millis()
        )
    }
}

/// The two shapes of aligned processing-time windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Tumbling { size: Duration },
    Sliding { size: Duration, slide: Duration },
}

/// When a window of this family fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Fire once, when processing time reaches the window end (always a slide boundary).
    ProcessingTimeWindowEnd,
}

/// What the aligned processing-time window family supports. The surrounding engine is expected to
/// check these before attempting a topology change or a restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCapabilities {
    pub trigger: TriggerKind,
    pub event_time: bool,
    pub evictors: bool,
    pub rescalable: bool,
    pub restorable: bool,
}

/// Assigns processing-time windows and panes to timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAssigner {
    kind: WindowKind,
    size_millis: i64,
    slide_millis: i64,
}

fn duration_to_millis(name: &str, duration: Duration) -> Result<i64> {
    if duration.is_zero() {
        return Err(Error::Config(format!("window {name} must be positive")));
    }
    if duration.subsec_nanos() % 1_000_000 != 0 {
        return Err(Error::Config(format!(
            "window {name} must be a whole number of milliseconds, got {duration:?}"
        )));
    }
    i64::try_from(duration.as_millis())
        .map_err(|_| Error::Config(format!("window {name} {duration:?} is too large")))
}

impl WindowAssigner {
    /// Creates an assigner for windows of `size` created every `slide`. `slide` has to evenly divide
    /// `size`, otherwise a window would be made of partial panes.
    pub fn new(size: Duration, slide: Duration) -> Result<Self> {
        let size_millis = duration_to_millis("size", size)?;
        let slide_millis = duration_to_millis("slide", slide)?;

        // the first window, [0, size), has to be representable
        if size_millis > DateTime::<Utc>::MAX_UTC.timestamp_millis() {
            return Err(Error::Config(format!(
                "window size {size:?} ends after the latest representable time"
            )));
        }
        if size_millis % slide_millis != 0 {
            return Err(Error::Config(format!(
                "window slide ({slide_millis}ms) must evenly divide window size ({size_millis}ms)"
            )));
        }

        let kind = if size_millis == slide_millis {
            WindowKind::Tumbling { size }
        } else {
            WindowKind::Sliding { size, slide }
        };

        Ok(Self {
            kind,
            size_millis,
            slide_millis,
        })
    }

    pub fn tumbling(size: Duration) -> Result<Self> {
        Self::new(size, size)
    }

    pub fn sliding(size: Duration, slide: Duration) -> Result<Self> {
        Self::new(size, slide)
    }

    pub fn kind(&self) -> WindowKind {
        self.kind
    }

    pub fn is_tumbling(&self) -> bool {
        matches!(self.kind, WindowKind::Tumbling { .. })
    }

    pub fn size(&self) -> Duration {
        match self.kind {
            WindowKind::Tumbling { size } | WindowKind::Sliding { size, .. } => size,
        }
    }

    pub fn slide(&self) -> Duration {
        match self.kind {
            WindowKind::Tumbling { size } => size,
            WindowKind::Sliding { slide, .. } => slide,
        }
    }

    pub(crate) fn size_millis(&self) -> i64 {
        self.size_millis
    }

    pub(crate) fn slide_millis(&self) -> i64 {
        self.slide_millis
    }

    /// Number of windows a warmed-up pane is part of.
    pub fn windows_per_pane(&self) -> usize {
        (self.size_millis / self.slide_millis) as usize
    }

    pub fn capabilities(&self) -> WindowCapabilities {
        WindowCapabilities {
            trigger: TriggerKind::ProcessingTimeWindowEnd,
            event_time: false,
            evictors: false,
            rescalable: false,
            restorable: false,
        }
    }

    /// Returns the windows the timestamp belongs to, oldest start first.
    pub fn assign_windows(&self, timestamp: DateTime<Utc>) -> Vec<Window> {
        let timestamp_millis = timestamp.timestamp_millis();

        match self.kind {
            WindowKind::Tumbling { .. } => {
                let start = truncate_to_duration(timestamp_millis, self.size_millis);
                if start < 0 {
                    return vec![];
                }
                vec![Window::from_millis(
                    start,
                    start.saturating_add(self.size_millis),
                )]
            }
            WindowKind::Sliding { .. } => {
                // the youngest window containing the timestamp starts at the closest slide boundary
                // at or before it, the oldest one starts `size - slide` before that.
                let youngest_start = truncate_to_duration(timestamp_millis, self.slide_millis);
                let oldest_start = youngest_start - (self.size_millis - self.slide_millis);

                let mut windows = Vec::with_capacity(self.windows_per_pane());
                // both are multiples of slide, so the clamped start stays on a slide boundary
                let mut start = oldest_start.max(0);
                while start <= youngest_start {
                    windows.push(Window::from_millis(
                        start,
                        start.saturating_add(self.size_millis),
                    ));
                    start += self.slide_millis;
                }
                windows
            }
        }
    }

    /// Returns the pane the timestamp falls into.
    pub fn pane_for(&self, timestamp: DateTime<Utc>) -> Pane {
        let start = truncate_to_duration(timestamp.timestamp_millis(), self.slide_millis);
        Pane::from_millis(start, start.saturating_add(self.slide_millis))
    }

    /// Returns the panes which make up the window, in increasing start order.
    pub fn panes_of(&self, window: &Window) -> Vec<Pane> {
        let end = window.end_millis();
        let mut panes = Vec::with_capacity(self.windows_per_pane());
        let mut start = window.start_millis();
        while start < end {
            panes.push(Pane::from_millis(start, start + self.slide_millis));
            start += self.slide_millis;
        }
        panes
    }

    /// Returns the window of this assigner which ends at the given time.
    pub(crate) fn window_ending_at(&self, end_millis: i64) -> Window {
        Window::from_millis(end_millis - self.size_millis, end_millis)
    }
}
