//! Processing-time aligned windows. Elements are assigned to tumbling or sliding windows by the
//! wall-clock time at which they arrive. Every partition keeps per-key pane state and fires the
//! windows which became due on every slide boundary of its own timer.
//!
//! ```text
//! send ──► partition queue ──► WindowOperator ──► PaneAccumulator
//!                ▲                   │
//!           TimerScheduler           └──► WindowResult ──► output channel
//! ```

pub use crate::error::{Error, Result};

mod error;

pub mod config;
pub mod function;
pub mod message;
pub mod metrics;
pub mod operator;
pub mod pane;
pub mod runtime;
pub mod timer;
pub mod windower;

mod partition;

pub use config::{Settings, WindowConfig};
pub use function::{AccumulationMode, Count, Mean, Sum, WindowFunction};
pub use message::{NON_KEYED_STREAM, WindowResult};
pub use runtime::WindowRuntime;
pub use timer::{Clock, MonotonicClock, SystemClock};
pub use windower::{Window, WindowAssigner, WindowCapabilities, WindowKind};
