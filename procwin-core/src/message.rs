use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::windower::Window;

/// Key used for every element of a stream that is not keyed.
pub const NON_KEYED_STREAM: &str = "NON_KEYED_STREAM";

/// An element of the stream, stamped with the processing time at which it entered the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct Element<T> {
    pub key: String,
    pub value: T,
    pub processing_time: DateTime<Utc>,
}

/// Output of a fired window for one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowResult<O> {
    pub key: String,
    pub window: Window,
    pub value: O,
}
