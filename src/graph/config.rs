//! Store configuration

use serde::{Deserialize, Serialize};

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Catch panics raised by deferred subscribers and conditions, log them
    /// and keep draining the queue
    pub isolate_panics: bool,
    /// Log every emitted event at debug level
    pub trace_events: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            isolate_panics: true,
            trace_events: false,
        }
    }
}
