//! Isolate configuration.

use serde::{Deserialize, Serialize};

/// Configuration used when creating an isolate.
///
/// A `max_heap_size_bytes` of zero leaves the isolate's heap unrestricted.
/// Nonzero values require the `IsolateMaxHeapSize` capability on the
/// connected service; creating an isolate with a bound the service cannot
/// enforce fails with `Error::Unsupported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolateSettings {
    /// Maximum heap size in bytes; zero means unrestricted.
    #[serde(default)]
    pub max_heap_size_bytes: u64,
}

impl IsolateSettings {
    /// Settings with an unrestricted heap.
    pub fn new() -> Self {
        Self {
            max_heap_size_bytes: 0,
        }
    }

    /// Settings with a bounded maximum heap size.
    pub fn with_max_heap_size_bytes(max_heap_size_bytes: u64) -> Self {
        Self {
            max_heap_size_bytes,
        }
    }
}

impl Default for IsolateSettings {
    fn default() -> Self {
        Self::new()
    }
}
