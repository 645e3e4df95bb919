//! Node-level failure counters.
//!
//! [`NodeMetrics`] is constructed once at startup and handed to the node
//! service; there is no process-global registry.  Both counters are
//! monotonic and exposed for scraping through [`NodeMetrics::encode_text`].

use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cloneable handle over the node's counters (only `Arc` pointers).
#[derive(Clone, Default, Debug)]
pub struct NodeMetrics {
    /// Failed publish calls.
    volume_errors: Arc<AtomicU64>,
    /// Failed unpublish calls.
    volume_del_errors: Arc<AtomicU64>,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_volume_errors(&self) {
        self.volume_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_volume_del_errors(&self) {
        self.volume_del_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of publish calls that failed with an internal error.
    pub fn volume_errors_total(&self) -> u64 {
        self.volume_errors.load(Ordering::Relaxed)
    }

    /// Number of unpublish calls that failed to unmount.
    pub fn volume_del_errors_total(&self) -> u64 {
        self.volume_del_errors.load(Ordering::Relaxed)
    }

    /// Render both counters in the Prometheus text exposition format.
    pub fn encode_text(&self) -> String {
        let mut out = String::new();
        for (name, help, value) in [
            (
                "volume_errors",
                "number of volume errors",
                self.volume_errors_total(),
            ),
            (
                "volume_del_errors",
                "number of volume delete errors",
                self.volume_del_errors_total(),
            ),
        ] {
            // Writing into a String cannot fail.
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }
}
