//! The runtime handle.
//!
//! A [`Runtime`] scopes the process-wide pieces the rest of the library
//! needs: the deadline timer thread and one-time TLS provider
//! initialization. Creating one replaces a global init call; dropping
//! the last clone releases the timer. Channels and servers hold a
//! clone, so the runtime outlives everything built from it.

use std::sync::{Arc, Once, Weak};
use std::time::Instant;

use crate::call::CallShared;
use crate::deadline::Timer;

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}

static TLS_PROVIDER_INIT: Once = Once::new();

struct RuntimeInner {
    timer: Timer,
}

/// Scoped library runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new() -> Self {
        TLS_PROVIDER_INIT.call_once(|| {
            // Idempotent across runtimes; failure means another
            // provider was installed already, which is fine.
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        });

        Self {
            inner: Arc::new(RuntimeInner {
                timer: Timer::new(),
            }),
        }
    }

    pub(crate) fn schedule_deadline(&self, at: Instant, call: Weak<CallShared>) {
        self.inner.timer.schedule(at, call);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matches_manifest() {
        assert_eq!(version(), env!("CARGO_PKG_VERSION"));
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn runtimes_are_independent() {
        let a = Runtime::new();
        let b = Runtime::new();
        drop(a);
        // Dropping one runtime leaves the other's timer running.
        let _clone = b.clone();
    }
}
