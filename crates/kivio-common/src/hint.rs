//! Fast-endpoint hints
//!
//! `fastCache`/`fastDB` are write-mostly hints, not sources of truth: set on
//! a fast success, cleared on timeout or slow response. An atomic pointer
//! swap keeps readers lock-free and writers from holding any lock.

use arc_swap::ArcSwapOption;
use std::sync::Arc;

/// The most recently fast-enough endpoint for a tier.
#[derive(Default)]
pub struct FastHint {
    url: ArcSwapOption<String>,
}

impl FastHint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current hint, if any.
    #[must_use]
    pub fn get(&self) -> Option<String> {
        self.url.load_full().map(|arc| (*arc).clone())
    }

    /// Publish a new hint.
    pub fn set(&self, url: impl Into<String>) {
        self.url.store(Some(Arc::new(url.into())));
    }

    /// Drop the hint; the next request falls back to fan-out.
    pub fn clear(&self) {
        self.url.store(None);
    }
}
