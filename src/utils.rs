//! Utility functions shared by the pipeline stages.
//!

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::ResolveError;

/// Render an opaque byte string for log and error messages.
///
/// Invalid UTF-8 is replaced, so the result is not suitable for output.
pub fn display_bytes(buf: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(buf)
}

/// Shared cancellation flag, checked at every line read and line write, per
/// record pushed into or merged out of the external sort, and per shuffle bucket.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns [`ResolveError::Cancelled`] once the token has been tripped.
    #[inline]
    pub fn check(&self) -> Result<(), ResolveError> {
        if self.is_cancelled() {
            Err(ResolveError::Cancelled)
        } else {
            Ok(())
        }
    }
}
