//! Cooperative cancellation shared by every long-running step.

use std::error::Error;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Shared flag observed at natural suspension points (between rows,
/// between changes, between steps).
pub type CancelState = CancellationToken;

/// The controlled-unwind signal. Never a failure in its own right: anything
/// that carries it somewhere in its `source()` chain is a cancellation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("Operation canceled")]
pub struct Canceled;

/// Returns `Err(Canceled)` once cancellation was requested.
#[inline]
pub fn check(cancel: &CancelState) -> Result<(), Canceled> {
    if cancel.is_cancelled() {
        Err(Canceled)
    } else {
        Ok(())
    }
}

/// Walks the error chain looking for the cancellation signal.
pub fn is_cancellation(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<Canceled>() {
            return true;
        }
        current = e.source();
    }
    false
}
