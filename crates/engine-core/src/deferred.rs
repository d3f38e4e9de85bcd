use std::{fmt::Display, future::Future};
use thiserror::Error;

/// Returned when a deferred value already failed to resolve once.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Deferred value is unusable: {0}")]
pub struct Unusable(pub String);

/// A value computed on first use and cached afterwards.
///
/// A failed resolution is remembered as `Unusable` and is not retried.
#[derive(Debug, Clone, Default)]
pub enum Deferred<T> {
    #[default]
    Unresolved,
    Resolved(T),
    Unusable(String),
}

impl<T> Deferred<T> {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Deferred::Resolved(_))
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Deferred::Resolved(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the cached value, running `resolve` if nothing was tried yet.
    ///
    /// The first failure is returned as is; later calls fail with
    /// [`Unusable`] carrying its message.
    pub async fn get_or_resolve<F, Fut, E>(&mut self, resolve: F) -> Result<&T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + From<Unusable>,
    {
        if let Deferred::Unresolved = self {
            match resolve().await {
                Ok(value) => *self = Deferred::Resolved(value),
                Err(err) => {
                    *self = Deferred::Unusable(err.to_string());
                    return Err(err);
                }
            }
        }

        match self {
            Deferred::Resolved(value) => Ok(value),
            Deferred::Unusable(cause) => Err(Unusable(cause.clone()).into()),
            Deferred::Unresolved => Err(Unusable("not resolved".into()).into()),
        }
    }
}
