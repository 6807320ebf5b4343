//! Interceptor chains fired around every store call.
//!
//! A chain is a fold over its interceptors: each one receives the status and
//! the result accumulated so far and returns the next result. The first `Err`
//! stops the fold and is returned to the caller. An empty chain returns the
//! prior result unchanged.

use std::sync::{Arc, Mutex};

use hydro_core::{Error, Result, StatusEntry};
use tracing::debug;

pub trait Interceptor: Send + Sync {
    fn handle(&self, status: &StatusEntry, prior: Result<()>) -> Result<()>;
}

impl<F> Interceptor for F
where
    F: Fn(&StatusEntry, Result<()>) -> Result<()> + Send + Sync,
{
    fn handle(&self, status: &StatusEntry, prior: Result<()>) -> Result<()> {
        self(status, prior)
    }
}

/// Ordered list of interceptors.
pub type Chain = Vec<Arc<dyn Interceptor>>;

pub fn fire(status: &StatusEntry, prior: Result<()>, chain: &[Arc<dyn Interceptor>]) -> Result<()> {
    let mut acc = prior;
    for interceptor in chain {
        acc = interceptor.handle(status, acc);
        if acc.is_err() {
            return acc;
        }
    }
    acc
}

/// Logs every status entry at debug level and passes the result through.
#[derive(Debug, Clone, Default)]
pub struct LogStatus {
    scope: Option<String>,
}

impl LogStatus {
    pub fn new() -> Self { Self::default() }

    /// Tag log lines with a scope, e.g. the operator kind.
    pub fn scoped(scope: impl Into<String>) -> Self {
        Self { scope: Some(scope.into()) }
    }
}

impl Interceptor for LogStatus {
    fn handle(&self, status: &StatusEntry, prior: Result<()>) -> Result<()> {
        let err = prior.as_ref().err().map(ToString::to_string).unwrap_or_default();
        debug!(
            scope = self.scope.as_deref().unwrap_or(""),
            name = %status.name,
            uid = status.uid.as_deref().unwrap_or(""),
            api_version = %status.api_version,
            kind = %status.kind,
            outcome = %status.outcome,
            error = %err,
            "object {}", status.outcome
        );
        prior
    }
}

/// Treats NotFound-class errors as success; everything else passes through.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreNotFound;

impl Interceptor for IgnoreNotFound {
    fn handle(&self, _status: &StatusEntry, prior: Result<()>) -> Result<()> {
        match prior {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

/// External slot a [`CaptureStatus`] interceptor writes into.
#[derive(Debug, Clone, Default)]
pub struct StatusSlot(Arc<Mutex<Option<StatusEntry>>>);

impl StatusSlot {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self) -> Option<StatusEntry> {
        self.0.lock().ok().and_then(|g| g.clone())
    }

    pub fn interceptor(&self) -> CaptureStatus {
        CaptureStatus { slot: self.clone() }
    }
}

/// Stores the last status entry it sees; the result is left untouched.
#[derive(Debug, Clone)]
pub struct CaptureStatus {
    slot: StatusSlot,
}

impl Interceptor for CaptureStatus {
    fn handle(&self, status: &StatusEntry, prior: Result<()>) -> Result<()> {
        if let Ok(mut g) = self.slot.0.lock() {
            *g = Some(status.clone());
        }
        prior
    }
}

/// Interceptor that always fails with `Error::Aborted(reason)`.
pub fn abort_with(reason: impl Into<String>) -> Arc<dyn Interceptor> {
    let reason = reason.into();
    Arc::new(move |_: &StatusEntry, _: Result<()>| -> Result<()> { Err(Error::Aborted(reason.clone())) })
}
