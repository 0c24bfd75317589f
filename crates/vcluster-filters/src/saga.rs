//! Compensation for multi-step writes which span two API servers.
//!
//! There is no transaction spanning the physical and the virtual cluster. A
//! [`Saga`] records a compensating action for every completed write. If a
//! later step fails, [`Saga::roll_back`] runs the recorded compensations in
//! reverse order. Compensations are best effort: their failures are logged and
//! reported in the [`CompensationReport`], but never replace the error which
//! caused the roll back.
use std::future::Future;

use futures::future::BoxFuture;

use crate::client;

struct Compensation {
    step: &'static str,
    action: BoxFuture<'static, client::Result<()>>,
}

/// The outcome of running the compensations of a [`Saga`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CompensationReport {
    /// The steps whose compensation ran, in the order they ran.
    pub compensated: Vec<&'static str>,

    /// The steps whose compensation failed. The resources created by these
    /// steps may be orphaned.
    pub failed: Vec<&'static str>,
}

impl CompensationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// An ordered list of compensating actions for the writes done so far.
///
/// A saga must be finished with either [`Saga::complete`] or
/// [`Saga::roll_back`]. If it is dropped with pending compensations, for
/// example because the request future was cancelled, the compensations are
/// spawned onto the current Tokio runtime.
#[must_use = "a saga must be completed or rolled back"]
pub struct Saga {
    name: &'static str,
    compensations: Vec<Compensation>,
}

impl Saga {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            compensations: Vec::new(),
        }
    }

    /// Records the compensation for the just completed `step`.
    pub fn on_rollback<F>(&mut self, step: &'static str, action: F)
    where
        F: Future<Output = client::Result<()>> + Send + 'static,
    {
        tracing::trace!(saga = self.name, step, "recorded compensation");
        self.compensations.push(Compensation {
            step,
            action: Box::pin(action),
        });
    }

    /// The number of recorded compensations.
    pub fn pending(&self) -> usize {
        self.compensations.len()
    }

    /// Finishes the saga successfully. All recorded compensations are dropped
    /// without running.
    pub fn complete(mut self) {
        tracing::trace!(saga = self.name, "saga completed");
        self.compensations.clear();
    }

    /// Runs all recorded compensations in reverse order.
    pub async fn roll_back(mut self) -> CompensationReport {
        let compensations = std::mem::take(&mut self.compensations);
        run_compensations(self.name, compensations).await
    }
}

impl Drop for Saga {
    fn drop(&mut self) {
        if self.compensations.is_empty() {
            return;
        }

        let compensations = std::mem::take(&mut self.compensations);
        let saga = self.name;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    saga,
                    pending = compensations.len(),
                    "saga was interrupted, rolling back in the background"
                );
                handle.spawn(run_compensations(saga, compensations));
            }
            Err(_) => {
                tracing::error!(
                    saga,
                    pending = compensations.len(),
                    "saga was interrupted outside of a runtime, resources may be orphaned"
                );
            }
        }
    }
}

async fn run_compensations(
    saga: &'static str,
    compensations: Vec<Compensation>,
) -> CompensationReport {
    let mut report = CompensationReport::default();

    for Compensation { step, action } in compensations.into_iter().rev() {
        match action.await {
            Ok(()) => {
                tracing::info!(saga, step, "compensated step");
            }
            Err(error) => {
                tracing::warn!(
                    saga,
                    step,
                    error = %error,
                    "failed to compensate step, resources may be orphaned"
                );
                report.failed.push(step);
            }
        }

        report.compensated.push(step);
    }

    report
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::sync::oneshot;

    use super::*;
    use crate::codec::ApiStatus;

    fn recording(
        log: &Arc<Mutex<Vec<&'static str>>>,
        step: &'static str,
    ) -> impl Future<Output = client::Result<()>> + Send + 'static {
        let log = log.clone();
        async move {
            log.lock().expect("lock is not poisoned").push(step);
            Ok(())
        }
    }

    #[tokio::test]
    async fn rolls_back_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut saga = Saga::new("test");
        saga.on_rollback("first", recording(&log, "first"));
        saga.on_rollback("second", recording(&log, "second"));

        let report = saga.roll_back().await;

        assert!(report.is_clean());
        assert_eq!(report.compensated, vec!["second", "first"]);
        assert_eq!(*log.lock().expect("lock is not poisoned"), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn failed_compensations_are_reported_and_do_not_stop_roll_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut saga = Saga::new("test");
        saga.on_rollback("first", recording(&log, "first"));
        saga.on_rollback("second", async {
            Err(client::Error::Api {
                status: ApiStatus::internal_error("boom"),
            })
        });

        let report = saga.roll_back().await;

        assert_eq!(report.failed, vec!["second"]);
        assert_eq!(report.compensated, vec!["second", "first"]);
        assert_eq!(*log.lock().expect("lock is not poisoned"), vec!["first"]);
    }

    #[tokio::test]
    async fn completed_saga_does_not_compensate() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut saga = Saga::new("test");
        saga.on_rollback("first", recording(&log, "first"));
        assert_eq!(saga.pending(), 1);

        saga.complete();
        tokio::task::yield_now().await;

        assert!(log.lock().expect("lock is not poisoned").is_empty());
    }

    #[tokio::test]
    async fn dropped_saga_compensates_in_background() {
        let (tx, rx) = oneshot::channel();
        let mut saga = Saga::new("test");
        saga.on_rollback("first", async move {
            let _ = tx.send(());
            Ok(())
        });

        drop(saga);

        rx.await.expect("compensation ran in the background");
    }
}
