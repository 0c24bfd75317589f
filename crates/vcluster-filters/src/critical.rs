//! Running side-effecting sequences independently of request cancellation.
//!
//! Request handlers are futures which are dropped when the client goes away or
//! a timeout fires. Once a sequence of writes spanning both clusters has
//! started, dropping it half-way leaves an inconsistent pair behind. Such
//! sequences run through [`critical_section`], which detaches them from the
//! request future.
use std::future::Future;

use snafu::{ResultExt as _, Snafu};
use tokio::task::JoinError;
use tracing::Instrument as _;

#[derive(Debug, Snafu)]
#[snafu(display("critical section {name:?} did not run to completion"))]
pub struct CriticalSectionError {
    source: JoinError,
    name: &'static str,
}

/// Runs `future` to completion as an independent task and waits for its
/// output.
///
/// If the caller is dropped while waiting, the spawned task keeps running
/// until it finishes. The current tracing span is propagated into the task.
/// A panic inside the section is returned as an error.
pub async fn critical_section<F>(
    name: &'static str,
    future: F,
) -> Result<F::Output, CriticalSectionError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tracing::debug!(critical_section = name, "entering critical section");

    let output = tokio::spawn(future.in_current_span())
        .await
        .context(CriticalSectionSnafu { name })?;

    tracing::debug!(critical_section = name, "left critical section");
    Ok(output)
}
