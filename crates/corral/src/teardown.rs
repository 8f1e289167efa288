//! First-error accumulator for best-effort multi-step cleanup.

use corral_common::{CorralError, CorralResult};

/// Runs every cleanup step regardless of earlier failures and reports the
/// first error once all steps have run.
#[derive(Debug)]
#[must_use = "call finish() to observe the first error"]
pub(crate) struct Teardown {
    subject: String,
    first: Option<CorralError>,
    failed: usize,
}

impl Teardown {
    pub(crate) fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            first: None,
            failed: 0,
        }
    }

    /// Record the outcome of one step.
    pub(crate) fn record<T>(&mut self, step: &'static str, result: CorralResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(subject = %self.subject, step, error = %err, "Cleanup step failed");
                self.failed += 1;
                self.first.get_or_insert(err);
                None
            }
        }
    }

    pub(crate) fn finish(self) -> CorralResult<()> {
        match self.first {
            None => Ok(()),
            Some(err) => {
                tracing::debug!(subject = %self.subject, failed = self.failed, "Cleanup finished with errors");
                Err(err)
            }
        }
    }
}
