use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

/// One escalated failure, as handed to the host's error hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub message: String,
    pub error: Option<String>,
}

pub type ErrorHook = Arc<dyn Fn(&ErrorReport) + Send + Sync>;

/// Sink for conditions that need a human: the circuit breaker tripping,
/// storage that could not be initialised, entries dropped for good.
/// Every report is logged whether or not a hook is installed.
#[derive(Clone, Default)]
pub struct ErrorReporter {
    hook: Option<ErrorHook>,
}

impl ErrorReporter {
    pub fn new(hook: ErrorHook) -> Self {
        Self { hook: Some(hook) }
    }

    pub fn report(&self, message: impl Into<String>, err: Option<&dyn fmt::Display>) {
        let report = ErrorReport {
            message: message.into(),
            error: err.map(ToString::to_string),
        };
        error!(error = ?report.error, "{}", report.message);

        if let Some(hook) = &self.hook {
            if catch_unwind(AssertUnwindSafe(|| hook(&report))).is_err() {
                warn!("error hook panicked while handling a report");
            }
        }
    }
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("hook", &self.hook.is_some())
            .finish()
    }
}
