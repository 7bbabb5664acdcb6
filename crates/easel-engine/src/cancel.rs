use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::RunError;

/// Cooperative cancellation flag threaded through a run.
///
/// Checked before every network call and every sleep; once set, the run
/// fails with [`RunError::Aborted`] and makes no further provider calls.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            return Err(RunError::Aborted.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::RunError;

    use super::CancelSignal;

    #[test]
    fn check_fails_only_after_cancel() {
        let cancel = CancelSignal::new();
        assert!(cancel.check().is_ok());

        let observer = cancel.clone();
        cancel.cancel();
        assert!(observer.is_cancelled());
        let err = observer.check().expect_err("cancelled signal must fail");
        assert!(RunError::is_aborted(&err));
    }
}
