//! Composed abort signals.
//!
//! Three chained sources: an external abort from the caller, the per-step
//! deadline, and the exception signal raised when a sibling task fails
//! fatally. Tasks observe the composite and stop cooperatively; an abort
//! observed after a prior error is secondary and not reported. Signals are
//! plain shared state — no listeners outlive a step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Why the composite signal fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortKind {
    /// The caller cancelled the invocation.
    External,
    /// The per-step deadline expired.
    Timeout,
    /// A sibling task raised a fatal error.
    Exception,
}

/// One abort source.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        while !self.is_set() {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// The three abort sources of one superstep.
#[derive(Clone, Debug, Default)]
pub struct AbortSignals {
    pub external: AbortSignal,
    pub timeout: AbortSignal,
    pub exception: AbortSignal,
}

impl AbortSignals {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Which source has fired, if any. External wins over timeout wins over
    /// exception when several have fired.
    #[must_use]
    pub fn aborted(&self) -> Option<AbortKind> {
        if self.external.is_set() {
            Some(AbortKind::External)
        } else if self.timeout.is_set() {
            Some(AbortKind::Timeout)
        } else if self.exception.is_set() {
            Some(AbortKind::Exception)
        } else {
            None
        }
    }

    /// Wait until any source fires.
    pub async fn wait_any(&self) -> AbortKind {
        loop {
            if let Some(kind) = self.aborted() {
                return kind;
            }
            tokio::select! {
                () = self.external.wait() => {}
                () = self.timeout.wait() => {}
                () = self.exception.wait() => {}
            }
        }
    }

    /// Fresh timeout and exception sources for the next step, keeping the
    /// caller's external signal chained in.
    #[must_use]
    pub fn next_step(&self) -> Self {
        Self {
            external: self.external.clone(),
            timeout: AbortSignal::new(),
            exception: AbortSignal::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_any_sees_late_set() {
        let signals = AbortSignals::new();
        let waiter = signals.clone();
        let handle = tokio::spawn(async move { waiter.wait_any().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        signals.exception.set();
        assert_eq!(handle.await.unwrap(), AbortKind::Exception);
    }

    #[test]
    fn priority_order() {
        let signals = AbortSignals::new();
        signals.exception.set();
        signals.external.set();
        assert_eq!(signals.aborted(), Some(AbortKind::External));
    }

    #[test]
    fn next_step_keeps_external() {
        let signals = AbortSignals::new();
        signals.external.set();
        signals.timeout.set();
        let next = signals.next_step();
        assert!(next.external.is_set());
        assert!(!next.timeout.is_set());
    }
}
