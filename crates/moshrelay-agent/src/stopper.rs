//! Uniform teardown for everything the orchestrator starts.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::SessionError;

/// Anything with a stop operation: links and subprocesses.
///
/// `stop` must be idempotent and must succeed when the component was never
/// started or has already finished.
#[async_trait]
pub trait Stopper: Send + Sync {
    /// Short label used in log lines.
    fn component(&self) -> &'static str;

    async fn stop(&self) -> Result<(), SessionError>;
}

/// Stoppers in start order; stopped in reverse.
#[derive(Default)]
pub struct Teardown {
    stoppers: Vec<Arc<dyn Stopper>>,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component right before it is started.
    pub fn push(&mut self, stopper: Arc<dyn Stopper>) {
        debug!(component = stopper.component(), "Registered for teardown");
        self.stoppers.push(stopper);
    }

    pub fn len(&self) -> usize {
        self.stoppers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stoppers.is_empty()
    }

    /// Stop every component, most recently started first. Every component is
    /// stopped even if an earlier one fails; the first failure is returned.
    pub async fn stop_all(self) -> Result<(), SessionError> {
        let mut first_error = None;
        for stopper in self.stoppers.into_iter().rev() {
            match stopper.stop().await {
                Ok(()) => debug!(component = stopper.component(), "Stopped"),
                Err(e) => {
                    warn!(component = stopper.component(), error = %e, "Failed to stop");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::link::LinkError;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Stopper for Recorder {
        fn component(&self) -> &'static str {
            self.label
        }

        async fn stop(&self) -> Result<(), SessionError> {
            self.log.lock().unwrap().push(self.label);
            if self.fail {
                Err(SessionError::link(self.label, LinkError::NoPeer))
            } else {
                Ok(())
            }
        }
    }

    fn recorder(
        label: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    ) -> Arc<dyn Stopper> {
        Arc::new(Recorder {
            label,
            log: Arc::clone(log),
            fail,
        })
    }

    #[tokio::test]
    async fn stops_in_reverse_start_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut teardown = Teardown::new();
        teardown.push(recorder("process", &log, false));
        teardown.push(recorder("relay", &log, false));
        teardown.push(recorder("loopback", &log, false));
        assert_eq!(teardown.len(), 3);

        teardown.stop_all().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["loopback", "relay", "process"]);
    }

    #[tokio::test]
    async fn first_failure_wins_and_all_are_stopped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut teardown = Teardown::new();
        teardown.push(recorder("first", &log, true));
        teardown.push(recorder("second", &log, true));
        teardown.push(recorder("third", &log, false));

        let err = teardown.stop_all().await.unwrap_err();
        assert!(matches!(err, SessionError::Link { stage: "second", .. }));
        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn empty_teardown_is_ok() {
        let teardown = Teardown::new();
        assert!(teardown.is_empty());
        teardown.stop_all().await.unwrap();
    }
}
