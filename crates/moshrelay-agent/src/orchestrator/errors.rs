//! First-outcome-wins reporting from session tasks to the orchestrator.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SessionError;

type Outcome = Result<(), SessionError>;

/// Create a reporting channel with one slot per reporting task, so no
/// reporter ever waits on a full channel.
pub fn error_channel(reporters: usize) -> (Reporter, Aggregator) {
    let (tx, rx) = mpsc::channel(reporters.max(1));
    (Reporter { tx }, Aggregator { rx })
}

/// Handed to each task that can end the session.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: mpsc::Sender<Outcome>,
}

impl Reporter {
    /// Report how a task ended. Never blocks; reports that arrive after
    /// shutdown has begun are dropped.
    pub fn report(&self, outcome: Outcome) {
        if let Err(e) = self.tx.try_send(outcome) {
            let outcome = match e {
                mpsc::error::TrySendError::Full(outcome)
                | mpsc::error::TrySendError::Closed(outcome) => outcome,
            };
            debug!(?outcome, "Discarded late task report");
        }
    }
}

/// Receiving side; only the first outcome is ever acted upon.
#[derive(Debug)]
pub struct Aggregator {
    rx: mpsc::Receiver<Outcome>,
}

impl Aggregator {
    /// Wait for the first report, or [`SessionError::Cancelled`] if `cancel`
    /// fires first. Once every reporter is gone without a report, the session
    /// has nothing left running and ends cleanly.
    pub async fn first(&mut self, cancel: &CancellationToken) -> Outcome {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SessionError::Cancelled),
            outcome = self.rx.recv() => outcome.unwrap_or(Ok(())),
        }
    }
}
