//! Cancellation and deadlines for ingestion jobs and retrieval calls.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Caller side of a cancellation pair.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

/// Observed by long-running work. Cheap to clone; fires when the paired
/// handle cancels or the optional deadline passes.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    receiver: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        CancelHandle { sender },
        CancelSignal {
            receiver: Some(receiver),
            deadline: None,
        },
    )
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self::default()
    }

    /// Adds a deadline `timeout` from now, keeping an earlier one if set.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    pub fn with_optional_timeout(self, timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => self.with_timeout(timeout),
            None => self,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        let flagged = self
            .receiver
            .as_ref()
            .is_some_and(|receiver| *receiver.borrow());
        let expired = self.deadline.is_some_and(|deadline| Instant::now() >= deadline);
        flagged || expired
    }

    /// Resolves once the signal fires. Pending forever for [`CancelSignal::never`].
    pub async fn cancelled(&self) {
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        let mut receiver = self.receiver.clone();
        let flagged = async move {
            if let Some(receiver) = receiver.as_mut() {
                loop {
                    if *receiver.borrow_and_update() {
                        return;
                    }
                    if receiver.changed().await.is_err() {
                        break;
                    }
                }
            }
            std::future::pending::<()>().await
        };

        tokio::select! {
            _ = expired => {}
            _ = flagged => {}
        }
    }

    /// Runs `future` unless the signal fires first.
    pub async fn run<F: Future>(&self, future: F) -> Option<F::Output> {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            output = future => Some(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_cancels_pending_work() {
        let (handle, signal) = cancel_pair();
        assert!(!signal.is_cancelled());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.run(std::future::pending::<()>()).await })
        };
        handle.cancel();

        let outcome = waiter.await.expect("task joins");
        assert!(outcome.is_none());
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_expires() {
        let signal = CancelSignal::never().with_timeout(Duration::from_millis(10));
        let outcome = signal
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(outcome.is_none());
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn never_lets_work_finish() {
        let signal = CancelSignal::never();
        assert_eq!(signal.run(async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn dropped_handle_does_not_cancel() {
        let (handle, signal) = cancel_pair();
        drop(handle);
        let outcome = signal
            .run(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                "done"
            })
            .await;
        assert_eq!(outcome, Some("done"));
    }
}
