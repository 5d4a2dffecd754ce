//! The `progress` / `done` / `fail` channel triple.
//!
//! All three channels are unbounded so a task never blocks on reporting,
//! even after the consuming loop has stopped reading.

use tokio::sync::mpsc;

/// Terminal report of a task that did not fail fatally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Identity of the finished task, e.g. the unit name.
    pub id: String,
    /// Set when the task's own unit failed but the batch should carry on.
    pub error: Option<String>,
}

impl Completion {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: Some(error.into()),
        }
    }
}

/// One message received by the coordinating loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Progress(String),
    Done(Completion),
    Fail(String),
}

/// Create a connected sender/receiver pair.
pub fn channels() -> (SignalSender, SignalReceiver) {
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let (fail_tx, fail_rx) = mpsc::unbounded_channel();

    (
        SignalSender {
            progress: progress_tx,
            done: done_tx,
            fail: fail_tx,
        },
        SignalReceiver {
            progress: progress_rx,
            done: done_rx,
            fail: fail_rx,
        },
    )
}

/// Sending half, cloned into every task.
#[derive(Debug, Clone)]
pub struct SignalSender {
    progress: mpsc::UnboundedSender<String>,
    done: mpsc::UnboundedSender<Completion>,
    fail: mpsc::UnboundedSender<String>,
}

impl SignalSender {
    pub fn progress(&self, message: impl Into<String>) {
        if self.progress.send(message.into()).is_err() {
            tracing::debug!("Progress signal dropped, receiver closed");
        }
    }

    pub fn done(&self, completion: Completion) {
        if self.done.send(completion).is_err() {
            tracing::debug!("Done signal dropped, receiver closed");
        }
    }

    pub fn fail(&self, message: impl Into<String>) {
        if self.fail.send(message.into()).is_err() {
            tracing::debug!("Fail signal dropped, receiver closed");
        }
    }

    /// Per-task handle that must be finished exactly once.
    pub fn task(&self, id: impl Into<String>) -> TaskSignals {
        TaskSignals {
            id: id.into(),
            sender: self.clone(),
            finished: false,
        }
    }
}

/// Signals for one task.
///
/// [`finish`](TaskSignals::finish) consumes the handle, so a task cannot
/// report twice. A handle dropped unfinished (early return, panic) sends a
/// `fail` on the task's behalf, so a task can never report nothing.
#[derive(Debug)]
pub struct TaskSignals {
    id: String,
    sender: SignalSender,
    finished: bool,
}

impl TaskSignals {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn progress(&self, message: impl Into<String>) {
        self.sender.progress(message);
    }

    /// Report success.
    pub fn done(self) {
        self.finish(Ok(None));
    }

    /// Report the task's terminal outcome.
    ///
    /// - `Ok(None)` -- success.
    /// - `Ok(Some(error))` -- the task's own unit failed; the batch carries on.
    /// - `Err(message)` -- batch-fatal failure.
    pub fn finish(mut self, outcome: Result<Option<String>, String>) {
        self.finished = true;
        match outcome {
            Ok(None) => self.sender.done(Completion::ok(self.id.clone())),
            Ok(Some(error)) => self.sender.done(Completion::failed(self.id.clone(), error)),
            Err(message) => self.sender.fail(message),
        }
    }
}

impl Drop for TaskSignals {
    fn drop(&mut self) {
        if !self.finished {
            self.sender
                .fail(format!("{}: task ended without reporting a result", self.id));
        }
    }
}

/// Receiving half, owned by the coordinating loop.
#[derive(Debug)]
pub struct SignalReceiver {
    progress: mpsc::UnboundedReceiver<String>,
    done: mpsc::UnboundedReceiver<Completion>,
    fail: mpsc::UnboundedReceiver<String>,
}

impl SignalReceiver {
    /// Wait for the next signal.
    ///
    /// Channels are polled in the order progress, done, fail. Returns `None`
    /// once every sender is gone and all channels are empty.
    pub async fn recv(&mut self) -> Option<Signal> {
        tokio::select! {
            biased;
            Some(message) = self.progress.recv() => Some(Signal::Progress(message)),
            Some(completion) = self.done.recv() => Some(Signal::Done(completion)),
            Some(message) = self.fail.recv() => Some(Signal::Fail(message)),
            else => None,
        }
    }

    /// Take every progress message already queued, without waiting.
    pub fn drain_progress(&mut self) -> Vec<String> {
        let mut drained = Vec::new();
        while let Ok(message) = self.progress.try_recv() {
            drained.push(message);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn progress_is_polled_before_done_and_fail() {
        let (tx, mut rx) = channels();
        tx.fail("boom");
        tx.done(Completion::ok("a"));
        tx.progress("step 1");

        assert_eq!(rx.recv().await, Some(Signal::Progress("step 1".into())));
        assert_eq!(rx.recv().await, Some(Signal::Done(Completion::ok("a"))));
        assert_eq!(rx.recv().await, Some(Signal::Fail("boom".into())));
    }

    #[tokio::test]
    async fn recv_returns_none_when_senders_dropped() {
        let (tx, mut rx) = channels();
        tx.progress("last");
        drop(tx);

        assert_eq!(rx.recv().await, Some(Signal::Progress("last".into())));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn task_finish_sends_exactly_one_signal() {
        let (tx, mut rx) = channels();
        tx.task("consul").done();
        tx.task("httpproxy").finish(Ok(Some("push failed".into())));
        tx.task("cas").finish(Err("fatal".into()));
        drop(tx);

        let mut signals = Vec::new();
        while let Some(signal) = rx.recv().await {
            signals.push(signal);
        }
        assert_eq!(
            signals,
            vec![
                Signal::Done(Completion::ok("consul")),
                Signal::Done(Completion::failed("httpproxy", "push failed")),
                Signal::Fail("fatal".into()),
            ]
        );
    }

    #[tokio::test]
    async fn dropped_task_handle_reports_failure() {
        let (tx, mut rx) = channels();
        {
            let _handle = tx.task("consul");
        }
        drop(tx);

        match rx.recv().await {
            Some(Signal::Fail(message)) => assert!(message.starts_with("consul:")),
            other => panic!("expected fail signal, got {other:?}"),
        }
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn sending_after_receiver_dropped_does_not_panic() {
        let (tx, rx) = channels();
        drop(rx);
        tx.progress("orphan");
        tx.done(Completion::ok("a"));
        tx.fail("orphan");
    }

    #[tokio::test]
    async fn drain_progress_takes_queued_messages() {
        let (tx, mut rx) = channels();
        tx.progress("a");
        tx.progress("b");
        assert_eq!(rx.drain_progress(), vec!["a", "b"]);
        assert!(rx.drain_progress().is_empty());
    }
}
