//! Countdown latch for data-pump completion

use tokio::sync::watch;

/// Counts down from a fixed number of expected completions
///
/// `count_down` never blocks and saturates at zero, so an extra signal is
/// harmless. Any number of tasks may wait.
#[derive(Debug, Clone)]
pub struct CompletionLatch {
    remaining: std::sync::Arc<watch::Sender<usize>>,
}

impl CompletionLatch {
    pub fn new(expected: usize) -> Self {
        let (tx, _rx) = watch::channel(expected);
        Self {
            remaining: std::sync::Arc::new(tx),
        }
    }

    pub fn count_down(&self) {
        self.remaining.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }

    /// Wait until every expected completion has been signalled
    pub async fn wait(&self) {
        let mut rx = self.remaining.subscribe();
        // The sender lives in self, so this cannot fail
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}
