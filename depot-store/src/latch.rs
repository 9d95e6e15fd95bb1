//! One-shot gate shared between the halves of a read pipeline.

use std::sync::Arc;
use tokio::sync::watch;

/// Starts closed; once opened it stays open. Clones share the same gate.
#[derive(Debug, Clone)]
pub struct Latch {
    state: Arc<watch::Sender<bool>>,
}

impl Latch {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// A latch that never blocks.
    pub fn opened() -> Self {
        let latch = Self::new();
        latch.open();
        latch
    }

    pub fn open(&self) {
        self.state.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait until the latch is opened.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
