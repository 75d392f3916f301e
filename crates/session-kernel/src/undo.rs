//! Scoped resource release for the start sequence.
//!
//! Every acquired resource pushes an undo step; a failure at step N unwinds
//! 1..N-1 in reverse. Steps swallow their own errors (teardown must not
//! abort teardown), so unwinding always runs to completion.

use futures::future::BoxFuture;
use tracing::debug;

type UndoStep = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
pub struct UndoStack {
    steps: Vec<(&'static str, UndoStep)>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F, Fut>(&mut self, name: &'static str, step: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.steps.push((name, Box::new(move || Box::pin(step()))));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Pop and run every step, newest first.
    pub async fn unwind(mut self) {
        while let Some((name, step)) = self.steps.pop() {
            debug!(step = name, "unwinding");
            step().await;
        }
    }
}
