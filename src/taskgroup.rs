//! Fail-fast task group.
//!
//! A group aggregates a set of concurrent stages under one cancellation
//! token: the first child to return an error cancels every sibling, as does
//! cancelling the parent token. `wait` blocks until all children have
//! exited and returns the first error, if any.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct TaskGroup {
    token: CancellationToken,
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl TaskGroup {
    /// A group whose token is a child of `parent`: cancelling the parent
    /// cancels this group, never the other way around.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            handles: Vec::new(),
        }
    }

    /// The group's cancellation token, for stages to select on.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a stage. The future receives the group token; returning an
    /// error cancels the whole group.
    pub fn spawn<F, Fut>(&mut self, stage: &'static str, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let token = self.token.clone();
        let fut = f(token.clone());
        self.handles.push(tokio::spawn(async move {
            let result = fut.await;
            if let Err(e) = &result {
                warn!(stage = %stage, error = %e, "Stage failed, cancelling group");
                token.cancel();
            }
            result
        }));
    }

    /// Cancel the group pre-emptively.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for every stage to exit; returns the first stage error.
    pub async fn wait(self) -> anyhow::Result<()> {
        let mut first_err = None;
        for handle in self.handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(anyhow::anyhow!("stage panicked: {e}"));
                    }
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
