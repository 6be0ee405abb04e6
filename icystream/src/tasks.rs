//! Groupe de tâches structuré
//!
//! Les tâches d'un groupe partagent un token enfant du [`PipelineContext`].
//! Une tâche [`FailurePolicy::Fatal`] qui échoue annule le groupe et enregistre
//! l'erreur dans le contexte, ce qui annule tout le processus.

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{PipelineContext, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Journaliser et continuer
    Log,
    /// Annuler le groupe et remonter l'erreur
    Fatal,
}

pub struct TaskGroup {
    ctx: PipelineContext,
    token: CancellationToken,
    set: JoinSet<()>,
}

impl TaskGroup {
    pub fn new(ctx: PipelineContext) -> Self {
        let token = ctx.child_token();
        Self {
            ctx,
            token,
            set: JoinSet::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, policy: FailurePolicy, task: F)
    where
        F: Future<Output = Result<(), StreamError>> + Send + 'static,
    {
        let ctx = self.ctx.clone();
        let token = self.token.clone();
        self.set.spawn(async move {
            match task.await {
                Ok(()) => debug!(task = name, "Task finished"),
                Err(e) => match policy {
                    FailurePolicy::Log => warn!(task = name, "Task failed: {}", e),
                    FailurePolicy::Fatal => {
                        error!(task = name, "Task failed: {}", e);
                        token.cancel();
                        ctx.fail(e);
                    }
                },
            }
        });
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Attend toutes les tâches ; retourne l'erreur fatale éventuelle
    pub async fn join(mut self) -> Result<(), StreamError> {
        while let Some(joined) = self.set.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    self.ctx.fail(StreamError::TaskPanicked("group member"));
                }
            }
        }
        match self.ctx.take_fatal() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fatal_failure_cancels_siblings_and_context() {
        let ctx = PipelineContext::new();
        let mut group = TaskGroup::new(ctx.clone());

        let token = group.token();
        group.spawn("waiter", FailurePolicy::Log, async move {
            token.cancelled().await;
            Ok(())
        });
        group.spawn("broken", FailurePolicy::Fatal, async {
            Err(StreamError::setup("transport down"))
        });

        let result = tokio::time::timeout(Duration::from_secs(5), group.join())
            .await
            .expect("group must finish after a fatal error");
        assert!(matches!(result, Err(StreamError::Setup(_))));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_logged_failure_is_not_fatal() {
        let ctx = PipelineContext::new();
        let mut group = TaskGroup::new(ctx.clone());
        group.spawn("flaky", FailurePolicy::Log, async {
            Err(StreamError::setup("ignored"))
        });
        assert_eq!(group.len(), 1);

        group.join().await.unwrap();
        assert!(!ctx.is_cancelled());
    }
}
