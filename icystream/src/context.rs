//! Contexte partagé du pipeline
//!
//! Remplace l'état global : chaque composant reçoit explicitement le même
//! [`PipelineContext`], qui porte le signal d'annulation commun et la première
//! erreur fatale remontée par une tâche.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::StreamError;

#[derive(Clone, Default)]
pub struct PipelineContext {
    cancel: CancellationToken,
    fatal: Arc<Mutex<Option<StreamError>>>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construit un contexte autour d'un token existant (ex : Ctrl+C)
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            fatal: Arc::default(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Token enfant : annulé avec le contexte, annulable seul
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Enregistre une erreur fatale (seule la première est conservée) et annule tout
    pub fn fail(&self, err: StreamError) {
        let mut slot = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            error!("Fatal pipeline error: {}", err);
            *slot = Some(err);
        }
        drop(slot);
        self.cancel.cancel();
    }

    pub fn has_failed(&self) -> bool {
        self.fatal
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(true)
    }

    /// Retire l'erreur fatale enregistrée
    pub fn take_fatal(&self) -> Option<StreamError> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
