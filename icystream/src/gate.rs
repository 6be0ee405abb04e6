//! Porte à déclenchement unique
//!
//! [`TriggerGate`] se résout exactement une fois, au premier `write` ou au
//! premier `close` du [`TriggerWriter`] qui l'entoure, quel que soit le nombre
//! d'appelants concurrents. Elle sert à retarder le démarrage de l'émetteur
//! périodique du multiplexeur jusqu'à l'arrivée de vraies données.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tracing::trace;

struct GateInner {
    resolved: Mutex<bool>,
    tx: watch::Sender<bool>,
}

/// Signal à résolution unique, observable par un nombre quelconque d'attentes
#[derive(Clone)]
pub struct TriggerGate {
    inner: Arc<GateInner>,
}

impl Default for TriggerGate {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(GateInner {
                resolved: Mutex::new(false),
                tx,
            }),
        }
    }

    /// Résout la porte ; retourne `true` pour l'unique appel qui l'a résolue
    pub fn trigger(&self) -> bool {
        let mut resolved = self.inner.resolved.lock().unwrap_or_else(|e| e.into_inner());
        if *resolved {
            return false;
        }
        *resolved = true;
        self.inner.tx.send_replace(true);
        trace!("Trigger gate resolved");
        true
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.tx.borrow()
    }

    /// Attend la résolution ; retourne immédiatement si elle a déjà eu lieu
    pub async fn wait_for_trigger(&self) {
        let mut rx = self.inner.tx.subscribe();
        // Le Sender vit dans `inner`, tenu par `self` : wait_for ne peut échouer
        let _ = rx.wait_for(|resolved| *resolved).await;
    }
}

/// Writer qui résout une [`TriggerGate`] à la première écriture ou fermeture
pub struct TriggerWriter<W> {
    inner: W,
    gate: TriggerGate,
}

impl<W> TriggerWriter<W> {
    pub fn new(inner: W, gate: TriggerGate) -> Self {
        Self { inner, gate }
    }

    pub fn gate(&self) -> &TriggerGate {
        &self.gate
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for TriggerWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.gate.trigger();
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.gate.trigger();
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_writes_and_closes_resolve_once() {
        for (writes, closes) in [(1, 0), (0, 1), (8, 0), (0, 8), (16, 16)] {
            let gate = TriggerGate::new();
            let handles: Vec<_> = (0..(writes + closes))
                .map(|i| {
                    let gate = gate.clone();
                    tokio::spawn(async move {
                        let mut writer = TriggerWriter::new(tokio::io::sink(), gate);
                        if i < writes {
                            writer.write_all(b"x").await.unwrap();
                        } else {
                            writer.shutdown().await.unwrap();
                        }
                    })
                })
                .collect();
            for h in handles {
                h.await.unwrap();
            }

            assert!(gate.is_triggered());
            assert!(!gate.trigger(), "a resolved gate never resolves again");
        }
    }

    #[tokio::test]
    async fn test_exactly_one_trigger_call_wins() {
        let gate = TriggerGate::new();
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let gate = gate.clone();
                let winners = winners.clone();
                tokio::spawn(async move {
                    if gate.trigger() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiters_observe_resolution() {
        let gate = TriggerGate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_for_trigger().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let mut writer = TriggerWriter::new(tokio::io::sink(), gate.clone());
        writer.write_all(b"payload").await.unwrap();
        waiter.await.unwrap();

        // Un observateur tardif voit la résolution immédiatement
        tokio::time::timeout(Duration::from_millis(10), gate.wait_for_trigger())
            .await
            .expect("late waiter must not block");
    }

    #[tokio::test(start_paused = true)]
    async fn test_untouched_gate_never_resolves() {
        let gate = TriggerGate::new();
        let _writer = TriggerWriter::new(tokio::io::sink(), gate.clone());
        let waited = tokio::time::timeout(Duration::from_secs(60), gate.wait_for_trigger()).await;
        assert!(waited.is_err());
        assert!(!gate.is_triggered());
    }
}
