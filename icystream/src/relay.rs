//! Boucle de copie principale
//!
//! [`RetryCopyLoop`] tire les octets de la sortie du [`SourceReader`] et les
//! pousse dans l'[`OutputPipeline`], sous chien de garde, avec un plancher de
//! durée par itération. Elle ne s'arrête que sur fin de flux propre ou
//! annulation, et ferme toujours le puits en sortie.
//!
//! [`SourceReader`]: crate::SourceReader

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::copy::copy_with_watchdog;
use crate::metrics::BandwidthMetrics;
use crate::output::OutputPipeline;
use crate::{CopyError, PipelineContext, Result};

/// Raison de sortie de la boucle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    EndOfStream,
    Cancelled,
}

pub struct RetryCopyLoop {
    ctx: PipelineContext,
    floor: Duration,
    watchdog: Duration,
    metrics: Option<Arc<BandwidthMetrics>>,
}

impl RetryCopyLoop {
    /// `timeout` sert à la fois de plancher par itération et de fenêtre du chien de garde
    pub fn new(ctx: PipelineContext, timeout: Duration) -> Self {
        Self {
            ctx,
            floor: timeout,
            watchdog: timeout,
            metrics: None,
        }
    }

    pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<BandwidthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn run<R>(self, mut input: R, mut sink: OutputPipeline) -> Result<LoopExit>
    where
        R: AsyncRead + Unpin,
    {
        let cancel = self.ctx.token().clone();

        let exit = loop {
            if cancel.is_cancelled() {
                break LoopExit::Cancelled;
            }

            let floor = tokio::time::sleep(self.floor);
            tokio::pin!(floor);

            let outcome = copy_with_watchdog(&cancel, &mut input, &mut sink, self.watchdog).await;

            if outcome.bytes > 0 {
                if let Some(metrics) = &self.metrics {
                    metrics.record(outcome.bytes, outcome.elapsed);
                }
            }

            match &outcome.error {
                None => {
                    info!(bytes = outcome.bytes, elapsed = ?outcome.elapsed, "End of stream");
                    break LoopExit::EndOfStream;
                }
                Some(CopyError::Cancelled) => break LoopExit::Cancelled,
                Some(CopyError::Watchdog(_)) if outcome.bytes > 0 => {
                    debug!(bytes = outcome.bytes, elapsed = ?outcome.elapsed, "Copied");
                }
                // Aucun octet : la source est en reconnexion
                Some(CopyError::Watchdog(window)) => {
                    debug!(?window, "Waiting for source data");
                }
                Some(e) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_error();
                    }
                    warn!(bytes = outcome.bytes, elapsed = ?outcome.elapsed, "Copy failed: {}", e);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break LoopExit::Cancelled,
                _ = &mut floor => {}
            }
        };

        debug!(?exit, "Copy loop finished, closing output");
        sink.close().await?;
        if let Some(fatal) = self.ctx.take_fatal() {
            return Err(fatal);
        }
        Ok(exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputOptions;
    use std::io;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWrite, AsyncWriteExt};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl AsyncWrite for SharedBuffer {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_stream_exits_and_closes() {
        let ctx = PipelineContext::new();
        let out = SharedBuffer::default();
        let metrics = Arc::new(BandwidthMetrics::default());

        let (mut tx, rx) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            for chunk in [&b"one "[..], b"two ", b"three"] {
                tx.write_all(chunk).await.unwrap();
            }
            tx.shutdown().await.unwrap();
        });

        let exit = RetryCopyLoop::new(ctx, Duration::from_secs(1))
            .with_metrics(metrics.clone())
            .run(rx, OutputPipeline::direct(out.clone()))
            .await
            .unwrap();

        assert_eq!(exit, LoopExit::EndOfStream);
        assert_eq!(out.0.lock().unwrap().as_slice(), b"one two three");
        assert_eq!(metrics.snapshot().lifetime_bytes, 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalls_are_retried_until_cancelled() {
        let ctx = PipelineContext::new();
        let out = SharedBuffer::default();
        let metrics = Arc::new(BandwidthMetrics::default());

        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(b"early").await.unwrap();

        let handle = {
            let ctx = ctx.clone();
            let metrics = metrics.clone();
            let out = out.clone();
            tokio::spawn(async move {
                RetryCopyLoop::new(ctx, Duration::from_millis(500))
                    .with_metrics(metrics)
                    .run(rx, OutputPipeline::direct(out))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(2_200)).await;
        tx.write_all(b" late").await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        ctx.cancel();

        let exit = handle.await.unwrap().unwrap();
        assert_eq!(exit, LoopExit::Cancelled);
        assert_eq!(out.0.lock().unwrap().as_slice(), b"early late");

        let snap = metrics.snapshot();
        assert_eq!(snap.lifetime_bytes, 10);
        assert_eq!(snap.errors, 0, "idle waits are not errors");
        assert!(snap.iterations >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let ctx = PipelineContext::new();
        ctx.cancel();
        let (_tx, rx) = tokio::io::duplex(16);

        let exit = RetryCopyLoop::new(ctx, Duration::from_secs(1))
            .run(rx, OutputPipeline::direct(tokio::io::sink()))
            .await
            .unwrap();
        assert_eq!(exit, LoopExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_muxed_output_closed_on_exit() {
        let ctx = PipelineContext::new();
        let out = SharedBuffer::default();
        let pipeline = OutputPipeline::muxed(out.clone(), &ctx, &OutputOptions::default()).unwrap();
        let (tx, rx) = tokio::io::duplex(16);
        drop(tx);

        let exit = RetryCopyLoop::new(ctx.clone(), Duration::from_secs(1))
            .run(rx, pipeline)
            .await
            .unwrap();
        assert_eq!(exit, LoopExit::EndOfStream);
        assert!(out.0.lock().unwrap().is_empty(), "no payload, no transport packets");
        assert!(!ctx.has_failed());
    }
}
