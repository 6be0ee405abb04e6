//! Boucle de reconnexion à la source
//!
//! [`SourceReader`] possède la connexion amont : ouverture, copie bornée par
//! le chien de garde vers le tampon de transfert, fermeture, puis réouverture
//! après un délai plancher `T` mesuré depuis le début de la tentative. Deux
//! tentatives successives sont donc toujours espacées d'au moins `T`, même
//! quand l'ouverture échoue immédiatement.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::copy::copy_with_watchdog;
use crate::icy::{log_icy_headers, ServiceMetadata};
use crate::source::Source;
use crate::{CopyError, PipelineContext};

/// Appelé à chaque (ré)ouverture, avant le premier octet de la connexion
pub type DiscontinuityNotifier = Arc<dyn Fn() + Send + Sync>;

/// Reçoit les métadonnées de service, une seule fois
pub type MetadataHandler = Arc<dyn Fn(ServiceMetadata) + Send + Sync>;

pub fn noop_notifier() -> DiscontinuityNotifier {
    Arc::new(|| {})
}

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Plancher entre deux tentatives, et fenêtre du chien de garde
    pub timeout: Duration,
    /// Rouvrir aussi après une fin de flux propre
    pub restart_on_eof: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            restart_on_eof: false,
        }
    }
}

/// Compteurs de fin de boucle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaderStats {
    pub attempts: u64,
    pub opens: u64,
    pub failures: u64,
    pub bytes: u64,
}

pub struct SourceReader {
    source: Arc<dyn Source>,
    address: String,
    options: ReaderOptions,
    notifier: DiscontinuityNotifier,
    on_metadata: Option<MetadataHandler>,
}

impl SourceReader {
    pub fn new(source: Arc<dyn Source>, address: impl Into<String>, options: ReaderOptions) -> Self {
        Self {
            source,
            address: address.into(),
            options,
            notifier: noop_notifier(),
            on_metadata: None,
        }
    }

    pub fn with_discontinuity_notifier(mut self, notifier: DiscontinuityNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_metadata_handler(mut self, handler: MetadataHandler) -> Self {
        self.on_metadata = Some(handler);
        self
    }

    /// Lance la boucle dans sa propre tâche ; retourne l'extrémité lecture du tampon
    pub fn spawn(self, ctx: PipelineContext, capacity: usize) -> (DuplexStream, JoinHandle<ReaderStats>) {
        let (writer, reader) = tokio::io::duplex(capacity);
        let handle = tokio::spawn(self.run(ctx, writer));
        (reader, handle)
    }

    /// Boucle principale ; ferme `out` en sortie pour signaler la fin de flux
    pub async fn run<W>(self, ctx: PipelineContext, mut out: W) -> ReaderStats
    where
        W: AsyncWrite + Unpin,
    {
        let cancel = ctx.token().clone();
        let timeout = self.options.timeout;
        let mut stats = ReaderStats::default();
        let mut metadata_done = self.on_metadata.is_none();

        info!("Reading from {}", self.address);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let floor = tokio::time::sleep(timeout);
            tokio::pin!(floor);
            stats.attempts += 1;

            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.source.open(&self.address) => r,
            };

            match opened {
                Err(e) => {
                    stats.failures += 1;
                    error!(attempt = stats.attempts, "Failed to open {}: {}", self.address, e);
                }
                Ok(mut stream) => {
                    stats.opens += 1;
                    if let Some(name) = stream.name.as_deref() {
                        debug!("Catting {}", name);
                    }
                    if let Some(headers) = stream.headers.as_ref() {
                        log_icy_headers(headers);
                        if !metadata_done {
                            metadata_done = true;
                            if let (Some(meta), Some(handler)) = (
                                ServiceMetadata::from_headers(headers, &self.address),
                                self.on_metadata.as_ref(),
                            ) {
                                handler(meta);
                            }
                        }
                    }

                    (self.notifier)();

                    let outcome =
                        copy_with_watchdog(&cancel, &mut stream.reader, &mut out, timeout).await;
                    stats.bytes += outcome.bytes;
                    drop(stream);

                    match outcome.error {
                        None => {
                            info!(bytes = outcome.bytes, elapsed = ?outcome.elapsed, "Source reached end of stream");
                            if !self.options.restart_on_eof {
                                break;
                            }
                        }
                        Some(CopyError::Cancelled) => break,
                        Some(CopyError::Write(e)) => {
                            debug!("Downstream closed, stopping source reader: {}", e);
                            break;
                        }
                        Some(e) => {
                            warn!(bytes = outcome.bytes, elapsed = ?outcome.elapsed, "Source copy interrupted: {}", e);
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut floor => {}
            }
        }

        if let Err(e) = out.shutdown().await {
            debug!("Closing handoff failed: {}", e);
        }
        debug!(?stats, "Source reader stopped");
        stats
    }
}
