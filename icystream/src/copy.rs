//! Copie bornée par un chien de garde
//!
//! Chaque lecture et chaque écriture doit progresser dans la fenêtre `watchdog`,
//! sinon la copie s'interrompt avec [`CopyError::Watchdog`]. L'annulation du
//! token interrompt aussi bien une lecture qu'une écriture bloquée.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::CopyError;

/// Taille du tampon de copie
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Bilan d'une copie : octets transférés, durée, cause de l'arrêt
#[derive(Debug)]
pub struct CopyOutcome {
    pub bytes: u64,
    pub elapsed: Duration,
    /// `None` : fin de flux propre
    pub error: Option<CopyError>,
}

impl CopyOutcome {
    pub fn is_end_of_stream(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(CopyError::Cancelled))
    }
}

/// Copie `reader` vers `writer` jusqu'à la fin de flux, une erreur, un blocage
/// plus long que `watchdog`, ou l'annulation.
pub async fn copy_with_watchdog<R, W>(
    cancel: &CancellationToken,
    reader: &mut R,
    writer: &mut W,
    watchdog: Duration,
) -> CopyOutcome
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let start = Instant::now();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let error = loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Some(CopyError::Cancelled),
            r = timeout(watchdog, reader.read(&mut buf)) => r,
        };
        let n = match read {
            Err(_) => break Some(CopyError::Watchdog(watchdog)),
            Ok(Err(e)) => break Some(CopyError::Read(e)),
            Ok(Ok(0)) => break None,
            Ok(Ok(n)) => n,
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Some(CopyError::Cancelled),
            w = timeout(watchdog, writer.write_all(&buf[..n])) => w,
        };
        match written {
            Err(_) => break Some(CopyError::Watchdog(watchdog)),
            Ok(Err(e)) => break Some(CopyError::Write(e)),
            Ok(Ok(())) => bytes += n as u64,
        }
    };

    let error = match error {
        None => match timeout(watchdog, writer.flush()).await {
            Err(_) => Some(CopyError::Watchdog(watchdog)),
            Ok(Err(e)) => Some(CopyError::Write(e)),
            Ok(Ok(())) => None,
        },
        other => other,
    };

    CopyOutcome {
        bytes,
        elapsed: start.elapsed(),
        error,
    }
}
